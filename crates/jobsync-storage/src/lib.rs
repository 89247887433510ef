//! SQLite-backed local store + HTTP fetch utility for jobsync.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobsync_core::{
    Industry, Job, JobFilter, JobListing, Location, NewIndustry, NewJob, NewLocation,
};
use reqwest::StatusCode;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "jobsync-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("{entity} {id} is referenced by {jobs} job(s)")]
    Referenced {
        entity: &'static str,
        id: i64,
        jobs: i64,
    },
    #[error("another {entity} already has this {field}")]
    Duplicate {
        entity: &'static str,
        field: &'static str,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the local relational store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the SQLite file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn open_and_migrate(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self::open(path).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a unit of work. Dropping it without [`UnitOfWork::commit`] rolls back.
    pub async fn begin(&self) -> Result<UnitOfWork, StoreError> {
        Ok(UnitOfWork {
            tx: self.pool.begin().await?,
        })
    }
}

/// One transaction over the three cached collections.
#[derive(Debug)]
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
}

impl UnitOfWork {
    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }

    // ---- locations ----

    pub async fn count_locations(&mut self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM locations")
            .fetch_one(&mut *self.tx)
            .await?)
    }

    pub async fn location_geo_id_exists(&mut self, geo_id: i64) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM locations WHERE geo_id = ? LIMIT 1")
            .bind(geo_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(found.is_some())
    }

    pub async fn find_location_by_name(&mut self, name: &str) -> Result<Option<Location>, StoreError> {
        let row = sqlx::query(
            "SELECT id, geo_id, name, slug FROM locations WHERE name = ? ORDER BY id LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.as_ref().map(location_from_row).transpose()?)
    }

    pub async fn find_location_by_slug(&mut self, slug: &str) -> Result<Option<Location>, StoreError> {
        let row = sqlx::query(
            "SELECT id, geo_id, name, slug FROM locations WHERE slug = ? ORDER BY id LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.as_ref().map(location_from_row).transpose()?)
    }

    pub async fn get_location(&mut self, id: i64) -> Result<Location, StoreError> {
        let row = sqlx::query("SELECT id, geo_id, name, slug FROM locations WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "location",
                id,
            })?;
        Ok(location_from_row(&row)?)
    }

    pub async fn list_locations(&mut self) -> Result<Vec<Location>, StoreError> {
        let rows = sqlx::query("SELECT id, geo_id, name, slug FROM locations ORDER BY id")
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.iter().map(location_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn insert_location(&mut self, location: &NewLocation) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO locations (geo_id, name, slug) VALUES (?, ?, ?)")
            .bind(location.geo_id)
            .bind(&location.name)
            .bind(&location.slug)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| unique_violation(e, "location", "geo ID"))?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_location(&mut self, id: i64, location: &NewLocation) -> Result<Location, StoreError> {
        let result = sqlx::query("UPDATE locations SET geo_id = ?, name = ?, slug = ? WHERE id = ?")
            .bind(location.geo_id)
            .bind(&location.name)
            .bind(&location.slug)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| unique_violation(e, "location", "geo ID"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "location",
                id,
            });
        }
        self.get_location(id).await
    }

    /// Rejects the delete while any job still references the location.
    pub async fn delete_location(&mut self, id: i64) -> Result<(), StoreError> {
        self.get_location(id).await?;
        let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE location_id = ?")
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await?;
        if jobs > 0 {
            return Err(StoreError::Referenced {
                entity: "location",
                id,
                jobs,
            });
        }
        sqlx::query("DELETE FROM locations WHERE id = ?")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    // ---- industries ----

    pub async fn count_industries(&mut self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM industries")
            .fetch_one(&mut *self.tx)
            .await?)
    }

    pub async fn industry_slug_exists(&mut self, slug: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM industries WHERE slug = ? LIMIT 1")
            .bind(slug)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(found.is_some())
    }

    pub async fn find_industry_by_name(&mut self, name: &str) -> Result<Option<Industry>, StoreError> {
        let row = sqlx::query(
            "SELECT id, industry_id, name, slug FROM industries WHERE name = ? ORDER BY id LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.as_ref().map(industry_from_row).transpose()?)
    }

    pub async fn find_industry_by_slug(&mut self, slug: &str) -> Result<Option<Industry>, StoreError> {
        let row = sqlx::query(
            "SELECT id, industry_id, name, slug FROM industries WHERE slug = ? ORDER BY id LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.as_ref().map(industry_from_row).transpose()?)
    }

    pub async fn get_industry(&mut self, id: i64) -> Result<Industry, StoreError> {
        let row = sqlx::query("SELECT id, industry_id, name, slug FROM industries WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "industry",
                id,
            })?;
        Ok(industry_from_row(&row)?)
    }

    pub async fn list_industries(&mut self) -> Result<Vec<Industry>, StoreError> {
        let rows = sqlx::query("SELECT id, industry_id, name, slug FROM industries ORDER BY id")
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.iter().map(industry_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn insert_industry(&mut self, industry: &NewIndustry) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO industries (industry_id, name, slug) VALUES (?, ?, ?)")
            .bind(industry.industry_id)
            .bind(&industry.name)
            .bind(&industry.slug)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_industry(&mut self, id: i64, industry: &NewIndustry) -> Result<Industry, StoreError> {
        let result = sqlx::query("UPDATE industries SET industry_id = ?, name = ?, slug = ? WHERE id = ?")
            .bind(industry.industry_id)
            .bind(&industry.name)
            .bind(&industry.slug)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "industry",
                id,
            });
        }
        self.get_industry(id).await
    }

    pub async fn delete_industry(&mut self, id: i64) -> Result<(), StoreError> {
        self.get_industry(id).await?;
        let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE industry_id = ?")
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await?;
        if jobs > 0 {
            return Err(StoreError::Referenced {
                entity: "industry",
                id,
                jobs,
            });
        }
        sqlx::query("DELETE FROM industries WHERE id = ?")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    // ---- jobs ----

    pub async fn count_jobs(&mut self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&mut *self.tx)
            .await?)
    }

    pub async fn job_exists(&mut self, title: &str, link: &str) -> Result<bool, StoreError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT id FROM jobs WHERE title = ? AND link = ? LIMIT 1")
                .bind(title)
                .bind(link)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(found.is_some())
    }

    pub async fn insert_job(&mut self, job: &NewJob) -> Result<i64, StoreError> {
        let created_at: DateTime<Utc> = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (title, description, link, image_url, job_type, company,
                              location_id, industry_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.title)
        .bind(&job.description)
        .bind(&job.link)
        .bind(&job.image_url)
        .bind(&job.job_type)
        .bind(&job.company)
        .bind(job.location_id)
        .bind(job.industry_id)
        .bind(created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_job(&mut self, id: i64) -> Result<JobListing, StoreError> {
        let mut qb = job_listing_query();
        qb.push(" AND j.id = ").push_bind(id);
        let row = qb
            .build()
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        Ok(job_listing_from_row(&row)?)
    }

    /// Newest first. Parent filters run in SQL; the text filter is applied to
    /// the joined rows so it matches literally with Unicode case folding.
    pub async fn list_jobs(&mut self, filter: &JobFilter) -> Result<Vec<JobListing>, StoreError> {
        let mut qb = job_listing_query();
        if let Some(location_id) = filter.location_id {
            qb.push(" AND j.location_id = ").push_bind(location_id);
        }
        if let Some(industry_id) = filter.industry_id {
            qb.push(" AND j.industry_id = ").push_bind(industry_id);
        }
        qb.push(" ORDER BY j.id DESC");
        let rows = qb.build().fetch_all(&mut *self.tx).await?;
        let mut listings = Vec::with_capacity(rows.len());
        for row in &rows {
            let listing = job_listing_from_row(row)?;
            if filter.matches_text(&listing.job.title, listing.job.company.as_deref()) {
                listings.push(listing);
            }
        }
        Ok(listings)
    }

    pub async fn delete_job(&mut self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "job", id });
        }
        Ok(())
    }
}

fn unique_violation(err: sqlx::Error, entity: &'static str, field: &'static str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate { entity, field },
        _ => StoreError::Database(err),
    }
}

fn location_from_row(row: &SqliteRow) -> Result<Location, sqlx::Error> {
    Ok(Location {
        id: row.try_get("id")?,
        geo_id: row.try_get("geo_id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
    })
}

fn industry_from_row(row: &SqliteRow) -> Result<Industry, sqlx::Error> {
    Ok(Industry {
        id: row.try_get("id")?,
        industry_id: row.try_get("industry_id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
    })
}

fn job_listing_query() -> QueryBuilder<'static, Sqlite> {
    QueryBuilder::new(
        r#"
        SELECT j.id, j.title, j.description, j.link, j.image_url, j.job_type, j.company,
               j.location_id, j.industry_id, j.created_at,
               l.name AS location_name,
               i.name AS industry_name
          FROM jobs j
          LEFT JOIN locations l ON l.id = j.location_id
          LEFT JOIN industries i ON i.id = j.industry_id
         WHERE 1 = 1
        "#,
    )
}

fn job_listing_from_row(row: &SqliteRow) -> Result<JobListing, sqlx::Error> {
    Ok(JobListing {
        job: Job {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            link: row.try_get("link")?,
            image_url: row.try_get("image_url")?,
            job_type: row.try_get("job_type")?,
            company: row.try_get("company")?,
            location_id: row.try_get("location_id")?,
            industry_id: row.try_get("industry_id")?,
            created_at: row.try_get("created_at")?,
        },
        location_name: row.try_get("location_name")?,
        industry_name: row.try_get("industry_name")?,
    })
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` leaves requests unbounded.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

/// Single-attempt HTTP GET client shared by the remote sources.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
