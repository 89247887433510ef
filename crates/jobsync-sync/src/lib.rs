//! Reconciles the local cache against the remote source.
//!
//! Every pass runs inside one [`UnitOfWork`]: nothing is written unless the
//! whole pass succeeds.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobsync_adapters::{AdapterError, Endpoints, FixtureSource, JobicySource, RemoteSource};
use jobsync_core::{FeedItem, IndustryRecord, LocationRecord, NewIndustry, NewJob, NewLocation};
use jobsync_storage::{HttpClientConfig, HttpFetcher, Store, StoreError, UnitOfWork};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub user_agent: String,
    /// `None` leaves remote requests unbounded.
    pub http_timeout_secs: Option<u64>,
    pub sources_file: PathBuf,
    /// When set, the remote source is replaced by canned files from this directory.
    pub fixtures_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("JOBSYNC_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./jobs.db")),
            user_agent: std::env::var("JOBSYNC_USER_AGENT")
                .unwrap_or_else(|_| "jobsync/0.1".to_string()),
            http_timeout_secs: std::env::var("JOBSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            sources_file: std::env::var("JOBSYNC_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            fixtures_dir: std::env::var("JOBSYNC_FIXTURES_DIR").ok().map(PathBuf::from),
        }
    }
}

/// Shape of `sources.yaml`. Every field is optional; absent ones keep the
/// built-in Jobicy endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesFile {
    #[serde(default)]
    pub endpoints: EndpointOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointOverrides {
    pub locations_url: Option<String>,
    pub industries_url: Option<String>,
    pub jobs_url: Option<String>,
    pub feed_url: Option<String>,
}

impl EndpointOverrides {
    pub fn apply(self, base: Endpoints) -> Endpoints {
        Endpoints {
            locations_url: self.locations_url.unwrap_or(base.locations_url),
            industries_url: self.industries_url.unwrap_or(base.industries_url),
            jobs_url: self.jobs_url.unwrap_or(base.jobs_url),
            feed_url: self.feed_url.unwrap_or(base.feed_url),
        }
    }
}

/// Endpoints from `path`, or the defaults when the file does not exist.
pub fn load_endpoints(path: &Path) -> Result<Endpoints> {
    if !path.exists() {
        return Ok(Endpoints::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: SourcesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.endpoints.apply(Endpoints::default()))
}

pub fn build_remote_source(config: &SyncConfig) -> Result<Arc<dyn RemoteSource>> {
    if let Some(dir) = &config.fixtures_dir {
        info!(dir = %dir.display(), "using fixture source");
        return Ok(Arc::new(FixtureSource::new(dir.clone())?));
    }
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout_secs.map(Duration::from_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let endpoints = load_endpoints(&config.sources_file)?;
    Ok(Arc::new(JobicySource::new(http, endpoints)))
}

pub async fn open_store(config: &SyncConfig) -> Result<Store> {
    Store::open_and_migrate(&config.database_path)
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PopulateOutcome {
    Populated { inserted: usize, skipped: usize },
    AlreadyPopulated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedMergeCounts {
    pub jobs_inserted: usize,
    pub jobs_skipped: usize,
    pub locations_created: usize,
    pub industries_created: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedSyncReport {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_items: usize,
    pub counts: FeedMergeCounts,
}

/// Inserts location records keyed by geo ID into an empty collection.
///
/// A non-empty collection yields `AlreadyPopulated` without touching it.
/// Records whose geo ID is already stored, including earlier records of the
/// same batch, are skipped.
pub async fn populate_locations_in(
    uow: &mut UnitOfWork,
    records: &[LocationRecord],
) -> Result<PopulateOutcome, StoreError> {
    if uow.count_locations().await? > 0 {
        return Ok(PopulateOutcome::AlreadyPopulated);
    }
    let mut inserted = 0;
    let mut skipped = 0;
    for record in records {
        if uow.location_geo_id_exists(record.geo_id).await? {
            skipped += 1;
            continue;
        }
        uow.insert_location(&NewLocation::from(record)).await?;
        inserted += 1;
    }
    Ok(PopulateOutcome::Populated { inserted, skipped })
}

/// Inserts the whole industry batch unless its first record's slug is
/// already stored, in which case nothing is inserted. Later records are not
/// checked, so the outcome depends on batch order.
pub async fn populate_industries_in(
    uow: &mut UnitOfWork,
    records: &[IndustryRecord],
) -> Result<PopulateOutcome, StoreError> {
    let Some(first) = records.first() else {
        return Ok(PopulateOutcome::Populated {
            inserted: 0,
            skipped: 0,
        });
    };
    if uow.industry_slug_exists(&first.industry_slug).await? {
        return Ok(PopulateOutcome::AlreadyPopulated);
    }
    for record in records {
        uow.insert_industry(&NewIndustry::from(record)).await?;
    }
    Ok(PopulateOutcome::Populated {
        inserted: records.len(),
        skipped: 0,
    })
}

/// Merges feed items into the store.
///
/// Items whose (title, link) already exists are skipped. Parents are matched
/// by exact display name and created without external identity when absent;
/// the company name stands in for the industry.
pub async fn merge_feed_items(
    uow: &mut UnitOfWork,
    items: &[FeedItem],
) -> Result<FeedMergeCounts, StoreError> {
    let mut counts = FeedMergeCounts::default();
    for item in items {
        if uow.job_exists(&item.title, &item.link).await? {
            counts.jobs_skipped += 1;
            continue;
        }

        let location_id = match item.location.as_deref() {
            Some(name) => Some(match uow.find_location_by_name(name).await? {
                Some(location) => location.id,
                None => {
                    let id = uow.insert_location(&NewLocation::from_feed_name(name)).await?;
                    debug!(location_id = id, name, "created location from feed");
                    counts.locations_created += 1;
                    id
                }
            }),
            None => None,
        };

        let industry_id = match item.company.as_deref() {
            Some(company) => Some(match uow.find_industry_by_name(company).await? {
                Some(industry) => industry.id,
                None => {
                    let id = uow
                        .insert_industry(&NewIndustry::from_feed_company(company))
                        .await?;
                    debug!(industry_id = id, name = company, "created industry from feed");
                    counts.industries_created += 1;
                    id
                }
            }),
            None => None,
        };

        uow.insert_job(&NewJob::from_feed_item(item, location_id, industry_id))
            .await?;
        counts.jobs_inserted += 1;
    }
    Ok(counts)
}

/// Drives the three sync operations against one store and one remote source.
#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    remote: Arc<dyn RemoteSource>,
}

impl Reconciler {
    pub fn new(store: Store, remote: Arc<dyn RemoteSource>) -> Self {
        Self { store, remote }
    }

    /// Opens (and migrates) the configured store and picks the remote source.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = open_store(config).await?;
        let remote = build_remote_source(config)?;
        Ok(Self::new(store, remote))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteSource> {
        &self.remote
    }

    pub async fn populate_locations_if_empty(&self) -> Result<PopulateOutcome, SyncError> {
        let span = info_span!("populate", collection = "locations", source_id = self.remote.source_id());
        async move {
            // Skip the remote call entirely when there is nothing to do.
            if self.store.begin().await?.count_locations().await? > 0 {
                info!("locations already populated");
                return Ok(PopulateOutcome::AlreadyPopulated);
            }
            let records = self.remote.fetch_locations().await?;
            let mut uow = self.store.begin().await?;
            let outcome = populate_locations_in(&mut uow, &records).await?;
            uow.commit().await?;
            info!(fetched = records.len(), ?outcome, "locations populate finished");
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    pub async fn populate_industries_if_empty(&self) -> Result<PopulateOutcome, SyncError> {
        let span = info_span!("populate", collection = "industries", source_id = self.remote.source_id());
        async move {
            let records = self.remote.fetch_industries().await?;
            let mut uow = self.store.begin().await?;
            let outcome = populate_industries_in(&mut uow, &records).await?;
            uow.commit().await?;
            info!(fetched = records.len(), ?outcome, "industries populate finished");
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    pub async fn sync_feed_jobs(&self) -> Result<FeedSyncReport, SyncError> {
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_pass", %pass_id, source_id = self.remote.source_id());
        async move {
            let items = self.remote.fetch_job_feed().await?;
            let mut uow = self.store.begin().await?;
            let counts = merge_feed_items(&mut uow, &items).await?;
            uow.commit().await?;

            let report = FeedSyncReport {
                pass_id,
                started_at,
                finished_at: Utc::now(),
                feed_items: items.len(),
                counts,
            };
            info!(
                feed_items = report.feed_items,
                jobs_inserted = counts.jobs_inserted,
                jobs_skipped = counts.jobs_skipped,
                locations_created = counts.locations_created,
                industries_created = counts.industries_created,
                "feed sync finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobsync_core::{JobFilter, JobSearchQuery, RemoteJob};
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct StubSource {
        locations: Vec<LocationRecord>,
        industries: Vec<IndustryRecord>,
        feed: Vec<FeedItem>,
        unavailable: bool,
    }

    impl StubSource {
        fn check(&self) -> Result<(), AdapterError> {
            if self.unavailable {
                return Err(AdapterError::RemoteUnavailable {
                    url: "stub://".into(),
                    reason: "connection refused".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteSource for StubSource {
        fn source_id(&self) -> &'static str {
            "stub"
        }

        async fn fetch_locations(&self) -> Result<Vec<LocationRecord>, AdapterError> {
            self.check()?;
            Ok(self.locations.clone())
        }

        async fn fetch_industries(&self) -> Result<Vec<IndustryRecord>, AdapterError> {
            self.check()?;
            Ok(self.industries.clone())
        }

        async fn fetch_job_feed(&self) -> Result<Vec<FeedItem>, AdapterError> {
            self.check()?;
            Ok(self.feed.clone())
        }

        fn search_url(&self, _query: &JobSearchQuery) -> String {
            "stub://jobs".into()
        }

        async fn search_jobs(&self, _query: &JobSearchQuery) -> Result<Vec<RemoteJob>, AdapterError> {
            self.check()?;
            Ok(Vec::new())
        }
    }

    async fn reconciler(source: StubSource) -> (TempDir, Reconciler) {
        let dir = tempdir().expect("tempdir");
        let store = Store::open_and_migrate(dir.path().join("jobs.db"))
            .await
            .expect("open store");
        (dir, Reconciler::new(store, Arc::new(source)))
    }

    fn location(geo_id: i64, name: &str) -> LocationRecord {
        LocationRecord {
            geo_id,
            geo_name: name.to_string(),
            geo_slug: name.to_lowercase(),
        }
    }

    fn industry(id: i64, slug: &str) -> IndustryRecord {
        IndustryRecord {
            industry_id: id,
            industry_name: slug.to_uppercase(),
            industry_slug: slug.to_string(),
        }
    }

    fn feed_item(title: &str, link: &str, location: Option<&str>, company: Option<&str>) -> FeedItem {
        FeedItem {
            title: title.to_string(),
            link: link.to_string(),
            description: None,
            location: location.map(str::to_string),
            job_type: None,
            company: company.map(str::to_string),
            image_url: None,
        }
    }

    #[tokio::test]
    async fn locations_populate_once() {
        let (_dir, rec) = reconciler(StubSource {
            locations: vec![location(1, "Anywhere"), location(2, "Europe"), location(1, "Anywhere")],
            ..Default::default()
        })
        .await;

        assert_eq!(
            rec.populate_locations_if_empty().await.unwrap(),
            PopulateOutcome::Populated {
                inserted: 2,
                skipped: 1
            }
        );
        assert_eq!(
            rec.populate_locations_if_empty().await.unwrap(),
            PopulateOutcome::AlreadyPopulated
        );
        let mut uow = rec.store().begin().await.unwrap();
        assert_eq!(uow.count_locations().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn industries_skip_whole_batch_when_first_slug_is_known() {
        let (_dir, rec) = reconciler(StubSource {
            industries: vec![industry(1, "dev"), industry(2, "design")],
            ..Default::default()
        })
        .await;
        assert_eq!(
            rec.populate_industries_if_empty().await.unwrap(),
            PopulateOutcome::Populated {
                inserted: 2,
                skipped: 0
            }
        );
        assert_eq!(
            rec.populate_industries_if_empty().await.unwrap(),
            PopulateOutcome::AlreadyPopulated
        );

        let mut uow = rec.store().begin().await.unwrap();
        // first record known: the new "copywriting" entry is ignored too
        let outcome = populate_industries_in(&mut uow, &[industry(1, "dev"), industry(3, "copywriting")])
            .await
            .unwrap();
        assert_eq!(outcome, PopulateOutcome::AlreadyPopulated);
        assert_eq!(uow.count_industries().await.unwrap(), 2);

        // first record unknown: the whole batch goes in, known slugs included
        let outcome = populate_industries_in(&mut uow, &[industry(3, "copywriting"), industry(1, "dev")])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PopulateOutcome::Populated {
                inserted: 2,
                skipped: 0
            }
        );
        assert_eq!(uow.count_industries().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn empty_industry_batch_inserts_nothing() {
        let (_dir, rec) = reconciler(StubSource::default()).await;
        assert_eq!(
            rec.populate_industries_if_empty().await.unwrap(),
            PopulateOutcome::Populated {
                inserted: 0,
                skipped: 0
            }
        );
    }

    #[tokio::test]
    async fn feed_item_into_empty_store_creates_parents_and_job() {
        let (_dir, rec) = reconciler(StubSource {
            feed: vec![feed_item("Engineer", "http://x/1", Some("Remote"), Some("Acme"))],
            ..Default::default()
        })
        .await;

        let report = rec.sync_feed_jobs().await.unwrap();
        assert_eq!(report.feed_items, 1);
        assert_eq!(
            report.counts,
            FeedMergeCounts {
                jobs_inserted: 1,
                jobs_skipped: 0,
                locations_created: 1,
                industries_created: 1,
            }
        );

        let mut uow = rec.store().begin().await.unwrap();
        let locations = uow.list_locations().await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].name, "Remote");
        assert_eq!(locations[0].geo_id, None);
        let industries = uow.list_industries().await.unwrap();
        assert_eq!(industries.len(), 1);
        assert_eq!(industries[0].name, "Acme");

        let jobs = uow.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.title, "Engineer");
        assert_eq!(jobs[0].job.location_id, Some(locations[0].id));
        assert_eq!(jobs[0].job.industry_id, Some(industries[0].id));
    }

    #[tokio::test]
    async fn second_pass_over_unchanged_feed_adds_nothing() {
        let (_dir, rec) = reconciler(StubSource {
            feed: vec![
                feed_item("Engineer", "http://x/1", Some("Remote"), Some("Acme")),
                feed_item("Designer", "http://x/2", Some("Remote"), Some("Acme")),
                // repeated within the same pass
                feed_item("Engineer", "http://x/1", Some("Remote"), Some("Acme")),
            ],
            ..Default::default()
        })
        .await;

        let first = rec.sync_feed_jobs().await.unwrap();
        assert_eq!(first.counts.jobs_inserted, 2);
        assert_eq!(first.counts.jobs_skipped, 1);
        assert_eq!(first.counts.locations_created, 1);

        let second = rec.sync_feed_jobs().await.unwrap();
        assert_ne!(first.pass_id, second.pass_id);
        assert_eq!(second.counts.jobs_inserted, 0);
        assert_eq!(second.counts.jobs_skipped, 3);
        assert_eq!(second.counts.locations_created, 0);

        let mut uow = rec.store().begin().await.unwrap();
        assert_eq!(uow.count_jobs().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn feed_reuses_populated_location_by_name() {
        let (_dir, rec) = reconciler(StubSource {
            locations: vec![location(2, "Europe")],
            feed: vec![
                feed_item("Engineer", "http://x/1", Some("Europe"), None),
                feed_item("Writer", "http://x/2", None, Some("Docs Inc")),
            ],
            ..Default::default()
        })
        .await;
        rec.populate_locations_if_empty().await.unwrap();

        let report = rec.sync_feed_jobs().await.unwrap();
        assert_eq!(report.counts.locations_created, 0);
        assert_eq!(report.counts.industries_created, 1);

        let mut uow = rec.store().begin().await.unwrap();
        assert_eq!(uow.count_locations().await.unwrap(), 1);
        let jobs = uow.list_jobs(&JobFilter::default()).await.unwrap();
        let writer = jobs.iter().find(|j| j.job.title == "Writer").unwrap();
        assert_eq!(writer.job.location_id, None);
        let engineer = jobs.iter().find(|j| j.job.title == "Engineer").unwrap();
        assert_eq!(engineer.location_name.as_deref(), Some("Europe"));
        assert_eq!(engineer.job.industry_id, None);
    }

    #[tokio::test]
    async fn unavailable_remote_leaves_store_unchanged() {
        let (_dir, rec) = reconciler(StubSource {
            unavailable: true,
            ..Default::default()
        })
        .await;

        assert!(matches!(
            rec.populate_locations_if_empty().await,
            Err(SyncError::Remote(AdapterError::RemoteUnavailable { .. }))
        ));
        assert!(matches!(rec.sync_feed_jobs().await, Err(SyncError::Remote(_))));

        let mut uow = rec.store().begin().await.unwrap();
        assert_eq!(uow.count_locations().await.unwrap(), 0);
        assert_eq!(uow.count_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn uncommitted_merge_is_rolled_back() {
        let (_dir, rec) = reconciler(StubSource::default()).await;
        {
            let mut uow = rec.store().begin().await.unwrap();
            let counts = merge_feed_items(&mut uow, &[feed_item("Engineer", "http://x/1", Some("Remote"), Some("Acme"))])
                .await
                .unwrap();
            assert_eq!(counts.jobs_inserted, 1);
        }
        let mut uow = rec.store().begin().await.unwrap();
        assert_eq!(uow.count_jobs().await.unwrap(), 0);
        assert_eq!(uow.count_locations().await.unwrap(), 0);
        assert_eq!(uow.count_industries().await.unwrap(), 0);
    }

    #[test]
    fn sources_file_overrides_only_named_endpoints() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(&path, "endpoints:\n  feed_url: http://mirror.local/feed\n").unwrap();

        let endpoints = load_endpoints(&path).unwrap();
        assert_eq!(endpoints.feed_url, "http://mirror.local/feed");
        assert_eq!(endpoints.locations_url, Endpoints::default().locations_url);

        let missing = load_endpoints(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(missing, Endpoints::default());
    }

    #[tokio::test]
    async fn fixture_directory_selects_fixture_source() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let config = SyncConfig {
            database_path: PathBuf::from("unused.db"),
            user_agent: "test".into(),
            http_timeout_secs: None,
            sources_file: PathBuf::from("absent.yaml"),
            fixtures_dir: Some(root.join("fixtures/jobicy")),
        };
        let source = build_remote_source(&config).unwrap();
        assert_eq!(source.source_id(), "fixture");
        assert_eq!(source.fetch_locations().await.unwrap().len(), 4);
    }
}
