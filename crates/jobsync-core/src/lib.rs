//! Core domain model for jobsync: cached entities, wire records and the
//! mapping functions between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobsync-core";

/// Remote search page sizes offered by the jobs endpoint.
pub const MIN_SEARCH_COUNT: u32 = 1;
pub const MAX_SEARCH_COUNT: u32 = 50;
pub const DEFAULT_SEARCH_COUNT: u32 = 10;

/// Cached geographic region tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: i64,
    /// External geo ID; absent for rows created from the job feed.
    pub geo_id: Option<i64>,
    pub name: String,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLocation {
    pub geo_id: Option<i64>,
    pub name: String,
    pub slug: Option<String>,
}

impl NewLocation {
    /// Feed items only carry a display name.
    pub fn from_feed_name(name: &str) -> Self {
        Self {
            geo_id: None,
            name: name.to_string(),
            slug: None,
        }
    }
}

impl From<&LocationRecord> for NewLocation {
    fn from(record: &LocationRecord) -> Self {
        Self {
            geo_id: Some(record.geo_id),
            name: record.geo_name.clone(),
            slug: Some(record.geo_slug.clone()),
        }
    }
}

/// Cached industry taxonomy entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Industry {
    pub id: i64,
    pub industry_id: Option<i64>,
    pub name: String,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIndustry {
    pub industry_id: Option<i64>,
    pub name: String,
    pub slug: Option<String>,
}

impl NewIndustry {
    /// The job feed has no industry field, so the company name stands in for it.
    pub fn from_feed_company(company: &str) -> Self {
        Self {
            industry_id: None,
            name: company.to_string(),
            slug: None,
        }
    }
}

impl From<&IndustryRecord> for NewIndustry {
    fn from(record: &IndustryRecord) -> Self {
        Self {
            industry_id: Some(record.industry_id),
            name: record.industry_name.clone(),
            slug: Some(record.industry_slug.clone()),
        }
    }
}

/// Cached job listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub link: String,
    pub image_url: Option<String>,
    pub job_type: Option<String>,
    pub company: Option<String>,
    pub location_id: Option<i64>,
    pub industry_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub title: String,
    pub description: Option<String>,
    pub link: String,
    pub image_url: Option<String>,
    pub job_type: Option<String>,
    pub company: Option<String>,
    pub location_id: Option<i64>,
    pub industry_id: Option<i64>,
}

impl NewJob {
    pub fn from_feed_item(item: &FeedItem, location_id: Option<i64>, industry_id: Option<i64>) -> Self {
        Self {
            title: item.title.clone(),
            description: item.description.clone(),
            link: item.link.clone(),
            image_url: item.image_url.clone(),
            job_type: item.job_type.clone(),
            company: item.company.clone(),
            location_id,
            industry_id,
        }
    }
}

/// Job joined with the display names of its parents, for list views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListing {
    pub job: Job,
    pub location_name: Option<String>,
    pub industry_name: Option<String>,
}

/// Filter applied to the cached job list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub location_id: Option<i64>,
    pub industry_id: Option<i64>,
    /// Case-insensitive substring matched against title and company.
    pub text: Option<String>,
}

/// `{"locations": [...]}` entry from the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(rename = "geoID")]
    pub geo_id: i64,
    #[serde(rename = "geoName")]
    pub geo_name: String,
    #[serde(rename = "geoSlug")]
    pub geo_slug: String,
}

/// `{"industries": [...]}` entry from the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndustryRecord {
    #[serde(rename = "industryID")]
    pub industry_id: i64,
    #[serde(rename = "industryName")]
    pub industry_name: String,
    #[serde(rename = "industrySlug")]
    pub industry_slug: String,
}

/// One `<item>` of the RSS job feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub job_type: Option<String>,
    pub company: Option<String>,
    pub image_url: Option<String>,
}

/// A listing returned by the remote search endpoint. Only rendered, never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJob {
    pub id: i64,
    pub url: String,
    pub job_title: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub company_logo: Option<String>,
    #[serde(default)]
    pub job_industry: Vec<String>,
    #[serde(default)]
    pub job_type: Vec<String>,
    #[serde(default)]
    pub job_geo: Option<String>,
    #[serde(default)]
    pub job_level: Option<String>,
    #[serde(default)]
    pub job_excerpt: Option<String>,
    #[serde(default)]
    pub pub_date: Option<String>,
}

impl JobFilter {
    /// Literal, case-insensitive substring match against title or company.
    /// A blank filter matches everything.
    pub fn matches_text(&self, title: &str, company: Option<&str>) -> bool {
        let Some(needle) = self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
            return true;
        };
        let needle = needle.to_lowercase();
        title.to_lowercase().contains(&needle)
            || company.is_some_and(|c| c.to_lowercase().contains(&needle))
    }
}

/// Parameters for the remote search endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSearchQuery {
    pub count: Option<u32>,
    pub geo: Option<String>,
    pub industry: Option<String>,
    pub tag: Option<String>,
}

impl JobSearchQuery {
    pub fn effective_count(&self) -> u32 {
        self.count
            .unwrap_or(DEFAULT_SEARCH_COUNT)
            .clamp(MIN_SEARCH_COUNT, MAX_SEARCH_COUNT)
    }

    /// Query parameters in request order; blank filters are left out.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("count", self.effective_count().to_string())];
        for (key, value) in [("geo", &self.geo), ("industry", &self.industry), ("tag", &self.tag)] {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                pairs.push((key, v.to_string()));
            }
        }
        pairs
    }
}
