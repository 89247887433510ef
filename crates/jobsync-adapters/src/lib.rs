//! Remote source contracts + the Jobicy HTTP source and an offline fixture source.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Result};
use async_trait::async_trait;
use jobsync_core::{FeedItem, IndustryRecord, JobSearchQuery, LocationRecord, RemoteJob};
use jobsync_storage::{FetchError, HttpFetcher};
use scraper::Html;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobsync-adapters";

pub const JOBICY_LOCATIONS_URL: &str = "https://jobicy.com/api/v2/remote-jobs?get=locations";
pub const JOBICY_INDUSTRIES_URL: &str = "https://jobicy.com/api/v2/remote-jobs?get=industries";
pub const JOBICY_JOBS_URL: &str = "https://jobicy.com/api/v2/remote-jobs";
pub const JOBICY_FEED_URL: &str = "https://jobicy.com/?feed=job_feed";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("remote source unavailable at {url}: {reason}")]
    RemoteUnavailable { url: String, reason: String },
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },
}

impl AdapterError {
    fn unavailable(url: &str, reason: impl ToString) -> Self {
        Self::RemoteUnavailable {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    fn malformed(url: &str, reason: impl ToString) -> Self {
        Self::MalformedResponse {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Fixed endpoints of the remote source; overridable for mirrors and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub locations_url: String,
    pub industries_url: String,
    pub jobs_url: String,
    pub feed_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            locations_url: JOBICY_LOCATIONS_URL.to_string(),
            industries_url: JOBICY_INDUSTRIES_URL.to_string(),
            jobs_url: JOBICY_JOBS_URL.to_string(),
            feed_url: JOBICY_FEED_URL.to_string(),
        }
    }
}

/// One attempt per call; no retry or backoff.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_locations(&self) -> Result<Vec<LocationRecord>, AdapterError>;

    async fn fetch_industries(&self) -> Result<Vec<IndustryRecord>, AdapterError>;

    async fn fetch_job_feed(&self) -> Result<Vec<FeedItem>, AdapterError>;

    /// URL the search view queries, shown next to the results.
    fn search_url(&self, query: &JobSearchQuery) -> String;

    async fn search_jobs(&self, query: &JobSearchQuery) -> Result<Vec<RemoteJob>, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct LocationsEnvelope {
    locations: Vec<LocationRecord>,
}

#[derive(Debug, Deserialize)]
struct IndustriesEnvelope {
    industries: Vec<IndustryRecord>,
}

#[derive(Debug, Deserialize)]
struct JobsEnvelope {
    #[serde(default)]
    jobs: Vec<RemoteJob>,
}

fn parse_json<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, AdapterError> {
    serde_json::from_slice(body).map_err(|e| AdapterError::malformed(url, e))
}

pub fn parse_locations(url: &str, body: &[u8]) -> Result<Vec<LocationRecord>, AdapterError> {
    Ok(parse_json::<LocationsEnvelope>(url, body)?.locations)
}

pub fn parse_industries(url: &str, body: &[u8]) -> Result<Vec<IndustryRecord>, AdapterError> {
    Ok(parse_json::<IndustriesEnvelope>(url, body)?.industries)
}

pub fn parse_job_search(url: &str, body: &[u8]) -> Result<Vec<RemoteJob>, AdapterError> {
    Ok(parse_json::<JobsEnvelope>(url, body)?.jobs)
}

/// Parse the RSS job feed. Title and link are required on every item.
pub fn parse_job_feed(url: &str, body: &[u8]) -> Result<Vec<FeedItem>, AdapterError> {
    let channel = rss::Channel::read_from(body).map_err(|e| AdapterError::malformed(url, e))?;
    channel
        .items()
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let title = item
                .title()
                .and_then(text_or_none)
                .ok_or_else(|| AdapterError::malformed(url, format!("feed item {idx} has no title")))?;
            let link = item
                .link()
                .and_then(text_or_none)
                .ok_or_else(|| AdapterError::malformed(url, format!("feed item {idx} has no link")))?;
            Ok(FeedItem {
                title,
                link,
                description: item.description().and_then(text_or_none),
                location: extension_text(item, "job_listing", "location"),
                job_type: extension_text(item, "job_listing", "job_type"),
                company: extension_text(item, "job_listing", "company"),
                image_url: media_content_url(item)
                    .or_else(|| item.enclosure().and_then(|e| text_or_none(e.url()))),
            })
        })
        .collect()
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn extension_text(item: &rss::Item, prefix: &str, name: &str) -> Option<String> {
    item.extensions()
        .get(prefix)?
        .get(name)?
        .first()?
        .value()
        .and_then(text_or_none)
}

fn media_content_url(item: &rss::Item) -> Option<String> {
    item.extensions()
        .get("media")?
        .get("content")?
        .iter()
        .find_map(|ext| ext.attrs().get("url").and_then(|u| text_or_none(u)))
}

/// Plain-text excerpt of an HTML description, cut at `max_chars`.
pub fn description_excerpt(html: &str, max_chars: usize) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ");
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut cut = text.chars().take(max_chars).collect::<String>();
    cut.push('…');
    cut
}

fn search_url_for(base: &str, query: &JobSearchQuery) -> String {
    match reqwest::Url::parse_with_params(base, query.query_pairs()) {
        Ok(url) => url.to_string(),
        Err(_) => base.to_string(),
    }
}

/// Live Jobicy API + RSS feed.
#[derive(Debug, Clone)]
pub struct JobicySource {
    http: HttpFetcher,
    endpoints: Endpoints,
}

impl JobicySource {
    pub fn new(http: HttpFetcher, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, AdapterError> {
        match self.http.fetch_bytes(self.source_id(), url).await {
            Ok(resp) => Ok(resp.body),
            Err(err @ FetchError::HttpStatus { .. }) => Err(AdapterError::unavailable(url, err)),
            Err(FetchError::Request(err)) => Err(AdapterError::unavailable(url, err)),
        }
    }
}

#[async_trait]
impl RemoteSource for JobicySource {
    fn source_id(&self) -> &'static str {
        "jobicy"
    }

    async fn fetch_locations(&self) -> Result<Vec<LocationRecord>, AdapterError> {
        let url = &self.endpoints.locations_url;
        parse_locations(url, &self.get(url).await?)
    }

    async fn fetch_industries(&self) -> Result<Vec<IndustryRecord>, AdapterError> {
        let url = &self.endpoints.industries_url;
        parse_industries(url, &self.get(url).await?)
    }

    async fn fetch_job_feed(&self) -> Result<Vec<FeedItem>, AdapterError> {
        let url = &self.endpoints.feed_url;
        parse_job_feed(url, &self.get(url).await?)
    }

    fn search_url(&self, query: &JobSearchQuery) -> String {
        search_url_for(&self.endpoints.jobs_url, query)
    }

    async fn search_jobs(&self, query: &JobSearchQuery) -> Result<Vec<RemoteJob>, AdapterError> {
        let url = self.search_url(query);
        parse_job_search(&url, &self.get(&url).await?)
    }
}

/// Serves canned responses from `locations.json`, `industries.json`,
/// `feed.xml` and `jobs.json` in one directory.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    dir: PathBuf,
}

impl FixtureSource {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure!(dir.is_dir(), "fixture directory {} does not exist", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read(&self, name: &str) -> Result<(String, Vec<u8>), AdapterError> {
        let path = self.dir.join(name);
        let url = format!("file://{}", path.display());
        let body = fs::read(&path).map_err(|e| AdapterError::unavailable(&url, e))?;
        Ok((url, body))
    }
}

#[async_trait]
impl RemoteSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_locations(&self) -> Result<Vec<LocationRecord>, AdapterError> {
        let (url, body) = self.read("locations.json")?;
        parse_locations(&url, &body)
    }

    async fn fetch_industries(&self) -> Result<Vec<IndustryRecord>, AdapterError> {
        let (url, body) = self.read("industries.json")?;
        parse_industries(&url, &body)
    }

    async fn fetch_job_feed(&self) -> Result<Vec<FeedItem>, AdapterError> {
        let (url, body) = self.read("feed.xml")?;
        parse_job_feed(&url, &body)
    }

    fn search_url(&self, query: &JobSearchQuery) -> String {
        search_url_for(JOBICY_JOBS_URL, query)
    }

    async fn search_jobs(&self, query: &JobSearchQuery) -> Result<Vec<RemoteJob>, AdapterError> {
        let (url, body) = self.read("jobs.json")?;
        let mut jobs = parse_job_search(&url, &body)?;
        jobs.truncate(query.effective_count() as usize);
        Ok(jobs)
    }
}
