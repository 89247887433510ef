//! Axum + Askama pages over the cached locations, industries and jobs.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use jobsync_adapters::{description_excerpt, AdapterError, RemoteSource};
use jobsync_core::{
    Industry, JobFilter, JobListing, JobSearchQuery, Location, NewIndustry, NewLocation, RemoteJob,
    MAX_SEARCH_COUNT, MIN_SEARCH_COUNT,
};
use jobsync_storage::{Store, StoreError};
use jobsync_sync::{build_remote_source, open_store, PopulateOutcome, Reconciler, SyncConfig, SyncError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "jobsync-web";

pub const JOBS_PER_PAGE: usize = 20;
const LIST_EXCERPT_CHARS: usize = 180;
const DETAIL_TEXT_CHARS: usize = 5000;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub remote: Arc<dyn RemoteSource>,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(store: Store, remote: Arc<dyn RemoteSource>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            remote,
            workspace_root: workspace_root.into(),
        }
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.clone(), Arc::clone(&self.remote))
    }
}

/// `?notice=` banner codes set by the redirect after a sync action.
/// Counts stay strings so a hand-edited URL only blanks the number.
#[derive(Debug, Default, Deserialize)]
struct NoticeQuery {
    notice: Option<String>,
    inserted: Option<String>,
    skipped: Option<String>,
}

impl NoticeQuery {
    fn text(&self) -> String {
        let count = |raw: &Option<String>| raw.as_deref().and_then(|v| v.trim().parse::<usize>().ok()).unwrap_or(0);
        let inserted = count(&self.inserted);
        let skipped = count(&self.skipped);
        match self.notice.as_deref() {
            Some("populated") => format!("Imported {inserted} record(s); {skipped} already cached."),
            Some("already-populated") => "Already populated; nothing was imported.".to_string(),
            Some("synced") => format!("Feed synced: {inserted} new job(s); {skipped} already cached."),
            Some("remote-unavailable") => "The remote job source is unavailable right now.".to_string(),
            Some("malformed-response") => "The remote job source sent a response that could not be read.".to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LocationForm {
    #[serde(default)]
    geo_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    slug: String,
}

impl LocationForm {
    fn parse(&self) -> Result<NewLocation, &'static str> {
        Ok(NewLocation {
            geo_id: parse_external_id(&self.geo_id)?,
            name: required_name(&self.name)?,
            slug: optional_text(&self.slug),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct IndustryForm {
    #[serde(default)]
    industry_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    slug: String,
}

impl IndustryForm {
    fn parse(&self) -> Result<NewIndustry, &'static str> {
        Ok(NewIndustry {
            industry_id: parse_external_id(&self.industry_id)?,
            name: required_name(&self.name)?,
            slug: optional_text(&self.slug),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct LookupQuery {
    #[serde(default)]
    slug: String,
}

#[derive(Debug, Default, Deserialize)]
struct JobsQuery {
    location: Option<String>,
    industry: Option<String>,
    q: Option<String>,
    page: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    count: Option<String>,
    geo: Option<String>,
    industry: Option<String>,
    tag: Option<String>,
}

#[derive(Debug, Clone)]
struct ParentRow {
    id: i64,
    external_id: String,
    name: String,
    slug: String,
}

impl From<Location> for ParentRow {
    fn from(location: Location) -> Self {
        Self {
            id: location.id,
            external_id: display_id(location.geo_id),
            name: location.name,
            slug: location.slug.unwrap_or_default(),
        }
    }
}

impl From<Industry> for ParentRow {
    fn from(industry: Industry) -> Self {
        Self {
            id: industry.id,
            external_id: display_id(industry.industry_id),
            name: industry.name,
            slug: industry.slug.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
struct FilterOption {
    id: i64,
    name: String,
    selected: bool,
}

#[derive(Debug, Clone)]
struct JobRow {
    id: i64,
    title: String,
    link: String,
    company: String,
    job_type: String,
    location: String,
    industry: String,
    image_url: String,
    excerpt: String,
    created_at: String,
}

impl JobRow {
    fn from_listing(listing: JobListing, excerpt_chars: usize) -> Self {
        let job = listing.job;
        Self {
            id: job.id,
            excerpt: job
                .description
                .as_deref()
                .map(|html| description_excerpt(html, excerpt_chars))
                .unwrap_or_default(),
            title: job.title,
            link: job.link,
            company: job.company.unwrap_or_default(),
            job_type: job.job_type.unwrap_or_default(),
            location: listing.location_name.unwrap_or_default(),
            industry: listing.industry_name.unwrap_or_default(),
            image_url: job.image_url.unwrap_or_default(),
            created_at: job.created_at.format("%Y-%m-%d %H:%M UTC").to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct RemoteJobRow {
    title: String,
    url: String,
    company: String,
    geo: String,
    job_type: String,
    industry: String,
    level: String,
    excerpt: String,
    published: String,
}

impl From<RemoteJob> for RemoteJobRow {
    fn from(job: RemoteJob) -> Self {
        Self {
            title: job.job_title,
            url: job.url,
            company: job.company_name.unwrap_or_default(),
            geo: job.job_geo.unwrap_or_default(),
            job_type: job.job_type.join(", "),
            industry: job.job_industry.join(", "),
            level: job.job_level.unwrap_or_default(),
            excerpt: job
                .job_excerpt
                .as_deref()
                .map(|text| description_excerpt(text, LIST_EXCERPT_CHARS))
                .unwrap_or_default(),
            published: job.pub_date.unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    notice: String,
    total_locations: i64,
    total_industries: i64,
    total_jobs: i64,
}

#[derive(Template)]
#[template(path = "parents.html")]
struct ParentsTemplate {
    notice: String,
    title: &'static str,
    base_path: &'static str,
    id_field: &'static str,
    id_label: &'static str,
    rows: Vec<ParentRow>,
}

#[derive(Template)]
#[template(path = "jobs.html")]
struct JobsTemplate {
    notice: String,
    jobs: Vec<JobRow>,
    locations: Vec<FilterOption>,
    industries: Vec<FilterOption>,
    q: String,
    selected_location: String,
    selected_industry: String,
    total_jobs: usize,
    page: usize,
    total_pages: usize,
}

#[derive(Template)]
#[template(path = "job_detail.html")]
struct JobDetailTemplate {
    job: JobRow,
}

#[derive(Template)]
#[template(path = "job_search.html")]
struct JobSearchTemplate {
    notice: String,
    count: u32,
    min_count: u32,
    max_count: u32,
    geo: String,
    industry: String,
    tag: String,
    search_url: String,
    results: Vec<RemoteJobRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/locations", get(locations_handler).post(create_location_handler))
        .route("/locations/populate", post(populate_locations_handler))
        .route("/locations/lookup", get(location_lookup_handler))
        .route("/locations/{id}/update", post(update_location_handler))
        .route("/locations/{id}/delete", post(delete_location_handler))
        .route("/industries", get(industries_handler).post(create_industry_handler))
        .route("/industries/populate", post(populate_industries_handler))
        .route("/industries/lookup", get(industry_lookup_handler))
        .route("/industries/{id}/update", post(update_industry_handler))
        .route("/industries/{id}/delete", post(delete_industry_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/sync", post(sync_jobs_handler))
        .route("/jobs/search", get(job_search_handler))
        .route("/jobs/{id}", get(job_detail_handler))
        .route("/jobs/{id}/delete", post(delete_job_handler))
        .route("/remote/locations", get(remote_locations_handler))
        .route("/remote/industries", get(remote_industries_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("JOBSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5000)
}

pub async fn serve(config: &SyncConfig, port: u16) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let remote = build_remote_source(config)?;
    let state = AppState::new(store, remote, ".");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&SyncConfig::from_env(), port_from_env()).await
}

async fn index_handler(State(state): State<Arc<AppState>>, Query(notice): Query<NoticeQuery>) -> Response {
    let counts = async {
        let mut uow = state.store.begin().await?;
        Ok::<_, StoreError>((
            uow.count_locations().await?,
            uow.count_industries().await?,
            uow.count_jobs().await?,
        ))
    }
    .await;
    match counts {
        Ok((total_locations, total_industries, total_jobs)) => render_html(IndexTemplate {
            notice: notice.text(),
            total_locations,
            total_industries,
            total_jobs,
        }),
        Err(err) => store_error(err),
    }
}

// ---- locations ----

async fn locations_handler(State(state): State<Arc<AppState>>, Query(notice): Query<NoticeQuery>) -> Response {
    let locations = async { state.store.begin().await?.list_locations().await }.await;
    match locations {
        Ok(locations) => render_html(ParentsTemplate {
            notice: notice.text(),
            title: "Locations",
            base_path: "/locations",
            id_field: "geo_id",
            id_label: "Geo ID",
            rows: locations.into_iter().map(ParentRow::from).collect(),
        }),
        Err(err) => store_error(err),
    }
}

async fn create_location_handler(State(state): State<Arc<AppState>>, Form(form): Form<LocationForm>) -> Response {
    let location = match form.parse() {
        Ok(location) => location,
        Err(msg) => return bad_request(msg),
    };
    let result = async {
        let mut uow = state.store.begin().await?;
        uow.insert_location(&location).await?;
        uow.commit().await
    }
    .await;
    redirect_or_error("/locations", result)
}

async fn update_location_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Form(form): Form<LocationForm>,
) -> Response {
    let location = match form.parse() {
        Ok(location) => location,
        Err(msg) => return bad_request(msg),
    };
    let result = async {
        let mut uow = state.store.begin().await?;
        uow.update_location(id, &location).await?;
        uow.commit().await
    }
    .await;
    redirect_or_error("/locations", result)
}

async fn delete_location_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    let result = async {
        let mut uow = state.store.begin().await?;
        uow.delete_location(id).await?;
        uow.commit().await
    }
    .await;
    redirect_or_error("/locations", result)
}

async fn populate_locations_handler(State(state): State<Arc<AppState>>) -> Response {
    populate_redirect("/locations", state.reconciler().populate_locations_if_empty().await)
}

async fn location_lookup_handler(State(state): State<Arc<AppState>>, Query(query): Query<LookupQuery>) -> Response {
    let slug = query.slug.trim().to_lowercase();
    if slug.is_empty() {
        return bad_request("slug is required");
    }
    let found = async { state.store.begin().await?.find_location_by_slug(&slug).await }.await;
    match found {
        Ok(Some(location)) => Json(location).into_response(),
        Ok(None) => lookup_miss("location", &slug),
        Err(err) => store_error(err),
    }
}

// ---- industries ----

async fn industries_handler(State(state): State<Arc<AppState>>, Query(notice): Query<NoticeQuery>) -> Response {
    let industries = async { state.store.begin().await?.list_industries().await }.await;
    match industries {
        Ok(industries) => render_html(ParentsTemplate {
            notice: notice.text(),
            title: "Industries",
            base_path: "/industries",
            id_field: "industry_id",
            id_label: "Industry ID",
            rows: industries.into_iter().map(ParentRow::from).collect(),
        }),
        Err(err) => store_error(err),
    }
}

async fn create_industry_handler(State(state): State<Arc<AppState>>, Form(form): Form<IndustryForm>) -> Response {
    let industry = match form.parse() {
        Ok(industry) => industry,
        Err(msg) => return bad_request(msg),
    };
    let result = async {
        let mut uow = state.store.begin().await?;
        uow.insert_industry(&industry).await?;
        uow.commit().await
    }
    .await;
    redirect_or_error("/industries", result)
}

async fn update_industry_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Form(form): Form<IndustryForm>,
) -> Response {
    let industry = match form.parse() {
        Ok(industry) => industry,
        Err(msg) => return bad_request(msg),
    };
    let result = async {
        let mut uow = state.store.begin().await?;
        uow.update_industry(id, &industry).await?;
        uow.commit().await
    }
    .await;
    redirect_or_error("/industries", result)
}

async fn delete_industry_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    let result = async {
        let mut uow = state.store.begin().await?;
        uow.delete_industry(id).await?;
        uow.commit().await
    }
    .await;
    redirect_or_error("/industries", result)
}

async fn populate_industries_handler(State(state): State<Arc<AppState>>) -> Response {
    populate_redirect("/industries", state.reconciler().populate_industries_if_empty().await)
}

async fn industry_lookup_handler(State(state): State<Arc<AppState>>, Query(query): Query<LookupQuery>) -> Response {
    let slug = query.slug.trim().to_lowercase();
    if slug.is_empty() {
        return bad_request("slug is required");
    }
    let found = async { state.store.begin().await?.find_industry_by_slug(&slug).await }.await;
    match found {
        Ok(Some(industry)) => Json(industry).into_response(),
        Ok(None) => lookup_miss("industry", &slug),
        Err(err) => store_error(err),
    }
}

// ---- jobs ----

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(notice): Query<NoticeQuery>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let filter = match jobs_filter(&query) {
        Ok(filter) => filter,
        Err(msg) => return bad_request(msg),
    };
    let loaded = async {
        let mut uow = state.store.begin().await?;
        Ok::<_, StoreError>((
            uow.list_jobs(&filter).await?,
            uow.list_locations().await?,
            uow.list_industries().await?,
        ))
    }
    .await;

    match loaded {
        Ok((jobs, locations, industries)) => {
            let total_jobs = jobs.len();
            let (jobs, page, total_pages) = paginate(jobs, query.page);
            render_html(JobsTemplate {
                notice: notice.text(),
                jobs: jobs
                    .into_iter()
                    .map(|listing| JobRow::from_listing(listing, LIST_EXCERPT_CHARS))
                    .collect(),
                locations: locations
                    .into_iter()
                    .map(|l| FilterOption {
                        selected: filter.location_id == Some(l.id),
                        id: l.id,
                        name: l.name,
                    })
                    .collect(),
                industries: industries
                    .into_iter()
                    .map(|i| FilterOption {
                        selected: filter.industry_id == Some(i.id),
                        id: i.id,
                        name: i.name,
                    })
                    .collect(),
                q: filter.text.clone().unwrap_or_default(),
                selected_location: display_id(filter.location_id),
                selected_industry: display_id(filter.industry_id),
                total_jobs,
                page,
                total_pages,
            })
        }
        Err(err) => store_error(err),
    }
}

async fn sync_jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.reconciler().sync_feed_jobs().await {
        Ok(report) => Redirect::to(&format!(
            "/jobs?notice=synced&inserted={}&skipped={}",
            report.counts.jobs_inserted, report.counts.jobs_skipped
        ))
        .into_response(),
        Err(err) => sync_failure("/jobs", err),
    }
}

async fn job_detail_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    let job = async { state.store.begin().await?.get_job(id).await }.await;
    match job {
        Ok(listing) => render_html(JobDetailTemplate {
            job: JobRow::from_listing(listing, DETAIL_TEXT_CHARS),
        }),
        Err(err) => store_error(err),
    }
}

async fn delete_job_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    let result = async {
        let mut uow = state.store.begin().await?;
        uow.delete_job(id).await?;
        uow.commit().await
    }
    .await;
    redirect_or_error("/jobs", result)
}

async fn job_search_handler(State(state): State<Arc<AppState>>, Query(params): Query<SearchParams>) -> Response {
    let count = match params.count.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<u32>() {
            Ok(count) => Some(count),
            Err(_) => return bad_request("count must be a whole number"),
        },
    };
    let query = JobSearchQuery {
        count,
        geo: params.geo.and_then(|v| optional_text(&v)),
        industry: params.industry.and_then(|v| optional_text(&v)),
        tag: params.tag.and_then(|v| optional_text(&v)),
    };

    let (results, notice) = match state.remote.search_jobs(&query).await {
        Ok(jobs) => (jobs.into_iter().map(RemoteJobRow::from).collect(), String::new()),
        Err(err) => {
            warn!(error = %err, "remote job search failed");
            let notice = NoticeQuery {
                notice: Some(remote_notice_code(&err).to_string()),
                ..Default::default()
            };
            (Vec::new(), notice.text())
        }
    };

    render_html(JobSearchTemplate {
        notice,
        count: query.effective_count(),
        min_count: MIN_SEARCH_COUNT,
        max_count: MAX_SEARCH_COUNT,
        search_url: state.remote.search_url(&query),
        geo: query.geo.unwrap_or_default(),
        industry: query.industry.unwrap_or_default(),
        tag: query.tag.unwrap_or_default(),
        results,
    })
}

async fn remote_locations_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.remote.fetch_locations().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => {
            warn!(error = %err, "remote locations fetch failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn remote_industries_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.remote.fetch_industries().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => {
            warn!(error = %err, "remote industries fetch failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response(),
    }
}

fn jobs_filter(query: &JobsQuery) -> Result<JobFilter, &'static str> {
    Ok(JobFilter {
        location_id: parse_filter_id(query.location.as_deref())?,
        industry_id: parse_filter_id(query.industry.as_deref())?,
        text: query.q.as_deref().and_then(optional_text),
    })
}

fn parse_filter_id(raw: Option<&str>) -> Result<Option<i64>, &'static str> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| "filter IDs must be whole numbers"),
    }
}

fn paginate<T>(rows: Vec<T>, page: Option<usize>) -> (Vec<T>, usize, usize) {
    let total_pages = rows.len().div_ceil(JOBS_PER_PAGE).max(1);
    let page = page.unwrap_or(1).clamp(1, total_pages);
    let rows = rows
        .into_iter()
        .skip((page - 1) * JOBS_PER_PAGE)
        .take(JOBS_PER_PAGE)
        .collect();
    (rows, page, total_pages)
}

fn parse_external_id(raw: &str) -> Result<Option<i64>, &'static str> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|_| "external ID must be a whole number")
}

fn required_name(raw: &str) -> Result<String, &'static str> {
    optional_text(raw).ok_or("name is required")
}

fn optional_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn display_id(id: Option<i64>) -> String {
    id.map(|v| v.to_string()).unwrap_or_default()
}

fn remote_notice_code(err: &AdapterError) -> &'static str {
    match err {
        AdapterError::RemoteUnavailable { .. } => "remote-unavailable",
        AdapterError::MalformedResponse { .. } => "malformed-response",
    }
}

fn populate_redirect(path: &str, result: Result<PopulateOutcome, SyncError>) -> Response {
    match result {
        Ok(PopulateOutcome::Populated { inserted, skipped }) => {
            Redirect::to(&format!("{path}?notice=populated&inserted={inserted}&skipped={skipped}")).into_response()
        }
        Ok(PopulateOutcome::AlreadyPopulated) => {
            Redirect::to(&format!("{path}?notice=already-populated")).into_response()
        }
        Err(err) => sync_failure(path, err),
    }
}

fn sync_failure(path: &str, err: SyncError) -> Response {
    match err {
        SyncError::Remote(err) => {
            warn!(error = %err, "remote source failed");
            Redirect::to(&format!("{path}?notice={}", remote_notice_code(&err))).into_response()
        }
        SyncError::Store(err) => store_error(err),
    }
}

fn redirect_or_error(path: &str, result: Result<(), StoreError>) -> Response {
    match result {
        Ok(()) => Redirect::to(path).into_response(),
        Err(err) => store_error(err),
    }
}

fn lookup_miss(entity: &str, slug: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("no {entity} with slug {slug}") })),
    )
        .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Html(format!("Invalid input: {msg}"))).into_response()
}

fn store_error(err: StoreError) -> Response {
    let status = match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Referenced { .. } | StoreError::Duplicate { .. } => StatusCode::CONFLICT,
        StoreError::Database(_) | StoreError::Migrate(_) => return server_error(err.into()),
    };
    (status, Html(format!("<p>{err}</p><p><a href=\"/\">Back</a></p>"))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
