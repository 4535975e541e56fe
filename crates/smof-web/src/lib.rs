//! Axum + Askama dashboard over the latest SMOF run reports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use smof_core::{PriorityBucket, RankedReport, ScoredListing};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "smof-web";

#[derive(Clone)]
pub struct AppState {
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SourcesYaml {
    sources: Vec<SourceRow>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRow {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: String,
}

/// One ranked find, pre-formatted for the templates.
#[derive(Debug, Clone)]
pub struct FindRow {
    pub key: String,
    pub source_id: String,
    pub player: String,
    pub title: String,
    pub price: String,
    pub score: String,
    pub bucket: String,
    pub auth_service: String,
    pub listing_url: String,
    pub seen_before: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReportRow {
    pub run_id: String,
    pub finds: usize,
    pub clusters: usize,
    pub skipped_records: usize,
    pub has_parquet_manifest: bool,
}

#[derive(Debug, Clone)]
struct DashboardData {
    sources: Vec<SourceRow>,
    report: Option<RankedReport>,
    runs: Vec<RunReportRow>,
}

#[derive(Debug, Deserialize, Default)]
struct FindsQuery {
    bucket: Option<String>,
    source: Option<String>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total_sources: usize,
    total_finds: usize,
    priority_finds: usize,
    skipped_records: usize,
    latest_run_id: String,
}

#[derive(Template)]
#[template(path = "finds.html")]
struct FindsTemplate {
    finds: Vec<FindRow>,
    source_counts: Vec<FacetCountRow>,
    selected_bucket: String,
    selected_source: String,
}

#[derive(Debug, Clone)]
struct FacetCountRow {
    source_id: String,
    count: usize,
    selected: bool,
}

#[derive(Template)]
#[template(path = "sources.html")]
struct SourcesTemplate {
    sources: Vec<SourceRow>,
}

#[derive(Template)]
#[template(path = "reports.html")]
struct ReportsTemplate {
    runs: Vec<RunReportRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/finds", get(finds_handler))
        .route("/sources", get(sources_handler))
        .route("/reports", get(reports_handler))
        .route("/reports/chart", get(reports_chart_handler))
        .route("/report.json", get(report_json_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("SMOF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(".");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_dashboard_data(&state.workspace_root) {
        Ok(data) => {
            let (total, priority, skipped) = data
                .report
                .as_ref()
                .map(|r| {
                    (
                        r.priority.len() + r.collection.len(),
                        r.priority.len(),
                        r.malformed_records,
                    )
                })
                .unwrap_or((0, 0, 0));
            render_html(IndexTemplate {
                total_sources: data.sources.len(),
                total_finds: total,
                priority_finds: priority,
                skipped_records: skipped,
                latest_run_id: data
                    .runs
                    .first()
                    .map(|r| r.run_id.clone())
                    .unwrap_or_else(|| "n/a".into()),
            })
        }
        Err(err) => server_error(err),
    }
}

async fn finds_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FindsQuery>,
) -> Response {
    match load_dashboard_data(&state.workspace_root) {
        Ok(data) => {
            let all = data.report.as_ref().map(find_rows).unwrap_or_default();

            let selected_bucket = query.bucket.clone().unwrap_or_default();
            let selected_source = query.source.clone().unwrap_or_default();

            let mut counts = BTreeMap::<String, usize>::new();
            for find in &all {
                *counts.entry(find.source_id.clone()).or_default() += 1;
            }
            let source_counts = counts
                .into_iter()
                .map(|(source_id, count)| FacetCountRow {
                    selected: !selected_source.is_empty() && selected_source == source_id,
                    source_id,
                    count,
                })
                .collect();

            let finds = all
                .into_iter()
                .filter(|f| selected_bucket.is_empty() || f.bucket == selected_bucket)
                .filter(|f| selected_source.is_empty() || f.source_id == selected_source)
                .collect();

            render_html(FindsTemplate {
                finds,
                source_counts,
                selected_bucket,
                selected_source,
            })
        }
        Err(err) => server_error(err),
    }
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_sources_from_yaml(&state.workspace_root) {
        Ok(sources) => render_html(SourcesTemplate { sources }),
        Err(err) => server_error(err),
    }
}

async fn reports_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_runs(&state.workspace_root, 20) {
        Ok(runs) => render_html(ReportsTemplate { runs }),
        Err(err) => server_error(err),
    }
}

async fn reports_chart_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_runs(&state.workspace_root, 20) {
        Ok(runs) => {
            let x = runs.iter().map(|r| r.run_id.clone()).collect::<Vec<_>>();
            let y = runs.iter().map(|r| r.finds as i64).collect::<Vec<_>>();
            Json(serde_json::json!({
                "data": [{
                    "type": "bar",
                    "x": x,
                    "y": y,
                    "marker": {"color": "#0ea5e9"}
                }],
                "layout": {
                    "title": "Finds Per Run",
                    "paper_bgcolor": "#ffffff",
                    "plot_bgcolor": "#f8fafc"
                }
            }))
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn report_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_latest_report(&state.workspace_root) {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Html("No runs yet".to_string())).into_response(),
        Err(err) => server_error(err),
    }
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => {
            (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response()
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn load_dashboard_data(workspace_root: &Path) -> anyhow::Result<DashboardData> {
    Ok(DashboardData {
        sources: load_sources_from_yaml(workspace_root)?,
        report: load_latest_report(workspace_root)?,
        runs: load_runs(workspace_root, 20)?,
    })
}

fn load_sources_from_yaml(workspace_root: &Path) -> anyhow::Result<Vec<SourceRow>> {
    let path = workspace_root.join("sources.yaml");
    let yaml = std::fs::read_to_string(&path)?;
    let parsed: SourcesYaml = serde_yaml::from_str(&yaml)?;
    Ok(parsed.sources)
}

fn run_dirs_newest_first(workspace_root: &Path) -> anyhow::Result<Vec<std::fs::DirEntry>> {
    let reports_root = workspace_root.join("reports");
    if !reports_root.exists() {
        return Ok(vec![]);
    }
    let mut entries = std::fs::read_dir(&reports_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    entries.reverse();
    Ok(entries)
}

fn load_runs(workspace_root: &Path, limit: usize) -> anyhow::Result<Vec<RunReportRow>> {
    let mut runs = Vec::new();
    for entry in run_dirs_newest_first(workspace_root)?.into_iter().take(limit) {
        let run_id = entry.file_name().to_string_lossy().to_string();
        let report_path = entry.path().join("ranked_report.json");
        let (finds, clusters, skipped) = if report_path.exists() {
            let report: RankedReport =
                serde_json::from_str(&std::fs::read_to_string(&report_path)?)?;
            (
                report.priority.len() + report.collection.len(),
                report.clusters.len(),
                report.malformed_records,
            )
        } else {
            (0, 0, 0)
        };
        runs.push(RunReportRow {
            run_id,
            finds,
            clusters,
            skipped_records: skipped,
            has_parquet_manifest: entry.path().join("snapshots/manifest.json").exists(),
        });
    }
    Ok(runs)
}

fn load_latest_report(workspace_root: &Path) -> anyhow::Result<Option<RankedReport>> {
    for entry in run_dirs_newest_first(workspace_root)? {
        let report_path = entry.path().join("ranked_report.json");
        if report_path.exists() {
            let report = serde_json::from_str(&std::fs::read_to_string(&report_path)?)?;
            return Ok(Some(report));
        }
    }
    Ok(None)
}

fn find_rows(report: &RankedReport) -> Vec<FindRow> {
    let seen_before: BTreeMap<String, bool> = report
        .clusters
        .iter()
        .map(|c| (c.representative.clone(), c.seen_in_prior_run))
        .collect();

    report
        .priority
        .iter()
        .chain(report.collection.iter())
        .map(|item: &ScoredListing| FindRow {
            key: item.listing.key(),
            source_id: item.listing.source_id.clone(),
            player: item.listing.player.clone(),
            title: item.listing.title.clone(),
            price: format!("{} {:.2}", item.listing.currency, item.listing.price),
            score: format!("{:.3}", item.score),
            bucket: match item.priority_bucket {
                PriorityBucket::Priority => "priority".to_string(),
                PriorityBucket::Collection => "collection".to_string(),
            },
            auth_service: item.listing.auth_service.as_str().to_string(),
            listing_url: item.listing.listing_url.clone().unwrap_or_default(),
            seen_before: seen_before
                .get(&item.listing.key())
                .copied()
                .unwrap_or(false),
        })
        .collect()
}
