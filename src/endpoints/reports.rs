//! Handles submission and lookup of reports

use actix_web::{
    get, post,
    web::{self, Bytes, Data, Path, Query},
    HttpRequest, HttpResponse,
};
use serde::{Deserialize, Serialize};

use crate::{
    db::{Database, DbBackend},
    endpoints::digest_header,
    error::ApiError,
    ingest::Ingestion,
    models::{Report, ReportImage},
    State,
};

/// Reports returned by a listing when no limit is given
pub const DEFAULT_PAGE_SIZE: i64 = 20;
/// Upper bound on the limit of a listing
pub const MAX_PAGE_SIZE: i64 = 100;

/// configure all report endpoint services
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(submit).service(list_reports).service(report_info);
}

#[derive(Debug, Serialize)]
struct Submitted<'r> {
    id: &'r str,
}

/// Paging of a report listing
#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct Page {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Page {
    fn bounds(&self) -> (i64, i64) {
        (
            self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(0, MAX_PAGE_SIZE),
            self.offset.unwrap_or(0).max(0),
        )
    }
}

#[derive(Debug, Serialize)]
struct ReportDetail {
    #[serde(flatten)]
    report: Report,
    images: Vec<ReportImage>,
}

async fn __submit(
    req: &HttpRequest,
    body: &[u8],
    db: &impl DbBackend,
    state: &State,
) -> Result<HttpResponse, ApiError> {
    let report = Ingestion::new(db, &state.images, &state.verifier)
        .submit_report(body, digest_header(req))
        .await?;
    Ok(HttpResponse::Ok().json(Submitted { id: &report.id }))
}

/// Submit a report with its images (POST /api/reports)
#[post("/api/reports")]
async fn submit(
    req: HttpRequest,
    body: Bytes,
    db: Data<Database>,
    state: Data<State>,
) -> Result<HttpResponse, ApiError> {
    __submit(&req, &body, db.get_ref(), &state).await
}

async fn __list_reports(db: &impl DbBackend, page: &Page) -> Result<HttpResponse, ApiError> {
    let (limit, offset) = page.bounds();
    Ok(HttpResponse::Ok().json(db.list_reports(limit, offset).await?))
}

/// Most recent reports first (GET /api/reports?limit=&offset=)
#[get("/api/reports")]
async fn list_reports(db: Data<Database>, page: Query<Page>) -> Result<HttpResponse, ApiError> {
    __list_reports(db.get_ref(), &page).await
}

async fn __report_info(db: &impl DbBackend, id: &str) -> Result<HttpResponse, ApiError> {
    let report = db
        .get_report(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("report `{}`", id)))?;
    let images = db.list_report_images(&report.id).await?;
    Ok(HttpResponse::Ok().json(ReportDetail { report, images }))
}

/// A single report along with its images (GET /api/reports/{report_id})
#[get("/api/reports/{report_id}")]
async fn report_info(
    db: Data<Database>,
    report_id: Path<String>,
) -> Result<HttpResponse, ApiError> {
    __report_info(db.get_ref(), &report_id).await
}
