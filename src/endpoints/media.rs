//! Serves stored agent pictures and report images

use std::path::PathBuf;

use actix_web::{
    get,
    web::{self, Data, Path},
    HttpResponse,
};
use image::ImageFormat;
use log::warn;

use crate::{
    db::{Database, DbBackend},
    error::ApiError,
    images::{ImageRole, ImageStore},
    State,
};

/// configure all image endpoint services
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(agent_image)
        .service(report_image)
        .service(report_thumb);
}

/// Read a stored image, falling back to the placeholder when the file is gone
async fn read_or_placeholder(
    images: &ImageStore,
    relative: PathBuf,
) -> Result<HttpResponse, ApiError> {
    let store = images.clone();
    let path = relative.clone();
    match web::block(move || store.open(&path)).await {
        Ok(Ok(bytes)) => {
            let mime = ImageFormat::from_path(&relative)
                .map(|f| f.to_mime_type())
                .unwrap_or_else(|_| images.content_type());
            Ok(HttpResponse::Ok().content_type(mime).body(bytes))
        }
        Ok(Err(e)) => {
            warn!("failed to read {:?}, serving placeholder: {}", relative, e);
            placeholder(images)
        }
        Err(_) => {
            warn!("read of {:?} was cancelled, serving placeholder", relative);
            placeholder(images)
        }
    }
}

fn placeholder(images: &ImageStore) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok()
        .content_type(images.content_type())
        .body(images.placeholder()?))
}

async fn __agent_image(
    db: &impl DbBackend,
    images: &ImageStore,
    id: &str,
) -> Result<HttpResponse, ApiError> {
    let agent = db
        .get_agent(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("agent `{}`", id)))?;
    match agent.picture {
        Some(p) => read_or_placeholder(images, PathBuf::from(p)).await,
        None => placeholder(images),
    }
}

/// Picture of an agent (GET /api/agents/{agent_id}/image)
#[get("/api/agents/{agent_id}/image")]
async fn agent_image(
    db: Data<Database>,
    state: Data<State>,
    agent_id: Path<String>,
) -> Result<HttpResponse, ApiError> {
    __agent_image(db.get_ref(), &state.images, &agent_id).await
}

async fn __report_image(
    db: &impl DbBackend,
    images: &ImageStore,
    id: &str,
    thumb: bool,
) -> Result<HttpResponse, ApiError> {
    let row = db
        .get_report_image(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("image `{}`", id)))?;
    let relative = if thumb {
        images.relative_path(&row.id, ImageRole::ReportThumb)?
    } else {
        PathBuf::from(row.path)
    };
    read_or_placeholder(images, relative).await
}

/// Full size report image (GET /api/reports/images/{image_id})
#[get("/api/reports/images/{image_id}")]
async fn report_image(
    db: Data<Database>,
    state: Data<State>,
    image_id: Path<String>,
) -> Result<HttpResponse, ApiError> {
    __report_image(db.get_ref(), &state.images, &image_id, false).await
}

/// Thumbnail of a report image (GET /api/reports/images/{image_id}/thumb)
#[get("/api/reports/images/{image_id}/thumb")]
async fn report_thumb(
    db: Data<Database>,
    state: Data<State>,
    image_id: Path<String>,
) -> Result<HttpResponse, ApiError> {
    __report_image(db.get_ref(), &state.images, &image_id, true).await
}
