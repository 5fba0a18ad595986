//! All endpoints that the API can handle

pub mod agents;
pub mod info;
pub mod media;
pub mod reports;

use actix_web::{http::header::AUTHORIZATION, web, HttpRequest};

/// configure every endpoint of the api
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.configure(info::configure)
        .configure(agents::configure)
        .configure(reports::configure)
        .configure(media::configure);
}

/// The hex digest a client placed in the `Authorization` header, if any
pub(crate) fn digest_header(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
}
