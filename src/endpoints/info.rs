//! Handles the information side of the API

use actix_web::{
    get,
    web::{self, Data},
};
use serde::Serialize;

use crate::State;

/// configure all information endpoint services
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(global_info);
}

#[derive(Serialize)]
struct InfoResp<'r> {
    ready: bool,
    message: &'r str,
    uptime: u64,
}

/// endpoint which returns information about the api (GET /info)
#[get("/info")]
async fn global_info(state: Data<State>) -> impl actix_web::Responder {
    web::Json(InfoResp {
        ready: true,
        message: "ready",
        uptime: state.start_time.elapsed().as_secs(),
    })
}
