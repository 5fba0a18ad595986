//! Handles registration of agents and their pictures

use actix_web::{
    get, post,
    web::{self, Bytes, Data, Path},
    HttpRequest, HttpResponse,
};
use serde::Serialize;

use crate::{
    db::{Database, DbBackend},
    endpoints::digest_header,
    error::ApiError,
    ingest::Ingestion,
    models::{Agent, Report},
    State,
};

/// configure all agent endpoint services
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(register)
        .service(upload_image)
        .service(list_agents)
        .service(agent_info);
}

#[derive(Debug, Serialize)]
struct AgentDetail {
    #[serde(flatten)]
    agent: Agent,
    reports: Vec<Report>,
}

async fn __register(
    req: &HttpRequest,
    body: &[u8],
    db: &impl DbBackend,
    state: &State,
) -> Result<HttpResponse, ApiError> {
    Ingestion::new(db, &state.images, &state.verifier)
        .register_agent(body, digest_header(req))
        .await?;
    Ok(HttpResponse::Ok().finish())
}

/// Register a new agent (POST /api/agents)
#[post("/api/agents")]
async fn register(
    req: HttpRequest,
    body: Bytes,
    db: Data<Database>,
    state: Data<State>,
) -> Result<HttpResponse, ApiError> {
    __register(&req, &body, db.get_ref(), &state).await
}

async fn __upload_image(
    req: &HttpRequest,
    body: &[u8],
    db: &impl DbBackend,
    state: &State,
) -> Result<HttpResponse, ApiError> {
    Ingestion::new(db, &state.images, &state.verifier)
        .upload_agent_image(body, digest_header(req))
        .await?;
    Ok(HttpResponse::Ok().finish())
}

/// Replace the picture of an agent (POST /api/agents/image)
#[post("/api/agents/image")]
async fn upload_image(
    req: HttpRequest,
    body: Bytes,
    db: Data<Database>,
    state: Data<State>,
) -> Result<HttpResponse, ApiError> {
    __upload_image(&req, &body, db.get_ref(), &state).await
}

async fn __list_agents(db: &impl DbBackend) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(db.list_agents().await?))
}

/// All registered agents (GET /api/agents)
#[get("/api/agents")]
async fn list_agents(db: Data<Database>) -> Result<HttpResponse, ApiError> {
    __list_agents(db.get_ref()).await
}

async fn __agent_info(db: &impl DbBackend, id: &str) -> Result<HttpResponse, ApiError> {
    let agent = db
        .get_agent(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("agent `{}`", id)))?;
    let reports = db.list_reports_by_agent(&agent.id).await?;
    Ok(HttpResponse::Ok().json(AgentDetail { agent, reports }))
}

/// A single agent along with its reports (GET /api/agents/{agent_id})
#[get("/api/agents/{agent_id}")]
async fn agent_info(db: Data<Database>, agent_id: Path<String>) -> Result<HttpResponse, ApiError> {
    __agent_info(db.get_ref(), &agent_id).await
}
