//! Contains the error type returned by the endpoints of this application,
//! which wraps the errors of each layer so callers can branch on the cause.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use log::{error, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    db::DbError,
    images::ImageError,
    requests::{FieldProblem, ValidationError},
};

/// A request conflicting with the existing records
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Conflict {
    /// Registration of an id that is already taken
    #[error("agent `{0}` already exists")]
    AgentExists(String),
    /// Reference to an agent that was never registered
    #[error("agent `{0}` is not registered")]
    UnknownAgent(String),
}

/// Everything that can go wrong while handling a request
#[derive(Debug, Error)]
pub enum ApiError {
    /// Digest missing or not matching the body
    #[error("request digest missing or invalid")]
    Auth,
    /// The body is malformed, incomplete or exceeds a limit
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The request conflicts with existing records
    #[error(transparent)]
    Conflict(#[from] Conflict),
    /// The submitted image could not be decoded or stored
    #[error(transparent)]
    Image(#[from] ImageError),
    /// The metadata store failed
    #[error(transparent)]
    Storage(#[from] DbError),
    /// A read of something that does not exist
    #[error("{0} not found")]
    NotFound(String),
}

#[derive(Debug, Serialize)]
struct ErrorMessage<'r> {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'r [FieldProblem]>,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Auth => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(Conflict::AgentExists(_)) => StatusCode::CONFLICT,
            ApiError::Conflict(Conflict::UnknownAgent(_)) => StatusCode::NOT_FOUND,
            ApiError::Image(ImageError::Decode(_) | ImageError::InvalidName(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Image(ImageError::Format(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Image(ImageError::Encode(_) | ImageError::Io(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = if status.is_server_error() {
            error!("failed to handle request: {}", self);
            String::from("Internal Server Error")
        } else {
            warn!("rejected request: {}", self);
            self.to_string()
        };
        let fields = match self {
            ApiError::Validation(e) => Some(e.problems.as_slice()),
            _ => None,
        };
        HttpResponse::build(status).json(ErrorMessage { message, fields })
    }
}
