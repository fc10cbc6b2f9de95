//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use stkbridge_core::Error;
use stkbridge_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Content-Length header required")]
    LengthRequired,

    #[error("{0}")]
    Session(#[from] Error),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("No firmware store configured")]
    NoStore,

    #[error("Control loop is not running")]
    ControlLoopGone,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::LengthRequired => StatusCode::LENGTH_REQUIRED,
            ServerError::Session(Error::Busy) => StatusCode::CONFLICT,
            ServerError::Session(Error::EmptyImage | Error::ImageTooLarge { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ServerError::Store(StoreError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            log::error!("{}", self);
        }

        let body = Json(json!({
            "status": "error",
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
