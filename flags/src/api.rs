use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("flag not found")]
    NotFound,
    #[error("flag already exists")]
    Conflict,
    #[error("invalid flag definition: {0}")]
    Validation(String),
    #[error("user_id is required")]
    MissingUserId,
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),

    #[error("database unavailable")]
    DatabaseUnavailable,
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        match self {
            FlagError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            FlagError::Conflict => (StatusCode::CONFLICT, self.to_string()),

            FlagError::Validation(_)
            | FlagError::MissingUserId
            | FlagError::RequestParsingError(_) => (StatusCode::BAD_REQUEST, self.to_string()),

            FlagError::DatabaseUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
        }
        .into_response()
    }
}
