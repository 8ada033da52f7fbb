use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_core::multiplexer::MuxError;
use relay_core::store::StoreError;
use relay_core::RelayError;

// ---------------------------------------------------------------------------
// Internal sentinel for explicit 400 Bad Request errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError — unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<BadRequestError>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        if self.0.downcast_ref::<MuxError>().is_some() {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        let store = match self.0.downcast_ref::<RelayError>() {
            Some(RelayError::Store(e)) => Some(e),
            Some(RelayError::Malformed { .. }) | Some(RelayError::UnexpectedMessage { .. }) => {
                return StatusCode::BAD_REQUEST
            }
            Some(RelayError::MultiplexerClosed) => return StatusCode::SERVICE_UNAVAILABLE,
            Some(_) => return StatusCode::INTERNAL_SERVER_ERROR,
            None => self.0.downcast_ref::<StoreError>(),
        };
        match store {
            Some(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(StoreError::VersionConflict { .. }) => StatusCode::CONFLICT,
            Some(StoreError::Transport(_)) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %format!("{:#}", self.0), "request failed");
        }
        let body = serde_json::json!({ "error": format!("{:#}", self.0) });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
