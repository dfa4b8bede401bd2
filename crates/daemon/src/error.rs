use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::Failure;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything a request handler or background job can fail with.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),
    #[error("invalid api key")]
    Unauthorized,
    #[error("no such order found")]
    NotFound,
    #[error("order already ended")]
    AlreadyEnded,
    #[error("no matching port is currently free")]
    NoCapacity,
    #[error("{0}")]
    Conflict(String),
    #[error("exit ip probe failed: {0}")]
    Probe(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::AlreadyEnded | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
            Error::Probe(_) => StatusCode::BAD_GATEWAY,
            Error::Catalog(_) | Error::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let reason = match &self {
            Error::Db(e) => {
                tracing::error!("database error: {e}");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(Failure { ok: false, reason })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(
            Error::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::AlreadyEnded.status(), StatusCode::CONFLICT);
        assert_eq!(Error::NoCapacity.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            Error::Probe("timeout".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
