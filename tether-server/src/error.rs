use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sled::transaction::TransactionError;
use tether_common::{ProtocolError, Username};

pub type Result<T> = std::result::Result<T, AppError>;

/// Error returned by the HTTP handlers.
pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    pub fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        Self { status, error: error.into() }
    }

    pub fn unknown_player(username: impl AsRef<str>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            anyhow::anyhow!("no player named {:?}", username.as_ref()),
        )
    }
}

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, format!("Something went wrong: {}", self.error)).into_response()
    }
}

// This enables using `?` on anything convertible into `anyhow::Error`. Known
// domain errors pick their own status, everything else is a 500.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        let directory = error.downcast_ref::<DirectoryError>().or_else(|| {
            match error.downcast_ref::<RouterError>() {
                Some(RouterError::Directory(directory)) => Some(directory),
                _ => None,
            }
        });
        let status = if let Some(directory) = directory {
            match directory {
                DirectoryError::UsernameTaken(_) | DirectoryError::AliasTaken(_) => StatusCode::CONFLICT,
                DirectoryError::NotFound(_) => StatusCode::NOT_FOUND,
                DirectoryError::InvalidAlias(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else if error.is::<ProtocolError>() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self { status, error }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("corrupt relations record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("a player cannot befriend themselves")]
    SelfRelation,
    #[error("{0} and {1} are already friends")]
    AlreadyFriends(Username, Username),
    #[error("{0} already has relations")]
    IdentityInUse(Username),
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(err: TransactionError<StoreError>) -> Self {
        match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => StoreError::Storage(err),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("corrupt player record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("username {0} is already used")]
    UsernameTaken(Username),
    #[error("tournament alias {0:?} is already used")]
    AliasTaken(String),
    #[error("tournament alias {0:?} is not a valid name")]
    InvalidAlias(String),
    #[error("no player named {0}")]
    NotFound(Username),
}

impl From<TransactionError<DirectoryError>> for DirectoryError {
    fn from(err: TransactionError<DirectoryError>) -> Self {
        match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => DirectoryError::Storage(err),
        }
    }
}

/// Failure of a router operation. The operation left no partial state behind.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl From<TransactionError<RouterError>> for RouterError {
    fn from(err: TransactionError<RouterError>) -> Self {
        match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => RouterError::Store(StoreError::Storage(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(error: impl Into<anyhow::Error>) -> StatusCode {
        AppError::from(error).into_response().status()
    }

    #[test]
    fn domain_errors_map_to_statuses() {
        let bob = Username::parse("bob").unwrap();
        assert_eq!(status_of(DirectoryError::UsernameTaken(bob.clone())), StatusCode::CONFLICT);
        assert_eq!(status_of(DirectoryError::NotFound(bob)), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ProtocolError::NotACommand), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(StoreError::SelfRelation), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(AppError::unknown_player("x").into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn directory_errors_keep_status_through_router() {
        let bob = Username::parse("bob").unwrap();
        let wrapped = RouterError::from(DirectoryError::UsernameTaken(bob.clone()));
        assert_eq!(status_of(wrapped), StatusCode::CONFLICT);
        assert_eq!(status_of(RouterError::from(DirectoryError::NotFound(bob))), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(RouterError::from(StoreError::SelfRelation)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
