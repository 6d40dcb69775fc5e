use axum::{http::StatusCode, response::{IntoResponse, Response}};

use crate::ChatError;

pub type AppResult<T> = Result<T, AppError>;
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        use ChatError::*;
        match self.0.downcast_ref::<ChatError>() {
            Some(Decode(_) | EmptyMessage | EmptyRecording) => StatusCode::BAD_REQUEST,
            Some(NotSignedIn) => StatusCode::UNAUTHORIZED,
            Some(Permission) => StatusCode::FORBIDDEN,
            Some(NotFound(_)) => StatusCode::NOT_FOUND,
            Some(AlreadyRegistered(_)) => StatusCode::CONFLICT,
            Some(Network(_)) => StatusCode::BAD_GATEWAY,
            Some(Device | Storage(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("{:#}", self.0);
            return (status, format!("{}\n\n{}", self.0, self.0.backtrace())).into_response();
        }
        (status, self.0.to_string()).into_response()
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
