use axum::{
    Json,
    extract::rejection::{
        JsonRejection,
        QueryRejection,
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    analytics::AnalyticsError,
    quota::QuotaError,
    store::StoreError,
};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("counter store unavailable: {0}")]
    BackendUnavailable(#[source] StoreError),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownResource(_) => "unknown_resource",
            Self::BackendUnavailable(_) => "backend_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::UnknownResource(_) => StatusCode::BAD_REQUEST,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::BackendUnavailable(err) = &self {
            tracing::warn!(error = %err, "request failed: counter store unavailable");
        }

        let status = self.status();
        let mut response = (status, Json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
        }))
            .into_response();

        if !response.headers().contains_key(header::CONTENT_TYPE) {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::BackendUnavailable(err)
    }
}

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::UnknownResource(resource) => Self::UnknownResource(resource),
            QuotaError::InvalidAmount => Self::InvalidRequest(QuotaError::InvalidAmount.to_string()),
            QuotaError::Store(err) => Self::BackendUnavailable(err),
        }
    }
}

impl From<AnalyticsError> for ApiError {
    fn from(err: AnalyticsError) -> Self {
        match err {
            AnalyticsError::InvalidRange => {
                Self::InvalidRequest(AnalyticsError::InvalidRange.to_string())
            }
            AnalyticsError::Store(err) => Self::BackendUnavailable(err),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}
