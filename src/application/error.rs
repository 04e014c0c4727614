use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use feedsync_api_types::{ApiErrorBody, ApiErrorMessage};
use thiserror::Error;

use crate::{
    application::{
        context::ContextError, coordinator::SubmissionError, listener::ListenerError,
        ports::GatewayError, workflow::WorkflowError,
    },
    domain::error::DomainError,
    infra::error::InfraError,
};

/// Error chain captured for response logging.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("resource not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<SubmissionError> for AppError {
    fn from(error: SubmissionError) -> Self {
        match error {
            SubmissionError::Validation(err) => AppError::Domain(err),
            SubmissionError::Trigger(err) => AppError::Gateway(err),
        }
    }
}

impl From<WorkflowError> for AppError {
    fn from(error: WorkflowError) -> Self {
        match error {
            WorkflowError::Validation(err) => AppError::Domain(err),
            WorkflowError::Start(err) => AppError::Gateway(err),
        }
    }
}

impl From<ContextError> for AppError {
    fn from(error: ContextError) -> Self {
        match error {
            ContextError::Load { source, .. } => AppError::Gateway(source),
            ContextError::Listener(ListenerError::Subscribe { source, .. }) => {
                AppError::Gateway(source)
            }
            ContextError::Submission(err) => err.into(),
            ContextError::Invalid(err) => AppError::Domain(err),
            ContextError::Write { source, .. } => AppError::Gateway(source),
            other => AppError::unexpected(other.to_string()),
        }
    }
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Gateway(GatewayError::NotFound) | AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Domain(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Gateway(GatewayError::Throttled) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Gateway(GatewayError::Rejected { status, .. }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Gateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Infra(_) | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Gateway(GatewayError::NotFound) | AppError::NotFound => "NOT_FOUND",
            AppError::Domain(_) | AppError::Validation(_) => "VALIDATION_FAILED",
            AppError::Gateway(GatewayError::Throttled) => "THROTTLED",
            AppError::Gateway(_) => "UPSTREAM_FAILED",
            AppError::Infra(_) | AppError::Unexpected(_) => "INTERNAL",
        }
    }

    fn presentation_message(&self) -> String {
        match self {
            AppError::Gateway(GatewayError::NotFound) | AppError::NotFound => {
                "Resource not found".to_string()
            }
            AppError::Domain(err) => err.to_string(),
            AppError::Validation(message) => message.clone(),
            AppError::Gateway(GatewayError::Throttled) => {
                "Too many requests, retry later".to_string()
            }
            AppError::Gateway(_) => "Upstream service failed".to_string(),
            AppError::Infra(_) | AppError::Unexpected(_) => "Unexpected error occurred".to_string(),
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            AppError::Domain(DomainError::Validation { field, .. }) => {
                Some(format!("check the `{field}` field"))
            }
            AppError::Gateway(GatewayError::Throttled) => {
                Some("back off before submitting again".to_string())
            }
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code().to_string(),
                message: self.presentation_message(),
                hint: self.hint(),
            },
        };
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}
