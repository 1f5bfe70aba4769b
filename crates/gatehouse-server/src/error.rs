//! HTTP error mapping.
//!
//! Domain errors from the library crates map onto one [`AppError`] whose
//! variants mirror the gateway's error taxonomy. Every response body is
//! JSON `{error, message}`. Internal failures are logged with their real
//! cause and answered with a generic message — no stack traces, no other
//! principals' identifiers, no secret material.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use gatehouse_broker::BrokerError;
use gatehouse_core::error::{AuthError, PermissionError, SsoError, VaultError};
use gatehouse_core::ratelimit::RateLimited;
use gatehouse_storage::StoreError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// 400 — the client sent invalid input.
    InvalidInput(String),
    /// 401 — missing or invalid credentials/token.
    Unauthenticated(String),
    /// 403 — authenticated but not allowed.
    Forbidden(String),
    /// 404.
    NotFound(String),
    /// 409 — unique violation or state conflict.
    Conflict(String),
    /// 410 — the session or token is expired or revoked.
    Gone(String),
    /// 429 with `Retry-After`.
    RateLimited { retry_after: Duration },
    /// 429 — per-user concurrent live-session limit.
    ConcurrencyExceeded(String),
    /// 503 — the protocol driver is unavailable or refused the launch.
    Unavailable(String),
    /// 500 — logged, never detailed to the client.
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg),
            Self::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, "unauthenticated", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::Gone(msg) => (StatusCode::GONE, "gone", msg),
            Self::RateLimited { retry_after } => {
                let body = ErrorBody {
                    error: "rate_limited",
                    message: "too many requests".to_owned(),
                };
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
                if let Ok(value) =
                    HeaderValue::from_str(&retry_after.as_secs().max(1).to_string())
                {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return response;
            }
            Self::ConcurrencyExceeded(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "concurrency_exceeded", msg)
            }
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            Self::Internal(msg) => {
                error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => {
                Self::Unauthenticated("invalid credentials".to_owned())
            }
            AuthError::LockedOut => Self::Forbidden(err.to_string()),
            AuthError::MfaRequired => Self::Unauthenticated(err.to_string()),
            AuthError::NotFound => Self::NotFound("session not found".to_owned()),
            AuthError::Expired | AuthError::Revoked => Self::Gone(err.to_string()),
            AuthError::RateLimited { retry_after } => Self::RateLimited { retry_after },
            AuthError::Token { .. } => Self::Unauthenticated("invalid token".to_owned()),
            AuthError::Crypto(inner) => Self::Internal(inner.to_string()),
            AuthError::Store(inner) => Self::from(inner),
        }
    }
}

impl From<PermissionError> for AppError {
    fn from(err: PermissionError) -> Self {
        match err {
            PermissionError::UnknownPermission { .. } => Self::InvalidInput(err.to_string()),
            PermissionError::SystemRole { .. } => Self::Forbidden(err.to_string()),
            PermissionError::DuplicateId { .. }
            | PermissionError::UnknownReference { .. }
            | PermissionError::DependencyCycle { .. } => Self::Internal(err.to_string()),
            PermissionError::Store(inner) => Self::from(inner),
        }
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound => Self::NotFound(err.to_string()),
            VaultError::Forbidden => Self::Forbidden(err.to_string()),
            VaultError::NameTaken { .. } => Self::Conflict(err.to_string()),
            VaultError::Crypto(inner) => Self::Internal(inner.to_string()),
            VaultError::Store(inner) => Self::from(inner),
        }
    }
}

impl From<SsoError> for AppError {
    fn from(err: SsoError) -> Self {
        match err {
            SsoError::EmailRequired => Self::InvalidInput(err.to_string()),
            SsoError::ProviderMismatch { .. } | SsoError::ProvisioningDisabled => {
                Self::Forbidden(err.to_string())
            }
            SsoError::UsernameExhausted { .. } => Self::Conflict(err.to_string()),
            SsoError::Auth(inner) => Self::from(inner),
            SsoError::Store(inner) => Self::from(inner),
        }
    }
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Forbidden | BrokerError::NotOwner => Self::Forbidden(err.to_string()),
            BrokerError::NotFound | BrokerError::NotParticipant | BrokerError::NotRecording => {
                Self::NotFound(err.to_string())
            }
            BrokerError::ConcurrencyExceeded { .. } => {
                Self::ConcurrencyExceeded(err.to_string())
            }
            BrokerError::DriverUnavailable { .. } | BrokerError::Closed => {
                Self::Unavailable(err.to_string())
            }
            BrokerError::LaunchFailed { ref source, .. } => {
                // Driver reason retained for logs, driver id for the client.
                error!(error = %source, "driver launch failed");
                Self::Unavailable(err.to_string())
            }
            BrokerError::WriteTokenRaced | BrokerError::DuplicateDriver { .. } => {
                Self::Conflict(err.to_string())
            }
            BrokerError::RecordingUnavailable { .. } => Self::Unavailable(err.to_string()),
            BrokerError::Vault(inner) => Self::from(inner),
            BrokerError::Store(inner) => Self::from(inner),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => Self::Conflict(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<RateLimited> for AppError {
    fn from(err: RateLimited) -> Self {
        Self::RateLimited {
            retry_after: err.retry_after,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(
            status_of(AppError::from(AuthError::InvalidCredentials)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(AppError::from(AuthError::Expired)),
            StatusCode::GONE
        );
        assert_eq!(
            status_of(AppError::from(AuthError::Revoked)),
            StatusCode::GONE
        );
        assert_eq!(
            status_of(AppError::from(VaultError::Forbidden)),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(AppError::from(BrokerError::ConcurrencyExceeded { limit: 3 })),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(AppError::from(BrokerError::DriverUnavailable {
                driver: "ssh".to_owned()
            })),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(AppError::from(StoreError::Conflict {
                what: "users.email".to_owned()
            })),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let response = AppError::from(RateLimited {
            retry_after: Duration::from_secs(42),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("42")
        );
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let response = AppError::Internal("connection string postgres://user:pw@host".to_owned())
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
