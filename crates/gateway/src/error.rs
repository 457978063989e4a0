use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dropcode::{DenyReason, StoreError, VaultError};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("ADMIN_SECRET not configured")]
    SecretNotConfigured,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Unknown or invalid code")]
    UnknownToken,

    #[error("{}", denial_message(.0))]
    Denied(DenyReason),

    #[error("{0}")]
    Vault(#[from] VaultError),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn denial_message(reason: &DenyReason) -> &'static str {
    match reason {
        DenyReason::Exhausted => "No downloads left for this code.",
        DenyReason::Contention => "This code is being redeemed right now, please try again.",
        DenyReason::AssetUnavailable => "Download not available yet.",
    }
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::SecretNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownToken => StatusCode::NOT_FOUND,
            GatewayError::Denied(DenyReason::Exhausted) => StatusCode::GONE,
            GatewayError::Denied(DenyReason::Contention) => StatusCode::CONFLICT,
            GatewayError::Denied(DenyReason::AssetUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Vault(VaultError::EmptyAsset) => StatusCode::BAD_REQUEST,
            GatewayError::Vault(VaultError::Store(StoreError::Source(_))) => StatusCode::BAD_REQUEST,
            GatewayError::Vault(VaultError::Store(_)) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Vault(VaultError::CorruptRecord { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = match &self {
            GatewayError::UnknownToken => json!({
                "success": false,
                "valid": false,
                "error": self.to_string(),
            }),
            GatewayError::Denied(reason) => json!({
                "success": false,
                "error": self.to_string(),
                "reason": reason.as_str(),
                "retriable": reason.is_retriable(),
            }),
            _ => json!({
                "success": false,
                "error": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}
