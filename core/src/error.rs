use std::fmt;

use alloy::transports::{RpcError as AlloyRpcError, TransportErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured kind for chain JSON-RPC failures, so callers can branch without
/// string matching.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// Server returned an error response.
    #[error("server returned an error response: {0}")]
    ErrorResp(RpcErrorResponse),

    /// Server returned a null response when a non-null response was expected.
    #[error("server returned a null response when a non-null response was expected")]
    NullResp,

    /// JSON serialization error.
    #[error("serialization error: {message}")]
    SerError { message: String },

    /// JSON deserialization error.
    #[error("deserialization error: {message}, text: {text}")]
    DeserError { message: String, text: String },

    #[error("HTTP error {status}")]
    TransportHttpError { status: u16, body: String },

    #[error("Other transport error: {message}")]
    OtherTransportError { message: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcErrorResponse {
    /// The error code.
    pub code: i64,
    /// The error message (if any).
    pub message: String,
    /// The error data (if any).
    pub data: Option<String>,
}

impl fmt::Display for RpcErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, ", data: {data}")?;
        }
        Ok(())
    }
}

/// Kind for orchestration API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorKind {
    DependencyFailure,
    InvalidParameter,
    NotFound,
}

#[derive(Error, Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type")]
pub enum OrchestratorError {
    #[error("RPC error on chain {chain_id} at {rpc_url}: {message}")]
    RpcError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Signer error for account {account}: {message}")]
    SignerError {
        account: String,
        message: String,
        /// 4xx-class rejections are permanent, everything else is retryable.
        permanent: bool,
    },

    #[error("Orchestration API error: {message}")]
    ApiError { message: String, kind: ApiErrorKind },

    #[error("Broker error: {message}")]
    BrokerError { message: String },

    #[error("Store error: {message}")]
    StoreError { message: String },

    #[error(
        "Nonce recovery exhausted for account {account} on chain {chain_id} after {attempts} attempts"
    )]
    NonceRecoveryExhausted {
        account: String,
        chain_id: u64,
        attempts: u32,
    },

    #[error("Chain {chain_uuid} is not registered")]
    ChainNotRegistered { chain_uuid: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl OrchestratorError {
    /// True for transient dependency failures that warrant a bounded retry
    /// without advancing job state.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::RpcError { kind, .. } => match kind {
                RpcErrorKind::TransportHttpError { status, .. } => {
                    *status == 429 || *status >= 500
                }
                RpcErrorKind::OtherTransportError { .. } | RpcErrorKind::NullResp => true,
                RpcErrorKind::ErrorResp(resp) => {
                    // Rate limit and generic internal errors from the node.
                    matches!(resp.code, -32005 | -32603)
                }
                _ => false,
            },
            OrchestratorError::SignerError { permanent, .. } => !permanent,
            OrchestratorError::ApiError { kind, .. } => {
                *kind == ApiErrorKind::DependencyFailure
            }
            OrchestratorError::BrokerError { .. } | OrchestratorError::StoreError { .. } => true,
            _ => false,
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        OrchestratorError::StoreError {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        OrchestratorError::InternalError {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::InternalError {
            message: format!("JSON error: {err}"),
        }
    }
}

fn to_rpc_error_kind(err: &AlloyRpcError<TransportErrorKind>) -> RpcErrorKind {
    match err {
        AlloyRpcError::ErrorResp(err) => RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: err.code,
            message: err.message.to_string(),
            data: err.data.as_ref().map(|data| data.to_string()),
        }),
        AlloyRpcError::NullResp => RpcErrorKind::NullResp,
        AlloyRpcError::SerError(err) => RpcErrorKind::SerError {
            message: err.to_string(),
        },
        AlloyRpcError::DeserError { err, text } => RpcErrorKind::DeserError {
            message: err.to_string(),
            text: text.to_string(),
        },
        AlloyRpcError::Transport(err) => match err {
            TransportErrorKind::HttpError(err) => RpcErrorKind::TransportHttpError {
                status: err.status,
                body: err.body.to_string(),
            },
            TransportErrorKind::Custom(err) => RpcErrorKind::OtherTransportError {
                message: err.to_string(),
            },
            _ => RpcErrorKind::OtherTransportError {
                message: err.to_string(),
            },
        },
        _ => RpcErrorKind::OtherTransportError {
            message: err.to_string(),
        },
    }
}

pub trait AlloyRpcErrorToOrchestratorError {
    fn to_orchestrator_error(&self, chain_id: u64, rpc_url: &str) -> OrchestratorError;
}

impl AlloyRpcErrorToOrchestratorError for AlloyRpcError<TransportErrorKind> {
    fn to_orchestrator_error(&self, chain_id: u64, rpc_url: &str) -> OrchestratorError {
        OrchestratorError::RpcError {
            chain_id,
            rpc_url: rpc_url.to_string(),
            message: self.to_string(),
            kind: to_rpc_error_kind(self),
        }
    }
}
