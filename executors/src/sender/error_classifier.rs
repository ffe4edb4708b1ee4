use std::time::Duration;

use relayer_core::error::{OrchestratorError, RpcErrorKind};

/// Broadcast failures the sender must act on, mapped from the node's
/// response before any generic error handling applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// The chain disagrees with our counter; the nonce must be recovered.
    NonceTooLow { message: String },

    /// The transaction is already in the mempool; watch it instead of
    /// treating the send as failed.
    AlreadyKnown { message: String },

    /// A same-nonce transaction with equal or higher gas is already pending.
    ReplacementUnderpriced { message: String },

    /// The sender account cannot cover gas * price + value.
    InsufficientFunds { message: String },

    /// Node or proxy throttling (HTTP 429 or a rate-limit error code).
    Throttled { message: String },

    /// Connectivity-class failure; the payload may or may not have landed.
    Transport { message: String },

    /// The node rejected the payload outright.
    Rejected { message: String },
}

/// How the sender reacts to a classified broadcast failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecovery {
    /// Treat the send as effectively delivered and start the receipt watch.
    pub proceed_to_watch: bool,
    /// Re-sync the nonce from the chain before re-signing.
    pub recover_nonce: bool,
    /// Give the allocated nonce back so the next job reseeds from the chain.
    pub release_nonce: bool,
    /// Retry the same payload after `retry_delay`.
    pub retryable: bool,
    pub retry_delay: Option<Duration>,
}

impl SendRecovery {
    fn permanent() -> Self {
        Self {
            proceed_to_watch: false,
            recover_nonce: false,
            release_nonce: false,
            retryable: false,
            retry_delay: None,
        }
    }
}

pub fn map_broadcast_error(err: &OrchestratorError) -> BroadcastError {
    match err {
        OrchestratorError::RpcError { kind, message, .. } => match kind {
            RpcErrorKind::ErrorResp(resp) => map_node_error(resp.code, &resp.message),
            RpcErrorKind::TransportHttpError { status, .. } if *status == 429 => {
                BroadcastError::Throttled {
                    message: message.clone(),
                }
            }
            RpcErrorKind::TransportHttpError { status, .. } if *status >= 500 => {
                BroadcastError::Transport {
                    message: message.clone(),
                }
            }
            RpcErrorKind::OtherTransportError { .. } | RpcErrorKind::NullResp => {
                BroadcastError::Transport {
                    message: message.clone(),
                }
            }
            _ => BroadcastError::Rejected {
                message: message.clone(),
            },
        },
        err if err.is_transient() => BroadcastError::Transport {
            message: err.to_string(),
        },
        err => BroadcastError::Rejected {
            message: err.to_string(),
        },
    }
}

fn map_node_error(code: i64, message: &str) -> BroadcastError {
    let msg_lower = message.to_lowercase();

    match code {
        -32000 => {
            if msg_lower.contains("nonce too low")
                || msg_lower.contains("invalid nonce")
                || msg_lower.contains("transaction nonce")
            {
                BroadcastError::NonceTooLow {
                    message: message.to_string(),
                }
            } else if msg_lower.contains("already known") || msg_lower.contains("duplicate") {
                BroadcastError::AlreadyKnown {
                    message: message.to_string(),
                }
            } else if msg_lower.contains("replacement") && msg_lower.contains("underpriced") {
                BroadcastError::ReplacementUnderpriced {
                    message: message.to_string(),
                }
            } else if msg_lower.contains("insufficient funds") {
                BroadcastError::InsufficientFunds {
                    message: message.to_string(),
                }
            } else {
                BroadcastError::Rejected {
                    message: message.to_string(),
                }
            }
        }
        // Node-side rate limiting.
        -32005 => BroadcastError::Throttled {
            message: message.to_string(),
        },
        // Generic internal error: the node may recover.
        -32603 => BroadcastError::Transport {
            message: message.to_string(),
        },
        _ => BroadcastError::Rejected {
            message: format!("RPC error code {code}: {message}"),
        },
    }
}

pub fn recovery_for(error: &BroadcastError) -> SendRecovery {
    match error {
        BroadcastError::NonceTooLow { .. } => SendRecovery {
            recover_nonce: true,
            ..SendRecovery::permanent()
        },

        BroadcastError::AlreadyKnown { .. }
        | BroadcastError::ReplacementUnderpriced { .. } => SendRecovery {
            proceed_to_watch: true,
            ..SendRecovery::permanent()
        },

        BroadcastError::InsufficientFunds { .. } => SendRecovery {
            release_nonce: true,
            ..SendRecovery::permanent()
        },

        BroadcastError::Throttled { .. } => SendRecovery {
            retryable: true,
            retry_delay: Some(Duration::from_secs(1)),
            ..SendRecovery::permanent()
        },

        BroadcastError::Transport { .. } => SendRecovery {
            retryable: true,
            retry_delay: Some(Duration::from_secs(1)),
            ..SendRecovery::permanent()
        },

        BroadcastError::Rejected { .. } => SendRecovery::permanent(),
    }
}

impl BroadcastError {
    pub fn message(&self) -> &str {
        match self {
            BroadcastError::NonceTooLow { message }
            | BroadcastError::AlreadyKnown { message }
            | BroadcastError::ReplacementUnderpriced { message }
            | BroadcastError::InsufficientFunds { message }
            | BroadcastError::Throttled { message }
            | BroadcastError::Transport { message }
            | BroadcastError::Rejected { message } => message,
        }
    }
}
