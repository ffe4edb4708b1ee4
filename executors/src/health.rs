use std::sync::Arc;

use relayer_core::api::{HealthProbe, OrchestrationClient};
use relayer_core::error::OrchestratorError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_result(result: Result<(), OrchestratorError>) -> Self {
        match result {
            Ok(()) => Self {
                status: HealthStatus::Up,
                error: None,
            },
            Err(err) => Self {
                status: HealthStatus::Down,
                error: Some(err.to_string()),
            },
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

/// Readiness over the engine's hard dependencies. The nonce store entry is
/// absent when the deployment runs the in-process backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub status: HealthStatus,
    pub api: ComponentHealth,
    pub broker: ComponentHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce_store: Option<ComponentHealth>,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

pub struct HealthChecker<A, B, N>
where
    A: OrchestrationClient,
    B: HealthProbe,
    N: HealthProbe,
{
    api: Arc<A>,
    broker: Arc<B>,
    nonce_store: Option<Arc<N>>,
}

impl<A, B, N> HealthChecker<A, B, N>
where
    A: OrchestrationClient,
    B: HealthProbe,
    N: HealthProbe,
{
    pub fn new(api: Arc<A>, broker: Arc<B>, nonce_store: Option<Arc<N>>) -> Self {
        Self {
            api,
            broker,
            nonce_store,
        }
    }

    pub async fn check(&self) -> ReadinessReport {
        let api = ComponentHealth::from_result(self.api.search_chains().await.map(|_| ()));
        let broker = ComponentHealth::from_result(self.broker.ping().await);
        let nonce_store = match &self.nonce_store {
            Some(store) => Some(ComponentHealth::from_result(store.ping().await)),
            None => None,
        };

        let all_up = api.is_up()
            && broker.is_up()
            && nonce_store.as_ref().map(|c| c.is_up()).unwrap_or(true);

        ReadinessReport {
            status: if all_up {
                HealthStatus::Up
            } else {
                HealthStatus::Down
            },
            api,
            broker,
            nonce_store,
        }
    }
}
