use prometheus::{
    IntCounterVec, IntGaugeVec, Opts, Registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry,
};

/// Engine metrics, scoped to the provided registry.
pub struct OrchestratorMetrics {
    pub jobs_mined: IntCounterVec,
    pub jobs_failed: IntCounterVec,
    pub jobs_resent: IntCounterVec,
    pub jobs_escalated: IntCounterVec,
    pub current_block: IntGaugeVec,
}

impl OrchestratorMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let jobs_mined = register_int_counter_vec_with_registry!(
            Opts::new("relayer_jobs_mined_total", "Jobs confirmed mined on chain"),
            &["chain"],
            registry
        )?;

        let jobs_failed = register_int_counter_vec_with_registry!(
            Opts::new(
                "relayer_jobs_failed_total",
                "Jobs that reached a terminal failure"
            ),
            &["chain"],
            registry
        )?;

        let jobs_resent = register_int_counter_vec_with_registry!(
            Opts::new(
                "relayer_jobs_resent_total",
                "Same-payload resends of stalled or throttled transactions"
            ),
            &["chain"],
            registry
        )?;

        let jobs_escalated = register_int_counter_vec_with_registry!(
            Opts::new(
                "relayer_jobs_escalated_total",
                "Gas-escalated child jobs spawned for stalled transactions"
            ),
            &["chain"],
            registry
        )?;

        let current_block = register_int_gauge_vec_with_registry!(
            Opts::new(
                "relayer_chain_current_block",
                "Latest settled block processed per chain"
            ),
            &["chain"],
            registry
        )?;

        Ok(Self {
            jobs_mined,
            jobs_failed,
            jobs_resent,
            jobs_escalated,
            current_block,
        })
    }

    /// Metrics backed by a private registry, for tests and tooling that do
    /// not export.
    pub fn detached() -> Result<Self, prometheus::Error> {
        Self::new(&Registry::new())
    }
}
