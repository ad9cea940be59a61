//! Prometheus metrics for the suc controllers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobApplyLabels {
    pub plan: String,
    pub action: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PlanLabels {
    pub plan: String,
}

/// All Prometheus metrics for the controller.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<ControllerLabels, Histogram>,
    pub jobs_applied_total: Family<JobApplyLabels, Counter>,
    pub node_upgrades_total: Family<PlanLabels, Counter>,
    pub node_update_conflicts_total: Counter,
}

const RECONCILE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "suc_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(RECONCILE_BUCKETS.iter().copied())
            });
        registry.register(
            "suc_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
            reconcile_duration_seconds.clone(),
        );

        let jobs_applied_total = Family::<JobApplyLabels, Counter>::default();
        registry.register(
            "suc_jobs_applied",
            "Upgrade jobs handled by the apply layer, by action (created, unchanged, replaced)",
            jobs_applied_total.clone(),
        );

        let node_upgrades_total = Family::<PlanLabels, Counter>::default();
        registry.register(
            "suc_node_upgrades",
            "Nodes labeled with a plan hash after a successful job",
            node_upgrades_total.clone(),
        );

        let node_update_conflicts_total = Counter::default();
        registry.register(
            "suc_node_update_conflicts",
            "Node writes rejected with a conflict and retried",
            node_update_conflicts_total.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            jobs_applied_total,
            node_upgrades_total,
            node_update_conflicts_total,
        }
    }

    pub fn record_reconcile(&self, controller: &str, result: &str) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                controller: controller.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    pub fn observe_reconcile(&self, controller: &str, elapsed: Duration) {
        self.reconcile_duration_seconds
            .get_or_create(&ControllerLabels {
                controller: controller.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_job_applied(&self, plan: &str, action: &str) {
        self.jobs_applied_total
            .get_or_create(&JobApplyLabels {
                plan: plan.to_string(),
                action: action.to_string(),
            })
            .inc();
    }

    /// Count a labeled node and the conflicts it took to get there.
    pub fn record_node_upgrade(&self, plan: &str, conflicts: u32) {
        self.node_upgrades_total
            .get_or_create(&PlanLabels {
                plan: plan.to_string(),
            })
            .inc();
        self.record_node_update_conflicts(conflicts);
    }

    pub fn record_node_update_conflicts(&self, conflicts: u32) {
        if conflicts > 0 {
            self.node_update_conflicts_total.inc_by(u64::from(conflicts));
        }
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(registry: &Registry) -> String {
        let mut buf = String::new();
        encode(&mut buf, registry).unwrap();
        buf
    }

    #[test]
    fn test_reconcile_metrics_encoding() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);

        metrics.record_reconcile("plan", "success");
        metrics.record_reconcile("job", "error");
        metrics.observe_reconcile("plan", Duration::from_millis(42));

        let buf = encoded(&registry);
        assert!(buf.contains(r#"suc_reconcile_total{controller="plan",result="success"} 1"#));
        assert!(buf.contains(r#"suc_reconcile_total{controller="job",result="error"} 1"#));
        assert!(buf.contains("suc_reconcile_duration_seconds_bucket{"));
        assert!(buf.contains("suc_reconcile_duration_seconds_count{"));
    }

    #[test]
    fn test_job_and_node_metrics() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);

        metrics.record_job_applied("k3s-latest", "created");
        metrics.record_job_applied("k3s-latest", "created");
        metrics.record_node_upgrade("k3s-latest", 2);
        metrics.record_node_upgrade("k3s-latest", 0);

        let buf = encoded(&registry);
        assert!(buf.contains(r#"suc_jobs_applied_total{plan="k3s-latest",action="created"} 2"#));
        assert!(buf.contains(r#"suc_node_upgrades_total{plan="k3s-latest"} 2"#));
        assert!(buf.contains("suc_node_update_conflicts_total 2"));
    }

    #[test]
    fn test_type_declarations() {
        let mut registry = Registry::default();
        let _metrics = Metrics::new(&mut registry);

        let buf = encoded(&registry);
        assert!(buf.contains("# TYPE suc_reconcile counter"));
        assert!(buf.contains("# TYPE suc_reconcile_duration_seconds histogram"));
        assert!(buf.contains("# TYPE suc_jobs_applied counter"));
        assert!(buf.contains("# TYPE suc_node_upgrades counter"));
        assert!(buf.contains("# TYPE suc_node_update_conflicts counter"));
        assert!(buf.ends_with("# EOF\n"), "missing EOF marker");
    }
}
