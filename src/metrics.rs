//! Prometheus metrics for the core migrator, plus the HTTP surface that
//! serves them and the liveness probe.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::info;

const NAMESPACE: &str = "storage_migrator";
const SUBSYSTEM: &str = "core_migrator";

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static MIGRATED_OBJECTS: OnceLock<IntCounterVec> = OnceLock::new();
static REMAINING_OBJECTS: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn migrated_objects() -> &'static IntCounterVec {
    MIGRATED_OBJECTS.get_or_init(|| {
        let opts = Opts::new(
            "migrated_objects",
            "The number of objects that have been migrated, labeled with the full resource name.",
        )
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM);
        let counter =
            IntCounterVec::new(opts, &["resource"]).expect("failed to build migrated counter");
        registry()
            .register(Box::new(counter.clone()))
            .expect("failed to register migrated counter");
        counter
    })
}

fn remaining_objects() -> &'static IntGaugeVec {
    REMAINING_OBJECTS.get_or_init(|| {
        let opts = Opts::new(
            "remaining_objects",
            "The number of objects that still require migration, labeled with the full resource name.",
        )
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM);
        let gauge =
            IntGaugeVec::new(opts, &["resource"]).expect("failed to build remaining gauge");
        registry()
            .register(Box::new(gauge.clone()))
            .expect("failed to register remaining gauge");
        gauge
    })
}

/// Count objects migrated for a resource
pub fn observe_objects_migrated(added: u64, resource: &str) {
    migrated_objects().with_label_values(&[resource]).inc_by(added);
}

/// Record how many objects of a resource still await migration
pub fn observe_objects_remaining(count: i64, resource: &str) {
    remaining_objects().with_label_values(&[resource]).set(count);
}

/// Render the registry in the Prometheus text exposition format
pub fn render() -> String {
    // touch the collectors so they exist even before the first observation
    migrated_objects();
    remaining_objects();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&registry().gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler() -> String {
    render()
}

/// Router serving `/metrics` and `/healthz` (the migrator's surface)
pub fn migrator_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
}

/// Router serving only `/healthz` (the trigger's surface)
pub fn healthz_router() -> Router {
    Router::new().route("/healthz", get(healthz))
}

/// Serve a router until the token fires
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_carry_the_namespace_and_subsystem() {
        observe_objects_migrated(3, "v1/pods");
        observe_objects_remaining(7, "v1/pods");

        let rendered = render();
        assert!(rendered.contains("storage_migrator_core_migrator_migrated_objects"));
        assert!(rendered.contains("storage_migrator_core_migrator_remaining_objects"));
        assert!(rendered.contains(r#"resource="v1/pods""#));
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        assert_eq!(healthz().await, "ok");
    }
}
