//! Prometheus metrics and health/metrics HTTP endpoints

#[cfg(feature = "metrics")]
mod inner {
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::{routing::get, Router};
    use once_cell::sync::Lazy;
    use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
    use std::net::SocketAddr;
    use tokio::sync::watch;
    use tracing::{error, info};

    pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

    pub static VERDICTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        let opts = Opts::new("execguard_verdicts_total", "Exec verdicts by outcome and reason");
        let counter = IntCounterVec::new(opts, &["verdict", "reason"]).unwrap();
        REGISTRY.register(Box::new(counter.clone())).unwrap();
        counter
    });

    pub static INVENTORY_BUILDS: Lazy<IntCounterVec> = Lazy::new(|| {
        let opts = Opts::new("execguard_inventory_builds_total", "Rootfs inventory builds by outcome");
        let counter = IntCounterVec::new(opts, &["outcome"]).unwrap();
        REGISTRY.register(Box::new(counter.clone())).unwrap();
        counter
    });

    pub static ACTIVE_MONITORS: Lazy<IntGauge> = Lazy::new(|| {
        let gauge = IntGauge::new("execguard_active_monitors", "Number of running permission monitors").unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    });

    static START_TIME: Lazy<IntGauge> = Lazy::new(|| {
        let gauge = IntGauge::new("execguard_start_time_seconds", "Unix timestamp when execguard started").unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge.set(chrono::Utc::now().timestamp());
        gauge
    });

    async fn metrics_handler() -> String {
        TextEncoder::new()
            .encode_to_string(&REGISTRY.gather())
            .unwrap_or_default()
    }

    async fn ready_handler(State(ready): State<watch::Receiver<bool>>) -> (StatusCode, &'static str) {
        if *ready.borrow() {
            (StatusCode::OK, "READY")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }

    /// Serve health, readiness and metrics until the process exits.
    ///
    /// The verdict and inventory counters only appear once they have a
    /// labelled sample; the gauges are exported from the start.
    pub async fn start_server(addr: SocketAddr, ready_rx: watch::Receiver<bool>) {
        Lazy::force(&START_TIME);
        Lazy::force(&ACTIVE_MONITORS);

        let app = Router::new()
            .route("/health", get(|| async { "OK" }))
            .route("/healthz", get(|| async { "OK" }))
            .route("/ready", get(ready_handler))
            .route("/readyz", get(ready_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(ready_rx);

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server to {}: {}", addr, e);
                return;
            }
        };
        info!("Metrics server listening on {}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    }

}

#[cfg(feature = "metrics")]
pub use inner::*;

// No-op stand-ins when the metrics feature is disabled
#[cfg(not(feature = "metrics"))]
mod stubs {
    use std::net::SocketAddr;
    use tokio::sync::watch;

    pub struct Counter;

    impl Counter {
        pub fn with_label_values(&self, _: &[&str]) -> &Self {
            self
        }

        pub fn inc(&self) {}
    }

    pub struct Gauge;

    impl Gauge {
        pub fn inc(&self) {}
        pub fn dec(&self) {}
    }

    pub static VERDICTS_TOTAL: Counter = Counter;
    pub static INVENTORY_BUILDS: Counter = Counter;
    pub static ACTIVE_MONITORS: Gauge = Gauge;

    pub async fn start_server(_addr: SocketAddr, _ready_rx: watch::Receiver<bool>) {}
}

#[cfg(not(feature = "metrics"))]
pub use stubs::*;
