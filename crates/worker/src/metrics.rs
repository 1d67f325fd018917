use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use chart_snap_common::{CoordinatorStats, PoolStats};
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    service: String,
    pub requests_total: IntCounterVec,
    pub cache_hits_total: IntCounterVec,
    pub joins_total: IntCounterVec,
    pub captures_total: IntCounterVec,
    /// Labelled by service and error code.
    pub failures_total: IntCounterVec,
    pub active_sessions: IntGaugeVec,
    pub running_tasks: IntGaugeVec,
}

impl Metrics {
    pub fn new(service_name: &str) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounterVec::new(
            Opts::new(
                "chart_snap_requests_total",
                "Screenshot requests received",
            ),
            &["service"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let cache_hits_total = IntCounterVec::new(
            Opts::new(
                "chart_snap_cache_hits_total",
                "Requests answered from the CDN without capturing",
            ),
            &["service"],
        )?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let joins_total = IntCounterVec::new(
            Opts::new(
                "chart_snap_joins_total",
                "Requests answered by waiting on an in-flight capture",
            ),
            &["service"],
        )?;
        registry.register(Box::new(joins_total.clone()))?;

        let captures_total = IntCounterVec::new(
            Opts::new(
                "chart_snap_captures_total",
                "Charts captured and uploaded",
            ),
            &["service"],
        )?;
        registry.register(Box::new(captures_total.clone()))?;

        let failures_total = IntCounterVec::new(
            Opts::new("chart_snap_failures_total", "Failed screenshot requests"),
            &["service", "code"],
        )?;
        registry.register(Box::new(failures_total.clone()))?;

        // Browser sessions currently leased from the pool
        let active_sessions = IntGaugeVec::new(
            Opts::new(
                "chart_snap_active_sessions",
                "Browser sessions currently in use",
            ),
            &["service"],
        )?;
        registry.register(Box::new(active_sessions.clone()))?;

        let running_tasks = IntGaugeVec::new(
            Opts::new(
                "chart_snap_running_tasks",
                "Deduplicated capture tasks currently running",
            ),
            &["service"],
        )?;
        registry.register(Box::new(running_tasks.clone()))?;

        active_sessions.with_label_values(&[service_name]).set(0);
        running_tasks.with_label_values(&[service_name]).set(0);

        Ok(Self {
            registry,
            service: service_name.to_string(),
            requests_total,
            cache_hits_total,
            joins_total,
            captures_total,
            failures_total,
            active_sessions,
            running_tasks,
        })
    }

    pub fn record_request(&self) {
        self.requests_total.with_label_values(&[&self.service]).inc();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.with_label_values(&[&self.service]).inc();
    }

    pub fn record_join(&self) {
        self.joins_total.with_label_values(&[&self.service]).inc();
    }

    pub fn record_capture(&self) {
        self.captures_total.with_label_values(&[&self.service]).inc();
    }

    pub fn record_failure(&self, code: &str) {
        self.failures_total
            .with_label_values(&[&self.service, code])
            .inc();
    }

    pub fn update_pool(&self, stats: &PoolStats) {
        self.active_sessions
            .with_label_values(&[&self.service])
            .set(stats.active_sessions as i64);
    }

    pub fn update_tasks(&self, stats: &CoordinatorStats) {
        self.running_tasks
            .with_label_values(&[&self.service])
            .set(stats.running as i64);
    }

    /// Sum of failures over every error code.
    pub fn failures(&self) -> u64 {
        self.failures_total
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .filter(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == "service" && l.get_value() == self.service)
            })
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }

    pub fn counter(&self, counter: &IntCounterVec) -> u64 {
        counter.with_label_values(&[&self.service]).get()
    }

    /// Start HTTP server for Prometheus metrics on specified port
    pub async fn start_server(self, port: u16) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self);

        let addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Metrics server listening on {}", addr);

        axum::serve(listener, app).await?;

        Ok(())
    }

    fn render(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Metrics>,
) -> impl IntoResponse {
    match metrics.render() {
        Ok(buffer) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_service() {
        let metrics = Metrics::new("charts").unwrap();
        metrics.record_request();
        metrics.record_request();
        metrics.record_cache_hit();
        metrics.record_failure("capture_failed");
        metrics.record_failure("upload_failed");

        assert_eq!(metrics.counter(&metrics.requests_total), 2);
        assert_eq!(metrics.counter(&metrics.cache_hits_total), 1);
        assert_eq!(metrics.counter(&metrics.captures_total), 0);
        assert_eq!(metrics.failures(), 2);
    }

    #[test]
    fn test_render_exposes_gauges() {
        let metrics = Metrics::new("charts").unwrap();
        metrics.update_pool(&PoolStats {
            active_sessions: 3,
            ..Default::default()
        });
        metrics.update_tasks(&CoordinatorStats {
            running: 2,
            ..Default::default()
        });

        let text = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(text.contains("chart_snap_active_sessions{service=\"charts\"} 3"));
        assert!(text.contains("chart_snap_running_tasks{service=\"charts\"} 2"));
    }
}
