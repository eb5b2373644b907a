//! Metrics collection and exposition.
//!
//! # Metrics
//! - `brokerd_connections_accepted_total` (counter)
//! - `brokerd_accept_errors_total` (counter): by `class`
//! - `brokerd_handshake_failures_total` (counter): by `reason`
//! - `brokerd_io_loop_errors_total` (counter)
//! - `brokerd_clients_connected` (gauge): current registry size
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder with an HTTP scrape endpoint on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_connection_accepted() {
    metrics::counter!("brokerd_connections_accepted_total").increment(1);
}

pub fn record_accept_error(class: &'static str) {
    metrics::counter!("brokerd_accept_errors_total", "class" => class).increment(1);
}

pub fn record_handshake_failure(reason: &'static str) {
    metrics::counter!("brokerd_handshake_failures_total", "reason" => reason).increment(1);
}

pub fn record_io_loop_error() {
    metrics::counter!("brokerd_io_loop_errors_total").increment(1);
}

pub fn record_client_registered() {
    metrics::gauge!("brokerd_clients_connected").increment(1.0);
}

pub fn record_client_deregistered() {
    metrics::gauge!("brokerd_clients_connected").decrement(1.0);
}

/// In-memory recorder for asserting on emitted metrics.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use metrics::{Counter, CounterFn, Gauge, GaugeFn, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};

    #[derive(Default)]
    struct Cell(Mutex<f64>);

    impl Cell {
        fn update(&self, f: impl FnOnce(&mut f64)) {
            f(&mut self.0.lock().unwrap());
        }
    }

    impl CounterFn for Cell {
        fn increment(&self, value: u64) {
            self.update(|v| *v += value as f64);
        }

        fn absolute(&self, value: u64) {
            self.update(|v| *v = value as f64);
        }
    }

    impl GaugeFn for Cell {
        fn increment(&self, value: f64) {
            self.update(|v| *v += value);
        }

        fn decrement(&self, value: f64) {
            self.update(|v| *v -= value);
        }

        fn set(&self, value: f64) {
            self.update(|v| *v = value);
        }
    }

    /// Sums every series by metric name, ignoring labels.
    #[derive(Clone, Default)]
    pub(crate) struct CaptureRecorder {
        cells: Arc<Mutex<HashMap<String, Arc<Cell>>>>,
    }

    impl CaptureRecorder {
        fn cell(&self, key: &Key) -> Arc<Cell> {
            let mut cells = self.cells.lock().unwrap();
            Arc::clone(cells.entry(key.name().to_string()).or_default())
        }

        pub(crate) fn value(&self, name: &str) -> f64 {
            let cells = self.cells.lock().unwrap();
            cells.get(name).map(|cell| *cell.0.lock().unwrap()).unwrap_or(0.0)
        }
    }

    impl Recorder for CaptureRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            Counter::from_arc(self.cell(key))
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::from_arc(self.cell(key))
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }
}
