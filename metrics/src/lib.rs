use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0, 10000.0,
    ]
}

/// Installs the global meter provider exporting over OTLP.
///
/// When metrics are disabled the global no-op provider stays in place, so
/// every meter created by this crate is still safe to use.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: Option<&String>,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let mut resource_builder = Resource::builder()
        .with_attribute(KeyValue::new("service.name", "upload-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ));
    if let Some(instance_id) = instance_id {
        resource_builder = resource_builder.with_attribute(KeyValue::new(
            "service.instance.id",
            instance_id.to_owned(),
        ));
    }
    let resource = resource_builder.build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

/// Increments the wrapped counter when dropped.
pub struct Increment<'a, T: AutoIncrement + Sync> {
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: AutoIncrement + Sync> Increment<'a, T> {
    pub fn inc(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self { metric, labels }
    }
}

impl<'a, T: AutoIncrement + Sync> Drop for Increment<'a, T> {
    fn drop(&mut self) {
        self.metric.increment(self.labels);
    }
}

pub mod upload_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub uploads: Counter<u64>,
        pub upload_failures: Counter<u64>,
        pub upload_bytes: Counter<u64>,
        pub parts: Counter<u64>,
        pub progress_events_dropped: Counter<u64>,
        pub upload_duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("uploads");
            let uploads = meter
                .u64_counter("upload_server.uploads")
                .with_description("number of uploads handled, counted when each ends")
                .build();
            let upload_failures = meter
                .u64_counter("upload_server.upload_failures")
                .with_description("number of uploads aborted")
                .build();
            let upload_bytes = meter
                .u64_counter("upload_server.upload_bytes")
                .with_description("number of bytes written as upload parts")
                .build();
            let parts = meter
                .u64_counter("upload_server.upload_parts")
                .with_description("number of multipart parts uploaded")
                .build();
            let progress_events_dropped = meter
                .u64_counter("upload_server.progress_events_dropped")
                .with_description("progress events not delivered to a channel")
                .build();
            let upload_duration = meter
                .f64_histogram("upload_server.upload_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("end to end upload latencies in seconds")
                .build();
            Metrics {
                uploads,
                upload_failures,
                upload_bytes,
                parts,
                progress_events_dropped,
                upload_duration,
            }
        }
    }
}

pub mod blob_storage {
    use opentelemetry::metrics::Histogram;

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blob-storage");

            let operations = meter
                .f64_histogram("upload_server.blob_operations_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("blob store latencies in seconds")
                .build();

            Metrics { operations }
        }
    }
}

pub mod kv_storage {
    use opentelemetry::metrics::Histogram;

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub reads: Histogram<f64>,
        pub writes: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("kv-storage");

            let reads = meter
                .f64_histogram("upload_server.kv_storage_read_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("K/V store read latencies in seconds")
                .build();

            let writes = meter
                .f64_histogram("upload_server.kv_storage_write_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("k/v store write latencies in seconds")
                .build();

            Metrics { reads, writes }
        }
    }
}
