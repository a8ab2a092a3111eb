use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use serde::{Deserialize, Serialize};
use tracing::warn;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const LOG_FILE_NAME: &str = "nodeflow.log";
pub const SERVICE_NAME: &str = "nodeflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// Map the numeric levels used by node backends
    /// (1 critical, 2 error, 3 warning, 4 info, 5 debug, anything above trace).
    pub fn from_level_number(level: i64) -> Self {
        match level {
            i64::MIN..=1 => LogLevel::Critical,
            2 => LogLevel::Error,
            3 => LogLevel::Warn,
            4 => LogLevel::Info,
            5 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn level_number(self) -> i64 {
        match self {
            LogLevel::Critical => 1,
            LogLevel::Error => 2,
            LogLevel::Warn => 3,
            LogLevel::Info => 4,
            LogLevel::Debug => 5,
            LogLevel::Trace => 6,
        }
    }
}

/// Emit a log line on behalf of a node.
pub fn log_for_node(node_id: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(%node_id, "{message}"),
        LogLevel::Debug => tracing::debug!(%node_id, "{message}"),
        LogLevel::Info => tracing::info!(%node_id, "{message}"),
        LogLevel::Warn => tracing::warn!(%node_id, "{message}"),
        LogLevel::Error => tracing::error!(%node_id, "{message}"),
        LogLevel::Critical => tracing::error!(%node_id, "[CRITICAL] {message}"),
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource())
        .build())
}

/// Filter for the OTLP log bridge. The exporter's own HTTP stack is muted so
/// exporting never feeds back into itself.
fn export_filter(log_level: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::new(log_level);
    for quiet in ["hyper=off", "tonic=off", "h2=off", "reqwest=off", "opentelemetry=off"] {
        filter = filter.add_directive(quiet.parse()?);
    }
    Ok(filter)
}

/// Providers installed by `init_tracing`. Both are `None` when no OTLP
/// endpoint is configured; metric instruments then record into the global
/// no-op provider.
#[derive(Debug, Default)]
pub struct Telemetry {
    pub logger_provider: Option<SdkLoggerProvider>,
    pub meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn is_exporting(&self) -> bool {
        self.meter_provider.is_some()
    }

    /// Flush and stop the exporters.
    pub fn shutdown(&self) {
        if let Some(provider) = &self.meter_provider {
            if let Err(e) = provider.shutdown() {
                warn!(error = ?e, "metric exporter shutdown failed");
            }
        }
        if let Some(provider) = &self.logger_provider {
            if let Err(e) = provider.shutdown() {
                warn!(error = ?e, "log exporter shutdown failed");
            }
        }
    }
}

/// Install the global subscriber: stderr always, plus a daily rolling text
/// file when `log_dir` is set. `RUST_LOG` wins over `log_level`. With an
/// `otel_endpoint`, logs are also bridged to OTLP/HTTP and the global meter
/// provider exports there.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>, otel_endpoint: Option<&str>) -> Result<Telemetry> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_target(false);

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_NAME);
            Some(
                fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_thread_names(true),
            )
        }
        None => None,
    };

    let telemetry = match otel_endpoint {
        Some(endpoint) => Telemetry {
            logger_provider: Some(init_logs(endpoint)?),
            meter_provider: Some(init_metrics(endpoint)?),
        },
        None => Telemetry::default(),
    };
    let otel_layer = match &telemetry.logger_provider {
        Some(provider) => Some(OpenTelemetryTracingBridge::new(provider).with_filter(export_filter(log_level)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(otel_layer)
        .try_init()?;

    if let Some(provider) = &telemetry.meter_provider {
        global::set_meter_provider(provider.clone());
    }
    Ok(telemetry)
}
