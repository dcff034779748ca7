//! Structured logging: sinks, runtime level control, secret redaction and
//! the capture ring the external API reads over SSE.

pub mod log_capture;
pub mod redaction;

use std::io::Write;
use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{reload, Layer, Registry};

use crate::config::LoggingConfig;
use crate::errors::{AppError, AppResult};

pub use log_capture::{LogCaptureHandle, LogRecord};

/// Runtime control over the logging stack: the effective level is read on
/// every emit and can be swapped atomically.
#[derive(Clone)]
pub struct LogControl {
    level_handle: reload::Handle<LevelFilter, Registry>,
    capture: LogCaptureHandle,
}

impl LogControl {
    pub fn set_level(&self, level: &str) -> AppResult<()> {
        let filter = LevelFilter::from_str(level)
            .map_err(|_| AppError::validation(format!("unknown log level '{level}'")))?;
        self.level_handle
            .reload(filter)
            .map_err(|e| AppError::internal(format!("failed to update log level: {e}")))?;
        tracing::info!(level, "log level changed");
        Ok(())
    }

    pub fn capture(&self) -> &LogCaptureHandle {
        &self.capture
    }
}

/// Install the global subscriber. Subsequent calls (tests) keep the first
/// subscriber but still return a functional control handle.
pub fn init(config: &LoggingConfig) -> AppResult<LogControl> {
    let initial = LevelFilter::from_str(&config.level)
        .map_err(|_| AppError::validation(format!("unknown log level '{}'", config.level)))?;

    let (level_layer, level_handle) = reload::Layer::new(initial);
    let (capture_layer, capture) = log_capture::LogCaptureLayer::new(config.capture_buffer);

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(RedactingStderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(RedactingStderr)
            .boxed()
    };

    let subscriber = tracing_subscriber::registry()
        .with(level_layer)
        .with(capture_layer)
        .with(fmt_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);

    Ok(LogControl {
        level_handle,
        capture,
    })
}

/// Writer that redacts each rendered record before it reaches stderr.
/// `make_writer` is called per event, so the buffered record is complete
/// when the writer drops.
#[derive(Clone, Copy)]
struct RedactingStderr;

impl<'a> MakeWriter<'a> for RedactingStderr {
    type Writer = RedactingBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingBuffer { buffer: Vec::new() }
    }
}

struct RedactingBuffer {
    buffer: Vec<u8>,
}

impl Write for RedactingBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for RedactingBuffer {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let rendered = String::from_utf8_lossy(&self.buffer);
        let redacted = redaction::redact_line(&rendered);
        let _ = std::io::stderr().write_all(redacted.as_bytes());
    }
}
