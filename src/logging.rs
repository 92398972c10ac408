//! Structured logging
//!
//! JSON output outside development, pretty output locally. Security and
//! protocol events are emitted as structured `LogEvent`s so they can be
//! filtered by target (`tss::security`, `tss::protocol`).

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Commit-reveal verification and identity checks
    Security,
    /// Stage transitions of the MPC protocols
    Protocol,
    /// Key-share node fan-out
    Keyshare,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEvent {
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: format!("{:?}", level).to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}", self.message)
        })
    }
}

/// Log a security-related event (commit-reveal accept/reject)
pub fn log_security_event(
    event_type: &str,
    success: bool,
    details: serde_json::Value,
    correlation_id: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Security, event_type)
        .with_data(serde_json::json!({ "success": success, "details": details }));
    if let Some(id) = correlation_id {
        event = event.with_correlation_id(id);
    }

    if success {
        tracing::info!(target: "tss::security", "{}", event.to_json());
    } else {
        tracing::warn!(target: "tss::security", "{}", event.to_json());
    }
}

/// Log a stage transition
pub fn log_protocol_event(stage: &str, status: &str, session_id: &str) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Protocol, format!("{} -> {}", stage, status))
        .with_correlation_id(session_id);
    tracing::info!(target: "tss::protocol", "{}", event.to_json());
}

/// Log the outcome of a fan-out to key-share nodes
pub fn log_keyshare_event(operation: &str, succeeded: usize, failed: usize, correlation_id: Option<&str>) {
    let level = if failed == 0 { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Keyshare, operation)
        .with_data(serde_json::json!({ "succeeded": succeeded, "failed": failed }));
    if let Some(id) = correlation_id {
        event = event.with_correlation_id(id);
    }

    if failed == 0 {
        tracing::info!(target: "tss::keyshare", "{}", event.to_json());
    } else {
        tracing::warn!(target: "tss::keyshare", "{}", event.to_json());
    }
}

/// Initialize the global subscriber once
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let level_str = format!("{:?}", level).to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tss={lvl},tss_server={lvl},tower_http={lvl},axum={lvl}",
            lvl = level_str
        ))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_target(true).with_file(true).with_line_number(true))
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent::new(LogLevel::Warn, EventCategory::Security, "reveal_rejected")
            .with_correlation_id("cr-123")
            .with_data(serde_json::json!({"code": "INVALID_SIGNATURE"}));

        let json = event.to_json();
        assert!(json.contains("reveal_rejected"));
        assert!(json.contains("cr-123"));
        assert!(json.contains("\"security\""));
        assert!(json.contains("WARN"));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::from("nonsense"), LogLevel::Info);
    }
}
