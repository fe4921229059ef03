//! Engine log capture.
//!
//! Engines write one compact JSON object per line on stdout:
//! `{"@t": "...", "@m": "...", "@l": "Warning", "@x": "...", "@i": "..."}`.
//! A missing `@l` means information. Anything that is not JSON is passed on
//! as a raw line.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Engine log level, also used for the `--log-severity` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            LogSeverity::Debug => "debug",
            LogSeverity::Info => "info",
            LogSeverity::Warn => "warn",
            LogSeverity::Error => "error",
            LogSeverity::Fatal => "fatal",
        }
    }

    /// Map an `@l` value. Accepts both long (`Warning`) and short (`warn`) names.
    pub fn from_level_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "verbose" | "trace" | "debug" => Some(LogSeverity::Debug),
            "information" | "info" => Some(LogSeverity::Info),
            "warning" | "warn" => Some(LogSeverity::Warn),
            "error" => Some(LogSeverity::Error),
            "fatal" | "critical" => Some(LogSeverity::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogSeverity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        LogSeverity::from_level_name(s).ok_or_else(|| format!("unknown log severity '{s}'"))
    }
}

/// One structured log line from an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonLogLine {
    #[serde(rename = "@t", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "@m", alias = "@mt", default)]
    pub message: String,
    #[serde(rename = "@l", default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(rename = "@x", default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(rename = "@i", default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl JsonLogLine {
    pub fn new(severity: LogSeverity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: match severity {
                LogSeverity::Info => None,
                LogSeverity::Debug => Some("Debug".to_string()),
                LogSeverity::Warn => Some("Warning".to_string()),
                LogSeverity::Error => Some("Error".to_string()),
                LogSeverity::Fatal => Some("Fatal".to_string()),
            },
            ..Self::default()
        }
    }

    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// Unknown levels count as information.
    pub fn severity(&self) -> LogSeverity {
        self.level
            .as_deref()
            .and_then(LogSeverity::from_level_name)
            .unwrap_or_default()
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// Receives every line an engine prints, unmodified apart from the line
/// terminator. Called from the capture threads.
pub trait LogSink: Send + Sync + 'static {
    fn line(&self, stream: LogStream, line: &str);
}

impl<F> LogSink for F
where
    F: Fn(LogStream, &str) + Send + Sync + 'static,
{
    fn line(&self, stream: LogStream, line: &str) {
        self(stream, line)
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn line(&self, _stream: LogStream, _line: &str) {}
}

/// Re-emits engine output through `tracing`, at the level the engine asked for.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink {
    /// Log non-JSON stdout lines at warn instead of info.
    pub warn_on_raw: bool,
}

impl TracingLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn_on_raw(mut self, warn_on_raw: bool) -> Self {
        self.warn_on_raw = warn_on_raw;
        self
    }
}

impl LogSink for TracingLogSink {
    fn line(&self, stream: LogStream, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        if stream == LogStream::Stderr {
            warn!(target: "enginewire::engine", stream = stream.as_str(), "{line}");
            return;
        }

        let entry = match JsonLogLine::parse(line) {
            Ok(entry) => entry,
            Err(_) if self.warn_on_raw => {
                warn!(target: "enginewire::engine", raw = true, "{line}");
                return;
            }
            Err(_) => {
                info!(target: "enginewire::engine", raw = true, "{line}");
                return;
            }
        };

        let message = entry.message.as_str();
        match entry.severity() {
            LogSeverity::Debug => debug!(target: "enginewire::engine", "{message}"),
            LogSeverity::Info => info!(target: "enginewire::engine", "{message}"),
            LogSeverity::Warn => warn!(target: "enginewire::engine", "{message}"),
            LogSeverity::Error | LogSeverity::Fatal => {
                let exception = entry.exception.as_deref().unwrap_or("");
                error!(
                    target: "enginewire::engine",
                    exception,
                    fatal = entry.severity() == LogSeverity::Fatal,
                    "{message}"
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn parses_compact_json() {
        let line = r#"{"@t":"2024-01-01T00:00:00Z","@m":"Loading page","@l":"Warning","@i":"a1b2"}"#;
        let entry = JsonLogLine::parse(line).expect("json");
        assert_eq!(entry.message, "Loading page");
        assert_eq!(entry.severity(), LogSeverity::Warn);
        assert_eq!(entry.event_id.as_deref(), Some("a1b2"));
        assert!(entry.exception.is_none());
    }

    #[test]
    fn missing_level_is_info() {
        let entry = JsonLogLine::parse(r#"{"@m":"hello"}"#).expect("json");
        assert_eq!(entry.severity(), LogSeverity::Info);
    }

    #[test]
    fn written_lines_parse_back() {
        let entry = JsonLogLine::new(LogSeverity::Error, "boom");
        let line = entry.to_line().expect("serialize");
        assert!(line.contains(r#""@l":"Error""#));
        assert_eq!(JsonLogLine::parse(&line).expect("parse").severity(), LogSeverity::Error);
    }

    #[test]
    fn severity_names() {
        assert_eq!("Warning".parse::<LogSeverity>(), Ok(LogSeverity::Warn));
        assert_eq!("fatal".parse::<LogSeverity>(), Ok(LogSeverity::Fatal));
        assert!("loud".parse::<LogSeverity>().is_err());
        assert_eq!(LogSeverity::Warn.to_string(), "warn");
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = move |stream: LogStream, line: &str| {
            sink_seen.lock().unwrap().push(format!("{}:{line}", stream.as_str()));
        };
        sink.line(LogStream::Stderr, "raw");
        TracingLogSink::new().line(LogStream::Stdout, "not json");
        assert_eq!(*seen.lock().unwrap(), vec!["stderr:raw".to_string()]);
    }
}
