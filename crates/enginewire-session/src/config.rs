use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use enginewire_process::{EngineSettings, LogSink, TracingLogSink, DEFAULT_KILL_GRACE};
use enginewire_protocol::Resolution;
use enginewire_rpc::RpcConfig;
use enginewire_transport::TransportKind;

use crate::error::{Result, SessionError};

/// Location that asks for a free port (TCP) or a generated name (pipe).
pub const AUTO_LOCATION: &str = "0";

pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);

/// Everything a host needs to launch and drive one engine.
#[derive(Clone)]
pub struct HostConfig {
    pub engine_path: PathBuf,
    pub settings: EngineSettings,
    /// Passed before the generated flags, e.g. a subcommand.
    pub leading_args: Vec<String>,
    /// Passed after the generated flags.
    pub extra_args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub rpc: RpcConfig,
    pub readiness_timeout: Duration,
    /// How long the engine gets to exit after `Shutdown` before the tree is killed.
    pub shutdown_grace: Duration,
    /// Per-process SIGTERM grace while killing the tree.
    pub kill_grace: Duration,
    /// Pixel poll interval. `None` derives it from the frame rate.
    pub frame_interval: Option<Duration>,
    pub watchdog_interval: Duration,
    /// Open a second connection that delivers input in order without blocking.
    pub input_queue: bool,
    pub log_sink: Arc<dyn LogSink>,
}

impl HostConfig {
    pub fn new(engine_path: impl Into<PathBuf>) -> Self {
        Self {
            engine_path: engine_path.into(),
            settings: EngineSettings::default(),
            leading_args: Vec::new(),
            extra_args: Vec::new(),
            workdir: None,
            rpc: RpcConfig::default(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            kill_grace: DEFAULT_KILL_GRACE,
            frame_interval: None,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            input_queue: true,
            log_sink: Arc::new(TracingLogSink::new()),
        }
    }

    /// Like [`HostConfig::new`] with both locations picked at start.
    pub fn ephemeral(engine_path: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(engine_path);
        config.settings.in_location = AUTO_LOCATION.to_string();
        config.settings.out_location = AUTO_LOCATION.to_string();
        config
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    pub fn with_rpc(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_input_queue(mut self, enabled: bool) -> Self {
        self.input_queue = enabled;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval.unwrap_or_else(|| {
            Duration::from_secs(1) / self.settings.windowless_frame_rate.max(1)
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        check_resolution(self.settings.resolution, self.rpc.frame.max_payload_size)
    }
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("engine_path", &self.engine_path)
            .field("settings", &self.settings)
            .field("leading_args", &self.leading_args)
            .field("extra_args", &self.extra_args)
            .field("readiness_timeout", &self.readiness_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("input_queue", &self.input_queue)
            .finish_non_exhaustive()
    }
}

/// Reject sizes whose frames could not cross a connection capped at
/// `max_payload` bytes.
pub(crate) fn check_resolution(resolution: Resolution, max_payload: usize) -> Result<()> {
    resolution
        .check_fits(max_payload)
        .map_err(|reason| SessionError::InvalidResolution { resolution, reason })
}

static PIPE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Replace an automatic engine location with a concrete one.
///
/// TCP asks the OS for a free port and releases it; the engine binds it
/// moments later. Pipes get a name unique to this process.
pub(crate) fn resolve_engine_location(kind: TransportKind, location: &str) -> Result<String> {
    if location != AUTO_LOCATION {
        return Ok(location.to_string());
    }
    match kind {
        TransportKind::Tcp => {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                .map_err(enginewire_transport::TransportError::Io)?;
            let port = listener
                .local_addr()
                .map_err(enginewire_transport::TransportError::Io)?
                .port();
            Ok(port.to_string())
        }
        TransportKind::Pipe => Ok(unique_pipe_name("in")),
    }
}

/// Host side: TCP port 0 binds directly, pipes need a generated name.
pub(crate) fn resolve_host_location(kind: TransportKind, location: &str) -> String {
    match (kind, location) {
        (TransportKind::Pipe, AUTO_LOCATION) => unique_pipe_name("out"),
        _ => location.to_string(),
    }
}

fn unique_pipe_name(direction: &str) -> String {
    let n = PIPE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("enginewire-{}-{n}-{direction}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_interval_follows_frame_rate() {
        let mut config = HostConfig::new("engine");
        assert_eq!(config.frame_interval(), Duration::from_secs(1) / 30);
        config.settings.windowless_frame_rate = 60;
        assert_eq!(config.frame_interval(), Duration::from_secs(1) / 60);
        let config = config.with_frame_interval(Duration::from_millis(5));
        assert_eq!(config.frame_interval(), Duration::from_millis(5));
    }

    #[test]
    fn explicit_locations_pass_through() {
        assert_eq!(
            resolve_engine_location(TransportKind::Tcp, "5555").unwrap(),
            "5555"
        );
        assert_eq!(resolve_host_location(TransportKind::Pipe, "mine"), "mine");
        assert_eq!(resolve_host_location(TransportKind::Tcp, "0"), "0");
    }

    #[test]
    fn automatic_locations_are_concrete_and_distinct() {
        let port: u16 = resolve_engine_location(TransportKind::Tcp, AUTO_LOCATION)
            .unwrap()
            .parse()
            .unwrap();
        assert_ne!(port, 0);

        let a = resolve_engine_location(TransportKind::Pipe, AUTO_LOCATION).unwrap();
        let b = resolve_host_location(TransportKind::Pipe, AUTO_LOCATION);
        assert_ne!(a, b);
        assert!(a.starts_with("enginewire-"));
    }

    #[test]
    fn ephemeral_config_validates() {
        HostConfig::ephemeral("engine").validate().unwrap();
    }

    #[test]
    fn resolution_must_fit_the_rpc_payload_limit() {
        let mut config = HostConfig::ephemeral("engine");
        config.rpc.frame = config.rpc.frame.with_max_payload_size(1024 * 1024);
        config.settings.resolution = Resolution::new(800, 600);
        assert!(matches!(
            config.validate(),
            Err(SessionError::InvalidResolution { .. })
        ));
        config.settings.resolution = Resolution::new(320, 240);
        config.validate().unwrap();
    }
}
