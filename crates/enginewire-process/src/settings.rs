use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use enginewire_frame::DEFAULT_MAX_PAYLOAD;
use enginewire_protocol::{Color, Resolution};
use enginewire_transport::{Endpoint, TransportKind};

use crate::args::ArgsBuilder;
use crate::error::{ProcessError, Result};
use crate::logs::LogSeverity;

pub const DEFAULT_INITIAL_URL: &str = "about:blank";
pub const DEFAULT_FRAME_RATE: u32 = 30;
/// Where the engine listens for host calls.
pub const DEFAULT_IN_LOCATION: &str = "5555";
/// Where the host listens for engine notifications.
pub const DEFAULT_OUT_LOCATION: &str = "5556";

/// What the engine does with pages that try to open a new window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PopupAction {
    #[default]
    Ignore,
    OpenExternalWindow,
    Redirect,
}

impl PopupAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PopupAction::Ignore => "ignore",
            PopupAction::OpenExternalWindow => "open-external-window",
            PopupAction::Redirect => "redirect",
        }
    }
}

impl fmt::Display for PopupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PopupAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "ignore" => Ok(PopupAction::Ignore),
            "open-external-window" | "external" => Ok(PopupAction::OpenExternalWindow),
            "redirect" => Ok(PopupAction::Redirect),
            other => Err(format!("unknown popup action '{other}'")),
        }
    }
}

/// Proxy used by the engine for outgoing requests.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub enabled: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySettings")
            .field("enabled", &self.enabled)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Everything a host tells an engine at launch, via its command line.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub initial_url: String,
    pub resolution: Resolution,
    pub windowless_frame_rate: u32,
    pub javascript: bool,
    pub background_color: Color,
    pub log_path: Option<PathBuf>,
    pub log_severity: LogSeverity,
    pub transport: TransportKind,
    /// Engine's command listener: a port (TCP) or pipe name.
    pub in_location: String,
    /// Host's notification listener: a port (TCP) or pipe name.
    pub out_location: String,
    pub cache_path: Option<PathBuf>,
    pub incognito_mode: bool,
    pub popup_action: PopupAction,
    pub web_rtc: bool,
    pub local_storage: bool,
    pub remote_debugging: Option<u16>,
    pub remote_debugging_allowed_origins: Vec<String>,
    pub proxy: ProxySettings,
    pub ignore_ssl_errors: bool,
    pub ignore_ssl_errors_domains: Vec<String>,
    pub no_sandbox: bool,
    /// Engine sleeps this long before starting up. Useful to attach a debugger.
    pub start_delay: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            initial_url: DEFAULT_INITIAL_URL.to_string(),
            resolution: Resolution::default(),
            windowless_frame_rate: DEFAULT_FRAME_RATE,
            javascript: true,
            background_color: Color::WHITE,
            log_path: None,
            log_severity: LogSeverity::Info,
            transport: TransportKind::Tcp,
            in_location: DEFAULT_IN_LOCATION.to_string(),
            out_location: DEFAULT_OUT_LOCATION.to_string(),
            cache_path: None,
            incognito_mode: false,
            popup_action: PopupAction::Ignore,
            web_rtc: false,
            local_storage: true,
            remote_debugging: None,
            remote_debugging_allowed_origins: Vec::new(),
            proxy: ProxySettings::default(),
            ignore_ssl_errors: false,
            ignore_ssl_errors_domains: Vec::new(),
            no_sandbox: false,
            start_delay: None,
        }
    }
}

impl EngineSettings {
    pub fn with_initial_url(mut self, url: impl Into<String>) -> Self {
        self.initial_url = url.into();
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_locations(
        mut self,
        in_location: impl Into<String>,
        out_location: impl Into<String>,
    ) -> Self {
        self.in_location = in_location.into();
        self.out_location = out_location.into();
        self
    }

    pub fn with_background_color(mut self, color: Color) -> Self {
        self.background_color = color;
        self
    }

    pub fn with_log_severity(mut self, severity: LogSeverity) -> Self {
        self.log_severity = severity;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// Endpoint the engine listens on.
    pub fn engine_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::parse(self.transport, &self.in_location)?)
    }

    /// Endpoint the host listens on.
    pub fn host_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::parse(self.transport, &self.out_location)?)
    }

    /// Reject settings an engine could not start with.
    pub fn validate(&self) -> Result<()> {
        self.resolution
            .check_fits(DEFAULT_MAX_PAYLOAD)
            .map_err(|reason| invalid("resolution", reason))?;
        if self.windowless_frame_rate == 0 {
            return Err(invalid("windowless_frame_rate", "must be at least 1".to_string()));
        }
        let engine = self.engine_endpoint()?;
        let host = self.host_endpoint()?;
        if engine == host && engine.location() != "0" {
            return Err(invalid(
                "in_location",
                format!("engine and host cannot both use {engine}"),
            ));
        }
        if let Some(port) = self.remote_debugging {
            let clash = [&engine, &host]
                .iter()
                .any(|ep| matches!(ep, Endpoint::Tcp { port: p } if *p == port));
            if clash {
                return Err(invalid(
                    "remote_debugging",
                    format!("port {port} is already used for IPC"),
                ));
            }
        }
        Ok(())
    }

    /// The engine command line, without the executable.
    ///
    /// Flags whose value is empty or equal to the engine default are omitted.
    pub fn to_args(&self) -> Vec<String> {
        let defaults = EngineSettings::default();
        let mut b = ArgsBuilder::new();

        b.value("initial-url", &self.initial_url)
            .value("width", self.resolution.width)
            .value("height", self.resolution.height)
            .non_default(
                "windowless-frame-rate",
                self.windowless_frame_rate,
                defaults.windowless_frame_rate,
            )
            .non_default("javascript", self.javascript, defaults.javascript)
            .non_default("background-color", self.background_color, defaults.background_color)
            .value_opt("log-path", self.log_path.as_ref().map(|p| p.display()))
            .non_default("log-severity", self.log_severity, defaults.log_severity)
            .non_default("transport", self.transport, defaults.transport)
            .value("in-location", &self.in_location)
            .value("out-location", &self.out_location)
            .value_opt("cache-path", self.cache_path.as_ref().map(|p| p.display()))
            .switch("incognito-mode", self.incognito_mode)
            .non_default("popup-action", self.popup_action, defaults.popup_action)
            .switch("web-rtc", self.web_rtc)
            .non_default("local-storage", self.local_storage, defaults.local_storage);

        if let Some(port) = self.remote_debugging {
            b.value("remote-debugging", port)
                .list("remote-debugging-allowed-origins", &self.remote_debugging_allowed_origins);
        }
        if self.proxy.enabled {
            b.switch("proxy-server", true)
                .value_opt("proxy-username", self.proxy.username.as_deref().map(str::trim))
                .value_opt("proxy-password", self.proxy.password.as_deref());
        }
        if self.ignore_ssl_errors {
            b.switch("ignore-ssl-errors", true)
                .list("ignore-ssl-errors-domains", &self.ignore_ssl_errors_domains);
        }
        b.switch("no-sandbox", self.no_sandbox)
            .value_opt("start-delay", self.start_delay.map(|d| d.as_millis()));

        b.into_args()
    }
}

fn invalid(field: &'static str, reason: String) -> ProcessError {
    ProcessError::InvalidSetting { field, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn defaults_are_minimal() {
        let args = EngineSettings::default().to_args();
        assert_eq!(
            args,
            vec![
                "--initial-url",
                "about:blank",
                "--width",
                "1920",
                "--height",
                "1080",
                "--in-location",
                "5555",
                "--out-location",
                "5556",
            ]
        );
    }

    #[test]
    fn non_default_values_are_emitted() {
        let settings = EngineSettings {
            javascript: false,
            background_color: Color::rgba(0, 0, 0, 255),
            transport: TransportKind::Pipe,
            in_location: "engine-in".into(),
            out_location: "engine-out".into(),
            remote_debugging: Some(9022),
            remote_debugging_allowed_origins: vec!["http://localhost".into()],
            no_sandbox: true,
            start_delay: Some(Duration::from_millis(1500)),
            ..EngineSettings::default()
        };
        let args = settings.to_args();
        assert_eq!(flag_value(&args, "--javascript"), Some("false"));
        assert_eq!(flag_value(&args, "--background-color"), Some("000000ff"));
        assert_eq!(flag_value(&args, "--transport"), Some("pipe"));
        assert_eq!(flag_value(&args, "--remote-debugging"), Some("9022"));
        assert_eq!(
            flag_value(&args, "--remote-debugging-allowed-origins"),
            Some("http://localhost")
        );
        assert_eq!(flag_value(&args, "--start-delay"), Some("1500"));
        assert!(args.iter().any(|a| a == "--no-sandbox"));
        assert!(!args.iter().any(|a| a == "--web-rtc"));
    }

    #[test]
    fn proxy_flags_only_when_enabled() {
        let mut settings = EngineSettings::default();
        settings.proxy.username = Some("user".into());
        assert!(!settings.to_args().iter().any(|a| a.starts_with("--proxy")));

        settings.proxy.enabled = true;
        settings.proxy.password = Some("hunter2".into());
        let args = settings.to_args();
        assert!(args.iter().any(|a| a == "--proxy-server"));
        assert_eq!(flag_value(&args, "--proxy-username"), Some("user"));
        assert_eq!(flag_value(&args, "--proxy-password"), Some("hunter2"));
    }

    #[test]
    fn debug_redacts_proxy_password() {
        let mut settings = EngineSettings::default();
        settings.proxy.password = Some("hunter2".into());
        let debug = format!("{settings:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn validate_catches_clashes() {
        assert!(EngineSettings::default().validate().is_ok());

        let same = EngineSettings::default().with_locations("7000", "7000");
        assert!(matches!(
            same.validate(),
            Err(ProcessError::InvalidSetting { field: "in_location", .. })
        ));

        let debug_clash = EngineSettings {
            remote_debugging: Some(5555),
            ..EngineSettings::default()
        };
        assert!(debug_clash.validate().is_err());

        let bad_port = EngineSettings::default().with_locations("not-a-port", "5556");
        assert!(matches!(bad_port.validate(), Err(ProcessError::Transport(_))));
    }

    #[test]
    fn validate_rejects_unsendable_resolutions() {
        let empty = EngineSettings::default().with_resolution(Resolution::new(0, 600));
        assert!(matches!(
            empty.validate(),
            Err(ProcessError::InvalidSetting { field: "resolution", .. })
        ));

        // 4200x4200 BGRA is about 70 MB, past the 64 MiB payload limit.
        let huge = EngineSettings::default().with_resolution(Resolution::new(4200, 4200));
        let err = huge.validate().unwrap_err();
        assert!(matches!(err, ProcessError::InvalidSetting { field: "resolution", .. }));
        assert!(err.to_string().contains("payload limit"), "{err}");

        let large = EngineSettings::default().with_resolution(Resolution::new(3840, 2160));
        assert!(large.validate().is_ok());
    }

    #[test]
    fn endpoints_follow_transport() {
        let settings = EngineSettings::default()
            .with_transport(TransportKind::Pipe)
            .with_locations("ew-in", "ew-out");
        assert_eq!(settings.engine_endpoint().unwrap(), Endpoint::pipe("ew-in"));
        assert_eq!(settings.host_endpoint().unwrap(), Endpoint::pipe("ew-out"));
    }
}
