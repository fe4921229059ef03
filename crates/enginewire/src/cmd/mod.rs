use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Subcommand};
use enginewire_process::{LogSeverity, PopupAction};
use enginewire_protocol::{Color, Resolution};
use enginewire_transport::TransportKind;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod engine;
pub mod helper;
pub mod launch;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch an engine, stream its frames and report statistics.
    Launch(LaunchArgs),
    /// Run the reference engine: a solid-color surface that honours every call.
    Engine(EngineArgs),
    /// Idle until killed. Started by the reference engine.
    #[command(hide = true)]
    Helper(HelperArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Launch(args) => launch::run(args, format),
        Command::Engine(args) => engine::run(args),
        Command::Helper(args) => helper::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Engine executable. Without one, this binary's reference engine runs.
    pub engine: Option<PathBuf>,
    /// Surface size.
    #[arg(long, default_value = "800x600")]
    pub resolution: Resolution,
    /// Resize to this size halfway through the run.
    #[arg(long)]
    pub resize_to: Option<Resolution>,
    /// Page to load first.
    #[arg(long, default_value = "about:blank")]
    pub url: String,
    /// Frames per second the engine renders and the host polls.
    #[arg(long, default_value_t = 30)]
    pub frame_rate: u32,
    #[arg(long)]
    pub background_color: Option<Color>,
    #[arg(long, default_value = "tcp")]
    pub transport: TransportKind,
    /// Where the engine listens. `0` picks a free location.
    #[arg(long, default_value = "0")]
    pub in_location: String,
    /// Where the host listens. `0` picks a free location.
    #[arg(long, default_value = "0")]
    pub out_location: String,
    /// How long to run before shutting down (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub duration: String,
    /// How long the engine has to signal readiness.
    #[arg(long, default_value = "15s")]
    pub readiness_timeout: String,
    /// Extra arguments passed to the engine, after `--`.
    #[arg(last = true)]
    pub engine_args: Vec<String>,
}

/// Every flag a host may put on the engine command line.
#[derive(Args, Debug)]
pub struct EngineArgs {
    #[arg(long, default_value = "about:blank")]
    pub initial_url: String,
    #[arg(long, default_value_t = 1920)]
    pub width: u32,
    #[arg(long, default_value_t = 1080)]
    pub height: u32,
    #[arg(long, default_value_t = 30)]
    pub windowless_frame_rate: u32,
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub javascript: bool,
    #[arg(long, default_value = "ffffffff")]
    pub background_color: Color,
    #[arg(long)]
    pub log_path: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    pub log_severity: LogSeverity,
    #[arg(long, default_value = "tcp")]
    pub transport: TransportKind,
    #[arg(long, default_value = "5555")]
    pub in_location: String,
    #[arg(long, default_value = "5556")]
    pub out_location: String,
    #[arg(long)]
    pub cache_path: Option<PathBuf>,
    #[arg(long)]
    pub incognito_mode: bool,
    #[arg(long, default_value = "ignore")]
    pub popup_action: PopupAction,
    #[arg(long)]
    pub web_rtc: bool,
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub local_storage: bool,
    #[arg(long)]
    pub remote_debugging: Option<u16>,
    #[arg(long, value_delimiter = ',')]
    pub remote_debugging_allowed_origins: Vec<String>,
    #[arg(long)]
    pub proxy_server: bool,
    #[arg(long)]
    pub proxy_username: Option<String>,
    #[arg(long)]
    pub proxy_password: Option<String>,
    #[arg(long)]
    pub ignore_ssl_errors: bool,
    #[arg(long, value_delimiter = ',')]
    pub ignore_ssl_errors_domains: Vec<String>,
    #[arg(long)]
    pub no_sandbox: bool,
    /// Milliseconds to wait before starting up.
    #[arg(long)]
    pub start_delay: Option<u64>,

    /// Start this many idle child processes, for supervision testing.
    #[arg(long, default_value_t = 0, hide = true)]
    pub spawn_helpers: usize,
    /// Never announce readiness.
    #[arg(long, hide = true)]
    pub never_ready: bool,
}

#[derive(Args, Debug, Default)]
pub struct HelperArgs {}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }
}
