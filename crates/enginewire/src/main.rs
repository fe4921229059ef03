mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_engine_logging, init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "enginewire", version, about = "Out-of-process rendering engine host")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true, env = "ENGINEWIRE_LOG_FORMAT")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true, env = "ENGINEWIRE_LOG_LEVEL")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    match &cli.command {
        // The host reads engine stdout as structured log lines.
        Command::Engine(args) => init_engine_logging(args.log_severity),
        _ => init_logging(cli.log_format, cli.log_level),
    }

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_launch_with_engine_args() {
        let cli = Cli::try_parse_from([
            "enginewire",
            "launch",
            "/usr/bin/engine",
            "--resolution",
            "800x600",
            "--duration",
            "2s",
            "--",
            "--spawn-helpers",
            "2",
        ])
        .expect("launch args should parse");

        let Command::Launch(args) = cli.command else {
            panic!("expected launch");
        };
        assert_eq!(args.resolution.width, 800);
        assert_eq!(args.engine.as_deref(), Some(std::path::Path::new("/usr/bin/engine")));
        assert_eq!(args.engine_args, ["--spawn-helpers", "2"]);
    }

    #[test]
    fn parses_engine_command_line_as_generated() {
        let settings = enginewire::EngineSettings {
            javascript: false,
            ..Default::default()
        };
        let mut argv = vec!["enginewire".to_string(), "engine".to_string()];
        argv.extend(settings.to_args());
        let cli = Cli::try_parse_from(argv).expect("generated engine args should parse");

        let Command::Engine(args) = cli.command else {
            panic!("expected engine");
        };
        assert!(!args.javascript);
        assert_eq!(args.in_location, "5555");
        assert_eq!(args.out_location, "5556");
        assert_eq!(args.width, 1920);
    }

    #[test]
    fn launch_engine_is_optional() {
        let cli = Cli::try_parse_from(["enginewire", "launch", "--duration", "1s"])
            .expect("launch without an engine should parse");
        let Command::Launch(args) = cli.command else {
            panic!("expected launch");
        };
        assert!(args.engine.is_none());
        assert!(args.engine_args.is_empty());
    }

    #[test]
    fn helper_is_hidden_but_parses() {
        let cli = Cli::try_parse_from(["enginewire", "helper"]).expect("helper should parse");
        assert!(matches!(cli.command, Command::Helper(_)));
    }

    #[test]
    fn rejects_zero_resolution() {
        let err = Cli::try_parse_from(["enginewire", "launch", "engine", "--resolution", "0x10"])
            .expect_err("zero width should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
