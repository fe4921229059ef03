use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// What `launch` prints when the session ends.
#[derive(Debug, Serialize)]
pub struct LaunchReport {
    pub engine: String,
    pub pid: u32,
    pub resolution: String,
    /// Size of the last frame seen, if any.
    pub frame_resolution: Option<String>,
    pub frames: u64,
    pub discarded: u64,
    pub errors: u64,
    pub fps: f64,
    pub last_sequence: Option<u64>,
    pub crashed: bool,
    pub exit_status: Option<String>,
    pub elapsed_ms: u128,
}

pub fn print_report(report: &LaunchReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in report_rows(report) {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let line = report_rows(report)
                .into_iter()
                .map(|(field, value)| format!("{field}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{line}");
        }
    }
}

fn report_rows(report: &LaunchReport) -> Vec<(&'static str, String)> {
    vec![
        ("engine", report.engine.clone()),
        ("pid", report.pid.to_string()),
        ("resolution", report.resolution.clone()),
        (
            "frame_resolution",
            report.frame_resolution.clone().unwrap_or_else(|| "-".to_string()),
        ),
        ("frames", report.frames.to_string()),
        ("discarded", report.discarded.to_string()),
        ("errors", report.errors.to_string()),
        ("fps", format!("{:.1}", report.fps)),
        (
            "last_sequence",
            report
                .last_sequence
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ),
        ("crashed", report.crashed.to_string()),
        (
            "exit_status",
            report.exit_status.clone().unwrap_or_else(|| "-".to_string()),
        ),
        ("elapsed_ms", report.elapsed_ms.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> LaunchReport {
        LaunchReport {
            engine: "engine".into(),
            pid: 42,
            resolution: "800x600".into(),
            frame_resolution: Some("800x600".into()),
            frames: 10,
            discarded: 1,
            errors: 0,
            fps: 29.96,
            last_sequence: Some(10),
            crashed: false,
            exit_status: None,
            elapsed_ms: 1000,
        }
    }

    #[test]
    fn rows_cover_every_field() {
        let rows = report_rows(&report());
        assert_eq!(rows.len(), 12);
        assert!(rows.contains(&("fps", "30.0".to_string())));
        assert!(rows.contains(&("exit_status", "-".to_string())));
    }

    #[test]
    fn json_report_is_flat() {
        let value = serde_json::to_value(report()).unwrap();
        assert_eq!(value["pid"], 42);
        assert_eq!(value["resolution"], "800x600");
        assert!(value["exit_status"].is_null());
    }
}
