use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use enginewire_process::EngineSettings;
use enginewire_protocol::PopupId;
use enginewire_rpc::HostEvents;
use enginewire_session::{HostConfig, HostSession};
use tracing::info;

use crate::cmd::{parse_duration, LaunchArgs};
use crate::exit::{io_error, session_error, CliError, CliResult, ENGINE_CRASHED, INTERNAL, SUCCESS};
use crate::output::{print_report, LaunchReport, OutputFormat};

const TICK: Duration = Duration::from_millis(20);
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Logs what the engine reports.
struct EventLog;

impl HostEvents for EventLog {
    fn url_change(&self, url: &str) {
        info!(url, "url changed");
    }
    fn load_start(&self, url: &str) {
        info!(url, "load started");
    }
    fn load_finish(&self, url: &str) {
        info!(url, "load finished");
    }
    fn title_change(&self, title: &str) {
        info!(title, "title changed");
    }
    fn fullscreen(&self, fullscreen: bool) {
        info!(fullscreen, "fullscreen changed");
    }
    fn ready(&self) {
        info!("engine announced readiness");
    }
    fn popup(&self, popup: PopupId, url: &str) {
        info!(%popup, url, "popup opened");
    }
    fn popup_destroyed(&self, popup: PopupId) {
        info!(%popup, "popup closed");
    }
}

pub fn run(args: LaunchArgs, format: OutputFormat) -> CliResult<i32> {
    let duration = parse_duration(&args.duration)?;
    let readiness_timeout = parse_duration(&args.readiness_timeout)?;

    let mut settings = EngineSettings::default()
        .with_initial_url(args.url.clone())
        .with_resolution(args.resolution)
        .with_transport(args.transport)
        .with_locations(args.in_location.clone(), args.out_location.clone());
    settings.windowless_frame_rate = args.frame_rate;
    if let Some(color) = args.background_color {
        settings = settings.with_background_color(color);
    }

    let (engine, leading) = match &args.engine {
        Some(path) => (path.clone(), Vec::new()),
        None => {
            let exe = std::env::current_exe()
                .map_err(|err| io_error("locating the reference engine", err))?;
            (exe, vec!["engine".to_string()])
        }
    };

    let config = HostConfig::new(&engine)
        .with_leading_args(leading)
        .with_settings(settings)
        .with_args(args.engine_args.iter().cloned())
        .with_readiness_timeout(readiness_timeout);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let started = Instant::now();
    let session = HostSession::start(config, Box::new(EventLog))
        .map_err(|err| session_error("launch failed", err))?;
    info!(pid = session.pid(), engine = %session.engine_endpoint(), "session running");

    let mut pending_resize = args.resize_to.map(|res| (started + duration / 2, res));
    let mut next_report = Instant::now() + STATS_INTERVAL;
    while running.load(Ordering::SeqCst) && started.elapsed() < duration && !session.has_crashed() {
        if let Some((at, resolution)) = pending_resize {
            if Instant::now() >= at {
                session
                    .resize(resolution)
                    .map_err(|err| session_error("resize failed", err))?;
                pending_resize = None;
            }
        }
        if Instant::now() >= next_report {
            let stats = session.frame_stats();
            info!(
                frames = stats.frames,
                fps = stats.fps,
                discarded = stats.discarded,
                "frame stats"
            );
            next_report += STATS_INTERVAL;
        }
        thread::sleep(TICK);
    }

    let stats = session.frame_stats();
    let latest = session.latest_frame();
    let resolution = session.resolution().unwrap_or(args.resolution);
    let crashed = session.has_crashed();
    let pid = session.pid();
    let status = session
        .shutdown()
        .map_err(|err| session_error("shutdown failed", err))?;

    let report = LaunchReport {
        engine: engine.display().to_string(),
        pid,
        resolution: resolution.to_string(),
        frame_resolution: latest.as_ref().map(|f| f.resolution().to_string()),
        frames: stats.frames,
        discarded: stats.discarded,
        errors: stats.errors,
        fps: stats.fps,
        last_sequence: latest.as_ref().map(|f| f.sequence()),
        crashed,
        exit_status: status.map(|s| s.to_string()),
        elapsed_ms: started.elapsed().as_millis(),
    };
    print_report(&report, format);

    if crashed {
        return Err(CliError::new(ENGINE_CRASHED, "engine exited unexpectedly"));
    }
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
