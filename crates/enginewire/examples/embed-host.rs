//! Minimal embedding host: launches an engine, loads a page and prints what
//! the newest frame looks like.
//!
//! Run with the bundled reference engine:
//!   cargo build
//!   cargo run --example embed-host -- target/debug/enginewire engine

use std::thread;
use std::time::{Duration, Instant};

use enginewire::{HostConfig, HostEvents, HostSession, Resolution};

struct PrintEvents;

impl HostEvents for PrintEvents {
    fn title_change(&self, title: &str) {
        eprintln!("title: {title}");
    }

    fn load_finish(&self, url: &str) {
        eprintln!("loaded: {url}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let engine = args.next().ok_or("usage: embed-host <ENGINE> [LEADING ARGS...]")?;

    let mut config = HostConfig::ephemeral(engine).with_leading_args(args);
    config.settings.resolution = Resolution::new(640, 480);

    let session = HostSession::start(config, Box::new(PrintEvents))?;
    eprintln!("engine {} ready on {}", session.pid(), session.engine_endpoint());

    session.load_html("<html><head><title>embedded</title></head></html>")?;

    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Some(frame) = session.latest_frame() {
            eprintln!(
                "frame #{} {} ({} bytes)",
                frame.sequence(),
                frame.resolution(),
                frame.pixels().len()
            );
        }
        thread::sleep(Duration::from_millis(500));
    }

    let stats = session.frame_stats();
    eprintln!("{} frames, {:.1} fps", stats.frames, stats.fps);
    session.shutdown()?;
    Ok(())
}
