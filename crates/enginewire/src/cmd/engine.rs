//! Reference engine.
//!
//! Paints a solid background at the requested size and answers every call.
//! Navigation is simulated: loading a URL reports the usual load events and
//! uses the URL as the page title. A script calling `window.open('<url>')`
//! is handled according to `--popup-action`.

use std::collections::BTreeMap;
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use enginewire_process::{EngineSettings, PopupAction, ProxySettings};
use enginewire_protocol::{
    Color, HostNotification, KeyboardEvent, MouseClickEvent, MouseMoveEvent, MouseScrollEvent,
    PopupId, Resolution,
};
use enginewire_rpc::{EngineControls, HandlerResult, RpcConfig};
use enginewire_session::EngineSession;
use tracing::{debug, info, warn};

use crate::cmd::EngineArgs;
use crate::exit::{io_error, process_error, session_error, CliResult, SUCCESS};

/// How often queued notifications are flushed to the host.
const NOTIFY_INTERVAL: Duration = Duration::from_millis(20);

struct Page {
    resolution: Resolution,
    background: Color,
    pixels: Bytes,
    history: Vec<String>,
    cursor: usize,
    zoom: f64,
    scroll: (f32, f32),
    muted: bool,
    /// Open popups and the URL each was opened with.
    popups: BTreeMap<PopupId, String>,
    next_popup: u64,
}

impl Page {
    fn paint(&mut self) {
        let px = self.background.to_bgra();
        let count = self.resolution.width as usize * self.resolution.height as usize;
        self.pixels = Bytes::from(px.repeat(count));
    }

    fn current_url(&self) -> &str {
        self.history
            .get(self.cursor)
            .map(String::as_str)
            .unwrap_or("about:blank")
    }
}

struct Surface {
    page: Mutex<Page>,
    events: Mutex<Sender<HostNotification>>,
    javascript: bool,
    popup_action: PopupAction,
}

impl Surface {
    fn new(args: &EngineArgs, events: Sender<HostNotification>) -> Self {
        let mut page = Page {
            resolution: Resolution::new(args.width, args.height),
            background: args.background_color,
            pixels: Bytes::new(),
            history: vec![args.initial_url.clone()],
            cursor: 0,
            zoom: 0.0,
            scroll: (0.0, 0.0),
            muted: false,
            popups: BTreeMap::new(),
            next_popup: 1,
        };
        page.paint();
        Self {
            page: Mutex::new(page),
            events: Mutex::new(events),
            javascript: args.javascript,
            popup_action: args.popup_action,
        }
    }

    fn page(&self) -> MutexGuard<'_, Page> {
        self.page.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, notification: HostNotification) {
        let events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = events.send(notification);
    }

    /// The load events a real engine reports for a navigation.
    fn navigated(&self, url: &str, title: &str) {
        self.emit(HostNotification::LoadStart(url.to_string()));
        self.emit(HostNotification::UrlChange(url.to_string()));
        self.emit(HostNotification::ProgressChange(1.0));
        self.emit(HostNotification::TitleChange(title.to_string()));
        self.emit(HostNotification::LoadFinish(url.to_string()));
    }

    fn go_to(&self, offset: isize) {
        let url = {
            let mut page = self.page();
            let target = page.cursor as isize + offset;
            if target < 0 || target as usize >= page.history.len() {
                return;
            }
            page.cursor = target as usize;
            page.current_url().to_string()
        };
        self.navigated(&url, &url);
    }

    fn open_popup(&self, url: &str) {
        match self.popup_action {
            PopupAction::Ignore => debug!(url, "popup blocked"),
            PopupAction::Redirect => {
                let _ = self.load_url(url);
            }
            PopupAction::OpenExternalWindow => {
                let popup = {
                    let mut page = self.page();
                    let popup = PopupId(page.next_popup);
                    page.next_popup += 1;
                    page.popups.insert(popup, url.to_string());
                    popup
                };
                info!(%popup, url, "popup opened");
                self.emit(HostNotification::Popup {
                    popup,
                    url: url.to_string(),
                });
            }
        }
    }

    fn close_popup(&self, popup: PopupId) -> HandlerResult<()> {
        if self.page().popups.remove(&popup).is_none() {
            return Err(format!("unknown {popup}").into());
        }
        info!(%popup, "popup closed");
        self.emit(HostNotification::PopupDestroyed(popup));
        Ok(())
    }
}

impl EngineControls for Surface {
    fn get_pixels(&self) -> HandlerResult<Bytes> {
        Ok(self.page().pixels.clone())
    }

    fn shutdown(&self) {
        info!("shutdown requested");
    }

    fn keyboard(&self, event: KeyboardEvent) -> HandlerResult<()> {
        debug!(
            down = event.keys_down.len(),
            up = event.keys_up.len(),
            chars = %event.chars,
            "keyboard"
        );
        Ok(())
    }

    fn mouse_move(&self, event: MouseMoveEvent) -> HandlerResult<()> {
        debug!(x = event.x, y = event.y, "mouse move");
        Ok(())
    }

    fn mouse_click(&self, event: MouseClickEvent) -> HandlerResult<()> {
        debug!(
            x = event.x,
            y = event.y,
            button = ?event.button,
            action = ?event.action,
            "mouse click"
        );
        self.emit(HostNotification::InputFocusChange(true));
        Ok(())
    }

    fn mouse_scroll(&self, event: MouseScrollEvent) -> HandlerResult<()> {
        let mut page = self.page();
        page.scroll.1 = (page.scroll.1 - event.delta as f32).max(0.0);
        Ok(())
    }

    fn go_forward(&self) -> HandlerResult<()> {
        self.go_to(1);
        Ok(())
    }

    fn go_back(&self) -> HandlerResult<()> {
        self.go_to(-1);
        Ok(())
    }

    fn refresh(&self) -> HandlerResult<()> {
        self.go_to(0);
        Ok(())
    }

    fn load_url(&self, url: &str) -> HandlerResult<()> {
        {
            let mut page = self.page();
            let keep = page.cursor + 1;
            page.history.truncate(keep);
            page.history.push(url.to_string());
            page.cursor = page.history.len() - 1;
            page.scroll = (0.0, 0.0);
        }
        info!(url, "loading");
        self.navigated(url, url);
        Ok(())
    }

    fn load_html(&self, html: &str) -> HandlerResult<()> {
        let title = html_title(html).unwrap_or("untitled");
        self.navigated("about:html", title);
        Ok(())
    }

    fn execute_js(&self, js: &str) -> HandlerResult<()> {
        if !self.javascript {
            return Err("javascript is disabled".into());
        }
        match window_open_target(js) {
            Some(url) => self.open_popup(url),
            None => debug!(len = js.len(), "script ignored"),
        }
        Ok(())
    }

    fn resize(&self, resolution: Resolution) -> HandlerResult<()> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(format!("cannot resize to {resolution}").into());
        }
        let mut page = self.page();
        page.resolution = resolution;
        page.paint();
        info!(%resolution, "resized");
        Ok(())
    }

    fn scroll_position(&self) -> HandlerResult<(f32, f32)> {
        Ok(self.page().scroll)
    }

    fn set_zoom_level(&self, level: f64) -> HandlerResult<()> {
        self.page().zoom = level;
        Ok(())
    }

    fn zoom_level(&self) -> HandlerResult<f64> {
        Ok(self.page().zoom)
    }

    fn open_dev_tools(&self) -> HandlerResult<()> {
        info!("dev tools requested; nothing to open");
        Ok(())
    }

    fn set_audio_muted(&self, muted: bool) -> HandlerResult<()> {
        self.page().muted = muted;
        Ok(())
    }

    fn popup_execute_js(&self, popup: PopupId, js: &str) -> HandlerResult<()> {
        if !self.page().popups.contains_key(&popup) {
            return Err(format!("unknown {popup}").into());
        }
        if js.contains("window.close()") {
            return self.close_popup(popup);
        }
        debug!(%popup, len = js.len(), "popup script ignored");
        Ok(())
    }

    fn popup_close(&self, popup: PopupId) -> HandlerResult<()> {
        self.close_popup(popup)
    }
}

/// The URL in the first `window.open('<url>')` of a script.
fn window_open_target(js: &str) -> Option<&str> {
    let rest = &js[js.find("window.open(")? + "window.open(".len()..];
    let rest = rest.trim_start();
    let quote = rest.chars().next().filter(|c| matches!(c, '\'' | '"'))?;
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(&rest[..end])
}

fn html_title(html: &str) -> Option<&str> {
    let lower = html.to_ascii_lowercase();
    let start = lower.find("<title>")? + "<title>".len();
    let end = lower[start..].find("</title>")? + start;
    Some(html[start..end].trim())
}

/// The settings a host would have used to produce this command line.
fn settings_from(args: &EngineArgs) -> EngineSettings {
    EngineSettings {
        initial_url: args.initial_url.clone(),
        resolution: Resolution::new(args.width, args.height),
        windowless_frame_rate: args.windowless_frame_rate,
        javascript: args.javascript,
        background_color: args.background_color,
        log_path: args.log_path.clone(),
        log_severity: args.log_severity,
        transport: args.transport,
        in_location: args.in_location.clone(),
        out_location: args.out_location.clone(),
        cache_path: args.cache_path.clone(),
        incognito_mode: args.incognito_mode,
        popup_action: args.popup_action,
        web_rtc: args.web_rtc,
        local_storage: args.local_storage,
        remote_debugging: args.remote_debugging,
        remote_debugging_allowed_origins: args.remote_debugging_allowed_origins.clone(),
        proxy: ProxySettings {
            enabled: args.proxy_server,
            username: args.proxy_username.clone(),
            password: args.proxy_password.clone(),
        },
        ignore_ssl_errors: args.ignore_ssl_errors,
        ignore_ssl_errors_domains: args.ignore_ssl_errors_domains.clone(),
        no_sandbox: args.no_sandbox,
        start_delay: args.start_delay.map(Duration::from_millis),
    }
}

pub fn run(args: EngineArgs) -> CliResult<i32> {
    if let Some(ms) = args.start_delay {
        thread::sleep(Duration::from_millis(ms));
    }

    let settings = settings_from(&args);
    settings
        .validate()
        .map_err(|err| process_error("invalid engine arguments", err))?;
    debug!(?settings, "engine settings");
    let listen_on = settings
        .engine_endpoint()
        .map_err(|err| process_error("invalid --in-location", err))?;
    let host = settings
        .host_endpoint()
        .map_err(|err| process_error("invalid --out-location", err))?;

    let mut helpers = spawn_helpers(args.spawn_helpers)?;

    let (tx, rx) = mpsc::channel();
    let surface = Arc::new(Surface::new(&args, tx));
    let session = EngineSession::start(&listen_on, &host, surface.clone(), &RpcConfig::default())
        .map_err(|err| session_error("engine start failed", err))?;
    info!(
        endpoint = %session.endpoint(),
        resolution = %Resolution::new(args.width, args.height),
        helpers = helpers.len(),
        "engine serving"
    );

    if args.never_ready {
        warn!("readiness announcement suppressed");
    } else {
        session.ready();
        surface.navigated(&args.initial_url, &args.initial_url);
    }

    while !session.wait_for_shutdown_timeout(NOTIFY_INTERVAL) {
        forward(&session, &rx);
    }
    forward(&session, &rx);

    session.close();
    stop_helpers(&mut helpers);
    info!("engine exiting");
    Ok(SUCCESS)
}

fn forward(session: &EngineSession, rx: &Receiver<HostNotification>) {
    while let Ok(notification) = rx.try_recv() {
        if let Err(err) = session.notifier().notify(&notification) {
            debug!(kind = notification.name(), error = %err, "notification dropped");
        }
    }
}

fn spawn_helpers(count: usize) -> CliResult<Vec<Child>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let exe = std::env::current_exe().map_err(|err| io_error("cannot locate own executable", err))?;
    let mut helpers = Vec::with_capacity(count);
    for _ in 0..count {
        let child = ProcessCommand::new(&exe)
            .arg("helper")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| io_error("helper spawn failed", err))?;
        info!(pid = child.id(), "helper started");
        helpers.push(child);
    }
    Ok(helpers)
}

fn stop_helpers(helpers: &mut Vec<Child>) {
    for mut child in helpers.drain(..) {
        if let Err(err) = child.kill() {
            debug!(pid = child.id(), error = %err, "helper already gone");
        }
        let _ = child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(clap::Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: EngineArgs,
    }

    fn parse<I: IntoIterator<Item = String>>(argv: I) -> EngineArgs {
        use clap::Parser;
        let argv = std::iter::once("engine".to_string()).chain(argv);
        Wrapper::try_parse_from(argv).expect("engine args").args
    }

    fn args() -> EngineArgs {
        parse(["--width", "4", "--height", "2"].map(String::from))
    }

    #[test]
    fn command_line_round_trips_to_settings() {
        let settings = EngineSettings {
            initial_url: "https://example.com".into(),
            resolution: Resolution::new(640, 480),
            windowless_frame_rate: 60,
            javascript: false,
            background_color: Color::rgba(0, 0, 0, 255),
            transport: enginewire_transport::TransportKind::Pipe,
            in_location: "engine-in".into(),
            out_location: "engine-out".into(),
            incognito_mode: true,
            popup_action: enginewire_process::PopupAction::Redirect,
            local_storage: false,
            remote_debugging: Some(9222),
            remote_debugging_allowed_origins: vec!["http://a".into(), "http://b".into()],
            proxy: ProxySettings {
                enabled: true,
                username: Some("user".into()),
                password: Some("secret".into()),
            },
            ignore_ssl_errors: true,
            ignore_ssl_errors_domains: vec!["example.org".into()],
            no_sandbox: true,
            start_delay: Some(Duration::from_millis(250)),
            ..EngineSettings::default()
        };
        assert_eq!(settings_from(&parse(settings.to_args())), settings);
    }

    #[test]
    fn defaults_match_engine_settings() {
        assert_eq!(settings_from(&parse(Vec::new())), EngineSettings::default());
    }

    #[test]
    fn paints_the_background() {
        let (tx, _rx) = mpsc::channel();
        let surface = Surface::new(&args(), tx);
        let pixels = surface.get_pixels().unwrap();
        assert_eq!(pixels.len(), 4 * 2 * 4);
        assert!(pixels.iter().all(|b| *b == 255));

        surface.resize(Resolution::new(3, 3)).unwrap();
        assert_eq!(surface.get_pixels().unwrap().len(), 3 * 3 * 4);
        assert!(surface.resize(Resolution::new(0, 3)).is_err());
    }

    #[test]
    fn navigation_reports_load_events() {
        let (tx, rx) = mpsc::channel();
        let surface = Surface::new(&args(), tx);
        surface.load_url("https://example.com").unwrap();
        let names: Vec<_> = rx.try_iter().map(|n| n.name()).collect();
        assert_eq!(
            names.first().copied(),
            Some(HostNotification::LoadStart(String::new()).name())
        );
        assert_eq!(
            names.last().copied(),
            Some(HostNotification::LoadFinish(String::new()).name())
        );

        surface.go_back().unwrap();
        assert_eq!(surface.page().current_url(), "about:blank");
        surface.go_forward().unwrap();
        assert_eq!(surface.page().current_url(), "https://example.com");
    }

    fn surface_with_popups(action: &str) -> (Surface, Receiver<HostNotification>) {
        let (tx, rx) = mpsc::channel();
        let args = parse(["--popup-action", action].map(String::from));
        (Surface::new(&args, tx), rx)
    }

    #[test]
    fn window_open_becomes_a_popup() {
        let (surface, rx) = surface_with_popups("open-external-window");
        surface
            .execute_js("window.open('https://example.org/ad')")
            .unwrap();
        let popup = match rx.try_recv().unwrap() {
            HostNotification::Popup { popup, url } => {
                assert_eq!(url, "https://example.org/ad");
                popup
            }
            other => panic!("expected a popup, got {other:?}"),
        };

        surface.popup_execute_js(popup, "document.title").unwrap();
        surface.popup_execute_js(popup, "window.close()").unwrap();
        assert_eq!(rx.try_recv().unwrap(), HostNotification::PopupDestroyed(popup));
        assert!(surface.popup_close(popup).is_err());
        assert!(surface.popup_execute_js(popup, "1").is_err());
    }

    #[test]
    fn popup_action_decides_what_window_open_does() {
        let (ignoring, rx) = surface_with_popups("ignore");
        ignoring.execute_js("window.open(\"https://a.example\")").unwrap();
        assert!(rx.try_recv().is_err());

        let (redirecting, rx) = surface_with_popups("redirect");
        redirecting.execute_js("window.open('https://b.example')").unwrap();
        assert_eq!(redirecting.page().current_url(), "https://b.example");
        assert!(rx
            .try_iter()
            .all(|n| !matches!(n, HostNotification::Popup { .. })));
    }

    #[test]
    fn finds_window_open_targets() {
        assert_eq!(window_open_target("window.open( 'x' )"), Some("x"));
        assert_eq!(window_open_target("window.open(\"y\", '_blank')"), Some("y"));
        assert_eq!(window_open_target("window.open(url)"), None);
        assert_eq!(window_open_target("alert(1)"), None);
    }

    #[test]
    fn finds_html_titles() {
        assert_eq!(html_title("<html><TITLE> Hi </TITLE></html>"), Some("Hi"));
        assert_eq!(html_title("<p>none</p>"), None);
    }

    #[test]
    fn zoom_and_scroll_are_remembered() {
        let (tx, _rx) = mpsc::channel();
        let surface = Surface::new(&args(), tx);
        surface.set_zoom_level(1.5).unwrap();
        assert_eq!(surface.zoom_level().unwrap(), 1.5);
        surface
            .mouse_scroll(MouseScrollEvent {
                x: 0,
                y: 0,
                delta: -120,
            })
            .unwrap();
        assert_eq!(surface.scroll_position().unwrap(), (0.0, 120.0));
    }
}
