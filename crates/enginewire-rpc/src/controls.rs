//! Handler traits for the two directions and their dispatchers.
//!
//! The host implements [`HostEvents`]; the engine implements
//! [`EngineControls`]. Dispatch is an exhaustive `match` over the message
//! enum, so adding a message without handling it does not compile.

use bytes::Bytes;
use enginewire_protocol::{
    EngineCall, HostNotification, KeyboardEvent, MouseClickEvent, MouseMoveEvent,
    MouseScrollEvent, PopupId, Reply, Resolution,
};

/// Failure reported by a handler. Sent to the caller as a `Fault` frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// What the engine does when the host calls it.
///
/// Handlers run on the connection's reader thread, one call at a time, and
/// the caller stays blocked until the handler returns.
pub trait EngineControls: Send + Sync + 'static {
    /// Current frame, `width * height * 4` BGRA bytes, or empty if nothing
    /// has been painted yet.
    fn get_pixels(&self) -> HandlerResult<Bytes>;

    /// Begin a graceful exit. Invoked after the host's call was acknowledged.
    fn shutdown(&self);

    fn keyboard(&self, event: KeyboardEvent) -> HandlerResult<()>;
    fn mouse_move(&self, event: MouseMoveEvent) -> HandlerResult<()>;
    fn mouse_click(&self, event: MouseClickEvent) -> HandlerResult<()>;
    fn mouse_scroll(&self, event: MouseScrollEvent) -> HandlerResult<()>;

    fn go_forward(&self) -> HandlerResult<()>;
    fn go_back(&self) -> HandlerResult<()>;
    fn refresh(&self) -> HandlerResult<()>;
    fn load_url(&self, url: &str) -> HandlerResult<()>;
    fn load_html(&self, html: &str) -> HandlerResult<()>;
    fn execute_js(&self, js: &str) -> HandlerResult<()>;

    /// Change the surface size. Subsequent frames must have the new length.
    fn resize(&self, resolution: Resolution) -> HandlerResult<()>;

    fn scroll_position(&self) -> HandlerResult<(f32, f32)> {
        Ok((0.0, 0.0))
    }

    fn set_zoom_level(&self, _level: f64) -> HandlerResult<()> {
        Err("zoom is not supported by this engine".into())
    }

    fn zoom_level(&self) -> HandlerResult<f64> {
        Ok(0.0)
    }

    fn open_dev_tools(&self) -> HandlerResult<()> {
        Err("dev tools are not supported by this engine".into())
    }

    fn set_audio_muted(&self, _muted: bool) -> HandlerResult<()> {
        Ok(())
    }

    /// Run script in a popup previously announced to the host.
    fn popup_execute_js(&self, popup: PopupId, _js: &str) -> HandlerResult<()> {
        Err(format!("unknown {popup}").into())
    }

    /// Close a popup. The engine reports `PopupDestroyed` once it is gone.
    fn popup_close(&self, popup: PopupId) -> HandlerResult<()> {
        Err(format!("unknown {popup}").into())
    }
}

/// Route one host call to the engine's controls.
///
/// `Shutdown` is the caller's responsibility: it must be acknowledged before
/// [`EngineControls::shutdown`] runs, so it only yields `Ack` here.
pub fn dispatch_call(controls: &dyn EngineControls, call: EngineCall) -> HandlerResult<Reply> {
    match call {
        EngineCall::GetPixels => controls.get_pixels().map(Reply::Pixels),
        EngineCall::Shutdown => Ok(Reply::Ack),
        EngineCall::Keyboard(event) => controls.keyboard(event).map(ack),
        EngineCall::MouseMove(event) => controls.mouse_move(event).map(ack),
        EngineCall::MouseClick(event) => controls.mouse_click(event).map(ack),
        EngineCall::MouseScroll(event) => controls.mouse_scroll(event).map(ack),
        EngineCall::GoForward => controls.go_forward().map(ack),
        EngineCall::GoBack => controls.go_back().map(ack),
        EngineCall::Refresh => controls.refresh().map(ack),
        EngineCall::LoadUrl(url) => controls.load_url(&url).map(ack),
        EngineCall::LoadHtml(html) => controls.load_html(&html).map(ack),
        EngineCall::ExecuteJs(js) => controls.execute_js(&js).map(ack),
        EngineCall::Resize(resolution) => controls.resize(resolution).map(ack),
        EngineCall::GetScrollPosition => controls
            .scroll_position()
            .map(|(x, y)| Reply::ScrollPosition { x, y }),
        EngineCall::SetZoomLevel(level) => controls.set_zoom_level(level).map(ack),
        EngineCall::GetZoomLevel => controls.zoom_level().map(Reply::ZoomLevel),
        EngineCall::OpenDevTools => controls.open_dev_tools().map(ack),
        EngineCall::AudioMute(muted) => controls.set_audio_muted(muted).map(ack),
        EngineCall::PopupExecuteJs { popup, js } => {
            controls.popup_execute_js(popup, &js).map(ack)
        }
        EngineCall::PopupClose(popup) => controls.popup_close(popup).map(ack),
    }
}

fn ack(_: ()) -> Reply {
    Reply::Ack
}

/// What the host does when the engine reports something.
///
/// Every method defaults to doing nothing.
pub trait HostEvents: Send + Sync + 'static {
    fn url_change(&self, _url: &str) {}
    fn load_start(&self, _url: &str) {}
    fn load_finish(&self, _url: &str) {}
    fn title_change(&self, _title: &str) {}
    fn progress_change(&self, _progress: f64) {}
    fn fullscreen(&self, _fullscreen: bool) {}
    fn input_focus_change(&self, _focused: bool) {}
    /// The engine's surface exists.
    fn ready(&self) {}
    /// A page opened a window at `url`.
    fn popup(&self, _popup: PopupId, _url: &str) {}
    fn popup_destroyed(&self, _popup: PopupId) {}
}

pub fn dispatch_notification(events: &dyn HostEvents, notification: HostNotification) {
    match notification {
        HostNotification::UrlChange(url) => events.url_change(&url),
        HostNotification::LoadStart(url) => events.load_start(&url),
        HostNotification::LoadFinish(url) => events.load_finish(&url),
        HostNotification::TitleChange(title) => events.title_change(&title),
        HostNotification::ProgressChange(progress) => events.progress_change(progress),
        HostNotification::Fullscreen(fullscreen) => events.fullscreen(fullscreen),
        HostNotification::InputFocusChange(focused) => events.input_focus_change(focused),
        HostNotification::Ready => events.ready(),
        HostNotification::Popup { popup, url } => events.popup(popup, &url),
        HostNotification::PopupDestroyed(popup) => events.popup_destroyed(popup),
    }
}

/// Host events that are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostEvents;

impl HostEvents for NoHostEvents {}
