use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};
use crate::input::{KeyboardEvent, MouseClickEvent, MouseMoveEvent, MouseScrollEvent};
use crate::popup::PopupId;
use crate::surface::Resolution;
use crate::wire::{self, WireReader};

/// Commands the host sends to the engine. Each one is answered with a [`Reply`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    GetPixels,
    Shutdown,
    Keyboard(KeyboardEvent),
    MouseMove(MouseMoveEvent),
    MouseClick(MouseClickEvent),
    MouseScroll(MouseScrollEvent),
    GoForward,
    GoBack,
    Refresh,
    LoadUrl(String),
    LoadHtml(String),
    ExecuteJs(String),
    Resize(Resolution),
    GetScrollPosition,
    SetZoomLevel(f64),
    GetZoomLevel,
    OpenDevTools,
    AudioMute(bool),
    /// Run script inside a popup the engine announced.
    PopupExecuteJs { popup: PopupId, js: String },
    PopupClose(PopupId),
}

impl EngineCall {
    const FAMILY: &'static str = "engine call";

    pub fn tag(&self) -> u8 {
        match self {
            EngineCall::GetPixels => 0x01,
            EngineCall::Shutdown => 0x02,
            EngineCall::Keyboard(_) => 0x03,
            EngineCall::MouseMove(_) => 0x04,
            EngineCall::MouseClick(_) => 0x05,
            EngineCall::MouseScroll(_) => 0x06,
            EngineCall::GoForward => 0x07,
            EngineCall::GoBack => 0x08,
            EngineCall::Refresh => 0x09,
            EngineCall::LoadUrl(_) => 0x0a,
            EngineCall::LoadHtml(_) => 0x0b,
            EngineCall::ExecuteJs(_) => 0x0c,
            EngineCall::Resize(_) => 0x0d,
            EngineCall::GetScrollPosition => 0x0e,
            EngineCall::SetZoomLevel(_) => 0x0f,
            EngineCall::GetZoomLevel => 0x10,
            EngineCall::OpenDevTools => 0x11,
            EngineCall::AudioMute(_) => 0x12,
            EngineCall::PopupExecuteJs { .. } => 0x13,
            EngineCall::PopupClose(_) => 0x14,
        }
    }

    /// Stable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            EngineCall::GetPixels => "get_pixels",
            EngineCall::Shutdown => "shutdown",
            EngineCall::Keyboard(_) => "keyboard",
            EngineCall::MouseMove(_) => "mouse_move",
            EngineCall::MouseClick(_) => "mouse_click",
            EngineCall::MouseScroll(_) => "mouse_scroll",
            EngineCall::GoForward => "go_forward",
            EngineCall::GoBack => "go_back",
            EngineCall::Refresh => "refresh",
            EngineCall::LoadUrl(_) => "load_url",
            EngineCall::LoadHtml(_) => "load_html",
            EngineCall::ExecuteJs(_) => "execute_js",
            EngineCall::Resize(_) => "resize",
            EngineCall::GetScrollPosition => "get_scroll_position",
            EngineCall::SetZoomLevel(_) => "set_zoom_level",
            EngineCall::GetZoomLevel => "get_zoom_level",
            EngineCall::OpenDevTools => "open_dev_tools",
            EngineCall::AudioMute(_) => "audio_mute",
            EngineCall::PopupExecuteJs { .. } => "popup_execute_js",
            EngineCall::PopupClose(_) => "popup_close",
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.tag());
        match self {
            EngineCall::GetPixels
            | EngineCall::Shutdown
            | EngineCall::GoForward
            | EngineCall::GoBack
            | EngineCall::Refresh
            | EngineCall::GetScrollPosition
            | EngineCall::GetZoomLevel
            | EngineCall::OpenDevTools => {}
            EngineCall::Keyboard(event) => event.encode(dst),
            EngineCall::MouseMove(event) => event.encode(dst),
            EngineCall::MouseClick(event) => event.encode(dst),
            EngineCall::MouseScroll(event) => event.encode(dst),
            EngineCall::LoadUrl(s) | EngineCall::LoadHtml(s) | EngineCall::ExecuteJs(s) => {
                wire::put_str(dst, s)
            }
            EngineCall::Resize(res) => {
                dst.put_u32_le(res.width);
                dst.put_u32_le(res.height);
            }
            EngineCall::SetZoomLevel(level) => dst.put_f64_le(*level),
            EngineCall::AudioMute(muted) => wire::put_bool(dst, *muted),
            EngineCall::PopupExecuteJs { popup, js } => {
                dst.put_u64_le(popup.0);
                wire::put_str(dst, js);
            }
            EngineCall::PopupClose(popup) => dst.put_u64_le(popup.0),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut src = WireReader::new(payload);
        if src.remaining() == 0 {
            return Err(CodecError::Empty);
        }
        let call = match src.u8("tag")? {
            0x01 => EngineCall::GetPixels,
            0x02 => EngineCall::Shutdown,
            0x03 => EngineCall::Keyboard(KeyboardEvent::decode(&mut src)?),
            0x04 => EngineCall::MouseMove(MouseMoveEvent::decode(&mut src)?),
            0x05 => EngineCall::MouseClick(MouseClickEvent::decode(&mut src)?),
            0x06 => EngineCall::MouseScroll(MouseScrollEvent::decode(&mut src)?),
            0x07 => EngineCall::GoForward,
            0x08 => EngineCall::GoBack,
            0x09 => EngineCall::Refresh,
            0x0a => EngineCall::LoadUrl(src.string("url")?),
            0x0b => EngineCall::LoadHtml(src.string("html")?),
            0x0c => EngineCall::ExecuteJs(src.string("js")?),
            0x0d => EngineCall::Resize(Resolution::new(
                src.u32("resize.width")?,
                src.u32("resize.height")?,
            )),
            0x0e => EngineCall::GetScrollPosition,
            0x0f => EngineCall::SetZoomLevel(src.f64("zoom_level")?),
            0x10 => EngineCall::GetZoomLevel,
            0x11 => EngineCall::OpenDevTools,
            0x12 => EngineCall::AudioMute(src.bool("muted")?),
            0x13 => EngineCall::PopupExecuteJs {
                popup: PopupId(src.u64("popup")?),
                js: src.string("js")?,
            },
            0x14 => EngineCall::PopupClose(PopupId(src.u64("popup")?)),
            tag => {
                return Err(CodecError::UnknownTag {
                    family: Self::FAMILY,
                    tag,
                })
            }
        };
        src.finish(Self::FAMILY)?;
        Ok(call)
    }
}

/// Lifecycle events the engine pushes to the host. Fire-and-forget.
#[derive(Debug, Clone, PartialEq)]
pub enum HostNotification {
    UrlChange(String),
    LoadStart(String),
    LoadFinish(String),
    TitleChange(String),
    /// Load progress in `0.0..=1.0`.
    ProgressChange(f64),
    Fullscreen(bool),
    /// The engine's surface exists; commands and pixel polling may begin.
    Ready,
    InputFocusChange(bool),
    /// A page opened a window. The host may drive it with the popup calls
    /// until [`HostNotification::PopupDestroyed`] arrives.
    Popup { popup: PopupId, url: String },
    PopupDestroyed(PopupId),
}

impl HostNotification {
    const FAMILY: &'static str = "host notification";

    pub fn tag(&self) -> u8 {
        match self {
            HostNotification::UrlChange(_) => 0x01,
            HostNotification::LoadStart(_) => 0x02,
            HostNotification::LoadFinish(_) => 0x03,
            HostNotification::TitleChange(_) => 0x04,
            HostNotification::ProgressChange(_) => 0x05,
            HostNotification::Fullscreen(_) => 0x06,
            HostNotification::Ready => 0x07,
            HostNotification::InputFocusChange(_) => 0x08,
            HostNotification::Popup { .. } => 0x09,
            HostNotification::PopupDestroyed(_) => 0x0a,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostNotification::UrlChange(_) => "url_change",
            HostNotification::LoadStart(_) => "load_start",
            HostNotification::LoadFinish(_) => "load_finish",
            HostNotification::TitleChange(_) => "title_change",
            HostNotification::ProgressChange(_) => "progress_change",
            HostNotification::Fullscreen(_) => "fullscreen",
            HostNotification::Ready => "ready",
            HostNotification::InputFocusChange(_) => "input_focus_change",
            HostNotification::Popup { .. } => "popup",
            HostNotification::PopupDestroyed(_) => "popup_destroyed",
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.tag());
        match self {
            HostNotification::UrlChange(s)
            | HostNotification::LoadStart(s)
            | HostNotification::LoadFinish(s)
            | HostNotification::TitleChange(s) => wire::put_str(dst, s),
            HostNotification::ProgressChange(p) => dst.put_f64_le(*p),
            HostNotification::Fullscreen(b) | HostNotification::InputFocusChange(b) => {
                wire::put_bool(dst, *b)
            }
            HostNotification::Ready => {}
            HostNotification::Popup { popup, url } => {
                dst.put_u64_le(popup.0);
                wire::put_str(dst, url);
            }
            HostNotification::PopupDestroyed(popup) => dst.put_u64_le(popup.0),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut src = WireReader::new(payload);
        if src.remaining() == 0 {
            return Err(CodecError::Empty);
        }
        let notification = match src.u8("tag")? {
            0x01 => HostNotification::UrlChange(src.string("url")?),
            0x02 => HostNotification::LoadStart(src.string("url")?),
            0x03 => HostNotification::LoadFinish(src.string("url")?),
            0x04 => HostNotification::TitleChange(src.string("title")?),
            0x05 => HostNotification::ProgressChange(src.f64("progress")?),
            0x06 => HostNotification::Fullscreen(src.bool("fullscreen")?),
            0x07 => HostNotification::Ready,
            0x08 => HostNotification::InputFocusChange(src.bool("focused")?),
            0x09 => HostNotification::Popup {
                popup: PopupId(src.u64("popup")?),
                url: src.string("url")?,
            },
            0x0a => HostNotification::PopupDestroyed(PopupId(src.u64("popup")?)),
            tag => {
                return Err(CodecError::UnknownTag {
                    family: Self::FAMILY,
                    tag,
                })
            }
        };
        src.finish(Self::FAMILY)?;
        Ok(notification)
    }
}

/// The engine's answer to an [`EngineCall`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack,
    /// One BGRA frame. Empty when the engine has nothing painted yet.
    Pixels(Bytes),
    ScrollPosition { x: f32, y: f32 },
    ZoomLevel(f64),
}

impl Reply {
    const FAMILY: &'static str = "reply";

    pub fn tag(&self) -> u8 {
        match self {
            Reply::Ack => 0x01,
            Reply::Pixels(_) => 0x02,
            Reply::ScrollPosition { .. } => 0x03,
            Reply::ZoomLevel(_) => 0x04,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Reply::Ack => "ack",
            Reply::Pixels(_) => "pixels",
            Reply::ScrollPosition { .. } => "scroll_position",
            Reply::ZoomLevel(_) => "zoom_level",
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.tag());
        match self {
            Reply::Ack => {}
            Reply::Pixels(pixels) => wire::put_bytes(dst, pixels),
            Reply::ScrollPosition { x, y } => {
                dst.put_f32_le(*x);
                dst.put_f32_le(*y);
            }
            Reply::ZoomLevel(level) => dst.put_f64_le(*level),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a reply. Pixel data is sliced from `payload` without copying.
    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut src = WireReader::new(payload);
        if src.remaining() == 0 {
            return Err(CodecError::Empty);
        }
        let reply = match src.u8("tag")? {
            0x01 => Reply::Ack,
            0x02 => Reply::Pixels(src.bytes("pixels")?),
            0x03 => Reply::ScrollPosition {
                x: src.f32("scroll.x")?,
                y: src.f32("scroll.y")?,
            },
            0x04 => Reply::ZoomLevel(src.f64("zoom_level")?),
            tag => {
                return Err(CodecError::UnknownTag {
                    family: Self::FAMILY,
                    tag,
                })
            }
        };
        src.finish(Self::FAMILY)?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{MouseAction, MouseButton};

    fn all_engine_calls() -> Vec<EngineCall> {
        vec![
            EngineCall::GetPixels,
            EngineCall::Shutdown,
            EngineCall::Keyboard(KeyboardEvent::default()),
            EngineCall::Keyboard(KeyboardEvent {
                keys_up: vec![17],
                keys_down: vec![65, 66, -1],
                chars: "ab✓".into(),
            }),
            EngineCall::MouseMove(MouseMoveEvent { x: -4, y: 900 }),
            EngineCall::MouseClick(MouseClickEvent {
                x: 10,
                y: 20,
                click_count: 2,
                button: MouseButton::Right,
                action: MouseAction::Up,
            }),
            EngineCall::MouseScroll(MouseScrollEvent {
                x: 1,
                y: 2,
                delta: -120,
            }),
            EngineCall::GoForward,
            EngineCall::GoBack,
            EngineCall::Refresh,
            EngineCall::LoadUrl(String::new()),
            EngineCall::LoadUrl("https://example.org/".into()),
            EngineCall::LoadHtml("<p>hi</p>".into()),
            EngineCall::ExecuteJs("console.log(1)".into()),
            EngineCall::Resize(Resolution::new(400, 300)),
            EngineCall::GetScrollPosition,
            EngineCall::SetZoomLevel(-1.5),
            EngineCall::GetZoomLevel,
            EngineCall::OpenDevTools,
            EngineCall::AudioMute(true),
            EngineCall::PopupExecuteJs {
                popup: PopupId(7),
                js: "window.close()".into(),
            },
            EngineCall::PopupClose(PopupId(u64::MAX)),
        ]
    }

    #[test]
    fn every_engine_call_survives_the_wire() {
        for call in all_engine_calls() {
            let decoded = EngineCall::decode(call.to_bytes()).unwrap();
            assert_eq!(decoded, call, "{}", call.name());
        }
    }

    #[test]
    fn every_notification_survives_the_wire() {
        let all = [
            HostNotification::UrlChange("about:blank".into()),
            HostNotification::LoadStart(String::new()),
            HostNotification::LoadFinish("https://example.org/".into()),
            HostNotification::TitleChange("Ünïcode".into()),
            HostNotification::ProgressChange(0.75),
            HostNotification::Fullscreen(false),
            HostNotification::Ready,
            HostNotification::InputFocusChange(true),
            HostNotification::Popup {
                popup: PopupId(1),
                url: "https://example.org/ad".into(),
            },
            HostNotification::PopupDestroyed(PopupId(1)),
        ];
        for n in all {
            assert_eq!(HostNotification::decode(n.to_bytes()).unwrap(), n);
        }
    }

    #[test]
    fn every_reply_survives_the_wire() {
        let all = [
            Reply::Ack,
            Reply::Pixels(Bytes::new()),
            Reply::Pixels(Bytes::from(vec![1u8; 64])),
            Reply::ScrollPosition { x: 0.5, y: 300.0 },
            Reply::ZoomLevel(2.0),
        ];
        for r in all {
            assert_eq!(Reply::decode(r.to_bytes()).unwrap(), r);
        }
    }

    #[test]
    fn tags_are_unique() {
        let mut tags: Vec<u8> = all_engine_calls().iter().map(EngineCall::tag).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), 20);
    }

    #[test]
    fn unknown_tag_is_malformed() {
        assert_eq!(
            EngineCall::decode(Bytes::from_static(&[0xee])),
            Err(CodecError::UnknownTag {
                family: "engine call",
                tag: 0xee
            })
        );
        assert!(matches!(
            HostNotification::decode(Bytes::from_static(&[0x00])),
            Err(CodecError::UnknownTag { .. })
        ));
    }

    #[test]
    fn empty_payload_is_malformed() {
        assert_eq!(Reply::decode(Bytes::new()), Err(CodecError::Empty));
    }

    #[test]
    fn string_length_past_end_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x0a);
        buf.put_u32_le(100);
        buf.put_slice(b"short");
        assert!(matches!(
            EngineCall::decode(buf.freeze()),
            Err(CodecError::Truncated { field: "url", .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut buf = BytesMut::new();
        EngineCall::GoBack.encode(&mut buf);
        buf.put_u8(0);
        assert!(matches!(
            EngineCall::decode(buf.freeze()),
            Err(CodecError::TrailingBytes { count: 1, .. })
        ));
    }

    #[test]
    fn truncated_input_never_panics() {
        let full = EngineCall::MouseClick(MouseClickEvent {
            x: 1,
            y: 2,
            click_count: 1,
            button: MouseButton::Middle,
            action: MouseAction::Down,
        })
        .to_bytes();
        for len in 1..full.len() {
            assert!(EngineCall::decode(full.slice(..len)).is_err(), "len {len}");
        }
    }
}
