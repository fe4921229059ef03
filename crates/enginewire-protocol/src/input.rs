use bytes::{BufMut, BytesMut};

use crate::error::{CodecError, Result};
use crate::wire::{self, WireReader};

/// Keys released, keys pressed and text typed since the previous event.
///
/// Key codes are the host toolkit's virtual key codes; the engine maps them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyboardEvent {
    pub keys_up: Vec<i32>,
    pub keys_down: Vec<i32>,
    pub chars: String,
}

impl KeyboardEvent {
    pub fn is_empty(&self) -> bool {
        self.keys_up.is_empty() && self.keys_down.is_empty() && self.chars.is_empty()
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        wire::put_str(dst, &self.chars);
        wire::put_i32_array(dst, &self.keys_down);
        wire::put_i32_array(dst, &self.keys_up);
    }

    pub(crate) fn decode(src: &mut WireReader) -> Result<Self> {
        let chars = src.string("keyboard.chars")?;
        let keys_down = src.i32_array("keyboard.keys_down")?;
        let keys_up = src.i32_array("keyboard.keys_up")?;
        Ok(Self {
            keys_up,
            keys_down,
            chars,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MouseMoveEvent {
    pub x: i32,
    pub y: i32,
}

impl MouseMoveEvent {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.x);
        dst.put_i32_le(self.y);
    }

    pub(crate) fn decode(src: &mut WireReader) -> Result<Self> {
        Ok(Self {
            x: src.i32("mouse_move.x")?,
            y: src.i32("mouse_move.y")?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum MouseButton {
    #[default]
    Left = 0,
    Middle = 1,
    Right = 2,
}

impl MouseButton {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MouseButton::Left),
            1 => Ok(MouseButton::Middle),
            2 => Ok(MouseButton::Right),
            other => Err(CodecError::InvalidDiscriminant {
                field: "mouse_click.button",
                value: u32::from(other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum MouseAction {
    #[default]
    Down = 0,
    Up = 1,
}

impl MouseAction {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MouseAction::Down),
            1 => Ok(MouseAction::Up),
            other => Err(CodecError::InvalidDiscriminant {
                field: "mouse_click.action",
                value: u32::from(other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MouseClickEvent {
    pub x: i32,
    pub y: i32,
    pub click_count: i32,
    pub button: MouseButton,
    pub action: MouseAction,
}

impl MouseClickEvent {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.x);
        dst.put_i32_le(self.y);
        dst.put_i32_le(self.click_count);
        dst.put_u8(self.button as u8);
        dst.put_u8(self.action as u8);
    }

    pub(crate) fn decode(src: &mut WireReader) -> Result<Self> {
        Ok(Self {
            x: src.i32("mouse_click.x")?,
            y: src.i32("mouse_click.y")?,
            click_count: src.i32("mouse_click.click_count")?,
            button: MouseButton::from_u8(src.u8("mouse_click.button")?)?,
            action: MouseAction::from_u8(src.u8("mouse_click.action")?)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MouseScrollEvent {
    pub x: i32,
    pub y: i32,
    pub delta: i32,
}

impl MouseScrollEvent {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.x);
        dst.put_i32_le(self.y);
        dst.put_i32_le(self.delta);
    }

    pub(crate) fn decode(src: &mut WireReader) -> Result<Self> {
        Ok(Self {
            x: src.i32("mouse_scroll.x")?,
            y: src.i32("mouse_scroll.y")?,
            delta: src.i32("mouse_scroll.delta")?,
        })
    }
}
