use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Bytes per pixel in a frame buffer (BGRA).
pub const BYTES_PER_PIXEL: usize = 4;

/// What a `Pixels` reply adds to the frame itself: call id, reply tag and
/// pixel length.
pub const FRAME_REPLY_OVERHEAD: usize = 4 + 1 + 4;

/// Size of the offscreen surface in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Length of one BGRA frame at this resolution.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Check that a frame at this size can travel in one payload of at most
    /// `max_payload` bytes. The error is a human-readable reason.
    pub fn check_fits(&self, max_payload: usize) -> Result<(), String> {
        if self.is_empty() {
            return Err(format!("must be non-zero, got {self}"));
        }
        let needed = self.byte_len().saturating_add(FRAME_REPLY_OVERHEAD);
        if needed > max_payload {
            return Err(format!(
                "{self} needs {needed} bytes per frame, over the {max_payload} byte payload limit"
            ));
        }
        Ok(())
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Parses `WIDTHxHEIGHT`, e.g. `800x600`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("invalid resolution '{s}' (expected WIDTHxHEIGHT)"))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid width '{w}': {e}"))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid height '{h}': {e}"))?;
        if width == 0 || height == 0 {
            return Err(format!("resolution must be non-zero, got {s}"));
        }
        Ok(Self::new(width, height))
    }
}

/// RGBA color, written as `rrggbbaa` on the engine command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_hex(&self) -> String {
        format!("{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
    }

    /// BGRA byte order, as laid out in a frame buffer.
    pub fn to_bgra(&self) -> [u8; 4] {
        [self.b, self.g, self.r, self.a]
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::WHITE
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Color {
    type Err = String;

    /// Parses `rrggbb` or `rrggbbaa`, with or without a leading `#`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        if !matches!(hex.len(), 6 | 8) || !hex.is_ascii() {
            return Err(format!("invalid color '{s}' (expected rrggbb or rrggbbaa)"));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| format!("invalid color '{s}'"))
        };
        let a = if hex.len() == 8 { channel(6)? } else { 255 };
        Ok(Color::rgba(channel(0)?, channel(2)?, channel(4)?, a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_is_bgra() {
        assert_eq!(Resolution::new(800, 600).byte_len(), 800 * 600 * 4);
    }

    #[test]
    fn frames_must_fit_the_payload_limit() {
        let limit = 64 * 1024 * 1024;
        assert!(Resolution::new(1920, 1080).check_fits(limit).is_ok());
        assert!(Resolution::new(4096, 4096).check_fits(limit).is_err());
        assert!(Resolution::new(4200, 4200).check_fits(limit).is_err());

        let exact = Resolution::new(16, 16);
        assert!(exact.check_fits(exact.byte_len() + FRAME_REPLY_OVERHEAD).is_ok());
        assert!(exact.check_fits(exact.byte_len()).is_err());

        let err = Resolution::new(0, 600).check_fits(limit).unwrap_err();
        assert!(err.contains("non-zero"), "{err}");
    }

    #[test]
    fn resolution_parse_and_display() {
        let res: Resolution = "400x300".parse().unwrap();
        assert_eq!(res, Resolution::new(400, 300));
        assert_eq!(res.to_string(), "400x300");
        assert!("0x10".parse::<Resolution>().is_err());
        assert!("800".parse::<Resolution>().is_err());
    }

    #[test]
    fn color_hex_forms() {
        let opaque: Color = "#1e90ff".parse().unwrap();
        assert_eq!(opaque, Color::rgba(0x1e, 0x90, 0xff, 0xff));
        assert_eq!(opaque.to_hex(), "1e90ffff");

        let translucent: Color = "00000080".parse().unwrap();
        assert_eq!(translucent.a, 0x80);
        assert_eq!(translucent.to_bgra(), [0, 0, 0, 0x80]);

        assert!("12345".parse::<Color>().is_err());
        assert!("zzzzzz".parse::<Color>().is_err());
    }
}
