use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use v4l::FourCC;

use crate::error::CaptureError;

/// Logical name of the MJPEG encoding.
pub const PIXELFORMAT_JPEG: &str = "JPEG";
/// Logical name of the packed YUV 4:2:2 encoding.
pub const PIXELFORMAT_YUYV: &str = "YUYV";

/// Pixel encodings the pipeline knows how to negotiate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum PixelFormat {
    Jpeg,
    Yuyv,
    /// Driver format we pass through by description only
    Other(String),
}

impl PixelFormat {
    /// Maps a logical encoding name ("JPEG", "YUYV") to a format.
    pub fn from_name(name: &str) -> Self {
        match name {
            PIXELFORMAT_JPEG => PixelFormat::Jpeg,
            PIXELFORMAT_YUYV => PixelFormat::Yuyv,
            other => PixelFormat::Other(other.to_string()),
        }
    }

    /// Classifies a driver format description such as "Motion-JPEG" or
    /// "YUYV 4:2:2".
    pub fn from_description(description: &str) -> Self {
        if description.contains(PIXELFORMAT_JPEG) {
            PixelFormat::Jpeg
        } else if description.contains(PIXELFORMAT_YUYV) {
            PixelFormat::Yuyv
        } else {
            PixelFormat::Other(description.to_string())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PixelFormat::Jpeg => PIXELFORMAT_JPEG,
            PixelFormat::Yuyv => PIXELFORMAT_YUYV,
            PixelFormat::Other(desc) => desc,
        }
    }

    /// Driver format code, `None` for pass-through formats
    pub fn fourcc(&self) -> Option<FourCC> {
        match self {
            PixelFormat::Jpeg => Some(FourCC::new(b"MJPG")),
            PixelFormat::Yuyv => Some(FourCC::new(b"YUYV")),
            PixelFormat::Other(_) => None,
        }
    }

    /// Bytes per decoded output frame for this format.
    ///
    /// JPEG decodes to RGB with rows padded to 4 bytes; everything else is
    /// expanded to 4 bytes per pixel.
    pub fn output_len(&self, width: u32, height: u32) -> usize {
        match self {
            PixelFormat::Jpeg => align4(width as usize * 3) * height as usize,
            _ => width as usize * height as usize * 4,
        }
    }

    pub fn channels(&self) -> u32 {
        match self {
            PixelFormat::Jpeg => 3,
            _ => 4,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<String> for PixelFormat {
    fn from(name: String) -> Self {
        PixelFormat::from_name(&name)
    }
}

impl From<PixelFormat> for String {
    fn from(format: PixelFormat) -> Self {
        format.name().to_string()
    }
}

/// Rounds a row length up to the next multiple of 4 bytes.
pub fn align4(row_bytes: usize) -> usize {
    (row_bytes + 3) & !3
}

/// Frame geometry, written and parsed as `W*H` (`WxH` is accepted too)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CaptureError::Resolution(s.to_string());
        let (w, h) = s
            .trim()
            .split_once(['*', 'x', 'X'])
            .ok_or_else(invalid)?;
        let width = w.trim().parse::<u32>().map_err(|_| invalid())?;
        let height = h.trim().parse::<u32>().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

/// Negotiated capture format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl StreamFormat {
    pub fn output_len(&self) -> usize {
        self.pixel_format.output_len(self.width, self.height)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Read-only view of one dequeued kernel buffer.
///
/// Borrowed from the buffer pool and valid only until that index is
/// requeued; never retain the bytes past the `sample()` call.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub index: u32,
    pub sequence: u32,
    pub data: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_parses_both_separators() {
        assert_eq!(
            "1280*720".parse::<Resolution>().unwrap(),
            Resolution::new(1280, 720)
        );
        assert_eq!(
            "640x480".parse::<Resolution>().unwrap(),
            Resolution::new(640, 480)
        );
        assert!("1280".parse::<Resolution>().is_err());
        assert!("0*720".parse::<Resolution>().is_err());
        assert!("".parse::<Resolution>().is_err());
    }

    #[test]
    fn resolution_displays_with_star() {
        assert_eq!(Resolution::new(800, 600).to_string(), "800*600");
    }

    #[test]
    fn description_classification() {
        assert_eq!(
            PixelFormat::from_description("Motion-JPEG"),
            PixelFormat::Jpeg
        );
        assert_eq!(
            PixelFormat::from_description("YUYV 4:2:2"),
            PixelFormat::Yuyv
        );
        assert_eq!(
            PixelFormat::from_description("H.264"),
            PixelFormat::Other("H.264".into())
        );
    }

    #[test]
    fn output_sizes_follow_format() {
        // 3 * 3 = 9 bytes per row, padded to 12
        assert_eq!(PixelFormat::Jpeg.output_len(3, 2), 24);
        assert_eq!(PixelFormat::Yuyv.output_len(3, 2), 24);
        assert_eq!(PixelFormat::Jpeg.output_len(1280, 720), 1280 * 3 * 720);
        assert_eq!(PixelFormat::Other("NV12".into()).output_len(4, 4), 64);
    }

    #[test]
    fn fourcc_mapping() {
        assert_eq!(PixelFormat::Jpeg.fourcc(), Some(FourCC::new(b"MJPG")));
        assert_eq!(PixelFormat::Yuyv.fourcc(), Some(FourCC::new(b"YUYV")));
        assert!(PixelFormat::Other("GREY".into()).fourcc().is_none());
    }
}
