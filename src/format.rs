// SPDX-License-Identifier: MPL-2.0

//! Pixel format taxonomy shared by the capture backends and the conversion
//! engine.
//!
//! A [`PixelFormat`] is a 32-bit tag whose bits encode categorical
//! information, so the common predicates (`is_yuv`, `is_rgb`, ...) are plain
//! bitwise tests. The bit assignments follow the wire-stable layout used by
//! the property API, where formats travel as `f64`-encoded integers.

use serde::{Deserialize, Serialize};

/// Bit constants composing [`PixelFormat`] values.
pub mod bits {
    /// Byte-order indicator: R comes first (RGB24 / RGBA32).
    pub const RGB_ORDER: u32 = 1 << 3;
    /// Byte-order indicator: B comes first (BGR24 / BGRA32).
    pub const BGR_ORDER: u32 = 1 << 4;
    /// YUV family.
    pub const YUV: u32 = 1 << 16;
    /// Full-range luma (Y in 0..=255); absent means video range (16..=235).
    pub const FULL_RANGE: u32 = 1 << 17;
    /// RGB family (RGB24/BGR24/RGBA32/BGRA32).
    pub const RGB_COLOR: u32 = 1 << 18;
    /// Has an alpha channel (RGBA32/BGRA32).
    pub const ALPHA: u32 = 1 << 19;
}

/// Pixel format of a frame or a conversion endpoint.
///
/// When used to *request* a capture format the backend may downgrade to a
/// supported one; the format actually delivered is always recorded on the
/// frame itself.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Unknown = 0,

    /// YUV 4:2:0 semi-planar (Y plane + interleaved UV plane).
    Nv12 = 1 | bits::YUV,
    /// Full-range NV12.
    Nv12Full = 1 | bits::YUV | bits::FULL_RANGE,

    /// YUV 4:2:0 planar (Y, U, V planes). Also known as YUV420P / IYUV.
    I420 = 4 | bits::YUV,
    /// Full-range I420.
    I420Full = 4 | bits::YUV | bits::FULL_RANGE,

    /// Packed YUV 4:2:2, byte order `Y0 U Y1 V`.
    Yuyv = 8 | bits::YUV,
    /// Full-range YUYV.
    YuyvFull = 8 | bits::YUV | bits::FULL_RANGE,

    /// Packed YUV 4:2:2, byte order `U Y0 V Y1`.
    Uyvy = 16 | bits::YUV,
    /// Full-range UYVY.
    UyvyFull = 16 | bits::YUV | bits::FULL_RANGE,

    /// 3 bytes per pixel, R first.
    Rgb24 = bits::RGB_COLOR | bits::RGB_ORDER,
    /// 3 bytes per pixel, B first.
    Bgr24 = bits::RGB_COLOR | bits::BGR_ORDER,
    /// 4 bytes per pixel, alpha filled with 0xFF.
    Rgba32 = bits::RGB_COLOR | bits::RGB_ORDER | bits::ALPHA,
    /// 4 bytes per pixel, alpha filled with 0xFF.
    Bgra32 = bits::RGB_COLOR | bits::BGR_ORDER | bits::ALPHA,
}

impl PixelFormat {
    /// Every recognized format, used by [`PixelFormat::from_bits`].
    pub const ALL: [PixelFormat; 13] = [
        PixelFormat::Unknown,
        PixelFormat::Nv12,
        PixelFormat::Nv12Full,
        PixelFormat::I420,
        PixelFormat::I420Full,
        PixelFormat::Yuyv,
        PixelFormat::YuyvFull,
        PixelFormat::Uyvy,
        PixelFormat::UyvyFull,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Rgba32,
        PixelFormat::Bgra32,
    ];

    /// The raw bit pattern of this format.
    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Reconstructs a format from its bit pattern.
    pub fn from_bits(value: u32) -> Option<PixelFormat> {
        Self::ALL.iter().copied().find(|f| f.bits() == value)
    }

    /// True for the YUV family (NV12/I420/YUYV/UYVY and their full-range
    /// variants).
    #[inline]
    pub const fn is_yuv(self) -> bool {
        self.bits() & bits::YUV != 0
    }

    /// True for the RGB family (RGB24/BGR24/RGBA32/BGRA32).
    #[inline]
    pub const fn is_rgb(self) -> bool {
        self.bits() & bits::RGB_COLOR != 0
    }

    /// True when the format carries an alpha channel.
    #[inline]
    pub const fn has_alpha(self) -> bool {
        self.bits() & bits::ALPHA != 0
    }

    /// True when the blue channel comes first (BGR24/BGRA32).
    #[inline]
    pub const fn is_bgr_like(self) -> bool {
        self.bits() & bits::BGR_ORDER != 0
    }

    /// True for full-range luma variants.
    #[inline]
    pub const fn is_full_range(self) -> bool {
        self.bits() & bits::FULL_RANGE != 0
    }

    /// Checks whether this format includes every bit of `mask`.
    #[inline]
    pub const fn includes(self, mask: u32) -> bool {
        self.bits() & mask == mask
    }

    /// Bytes per pixel of plane 0 for the packed formats; 1 for the planar
    /// YUV formats (their chroma lives in separate planes).
    pub const fn plane0_bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => 4,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Yuyv
            | PixelFormat::YuyvFull
            | PixelFormat::Uyvy
            | PixelFormat::UyvyFull => 2,
            _ => 1,
        }
    }

    /// Stable display name, also used for dump file suffixes.
    pub const fn name(self) -> &'static str {
        match self {
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Nv12Full => "NV12f",
            PixelFormat::I420 => "I420",
            PixelFormat::I420Full => "I420f",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::YuyvFull => "YUYVf",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::UyvyFull => "UYVYf",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Rgba32 => "RGBA32",
            PixelFormat::Bgra32 => "BGRA32",
            PixelFormat::Unknown => "Unknown",
        }
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::Unknown
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Row order of a frame's pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameOrientation {
    /// The first row of data is the top row of the image. YUV frames are
    /// always delivered this way; RGB frames are on most platforms.
    TopToBottom,
    /// The first row of data is the bottom row of the image. Windows
    /// delivers RGB frames this way.
    BottomToTop,
}

impl Default for FrameOrientation {
    fn default() -> Self {
        FrameOrientation::TopToBottom
    }
}

impl std::fmt::Display for FrameOrientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameOrientation::TopToBottom => write!(f, "top-to-bottom"),
            FrameOrientation::BottomToTop => write!(f, "bottom-to-top"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv_and_rgb_are_mutually_exclusive() {
        for format in PixelFormat::ALL {
            assert!(
                !(format.is_yuv() && format.is_rgb()),
                "{format} claims both YUV and RGB"
            );
        }
    }

    #[test]
    fn alpha_implies_rgb() {
        for format in PixelFormat::ALL {
            if format.has_alpha() {
                assert!(format.is_rgb(), "{format} has alpha but is not RGB");
            }
        }
    }

    #[test]
    fn full_range_variants_include_base_format() {
        assert!(PixelFormat::Nv12Full.includes(PixelFormat::Nv12.bits()));
        assert!(PixelFormat::I420Full.includes(PixelFormat::I420.bits()));
        assert!(PixelFormat::YuyvFull.includes(PixelFormat::Yuyv.bits()));
        assert!(PixelFormat::UyvyFull.includes(PixelFormat::Uyvy.bits()));
        assert!(!PixelFormat::Nv12.includes(PixelFormat::Nv12Full.bits()));
    }

    #[test]
    fn bits_round_trip() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_bits(format.bits()), Some(format));
        }
        assert_eq!(PixelFormat::from_bits(0xDEAD_BEEF), None);
    }

    #[test]
    fn bgr_like_detection() {
        assert!(PixelFormat::Bgr24.is_bgr_like());
        assert!(PixelFormat::Bgra32.is_bgr_like());
        assert!(!PixelFormat::Rgb24.is_bgr_like());
        assert!(!PixelFormat::Nv12.is_bgr_like());
    }
}
