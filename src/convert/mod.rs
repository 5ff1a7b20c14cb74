// SPDX-License-Identifier: MPL-2.0

//! Pixel-conversion engine.
//!
//! Transforms raw camera frames between the supported pixel formats,
//! optionally flipping vertically. Every low-level function accepts a
//! signed `height`: a negative value means "write destination rows in
//! reverse order while reading the source in natural order".
//!
//! The scalar path is the reference implementation; the AVX2 and NEON
//! backends produce byte-identical output (they accumulate the fixed-point
//! products in 32 bits), and the Apple Accelerate backend is allowed to
//! differ by at most one LSB.

mod frame_convert;
mod scalar;

#[cfg(target_os = "macos")]
mod apple;
#[cfg(target_arch = "x86_64")]
mod avx2;
#[cfg(target_arch = "aarch64")]
mod neon;

pub use frame_convert::convert_frame_in_place;

use std::sync::atomic::{AtomicBool, Ordering};

/// Color-space and range selection for the YUV → RGB conversions.
///
/// Exactly four combinations are recognized: {BT601, BT709} × {FullRange,
/// VideoRange}. The default is BT.601 video range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertFlag(u32);

impl ConvertFlag {
    pub const BT601: ConvertFlag = ConvertFlag(0x1);
    pub const BT709: ConvertFlag = ConvertFlag(0x2);
    pub const FULL_RANGE: ConvertFlag = ConvertFlag(0x10);
    pub const VIDEO_RANGE: ConvertFlag = ConvertFlag(0x20);
    pub const DEFAULT: ConvertFlag = ConvertFlag(0x1 | 0x20);

    #[inline]
    pub const fn contains(self, other: ConvertFlag) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for ConvertFlag {
    type Output = ConvertFlag;
    fn bitor(self, rhs: ConvertFlag) -> ConvertFlag {
        ConvertFlag(self.0 | rhs.0)
    }
}

impl Default for ConvertFlag {
    fn default() -> Self {
        ConvertFlag::DEFAULT
    }
}

/// Fixed-point YUV → RGB coefficients, scaled by 64.
///
/// `R = clamp((cy·(Y-y_offset) + cr·(V-128) + 32) >> 6)` and so on. These
/// values are normative; every backend reproduces them exactly.
#[derive(Debug, Clone, Copy)]
pub(crate) struct YuvCoefficients {
    pub cy: i32,
    pub cr: i32,
    pub cgu: i32,
    pub cgv: i32,
    pub cb: i32,
    pub y_offset: i32,
}

pub(crate) fn yuv_coefficients(flag: ConvertFlag) -> YuvCoefficients {
    let is_601 = flag.contains(ConvertFlag::BT601);
    let full_range = flag.contains(ConvertFlag::FULL_RANGE);
    match (is_601, full_range) {
        (true, true) => YuvCoefficients {
            cy: 64,
            cr: 88,
            cgu: 22,
            cgv: 45,
            cb: 111,
            y_offset: 0,
        },
        (true, false) => YuvCoefficients {
            cy: 75,
            cr: 102,
            cgu: 25,
            cgv: 52,
            cb: 129,
            y_offset: 16,
        },
        (false, true) => YuvCoefficients {
            cy: 64,
            cr: 101,
            cgu: 12,
            cgv: 30,
            cb: 119,
            y_offset: 0,
        },
        (false, false) => YuvCoefficients {
            cy: 75,
            cr: 115,
            cgu: 14,
            cgv: 34,
            cb: 135,
            y_offset: 16,
        },
    }
}

#[inline(always)]
pub(crate) fn yuv_to_rgb_pixel(c: &YuvCoefficients, y: i32, u: i32, v: i32) -> (u8, u8, u8) {
    let y = (y - c.y_offset) * c.cy;
    let u = u - 128;
    let v = v - 128;
    let r = (y + c.cr * v + 32) >> 6;
    let g = (y - c.cgu * u - c.cgv * v + 32) >> 6;
    let b = (y + c.cb * u + 32) >> 6;
    (
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    )
}

///////////// backend capability and selection /////////////

static ENABLE_AVX2: AtomicBool = AtomicBool::new(true);
static ENABLE_NEON: AtomicBool = AtomicBool::new(true);
static ENABLE_APPLE_ACCELERATE: AtomicBool = AtomicBool::new(true);

/// True when the CPU and OS support AVX2. Detected once per process.
pub fn has_avx2() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        use std::sync::OnceLock;
        static DETECTED: OnceLock<bool> = OnceLock::new();
        *DETECTED.get_or_init(|| is_x86_feature_detected!("avx2"))
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// Enables or disables the AVX2 implementation; returns whether AVX2 is
/// available and enabled afterwards.
pub fn enable_avx2(enable: bool) -> bool {
    ENABLE_AVX2.store(enable, Ordering::Relaxed);
    has_avx2() && enable
}

pub fn can_use_avx2() -> bool {
    ENABLE_AVX2.load(Ordering::Relaxed) && has_avx2()
}

/// NEON is mandatory on AArch64; 32-bit ARM is not accelerated.
pub fn has_neon() -> bool {
    cfg!(target_arch = "aarch64")
}

pub fn enable_neon(enable: bool) -> bool {
    ENABLE_NEON.store(enable, Ordering::Relaxed);
    has_neon() && enable
}

pub fn can_use_neon() -> bool {
    ENABLE_NEON.load(Ordering::Relaxed) && has_neon()
}

/// Apple's Accelerate framework is available on every Apple OS.
pub fn has_apple_accelerate() -> bool {
    cfg!(target_vendor = "apple")
}

pub fn enable_apple_accelerate(enable: bool) -> bool {
    ENABLE_APPLE_ACCELERATE.store(enable, Ordering::Relaxed);
    has_apple_accelerate() && enable
}

pub fn can_use_apple_accelerate() -> bool {
    ENABLE_APPLE_ACCELERATE.load(Ordering::Relaxed) && has_apple_accelerate()
}

/// Conversion backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertBackend {
    /// Use the best backend available at runtime.
    Auto,
    /// Scalar implementation only.
    Cpu,
    Avx2,
    AppleAccelerate,
    Neon,
}

/// The backend the next conversion will use, in priority order
/// Apple Accelerate → AVX2 → NEON → scalar.
pub fn convert_backend() -> ConvertBackend {
    if can_use_apple_accelerate() {
        ConvertBackend::AppleAccelerate
    } else if can_use_avx2() {
        ConvertBackend::Avx2
    } else if can_use_neon() {
        ConvertBackend::Neon
    } else {
        ConvertBackend::Cpu
    }
}

/// Forces a specific conversion backend.
///
/// Selecting a SIMD backend disables the others; `Auto` re-enables all of
/// them and `Cpu` disables all SIMD. Returns false when the requested
/// backend is unavailable on this host.
pub fn set_convert_backend(backend: ConvertBackend) -> bool {
    match backend {
        ConvertBackend::Auto => {
            enable_apple_accelerate(true);
            enable_avx2(true);
            enable_neon(true);
            true
        }
        ConvertBackend::Avx2 => {
            enable_apple_accelerate(false);
            enable_neon(false);
            enable_avx2(true)
        }
        ConvertBackend::AppleAccelerate => {
            enable_avx2(false);
            enable_neon(false);
            enable_apple_accelerate(true)
        }
        ConvertBackend::Neon => {
            enable_apple_accelerate(false);
            enable_avx2(false);
            enable_neon(true)
        }
        ConvertBackend::Cpu => {
            enable_apple_accelerate(false);
            enable_avx2(false);
            enable_neon(false);
            true
        }
    }
}

///////////// channel shuffle (RGB family ↔ RGB family) /////////////

/// Permutes RGB channels row by row.
///
/// `IN`/`OUT` are the source/destination channel counts (3 or 4); `SWAP`
/// exchanges R and B. Going 3→4 fills alpha with 0xFF; going 4→3 drops the
/// alpha byte. Negative `height` writes destination rows bottom-up.
pub fn color_shuffle<const IN: usize, const OUT: usize, const SWAP: bool>(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: i32,
    height: i32,
) {
    debug_assert!(IN == 3 || IN == 4);
    debug_assert!(OUT == 3 || OUT == 4);
    debug_assert!(IN != OUT || SWAP, "identity shuffle is a plain copy");

    #[cfg(target_os = "macos")]
    if can_use_apple_accelerate() {
        apple::color_shuffle::<IN, OUT, SWAP>(src, src_stride, dst, dst_stride, width, height);
        return;
    }
    #[cfg(target_arch = "x86_64")]
    if can_use_avx2() {
        // Safety: AVX2 support was verified at runtime.
        unsafe {
            avx2::color_shuffle::<IN, OUT, SWAP>(src, src_stride, dst, dst_stride, width, height);
        }
        return;
    }
    #[cfg(target_arch = "aarch64")]
    if can_use_neon() {
        unsafe {
            neon::color_shuffle::<IN, OUT, SWAP>(src, src_stride, dst, dst_stride, width, height);
        }
        return;
    }
    scalar::color_shuffle::<IN, OUT, SWAP>(src, src_stride, dst, dst_stride, width, height);
}

macro_rules! shuffle_alias {
    ($(#[$doc:meta])* $name:ident, $in:literal, $out:literal, $swap:literal) => {
        $(#[$doc])*
        pub fn $name(
            src: &[u8],
            src_stride: usize,
            dst: &mut [u8],
            dst_stride: usize,
            width: i32,
            height: i32,
        ) {
            color_shuffle::<$in, $out, $swap>(src, src_stride, dst, dst_stride, width, height);
        }
    };
}

shuffle_alias!(
    /// RGBA → BGRA (and, by symmetry, BGRA → RGBA).
    rgba_to_bgra, 4, 4, true
);
shuffle_alias!(
    /// RGBA → BGR: swap R and B, drop alpha.
    rgba_to_bgr, 4, 3, true
);
shuffle_alias!(
    /// RGBA → RGB: drop the alpha byte.
    rgba_to_rgb, 4, 3, false
);
shuffle_alias!(
    /// RGB → BGRA: swap R and B, fill alpha with 0xFF.
    rgb_to_bgra, 3, 4, true
);
shuffle_alias!(
    /// RGB → RGBA: fill alpha with 0xFF.
    rgb_to_rgba, 3, 4, false
);
shuffle_alias!(
    /// RGB → BGR (and BGR → RGB).
    rgb_to_bgr, 3, 3, true
);

///////////// YUV → RGB entry points /////////////

fn nv12_dispatch<const BGR: bool, const ALPHA: bool>(
    src_y: &[u8],
    src_y_stride: usize,
    src_uv: &[u8],
    src_uv_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: i32,
    height: i32,
    flag: ConvertFlag,
) {
    #[cfg(target_os = "macos")]
    if can_use_apple_accelerate() {
        apple::nv12_to_rgb::<BGR, ALPHA>(
            src_y,
            src_y_stride,
            src_uv,
            src_uv_stride,
            dst,
            dst_stride,
            width,
            height,
            flag,
        );
        return;
    }
    #[cfg(target_arch = "x86_64")]
    if can_use_avx2() {
        unsafe {
            avx2::nv12_to_rgb::<BGR, ALPHA>(
                src_y,
                src_y_stride,
                src_uv,
                src_uv_stride,
                dst,
                dst_stride,
                width,
                height,
                flag,
            );
        }
        return;
    }
    #[cfg(target_arch = "aarch64")]
    if can_use_neon() {
        unsafe {
            neon::nv12_to_rgb::<BGR, ALPHA>(
                src_y,
                src_y_stride,
                src_uv,
                src_uv_stride,
                dst,
                dst_stride,
                width,
                height,
                flag,
            );
        }
        return;
    }
    scalar::nv12_to_rgb::<BGR, ALPHA>(
        src_y,
        src_y_stride,
        src_uv,
        src_uv_stride,
        dst,
        dst_stride,
        width,
        height,
        flag,
    );
}

#[allow(clippy::too_many_arguments)]
fn i420_dispatch<const BGR: bool, const ALPHA: bool>(
    src_y: &[u8],
    src_y_stride: usize,
    src_u: &[u8],
    src_u_stride: usize,
    src_v: &[u8],
    src_v_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: i32,
    height: i32,
    flag: ConvertFlag,
) {
    #[cfg(target_os = "macos")]
    if can_use_apple_accelerate() {
        apple::i420_to_rgb::<BGR, ALPHA>(
            src_y,
            src_y_stride,
            src_u,
            src_u_stride,
            src_v,
            src_v_stride,
            dst,
            dst_stride,
            width,
            height,
            flag,
        );
        return;
    }
    #[cfg(target_arch = "x86_64")]
    if can_use_avx2() {
        unsafe {
            avx2::i420_to_rgb::<BGR, ALPHA>(
                src_y,
                src_y_stride,
                src_u,
                src_u_stride,
                src_v,
                src_v_stride,
                dst,
                dst_stride,
                width,
                height,
                flag,
            );
        }
        return;
    }
    #[cfg(target_arch = "aarch64")]
    if can_use_neon() {
        unsafe {
            neon::i420_to_rgb::<BGR, ALPHA>(
                src_y,
                src_y_stride,
                src_u,
                src_u_stride,
                src_v,
                src_v_stride,
                dst,
                dst_stride,
                width,
                height,
                flag,
            );
        }
        return;
    }
    scalar::i420_to_rgb::<BGR, ALPHA>(
        src_y,
        src_y_stride,
        src_u,
        src_u_stride,
        src_v,
        src_v_stride,
        dst,
        dst_stride,
        width,
        height,
        flag,
    );
}

/// `UYVY` selects the `U Y0 V Y1` byte order instead of `Y0 U Y1 V`.
fn packed422_dispatch<const UYVY: bool, const BGR: bool, const ALPHA: bool>(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: i32,
    height: i32,
    flag: ConvertFlag,
) {
    #[cfg(target_arch = "x86_64")]
    if can_use_avx2() {
        unsafe {
            avx2::packed422_to_rgb::<UYVY, BGR, ALPHA>(
                src, src_stride, dst, dst_stride, width, height, flag,
            );
        }
        return;
    }
    #[cfg(target_arch = "aarch64")]
    if can_use_neon() {
        unsafe {
            neon::packed422_to_rgb::<UYVY, BGR, ALPHA>(
                src, src_stride, dst, dst_stride, width, height, flag,
            );
        }
        return;
    }
    scalar::packed422_to_rgb::<UYVY, BGR, ALPHA>(
        src, src_stride, dst, dst_stride, width, height, flag,
    );
}

macro_rules! nv12_entry {
    ($(#[$doc:meta])* $name:ident, $bgr:literal, $alpha:literal) => {
        $(#[$doc])*
        #[allow(clippy::too_many_arguments)]
        pub fn $name(
            src_y: &[u8],
            src_y_stride: usize,
            src_uv: &[u8],
            src_uv_stride: usize,
            dst: &mut [u8],
            dst_stride: usize,
            width: i32,
            height: i32,
            flag: ConvertFlag,
        ) {
            nv12_dispatch::<$bgr, $alpha>(
                src_y, src_y_stride, src_uv, src_uv_stride, dst, dst_stride, width, height, flag,
            );
        }
    };
}

nv12_entry!(
    /// NV12 → BGR24.
    nv12_to_bgr24, true, false
);
nv12_entry!(
    /// NV12 → RGB24.
    nv12_to_rgb24, false, false
);
nv12_entry!(
    /// NV12 → BGRA32 (alpha = 0xFF).
    nv12_to_bgra32, true, true
);
nv12_entry!(
    /// NV12 → RGBA32 (alpha = 0xFF).
    nv12_to_rgba32, false, true
);

macro_rules! i420_entry {
    ($(#[$doc:meta])* $name:ident, $bgr:literal, $alpha:literal) => {
        $(#[$doc])*
        #[allow(clippy::too_many_arguments)]
        pub fn $name(
            src_y: &[u8],
            src_y_stride: usize,
            src_u: &[u8],
            src_u_stride: usize,
            src_v: &[u8],
            src_v_stride: usize,
            dst: &mut [u8],
            dst_stride: usize,
            width: i32,
            height: i32,
            flag: ConvertFlag,
        ) {
            i420_dispatch::<$bgr, $alpha>(
                src_y, src_y_stride, src_u, src_u_stride, src_v, src_v_stride, dst, dst_stride,
                width, height, flag,
            );
        }
    };
}

i420_entry!(
    /// I420 → BGR24.
    i420_to_bgr24, true, false
);
i420_entry!(
    /// I420 → RGB24.
    i420_to_rgb24, false, false
);
i420_entry!(
    /// I420 → BGRA32 (alpha = 0xFF).
    i420_to_bgra32, true, true
);
i420_entry!(
    /// I420 → RGBA32 (alpha = 0xFF).
    i420_to_rgba32, false, true
);

macro_rules! packed422_entry {
    ($(#[$doc:meta])* $name:ident, $uyvy:literal, $bgr:literal, $alpha:literal) => {
        $(#[$doc])*
        pub fn $name(
            src: &[u8],
            src_stride: usize,
            dst: &mut [u8],
            dst_stride: usize,
            width: i32,
            height: i32,
            flag: ConvertFlag,
        ) {
            packed422_dispatch::<$uyvy, $bgr, $alpha>(
                src, src_stride, dst, dst_stride, width, height, flag,
            );
        }
    };
}

packed422_entry!(
    /// YUYV (`Y0 U Y1 V`) → BGR24.
    yuyv_to_bgr24, false, true, false
);
packed422_entry!(
    /// YUYV → RGB24.
    yuyv_to_rgb24, false, false, false
);
packed422_entry!(
    /// YUYV → BGRA32 (alpha = 0xFF).
    yuyv_to_bgra32, false, true, true
);
packed422_entry!(
    /// YUYV → RGBA32 (alpha = 0xFF).
    yuyv_to_rgba32, false, false, true
);
packed422_entry!(
    /// UYVY (`U Y0 V Y1`) → BGR24.
    uyvy_to_bgr24, true, true, false
);
packed422_entry!(
    /// UYVY → RGB24.
    uyvy_to_rgb24, true, false, false
);
packed422_entry!(
    /// UYVY → BGRA32 (alpha = 0xFF).
    uyvy_to_bgra32, true, true, true
);
packed422_entry!(
    /// UYVY → RGBA32 (alpha = 0xFF).
    uyvy_to_rgba32, true, false, true
);

/// Destination row stride for an RGB output: 4·W with alpha, else 3·W
/// rounded up to the SIMD alignment.
pub(crate) fn rgb_dest_stride(width: u32, has_alpha: bool) -> u32 {
    if has_alpha {
        width * 4
    } else {
        (width * 3 + 31) & !31
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coefficient_table_is_normative() {
        let c = yuv_coefficients(ConvertFlag::BT601 | ConvertFlag::FULL_RANGE);
        assert_eq!((c.cy, c.cr, c.cgu, c.cgv, c.cb, c.y_offset), (64, 88, 22, 45, 111, 0));
        let c = yuv_coefficients(ConvertFlag::BT601 | ConvertFlag::VIDEO_RANGE);
        assert_eq!((c.cy, c.cr, c.cgu, c.cgv, c.cb, c.y_offset), (75, 102, 25, 52, 129, 16));
        let c = yuv_coefficients(ConvertFlag::BT709 | ConvertFlag::FULL_RANGE);
        assert_eq!((c.cy, c.cr, c.cgu, c.cgv, c.cb, c.y_offset), (64, 101, 12, 30, 119, 0));
        let c = yuv_coefficients(ConvertFlag::BT709 | ConvertFlag::VIDEO_RANGE);
        assert_eq!((c.cy, c.cr, c.cgu, c.cgv, c.cb, c.y_offset), (75, 115, 14, 34, 135, 16));
    }

    #[test]
    fn gray_midpoint_maps_to_gray() {
        let c = yuv_coefficients(ConvertFlag::BT601 | ConvertFlag::FULL_RANGE);
        let (r, g, b) = yuv_to_rgb_pixel(&c, 128, 128, 128);
        assert_eq!((r, g, b), (128, 128, 128));
    }

    #[test]
    fn video_range_extremes_clamp() {
        let c = yuv_coefficients(ConvertFlag::DEFAULT);
        assert_eq!(yuv_to_rgb_pixel(&c, 16, 128, 128), (0, 0, 0));
        assert_eq!(yuv_to_rgb_pixel(&c, 235, 128, 128), (255, 255, 255));
        // Below video-range black still clamps to zero.
        assert_eq!(yuv_to_rgb_pixel(&c, 0, 128, 128), (0, 0, 0));
    }

    #[test]
    fn backend_selection_is_exclusive() {
        assert!(set_convert_backend(ConvertBackend::Cpu));
        assert_eq!(convert_backend(), ConvertBackend::Cpu);
        assert!(!can_use_avx2() && !can_use_neon() && !can_use_apple_accelerate());

        assert!(set_convert_backend(ConvertBackend::Auto));
        let auto = convert_backend();
        if has_avx2() {
            assert!(auto == ConvertBackend::Avx2 || auto == ConvertBackend::AppleAccelerate);
        }

        // Restore defaults for other tests.
        assert!(set_convert_backend(ConvertBackend::Auto));
    }

    #[test]
    fn dest_stride_rules() {
        assert_eq!(rgb_dest_stride(640, true), 2560);
        assert_eq!(rgb_dest_stride(640, false), 1920);
        assert_eq!(rgb_dest_stride(2, false), 32);
        assert_eq!(rgb_dest_stride(11, false), 64);
    }
}
