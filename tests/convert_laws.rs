// SPDX-License-Identifier: MPL-2.0

//! Conversion-law tests against the public API: channel-shuffle round
//! trips, alpha fill, flip involution, backend equivalence and the
//! fixed-point YUV levels.

use framegrab::convert::{
    self, nv12_to_bgr24, rgb_to_bgr, rgb_to_rgba, rgba_to_bgr, yuyv_to_rgba32,
};
use framegrab::{set_convert_backend, ConvertBackend, ConvertFlag};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(37).wrapping_add(seed as u32) as u8)
        .collect()
}

#[test]
fn rgb24_to_bgr24_swaps_first_and_third_bytes() {
    // 4x2 image, row-major; every pixel is (n0, n1, n2).
    let src: Vec<u8> = vec![
        0x00, 0x01, 0x02, 0x10, 0x11, 0x12, 0x20, 0x21, 0x22, 0x30, 0x31, 0x32, //
        0x40, 0x41, 0x42, 0x50, 0x51, 0x52, 0x60, 0x61, 0x62, 0x70, 0x71, 0x72,
    ];
    let mut dst = vec![0u8; 24];
    rgb_to_bgr(&src, 12, &mut dst, 12, 4, 2);

    for px in 0..8 {
        assert_eq!(dst[px * 3], src[px * 3 + 2]);
        assert_eq!(dst[px * 3 + 1], src[px * 3 + 1]);
        assert_eq!(dst[px * 3 + 2], src[px * 3]);
    }
}

#[test]
fn rgb24_to_rgba32_adds_opaque_alpha() {
    let src = [10u8, 20, 30, 40, 50, 60];
    let mut dst = [0u8; 8];
    rgb_to_rgba(&src, 6, &mut dst, 8, 2, 1);
    assert_eq!(dst, [10, 20, 30, 255, 40, 50, 60, 255]);
}

#[test]
fn bgra32_to_rgb24_with_flip_reverses_rows() {
    #[rustfmt::skip]
    let src = [
        // row 0: (B0 G0 R0 A0)(B1 G1 R1 A1)
        1u8, 2, 3, 255,   4, 5, 6, 255,
        // row 1: (B2 G2 R2 A2)(B3 G3 R3 A3)
        7, 8, 9, 255,   10, 11, 12, 255,
    ];
    let mut dst = [0u8; 12];
    rgba_to_bgr(&src, 8, &mut dst, 6, 2, -2);
    #[rustfmt::skip]
    let expected = [
        // row 0 = input row 1 as (R G B)
        9u8, 8, 7,   12, 11, 10,
        // row 1 = input row 0
        3, 2, 1,   6, 5, 4,
    ];
    assert_eq!(dst, expected);
}

#[test]
fn shuffle_round_trip_is_byte_exact() {
    let (w, h) = (33i32, 5i32);
    let src = pattern(33 * 3 * 5, 7);
    let mut swapped = vec![0u8; src.len()];
    let mut back = vec![0u8; src.len()];

    rgb_to_bgr(&src, 99, &mut swapped, 99, w, h);
    rgb_to_bgr(&swapped, 99, &mut back, 99, w, h);
    assert_eq!(back, src);
}

#[test]
fn flip_twice_is_identity() {
    let (w, h) = (17i32, 4i32);
    let src = pattern(17 * 4 * 4, 3);
    let mut once = vec![0u8; src.len()];
    let mut twice = vec![0u8; src.len()];

    // Same-layout flip expressed as a swapping shuffle applied twice with
    // negative height: the channel swap cancels, the flip cancels.
    convert::rgba_to_bgra(&src, 68, &mut once, 68, w, -h);
    convert::rgba_to_bgra(&once, 68, &mut twice, 68, w, -h);
    assert_eq!(twice, src);
}

#[test]
fn nv12_video_range_black_level() {
    // 2x2, Y at video-range black, neutral chroma.
    let y = [16u8; 4];
    let uv = [128u8; 2];
    let mut dst = vec![0u8; 32 * 2];
    nv12_to_bgr24(&y, 2, &uv, 2, &mut dst, 32, 2, 2, ConvertFlag::DEFAULT);
    for row in 0..2 {
        for px in 0..2 {
            let at = row * 32 + px * 3;
            assert_eq!(&dst[at..at + 3], &[0, 0, 0], "row {row} px {px}");
        }
    }
}

#[test]
fn nv12_video_range_white_level() {
    let y = [235u8; 4];
    let uv = [128u8; 2];
    let mut dst = vec![0u8; 32 * 2];
    nv12_to_bgr24(&y, 2, &uv, 2, &mut dst, 32, 2, 2, ConvertFlag::DEFAULT);
    for row in 0..2 {
        for px in 0..2 {
            let at = row * 32 + px * 3;
            assert_eq!(&dst[at..at + 3], &[255, 255, 255], "row {row} px {px}");
        }
    }
}

#[test]
fn yuyv_full_range_mid_gray() {
    let src = [128u8, 128, 128, 128];
    let mut dst = [0u8; 8];
    yuyv_to_rgba32(
        &src,
        4,
        &mut dst,
        8,
        2,
        1,
        ConvertFlag::BT601 | ConvertFlag::FULL_RANGE,
    );
    for px in 0..2 {
        for channel in 0..3 {
            let value = dst[px * 4 + channel] as i32;
            assert!((value - 128).abs() <= 1, "channel off by {}", value - 128);
        }
        assert_eq!(dst[px * 4 + 3], 255);
    }
}

#[test]
fn one_pixel_images_convert() {
    let y = [200u8];
    let uv = [100u8, 160];
    let mut dst = [0u8; 32];
    nv12_to_bgr24(&y, 1, &uv, 2, &mut dst, 32, 1, 1, ConvertFlag::DEFAULT);

    let src = [9u8, 8, 7];
    let mut rgba = [0u8; 4];
    rgb_to_rgba(&src, 3, &mut rgba, 4, 1, 1);
    assert_eq!(rgba, [9, 8, 7, 255]);
}

#[test]
fn forced_cpu_backend_matches_auto() {
    let (w, h) = (61i32, 7i32);
    let y = pattern(61 * 7, 1);
    let uv = pattern(62 * 4, 2);
    let flag = ConvertFlag::DEFAULT;
    let stride = 61 * 4;

    assert!(set_convert_backend(ConvertBackend::Cpu));
    assert_eq!(convert::convert_backend(), ConvertBackend::Cpu);
    let mut scalar_out = vec![0u8; stride * 7];
    convert::nv12_to_rgba32(&y, 61, &uv, 62, &mut scalar_out, stride, w, h, flag);

    assert!(set_convert_backend(ConvertBackend::Auto));
    let mut auto_out = vec![0u8; stride * 7];
    convert::nv12_to_rgba32(&y, 61, &uv, 62, &mut auto_out, stride, w, h, flag);

    assert_eq!(scalar_out, auto_out);

    // And the packed 4:2:2 path with an odd width.
    let src = pattern(62 * 2 * 3, 5);
    assert!(set_convert_backend(ConvertBackend::Cpu));
    let mut scalar_out = vec![0u8; 64 * 3];
    convert::uyvy_to_bgr24(&src, 124, &mut scalar_out, 64, 21, 3, flag);
    assert!(set_convert_backend(ConvertBackend::Auto));
    let mut auto_out = vec![0u8; 64 * 3];
    convert::uyvy_to_bgr24(&src, 124, &mut auto_out, 64, 21, 3, flag);
    assert_eq!(scalar_out, auto_out);
}
