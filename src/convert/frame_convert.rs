// SPDX-License-Identifier: MPL-2.0

//! In-place frame conversion.
//!
//! "In place" refers to the frame's identity: the operation rewrites the
//! frame's `pixel_format`, plane pointers, strides and size while swapping
//! the backing storage from the native capture buffer to the frame's
//! allocator.

use std::sync::Arc;

use tracing::trace;

use super::{
    color_shuffle, i420_to_bgr24, i420_to_bgra32, i420_to_rgb24, i420_to_rgba32, nv12_to_bgr24,
    nv12_to_bgra32, nv12_to_rgb24, nv12_to_rgba32, rgb_dest_stride, scalar, uyvy_to_bgr24,
    uyvy_to_bgra32, uyvy_to_rgb24, uyvy_to_rgba32, yuyv_to_bgr24, yuyv_to_bgra32, yuyv_to_rgb24,
    yuyv_to_rgba32, ConvertFlag,
};
use crate::alloc::{shared_scratch_allocator, DefaultAllocator, FrameAllocator};
use crate::format::PixelFormat;
use crate::frame::VideoFrame;

/// Converts `frame` to `to_format`, optionally flipping vertically.
///
/// Returns `true` when the frame was rewritten (it now owns its pixels via
/// its allocator) and `false` when nothing changed: the target format
/// equals the current one and no flip was requested, or the conversion is
/// unsupported (YUV→YUV, RGB→YUV, unknown formats). A `false` return
/// leaves the frame exactly as it was, so the caller can still emit it
/// zero-copy in the camera's native format.
pub fn convert_frame_in_place(
    frame: &mut VideoFrame,
    to_format: PixelFormat,
    vertical_flip: bool,
) -> bool {
    if frame.pixel_format == to_format {
        if vertical_flip && to_format.is_rgb() {
            return flip_same_format(frame);
        }
        return false;
    }

    if to_format == PixelFormat::Unknown || frame.pixel_format == PixelFormat::Unknown {
        return false;
    }

    let input_yuv = frame.pixel_format.is_yuv();
    let output_yuv = to_format.is_yuv();
    if input_yuv || output_yuv {
        if input_yuv && output_yuv {
            return false; // YUV ↔ YUV is out of scope
        }
        if !input_yuv {
            return false; // no RGB → YUV
        }
        return convert_yuv_to_rgb(frame, to_format, vertical_flip);
    }

    convert_rgb_to_rgb(frame, to_format, vertical_flip)
}

fn frame_allocator(frame: &mut VideoFrame) -> Arc<dyn FrameAllocator> {
    if frame.allocator.is_none() {
        frame.allocator = Some(match frame.pool_token.clone() {
            Some(token) => token,
            None => Arc::new(DefaultAllocator::new()) as Arc<dyn FrameAllocator>,
        });
    }
    frame.allocator.clone().expect("allocator just installed")
}

/// Same-format RGB flip: copy rows in reverse order into the allocator.
fn flip_same_format(frame: &mut VideoFrame) -> bool {
    let stride = frame.stride[0] as usize;
    let rows = frame.height as usize;
    let total = stride * rows;
    if total == 0 || frame.data[0].is_null() {
        return false;
    }

    let allocator = frame_allocator(frame);
    let src_ptr = frame.data[0];
    let aliases_allocator = src_ptr == allocator.data() as *const u8;

    if aliases_allocator {
        // The frame already lives in its allocator; stage through the
        // scratch buffer so the reversed copy does not read rows it just
        // overwrote.
        let scratch = shared_scratch_allocator();
        scratch.resize(total);
        if scratch.data().is_null() {
            return false;
        }
        let staged = unsafe { std::slice::from_raw_parts_mut(scratch.data(), total) };
        let src = unsafe { std::slice::from_raw_parts(src_ptr, total) };
        staged.copy_from_slice(src);
        let dst = unsafe { std::slice::from_raw_parts_mut(allocator.data(), total) };
        scalar::flip_rows(staged, dst, stride, rows, stride);
    } else {
        allocator.resize(total);
        let base = allocator.data();
        if base.is_null() {
            return false;
        }
        let src = unsafe { std::slice::from_raw_parts(src_ptr, total) };
        let dst = unsafe { std::slice::from_raw_parts_mut(base, total) };
        scalar::flip_rows(src, dst, stride, rows, stride);
        frame.data[0] = base as *const u8;
    }

    trace!(frame_index = frame.frame_index, "flipped frame in place");
    true
}

fn convert_yuv_to_rgb(frame: &mut VideoFrame, to_format: PixelFormat, flip: bool) -> bool {
    let width = frame.width as i32;
    let height = if flip {
        -(frame.height as i32)
    } else {
        frame.height as i32
    };

    let dst_stride = rgb_dest_stride(frame.width, to_format.has_alpha());
    let total = dst_stride as usize * frame.height as usize;
    if total == 0 {
        return false;
    }

    let allocator = frame_allocator(frame);
    allocator.resize(total);
    let base = allocator.data();
    if base.is_null() {
        return false;
    }
    debug_assert!(
        frame.data[0] != base as *const u8,
        "source planes must not alias the frame allocator"
    );
    let dst = unsafe { std::slice::from_raw_parts_mut(base, total) };

    // The range bit of the source format selects the matrix variant; the
    // capture pipeline always converts with BT.601.
    let flag = if frame.pixel_format.is_full_range() {
        ConvertFlag::BT601 | ConvertFlag::FULL_RANGE
    } else {
        ConvertFlag::BT601 | ConvertFlag::VIDEO_RANGE
    };

    let bgr = to_format.is_bgr_like();
    let alpha = to_format.has_alpha();
    let stride = dst_stride as usize;

    let converted = if frame.pixel_format.includes(PixelFormat::Nv12.bits()) {
        let (Some(y), Some(uv)) = (frame.plane(0), frame.plane(1)) else {
            return false;
        };
        let (sy, suv) = (frame.stride[0] as usize, frame.stride[1] as usize);
        match (bgr, alpha) {
            (true, false) => nv12_to_bgr24(y, sy, uv, suv, dst, stride, width, height, flag),
            (false, false) => nv12_to_rgb24(y, sy, uv, suv, dst, stride, width, height, flag),
            (true, true) => nv12_to_bgra32(y, sy, uv, suv, dst, stride, width, height, flag),
            (false, true) => nv12_to_rgba32(y, sy, uv, suv, dst, stride, width, height, flag),
        }
        true
    } else if frame.pixel_format.includes(PixelFormat::I420.bits()) {
        let (Some(y), Some(u), Some(v)) = (frame.plane(0), frame.plane(1), frame.plane(2)) else {
            return false;
        };
        let (sy, su, sv) = (
            frame.stride[0] as usize,
            frame.stride[1] as usize,
            frame.stride[2] as usize,
        );
        match (bgr, alpha) {
            (true, false) => i420_to_bgr24(y, sy, u, su, v, sv, dst, stride, width, height, flag),
            (false, false) => i420_to_rgb24(y, sy, u, su, v, sv, dst, stride, width, height, flag),
            (true, true) => i420_to_bgra32(y, sy, u, su, v, sv, dst, stride, width, height, flag),
            (false, true) => i420_to_rgba32(y, sy, u, su, v, sv, dst, stride, width, height, flag),
        }
        true
    } else if frame.pixel_format.includes(PixelFormat::Yuyv.bits()) {
        let Some(src) = frame.plane(0) else {
            return false;
        };
        let ss = frame.stride[0] as usize;
        match (bgr, alpha) {
            (true, false) => yuyv_to_bgr24(src, ss, dst, stride, width, height, flag),
            (false, false) => yuyv_to_rgb24(src, ss, dst, stride, width, height, flag),
            (true, true) => yuyv_to_bgra32(src, ss, dst, stride, width, height, flag),
            (false, true) => yuyv_to_rgba32(src, ss, dst, stride, width, height, flag),
        }
        true
    } else if frame.pixel_format.includes(PixelFormat::Uyvy.bits()) {
        let Some(src) = frame.plane(0) else {
            return false;
        };
        let ss = frame.stride[0] as usize;
        match (bgr, alpha) {
            (true, false) => uyvy_to_bgr24(src, ss, dst, stride, width, height, flag),
            (false, false) => uyvy_to_rgb24(src, ss, dst, stride, width, height, flag),
            (true, true) => uyvy_to_bgra32(src, ss, dst, stride, width, height, flag),
            (false, true) => uyvy_to_rgba32(src, ss, dst, stride, width, height, flag),
        }
        true
    } else {
        false
    };

    if !converted {
        return false;
    }

    finish_rgb_frame(frame, to_format, base, dst_stride);
    true
}

fn convert_rgb_to_rgb(frame: &mut VideoFrame, to_format: PixelFormat, flip: bool) -> bool {
    let src_stride = frame.stride[0] as usize;
    let in_channels = if frame.pixel_format.has_alpha() { 4 } else { 3 };
    let out_channels = if to_format.has_alpha() { 4 } else { 3 };
    let swap = frame.pixel_format.is_bgr_like() != to_format.is_bgr_like();

    let width = frame.width as i32;
    let height = if flip {
        -(frame.height as i32)
    } else {
        frame.height as i32
    };

    let dst_stride = rgb_dest_stride(frame.width, to_format.has_alpha());
    let total = dst_stride as usize * frame.height as usize;
    if total == 0 {
        return false;
    }

    let allocator = frame_allocator(frame);
    allocator.resize(total);
    let base = allocator.data();
    if base.is_null() {
        return false;
    }
    let Some(src) = frame.plane(0) else {
        return false;
    };
    debug_assert!(
        src.as_ptr() != base as *const u8,
        "source plane must not alias the frame allocator"
    );
    let dst = unsafe { std::slice::from_raw_parts_mut(base, total) };
    let stride = dst_stride as usize;

    match (in_channels, out_channels, swap) {
        (4, 4, true) => color_shuffle::<4, 4, true>(src, src_stride, dst, stride, width, height),
        (4, 3, true) => color_shuffle::<4, 3, true>(src, src_stride, dst, stride, width, height),
        (4, 3, false) => color_shuffle::<4, 3, false>(src, src_stride, dst, stride, width, height),
        (3, 4, true) => color_shuffle::<3, 4, true>(src, src_stride, dst, stride, width, height),
        (3, 4, false) => color_shuffle::<3, 4, false>(src, src_stride, dst, stride, width, height),
        (3, 3, true) => color_shuffle::<3, 3, true>(src, src_stride, dst, stride, width, height),
        // Identical channel layout was handled by the same-format branch.
        _ => return false,
    }

    finish_rgb_frame(frame, to_format, base, dst_stride);
    true
}

fn finish_rgb_frame(frame: &mut VideoFrame, to_format: PixelFormat, base: *mut u8, stride: u32) {
    frame.pixel_format = to_format;
    frame.data[0] = base as *const u8;
    frame.data[1] = std::ptr::null();
    frame.data[2] = std::ptr::null();
    frame.stride[0] = stride;
    frame.stride[1] = 0;
    frame.stride[2] = 0;
    frame.size_in_bytes = stride * frame.height;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FrameOrientation;

    fn rgb_frame(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> VideoFrame {
        let mut frame = VideoFrame::empty();
        let channels = if format.has_alpha() { 4 } else { 3 };
        frame.data[0] = pixels.as_ptr();
        frame.stride[0] = width * channels;
        frame.pixel_format = format;
        frame.width = width;
        frame.height = height;
        frame.size_in_bytes = width * channels * height;
        frame.orientation = FrameOrientation::TopToBottom;
        frame
    }

    #[test]
    fn same_format_without_flip_reports_no_change() {
        let pixels = [1u8, 2, 3, 4, 5, 6];
        let mut frame = rgb_frame(&pixels, 2, 1, PixelFormat::Rgb24);
        assert!(!convert_frame_in_place(&mut frame, PixelFormat::Rgb24, false));
        assert_eq!(frame.data[0], pixels.as_ptr());
    }

    #[test]
    fn rgb24_to_rgba32_fills_alpha() {
        let pixels = [10u8, 20, 30, 40, 50, 60];
        let mut frame = rgb_frame(&pixels, 2, 1, PixelFormat::Rgb24);
        assert!(convert_frame_in_place(&mut frame, PixelFormat::Rgba32, false));
        assert_eq!(frame.pixel_format, PixelFormat::Rgba32);
        assert_eq!(frame.stride[0], 8);
        assert_eq!(frame.size_in_bytes, 8);
        assert_eq!(
            frame.plane(0).unwrap(),
            &[10, 20, 30, 255, 40, 50, 60, 255]
        );
        assert!(frame.allocator.is_some());
    }

    #[test]
    fn bgra_to_rgb24_with_flip_matches_expected_layout() {
        #[rustfmt::skip]
        let pixels = [
            // row 0: pixels 0,1 (B,G,R,A)
            1u8, 2, 3, 255,  4, 5, 6, 255,
            // row 1: pixels 2,3
            7, 8, 9, 255,  10, 11, 12, 255,
        ];
        let mut frame = rgb_frame(&pixels, 2, 2, PixelFormat::Bgra32);
        assert!(convert_frame_in_place(&mut frame, PixelFormat::Rgb24, true));

        let stride = frame.stride[0] as usize;
        let plane = frame.plane(0).unwrap();
        // Output row 0 holds input row 1 with R and B swapped.
        assert_eq!(&plane[0..6], &[9, 8, 7, 12, 11, 10]);
        assert_eq!(&plane[stride..stride + 6], &[3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn yuv_to_yuv_is_rejected() {
        let y = [16u8; 4];
        let mut frame = VideoFrame::empty();
        frame.data[0] = y.as_ptr();
        frame.stride[0] = 2;
        frame.pixel_format = PixelFormat::Nv12;
        frame.width = 2;
        frame.height = 2;
        assert!(!convert_frame_in_place(&mut frame, PixelFormat::I420, false));
        assert_eq!(frame.pixel_format, PixelFormat::Nv12);
    }

    #[test]
    fn rgb_to_yuv_is_rejected() {
        let pixels = [0u8; 6];
        let mut frame = rgb_frame(&pixels, 2, 1, PixelFormat::Rgb24);
        assert!(!convert_frame_in_place(&mut frame, PixelFormat::Nv12, false));
    }

    #[test]
    fn nv12_to_bgr24_video_range_levels() {
        // 2x2 NV12: Y plane then interleaved UV.
        let y = [235u8, 235, 235, 235];
        let uv = [128u8, 128];
        let mut frame = VideoFrame::empty();
        frame.data[0] = y.as_ptr();
        frame.data[1] = uv.as_ptr();
        frame.stride[0] = 2;
        frame.stride[1] = 2;
        frame.pixel_format = PixelFormat::Nv12;
        frame.width = 2;
        frame.height = 2;
        frame.size_in_bytes = 6;

        assert!(convert_frame_in_place(&mut frame, PixelFormat::Bgr24, false));
        assert_eq!(frame.pixel_format, PixelFormat::Bgr24);
        let stride = frame.stride[0] as usize;
        let plane = frame.plane(0).unwrap();
        for row in 0..2 {
            for px in 0..2 {
                let at = row * stride + px * 3;
                assert_eq!(&plane[at..at + 3], &[255, 255, 255]);
            }
        }
    }

    #[test]
    fn double_flip_restores_layout() {
        let pixels = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let mut frame = rgb_frame(&pixels, 2, 2, PixelFormat::Rgb24);
        assert!(convert_frame_in_place(&mut frame, PixelFormat::Rgb24, true));
        let flipped: Vec<u8> = frame.plane(0).unwrap()[..6].to_vec();
        assert_eq!(&flipped, &[7, 8, 9, 10, 11, 12]);

        assert!(convert_frame_in_place(&mut frame, PixelFormat::Rgb24, true));
        assert_eq!(&frame.plane(0).unwrap()[..6], &pixels[..6]);
    }
}
