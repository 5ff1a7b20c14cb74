// SPDX-License-Identifier: MPL-2.0

//! NEON conversion kernels (AArch64).
//!
//! The interleaving loads/stores (`vld2`/`vld4`/`vst3`/`vst4`) map directly
//! onto the packed pixel layouts, so these kernels are considerably shorter
//! than their AVX2 counterparts. Fixed-point products are accumulated with
//! widening multiplies (`vmull`/`vmlal`), keeping the output byte-identical
//! to the scalar reference. Row remainders go through the scalar helpers.
//!
//! # Safety
//!
//! NEON is mandatory on AArch64, so these functions are always safe to
//! call there; the `unsafe` stems from the raw-pointer loads and stores.

use std::arch::aarch64::*;

use super::{scalar, yuv_coefficients, ConvertFlag, YuvCoefficients};

/// Converts 8 pixels of widened YUV to clamped 8-bit R/G/B.
#[inline(always)]
unsafe fn yuv_block8(
    c: &YuvCoefficients,
    y8: uint8x8_t,
    u8dup: uint8x8_t,
    v8dup: uint8x8_t,
) -> (uint8x8_t, uint8x8_t, uint8x8_t) {
    let y16 = vsubq_s16(
        vreinterpretq_s16_u16(vmovl_u8(y8)),
        vdupq_n_s16(c.y_offset as i16),
    );
    let u16 = vsubq_s16(vreinterpretq_s16_u16(vmovl_u8(u8dup)), vdupq_n_s16(128));
    let v16 = vsubq_s16(vreinterpretq_s16_u16(vmovl_u8(v8dup)), vdupq_n_s16(128));

    let round = vdupq_n_s32(32);
    // The closure body needs its own unsafe block: the enclosing unsafe fn
    // does not extend into closures.
    let narrow = |lo: int32x4_t, hi: int32x4_t| -> int16x8_t {
        unsafe {
            vcombine_s16(
                vqmovn_s32(vshrq_n_s32::<6>(vaddq_s32(lo, round))),
                vqmovn_s32(vshrq_n_s32::<6>(vaddq_s32(hi, round))),
            )
        }
    };

    let (y_lo, y_hi) = (vget_low_s16(y16), vget_high_s16(y16));
    let (u_lo, u_hi) = (vget_low_s16(u16), vget_high_s16(u16));
    let (v_lo, v_hi) = (vget_low_s16(v16), vget_high_s16(v16));

    let r_lo = vmlal_n_s16(vmull_n_s16(y_lo, c.cy as i16), v_lo, c.cr as i16);
    let r_hi = vmlal_n_s16(vmull_n_s16(y_hi, c.cy as i16), v_hi, c.cr as i16);

    let g_lo = vmlsl_n_s16(
        vmlsl_n_s16(vmull_n_s16(y_lo, c.cy as i16), u_lo, c.cgu as i16),
        v_lo,
        c.cgv as i16,
    );
    let g_hi = vmlsl_n_s16(
        vmlsl_n_s16(vmull_n_s16(y_hi, c.cy as i16), u_hi, c.cgu as i16),
        v_hi,
        c.cgv as i16,
    );

    let b_lo = vmlal_n_s16(vmull_n_s16(y_lo, c.cy as i16), u_lo, c.cb as i16);
    let b_hi = vmlal_n_s16(vmull_n_s16(y_hi, c.cy as i16), u_hi, c.cb as i16);

    // The saturating narrow to u8 is the 0..=255 clamp.
    (
        vqmovun_s16(narrow(r_lo, r_hi)),
        vqmovun_s16(narrow(g_lo, g_hi)),
        vqmovun_s16(narrow(b_lo, b_hi)),
    )
}

/// Stores 8 pixels with channel ordering selected at monomorphization.
#[inline(always)]
unsafe fn store_block8<const BGR: bool, const ALPHA: bool>(
    dst: *mut u8,
    r8: uint8x8_t,
    g8: uint8x8_t,
    b8: uint8x8_t,
) {
    let (c0, c2) = if BGR { (b8, r8) } else { (r8, b8) };
    if ALPHA {
        vst4_u8(
            dst,
            uint8x8x4_t(c0, g8, c2, vdup_n_u8(0xFF)),
        );
    } else {
        vst3_u8(dst, uint8x8x3_t(c0, g8, c2));
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn nv12_to_rgb<const BGR: bool, const ALPHA: bool>(
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
    let flip = height < 0;
    let rows = height.unsigned_abs() as usize;
    let width = width.max(0) as usize;
    let c = yuv_coefficients(flag);
    let channels = if ALPHA { 4 } else { 3 };
    let bulk = width & !15;

    for row in 0..rows {
        let y_row = src_y.as_ptr().add(row * src_y_stride);
        let uv_row = src_uv.as_ptr().add((row / 2) * src_uv_stride);
        let dst_off = scalar::dest_row_offset(row, rows, dst_stride, flip);
        let dst_row = dst.as_mut_ptr().add(dst_off);

        let mut x = 0;
        while x < bulk {
            let y_bytes = vld1q_u8(y_row.add(x));
            let uv = vld2_u8(uv_row.add(x));
            let u_dup = vzip_u8(uv.0, uv.0);
            let v_dup = vzip_u8(uv.1, uv.1);

            let (r, g, b) = yuv_block8(&c, vget_low_u8(y_bytes), u_dup.0, v_dup.0);
            store_block8::<BGR, ALPHA>(dst_row.add(x * channels), r, g, b);
            let (r, g, b) = yuv_block8(&c, vget_high_u8(y_bytes), u_dup.1, v_dup.1);
            store_block8::<BGR, ALPHA>(dst_row.add((x + 8) * channels), r, g, b);
            x += 16;
        }

        if x < width {
            scalar::nv12_row::<BGR, ALPHA>(
                &c,
                &src_y[row * src_y_stride..],
                &src_uv[(row / 2) * src_uv_stride..],
                &mut dst[dst_off..],
                x,
                width,
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn i420_to_rgb<const BGR: bool, const ALPHA: bool>(
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
    let flip = height < 0;
    let rows = height.unsigned_abs() as usize;
    let width = width.max(0) as usize;
    let c = yuv_coefficients(flag);
    let channels = if ALPHA { 4 } else { 3 };
    let bulk = width & !15;

    for row in 0..rows {
        let y_row = src_y.as_ptr().add(row * src_y_stride);
        let u_row = src_u.as_ptr().add((row / 2) * src_u_stride);
        let v_row = src_v.as_ptr().add((row / 2) * src_v_stride);
        let dst_off = scalar::dest_row_offset(row, rows, dst_stride, flip);
        let dst_row = dst.as_mut_ptr().add(dst_off);

        let mut x = 0;
        while x < bulk {
            let y_bytes = vld1q_u8(y_row.add(x));
            let u_samples = vld1_u8(u_row.add(x / 2));
            let v_samples = vld1_u8(v_row.add(x / 2));
            let u_dup = vzip_u8(u_samples, u_samples);
            let v_dup = vzip_u8(v_samples, v_samples);

            let (r, g, b) = yuv_block8(&c, vget_low_u8(y_bytes), u_dup.0, v_dup.0);
            store_block8::<BGR, ALPHA>(dst_row.add(x * channels), r, g, b);
            let (r, g, b) = yuv_block8(&c, vget_high_u8(y_bytes), u_dup.1, v_dup.1);
            store_block8::<BGR, ALPHA>(dst_row.add((x + 8) * channels), r, g, b);
            x += 16;
        }

        if x < width {
            scalar::i420_row::<BGR, ALPHA>(
                &c,
                &src_y[row * src_y_stride..],
                &src_u[(row / 2) * src_u_stride..],
                &src_v[(row / 2) * src_v_stride..],
                &mut dst[dst_off..],
                x,
                width,
            );
        }
    }
}

pub(crate) unsafe fn packed422_to_rgb<const UYVY: bool, const BGR: bool, const ALPHA: bool>(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: i32,
    height: i32,
    flag: ConvertFlag,
) {
    let flip = height < 0;
    let rows = height.unsigned_abs() as usize;
    let width = width.max(0) as usize;
    let c = yuv_coefficients(flag);
    let channels = if ALPHA { 4 } else { 3 };
    let bulk = width & !15;

    for row in 0..rows {
        let src_row = src.as_ptr().add(row * src_stride);
        let dst_off = scalar::dest_row_offset(row, rows, dst_stride, flip);
        let dst_row = dst.as_mut_ptr().add(dst_off);

        let mut x = 0;
        while x < bulk {
            // 8 groups of 4 bytes = 16 pixels.
            let groups = vld4_u8(src_row.add(x * 2));
            let (y_even, y_odd, u_samples, v_samples) = if UYVY {
                (groups.1, groups.3, groups.0, groups.2)
            } else {
                (groups.0, groups.2, groups.1, groups.3)
            };
            let y_pairs = vzip_u8(y_even, y_odd);
            let u_dup = vzip_u8(u_samples, u_samples);
            let v_dup = vzip_u8(v_samples, v_samples);

            let (r, g, b) = yuv_block8(&c, y_pairs.0, u_dup.0, v_dup.0);
            store_block8::<BGR, ALPHA>(dst_row.add(x * channels), r, g, b);
            let (r, g, b) = yuv_block8(&c, y_pairs.1, u_dup.1, v_dup.1);
            store_block8::<BGR, ALPHA>(dst_row.add((x + 8) * channels), r, g, b);
            x += 16;
        }

        if x < width {
            scalar::packed422_row::<UYVY, BGR, ALPHA>(
                &c,
                &src[row * src_stride..],
                &mut dst[dst_off..],
                x,
                width,
            );
        }
    }
}

pub(crate) unsafe fn color_shuffle<const IN: usize, const OUT: usize, const SWAP: bool>(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: i32,
    height: i32,
) {
    let flip = height < 0;
    let rows = height.unsigned_abs() as usize;
    let width = width.max(0) as usize;
    let bulk = width & !7;

    for row in 0..rows {
        let src_row = src.as_ptr().add(row * src_stride);
        let dst_off = scalar::dest_row_offset(row, rows, dst_stride, flip);
        let dst_row = dst.as_mut_ptr().add(dst_off);

        let mut x = 0;
        while x < bulk {
            let (c0, c1, c2, c3) = if IN == 4 {
                let px = vld4_u8(src_row.add(x * IN));
                (px.0, px.1, px.2, px.3)
            } else {
                let px = vld3_u8(src_row.add(x * IN));
                (px.0, px.1, px.2, vdup_n_u8(0xFF))
            };
            let (o0, o2) = if SWAP { (c2, c0) } else { (c0, c2) };
            if OUT == 4 {
                vst4_u8(dst_row.add(x * OUT), uint8x8x4_t(o0, c1, o2, c3));
            } else {
                vst3_u8(dst_row.add(x * OUT), uint8x8x3_t(o0, c1, o2));
            }
            x += 8;
        }

        if x < width {
            scalar::shuffle_row::<IN, OUT, SWAP>(
                &src[row * src_stride..],
                &mut dst[dst_off..],
                x,
                width,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::scalar as reference;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u32).wrapping_mul(29).wrapping_add(seed as u32) as u8)
            .collect()
    }

    #[test]
    fn neon_nv12_matches_scalar() {
        for &(w, h) in &[(2i32, 2i32), (16, 4), (34, 6), (51, 3)] {
            let yw = w as usize;
            let y = pattern(yw * h as usize, 3);
            let uv = pattern((yw + 1) * ((h as usize + 1) / 2) + 2, 7);
            let stride = super::super::rgb_dest_stride(w as u32, true) as usize;
            let mut fast = vec![0u8; stride * h as usize];
            let mut slow = fast.clone();
            let flag = ConvertFlag::DEFAULT;

            unsafe {
                nv12_to_rgb::<true, true>(&y, yw, &uv, yw + 1, &mut fast, stride, w, h, flag);
            }
            reference::nv12_to_rgb::<true, true>(&y, yw, &uv, yw + 1, &mut slow, stride, w, h, flag);
            assert_eq!(fast, slow, "nv12 {}x{}", w, h);
        }
    }

    #[test]
    fn neon_packed422_matches_scalar() {
        for &(w, h) in &[(16i32, 2i32), (22, 3), (7, 2)] {
            let stride_src = (w as usize + 1) / 2 * 4 + 4;
            let src = pattern(stride_src * h as usize, 13);
            let flag = ConvertFlag::BT601 | ConvertFlag::FULL_RANGE;
            let stride = super::super::rgb_dest_stride(w as u32, false) as usize;
            let mut fast = vec![0u8; stride * h as usize];
            let mut slow = fast.clone();

            unsafe {
                packed422_to_rgb::<false, true, false>(
                    &src, stride_src, &mut fast, stride, w, h, flag,
                );
            }
            reference::packed422_to_rgb::<false, true, false>(
                &src, stride_src, &mut slow, stride, w, h, flag,
            );
            assert_eq!(fast, slow, "yuyv {}x{}", w, h);
        }
    }

    #[test]
    fn neon_shuffle_matches_scalar() {
        let (w, h) = (37i32, 3i32);
        let src = pattern(37 * 4 * 3, 1);
        let mut fast = vec![0u8; 37 * 3 * 3];
        let mut slow = fast.clone();

        unsafe {
            color_shuffle::<4, 3, true>(&src, 37 * 4, &mut fast, 37 * 3, w, h);
        }
        reference::color_shuffle::<4, 3, true>(&src, 37 * 4, &mut slow, 37 * 3, w, h);
        assert_eq!(fast, slow);
    }
}
