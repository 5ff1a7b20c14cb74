// SPDX-License-Identifier: MPL-2.0

//! AVX2 conversion kernels.
//!
//! All kernels process whole 16-pixel (8 for packed 4:2:2) blocks and hand
//! the row remainder to the scalar helpers, so output is byte-identical to
//! the scalar reference for every width. Fixed-point products are
//! accumulated in 32 bits via `madd`; a 16-bit accumulator would wrap for
//! saturated blue.
//!
//! # Safety
//!
//! Every function in this module requires AVX2; callers verify support at
//! runtime before dispatching here.

use std::arch::x86_64::*;

use super::{scalar, yuv_coefficients, ConvertFlag};

/// Packs two signed 16-bit coefficients for `_mm256_madd_epi16`.
#[inline(always)]
fn pair(lo: i32, hi: i32) -> i32 {
    ((lo as u16 as u32) | ((hi as u16 as u32) << 16)) as i32
}

struct BlockCoefficients {
    cy_cr: __m256i,
    cy_ncgu: __m256i,
    ncgv_0: __m256i,
    cy_cb: __m256i,
    y_offset: __m256i,
    c128: __m256i,
    round: __m256i,
}

#[target_feature(enable = "avx2")]
unsafe fn block_coefficients(flag: ConvertFlag) -> BlockCoefficients {
    let c = yuv_coefficients(flag);
    BlockCoefficients {
        cy_cr: _mm256_set1_epi32(pair(c.cy, c.cr)),
        cy_ncgu: _mm256_set1_epi32(pair(c.cy, -c.cgu)),
        ncgv_0: _mm256_set1_epi32(pair(-c.cgv, 0)),
        cy_cb: _mm256_set1_epi32(pair(c.cy, c.cb)),
        y_offset: _mm256_set1_epi16(c.y_offset as i16),
        c128: _mm256_set1_epi16(128),
        round: _mm256_set1_epi32(32),
    }
}

/// 16 pixels of YUV (as widened 16-bit lanes) → clamped 8-bit R/G/B.
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn yuv_block16(
    k: &BlockCoefficients,
    y16: __m256i,
    u16: __m256i,
    v16: __m256i,
) -> (__m128i, __m128i, __m128i) {
    let zero = _mm256_setzero_si256();
    let y = _mm256_sub_epi16(y16, k.y_offset);
    let u = _mm256_sub_epi16(u16, k.c128);
    let v = _mm256_sub_epi16(v16, k.c128);

    let yv_lo = _mm256_unpacklo_epi16(y, v);
    let yv_hi = _mm256_unpackhi_epi16(y, v);
    let yu_lo = _mm256_unpacklo_epi16(y, u);
    let yu_hi = _mm256_unpackhi_epi16(y, u);
    let vz_lo = _mm256_unpacklo_epi16(v, zero);
    let vz_hi = _mm256_unpackhi_epi16(v, zero);

    let shift6 = |x: __m256i| _mm256_srai_epi32::<6>(_mm256_add_epi32(x, k.round));

    let r_lo = shift6(_mm256_madd_epi16(yv_lo, k.cy_cr));
    let r_hi = shift6(_mm256_madd_epi16(yv_hi, k.cy_cr));
    let g_lo = shift6(_mm256_add_epi32(
        _mm256_madd_epi16(yu_lo, k.cy_ncgu),
        _mm256_madd_epi16(vz_lo, k.ncgv_0),
    ));
    let g_hi = shift6(_mm256_add_epi32(
        _mm256_madd_epi16(yu_hi, k.cy_ncgu),
        _mm256_madd_epi16(vz_hi, k.ncgv_0),
    ));
    let b_lo = shift6(_mm256_madd_epi16(yu_lo, k.cy_cb));
    let b_hi = shift6(_mm256_madd_epi16(yu_hi, k.cy_cb));

    // packs/packus saturate, which is exactly the 0..=255 clamp.
    let r16 = _mm256_packs_epi32(r_lo, r_hi);
    let g16 = _mm256_packs_epi32(g_lo, g_hi);
    let b16 = _mm256_packs_epi32(b_lo, b_hi);

    let r8 = _mm_packus_epi16(_mm256_castsi256_si128(r16), _mm256_extracti128_si256::<1>(r16));
    let g8 = _mm_packus_epi16(_mm256_castsi256_si128(g16), _mm256_extracti128_si256::<1>(g16));
    let b8 = _mm_packus_epi16(_mm256_castsi256_si128(b16), _mm256_extracti128_si256::<1>(b16));
    (r8, g8, b8)
}

/// Interleaves 16 pixels of R/G/B/A bytes into four 16-byte vectors.
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn interleave4<const BGR: bool>(
    r8: __m128i,
    g8: __m128i,
    b8: __m128i,
    a8: __m128i,
) -> (__m128i, __m128i, __m128i, __m128i) {
    let (c0, c2) = if BGR { (b8, r8) } else { (r8, b8) };
    let lo01 = _mm_unpacklo_epi8(c0, g8);
    let hi01 = _mm_unpackhi_epi8(c0, g8);
    let lo23 = _mm_unpacklo_epi8(c2, a8);
    let hi23 = _mm_unpackhi_epi8(c2, a8);
    (
        _mm_unpacklo_epi16(lo01, lo23),
        _mm_unpackhi_epi16(lo01, lo23),
        _mm_unpacklo_epi16(hi01, hi23),
        _mm_unpackhi_epi16(hi01, hi23),
    )
}

/// Stores 16 interleaved pixels, either as 64 bytes of RGBA or stitched
/// into exactly 48 bytes of RGB.
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn store_block16<const BGR: bool, const ALPHA: bool>(
    dst: *mut u8,
    r8: __m128i,
    g8: __m128i,
    b8: __m128i,
) {
    let a8 = _mm_set1_epi8(-1);
    let (o0, o1, o2, o3) = interleave4::<BGR>(r8, g8, b8, a8);
    if ALPHA {
        _mm_storeu_si128(dst as *mut __m128i, o0);
        _mm_storeu_si128(dst.add(16) as *mut __m128i, o1);
        _mm_storeu_si128(dst.add(32) as *mut __m128i, o2);
        _mm_storeu_si128(dst.add(48) as *mut __m128i, o3);
    } else {
        // Drop every 4th byte, then stitch 4x12 bytes into 3x16.
        let strip = _mm_setr_epi8(0, 1, 2, 4, 5, 6, 8, 9, 10, 12, 13, 14, -1, -1, -1, -1);
        let t0 = _mm_shuffle_epi8(o0, strip);
        let t1 = _mm_shuffle_epi8(o1, strip);
        let t2 = _mm_shuffle_epi8(o2, strip);
        let t3 = _mm_shuffle_epi8(o3, strip);
        let s0 = _mm_or_si128(t0, _mm_slli_si128::<12>(t1));
        let s1 = _mm_or_si128(_mm_srli_si128::<4>(t1), _mm_slli_si128::<8>(t2));
        let s2 = _mm_or_si128(_mm_srli_si128::<8>(t2), _mm_slli_si128::<4>(t3));
        _mm_storeu_si128(dst as *mut __m128i, s0);
        _mm_storeu_si128(dst.add(16) as *mut __m128i, s1);
        _mm_storeu_si128(dst.add(32) as *mut __m128i, s2);
    }
}

/// Stores 8 interleaved pixels (packed 4:2:2 block size): 32 bytes of RGBA
/// or exactly 24 bytes of RGB.
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn store_block8<const BGR: bool, const ALPHA: bool>(
    dst: *mut u8,
    r8: __m128i,
    g8: __m128i,
    b8: __m128i,
) {
    let a8 = _mm_set1_epi8(-1);
    let (o0, o1, _, _) = interleave4::<BGR>(r8, g8, b8, a8);
    if ALPHA {
        _mm_storeu_si128(dst as *mut __m128i, o0);
        _mm_storeu_si128(dst.add(16) as *mut __m128i, o1);
    } else {
        let strip = _mm_setr_epi8(0, 1, 2, 4, 5, 6, 8, 9, 10, 12, 13, 14, -1, -1, -1, -1);
        let t0 = _mm_shuffle_epi8(o0, strip);
        let t1 = _mm_shuffle_epi8(o1, strip);
        let s0 = _mm_or_si128(t0, _mm_slli_si128::<12>(t1));
        _mm_storeu_si128(dst as *mut __m128i, s0);
        _mm_storel_epi64(dst.add(16) as *mut __m128i, _mm_srli_si128::<4>(t1));
    }
}

/// Widens 8 chroma bytes into 16 duplicated 16-bit lanes (each sample
/// covers two horizontally adjacent pixels).
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn widen_chroma_dup(samples: __m128i) -> __m256i {
    _mm256_cvtepu8_epi16(_mm_unpacklo_epi8(samples, samples))
}

#[allow(clippy::too_many_arguments)]
#[target_feature(enable = "avx2")]
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
    let k = block_coefficients(flag);
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
            let y_vals = _mm_loadu_si128(y_row.add(x) as *const __m128i);
            let uv_vals = _mm_loadu_si128(uv_row.add(x) as *const __m128i);
            let u_samples = _mm_packus_epi16(
                _mm_and_si128(uv_vals, _mm_set1_epi16(0x00FF)),
                _mm_setzero_si128(),
            );
            let v_samples = _mm_packus_epi16(_mm_srli_epi16::<8>(uv_vals), _mm_setzero_si128());

            let y16 = _mm256_cvtepu8_epi16(y_vals);
            let u16 = widen_chroma_dup(u_samples);
            let v16 = widen_chroma_dup(v_samples);

            let (r8, g8, b8) = yuv_block16(&k, y16, u16, v16);
            store_block16::<BGR, ALPHA>(dst_row.add(x * channels), r8, g8, b8);
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
#[target_feature(enable = "avx2")]
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
    let k = block_coefficients(flag);
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
            let y_vals = _mm_loadu_si128(y_row.add(x) as *const __m128i);
            let u_samples = _mm_loadl_epi64(u_row.add(x / 2) as *const __m128i);
            let v_samples = _mm_loadl_epi64(v_row.add(x / 2) as *const __m128i);

            let y16 = _mm256_cvtepu8_epi16(y_vals);
            let u16 = widen_chroma_dup(u_samples);
            let v16 = widen_chroma_dup(v_samples);

            let (r8, g8, b8) = yuv_block16(&k, y16, u16, v16);
            store_block16::<BGR, ALPHA>(dst_row.add(x * channels), r8, g8, b8);
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

#[target_feature(enable = "avx2")]
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
    let k = block_coefficients(flag);
    let c = yuv_coefficients(flag);
    let channels = if ALPHA { 4 } else { 3 };
    let bulk = width & !7;

    // Byte positions inside a 16-byte block of four 4-byte groups.
    let (y_mask, u_mask, v_mask) = if UYVY {
        (
            _mm_setr_epi8(1, 3, 5, 7, 9, 11, 13, 15, -1, -1, -1, -1, -1, -1, -1, -1),
            _mm_setr_epi8(0, 0, 4, 4, 8, 8, 12, 12, -1, -1, -1, -1, -1, -1, -1, -1),
            _mm_setr_epi8(2, 2, 6, 6, 10, 10, 14, 14, -1, -1, -1, -1, -1, -1, -1, -1),
        )
    } else {
        (
            _mm_setr_epi8(0, 2, 4, 6, 8, 10, 12, 14, -1, -1, -1, -1, -1, -1, -1, -1),
            _mm_setr_epi8(1, 1, 5, 5, 9, 9, 13, 13, -1, -1, -1, -1, -1, -1, -1, -1),
            _mm_setr_epi8(3, 3, 7, 7, 11, 11, 15, 15, -1, -1, -1, -1, -1, -1, -1, -1),
        )
    };

    for row in 0..rows {
        let src_row = src.as_ptr().add(row * src_stride);
        let dst_off = scalar::dest_row_offset(row, rows, dst_stride, flip);
        let dst_row = dst.as_mut_ptr().add(dst_off);

        let mut x = 0;
        while x < bulk {
            let groups = _mm_loadu_si128(src_row.add(x * 2) as *const __m128i);
            let y8 = _mm_shuffle_epi8(groups, y_mask);
            let u8dup = _mm_shuffle_epi8(groups, u_mask);
            let v8dup = _mm_shuffle_epi8(groups, v_mask);

            // Widened blocks carry 8 meaningful lanes in the low half.
            let y16 = _mm256_cvtepu8_epi16(y8);
            let u16 = _mm256_cvtepu8_epi16(u8dup);
            let v16 = _mm256_cvtepu8_epi16(v8dup);

            let (r8, g8, b8) = yuv_block16(&k, y16, u16, v16);
            store_block8::<BGR, ALPHA>(dst_row.add(x * channels), r8, g8, b8);
            x += 8;
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

#[target_feature(enable = "avx2")]
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

    // Per-vector shuffle covering 4 pixels; -1 lanes zero the byte so the
    // alpha fill can be OR-ed in afterwards.
    let mut table = [-1i8; 16];
    let mut alpha = [0i8; 16];
    for px in 0..4 {
        let s = px * IN;
        let d = px * OUT;
        if SWAP {
            table[d] = (s + 2) as i8;
            table[d + 1] = (s + 1) as i8;
            table[d + 2] = s as i8;
        } else {
            table[d] = s as i8;
            table[d + 1] = (s + 1) as i8;
            table[d + 2] = (s + 2) as i8;
        }
        if OUT == 4 {
            if IN == 4 {
                table[d + 3] = (s + 3) as i8;
            } else {
                alpha[d + 3] = -1;
            }
        }
    }
    let table = _mm_loadu_si128(table.as_ptr() as *const __m128i);
    let alpha = _mm_loadu_si128(alpha.as_ptr() as *const __m128i);

    // A 16-pixel block loads four vectors at IN-pixel offsets; the last
    // load reads 16 bytes from the 13th pixel, which may extend past the
    // nominal 48 source bytes when IN == 3.
    let src_block_bytes = 12 * IN + 16;
    let dst_block_bytes = if OUT == 4 { 64 } else { 48 };

    for row in 0..rows {
        let src_start = row * src_stride;
        let dst_start = scalar::dest_row_offset(row, rows, dst_stride, flip);
        let src_avail = src.len() - src_start;
        let dst_avail = dst.len() - dst_start;
        let src_row = src.as_ptr().add(src_start);
        let dst_row = dst.as_mut_ptr().add(dst_start);

        let mut x = 0;
        while x + 16 <= width
            && x * IN + src_block_bytes <= src_avail
            && x * OUT + dst_block_bytes <= dst_avail
        {
            let mut out = [_mm_setzero_si128(); 4];
            for (i, slot) in out.iter_mut().enumerate() {
                let v = _mm_loadu_si128(src_row.add((x + i * 4) * IN) as *const __m128i);
                *slot = _mm_or_si128(_mm_shuffle_epi8(v, table), alpha);
            }

            if OUT == 4 {
                for (i, vec) in out.iter().enumerate() {
                    _mm_storeu_si128(dst_row.add(x * OUT + i * 16) as *mut __m128i, *vec);
                }
            } else {
                let s0 = _mm_or_si128(out[0], _mm_slli_si128::<12>(out[1]));
                let s1 = _mm_or_si128(_mm_srli_si128::<4>(out[1]), _mm_slli_si128::<8>(out[2]));
                let s2 = _mm_or_si128(_mm_srli_si128::<8>(out[2]), _mm_slli_si128::<4>(out[3]));
                _mm_storeu_si128(dst_row.add(x * OUT) as *mut __m128i, s0);
                _mm_storeu_si128(dst_row.add(x * OUT + 16) as *mut __m128i, s1);
                _mm_storeu_si128(dst_row.add(x * OUT + 32) as *mut __m128i, s2);
            }
            x += 16;
        }

        if x < width {
            scalar::shuffle_row::<IN, OUT, SWAP>(&src[src_start..], &mut dst[dst_start..], x, width);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::scalar as reference;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
            .collect()
    }

    #[test]
    fn avx2_nv12_matches_scalar() {
        if !is_x86_feature_detected!("avx2") {
            return;
        }
        for &(w, h) in &[(2i32, 2i32), (16, 4), (34, 6), (51, 3), (1, 1)] {
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

            // 24-bit output and vertical flip.
            let stride3 = super::super::rgb_dest_stride(w as u32, false) as usize;
            let mut fast3 = vec![0u8; stride3 * h as usize];
            let mut slow3 = fast3.clone();
            unsafe {
                nv12_to_rgb::<false, false>(&y, yw, &uv, yw + 1, &mut fast3, stride3, w, -h, flag);
            }
            reference::nv12_to_rgb::<false, false>(
                &y, yw, &uv, yw + 1, &mut slow3, stride3, w, -h, flag,
            );
            assert_eq!(fast3, slow3, "nv12 flip {}x{}", w, h);
        }
    }

    #[test]
    fn avx2_i420_matches_scalar() {
        if !is_x86_feature_detected!("avx2") {
            return;
        }
        let (w, h) = (50i32, 4i32);
        let y = pattern(50 * 4, 11);
        let u = pattern(25 * 2 + 8, 5);
        let v = pattern(25 * 2 + 8, 9);
        let flag = ConvertFlag::BT709 | ConvertFlag::FULL_RANGE;
        let stride = super::super::rgb_dest_stride(w as u32, false) as usize;
        let mut fast = vec![0u8; stride * h as usize];
        let mut slow = fast.clone();

        unsafe {
            i420_to_rgb::<true, false>(&y, 50, &u, 25, &v, 25, &mut fast, stride, w, h, flag);
        }
        reference::i420_to_rgb::<true, false>(&y, 50, &u, 25, &v, 25, &mut slow, stride, w, h, flag);
        assert_eq!(fast, slow);
    }

    #[test]
    fn avx2_packed422_matches_scalar() {
        if !is_x86_feature_detected!("avx2") {
            return;
        }
        for &(w, h) in &[(8i32, 2i32), (22, 3), (7, 2)] {
            let stride_src = (w as usize + 1) / 2 * 4 + 4;
            let src = pattern(stride_src * h as usize, 13);
            let flag = ConvertFlag::BT601 | ConvertFlag::FULL_RANGE;
            let stride = super::super::rgb_dest_stride(w as u32, true) as usize;
            let mut fast = vec![0u8; stride * h as usize];
            let mut slow = fast.clone();

            unsafe {
                packed422_to_rgb::<true, false, true>(
                    &src, stride_src, &mut fast, stride, w, h, flag,
                );
            }
            reference::packed422_to_rgb::<true, false, true>(
                &src, stride_src, &mut slow, stride, w, h, flag,
            );
            assert_eq!(fast, slow, "uyvy {}x{}", w, h);
        }
    }

    #[test]
    fn avx2_shuffle_matches_scalar() {
        if !is_x86_feature_detected!("avx2") {
            return;
        }
        let (w, h) = (37i32, 3i32);
        let src = pattern(37 * 4 * 3, 1);
        let mut fast = vec![0u8; 37 * 3 * 3 + 32];
        let mut slow = fast.clone();

        unsafe {
            color_shuffle::<4, 3, true>(&src, 37 * 4, &mut fast, 37 * 3, w, h);
        }
        reference::color_shuffle::<4, 3, true>(&src, 37 * 4, &mut slow, 37 * 3, w, h);
        assert_eq!(fast, slow);

        // 3 -> 4 with alpha fill and flip.
        let src3 = pattern(37 * 3 * 3, 2);
        let mut fast4 = vec![0u8; 37 * 4 * 3];
        let mut slow4 = fast4.clone();
        unsafe {
            color_shuffle::<3, 4, false>(&src3, 37 * 3, &mut fast4, 37 * 4, w, -h);
        }
        reference::color_shuffle::<3, 4, false>(&src3, 37 * 3, &mut slow4, 37 * 4, w, -h);
        assert_eq!(fast4, slow4);
    }
}
