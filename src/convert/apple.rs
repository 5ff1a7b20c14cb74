// SPDX-License-Identifier: MPL-2.0

//! Apple Accelerate (vImage) conversion kernels.
//!
//! The YUV conversions run through vImage's YpCbCr engine, which uses its
//! own float matrices; output may differ from the scalar reference by one
//! LSB. 24-bit destinations and vertical flips stage through the shared
//! scratch allocator as 32-bit images, which is why the scratch pool
//! allows two live allocators per thread.

use std::ffi::c_void;

use tracing::warn;

use super::{scalar, ConvertFlag};
use crate::alloc::shared_scratch_allocator;

type VImagePixelCount = std::os::raw::c_ulong;
type VImageError = isize;

const NO_FLAGS: u32 = 0;
const NO_ERROR: VImageError = 0;

/// `kvImage420Yp8_CbCr8` / `kvImage420Yp8_Cb8_Cr8` from vImage_Types.h.
const YP_CBCR_TYPE_420_CB8_CR8: u32 = 0;
const YP_CBCR_TYPE_420_CBCR8: u32 = 1;
/// `kvImageARGB8888`.
const ARGB_TYPE_8888: u32 = 0;

#[repr(C)]
struct VImageBuffer {
    data: *mut c_void,
    height: VImagePixelCount,
    width: VImagePixelCount,
    row_bytes: usize,
}

#[repr(C)]
struct VImageYpCbCrPixelRange {
    yp_bias: i32,
    cbcr_bias: i32,
    yp_range_max: i32,
    cbcr_range_max: i32,
    yp_max: i32,
    yp_min: i32,
    cbcr_max: i32,
    cbcr_min: i32,
}

#[repr(C)]
struct VImageYpCbCrToArgbMatrix {
    yp: f32,
    cr_r: f32,
    cr_g: f32,
    cb_g: f32,
    cb_b: f32,
}

/// Opaque conversion state filled by `GenerateConversion`.
#[repr(C, align(16))]
struct VImageYpCbCrToArgb {
    opaque: [u8; 128],
}

#[link(name = "Accelerate", kind = "framework")]
extern "C" {
    static kvImage_YpCbCrToARGBMatrix_ITU_R_601_4: *const VImageYpCbCrToArgbMatrix;
    static kvImage_YpCbCrToARGBMatrix_ITU_R_709_2: *const VImageYpCbCrToArgbMatrix;

    fn vImageConvert_YpCbCrToARGB_GenerateConversion(
        matrix: *const VImageYpCbCrToArgbMatrix,
        pixel_range: *const VImageYpCbCrPixelRange,
        out_info: *mut VImageYpCbCrToArgb,
        in_type: u32,
        out_type: u32,
        flags: u32,
    ) -> VImageError;

    fn vImageConvert_420Yp8_CbCr8ToARGB8888(
        src_yp: *const VImageBuffer,
        src_cbcr: *const VImageBuffer,
        dest: *const VImageBuffer,
        info: *const VImageYpCbCrToArgb,
        permute_map: *const u8,
        alpha: u8,
        flags: u32,
    ) -> VImageError;

    fn vImageConvert_420Yp8_Cb8_Cr8ToARGB8888(
        src_yp: *const VImageBuffer,
        src_cb: *const VImageBuffer,
        src_cr: *const VImageBuffer,
        dest: *const VImageBuffer,
        info: *const VImageYpCbCrToArgb,
        permute_map: *const u8,
        alpha: u8,
        flags: u32,
    ) -> VImageError;

    fn vImagePermuteChannels_ARGB8888(
        src: *const VImageBuffer,
        dest: *const VImageBuffer,
        permute_map: *const u8,
        flags: u32,
    ) -> VImageError;

    fn vImagePermuteChannels_RGB888(
        src: *const VImageBuffer,
        dest: *const VImageBuffer,
        permute_map: *const u8,
        flags: u32,
    ) -> VImageError;

    fn vImageConvert_RGBA8888toRGB888(
        src: *const VImageBuffer,
        dest: *const VImageBuffer,
        flags: u32,
    ) -> VImageError;

    fn vImageConvert_RGBA8888toBGR888(
        src: *const VImageBuffer,
        dest: *const VImageBuffer,
        flags: u32,
    ) -> VImageError;

    fn vImageConvert_RGB888toRGBA8888(
        src: *const VImageBuffer,
        alpha_src: *const VImageBuffer,
        alpha: u8,
        dest: *const VImageBuffer,
        premultiply: bool,
        flags: u32,
    ) -> VImageError;

    fn vImageConvert_RGB888toBGRA8888(
        src: *const VImageBuffer,
        alpha_src: *const VImageBuffer,
        alpha: u8,
        dest: *const VImageBuffer,
        premultiply: bool,
        flags: u32,
    ) -> VImageError;
}

fn buffer(data: *const u8, width: usize, height: usize, row_bytes: usize) -> VImageBuffer {
    VImageBuffer {
        data: data as *mut c_void,
        height: height as VImagePixelCount,
        width: width as VImagePixelCount,
        row_bytes,
    }
}

fn pixel_range(flag: ConvertFlag) -> VImageYpCbCrPixelRange {
    if flag.contains(ConvertFlag::FULL_RANGE) {
        VImageYpCbCrPixelRange {
            yp_bias: 0,
            cbcr_bias: 128,
            yp_range_max: 255,
            cbcr_range_max: 255,
            yp_max: 255,
            yp_min: 0,
            cbcr_max: 255,
            cbcr_min: 0,
        }
    } else {
        VImageYpCbCrPixelRange {
            yp_bias: 16,
            cbcr_bias: 128,
            yp_range_max: 235,
            cbcr_range_max: 240,
            yp_max: 255,
            yp_min: 0,
            cbcr_max: 255,
            cbcr_min: 1,
        }
    }
}

/// ARGB → target channel order for the YpCbCr converters.
fn argb_permute_map<const BGR: bool>() -> [u8; 4] {
    if BGR {
        [3, 2, 1, 0]
    } else {
        [1, 2, 3, 0]
    }
}

fn generate_conversion(flag: ConvertFlag, info: &mut VImageYpCbCrToArgb, in_type: u32) -> bool {
    let range = pixel_range(flag);
    let matrix = unsafe {
        if flag.contains(ConvertFlag::BT601) {
            kvImage_YpCbCrToARGBMatrix_ITU_R_601_4
        } else {
            kvImage_YpCbCrToARGBMatrix_ITU_R_709_2
        }
    };
    let err = unsafe {
        vImageConvert_YpCbCrToARGB_GenerateConversion(
            matrix,
            &range,
            info,
            in_type,
            ARGB_TYPE_8888,
            NO_FLAGS,
        )
    };
    if err != NO_ERROR {
        warn!(err, "vImage GenerateConversion failed, using CPU path");
        return false;
    }
    true
}

/// Shared tail for the YpCbCr conversions: optional 32→24-bit squeeze and
/// vertical flip from the staging image into `dst`.
#[allow(clippy::too_many_arguments)]
fn finish_rgb<const BGR: bool, const ALPHA: bool>(
    staged: *const u8,
    staged_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: usize,
    rows: usize,
    flip: bool,
) {
    // `staged` holds the final channel order already (the permute map ran
    // inside the YpCbCr conversion), so only the alpha squeeze remains.
    let row_bytes = if ALPHA { width * 4 } else { width * 3 };
    if !ALPHA {
        let src_buf = buffer(staged, width, rows, staged_stride);
        let dst_buf = buffer(dst.as_ptr(), width, rows, dst_stride);
        // RGBA→RGB drops the 4th byte of each pixel, which is exactly the
        // squeeze we need regardless of channel order.
        let err = unsafe { vImageConvert_RGBA8888toRGB888(&src_buf, &dst_buf, NO_FLAGS) };
        if err != NO_ERROR {
            warn!(err, "vImage RGBA8888toRGB888 failed");
            return;
        }
    }
    if flip {
        // The conversion above wrote top-to-bottom; reverse rows in place
        // through the scratch allocator.
        let total = dst_stride * rows;
        let scratch = shared_scratch_allocator();
        scratch.resize(total);
        if scratch.data().is_null() {
            return;
        }
        let staged_flip = unsafe { std::slice::from_raw_parts_mut(scratch.data(), total) };
        staged_flip.copy_from_slice(&dst[..total]);
        scalar::flip_rows(staged_flip, dst, dst_stride, rows, row_bytes);
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn nv12_to_rgb<const BGR: bool, const ALPHA: bool>(
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

    let mut info = VImageYpCbCrToArgb { opaque: [0; 128] };
    if !generate_conversion(flag, &mut info, YP_CBCR_TYPE_420_CBCR8) {
        scalar::nv12_to_rgb::<BGR, ALPHA>(
            src_y,
            src_y_stride,
            src_uv,
            src_uv_stride,
            dst,
            dst_stride,
            width as i32,
            height,
            flag,
        );
        return;
    }

    let y_buf = buffer(src_y.as_ptr(), width, rows, src_y_stride);
    let uv_buf = buffer(src_uv.as_ptr(), width / 2, rows / 2, src_uv_stride);

    // 32-bit output goes straight to dst; 24-bit stages through scratch.
    let argb_stride = (width * 4 + 31) & !31;
    let scratch = shared_scratch_allocator();
    let staged_ptr = if ALPHA {
        dst.as_mut_ptr()
    } else {
        scratch.resize(argb_stride * rows);
        if scratch.data().is_null() {
            return;
        }
        scratch.data()
    };
    let staged_stride = if ALPHA { dst_stride } else { argb_stride };
    let dst_buf = buffer(staged_ptr, width, rows, staged_stride);

    let permute = argb_permute_map::<BGR>();
    let err = unsafe {
        vImageConvert_420Yp8_CbCr8ToARGB8888(
            &y_buf,
            &uv_buf,
            &dst_buf,
            &info,
            permute.as_ptr(),
            0xFF,
            NO_FLAGS,
        )
    };
    if err != NO_ERROR {
        warn!(err, "vImage 420Yp8_CbCr8ToARGB8888 failed");
        return;
    }

    finish_rgb::<BGR, ALPHA>(staged_ptr, staged_stride, dst, dst_stride, width, rows, flip);
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn i420_to_rgb<const BGR: bool, const ALPHA: bool>(
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

    let mut info = VImageYpCbCrToArgb { opaque: [0; 128] };
    if !generate_conversion(flag, &mut info, YP_CBCR_TYPE_420_CB8_CR8) {
        scalar::i420_to_rgb::<BGR, ALPHA>(
            src_y,
            src_y_stride,
            src_u,
            src_u_stride,
            src_v,
            src_v_stride,
            dst,
            dst_stride,
            width as i32,
            height,
            flag,
        );
        return;
    }

    let y_buf = buffer(src_y.as_ptr(), width, rows, src_y_stride);
    let u_buf = buffer(src_u.as_ptr(), width / 2, rows / 2, src_u_stride);
    let v_buf = buffer(src_v.as_ptr(), width / 2, rows / 2, src_v_stride);

    let argb_stride = (width * 4 + 31) & !31;
    let scratch = shared_scratch_allocator();
    let staged_ptr = if ALPHA {
        dst.as_mut_ptr()
    } else {
        scratch.resize(argb_stride * rows);
        if scratch.data().is_null() {
            return;
        }
        scratch.data()
    };
    let staged_stride = if ALPHA { dst_stride } else { argb_stride };
    let dst_buf = buffer(staged_ptr, width, rows, staged_stride);

    let permute = argb_permute_map::<BGR>();
    let err = unsafe {
        vImageConvert_420Yp8_Cb8_Cr8ToARGB8888(
            &y_buf,
            &u_buf,
            &v_buf,
            &dst_buf,
            &info,
            permute.as_ptr(),
            0xFF,
            NO_FLAGS,
        )
    };
    if err != NO_ERROR {
        warn!(err, "vImage 420Yp8_Cb8_Cr8ToARGB8888 failed");
        return;
    }

    finish_rgb::<BGR, ALPHA>(staged_ptr, staged_stride, dst, dst_stride, width, rows, flip);
}

pub(crate) fn color_shuffle<const IN: usize, const OUT: usize, const SWAP: bool>(
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

    // Flips stage through the scratch allocator, then reverse-copy.
    let scratch = shared_scratch_allocator();
    let out_ptr = if flip {
        scratch.resize(dst_stride * rows);
        if scratch.data().is_null() {
            return;
        }
        scratch.data()
    } else {
        dst.as_mut_ptr()
    };

    let src_buf = buffer(src.as_ptr(), width, rows, src_stride);
    let dst_buf = buffer(out_ptr, width, rows, dst_stride);
    const RB_SWAP: [u8; 4] = [2, 1, 0, 3];

    let err = unsafe {
        match (IN, OUT, SWAP) {
            (4, 4, true) => {
                vImagePermuteChannels_ARGB8888(&src_buf, &dst_buf, RB_SWAP.as_ptr(), NO_FLAGS)
            }
            (3, 3, true) => {
                vImagePermuteChannels_RGB888(&src_buf, &dst_buf, RB_SWAP.as_ptr(), NO_FLAGS)
            }
            (4, 3, true) => vImageConvert_RGBA8888toBGR888(&src_buf, &dst_buf, NO_FLAGS),
            (4, 3, false) => vImageConvert_RGBA8888toRGB888(&src_buf, &dst_buf, NO_FLAGS),
            (3, 4, true) => vImageConvert_RGB888toBGRA8888(
                &src_buf,
                std::ptr::null(),
                0xFF,
                &dst_buf,
                false,
                NO_FLAGS,
            ),
            (3, 4, false) => vImageConvert_RGB888toRGBA8888(
                &src_buf,
                std::ptr::null(),
                0xFF,
                &dst_buf,
                false,
                NO_FLAGS,
            ),
            _ => NO_ERROR,
        }
    };
    if err != NO_ERROR {
        warn!(err, "vImage channel shuffle failed, using CPU path");
        scalar::color_shuffle::<IN, OUT, SWAP>(src, src_stride, dst, dst_stride, width as i32, height);
        return;
    }

    if flip {
        let total = dst_stride * rows;
        let staged = unsafe { std::slice::from_raw_parts(out_ptr, total) };
        let row_bytes = width * OUT;
        scalar::flip_rows(staged, dst, dst_stride, rows, row_bytes);
    }
}
