// SPDX-License-Identifier: MPL-2.0

//! Debug helpers that write frames to disk.
//!
//! RGB frames become BMP files (24-bit `BITMAPINFOHEADER` or 32-bit
//! `BITMAPV4HEADER`); YUV frames become raw `.yuv` files with the planes
//! concatenated. Not performance-tuned; meant for eyeballing captures, not
//! for hot paths.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::format::{bits, FrameOrientation};
use crate::frame::VideoFrame;

/// Writes `frame` next to `file_stem`, appending the proper extension
/// (`.bmp` for RGB, `.<format>.yuv` for YUV). Returns the written path.
pub fn dump_frame_to_file(frame: &VideoFrame, file_stem: &Path) -> Option<PathBuf> {
    if frame.pixel_format().is_rgb() {
        let path = file_stem.with_extension("bmp");
        let plane = frame.plane(0)?;
        save_rgb_as_bmp(
            &path,
            plane,
            frame.width(),
            frame.stride(0),
            frame.height(),
            frame.pixel_format().is_bgr_like(),
            frame.pixel_format().has_alpha(),
            frame.orientation() == FrameOrientation::TopToBottom,
        )
        .ok()?;
        Some(path)
    } else if frame.pixel_format().includes(bits::YUV) {
        let path = file_stem.with_extension(format!("{}.yuv", frame.pixel_format()));
        let file = std::fs::File::create(&path).ok()?;
        let mut writer = BufWriter::new(file);
        for plane_index in 0..3 {
            if let Some(plane) = frame.plane(plane_index) {
                writer.write_all(plane).ok()?;
            }
        }
        writer.flush().ok()?;
        Some(path)
    } else {
        None
    }
}

/// Writes `frame` into `directory` with a timestamped name
/// (`YYYYMMDD_HHMMSS_WxH_index`).
pub fn dump_frame_to_directory(frame: &VideoFrame, directory: &Path) -> Option<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let stem = directory.join(format!(
        "{stamp}_{}x{}_{}",
        frame.width(),
        frame.height(),
        frame.frame_index()
    ));
    dump_frame_to_file(frame, &stem)
}

/// Writes raw RGB pixels as a BMP file.
///
/// BMP stores rows bottom-up in BGR order; non-BGR input gets its channels
/// swapped and top-to-bottom input is written in reverse row order.
#[allow(clippy::too_many_arguments)]
pub fn save_rgb_as_bmp(
    path: &Path,
    data: &[u8],
    width: u32,
    stride: u32,
    height: u32,
    is_bgr: bool,
    has_alpha: bool,
    top_to_bottom: bool,
) -> std::io::Result<()> {
    let line_size = if has_alpha {
        width as usize * 4
    } else {
        (width as usize * 3).div_ceil(4) * 4
    };
    let channels = if has_alpha { 4 } else { 3 };
    let pixel_bytes = width as usize * channels;

    // 14-byte file header + info header.
    let info_size: u32 = if has_alpha { 108 } else { 40 };
    let data_size = (line_size * height as usize) as u32;
    let data_offset = 14 + info_size;

    let mut header = Vec::with_capacity(data_offset as usize);
    header.extend_from_slice(b"BM");
    header.extend_from_slice(&(data_offset + data_size).to_le_bytes());
    header.extend_from_slice(&[0u8; 4]);
    header.extend_from_slice(&data_offset.to_le_bytes());

    header.extend_from_slice(&info_size.to_le_bytes());
    header.extend_from_slice(&(width as i32).to_le_bytes());
    header.extend_from_slice(&(height as i32).to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes()); // planes
    header.extend_from_slice(&((channels * 8) as u16).to_le_bytes());
    if has_alpha {
        header.extend_from_slice(&3u32.to_le_bytes()); // BI_BITFIELDS
    } else {
        header.extend_from_slice(&0u32.to_le_bytes()); // BI_RGB
    }
    header.extend_from_slice(&data_size.to_le_bytes());
    header.extend_from_slice(&0x0B13u32.to_le_bytes()); // ~72 dpi
    header.extend_from_slice(&0x0B13u32.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes()); // colors used
    header.extend_from_slice(&0u32.to_le_bytes()); // important colors
    if has_alpha {
        // BITMAPV4HEADER channel masks (BGRA byte order) + empty tail.
        header.extend_from_slice(&0x00FF_0000u32.to_le_bytes()); // R
        header.extend_from_slice(&0x0000_FF00u32.to_le_bytes()); // G
        header.extend_from_slice(&0x0000_00FFu32.to_le_bytes()); // B
        header.extend_from_slice(&0xFF00_0000u32.to_le_bytes()); // A
        header.extend_from_slice(&[0u8; 52]);
    }
    debug_assert_eq!(header.len(), data_offset as usize);

    // Assemble the pixel block in memory, then write once.
    let mut pixels = vec![0u8; line_size * height as usize];
    for out_row in 0..height as usize {
        // BMP is bottom-up, so a top-to-bottom source is read in reverse.
        let src_row = if top_to_bottom {
            height as usize - 1 - out_row
        } else {
            out_row
        };
        let src = &data[src_row * stride as usize..src_row * stride as usize + pixel_bytes];
        let dst = &mut pixels[out_row * line_size..out_row * line_size + pixel_bytes];
        if is_bgr {
            dst.copy_from_slice(src);
        } else {
            for x in 0..width as usize {
                let s = &src[x * channels..];
                let d = &mut dst[x * channels..];
                d[0] = s[2];
                d[1] = s[1];
                d[2] = s[0];
                if has_alpha {
                    d[3] = s[3];
                }
            }
        }
    }

    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&header)?;
    writer.write_all(&pixels)?;
    writer.flush()?;

    debug!(path = %path.display(), width, height, "frame dumped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    fn bgr_frame(pixels: &[u8], width: u32, height: u32) -> VideoFrame {
        let mut frame = VideoFrame::empty();
        frame.data[0] = pixels.as_ptr();
        frame.stride[0] = width * 3;
        frame.pixel_format = PixelFormat::Bgr24;
        frame.width = width;
        frame.height = height;
        frame.size_in_bytes = width * 3 * height;
        frame
    }

    #[test]
    fn bmp_dump_has_valid_header() {
        let dir = tempfile::tempdir().unwrap();
        let pixels = [10u8, 20, 30, 40, 50, 60];
        let frame = bgr_frame(&pixels, 2, 1);

        let path = dump_frame_to_file(&frame, &dir.path().join("test")).unwrap();
        assert_eq!(path.extension().unwrap(), "bmp");

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], b"BM");
        let file_size = u32::from_le_bytes(bytes[2..6].try_into().unwrap());
        assert_eq!(file_size as usize, bytes.len());
        // 2 pixels * 3 bytes rounds up to 8 bytes per BMP row.
        assert_eq!(bytes.len(), 14 + 40 + 8);
    }

    #[test]
    fn yuv_dump_concatenates_planes() {
        let dir = tempfile::tempdir().unwrap();
        let y = [1u8, 2, 3, 4];
        let uv = [5u8, 6];
        let mut frame = VideoFrame::empty();
        frame.data[0] = y.as_ptr();
        frame.data[1] = uv.as_ptr();
        frame.stride[0] = 2;
        frame.stride[1] = 2;
        frame.pixel_format = PixelFormat::Nv12;
        frame.width = 2;
        frame.height = 2;
        frame.size_in_bytes = 6;

        let path = dump_frame_to_file(&frame, &dir.path().join("frame")).unwrap();
        assert!(path.to_string_lossy().ends_with("NV12.yuv"));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn timestamped_dump_lands_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let pixels = [0u8; 6];
        let frame = bgr_frame(&pixels, 2, 1);
        let path = dump_frame_to_directory(&frame, dir.path()).unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path.to_string_lossy().contains("2x1_0"));
    }
}
