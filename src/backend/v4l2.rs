// SPDX-License-Identifier: MPL-2.0

//! Linux capture backend: V4L2 streaming I/O with an mmap buffer ring.
//!
//! Device and format discovery go through the `v4l` crate; the streaming
//! ring is driven with raw ioctls because zero-copy frames need manual
//! buffer control (a dequeued buffer is requeued only when the last
//! consumer reference to its frame drops).

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};
use v4l::framesize::FrameSizeEnum;
use v4l::video::Capture;

use super::PlatformBackend;
use crate::errors::{report_error, ErrorCode};
use crate::format::{FrameOrientation, PixelFormat};
use crate::frame::NativeHandle;
use crate::provider::core::{FrameProperty, ProviderCore};
use crate::provider::{normalize_resolutions, sort_virtual_cameras_last, DeviceInfo, Resolution};

const BUFFER_COUNT: u32 = 4;
const POLL_TIMEOUT_MS: i32 = 100;

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_MEMORY_MMAP: u32 = 1;

// ioctl request numbers for the x86-64/AArch64 ABI; QUERYCAP matches the
// value used by `v4l2-ctl --all` probes.
const VIDIOC_QUERYCAP: libc::c_ulong = 0x8068_5600;
const VIDIOC_G_FMT: libc::c_ulong = 0xC0D0_5604;
const VIDIOC_S_FMT: libc::c_ulong = 0xC0D0_5605;
const VIDIOC_REQBUFS: libc::c_ulong = 0xC014_5608;
const VIDIOC_QUERYBUF: libc::c_ulong = 0xC058_5609;
const VIDIOC_QBUF: libc::c_ulong = 0xC058_560F;
const VIDIOC_DQBUF: libc::c_ulong = 0xC058_5611;
const VIDIOC_STREAMON: libc::c_ulong = 0x4004_5612;
const VIDIOC_STREAMOFF: libc::c_ulong = 0x4004_5613;

#[repr(C)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2PixFormat {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

// The kernel union is 200 bytes and 8-byte aligned (v4l2_window holds
// pointers); `raw` keeps both properties.
#[repr(C)]
union V4l2FormatUnion {
    pix: V4l2PixFormat,
    raw: [u64; 25],
}

#[repr(C)]
struct V4l2Format {
    type_: u32,
    _pad: u32,
    fmt: V4l2FormatUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
union V4l2BufferM {
    offset: u32,
    userptr: libc::c_ulong,
    fd: i32,
}

#[repr(C)]
struct V4l2Buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    _pad: u32,
    timestamp: libc::timeval,
    timecode: V4l2Timecode,
    sequence: u32,
    memory: u32,
    m: V4l2BufferM,
    length: u32,
    reserved2: u32,
    request_fd: u32,
}

fn zeroed_buffer(index: u32) -> V4l2Buffer {
    let mut buf: V4l2Buffer = unsafe { std::mem::zeroed() };
    buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
    buf.memory = V4L2_MEMORY_MMAP;
    buf.index = index;
    buf
}

fn errno_message() -> String {
    std::io::Error::last_os_error().to_string()
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// V4L2 fourcc ↔ pixel format mapping; MJPG is recognized during
/// enumeration but not streamed (the core wants raw frames only).
const SUPPORTED_V4L2_FORMATS: [(u32, PixelFormat); 9] = [
    (fourcc(b"YUYV"), PixelFormat::Yuyv),
    (fourcc(b"UYVY"), PixelFormat::Uyvy),
    (fourcc(b"NV12"), PixelFormat::Nv12),
    (fourcc(b"YU12"), PixelFormat::I420),
    (fourcc(b"RGB3"), PixelFormat::Rgb24),
    (fourcc(b"BGR3"), PixelFormat::Bgr24),
    (fourcc(b"RGB4"), PixelFormat::Rgba32),
    (fourcc(b"BGR4"), PixelFormat::Bgra32),
    (fourcc(b"MJPG"), PixelFormat::Unknown),
];

fn v4l2_to_pixel_format(pixelformat: u32) -> PixelFormat {
    SUPPORTED_V4L2_FORMATS
        .iter()
        .find(|(code, _)| *code == pixelformat)
        .map(|(_, format)| *format)
        .unwrap_or(PixelFormat::Unknown)
}

fn pixel_format_to_v4l2(format: PixelFormat) -> u32 {
    // Range variants negotiate as their base layout; V4L2 fourccs carry no
    // range information.
    let base = format.bits() & !crate::format::bits::FULL_RANGE;
    SUPPORTED_V4L2_FORMATS
        .iter()
        .find(|(_, f)| f.bits() == base)
        .map(|(code, _)| *code)
        .unwrap_or(0)
}

struct MappedBuffer {
    ptr: *mut libc::c_void,
    length: usize,
}

/// Owns the streaming session's mmap ring and a dup of the device fd.
///
/// Zero-copy frames keep an `Arc` to the ring, so the mappings (and the
/// driver buffers) outlive `stop`/`close` until the last frame drops; a
/// requeue after `stop` degrades to a logged no-op via the `streaming`
/// flag.
struct SessionRing {
    fd: RawFd,
    buffers: Vec<MappedBuffer>,
    streaming: AtomicBool,
}

// Safety: the mmap pointers are immutable from the process side while the
// driver fills them; access is serialized by V4L2 buffer ownership (a
// buffer is either queued in the driver or owned by exactly one frame).
unsafe impl Send for SessionRing {}
unsafe impl Sync for SessionRing {}

impl SessionRing {
    /// Hands a buffer back to the driver once its frame is released.
    fn requeue(&self, index: u32) {
        if !self.streaming.load(Ordering::Acquire) {
            trace!(index, "session no longer streaming, skipping requeue");
            return;
        }
        let mut buf = zeroed_buffer(index);
        let result = unsafe { libc::ioctl(self.fd, VIDIOC_QBUF, &mut buf as *mut V4l2Buffer) };
        if result < 0 {
            report_error(
                ErrorCode::FrameCaptureFailed,
                &format!("VIDIOC_QBUF on frame release failed: {}", errno_message()),
            );
        }
    }

    fn queue_all(&self) -> bool {
        for index in 0..self.buffers.len() as u32 {
            let mut buf = zeroed_buffer(index);
            let result = unsafe { libc::ioctl(self.fd, VIDIOC_QBUF, &mut buf as *mut V4l2Buffer) };
            if result < 0 {
                report_error(
                    ErrorCode::DeviceStartFailed,
                    &format!("VIDIOC_QBUF failed: {}", errno_message()),
                );
                return false;
            }
        }
        true
    }
}

impl Drop for SessionRing {
    fn drop(&mut self) {
        for buffer in &self.buffers {
            if !buffer.ptr.is_null() && buffer.ptr != libc::MAP_FAILED {
                unsafe { libc::munmap(buffer.ptr, buffer.length) };
            }
        }
        // Hint the driver to free its buffers; best effort during cleanup.
        let mut req: V4l2RequestBuffers = unsafe { std::mem::zeroed() };
        req.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = V4L2_MEMORY_MMAP;
        unsafe {
            libc::ioctl(self.fd, VIDIOC_REQBUFS, &mut req as *mut V4l2RequestBuffers);
            libc::close(self.fd);
        }
        trace!("capture session ring released");
    }
}

#[repr(C)]
struct V4l2RequestBuffers {
    count: u32,
    type_: u32,
    memory: u32,
    reserved: [u32; 2],
}

/// Configuration snapshot a capture thread runs with; capture properties
/// are immutable per session.
#[derive(Clone)]
struct SessionConfig {
    width: u32,
    height: u32,
    camera_format: PixelFormat,
    bytes_per_line: u32,
}

pub(crate) struct V4l2Backend {
    core: Arc<ProviderCore>,
    fd: RawFd,
    device_path: String,
    device_name: String,
    opened: bool,
    stop_flag: Arc<AtomicBool>,
    capture_thread: Option<JoinHandle<()>>,
    ring: Option<Arc<SessionRing>>,
    supported_formats: Vec<PixelFormat>,
    supported_resolutions: Vec<Resolution>,
}

impl V4l2Backend {
    pub(crate) fn new(core: Arc<ProviderCore>) -> Self {
        V4l2Backend {
            core,
            fd: -1,
            device_path: String::new(),
            device_name: String::new(),
            opened: false,
            stop_flag: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
            ring: None,
            supported_formats: Vec::new(),
            supported_resolutions: Vec::new(),
        }
    }

    fn is_streaming(&self) -> bool {
        self.ring.is_some()
    }

    /// All `/dev/video*` nodes that are streaming video-capture devices,
    /// sorted by path, with their card names.
    fn scan_devices() -> Vec<(String, String)> {
        let mut paths: Vec<String> = std::fs::read_dir("/dev")
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with("video").then(|| format!("/dev/{name}"))
            })
            .collect();
        paths.sort();

        let mut devices = Vec::new();
        for path in paths {
            let Ok(device) = v4l::Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = device.query_caps() else {
                continue;
            };
            use v4l::capability::Flags;
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE)
                || !caps.capabilities.contains(Flags::STREAMING)
            {
                continue;
            }
            debug!(path = %path, card = %caps.card, "found video capture device");
            devices.push((path, caps.card));
        }
        devices
    }

    fn resolve_device(&self, device_name: &str) -> Option<(String, String)> {
        let devices = Self::scan_devices();
        if device_name.is_empty() {
            return devices.into_iter().next();
        }
        devices
            .into_iter()
            .find(|(path, card)| card == device_name || path == device_name)
    }

    /// Reads the supported format/resolution tables through the `v4l`
    /// crate (enumeration is its sweet spot; streaming is not).
    fn enumerate_formats(&mut self) -> bool {
        self.supported_formats.clear();
        self.supported_resolutions.clear();

        let Ok(device) = v4l::Device::with_path(&self.device_path) else {
            return false;
        };
        let Ok(descriptions) = device.enum_formats() else {
            return false;
        };

        for description in descriptions {
            let code = u32::from_le_bytes(description.fourcc.repr);
            let format = v4l2_to_pixel_format(code);
            if format == PixelFormat::Unknown && code != fourcc(b"MJPG") {
                continue;
            }
            if format != PixelFormat::Unknown {
                self.supported_formats.push(format);
            }

            let Ok(sizes) = device.enum_framesizes(description.fourcc) else {
                continue;
            };
            for size in sizes {
                match size.size {
                    FrameSizeEnum::Discrete(discrete) => {
                        self.supported_resolutions.push(Resolution {
                            width: discrete.width,
                            height: discrete.height,
                        });
                    }
                    FrameSizeEnum::Stepwise(stepwise) => {
                        const COMMON: [(u32, u32); 8] = [
                            (320, 240),
                            (640, 480),
                            (800, 600),
                            (1024, 768),
                            (1280, 720),
                            (1920, 1080),
                            (2560, 1440),
                            (3840, 2160),
                        ];
                        for (width, height) in COMMON {
                            if width >= stepwise.min_width
                                && width <= stepwise.max_width
                                && height >= stepwise.min_height
                                && height <= stepwise.max_height
                            {
                                self.supported_resolutions.push(Resolution { width, height });
                            }
                        }
                    }
                }
            }
        }

        normalize_resolutions(&mut self.supported_resolutions);
        !self.supported_formats.is_empty() || !self.supported_resolutions.is_empty()
    }

    fn query_capabilities(&self) -> bool {
        let mut caps: V4l2Capability = unsafe { std::mem::zeroed() };
        let result =
            unsafe { libc::ioctl(self.fd, VIDIOC_QUERYCAP, &mut caps as *mut V4l2Capability) };
        if result < 0 {
            report_error(
                ErrorCode::DeviceOpenFailed,
                &format!("VIDIOC_QUERYCAP failed: {}", errno_message()),
            );
            return false;
        }
        const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
        const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
        let effective = if caps.device_caps != 0 {
            caps.device_caps
        } else {
            caps.capabilities
        };
        if effective & V4L2_CAP_VIDEO_CAPTURE == 0 {
            report_error(
                ErrorCode::UnsupportedPixelFormat,
                "device does not support video capture",
            );
            return false;
        }
        if effective & V4L2_CAP_STREAMING == 0 {
            report_error(
                ErrorCode::UnsupportedPixelFormat,
                "device does not support streaming I/O",
            );
            return false;
        }
        true
    }

    /// Applies the requested size/format via `VIDIOC_S_FMT`, then reads
    /// back what the driver actually chose and records it as the canonical
    /// frame property.
    fn negotiate_format(&mut self) -> Option<SessionConfig> {
        let mut format: V4l2Format = unsafe { std::mem::zeroed() };
        format.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        if unsafe { libc::ioctl(self.fd, VIDIOC_G_FMT, &mut format as *mut V4l2Format) } < 0 {
            report_error(
                ErrorCode::DeviceStartFailed,
                &format!("VIDIOC_G_FMT failed: {}", errno_message()),
            );
            return None;
        }

        let requested: FrameProperty = self.core.snapshot().0;
        let mut changed = false;
        unsafe {
            if requested.width > 0 && requested.height > 0 {
                let (w, h) = (requested.width as u32, requested.height as u32);
                if format.fmt.pix.width != w || format.fmt.pix.height != h {
                    format.fmt.pix.width = w;
                    format.fmt.pix.height = h;
                    changed = true;
                }
            }
            if requested.camera_pixel_format != PixelFormat::Unknown {
                let code = pixel_format_to_v4l2(requested.camera_pixel_format);
                if code != 0 && format.fmt.pix.pixelformat != code {
                    format.fmt.pix.pixelformat = code;
                    changed = true;
                }
            } else if v4l2_to_pixel_format(format.fmt.pix.pixelformat) == PixelFormat::Unknown {
                // No format requested and the driver's current choice is
                // something we cannot stream (e.g. MJPG); fall back to the
                // first raw format the device advertises.
                if let Some(fallback) = self.supported_formats.first() {
                    format.fmt.pix.pixelformat = pixel_format_to_v4l2(*fallback);
                    changed = true;
                }
            }
        }

        if changed {
            if unsafe { libc::ioctl(self.fd, VIDIOC_S_FMT, &mut format as *mut V4l2Format) } < 0 {
                warn!(
                    error = %errno_message(),
                    "VIDIOC_S_FMT rejected, keeping the driver's format"
                );
            }
            if unsafe { libc::ioctl(self.fd, VIDIOC_G_FMT, &mut format as *mut V4l2Format) } < 0 {
                report_error(
                    ErrorCode::DeviceStartFailed,
                    &format!("VIDIOC_G_FMT after set failed: {}", errno_message()),
                );
                return None;
            }
        }

        let pix = unsafe { format.fmt.pix };
        let mut negotiated = v4l2_to_pixel_format(pix.pixelformat);
        if negotiated == PixelFormat::Unknown {
            report_error(
                ErrorCode::UnsupportedPixelFormat,
                &format!(
                    "driver selected an unsupported capture format (fourcc {:#010x})",
                    pix.pixelformat
                ),
            );
            return None;
        }
        // Preserve the range bit the caller asked for; the V4L2 fourcc
        // does not carry it.
        if requested.camera_pixel_format.is_full_range()
            && requested
                .camera_pixel_format
                .includes(negotiated.bits())
        {
            negotiated = requested.camera_pixel_format;
        }

        {
            let mut settings = self.core.settings.lock().unwrap_or_else(|e| e.into_inner());
            settings.frame_prop.width = pix.width as i32;
            settings.frame_prop.height = pix.height as i32;
            settings.frame_prop.camera_pixel_format = negotiated;
            settings.property_changed = false;
        }
        info!(
            width = pix.width,
            height = pix.height,
            format = %negotiated,
            bytes_per_line = pix.bytesperline,
            "capture format negotiated"
        );

        Some(SessionConfig {
            width: pix.width,
            height: pix.height,
            camera_format: negotiated,
            bytes_per_line: pix.bytesperline,
        })
    }

    /// Requests and memory-maps the driver buffer ring.
    fn allocate_ring(&mut self) -> Option<Arc<SessionRing>> {
        let mut request: V4l2RequestBuffers = unsafe { std::mem::zeroed() };
        request.count = BUFFER_COUNT;
        request.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        request.memory = V4L2_MEMORY_MMAP;
        if unsafe {
            libc::ioctl(
                self.fd,
                VIDIOC_REQBUFS,
                &mut request as *mut V4l2RequestBuffers,
            )
        } < 0
        {
            report_error(
                ErrorCode::MemoryAllocationFailed,
                &format!("VIDIOC_REQBUFS failed: {}", errno_message()),
            );
            return None;
        }
        if request.count < 2 {
            report_error(
                ErrorCode::MemoryAllocationFailed,
                "insufficient buffer memory from driver",
            );
            return None;
        }

        // The ring owns a dup so `close` on the backend fd cannot
        // invalidate in-flight frame disposers.
        let ring_fd = unsafe { libc::dup(self.fd) };
        if ring_fd < 0 {
            report_error(
                ErrorCode::MemoryAllocationFailed,
                &format!("dup of device fd failed: {}", errno_message()),
            );
            return None;
        }

        let mut buffers = Vec::with_capacity(request.count as usize);
        for index in 0..request.count {
            let mut buf = zeroed_buffer(index);
            if unsafe { libc::ioctl(self.fd, VIDIOC_QUERYBUF, &mut buf as *mut V4l2Buffer) } < 0 {
                report_error(
                    ErrorCode::MemoryAllocationFailed,
                    &format!("VIDIOC_QUERYBUF failed: {}", errno_message()),
                );
                drop(SessionRing {
                    fd: ring_fd,
                    buffers,
                    streaming: AtomicBool::new(false),
                });
                return None;
            }
            let offset = unsafe { buf.m.offset };
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    buf.length as usize,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.fd,
                    offset as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                report_error(
                    ErrorCode::MemoryAllocationFailed,
                    &format!("mmap of capture buffer failed: {}", errno_message()),
                );
                drop(SessionRing {
                    fd: ring_fd,
                    buffers,
                    streaming: AtomicBool::new(false),
                });
                return None;
            }
            buffers.push(MappedBuffer {
                ptr,
                length: buf.length as usize,
            });
        }

        debug!(count = buffers.len(), "mapped capture buffers");
        Some(Arc::new(SessionRing {
            fd: ring_fd,
            buffers,
            streaming: AtomicBool::new(false),
        }))
    }
}

impl PlatformBackend for V4l2Backend {
    fn find_device_names(&mut self) -> Vec<String> {
        let mut names: Vec<String> = Self::scan_devices()
            .into_iter()
            .map(|(path, card)| if card.is_empty() { path } else { card })
            .collect();
        sort_virtual_cameras_last(&mut names);
        names
    }

    fn open(&mut self, device_name: &str) -> bool {
        if self.opened {
            report_error(ErrorCode::DeviceOpenFailed, "device already opened");
            return false;
        }

        let Some((path, card)) = self.resolve_device(device_name) else {
            if device_name.is_empty() {
                report_error(ErrorCode::NoDeviceFound, "no video devices found");
            } else {
                report_error(
                    ErrorCode::InvalidDevice,
                    &format!("device not found: {device_name}"),
                );
            }
            return false;
        };

        let c_path = CString::new(path.as_str()).expect("device path has no interior NUL");
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if fd < 0 {
            report_error(
                ErrorCode::DeviceOpenFailed,
                &format!("failed to open {path}: {}", errno_message()),
            );
            return false;
        }

        self.fd = fd;
        self.device_path = path;
        self.device_name = if card.is_empty() {
            self.device_path.clone()
        } else {
            card
        };

        if !self.query_capabilities() || !self.enumerate_formats() {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
            report_error(
                ErrorCode::DeviceOpenFailed,
                &format!("failed to set up device {}", self.device_path),
            );
            return false;
        }

        self.core.reset_frame_index();
        self.opened = true;
        info!(device = %self.device_name, path = %self.device_path, "device opened");
        true
    }

    fn is_opened(&self) -> bool {
        self.opened && self.fd >= 0
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        if !self.is_opened() {
            return None;
        }
        Some(DeviceInfo {
            device_name: self.device_name.clone(),
            supported_pixel_formats: self.supported_formats.clone(),
            supported_resolutions: self.supported_resolutions.clone(),
        })
    }

    fn close(&mut self) {
        if self.is_streaming() {
            self.stop();
        }
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        self.opened = false;
        self.core.drain_available_frames();
        debug!("device closed");
    }

    fn start(&mut self) -> bool {
        if !self.is_opened() {
            report_error(ErrorCode::DeviceStartFailed, "device not opened");
            return false;
        }
        if self.is_streaming() {
            warn!("already streaming");
            return true;
        }

        let Some(config) = self.negotiate_format() else {
            report_error(ErrorCode::DeviceStartFailed, "failed to start streaming");
            return false;
        };
        let Some(ring) = self.allocate_ring() else {
            report_error(ErrorCode::DeviceStartFailed, "failed to start streaming");
            return false;
        };
        if !ring.queue_all() {
            report_error(ErrorCode::DeviceStartFailed, "failed to start streaming");
            return false;
        }

        let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        if unsafe { libc::ioctl(self.fd, VIDIOC_STREAMON, &mut buf_type as *mut u32) } < 0 {
            report_error(
                ErrorCode::DeviceStartFailed,
                &format!("VIDIOC_STREAMON failed: {}", errno_message()),
            );
            return false;
        }
        ring.streaming.store(true, Ordering::Release);

        self.stop_flag.store(false, Ordering::Release);
        let thread_ring = ring.clone();
        let thread_core = self.core.clone();
        let thread_stop = self.stop_flag.clone();
        self.capture_thread = Some(
            std::thread::Builder::new()
                .name("framegrab-v4l2".into())
                .spawn(move || capture_loop(thread_ring, thread_core, thread_stop, config))
                .expect("spawn capture thread"),
        );

        self.ring = Some(ring);
        self.core.mark_started();
        info!("streaming started");
        true
    }

    fn stop(&mut self) {
        if !self.is_streaming() {
            return;
        }

        self.stop_flag.store(true, Ordering::Release);
        if let Some(thread) = self.capture_thread.take() {
            let _ = thread.join();
        }

        if let Some(ring) = self.ring.take() {
            // Flip the flag before STREAMOFF so frame disposers racing the
            // shutdown skip their requeue.
            ring.streaming.store(false, Ordering::Release);
            let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE;
            if unsafe { libc::ioctl(self.fd, VIDIOC_STREAMOFF, &mut buf_type as *mut u32) } < 0 {
                report_error(
                    ErrorCode::DeviceStopFailed,
                    &format!("VIDIOC_STREAMOFF failed: {}", errno_message()),
                );
            }
            // Dropping our Arc releases the mappings once the last
            // outstanding zero-copy frame drops.
        }

        self.core.mark_stopped();
        info!("streaming stopped");
    }

    fn is_started(&self) -> bool {
        self.is_streaming() && !self.stop_flag.load(Ordering::Acquire)
    }
}

impl Drop for V4l2Backend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Capture thread: poll → dequeue → wrap/convert → publish.
fn capture_loop(
    ring: Arc<SessionRing>,
    core: Arc<ProviderCore>,
    stop_flag: Arc<AtomicBool>,
    config: SessionConfig,
) {
    debug!("capture thread started");
    let session_start = Instant::now();

    while !stop_flag.load(Ordering::Acquire) {
        if !read_frame(&ring, &core, &config, session_start) {
            // Error or timeout; back off briefly like any poll-driven loop.
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    debug!("capture thread finished");
}

fn read_frame(
    ring: &Arc<SessionRing>,
    core: &Arc<ProviderCore>,
    config: &SessionConfig,
    session_start: Instant,
) -> bool {
    let mut fds = libc::pollfd {
        fd: ring.fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut fds, 1, POLL_TIMEOUT_MS) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            error!(error = %err, "poll on capture fd failed");
        }
        return false;
    }
    if ret == 0 {
        return true; // poll timeout is the idle path, not an error
    }

    // Leave the buffer queued when the consumer is behind; this
    // backpressures the driver instead of churning frames.
    if core.too_many_new_frames() {
        trace!("ready queue at capacity, leaving buffer queued");
        return true;
    }

    let mut frame = core.get_free_frame();

    let mut buf = zeroed_buffer(0);
    buf.index = 0;
    if unsafe { libc::ioctl(ring.fd, VIDIOC_DQBUF, &mut buf as *mut V4l2Buffer) } < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            error!(error = %err, "VIDIOC_DQBUF failed");
        }
        return false;
    }
    let index = buf.index;
    let base = ring.buffers[index as usize].ptr as *const u8;

    frame.width = config.width;
    frame.height = config.height;
    frame.pixel_format = config.camera_format;
    frame.timestamp = session_start.elapsed().as_nanos() as u64;
    frame.size_in_bytes = buf.bytesused;

    let decision = core.ingress_decision(config.camera_format, FrameOrientation::TopToBottom);
    frame.orientation = decision.frame_orientation;

    if config.camera_format.is_yuv() {
        frame.data[0] = base;
        frame.stride[0] = config.width;
        if config.camera_format.includes(PixelFormat::Nv12.bits()) {
            frame.data[1] = unsafe { base.add((config.width * config.height) as usize) };
            frame.data[2] = std::ptr::null();
            frame.stride[1] = config.width;
            frame.stride[2] = 0;
        } else if config.camera_format.includes(PixelFormat::I420.bits()) {
            let luma = (config.width * config.height) as usize;
            frame.data[1] = unsafe { base.add(luma) };
            frame.data[2] = unsafe { base.add(luma + luma / 4) };
            frame.stride[1] = config.width / 2;
            frame.stride[2] = config.width / 2;
        } else {
            // Packed 4:2:2 stream.
            frame.data[1] = std::ptr::null();
            frame.data[2] = std::ptr::null();
            frame.stride[0] = config.bytes_per_line;
            frame.stride[1] = 0;
            frame.stride[2] = 0;
        }
    } else {
        frame.data[0] = base;
        frame.data[1] = std::ptr::null();
        frame.data[2] = std::ptr::null();
        frame.stride[0] = config.bytes_per_line;
        frame.stride[1] = 0;
        frame.stride[2] = 0;
    }

    let mut zero_copy = !decision.should_convert && !decision.should_flip;
    if !zero_copy {
        zero_copy = !crate::convert::convert_frame_in_place(
            &mut frame,
            decision.output_format,
            decision.should_flip,
        );
    }

    if zero_copy {
        // Either no transform was needed or the conversion fell through;
        // emit the camera's native bytes and let the frame's release
        // requeue the driver buffer.
        frame.orientation = FrameOrientation::TopToBottom;
        frame.pixel_format = config.camera_format;
        frame.native_handle = Some(NativeHandle::BufferIndex(index));
        let disposer_ring = ring.clone();
        frame.disposer = Some(Box::new(move || disposer_ring.requeue(index)));
    } else {
        frame.size_in_bytes = frame.stride(0) * frame.height
            + (frame.stride(1) + frame.stride(2)) * frame.height / 2;
        // The converted frame owns its pixels; the driver can refill the
        // buffer right away.
        ring.requeue(index);
    }

    frame.frame_index = core.next_frame_index();
    trace!(
        frame_index = frame.frame_index,
        bytes = frame.size_in_bytes,
        zero_copy,
        "frame captured"
    );
    core.new_frame_available(frame);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_mapping_round_trips() {
        assert_eq!(v4l2_to_pixel_format(fourcc(b"YUYV")), PixelFormat::Yuyv);
        assert_eq!(v4l2_to_pixel_format(fourcc(b"YU12")), PixelFormat::I420);
        assert_eq!(v4l2_to_pixel_format(fourcc(b"MJPG")), PixelFormat::Unknown);
        assert_eq!(v4l2_to_pixel_format(0x1234_5678), PixelFormat::Unknown);

        assert_eq!(pixel_format_to_v4l2(PixelFormat::Nv12), fourcc(b"NV12"));
        // Range variants negotiate as their base layout.
        assert_eq!(pixel_format_to_v4l2(PixelFormat::Nv12Full), fourcc(b"NV12"));
        assert_eq!(pixel_format_to_v4l2(PixelFormat::Unknown), 0);
    }

    #[test]
    fn v4l2_abi_struct_sizes() {
        // The ioctl numbers encode these sizes; a drift here would corrupt
        // the kernel interface.
        assert_eq!(std::mem::size_of::<V4l2Capability>(), 0x68);
        assert_eq!(std::mem::size_of::<V4l2Format>(), 0xD0);
        assert_eq!(std::mem::size_of::<V4l2RequestBuffers>(), 0x14);
        assert_eq!(std::mem::size_of::<V4l2Buffer>(), 0x58);
    }

    #[test]
    fn device_scan_does_not_panic_without_cameras() {
        // On CI boxes there is usually no camera; the scan must simply
        // come back empty.
        let _devices = V4l2Backend::scan_devices();
    }
}
