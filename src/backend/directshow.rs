// SPDX-License-Identifier: MPL-2.0

//! Windows capture backend: a DirectShow graph with a SampleGrabber tap.
//!
//! Graph shape: device source → SampleGrabber → NullRenderer, clocked
//! free-running. Media types are enumerated and scored against the
//! requested size/format; MJPEG sources negotiate an RGB grabber subtype
//! so the platform decoder does the JPEG work. Samples are delivered
//! through `ISampleGrabberCB::SampleCB` on the graph's streaming thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};
use windows::core::{implement, Interface, GUID, PCWSTR};
use windows::Win32::Media::DirectShow::{
    ICaptureGraphBuilder2, ICreateDevEnum, IGraphBuilder, IMediaControl, IMediaFilter,
    IMediaSample, ISampleGrabber, ISampleGrabberCB, ISampleGrabberCB_Impl, IVideoWindow,
    CLSID_CaptureGraphBuilder2, CLSID_FilterGraph, CLSID_NullRenderer, CLSID_SampleGrabber,
    CLSID_SystemDeviceEnum, CLSID_VideoInputDeviceCategory, PIN_CATEGORY_PREVIEW,
};
use windows::Win32::Media::DirectShow::{IAMStreamConfig, IBaseFilter};
use windows::Win32::Media::MediaFoundation::{
    AM_MEDIA_TYPE, FORMAT_VideoInfo, MEDIASUBTYPE_RGB24, MEDIASUBTYPE_RGB32, MEDIATYPE_Video,
    VIDEOINFOHEADER,
};
use windows::Win32::System::Com::StructuredStorage::IPropertyBag;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CoUninitialize, IMoniker,
    CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED,
};
use windows::Win32::System::Variant::VARIANT;

use super::PlatformBackend;
use crate::errors::{report_error, ErrorCode};
use crate::format::{FrameOrientation, PixelFormat};
use crate::frame::NativeHandle;
use crate::provider::core::ProviderCore;
use crate::provider::{normalize_resolutions, sort_virtual_cameras_last, DeviceInfo, Resolution};

/// FOURCC-derived media subtype `{fourcc}-0000-0010-8000-00AA00389B71`.
const fn fourcc_subtype(code: &[u8; 4]) -> GUID {
    GUID::from_u128(
        ((u32::from_le_bytes(*code) as u128) << 96)
            | 0x0000_0010_8000_00AA_0038_9B71u128,
    )
}

const MEDIASUBTYPE_MJPG: GUID = fourcc_subtype(b"MJPG");
const MEDIASUBTYPE_YUY2: GUID = fourcc_subtype(b"YUY2");
const MEDIASUBTYPE_UYVY: GUID = fourcc_subtype(b"UYVY");
const MEDIASUBTYPE_NV12: GUID = fourcc_subtype(b"NV12");
const MEDIASUBTYPE_I420: GUID = fourcc_subtype(b"I420");

fn subtype_to_pixel_format(subtype: &GUID) -> PixelFormat {
    if *subtype == MEDIASUBTYPE_RGB24 {
        PixelFormat::Bgr24 // DirectShow RGB24 is B-G-R in memory
    } else if *subtype == MEDIASUBTYPE_RGB32 {
        PixelFormat::Bgra32
    } else if *subtype == MEDIASUBTYPE_YUY2 {
        PixelFormat::Yuyv
    } else if *subtype == MEDIASUBTYPE_UYVY {
        PixelFormat::Uyvy
    } else if *subtype == MEDIASUBTYPE_NV12 {
        PixelFormat::Nv12
    } else if *subtype == MEDIASUBTYPE_I420 {
        PixelFormat::I420
    } else {
        PixelFormat::Unknown
    }
}

fn pixel_format_to_subtype(format: PixelFormat) -> Option<GUID> {
    let base = PixelFormat::from_bits(format.bits() & !crate::format::bits::FULL_RANGE)?;
    match base {
        PixelFormat::Bgr24 => Some(MEDIASUBTYPE_RGB24),
        PixelFormat::Bgra32 => Some(MEDIASUBTYPE_RGB32),
        PixelFormat::Yuyv => Some(MEDIASUBTYPE_YUY2),
        PixelFormat::Uyvy => Some(MEDIASUBTYPE_UYVY),
        PixelFormat::Nv12 => Some(MEDIASUBTYPE_NV12),
        PixelFormat::I420 => Some(MEDIASUBTYPE_I420),
        _ => None,
    }
}

/// Session facts the streaming thread needs; written once before `Run`.
struct SessionConfig {
    width: u32,
    height: u32,
    camera_format: PixelFormat,
}

struct CallbackShared {
    core: Arc<ProviderCore>,
    config: Mutex<SessionConfig>,
    running: AtomicBool,
    first_frame_seen: AtomicBool,
    session_start: Mutex<Option<Instant>>,
    /// Monotonic fallback for virtual cameras that report sampleTime 0.
    zero_time_frames: AtomicU64,
}

#[implement(ISampleGrabberCB)]
struct SampleGrabberCallback {
    shared: Arc<CallbackShared>,
}

impl ISampleGrabberCB_Impl for SampleGrabberCallback_Impl {
    fn SampleCB(&self, sample_time: f64, sample: Option<&IMediaSample>) -> windows::core::Result<()> {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(sample) = sample else {
            return Ok(());
        };
        deliver_sample(shared, sample_time, sample);
        Ok(())
    }

    fn BufferCB(
        &self,
        _sample_time: f64,
        _buffer: *mut u8,
        _buffer_len: i32,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}

fn deliver_sample(shared: &Arc<CallbackShared>, sample_time: f64, sample: &IMediaSample) {
    let core = &shared.core;
    if core.too_many_new_frames() {
        // Skip without AddRef; the allocator reuses the sample.
        return;
    }

    let mut data: *mut u8 = std::ptr::null_mut();
    if unsafe { sample.GetPointer(&mut data) }.is_err() || data.is_null() {
        report_error(ErrorCode::FrameCaptureFailed, "IMediaSample::GetPointer failed");
        return;
    }
    let buffer_len = unsafe { sample.GetActualDataLength() } as u32;

    let (width, height, camera_format) = {
        let config = shared.config.lock().unwrap_or_else(|e| e.into_inner());
        (config.width, config.height, config.camera_format)
    };

    let first = !shared.first_frame_seen.swap(true, Ordering::AcqRel);
    if first {
        let mut start = shared
            .session_start
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *start = Some(Instant::now());
    }

    let mut frame = core.get_free_frame();
    frame.width = width;
    frame.height = height;
    frame.pixel_format = camera_format;
    frame.size_in_bytes = buffer_len;

    // Virtual cameras often deliver sampleTime 0 on every frame after the
    // first; fall back to the session clock there.
    frame.timestamp = if sample_time == 0.0 && !first {
        shared.zero_time_frames.fetch_add(1, Ordering::Relaxed);
        let start = shared
            .session_start
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        start
            .map(|s| s.elapsed().as_nanos() as u64)
            .unwrap_or_default()
    } else {
        (sample_time * 1e9) as u64
    };

    let input_orientation = if camera_format.is_yuv() {
        FrameOrientation::TopToBottom
    } else {
        // DirectShow delivers RGB bottom-up.
        FrameOrientation::BottomToTop
    };
    let decision = core.ingress_decision(camera_format, input_orientation);
    frame.orientation = decision.frame_orientation;

    if camera_format.is_yuv() {
        frame.data[0] = data;
        frame.stride[0] = width;
        if camera_format.includes(PixelFormat::I420.bits()) {
            let luma = (width * height) as usize;
            frame.data[1] = unsafe { data.add(luma) };
            frame.data[2] = unsafe { data.add(luma + luma / 4) };
            frame.stride[1] = width / 2;
            frame.stride[2] = width / 2;
        } else if camera_format.includes(PixelFormat::Nv12.bits()) {
            frame.data[1] = unsafe { data.add((width * height) as usize) };
            frame.data[2] = std::ptr::null();
            frame.stride[1] = width;
            frame.stride[2] = 0;
        } else {
            // Packed 4:2:2.
            frame.data[1] = std::ptr::null();
            frame.data[2] = std::ptr::null();
            frame.stride[0] = width * 2;
            frame.stride[1] = 0;
            frame.stride[2] = 0;
        }
    } else {
        let channels = if camera_format.has_alpha() { 4 } else { 3 };
        frame.data[0] = data;
        frame.data[1] = std::ptr::null();
        frame.data[2] = std::ptr::null();
        frame.stride[0] = (width * channels + 3) & !3; // DWORD-aligned rows
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
        frame.orientation = input_orientation;
        frame.pixel_format = camera_format;
        // AddRef the sample for the frame's lifetime; the disposer's
        // from_raw + drop releases it on the last-reference drop.
        let retained = sample.clone();
        frame.native_handle = Some(NativeHandle::Pointer(retained.as_raw()));
        let raw = retained.into_raw() as usize;
        frame.disposer = Some(Box::new(move || unsafe {
            drop(IMediaSample::from_raw(raw as *mut std::ffi::c_void));
        }));
    } else {
        frame.size_in_bytes = frame.stride(0) * frame.height
            + (frame.stride(1) + frame.stride(2)) * frame.height / 2;
    }

    frame.frame_index = core.next_frame_index();
    core.new_frame_available(frame);
}

/// Owned AM_MEDIA_TYPE with its format block, freed on drop.
struct MediaType(*mut AM_MEDIA_TYPE);

impl MediaType {
    fn video_header(&self) -> Option<&VIDEOINFOHEADER> {
        unsafe {
            let mt = &*self.0;
            if mt.formattype != FORMAT_VideoInfo || mt.pbFormat.is_null() {
                return None;
            }
            Some(&*(mt.pbFormat as *const VIDEOINFOHEADER))
        }
    }

    fn subtype(&self) -> GUID {
        unsafe { (*self.0).subtype }
    }
}

impl Drop for MediaType {
    fn drop(&mut self) {
        unsafe {
            if !self.0.is_null() {
                let mt = &*self.0;
                if !mt.pbFormat.is_null() {
                    CoTaskMemFree(Some(mt.pbFormat as *const _));
                }
                CoTaskMemFree(Some(self.0 as *const _));
            }
        }
    }
}

pub(crate) struct DirectShowBackend {
    core: Arc<ProviderCore>,
    graph: Option<IGraphBuilder>,
    capture_builder: Option<ICaptureGraphBuilder2>,
    device_filter: Option<IBaseFilter>,
    grabber_filter: Option<IBaseFilter>,
    grabber: Option<ISampleGrabber>,
    null_renderer: Option<IBaseFilter>,
    media_control: Option<IMediaControl>,
    shared: Option<Arc<CallbackShared>>,
    device_name: String,
    supported_formats: Vec<PixelFormat>,
    supported_resolutions: Vec<Resolution>,
    opened: bool,
    running: bool,
    com_initialized: bool,
}

// Safety: the COM interfaces are only used from the owning thread; the
// streaming thread reaches the backend exclusively through the Arc'd
// callback state.
unsafe impl Send for DirectShowBackend {}

impl DirectShowBackend {
    pub(crate) fn new(core: Arc<ProviderCore>) -> Self {
        let com_initialized = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED).is_ok() };
        DirectShowBackend {
            core,
            graph: None,
            capture_builder: None,
            device_filter: None,
            grabber_filter: None,
            grabber: None,
            null_renderer: None,
            media_control: None,
            shared: None,
            device_name: String::new(),
            supported_formats: Vec::new(),
            supported_resolutions: Vec::new(),
            opened: false,
            running: false,
            com_initialized,
        }
    }

    fn enumerate_devices() -> Vec<(IMoniker, String)> {
        let mut devices = Vec::new();
        unsafe {
            let dev_enum: ICreateDevEnum =
                match CoCreateInstance(&CLSID_SystemDeviceEnum, None, CLSCTX_INPROC_SERVER) {
                    Ok(dev_enum) => dev_enum,
                    Err(_) => return devices,
                };
            let mut enum_moniker = None;
            if dev_enum
                .CreateClassEnumerator(&CLSID_VideoInputDeviceCategory, &mut enum_moniker, 0)
                .is_err()
            {
                return devices;
            }
            let Some(enum_moniker) = enum_moniker else {
                return devices;
            };

            loop {
                let mut monikers = [None];
                let mut fetched = 0;
                if enum_moniker.Next(&mut monikers, Some(&mut fetched)).is_err() || fetched == 0 {
                    break;
                }
                let Some(moniker) = monikers[0].take() else {
                    break;
                };
                let bag: IPropertyBag = match moniker.BindToStorage(None, None) {
                    Ok(bag) => bag,
                    Err(_) => continue,
                };
                let mut variant = VARIANT::default();
                let name = PCWSTR::from_raw(windows::core::w!("FriendlyName").as_ptr());
                if bag.Read(name, &mut variant, None).is_ok() {
                    let friendly = variant.to_string();
                    devices.push((moniker, friendly));
                }
            }
        }
        devices
    }

    /// Enumerates stream capabilities, scores them against the requested
    /// size/format, applies the winner and records the negotiated
    /// properties.
    fn configure_stream(&mut self) -> bool {
        let (Some(builder), Some(device), Some(grabber)) = (
            self.capture_builder.as_ref(),
            self.device_filter.as_ref(),
            self.grabber.as_ref(),
        ) else {
            return false;
        };

        let stream_config: IAMStreamConfig = unsafe {
            let mut config: Option<IAMStreamConfig> = None;
            if builder
                .FindInterface(
                    Some(&PIN_CATEGORY_PREVIEW),
                    Some(&MEDIATYPE_Video),
                    device,
                    &IAMStreamConfig::IID,
                    &mut config as *mut _ as *mut *mut std::ffi::c_void,
                )
                .is_err()
                || config.is_none()
            {
                report_error(ErrorCode::DeviceOpenFailed, "IAMStreamConfig not available");
                return false;
            }
            config.unwrap()
        };

        let mut media_types = Vec::new();
        unsafe {
            let (mut count, mut size) = (0i32, 0i32);
            if stream_config
                .GetNumberOfCapabilities(&mut count, &mut size)
                .is_err()
            {
                count = 0;
            }
            let mut caps = vec![0u8; size.max(0) as usize];
            for index in 0..count {
                let mut mt: *mut AM_MEDIA_TYPE = std::ptr::null_mut();
                if stream_config
                    .GetStreamCaps(index, &mut mt, caps.as_mut_ptr())
                    .is_ok()
                    && !mt.is_null()
                {
                    let media_type = MediaType(mt);
                    if media_type.video_header().is_some() {
                        media_types.push(media_type);
                    }
                }
            }
        }
        if media_types.is_empty() {
            report_error(ErrorCode::DeviceOpenFailed, "no video media types");
            return false;
        }

        // Record the device's capability tables while we have them.
        self.supported_formats.clear();
        self.supported_resolutions.clear();
        for media_type in &media_types {
            let format = subtype_to_pixel_format(&media_type.subtype());
            if format != PixelFormat::Unknown && !self.supported_formats.contains(&format) {
                self.supported_formats.push(format);
            }
            if let Some(header) = media_type.video_header() {
                self.supported_resolutions.push(Resolution {
                    width: header.bmiHeader.biWidth.unsigned_abs(),
                    height: header.bmiHeader.biHeight.unsigned_abs(),
                });
            }
        }
        normalize_resolutions(&mut self.supported_resolutions);

        let (requested, _) = self.core.snapshot();
        let desired_width = requested.width.max(0);
        let desired_height = requested.height.max(0);

        // Filter to sizes covering the request; fall back to everything.
        let mut candidates: Vec<&MediaType> = media_types
            .iter()
            .filter(|mt| {
                mt.video_header().is_some_and(|header| {
                    header.bmiHeader.biWidth >= desired_width
                        && header.bmiHeader.biHeight.abs() >= desired_height
                })
            })
            .collect();
        if candidates.is_empty() {
            warn!("no media type at or above the requested size, using the closest");
            candidates = media_types.iter().collect();
        }

        // Keep every candidate at the minimum |ΔW| + |ΔH|.
        let mut best: Vec<&MediaType> = Vec::new();
        let mut best_distance = f64::INFINITY;
        for media_type in candidates {
            let Some(header) = media_type.video_header() else {
                continue;
            };
            let dw = (header.bmiHeader.biWidth - desired_width).abs() as f64;
            let dh = (header.bmiHeader.biHeight.abs() - desired_height).abs() as f64;
            let distance = dw + dh;
            if distance + 1e-5 < best_distance {
                best_distance = distance;
                best = vec![media_type];
            } else if (distance - best_distance).abs() < 1e-5 {
                best.push(media_type);
            }
        }

        // Tie-break: the requested format, then MJPEG for non-YUV outputs.
        let preferred = if requested.camera_pixel_format != PixelFormat::Unknown {
            requested.camera_pixel_format
        } else {
            requested.output_pixel_format
        };
        let chosen = best
            .iter()
            .find(|mt| {
                subtype_to_pixel_format(&mt.subtype()) == preferred
                    || (!preferred.is_yuv() && mt.subtype() == MEDIASUBTYPE_MJPG)
            })
            .copied()
            .or_else(|| best.first().copied());
        let Some(chosen) = chosen else {
            report_error(ErrorCode::DeviceOpenFailed, "media type scoring failed");
            return false;
        };

        let header = chosen.video_header().expect("scored type has a header");
        let mut camera_format = subtype_to_pixel_format(&chosen.subtype());
        let mut grabber_subtype = chosen.subtype();

        if chosen.subtype() == MEDIASUBTYPE_MJPG {
            // Let the platform decode JPEG; the grabber output subtype
            // selects the decoded layout.
            if requested.camera_pixel_format == PixelFormat::Bgra32 {
                camera_format = PixelFormat::Bgra32;
                grabber_subtype = MEDIASUBTYPE_RGB32;
            } else {
                camera_format = PixelFormat::Bgr24;
                grabber_subtype = MEDIASUBTYPE_RGB24;
            }
        }

        let width = header.bmiHeader.biWidth.unsigned_abs();
        let height = header.bmiHeader.biHeight.unsigned_abs();
        let fps = if header.AvgTimePerFrame > 0 {
            10_000_000.0 / header.AvgTimePerFrame as f64
        } else {
            0.0
        };

        unsafe {
            let mut grabber_mt: AM_MEDIA_TYPE = std::mem::zeroed();
            grabber_mt.majortype = MEDIATYPE_Video;
            grabber_mt.subtype = grabber_subtype;
            grabber_mt.formattype = FORMAT_VideoInfo;
            if grabber.SetMediaType(&grabber_mt).is_err() {
                report_error(ErrorCode::UnsupportedPixelFormat, "SetMediaType failed");
            }

            if let Err(err) = stream_config.SetFormat(chosen.0) {
                // Lenient on purpose: several virtual cameras reject
                // SetFormat yet stream the enumerated type just fine.
                report_error(
                    ErrorCode::UnsupportedPixelFormat,
                    &format!("SetFormat failed: {err}"),
                );
            }
        }

        {
            let mut settings = self.core.settings.lock().unwrap_or_else(|e| e.into_inner());
            settings.frame_prop.width = width as i32;
            settings.frame_prop.height = height as i32;
            settings.frame_prop.fps = fps;
            settings.frame_prop.camera_pixel_format = camera_format;
            settings.property_changed = false;
        }
        if let Some(shared) = &self.shared {
            let mut config = shared.config.lock().unwrap_or_else(|e| e.into_inner());
            *config = SessionConfig {
                width,
                height,
                camera_format,
            };
        }

        info!(width, height, fps, format = %camera_format, "media type negotiated");
        true
    }

    fn build_graph(&mut self, moniker: &IMoniker) -> bool {
        unsafe {
            let graph: IGraphBuilder =
                match CoCreateInstance(&CLSID_FilterGraph, None, CLSCTX_INPROC_SERVER) {
                    Ok(graph) => graph,
                    Err(_) => {
                        report_error(ErrorCode::DeviceOpenFailed, "create filter graph failed");
                        return false;
                    }
                };
            let builder: ICaptureGraphBuilder2 =
                match CoCreateInstance(&CLSID_CaptureGraphBuilder2, None, CLSCTX_INPROC_SERVER) {
                    Ok(builder) => builder,
                    Err(_) => {
                        report_error(ErrorCode::DeviceOpenFailed, "create capture builder failed");
                        return false;
                    }
                };
            if builder.SetFiltergraph(&graph).is_err() {
                report_error(ErrorCode::DeviceOpenFailed, "SetFiltergraph failed");
                return false;
            }

            let device_filter: IBaseFilter = match moniker.BindToObject(None, None) {
                Ok(filter) => filter,
                Err(_) => {
                    report_error(ErrorCode::InvalidDevice, "device bind failed");
                    return false;
                }
            };
            if graph
                .AddFilter(&device_filter, windows::core::w!("Video Capture"))
                .is_err()
            {
                report_error(ErrorCode::DeviceOpenFailed, "add capture filter failed");
                return false;
            }

            let grabber_filter: IBaseFilter =
                match CoCreateInstance(&CLSID_SampleGrabber, None, CLSCTX_INPROC_SERVER) {
                    Ok(filter) => filter,
                    Err(_) => {
                        report_error(ErrorCode::DeviceOpenFailed, "create sample grabber failed");
                        return false;
                    }
                };
            let grabber: ISampleGrabber = match grabber_filter.cast() {
                Ok(grabber) => grabber,
                Err(_) => {
                    report_error(ErrorCode::DeviceOpenFailed, "ISampleGrabber cast failed");
                    return false;
                }
            };

            self.graph = Some(graph);
            self.capture_builder = Some(builder);
            self.device_filter = Some(device_filter);
            self.grabber_filter = Some(grabber_filter);
            self.grabber = Some(grabber);
        }

        // Score and apply the media type before connecting the graph.
        if !self.configure_stream() {
            return false;
        }

        unsafe {
            let graph = self.graph.as_ref().unwrap();
            let builder = self.capture_builder.as_ref().unwrap();
            let grabber_filter = self.grabber_filter.as_ref().unwrap();
            let grabber = self.grabber.as_ref().unwrap();

            if graph
                .AddFilter(grabber_filter, windows::core::w!("Sample Grabber"))
                .is_err()
            {
                report_error(ErrorCode::DeviceOpenFailed, "add sample grabber failed");
                return false;
            }

            let null_renderer: IBaseFilter =
                match CoCreateInstance(&CLSID_NullRenderer, None, CLSCTX_INPROC_SERVER) {
                    Ok(filter) => filter,
                    Err(_) => {
                        report_error(ErrorCode::DeviceOpenFailed, "create null renderer failed");
                        return false;
                    }
                };
            if graph
                .AddFilter(&null_renderer, windows::core::w!("Null Renderer"))
                .is_err()
            {
                report_error(ErrorCode::DeviceOpenFailed, "add null renderer failed");
                return false;
            }

            if builder
                .RenderStream(
                    Some(&PIN_CATEGORY_PREVIEW),
                    Some(&MEDIATYPE_Video),
                    self.device_filter.as_ref().unwrap(),
                    grabber_filter,
                    &null_renderer,
                )
                .is_err()
            {
                report_error(ErrorCode::DeviceOpenFailed, "render stream failed");
                return false;
            }

            // Free-run the graph: no reference clock, no preview window.
            if let Ok(media_filter) = graph.cast::<IMediaFilter>() {
                let _ = media_filter.SetSyncSource(None);
            }
            if let Ok(video_window) = graph.cast::<IVideoWindow>() {
                let _ = video_window.put_AutoShow(false.into());
            }

            let shared = self.shared.as_ref().expect("shared state installed");
            let callback: ISampleGrabberCB = SampleGrabberCallback {
                shared: shared.clone(),
            }
            .into();
            let _ = grabber.SetBufferSamples(true);
            let _ = grabber.SetOneShot(false);
            if grabber.SetCallback(&callback, 0).is_err() {
                report_error(ErrorCode::DeviceOpenFailed, "SetCallback failed");
                return false;
            }

            let media_control: IMediaControl = match graph.cast() {
                Ok(control) => control,
                Err(_) => {
                    report_error(ErrorCode::DeviceOpenFailed, "IMediaControl not available");
                    return false;
                }
            };

            self.null_renderer = Some(null_renderer);
            self.media_control = Some(media_control);
        }
        true
    }

    fn teardown(&mut self) {
        self.media_control = None;
        self.null_renderer = None;
        self.grabber = None;
        self.grabber_filter = None;
        self.device_filter = None;
        self.capture_builder = None;
        self.graph = None;
        self.shared = None;
    }
}

impl PlatformBackend for DirectShowBackend {
    fn find_device_names(&mut self) -> Vec<String> {
        let mut names: Vec<String> = Self::enumerate_devices()
            .into_iter()
            .map(|(_, name)| name)
            .filter(|name| !name.is_empty())
            .collect();
        sort_virtual_cameras_last(&mut names);
        names
    }

    fn open(&mut self, device_name: &str) -> bool {
        if self.opened {
            report_error(
                ErrorCode::DeviceOpenFailed,
                "camera already opened, close it first",
            );
            return false;
        }

        let devices = Self::enumerate_devices();
        let found = devices
            .into_iter()
            .find(|(_, name)| device_name.is_empty() || name == device_name);
        let Some((moniker, name)) = found else {
            report_error(
                ErrorCode::InvalidDevice,
                &format!("no video capture device: {device_name}"),
            );
            return false;
        };
        self.device_name = name;

        self.shared = Some(Arc::new(CallbackShared {
            core: self.core.clone(),
            config: Mutex::new(SessionConfig {
                width: 0,
                height: 0,
                camera_format: PixelFormat::Unknown,
            }),
            running: AtomicBool::new(false),
            first_frame_seen: AtomicBool::new(false),
            session_start: Mutex::new(None),
            zero_time_frames: AtomicU64::new(0),
        }));

        if !self.build_graph(&moniker) {
            self.teardown();
            report_error(ErrorCode::DeviceOpenFailed, "failed to build capture graph");
            return false;
        }

        self.core.reset_frame_index();
        self.opened = true;
        self.running = false;
        info!(device = %self.device_name, "device opened");
        true
    }

    fn is_opened(&self) -> bool {
        self.opened
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        if !self.opened {
            return None;
        }
        Some(DeviceInfo {
            device_name: self.device_name.clone(),
            supported_pixel_formats: self.supported_formats.clone(),
            supported_resolutions: self.supported_resolutions.clone(),
        })
    }

    fn close(&mut self) {
        self.stop();
        self.teardown();
        self.opened = false;
        self.core.drain_available_frames();
        debug!("device closed");
    }

    fn start(&mut self) -> bool {
        if !self.opened {
            report_error(ErrorCode::DeviceStartFailed, "device not opened");
            return false;
        }
        if self.running {
            return true;
        }
        let Some(media_control) = self.media_control.as_ref() else {
            report_error(ErrorCode::DeviceStartFailed, "graph not built");
            return false;
        };
        if let Some(shared) = &self.shared {
            shared.running.store(true, Ordering::Release);
            shared.first_frame_seen.store(false, Ordering::Release);
        }
        if unsafe { media_control.Run() }.is_err() {
            report_error(ErrorCode::DeviceStartFailed, "IMediaControl::Run failed");
            return false;
        }
        self.running = true;
        self.core.mark_started();
        info!("graph running");
        true
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        if let Some(shared) = &self.shared {
            shared.running.store(false, Ordering::Release);
        }
        if let Some(media_control) = self.media_control.as_ref() {
            if unsafe { media_control.Stop() }.is_err() {
                report_error(ErrorCode::DeviceStopFailed, "IMediaControl::Stop failed");
            }
        }
        self.running = false;
        self.core.mark_stopped();
        info!("graph stopped");
    }

    fn is_started(&self) -> bool {
        self.running
    }
}

impl Drop for DirectShowBackend {
    fn drop(&mut self) {
        self.close();
        if self.com_initialized {
            unsafe { CoUninitialize() };
        }
    }
}
