// SPDX-License-Identifier: MPL-2.0

//! Platform capture backends.
//!
//! Each backend drives one OS capture framework and feeds frames into the
//! shared provider core. Exactly one backend is compiled per platform.

#[cfg(target_os = "macos")]
mod avfoundation;
#[cfg(windows)]
mod directshow;
#[cfg(target_os = "linux")]
mod v4l2;

use std::sync::Arc;

use crate::provider::core::ProviderCore;
use crate::provider::DeviceInfo;

/// The uniform contract every platform backend implements.
///
/// State machine: Closed → (`open`) → Opened → (`start`) → Started, with
/// `stop` returning to Opened and `close` to Closed. All methods are
/// called from consumer threads; frame delivery happens on the backend's
/// own thread through `ProviderCore::new_frame_available`.
pub(crate) trait PlatformBackend: Send {
    fn find_device_names(&mut self) -> Vec<String>;
    fn open(&mut self, device_name: &str) -> bool;
    fn is_opened(&self) -> bool;
    fn device_info(&self) -> Option<DeviceInfo>;
    fn close(&mut self);
    fn start(&mut self) -> bool;
    fn stop(&mut self);
    fn is_started(&self) -> bool;
}

pub(crate) fn create_platform_backend(core: Arc<ProviderCore>) -> Box<dyn PlatformBackend> {
    #[cfg(target_os = "linux")]
    {
        return Box::new(v4l2::V4l2Backend::new(core));
    }
    #[cfg(target_os = "macos")]
    {
        return Box::new(avfoundation::AvFoundationBackend::new(core));
    }
    #[cfg(windows)]
    {
        return Box::new(directshow::DirectShowBackend::new(core));
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = core;
        tracing::warn!("no capture backend for this platform");
        Box::new(UnsupportedBackend)
    }
}

/// Placeholder backend for platforms without a capture implementation;
/// every operation fails gracefully.
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
struct UnsupportedBackend;

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
impl PlatformBackend for UnsupportedBackend {
    fn find_device_names(&mut self) -> Vec<String> {
        Vec::new()
    }
    fn open(&mut self, _device_name: &str) -> bool {
        crate::errors::report_error(
            crate::errors::ErrorCode::InitializationFailed,
            "camera capture is not supported on this platform",
        );
        false
    }
    fn is_opened(&self) -> bool {
        false
    }
    fn device_info(&self) -> Option<DeviceInfo> {
        None
    }
    fn close(&mut self) {}
    fn start(&mut self) -> bool {
        false
    }
    fn stop(&mut self) {}
    fn is_started(&self) -> bool {
        false
    }
}
