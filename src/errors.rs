// SPDX-License-Identifier: MPL-2.0

//! Error taxonomy and the process-wide error callback.
//!
//! The library never panics across the provider boundary and never returns
//! rich error values from the capture API: failures surface as `false` /
//! `None` / NaN at the call site, while the detail (code + human-readable
//! text) is delivered synchronously to a single process-wide callback.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::error;

/// Error codes reported through the global error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    None,
    NoDeviceFound,
    InvalidDevice,
    DeviceOpenFailed,
    DeviceStartFailed,
    DeviceStopFailed,
    InitializationFailed,
    UnsupportedResolution,
    UnsupportedPixelFormat,
    FrameRateSetFailed,
    PropertySetFailed,
    FrameCaptureTimeout,
    FrameCaptureFailed,
    MemoryAllocationFailed,
    InternalError,
}

impl ErrorCode {
    /// A short human-readable description of the error class.
    pub const fn description(self) -> &'static str {
        match self {
            ErrorCode::None => "No error",
            ErrorCode::NoDeviceFound => "No camera device found or device discovery failed",
            ErrorCode::InvalidDevice => "Invalid device name or device index",
            ErrorCode::DeviceOpenFailed => "Camera device open failed",
            ErrorCode::DeviceStartFailed => "Camera start failed",
            ErrorCode::DeviceStopFailed => "Camera stop failed",
            ErrorCode::InitializationFailed => "Initialization failed",
            ErrorCode::UnsupportedResolution => "Requested resolution is not supported",
            ErrorCode::UnsupportedPixelFormat => "Requested pixel format is not supported",
            ErrorCode::FrameRateSetFailed => "Frame rate setting failed",
            ErrorCode::PropertySetFailed => "Property setting failed",
            ErrorCode::FrameCaptureTimeout => "Frame capture timeout",
            ErrorCode::FrameCaptureFailed => "Frame capture failed",
            ErrorCode::MemoryAllocationFailed => "Memory allocation failed",
            ErrorCode::InternalError => "Unknown or internal error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Callback invoked for every detected failure.
///
/// Runs on whichever thread detected the error; the handler is responsible
/// for its own thread safety.
pub type ErrorCallback = dyn Fn(ErrorCode, &str) + Send + Sync;

static ERROR_CALLBACK: Mutex<Option<Arc<ErrorCallback>>> = Mutex::new(None);

/// Installs the process-wide error callback, replacing any previous one.
pub fn set_error_callback<F>(callback: F)
where
    F: Fn(ErrorCode, &str) + Send + Sync + 'static,
{
    let mut slot = ERROR_CALLBACK.lock().unwrap_or_else(|e| e.into_inner());
    *slot = Some(Arc::new(callback));
}

/// Removes the process-wide error callback.
pub fn clear_error_callback() {
    let mut slot = ERROR_CALLBACK.lock().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}

/// Reports a failure: logs it and invokes the global callback if installed.
///
/// Set/clear/invoke are serialized by the callback mutex, so an unregister
/// racing an in-flight invocation is safe.
pub(crate) fn report_error(code: ErrorCode, detail: &str) {
    error!(code = ?code, detail, "capture error");
    let slot = ERROR_CALLBACK.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(callback) = slot.as_ref() {
        callback(code, detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callback_receives_code_and_text() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        set_error_callback(|code, detail| {
            assert_eq!(code, ErrorCode::DeviceOpenFailed);
            assert!(detail.contains("unit test"));
            CALLS.fetch_add(1, Ordering::SeqCst);
        });
        report_error(ErrorCode::DeviceOpenFailed, "unit test failure");
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        clear_error_callback();
        report_error(ErrorCode::DeviceOpenFailed, "unit test failure");
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn descriptions_are_stable() {
        assert_eq!(ErrorCode::None.description(), "No error");
        assert_eq!(
            ErrorCode::MemoryAllocationFailed.description(),
            "Memory allocation failed"
        );
    }
}
