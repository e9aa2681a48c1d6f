//! In-memory camera backend used by the unit tests.

use image::RgbImage;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CameraBackend, CameraDevice, LiveStream};
use crate::{OurError, OurResult};

/// Acquisition counters shared between a backend and its streams
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeCounters {
    pub opens: Arc<AtomicUsize>,
    pub active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
}

impl FakeCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) struct FakeBackend {
    devices: Vec<CameraDevice>,
    counters: FakeCounters,
    deny_permission: bool,
    fail_open: bool,
}

impl FakeBackend {
    pub fn new(devices: Vec<CameraDevice>, counters: FakeCounters) -> Self {
        Self {
            devices,
            counters,
            deny_permission: false,
            fail_open: false,
        }
    }

    pub fn with_default_devices(counters: FakeCounters) -> Self {
        Self::new(
            vec![
                CameraDevice::new("0", "Integrated Webcam"),
                CameraDevice::new("1", "USB2.0 Microsope 04F2"),
            ],
            counters,
        )
    }

    pub fn deny_permission(mut self) -> Self {
        self.deny_permission = true;
        self
    }

    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

impl CameraBackend for FakeBackend {
    fn request_permission(&mut self) -> OurResult<()> {
        if self.deny_permission {
            return Err(OurError::Camera("Permission denied".to_string()));
        }
        Ok(())
    }

    fn enumerate(&mut self) -> OurResult<Vec<CameraDevice>> {
        Ok(self.devices.clone())
    }

    fn open(&mut self, device_id: &str) -> OurResult<Box<dyn LiveStream>> {
        if self.fail_open {
            return Err(OurError::Camera("Device busy".to_string()));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            device_id: device_id.to_string(),
            counters: self.counters.clone(),
            open: true,
        }))
    }
}

struct FakeStream {
    device_id: String,
    counters: FakeCounters,
    open: bool,
}

impl LiveStream for FakeStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn grab(&mut self) -> OurResult<RgbImage> {
        Ok(RgbImage::from_pixel(16, 12, image::Rgb([90, 20, 20])))
    }

    fn stop(&mut self) -> OurResult<()> {
        if self.open {
            self.open = false;
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
