//! Native camera backend on top of nokhwa.
//!
//! Device ids are nokhwa camera indices rendered as strings, so they can be
//! stored in the user config and handed back to [`CameraBackend::open`].

use image::RgbImage;
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType},
};
use tracing::{debug, warn};

use super::{CameraBackend, CameraDevice, LiveStream};
use crate::{OurError, OurResult};

/// Capture through the platform camera API
pub struct NativeBackend {
    api: ApiBackend,
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend {
    pub fn new() -> Self {
        Self {
            api: ApiBackend::Auto,
        }
    }

    fn query(&self) -> OurResult<Vec<nokhwa::utils::CameraInfo>> {
        nokhwa::query(self.api)
            .map_err(|e| OurError::Camera(format!("Failed to query cameras: {e}")))
    }
}

fn index_to_id(index: &CameraIndex) -> String {
    match index {
        CameraIndex::Index(index) => index.to_string(),
        CameraIndex::String(name) => name.clone(),
    }
}

fn id_to_index(device_id: &str) -> CameraIndex {
    device_id
        .parse::<u32>()
        .map(CameraIndex::Index)
        .unwrap_or_else(|_| CameraIndex::String(device_id.to_string()))
}

fn open_camera(index: CameraIndex, format: RequestedFormatType) -> OurResult<Camera> {
    let requested = RequestedFormat::new::<RgbFormat>(format);
    let mut camera = Camera::new(index, requested)
        .map_err(|e| OurError::Camera(format!("Failed to create camera: {e}")))?;
    camera
        .open_stream()
        .map_err(|e| OurError::Camera(format!("Failed to open camera stream: {e}")))?;
    Ok(camera)
}

impl CameraBackend for NativeBackend {
    fn request_permission(&mut self) -> OurResult<()> {
        let cameras = self.query()?;
        let Some(first) = cameras.first() else {
            debug!("No cameras to open for permission");
            return Ok(());
        };

        let mut trial = open_camera(first.index().clone(), RequestedFormatType::None)?;
        trial
            .stop_stream()
            .map_err(|e| OurError::Camera(format!("Failed to release trial stream: {e}")))?;
        Ok(())
    }

    fn enumerate(&mut self) -> OurResult<Vec<CameraDevice>> {
        Ok(self
            .query()?
            .iter()
            .map(|info| CameraDevice::new(index_to_id(info.index()), info.human_name()))
            .collect())
    }

    fn open(&mut self, device_id: &str) -> OurResult<Box<dyn LiveStream>> {
        let camera = open_camera(
            id_to_index(device_id),
            RequestedFormatType::AbsoluteHighestResolution,
        )?;
        Ok(Box::new(NativeStream {
            device_id: device_id.to_string(),
            camera,
        }))
    }
}

struct NativeStream {
    device_id: String,
    camera: Camera,
}

impl LiveStream for NativeStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn grab(&mut self) -> OurResult<RgbImage> {
        let frame = self
            .camera
            .frame()
            .map_err(|e| OurError::Camera(format!("Failed to capture frame: {e}")))?;
        let decoded = frame
            .decode_image::<RgbFormat>()
            .map_err(|e| OurError::Camera(format!("Failed to decode frame: {e}")))?;
        let (width, height) = (decoded.width(), decoded.height());
        RgbImage::from_raw(width, height, decoded.into_raw())
            .ok_or_else(|| OurError::Camera("Decoded frame has an unexpected size".to_string()))
    }

    fn stop(&mut self) -> OurResult<()> {
        if !self.camera.is_stream_open() {
            return Ok(());
        }
        self.camera
            .stop_stream()
            .map_err(|e| OurError::Camera(format!("Failed to stop camera stream: {e}")))
    }
}

impl Drop for NativeStream {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Camera {} not released cleanly: {e}", self.device_id);
        }
    }
}
