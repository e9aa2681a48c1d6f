//! Camera manager running on its own thread.
//!
//! Native capture APIs block and their stream handles are not `Send`, so the
//! manager owns the backend on a dedicated OS thread and is driven through a
//! cloneable async [`CameraHandle`]. When the last handle is dropped the
//! request loop ends and the active stream is released.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{CameraBackend, CameraDevice, CapturedFrame, DeviceMatcher, LiveStream, choose_device};
use crate::{OurError, OurResult};

/// Snapshot of the manager state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CameraStatus {
    pub devices: Vec<CameraDevice>,
    pub selected: Option<String>,
    /// Device the live stream was acquired from, if streaming
    pub active: Option<String>,
    pub permission_granted: bool,
}

impl CameraStatus {
    pub fn streaming(&self) -> bool {
        self.active.is_some()
    }
}

/// Result of an enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub devices: Vec<CameraDevice>,
    pub selected: Option<String>,
    /// Present when the selection was made by the microscope matcher
    pub microscope: Option<CameraDevice>,
}

#[derive(Debug)]
enum CameraRequest {
    RequestPermission {
        respond_to: oneshot::Sender<OurResult<()>>,
    },
    Enumerate {
        respond_to: oneshot::Sender<OurResult<Discovery>>,
    },
    Select {
        device_id: String,
        respond_to: oneshot::Sender<OurResult<()>>,
    },
    Start {
        device_id: Option<String>,
        respond_to: oneshot::Sender<OurResult<String>>,
    },
    Stop {
        respond_to: oneshot::Sender<OurResult<bool>>,
    },
    Capture {
        respond_to: oneshot::Sender<OurResult<CapturedFrame>>,
    },
    GetStatus {
        respond_to: oneshot::Sender<CameraStatus>,
    },
}

/// Handle for communicating with the camera manager
#[derive(Clone)]
pub struct CameraHandle {
    request_sender: mpsc::UnboundedSender<CameraRequest>,
}

impl CameraHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CameraRequest,
    ) -> OurResult<T> {
        let (sender, receiver) = oneshot::channel();
        self.request_sender
            .send(build(sender))
            .map_err(|_| OurError::Camera("camera manager stopped".to_string()))?;
        receiver
            .await
            .map_err(|_| OurError::Camera("camera manager response failed".to_string()))
    }

    /// Ask for camera access, releasing the trial stream right away
    pub async fn request_permission(&self) -> OurResult<()> {
        self.call(|respond_to| CameraRequest::RequestPermission { respond_to })
            .await?
    }

    /// List devices and apply the auto-selection policy
    pub async fn enumerate(&self) -> OurResult<Discovery> {
        self.call(|respond_to| CameraRequest::Enumerate { respond_to })
            .await?
    }

    /// Select an enumerated device
    pub async fn select(&self, device_id: String) -> OurResult<()> {
        self.call(|respond_to| CameraRequest::Select {
            device_id,
            respond_to,
        })
        .await?
    }

    /// Start streaming from `device_id`, or from the selected device.
    /// Returns the id of the device now streaming.
    pub async fn start(&self, device_id: Option<String>) -> OurResult<String> {
        self.call(|respond_to| CameraRequest::Start {
            device_id,
            respond_to,
        })
        .await?
    }

    /// Stop the live stream; `Ok(false)` when nothing was streaming
    pub async fn stop(&self) -> OurResult<bool> {
        self.call(|respond_to| CameraRequest::Stop { respond_to })
            .await?
    }

    /// Encode the current frame of the live stream
    pub async fn capture(&self) -> OurResult<CapturedFrame> {
        self.call(|respond_to| CameraRequest::Capture { respond_to })
            .await?
    }

    pub async fn status(&self) -> OurResult<CameraStatus> {
        self.call(|respond_to| CameraRequest::GetStatus { respond_to })
            .await
    }
}

/// Camera manager implementation
pub struct CameraManager {
    backend: Box<dyn CameraBackend>,
    matcher: DeviceMatcher,
    jpeg_quality: u8,
    status: CameraStatus,
    stream: Option<Box<dyn LiveStream>>,
    request_receiver: mpsc::UnboundedReceiver<CameraRequest>,
}

impl CameraManager {
    /// Start the manager thread and return its handle
    pub fn spawn(
        backend: Box<dyn CameraBackend>,
        matcher: DeviceMatcher,
        jpeg_quality: u8,
    ) -> OurResult<CameraHandle> {
        let (request_sender, request_receiver) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("camera-manager".to_string())
            .spawn(move || {
                let manager = CameraManager {
                    backend,
                    matcher,
                    jpeg_quality,
                    status: CameraStatus::default(),
                    stream: None,
                    request_receiver,
                };
                manager.run();
            })?;

        Ok(CameraHandle { request_sender })
    }

    fn run(mut self) {
        info!("Starting camera manager");

        while let Some(request) = self.request_receiver.blocking_recv() {
            match request {
                CameraRequest::RequestPermission { respond_to } => {
                    let result = self.request_permission();
                    if respond_to.send(result).is_err() {
                        debug!("Failed to send permission response");
                    }
                }
                CameraRequest::Enumerate { respond_to } => {
                    let result = self.enumerate();
                    if respond_to.send(result).is_err() {
                        debug!("Failed to send enumeration response");
                    }
                }
                CameraRequest::Select {
                    device_id,
                    respond_to,
                } => {
                    let result = self.select(device_id);
                    if respond_to.send(result).is_err() {
                        debug!("Failed to send selection response");
                    }
                }
                CameraRequest::Start {
                    device_id,
                    respond_to,
                } => {
                    let result = self.start(device_id);
                    if respond_to.send(result).is_err() {
                        debug!("Failed to send stream start response");
                    }
                }
                CameraRequest::Stop { respond_to } => {
                    let result = self.stop();
                    if respond_to.send(result).is_err() {
                        debug!("Failed to send stream stop response");
                    }
                }
                CameraRequest::Capture { respond_to } => {
                    let result = self.capture();
                    if respond_to.send(result).is_err() {
                        debug!("Failed to send capture response");
                    }
                }
                CameraRequest::GetStatus { respond_to } => {
                    if respond_to.send(self.status.clone()).is_err() {
                        debug!("Failed to send status response");
                    }
                }
            }
        }

        info!("Camera manager shutting down");
    }

    fn request_permission(&mut self) -> OurResult<()> {
        self.backend.request_permission().inspect_err(|e| {
            warn!("Camera permission denied: {e}");
        })?;
        self.status.permission_granted = true;
        info!("Camera permission granted");
        Ok(())
    }

    fn enumerate(&mut self) -> OurResult<Discovery> {
        let devices = self.backend.enumerate()?;
        let selection = choose_device(&devices, &self.matcher, self.status.selected.as_deref());

        if let Some(microscope) = &selection.microscope {
            info!("Auto-selected microscope '{}'", microscope.label);
        }
        info!("Enumerated {} video input devices", devices.len());

        self.status.devices = devices.clone();
        self.status.selected = selection.device_id.clone();

        Ok(Discovery {
            devices,
            selected: selection.device_id,
            microscope: selection.microscope,
        })
    }

    fn select(&mut self, device_id: String) -> OurResult<()> {
        if !self.status.devices.iter().any(|device| device.id == device_id) {
            return Err(OurError::Camera(format!("Camera not found: {device_id}")));
        }
        info!("Selected camera {device_id}");
        self.status.selected = Some(device_id);
        Ok(())
    }

    fn start(&mut self, device_id: Option<String>) -> OurResult<String> {
        let device_id = device_id
            .or_else(|| self.status.selected.clone())
            .ok_or_else(|| OurError::Camera("No camera selected".to_string()))?;

        // The device stays locked until the previous stream is gone
        self.release_stream();

        let stream = self.backend.open(&device_id).inspect_err(|e| {
            warn!("Failed to open camera {device_id}: {e}");
        })?;
        self.stream = Some(stream);
        self.status.active = Some(device_id.clone());
        info!("Streaming from camera {device_id}");
        Ok(device_id)
    }

    fn stop(&mut self) -> OurResult<bool> {
        Ok(self.release_stream())
    }

    fn capture(&mut self) -> OurResult<CapturedFrame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| OurError::Camera("Camera is not streaming".to_string()))?;
        let image = stream.grab()?;
        let frame = CapturedFrame::encode(&image, self.jpeg_quality)?;
        debug!(
            "Captured {}x{} frame ({} bytes) from camera {}",
            frame.width,
            frame.height,
            frame.jpeg.len(),
            stream.device_id()
        );
        Ok(frame)
    }

    /// Stop and drop the live stream; false when there was none
    fn release_stream(&mut self) -> bool {
        let Some(mut stream) = self.stream.take() else {
            return false;
        };
        if let Err(e) = stream.stop() {
            error!("Failed to stop camera {}: {e}", stream.device_id());
        }
        info!("Released camera {}", stream.device_id());
        self.status.active = None;
        true
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.release_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::fake::{FakeBackend, FakeCounters};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn spawn_fake(backend: FakeBackend) -> CameraHandle {
        CameraManager::spawn(
            Box::new(backend),
            DeviceMatcher::from_labels(crate::config::DEFAULT_MICROSCOPE_LABELS),
            95,
        )
        .expect("Failed to spawn camera manager")
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let handle = spawn_fake(FakeBackend::with_default_devices(FakeCounters::new()));
        let before = handle.status().await.expect("status");
        assert!(!handle.stop().await.expect("stop"));
        assert!(!handle.stop().await.expect("stop"));
        assert_eq!(handle.status().await.expect("status"), before);
    }

    #[tokio::test]
    async fn test_restart_releases_previous_stream() {
        let counters = FakeCounters::new();
        let handle = spawn_fake(FakeBackend::with_default_devices(counters.clone()));
        handle.enumerate().await.expect("enumerate");

        handle.start(None).await.expect("first start");
        handle.start(Some("0".to_string())).await.expect("second start");
        handle.start(None).await.expect("third start");

        assert_eq!(counters.opens.load(Ordering::SeqCst), 3);
        assert_eq!(counters.active.load(Ordering::SeqCst), 1);
        assert_eq!(counters.max_active.load(Ordering::SeqCst), 1);

        let status = handle.status().await.expect("status");
        assert_eq!(status.active.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_start_requires_selection() {
        let handle = spawn_fake(FakeBackend::new(vec![], FakeCounters::new()));
        handle.enumerate().await.expect("enumerate");
        assert!(matches!(
            handle.start(None).await,
            Err(OurError::Camera(_))
        ));
    }

    #[tokio::test]
    async fn test_capture_requires_stream() {
        let handle = spawn_fake(FakeBackend::with_default_devices(FakeCounters::new()));
        assert!(handle.capture().await.is_err());

        handle.enumerate().await.expect("enumerate");
        handle.start(None).await.expect("start");
        let frame = handle.capture().await.expect("capture");
        assert_eq!((frame.width, frame.height), (16, 12));
    }

    #[tokio::test]
    async fn test_failures_leave_state_unchanged() {
        let counters = FakeCounters::new();
        let backend = FakeBackend::with_default_devices(counters.clone()).deny_permission();
        let handle = spawn_fake(backend);
        handle.enumerate().await.expect("enumerate");
        let before = handle.status().await.expect("status");

        assert!(handle.request_permission().await.is_err());
        assert!(handle.select("missing".to_string()).await.is_err());
        assert_eq!(handle.status().await.expect("status"), before);
    }

    #[tokio::test]
    async fn test_dropping_handles_releases_camera() {
        let counters = FakeCounters::new();
        let handle = spawn_fake(FakeBackend::with_default_devices(counters.clone()));
        handle.enumerate().await.expect("enumerate");
        handle.start(None).await.expect("start");
        assert_eq!(counters.active.load(Ordering::SeqCst), 1);

        drop(handle);
        let released = Arc::clone(&counters.active);
        tokio::time::timeout(std::time::Duration::from_secs(2), async move {
            while released.load(Ordering::SeqCst) != 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("camera was not released");
    }
}
