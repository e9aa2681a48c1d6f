//! Capture session state.
//!
//! [`CaptureSession`] merges control-channel notifications, camera results
//! and user commands into the state a front end renders: connection status,
//! camera list and streaming flag, the device photo inventory, the set of
//! photos picked for an examination, an event log and user notices.
//!
//! Nothing in here returns an error to the caller. Every failure becomes a
//! [`Notice`] or a log line and leaves the previous state in place.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::api::ExaminationApi;
use crate::camera::{CameraDevice, CameraHandle};
use crate::channel::{ChannelNotification, ChannelStatus, CommandSink};
use crate::protocol::{DeviceCommand, DeviceEvent, Photo};
use crate::OurError;

const DEVICE_ERROR_FALLBACK: &str = "Device error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// A message meant for the user, as opposed to a log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Render-ready copy of the session state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub channel: ChannelStatus,
    pub cameras: Vec<CameraDevice>,
    pub selected_camera: Option<String>,
    pub streaming: bool,
    pub photos: Vec<Photo>,
    pub selection: Vec<String>,
    /// Newest entry first
    pub log: Vec<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            channel: ChannelStatus::Disconnected,
            cameras: Vec::new(),
            selected_camera: None,
            streaming: false,
            photos: Vec::new(),
            selection: Vec::new(),
            log: Vec::new(),
        }
    }
}

pub struct CaptureSession<S: CommandSink> {
    sink: S,
    camera: CameraHandle,
    channel: ChannelStatus,
    cameras: Vec<CameraDevice>,
    selected_camera: Option<String>,
    streaming: bool,
    photos: Vec<Photo>,
    selection: Vec<String>,
    log: VecDeque<String>,
    log_capacity: usize,
    notices: Vec<Notice>,
}

impl<S: CommandSink> CaptureSession<S> {
    pub fn new(sink: S, camera: CameraHandle, log_capacity: usize) -> Self {
        Self {
            sink,
            camera,
            channel: ChannelStatus::Connecting,
            cameras: Vec::new(),
            selected_camera: None,
            streaming: false,
            photos: Vec::new(),
            selection: Vec::new(),
            log: VecDeque::new(),
            log_capacity: log_capacity.max(1),
            notices: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            channel: self.channel,
            cameras: self.cameras.clone(),
            selected_camera: self.selected_camera.clone(),
            streaming: self.streaming,
            photos: self.photos.clone(),
            selection: self.selection.clone(),
            log: self.log.iter().cloned().collect(),
        }
    }

    pub fn photos(&self) -> &[Photo] {
        &self.photos
    }

    pub fn selection(&self) -> &[String] {
        &self.selection
    }

    /// Notices raised since the last call
    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn push_log(&mut self, entry: impl Into<String>) {
        self.log.push_front(entry.into());
        self.log.truncate(self.log_capacity);
    }

    fn notify(&mut self, level: NoticeLevel, message: impl Into<String>) {
        let notice = Notice::new(level, message);
        debug!("Notice ({:?}): {}", notice.level, notice.message);
        self.notices.push(notice);
    }

    /// Send a device command, warning the user when the channel is down
    fn send_command(&mut self, command: DeviceCommand) -> bool {
        match self.sink.send_command(command) {
            Ok(()) => true,
            Err(OurError::NotConnected) => {
                self.notify(NoticeLevel::Warning, "No connection to the device");
                false
            }
            Err(e) => {
                warn!("Failed to send device command: {e}");
                self.notify(NoticeLevel::Warning, e.to_string());
                false
            }
        }
    }

    pub fn handle_notification(&mut self, notification: ChannelNotification) {
        match notification {
            ChannelNotification::Opened => {
                self.channel = ChannelStatus::Connected;
                self.push_log("Connected to device");
            }
            ChannelNotification::Closed => {
                self.channel = ChannelStatus::Disconnected;
                self.push_log("Connection closed");
            }
            ChannelNotification::Reconnecting { attempt, delay } => {
                self.channel = ChannelStatus::Reconnecting { attempt };
                self.push_log(format!(
                    "Reconnecting to device (attempt {attempt}, in {} ms)",
                    delay.as_millis()
                ));
            }
            ChannelNotification::TransportError(error) => {
                warn!("Device connection error: {error}");
                self.push_log("Device connection error");
            }
            ChannelNotification::Malformed { error } => {
                debug!("Malformed device message: {error}");
                self.push_log("Could not process device message");
            }
            ChannelNotification::Undelivered { kind } => {
                self.push_log(format!("Command {kind} not delivered"));
                self.notify(
                    NoticeLevel::Warning,
                    format!("Connection lost before {kind} reached the device"),
                );
            }
            ChannelNotification::Event(event) => self.apply_event(event),
        }
    }

    /// The channel task has stopped for good; no more notifications follow
    pub fn channel_ended(&mut self) {
        if self.channel != ChannelStatus::Disconnected {
            self.channel = ChannelStatus::Disconnected;
            self.push_log("Device channel stopped");
        }
    }

    pub fn apply_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::PhotoList(photos) => {
                self.photos = photos;
                self.prune_selection();
                self.push_log("Received photo list");
            }
            DeviceEvent::NewPhoto(photo) => {
                self.photos.insert(0, photo);
                self.push_log("New photo added");
            }
            DeviceEvent::PhotoSaved(saved) => {
                if let Some(saved) = saved {
                    info!("Device stored photo {}", saved.filename);
                }
                self.push_log("Photo saved");
                self.send_command(DeviceCommand::GetPhotos);
            }
            DeviceEvent::PhotoDeleted(filename) => {
                self.photos.retain(|photo| photo.filename != filename);
                self.selection.retain(|selected| *selected != filename);
                self.push_log(format!("Photo deleted: {filename}"));
            }
            DeviceEvent::StreamStarted => self.push_log("Stream started"),
            DeviceEvent::StreamStopped => self.push_log("Stream stopped"),
            DeviceEvent::Error { message } => {
                let message = message.unwrap_or_else(|| DEVICE_ERROR_FALLBACK.to_string());
                self.push_log(message.clone());
                self.notify(NoticeLevel::Error, message);
            }
            DeviceEvent::Unknown { kind, .. } => {
                debug!("Ignoring device event {kind}");
                self.push_log(format!("Event: {kind}"));
            }
        }
    }

    /// Drop selected filenames that are no longer in the inventory
    fn prune_selection(&mut self) {
        let photos = &self.photos;
        let before = self.selection.len();
        self.selection
            .retain(|selected| photos.iter().any(|photo| photo.filename == *selected));
        if self.selection.len() != before {
            debug!("Pruned {} stale selections", before - self.selection.len());
        }
    }

    pub fn refresh_photos(&mut self) {
        self.send_command(DeviceCommand::GetPhotos);
    }

    pub fn start_device_stream(&mut self) {
        self.send_command(DeviceCommand::StartStream);
    }

    pub fn stop_device_stream(&mut self) {
        self.send_command(DeviceCommand::StopStream);
    }

    pub fn delete_photo(&mut self, filename: &str) {
        self.send_command(DeviceCommand::DeletePhoto {
            filename: filename.to_string(),
        });
    }

    /// Toggle a photo in the selection set. Unknown filenames are ignored.
    /// Returns whether the photo is selected afterwards.
    pub fn toggle_selection(&mut self, filename: &str) -> bool {
        if let Some(position) = self.selection.iter().position(|selected| selected == filename) {
            self.selection.remove(position);
            return false;
        }
        if !self.photos.iter().any(|photo| photo.filename == filename) {
            debug!("Not selecting unknown photo {filename}");
            return false;
        }
        self.selection.push(filename.to_string());
        true
    }

    /// Ask for camera access, enumerate devices and pre-select one.
    /// `preferred` is used when no microscope is recognised.
    pub async fn discover_cameras(&mut self, preferred: Option<&str>) {
        if let Err(e) = self.camera.request_permission().await {
            self.notify(NoticeLevel::Error, format!("Camera access denied: {e}"));
            return;
        }

        let discovery = match self.camera.enumerate().await {
            Ok(discovery) => discovery,
            Err(e) => {
                self.notify(NoticeLevel::Error, format!("Failed to list cameras: {e}"));
                return;
            }
        };

        self.cameras = discovery.devices;
        self.selected_camera = discovery.selected;

        if let Some(microscope) = discovery.microscope {
            self.notify(
                NoticeLevel::Success,
                format!("Microscope detected: {}", microscope.label),
            );
        } else if let Some(preferred) = preferred {
            if self.cameras.iter().any(|device| device.id == preferred) {
                self.select_camera(preferred).await;
            }
        }

        self.push_log(format!("Found {} camera(s)", self.cameras.len()));
    }

    pub async fn select_camera(&mut self, device_id: &str) {
        match self.camera.select(device_id.to_string()).await {
            Ok(()) => self.selected_camera = Some(device_id.to_string()),
            Err(e) => self.notify(NoticeLevel::Error, e.to_string()),
        }
    }

    pub async fn start_camera(&mut self) {
        match self.camera.start(None).await {
            Ok(device_id) => {
                self.streaming = true;
                self.push_log(format!("Camera {device_id} streaming"));
            }
            Err(e) => {
                self.notify(NoticeLevel::Error, format!("Could not start camera: {e}"));
                // a previous stream may already have been released
                if let Ok(status) = self.camera.status().await {
                    self.streaming = status.streaming();
                }
            }
        }
    }

    pub async fn stop_camera(&mut self) {
        match self.camera.stop().await {
            Ok(true) => {
                self.streaming = false;
                self.push_log("Camera stopped");
            }
            Ok(false) => {}
            Err(e) => self.notify(NoticeLevel::Error, format!("Could not stop camera: {e}")),
        }
    }

    /// Capture a still and hand it to the device for storage. The inventory
    /// is only updated once the device reports the saved photo.
    pub async fn take_photo(&mut self) {
        if !self.streaming {
            self.notify(NoticeLevel::Warning, "Start the camera first");
            return;
        }

        let frame = match self.camera.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                self.notify(NoticeLevel::Error, format!("Could not capture photo: {e}"));
                return;
            }
        };

        if self.send_command(DeviceCommand::SavePhoto {
            image: frame.to_data_url(),
        }) {
            self.push_log(format!("Photo {}x{} sent to device", frame.width, frame.height));
        }
    }

    /// Attach the selected photos to an examination, then start its
    /// analysis. Returns true when both calls succeeded.
    pub async fn attach_selected<A>(&mut self, api: &A, examination_id: &str) -> bool
    where
        A: ExaminationApi + ?Sized,
    {
        let filenames = self.selection.clone();
        self.attach_and_analyze(api, examination_id, &filenames).await
    }

    /// Two sequential calls without compensation: if the analysis call fails
    /// the photos stay attached and the selection is kept for a retry.
    pub async fn attach_and_analyze<A>(
        &mut self,
        api: &A,
        examination_id: &str,
        filenames: &[String],
    ) -> bool
    where
        A: ExaminationApi + ?Sized,
    {
        if filenames.is_empty() || examination_id.trim().is_empty() {
            debug!("Nothing to hand off");
            return false;
        }

        let result = match api.attach_photos(examination_id, filenames).await {
            Ok(()) => api.start_analysis(examination_id).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(
                    "Attached {} photos to examination {examination_id}, analysis started",
                    filenames.len()
                );
                self.selection.clear();
                self.notify(
                    NoticeLevel::Success,
                    "Analysis started. Results will appear in the report when processing finishes",
                );
                true
            }
            Err(e) => {
                warn!("Hand-off for examination {examination_id} failed: {e}");
                self.notify(NoticeLevel::Error, e.to_string());
                false
            }
        }
    }

    /// Release the camera and close the channel
    pub async fn teardown(&mut self) {
        match self.camera.stop().await {
            Ok(true) => info!("Camera released on teardown"),
            Ok(false) => {}
            Err(e) => warn!("Camera release on teardown failed: {e}"),
        }
        self.streaming = false;
        self.sink.close();
        self.channel = ChannelStatus::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::fake::{FakeBackend, FakeCounters};
    use crate::camera::{DeviceMatcher, manager::CameraManager};
    use crate::{OurError, OurResult};
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<DeviceCommand>>>,
        disconnected: bool,
        closed: Arc<Mutex<bool>>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<DeviceCommand> {
            self.sent.lock().expect("lock").clone()
        }
    }

    impl CommandSink for RecordingSink {
        fn send_command(&self, command: DeviceCommand) -> OurResult<()> {
            if self.disconnected {
                return Err(OurError::NotConnected);
            }
            self.sent.lock().expect("lock").push(command);
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock().expect("lock") = true;
        }
    }

    #[derive(Default)]
    struct RecordingApi {
        calls: Mutex<Vec<String>>,
        attached: Mutex<Vec<(String, Vec<String>)>>,
        fail_attach: bool,
        fail_analysis: bool,
    }

    #[async_trait]
    impl ExaminationApi for RecordingApi {
        async fn attach_photos(&self, examination_id: &str, filenames: &[String]) -> OurResult<()> {
            self.calls.lock().expect("lock").push(format!("attach:{examination_id}"));
            self.attached
                .lock()
                .expect("lock")
                .push((examination_id.to_string(), filenames.to_vec()));
            if self.fail_attach {
                return Err(OurError::Api {
                    status: 500,
                    message: "storage unavailable".to_string(),
                });
            }
            Ok(())
        }

        async fn start_analysis(&self, examination_id: &str) -> OurResult<()> {
            self.calls.lock().expect("lock").push(format!("analyze:{examination_id}"));
            if self.fail_analysis {
                return Err(OurError::Api {
                    status: 500,
                    message: "queue unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    fn photo(name: &str) -> Photo {
        Photo {
            filename: name.to_string(),
            path: format!("/photos/{name}"),
            timestamp: None,
            size: None,
        }
    }

    fn session_with(sink: RecordingSink, backend: FakeBackend) -> CaptureSession<RecordingSink> {
        let camera = CameraManager::spawn(
            Box::new(backend),
            DeviceMatcher::from_labels(crate::config::DEFAULT_MICROSCOPE_LABELS),
            95,
        )
        .expect("Failed to spawn camera manager");
        CaptureSession::new(sink, camera, 25)
    }

    fn session(sink: RecordingSink) -> CaptureSession<RecordingSink> {
        session_with(sink, FakeBackend::with_default_devices(FakeCounters::new()))
    }

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn test_photo_list_replaces_inventory() {
        let mut session = session(RecordingSink::default());
        session.apply_event(DeviceEvent::PhotoList(vec![photo("a.jpg"), photo("b.jpg")]));
        session.apply_event(DeviceEvent::PhotoList(vec![photo("c.jpg")]));
        assert_eq!(session.photos(), &[photo("c.jpg")]);

        session.apply_event(DeviceEvent::PhotoList(vec![]));
        assert!(session.photos().is_empty());
    }

    #[tokio::test]
    async fn test_new_photo_is_prepended() {
        let mut session = session(RecordingSink::default());
        session.apply_event(DeviceEvent::PhotoList(vec![photo("a.jpg"), photo("b.jpg")]));
        session.apply_event(DeviceEvent::NewPhoto(photo("new.jpg")));
        assert_eq!(session.photos().len(), 3);
        assert_eq!(session.photos()[0].filename, "new.jpg");
    }

    #[tokio::test]
    async fn test_photo_saved_requests_inventory() {
        let sink = RecordingSink::default();
        let mut session = session(sink.clone());
        session.apply_event(DeviceEvent::PhotoSaved(None));
        assert_eq!(sink.sent(), vec![DeviceCommand::GetPhotos]);
        assert!(session.photos().is_empty());
    }

    #[tokio::test]
    async fn test_device_error_is_shown_verbatim() {
        let mut session = session(RecordingSink::default());
        session.handle_notification(ChannelNotification::Event(DeviceEvent::Error {
            message: Some("device busy".to_string()),
        }));
        let notices = session.take_notices();
        assert_eq!(notices, vec![Notice::new(NoticeLevel::Error, "device busy")]);

        session.apply_event(DeviceEvent::Error { message: None });
        assert_eq!(session.take_notices()[0].message, DEVICE_ERROR_FALLBACK);
    }

    #[tokio::test]
    async fn test_malformed_message_is_logged() {
        let mut session = session(RecordingSink::default());
        let error = DeviceEvent::decode("{oops").expect_err("must fail").to_string();
        session.handle_notification(ChannelNotification::Malformed { error });
        let snapshot = session.snapshot();
        assert_eq!(snapshot.log, vec!["Could not process device message".to_string()]);
        assert!(session.take_notices().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_event_only_logs() {
        let mut session = session(RecordingSink::default());
        session.apply_event(DeviceEvent::PhotoList(vec![photo("a.jpg")]));
        let before = session.snapshot();
        session.apply_event(DeviceEvent::Unknown {
            kind: "control_change".to_string(),
            data: serde_json::Value::Null,
        });
        let after = session.snapshot();
        assert_eq!(after.photos, before.photos);
        assert_eq!(after.log[0], "Event: control_change");
    }

    #[tokio::test]
    async fn test_log_is_bounded() {
        let mut session = session(RecordingSink::default());
        for _ in 0..40 {
            session.apply_event(DeviceEvent::StreamStarted);
        }
        assert_eq!(session.snapshot().log.len(), 25);
    }

    #[tokio::test]
    async fn test_channel_status_follows_lifecycle() {
        let mut session = session(RecordingSink::default());
        session.handle_notification(ChannelNotification::Opened);
        assert_eq!(session.snapshot().channel, ChannelStatus::Connected);
        session.handle_notification(ChannelNotification::Closed);
        assert_eq!(session.snapshot().channel, ChannelStatus::Disconnected);
        session.handle_notification(ChannelNotification::Reconnecting {
            attempt: 2,
            delay: std::time::Duration::from_millis(200),
        });
        assert_eq!(
            session.snapshot().channel,
            ChannelStatus::Reconnecting { attempt: 2 }
        );
    }

    #[tokio::test]
    async fn test_channel_end_marks_disconnected() {
        let mut session = session(RecordingSink::default());
        session.handle_notification(ChannelNotification::Reconnecting {
            attempt: 2,
            delay: std::time::Duration::from_millis(200),
        });
        session.channel_ended();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.channel, ChannelStatus::Disconnected);
        assert_eq!(snapshot.log[0], "Device channel stopped");

        session.channel_ended();
        assert_eq!(session.snapshot().log.len(), snapshot.log.len());
    }

    #[tokio::test]
    async fn test_undelivered_command_warns() {
        let mut session = session(RecordingSink::default());
        session.handle_notification(ChannelNotification::Undelivered {
            kind: "save_photo".to_string(),
        });
        let notices = session.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Warning);
        assert!(notices[0].message.contains("save_photo"));
    }

    #[tokio::test]
    async fn test_commands_warn_when_disconnected() {
        let sink = RecordingSink {
            disconnected: true,
            ..Default::default()
        };
        let mut session = session(sink.clone());
        session.start_device_stream();
        assert!(sink.sent().is_empty());
        assert_eq!(
            session.take_notices(),
            vec![Notice::new(NoticeLevel::Warning, "No connection to the device")]
        );
    }

    #[tokio::test]
    async fn test_selection_tracks_inventory() {
        let mut session = session(RecordingSink::default());
        session.apply_event(DeviceEvent::PhotoList(vec![photo("a.jpg"), photo("b.jpg")]));
        assert!(session.toggle_selection("a.jpg"));
        assert!(session.toggle_selection("b.jpg"));
        assert!(!session.toggle_selection("missing.jpg"));
        assert_eq!(session.selection(), &strings(&["a.jpg", "b.jpg"]));

        session.apply_event(DeviceEvent::PhotoList(vec![photo("b.jpg"), photo("c.jpg")]));
        assert_eq!(session.selection(), &strings(&["b.jpg"]));

        session.apply_event(DeviceEvent::PhotoDeleted("b.jpg".to_string()));
        assert!(session.selection().is_empty());
        assert_eq!(session.photos(), &[photo("c.jpg")]);
    }

    #[tokio::test]
    async fn test_microscope_auto_selected_on_discovery() {
        let mut session = session(RecordingSink::default());
        session.discover_cameras(Some("0")).await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.cameras.len(), 2);
        assert_eq!(snapshot.selected_camera.as_deref(), Some("1"));
        assert_eq!(
            session.take_notices(),
            vec![Notice::new(
                NoticeLevel::Success,
                "Microscope detected: USB2.0 Microsope 04F2"
            )]
        );
    }

    #[tokio::test]
    async fn test_permission_denied_skips_enumeration() {
        let backend = FakeBackend::with_default_devices(FakeCounters::new()).deny_permission();
        let mut session = session_with(RecordingSink::default(), backend);
        session.discover_cameras(None).await;
        assert!(session.snapshot().cameras.is_empty());
        assert_eq!(session.take_notices()[0].level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_stop_camera_when_idle_changes_nothing() {
        let mut session = session(RecordingSink::default());
        let before = session.snapshot();
        session.stop_camera().await;
        assert_eq!(session.snapshot(), before);
        assert!(session.take_notices().is_empty());
    }

    #[tokio::test]
    async fn test_restarting_camera_keeps_one_stream() {
        let counters = FakeCounters::new();
        let backend = FakeBackend::with_default_devices(counters.clone());
        let mut session = session_with(RecordingSink::default(), backend);
        session.discover_cameras(None).await;
        session.start_camera().await;
        session.start_camera().await;
        assert!(session.snapshot().streaming);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        assert_eq!(counters.max_active.load(Ordering::SeqCst), 1);

        session.teardown().await;
        assert_eq!(counters.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_camera_start_is_reported() {
        let backend = FakeBackend::with_default_devices(FakeCounters::new()).fail_open();
        let mut session = session_with(RecordingSink::default(), backend);
        session.discover_cameras(None).await;
        session.take_notices();
        session.start_camera().await;
        assert!(!session.snapshot().streaming);
        let notices = session.take_notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].message.contains("Device busy"));
    }

    #[tokio::test]
    async fn test_take_photo_sends_data_url() {
        let sink = RecordingSink::default();
        let mut session = session(sink.clone());

        session.take_photo().await;
        assert_eq!(session.take_notices()[0].level, NoticeLevel::Warning);

        session.discover_cameras(None).await;
        session.start_camera().await;
        session.take_photo().await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        let DeviceCommand::SavePhoto { image } = &sent[0] else {
            panic!("expected save_photo, got {:?}", sent[0]);
        };
        assert!(image.starts_with("data:image/jpeg;base64,"));
        assert!(session.photos().is_empty());
    }

    #[tokio::test]
    async fn test_hand_off_success_clears_selection() {
        let mut session = session(RecordingSink::default());
        session.apply_event(DeviceEvent::PhotoList(vec![photo("a.jpg"), photo("b.jpg")]));
        session.toggle_selection("a.jpg");
        session.toggle_selection("b.jpg");

        let api = RecordingApi::default();
        let filenames = strings(&["a.jpg", "b.jpg"]);
        assert!(session.attach_and_analyze(&api, "exam-1", &filenames).await);

        assert_eq!(
            *api.calls.lock().expect("lock"),
            strings(&["attach:exam-1", "analyze:exam-1"])
        );
        assert_eq!(
            *api.attached.lock().expect("lock"),
            vec![("exam-1".to_string(), filenames)]
        );
        assert!(session.selection().is_empty());
        assert_eq!(session.take_notices()[0].level, NoticeLevel::Success);
    }

    #[tokio::test]
    async fn test_analysis_failure_keeps_selection() {
        let mut session = session(RecordingSink::default());
        session.apply_event(DeviceEvent::PhotoList(vec![photo("a.jpg")]));
        session.toggle_selection("a.jpg");
        let before = session.snapshot();

        let api = RecordingApi {
            fail_analysis: true,
            ..Default::default()
        };
        assert!(!session.attach_selected(&api, "exam-1").await);

        let after = session.snapshot();
        assert_eq!(after.selection, before.selection);
        assert_eq!(after.photos, before.photos);
        assert_eq!(
            session.take_notices(),
            vec![Notice::new(NoticeLevel::Error, "queue unavailable")]
        );
    }

    #[tokio::test]
    async fn test_attach_failure_skips_analysis() {
        let mut session = session(RecordingSink::default());
        session.apply_event(DeviceEvent::PhotoList(vec![photo("a.jpg")]));
        session.toggle_selection("a.jpg");

        let api = RecordingApi {
            fail_attach: true,
            ..Default::default()
        };
        assert!(!session.attach_selected(&api, "exam-1").await);
        assert_eq!(*api.calls.lock().expect("lock"), strings(&["attach:exam-1"]));
        assert_eq!(session.selection(), &strings(&["a.jpg"]));
    }

    #[tokio::test]
    async fn test_hand_off_requires_selection_and_examination() {
        let mut session = session(RecordingSink::default());
        let api = RecordingApi::default();
        assert!(!session.attach_and_analyze(&api, "exam-1", &[]).await);
        assert!(!session.attach_and_analyze(&api, " ", &strings(&["a.jpg"])).await);
        assert!(api.calls.lock().expect("lock").is_empty());
        assert!(session.take_notices().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_closes_channel() {
        let sink = RecordingSink::default();
        let mut session = session(sink.clone());
        session.handle_notification(ChannelNotification::Opened);
        session.teardown().await;
        assert!(*sink.closed.lock().expect("lock"));
        assert_eq!(session.snapshot().channel, ChannelStatus::Disconnected);
    }
}
