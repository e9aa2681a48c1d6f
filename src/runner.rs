//! Session driver.
//!
//! Runs a [`CaptureSession`] as a task that multiplexes control-channel
//! notifications and user commands, so the session state is only ever
//! touched from one place. Front ends talk to it through a cloneable
//! [`SessionHandle`], watch [`SessionSnapshot`]s and read notices from the
//! receiver returned by [`spawn_session`].
//!
//! The camera is released and the channel closed on every exit path: an
//! explicit shutdown, or the last handle going away.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span};
use uuid::Uuid;

use crate::api::ExaminationApi;
use crate::channel::{ChannelNotification, CommandSink};
use crate::session::{CaptureSession, Notice, NoticeLevel, SessionSnapshot};
use crate::{OurError, OurResult};

/// User commands accepted by a running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Request camera access and enumerate; the optional id is the
    /// remembered camera used when no microscope is recognised
    DiscoverCameras { preferred: Option<String> },
    SelectCamera(String),
    StartCamera,
    StopCamera,
    TakePhoto,
    RefreshPhotos,
    StartDeviceStream,
    StopDeviceStream,
    DeletePhoto(String),
    ToggleSelection(String),
    AttachAndAnalyze { examination_id: String },
}

enum Control {
    Execute {
        command: SessionCommand,
        respond_to: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle for driving a running session
#[derive(Clone)]
pub struct SessionHandle {
    control: mpsc::UnboundedSender<Control>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Run a command and wait until the session has applied it
    pub async fn execute(&self, command: SessionCommand) -> OurResult<()> {
        let (respond_to, done) = oneshot::channel();
        self.control
            .send(Control::Execute {
                command,
                respond_to,
            })
            .map_err(|_| OurError::App("Session has ended".to_string()))?;
        done.await
            .map_err(|_| OurError::App("Session ended before the command completed".to_string()))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Ask the session to tear down. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if self.control.send(Control::Shutdown).is_err() {
            debug!("Session already stopped");
        }
    }
}

/// What [`spawn_session`] hands back
pub struct SessionRuntime {
    pub handle: SessionHandle,
    pub notices: mpsc::UnboundedReceiver<Notice>,
    pub task: JoinHandle<()>,
}

/// Spawn the driver task for `session`.
///
/// Without an `api` the attach and analyze command only reports that no
/// backend session is available.
pub fn spawn_session<S>(
    session: CaptureSession<S>,
    notifications: mpsc::UnboundedReceiver<ChannelNotification>,
    api: Option<Arc<dyn ExaminationApi>>,
) -> SessionRuntime
where
    S: CommandSink + 'static,
{
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());

    let driver = SessionDriver {
        session,
        notifications: Some(notifications),
        control: control_rx,
        api,
        snapshots: snapshot_tx,
        notices: notice_tx,
    };

    let session_id = Uuid::new_v4();
    let task = tokio::spawn(driver.run().instrument(info_span!("session", %session_id)));

    SessionRuntime {
        handle: SessionHandle {
            control: control_tx,
            snapshots: snapshot_rx,
        },
        notices: notice_rx,
        task,
    }
}

struct SessionDriver<S: CommandSink> {
    session: CaptureSession<S>,
    notifications: Option<mpsc::UnboundedReceiver<ChannelNotification>>,
    control: mpsc::UnboundedReceiver<Control>,
    api: Option<Arc<dyn ExaminationApi>>,
    snapshots: watch::Sender<SessionSnapshot>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl<S: CommandSink> SessionDriver<S> {
    async fn run(mut self) {
        info!("Capture session started");

        loop {
            tokio::select! {
                notification = next_notification(&mut self.notifications) => match notification {
                    Some(notification) => self.session.handle_notification(notification),
                    None => {
                        // channel task finished; the camera side keeps working
                        debug!("Channel notifications ended");
                        self.notifications = None;
                        self.session.channel_ended();
                    }
                },
                control = self.control.recv() => match control {
                    Some(Control::Execute { command, respond_to }) => {
                        self.execute(command).await;
                        self.publish();
                        if respond_to.send(()).is_err() {
                            debug!("Command caller went away");
                        }
                        continue;
                    }
                    Some(Control::Shutdown) | None => break,
                },
            }
            self.publish();
        }

        self.session.teardown().await;
        self.publish();
        info!("Capture session ended");
    }

    async fn execute(&mut self, command: SessionCommand) {
        debug!("Executing {command:?}");
        match command {
            SessionCommand::DiscoverCameras { preferred } => {
                self.session.discover_cameras(preferred.as_deref()).await
            }
            SessionCommand::SelectCamera(device_id) => self.session.select_camera(&device_id).await,
            SessionCommand::StartCamera => self.session.start_camera().await,
            SessionCommand::StopCamera => self.session.stop_camera().await,
            SessionCommand::TakePhoto => self.session.take_photo().await,
            SessionCommand::RefreshPhotos => self.session.refresh_photos(),
            SessionCommand::StartDeviceStream => self.session.start_device_stream(),
            SessionCommand::StopDeviceStream => self.session.stop_device_stream(),
            SessionCommand::DeletePhoto(filename) => self.session.delete_photo(&filename),
            SessionCommand::ToggleSelection(filename) => {
                self.session.toggle_selection(&filename);
            }
            SessionCommand::AttachAndAnalyze { examination_id } => match self.api.clone() {
                Some(api) => {
                    self.session
                        .attach_selected(api.as_ref(), &examination_id)
                        .await;
                }
                None => {
                    if self
                        .notices
                        .send(Notice::new(NoticeLevel::Warning, "Log in to attach photos"))
                        .is_err()
                    {
                        debug!("Notice receiver dropped");
                    }
                }
            },
        }
    }

    /// Push the current state and any pending notices to observers
    fn publish(&mut self) {
        for notice in self.session.take_notices() {
            if self.notices.send(notice).is_err() {
                debug!("Notice receiver dropped");
            }
        }
        self.snapshots.send_replace(self.session.snapshot());
    }
}

async fn next_notification(
    notifications: &mut Option<mpsc::UnboundedReceiver<ChannelNotification>>,
) -> Option<ChannelNotification> {
    match notifications {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
