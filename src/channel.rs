//! Control channel to the device endpoint.
//!
//! One WebSocket connection per capture session. [`connect`] spawns a task
//! that owns the socket and returns a [`ChannelHandle`] for sending commands
//! plus a receiver of [`ChannelNotification`]s. The task issues `get_photos`
//! right after every successful open so the session gets a baseline
//! inventory without user action.
//!
//! Commands are only accepted while the channel is connected; they are never
//! queued for later delivery. When the connection drops, the task follows
//! the configured [`ReconnectPolicy`].

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::protocol::{DeviceCommand, DeviceEvent};
use crate::{OurError, OurResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state as observed by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Disconnected => write!(f, "disconnected"),
            ChannelStatus::Connecting => write!(f, "connecting"),
            ChannelStatus::Connected => write!(f, "connected"),
            ChannelStatus::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {attempt})")
            }
        }
    }
}

/// Everything the channel task reports back
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotification {
    Opened,
    Closed,
    Reconnecting { attempt: u32, delay: Duration },
    Event(DeviceEvent),
    /// An inbound frame that could not be decoded; the connection stays up
    Malformed { error: String },
    TransportError(String),
    /// A command accepted while connected that was never written to the socket
    Undelivered { kind: String },
}

/// Bounded exponential backoff for re-opening a dropped channel
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Attempts after a drop before giving up; 0 never reconnects
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Stay disconnected after the first drop
    pub fn never() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), `None` once the
    /// attempts are used up
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Derive the device endpoint from the page origin: `https` maps to `wss`,
/// anything else to `ws`, path `/ws`
pub fn device_endpoint(base: &Url) -> OurResult<Url> {
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    let host = base
        .host_str()
        .ok_or_else(|| OurError::Config(format!("device URL has no host: {base}")))?;
    let authority = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(Url::parse(&format!("{scheme}://{authority}/ws"))?)
}

enum Outbound {
    Command(DeviceCommand),
    Close,
}

/// Handle for communicating with the channel task
#[derive(Clone)]
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    status: Arc<Mutex<ChannelStatus>>,
}

impl ChannelHandle {
    fn status_lock(&self) -> MutexGuard<'_, ChannelStatus> {
        lock_status(&self.status)
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status_lock()
    }

    /// Send a command; fails with [`OurError::NotConnected`] unless the
    /// channel is currently open
    pub fn send(&self, command: DeviceCommand) -> OurResult<()> {
        if self.status() != ChannelStatus::Connected {
            debug!("Dropping {} command, channel not connected", command.kind());
            return Err(OurError::NotConnected);
        }
        self.outbound
            .send(Outbound::Command(command))
            .map_err(|_| OurError::NotConnected)
    }

    /// Close the connection and stop reconnecting. Safe to call repeatedly.
    pub fn close(&self) {
        if self.outbound.send(Outbound::Close).is_err() {
            debug!("Channel task already stopped");
        }
    }
}

/// Where the session sends device commands; implemented by [`ChannelHandle`]
pub trait CommandSink: Send {
    fn send_command(&self, command: DeviceCommand) -> OurResult<()>;

    fn close(&self);
}

impl CommandSink for ChannelHandle {
    fn send_command(&self, command: DeviceCommand) -> OurResult<()> {
        self.send(command)
    }

    fn close(&self) {
        ChannelHandle::close(self)
    }
}

fn lock_status(status: &Mutex<ChannelStatus>) -> MutexGuard<'_, ChannelStatus> {
    status.lock().unwrap_or_else(|e| {
        error!("Channel status mutex poisoned: {e}");
        e.into_inner()
    })
}

/// Open the control channel in a background task
pub fn connect(
    endpoint: Url,
    policy: ReconnectPolicy,
) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelNotification>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let status = Arc::new(Mutex::new(ChannelStatus::Connecting));

    let task = ChannelTask {
        endpoint,
        policy,
        status: status.clone(),
        outbound: outbound_rx,
        notify: notify_tx,
    };
    tokio::spawn(task.run());

    let handle = ChannelHandle {
        outbound: outbound_tx,
        status,
    };
    (handle, notify_rx)
}

enum PumpExit {
    /// Close requested or every handle dropped
    Shutdown,
    /// Connection lost, reconnect policy applies
    Lost,
}

struct ChannelTask {
    endpoint: Url,
    policy: ReconnectPolicy,
    status: Arc<Mutex<ChannelStatus>>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    notify: mpsc::UnboundedSender<ChannelNotification>,
}

impl ChannelTask {
    fn set_status(&self, status: ChannelStatus) {
        *lock_status(&self.status) = status;
    }

    fn notify(&self, notification: ChannelNotification) {
        if self.notify.send(notification).is_err() {
            debug!("Channel notification receiver dropped");
        }
    }

    async fn run(mut self) {
        info!("Opening device channel to {}", self.endpoint);
        let mut attempt = 0;

        loop {
            match connect_async(self.endpoint.as_str()).await {
                Ok((socket, _response)) => {
                    attempt = 0;
                    info!("Device channel connected to {}", self.endpoint);
                    match self.serve(socket).await {
                        PumpExit::Shutdown => break,
                        PumpExit::Lost => {}
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to device at {}: {e}", self.endpoint);
                    self.set_status(ChannelStatus::Disconnected);
                    self.notify(ChannelNotification::TransportError(e.to_string()));
                    self.notify(ChannelNotification::Closed);
                }
            }

            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                info!("Device channel not reconnecting");
                break;
            };

            self.set_status(ChannelStatus::Reconnecting { attempt });
            self.notify(ChannelNotification::Reconnecting { attempt, delay });
            debug!("Reconnect attempt {attempt} in {delay:?}");
            if !self.wait_before_reconnect(delay).await {
                break;
            }
        }

        self.set_status(ChannelStatus::Disconnected);
        while let Ok(outbound) = self.outbound.try_recv() {
            if let Outbound::Command(command) = outbound {
                warn!("Discarding {} command, channel stopped", command.kind());
                self.notify(ChannelNotification::Undelivered {
                    kind: command.kind().to_string(),
                });
            }
        }
        debug!("Device channel task finished");
    }

    /// Sleep out the backoff; false when a close arrived meanwhile
    async fn wait_before_reconnect(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                outbound = self.outbound.recv() => match outbound {
                    None | Some(Outbound::Close) => return false,
                    Some(Outbound::Command(command)) => {
                        warn!("Discarding {} command while reconnecting", command.kind());
                        self.notify(ChannelNotification::Undelivered {
                            kind: command.kind().to_string(),
                        });
                    }
                },
            }
        }
    }

    async fn serve(&mut self, socket: Socket) -> PumpExit {
        let (mut sink, mut stream) = socket.split();

        let exit = match send_frame(&mut sink, &DeviceCommand::GetPhotos).await {
            Ok(()) => {
                self.set_status(ChannelStatus::Connected);
                self.notify(ChannelNotification::Opened);
                self.pump(&mut sink, &mut stream).await
            }
            Err(e) => {
                warn!("Failed to request photo list: {e}");
                self.notify(ChannelNotification::TransportError(e.to_string()));
                PumpExit::Lost
            }
        };

        self.set_status(ChannelStatus::Disconnected);
        self.notify(ChannelNotification::Closed);
        info!("Device channel closed");
        exit
    }

    async fn pump<S, R>(&mut self, sink: &mut S, stream: &mut R) -> PumpExit
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            tokio::select! {
                outbound = self.outbound.recv() => match outbound {
                    None | Some(Outbound::Close) => {
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            debug!("Close frame not delivered: {e}");
                        }
                        return PumpExit::Shutdown;
                    }
                    Some(Outbound::Command(command)) => {
                        if let Err(e) = send_frame(sink, &command).await {
                            warn!("Failed to send {} command: {e}", command.kind());
                            self.notify(ChannelNotification::TransportError(e.to_string()));
                            return PumpExit::Lost;
                        }
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.handle_frame(&text),
                        Err(e) => self.report_malformed(format!("binary frame is not UTF-8: {e}")),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Device sent close frame: {frame:?}");
                        return PumpExit::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Device channel error: {e}");
                        self.notify(ChannelNotification::TransportError(e.to_string()));
                        return PumpExit::Lost;
                    }
                    None => return PumpExit::Lost,
                },
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match DeviceEvent::decode(text) {
            Ok(event) => {
                debug!("Device event: {}", event.kind());
                self.notify(ChannelNotification::Event(event));
            }
            Err(e) => self.report_malformed(e.to_string()),
        }
    }

    fn report_malformed(&self, error: String) {
        warn!("Discarding device message: {error}");
        self.notify(ChannelNotification::Malformed { error });
    }
}

async fn send_frame<S>(sink: &mut S, command: &DeviceCommand) -> OurResult<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = command.to_json()?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_follows_page_scheme() {
        let base = Url::parse("https://clinic.example").expect("valid url");
        assert_eq!(
            device_endpoint(&base).expect("endpoint").as_str(),
            "wss://clinic.example/ws"
        );

        let base = Url::parse("http://localhost:8080/app/").expect("valid url");
        assert_eq!(
            device_endpoint(&base).expect("endpoint").as_str(),
            "ws://localhost:8080/ws"
        );
    }

    #[test]
    fn test_backoff_doubles_and_is_bounded() {
        let policy = ReconnectPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        let delays: Vec<_> = (1..=7).map(|attempt| policy.delay_for(attempt)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(400)),
                Some(Duration::from_millis(800)),
                Some(Duration::from_millis(1000)),
                Some(Duration::from_millis(1000)),
                None,
            ]
        );
    }

    #[test]
    fn test_never_policy() {
        assert_eq!(ReconnectPolicy::never().delay_for(1), None);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        // Nothing listens on port 9 locally; the handle starts out connecting
        let endpoint = Url::parse("ws://127.0.0.1:9/ws").expect("valid url");
        let (handle, mut notifications) = connect(endpoint, ReconnectPolicy::never());

        let result = handle.send(DeviceCommand::StartStream);
        assert!(matches!(result, Err(OurError::NotConnected)));

        let first = notifications.recv().await;
        assert!(matches!(first, Some(ChannelNotification::TransportError(_))));
        assert_eq!(notifications.recv().await, Some(ChannelNotification::Closed));
        assert_eq!(notifications.recv().await, None);
        handle.close();
        handle.close();
    }

    #[tokio::test]
    async fn test_commands_queued_during_backoff_are_reported() {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let mut task = ChannelTask {
            endpoint: Url::parse("ws://127.0.0.1:9/ws").expect("valid url"),
            policy: ReconnectPolicy::default(),
            status: Arc::new(Mutex::new(ChannelStatus::Reconnecting { attempt: 1 })),
            outbound: outbound_rx,
            notify: notify_tx,
        };

        outbound_tx
            .send(Outbound::Command(DeviceCommand::StartStream))
            .unwrap_or_else(|_| panic!("task receiver dropped"));
        assert!(task.wait_before_reconnect(Duration::from_millis(20)).await);
        assert_eq!(
            notify_rx.try_recv().ok(),
            Some(ChannelNotification::Undelivered {
                kind: "start_stream".to_string()
            })
        );

        outbound_tx
            .send(Outbound::Close)
            .unwrap_or_else(|_| panic!("task receiver dropped"));
        assert!(!task.wait_before_reconnect(Duration::from_secs(5)).await);
    }
}
