//! Wire format of the device control channel.
//!
//! Every frame is a JSON envelope `{"type": <kind>, "data": <payload>}`.
//! Outbound frames are [`DeviceCommand`]s, inbound frames decode into the
//! closed [`DeviceEvent`] type; kinds this client does not know about are
//! kept as [`DeviceEvent::Unknown`] so they can still be logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{OurError, OurResult};

/// Raw message envelope shared by both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// A photo stored by the device endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub filename: String,
    /// Server path of the stored file; some device builds send it as `url`
    #[serde(default, alias = "url")]
    pub path: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Acknowledgement payload of `photo_saved`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPhoto {
    pub filename: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Deserialize)]
struct DeletedPhoto {
    filename: String,
}

/// Commands sent to the device endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    GetPhotos,
    StartStream,
    StopStream,
    /// `image` is a base64 `data:` URL
    SavePhoto { image: String },
    DeletePhoto { filename: String },
}

impl DeviceCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceCommand::GetPhotos => "get_photos",
            DeviceCommand::StartStream => "start_stream",
            DeviceCommand::StopStream => "stop_stream",
            DeviceCommand::SavePhoto { .. } => "save_photo",
            DeviceCommand::DeletePhoto { .. } => "delete_photo",
        }
    }

    fn payload(&self) -> Value {
        match self {
            DeviceCommand::SavePhoto { image } => json!({ "image": image }),
            DeviceCommand::DeletePhoto { filename } => json!({ "filename": filename }),
            _ => json!({}),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            kind: self.kind().to_string(),
            data: self.payload(),
        }
    }

    /// Serialize into a text frame
    pub fn to_json(&self) -> OurResult<String> {
        Ok(serde_json::to_string(&self.to_envelope())?)
    }
}

/// Events received from the device endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Full inventory, replaces whatever the client holds
    PhotoList(Vec<Photo>),
    NewPhoto(Photo),
    PhotoSaved(Option<SavedPhoto>),
    PhotoDeleted(String),
    StreamStarted,
    StreamStopped,
    Error { message: Option<String> },
    Unknown { kind: String, data: Value },
}

impl DeviceEvent {
    /// Decode a text frame.
    ///
    /// Fails when the frame is not a JSON envelope, or when a known kind
    /// carries a payload of the wrong shape.
    pub fn decode(text: &str) -> OurResult<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| OurError::Protocol(format!("malformed device message: {e}")))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> OurResult<Self> {
        let Envelope { kind, data } = envelope;
        let payload_error =
            |e: serde_json::Error| OurError::Protocol(format!("invalid {kind} payload: {e}"));

        let event = match kind.as_str() {
            "photo_list" => {
                if !data.is_array() {
                    return Err(OurError::Protocol(
                        "photo_list payload is not an array".to_string(),
                    ));
                }
                DeviceEvent::PhotoList(serde_json::from_value(data).map_err(payload_error)?)
            }
            "new_photo" => {
                DeviceEvent::NewPhoto(serde_json::from_value(data).map_err(payload_error)?)
            }
            "photo_saved" => DeviceEvent::PhotoSaved(serde_json::from_value(data).ok()),
            "photo_deleted" => {
                let deleted: DeletedPhoto = serde_json::from_value(data).map_err(payload_error)?;
                DeviceEvent::PhotoDeleted(deleted.filename)
            }
            "stream_started" => DeviceEvent::StreamStarted,
            "stream_stopped" => DeviceEvent::StreamStopped,
            "error" => DeviceEvent::Error {
                message: data
                    .get("message")
                    .and_then(Value::as_str)
                    .filter(|message| !message.is_empty())
                    .map(str::to_string),
            },
            _ => DeviceEvent::Unknown { kind, data },
        };
        Ok(event)
    }

    pub fn kind(&self) -> &str {
        match self {
            DeviceEvent::PhotoList(_) => "photo_list",
            DeviceEvent::NewPhoto(_) => "new_photo",
            DeviceEvent::PhotoSaved(_) => "photo_saved",
            DeviceEvent::PhotoDeleted(_) => "photo_deleted",
            DeviceEvent::StreamStarted => "stream_started",
            DeviceEvent::StreamStopped => "stream_stopped",
            DeviceEvent::Error { .. } => "error",
            DeviceEvent::Unknown { kind, .. } => kind,
        }
    }
}
