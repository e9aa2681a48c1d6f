//! Local camera acquisition.
//!
//! The physical camera is an exclusive resource: [`manager::CameraManager`]
//! is the only owner of the live stream and always releases the current
//! stream before acquiring a new one. Capture hardware is reached through
//! the [`CameraBackend`] trait so the native implementation can be swapped
//! out (tests, other capture stacks).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::OurResult;

pub mod manager;
#[cfg(feature = "native-camera")]
pub mod native;

#[cfg(test)]
pub(crate) mod fake;

pub use manager::{CameraHandle, CameraStatus, Discovery};

/// A video input device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDevice {
    pub id: String,
    pub label: String,
}

impl CameraDevice {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Capture stack behind the camera manager
pub trait CameraBackend: Send {
    /// Ask for camera access once; any trial stream must be released before
    /// returning
    fn request_permission(&mut self) -> OurResult<()>;

    /// List the video input devices
    fn enumerate(&mut self) -> OurResult<Vec<CameraDevice>>;

    /// Acquire a live stream from `device_id`
    fn open(&mut self, device_id: &str) -> OurResult<Box<dyn LiveStream>>;
}

/// An acquired camera stream. Dropping it must release the hardware.
pub trait LiveStream {
    fn device_id(&self) -> &str;

    /// Current frame at native resolution
    fn grab(&mut self) -> OurResult<RgbImage>;

    /// Stop the stream and release the device
    fn stop(&mut self) -> OurResult<()>;
}

/// One rule of the microscope auto-selection policy
#[derive(Clone)]
pub enum MatchRule {
    /// Case-insensitive substring of the device label
    LabelContains(String),
    LabelPattern(Regex),
    Custom(Arc<dyn Fn(&CameraDevice) -> bool + Send + Sync>),
}

impl MatchRule {
    pub fn matches(&self, device: &CameraDevice) -> bool {
        match self {
            MatchRule::LabelContains(fragment) => device
                .label
                .to_lowercase()
                .contains(&fragment.to_lowercase()),
            MatchRule::LabelPattern(pattern) => pattern.is_match(&device.label),
            MatchRule::Custom(predicate) => predicate(device),
        }
    }
}

impl fmt::Debug for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchRule::LabelContains(fragment) => {
                f.debug_tuple("LabelContains").field(fragment).finish()
            }
            MatchRule::LabelPattern(pattern) => f
                .debug_tuple("LabelPattern")
                .field(&pattern.as_str())
                .finish(),
            MatchRule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Ordered list of rules recognising capillaroscope hardware. The first
/// rule that matches any device decides.
#[derive(Debug, Clone, Default)]
pub struct DeviceMatcher {
    rules: Vec<MatchRule>,
}

impl DeviceMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        labels.iter().fold(Self::new(), |matcher, label| {
            matcher.with_rule(MatchRule::LabelContains(label.as_ref().to_string()))
        })
    }

    pub fn with_rule(mut self, rule: MatchRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn find<'a>(&self, devices: &'a [CameraDevice]) -> Option<&'a CameraDevice> {
        self.rules
            .iter()
            .find_map(|rule| devices.iter().find(|device| rule.matches(device)))
    }
}

/// Outcome of the auto-selection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSelection {
    pub device_id: Option<String>,
    /// Set when the choice came from a microscope match
    pub microscope: Option<CameraDevice>,
}

/// Pick the device to pre-select after enumeration: a recognised microscope,
/// else the current selection if it is still present, else the first device
pub fn choose_device(
    devices: &[CameraDevice],
    matcher: &DeviceMatcher,
    current: Option<&str>,
) -> AutoSelection {
    if let Some(microscope) = matcher.find(devices) {
        return AutoSelection {
            device_id: Some(microscope.id.clone()),
            microscope: Some(microscope.clone()),
        };
    }

    let device_id = current
        .filter(|id| devices.iter().any(|device| device.id == *id))
        .map(str::to_string)
        .or_else(|| devices.first().map(|device| device.id.clone()));

    AutoSelection {
        device_id,
        microscope: None,
    }
}

/// A JPEG-encoded still
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

impl CapturedFrame {
    pub fn encode(image: &RgbImage, quality: u8) -> OurResult<Self> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(image)?;
        Ok(Self {
            width: image.width(),
            height: image.height(),
            jpeg,
        })
    }

    /// `data:image/jpeg;base64,...` form expected by `save_photo`
    pub fn to_data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", STANDARD.encode(&self.jpeg))
    }
}
