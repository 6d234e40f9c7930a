//! Type-safe command and event types for proplight
//!
//! Commands are split by level to enforce correct usage at compile time:
//! - `GroupCommand`: what the presentation layer asks of a group light
//! - `DeviceCommand`: what a group controller sends to one member device
//!
//! `DeviceChange` is the event the event bus delivers to controllers.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::state::DeviceSnapshot;

/// Turn-on request for a group light.
///
/// Several color attributes may be present at once; only the highest-priority
/// one is honored (see [`TurnOn::attribute`]).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnOn {
    pub brightness: Option<u8>,
    pub effect: Option<String>,
    pub hs_color: Option<(f64, f64)>,
    pub color_temp_kelvin: Option<u32>,
    pub rgb_color: Option<(u8, u8, u8)>,
    pub rgbw_color: Option<(u8, u8, u8, u8)>,
    pub rgbww_color: Option<(u8, u8, u8, u8, u8)>,
    pub xy_color: Option<(f64, f64)>,
}

impl TurnOn {
    pub fn brightness(brightness: u8) -> Self {
        Self {
            brightness: Some(brightness),
            ..Default::default()
        }
    }

    /// Explicitly requested brightness; zero counts as not given.
    pub fn target_brightness(&self) -> Option<u8> {
        self.brightness.filter(|b| *b > 0)
    }

    /// Resolve the color/effect attribute to forward.
    ///
    /// Priority: effect > hs > color temperature > rgb > rgbw > rgbww > xy.
    pub fn attribute(&self) -> Option<LightAttribute> {
        if let Some(effect) = &self.effect {
            return Some(LightAttribute::Effect(effect.clone()));
        }
        if let Some((h, s)) = self.hs_color {
            return Some(LightAttribute::Hs(h, s));
        }
        if let Some(kelvin) = self.color_temp_kelvin {
            return Some(LightAttribute::ColorTemp(kelvin));
        }
        if let Some(rgb) = self.rgb_color {
            return Some(LightAttribute::Rgb(rgb));
        }
        if let Some(rgbw) = self.rgbw_color {
            return Some(LightAttribute::Rgbw(rgbw));
        }
        if let Some(rgbww) = self.rgbww_color {
            return Some(LightAttribute::Rgbww(rgbww));
        }
        self.xy_color.map(|(x, y)| LightAttribute::Xy(x, y))
    }
}

/// A command for the whole group light.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GroupCommand {
    TurnOn(TurnOn),
    TurnOff,
}

/// A single color or effect setting sent alongside a turn-on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightAttribute {
    Effect(String),
    Hs(f64, f64),
    ColorTemp(u32),
    Rgb((u8, u8, u8)),
    Rgbw((u8, u8, u8, u8)),
    Rgbww((u8, u8, u8, u8, u8)),
    Xy(f64, f64),
}

/// A command for one member device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeviceCommand {
    TurnOn {
        brightness: Option<u8>,
        attribute: Option<LightAttribute>,
    },
    TurnOff,
}

/// A member device's reported state changed.
#[derive(Debug, Clone)]
pub struct DeviceChange {
    pub device_id: String,
    pub old: Option<DeviceSnapshot>,
    pub new: DeviceSnapshot,
}

/// Error returned by a device registry when a command cannot be delivered.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("command rejected by {device_id}: {reason}")]
    Rejected { device_id: String, reason: String },

    #[error("dispatch task failed: {0}")]
    Task(String),
}

/// One device that did not accept its part of a group command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceFailure {
    pub device_id: String,
    pub error: String,
}

/// Outcome of a group command: best-effort, per-device.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CommandReport {
    /// Number of devices a command was sent to.
    pub dispatched: usize,
    pub failures: Vec<DeviceFailure>,
}

impl CommandReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.dispatched - self.failures.len()
    }
}

impl fmt::Display for CommandReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "succeeded with {}/{} device failures",
            self.failures.len(),
            self.dispatched
        )?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.device_id, failure.error)?;
        }
        Ok(())
    }
}
