use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

/// A light capability, as advertised by a member device or by the group.
///
/// Everything except `Effects` is a color mode in the host platform's sense.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    #[serde(rename = "onoff")]
    #[strum(serialize = "onoff")]
    OnOff,
    Brightness,
    ColorTemp,
    Hs,
    Xy,
    Rgb,
    Rgbw,
    Rgbww,
    Effects,
}

impl Capability {
    /// Whether this capability describes how light color is expressed.
    pub fn is_color_mode(self) -> bool {
        !matches!(self, Capability::Effects)
    }

    /// Whether a device in this mode can produce saturated color.
    pub fn is_true_color(self) -> bool {
        matches!(self, Capability::Hs | Capability::Xy | Capability::Rgb)
    }
}

/// Reported state of one member device.
///
/// Produced fresh by the device registry on every read and never mutated
/// afterwards. Each color representation sits in its own field because devices
/// commonly report several at once (e.g. `hs_color` alongside `xy_color`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,

    pub on: bool,

    /// Brightness level (0-255), if supported.
    pub brightness: Option<u8>,

    /// The mode the device is currently operating in.
    pub color_mode: Option<Capability>,

    /// Hue in degrees [0, 360), saturation in percent [0, 100].
    pub hs_color: Option<(f64, f64)>,
    pub rgb_color: Option<(u8, u8, u8)>,
    pub xy_color: Option<(f64, f64)>,
    pub color_temp_kelvin: Option<u32>,

    /// Legacy color temperature in mireds.
    pub color_temp_mired: Option<u32>,

    pub effect: Option<String>,

    pub supported_modes: BTreeSet<Capability>,
    pub effect_list: Vec<String>,
    pub min_color_temp_kelvin: Option<u32>,
    pub max_color_temp_kelvin: Option<u32>,
}

impl DeviceSnapshot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Brightness used for aggregation; an on device without a level counts as full.
    pub fn effective_brightness(&self) -> u8 {
        self.brightness.unwrap_or(u8::MAX)
    }

    /// The running effect, ignoring the "off"/"none" placeholders devices report.
    pub fn active_effect(&self) -> Option<&str> {
        self.effect
            .as_deref()
            .filter(|e| !e.is_empty())
            .filter(|e| !e.eq_ignore_ascii_case("off") && !e.eq_ignore_ascii_case("none"))
    }

    pub fn supports_true_color(&self) -> bool {
        self.supported_modes.iter().any(|m| m.is_true_color())
    }
}

/// Aggregated state of a group light.
///
/// Recomputed from scratch on every aggregation pass. `hs_color` and
/// `color_temp_kelvin` are never both set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub on: bool,
    pub brightness: Option<u8>,
    pub hs_color: Option<(f64, f64)>,
    pub color_temp_kelvin: Option<u32>,
    pub effect: Option<String>,
    pub supported_modes: BTreeSet<Capability>,
    pub effect_list: Vec<String>,
    pub min_color_temp_kelvin: Option<u32>,
    pub max_color_temp_kelvin: Option<u32>,
}

impl GroupSnapshot {
    /// The color mode the group light currently presents.
    pub fn color_mode(&self) -> Capability {
        if self.hs_color.is_some() {
            return Capability::Hs;
        }
        if self.color_temp_kelvin.is_some() {
            return Capability::ColorTemp;
        }
        if self.brightness.is_some() {
            return Capability::Brightness;
        }

        let supported = &self.supported_modes;
        [Capability::Hs, Capability::ColorTemp, Capability::Brightness]
            .into_iter()
            .find(|m| supported.contains(m))
            .or_else(|| supported.iter().copied().find(|m| m.is_color_mode()))
            .unwrap_or(Capability::Brightness)
    }
}
