use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use toml::Spanned;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use super::diagnostics::Diagnostic;
use super::diagnostics::Error;
use super::diagnostics::SourceInfo;
use super::diagnostics::ValidationError;
use super::diagnostics::Warning;
use super::diagnostics::format_diagnostics;
use crate::engine::ControllerSettings;
use crate::engine::Membership;
use crate::engine::state::Capability;
use crate::engine::state::DeviceSnapshot;
use crate::simulator::SimulatedDevice;

/// Error type for config loading failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read '{}': {error}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Failed to parse '{}': {error}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        error: toml::de::Error,
    },

    /// Validation failed; carries the rendered diagnostics.
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub controller: ControllerConfig,
    pub groups: BTreeMap<String, GroupConfig>,
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `"proplight::engine" = "debug"`
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the subscriber filter: `level` by default, overrides per target.
    pub fn targets(&self) -> Targets {
        Targets::new()
            .with_default(LevelFilter::from(self.level))
            .with_targets(
                self.overrides
                    .iter()
                    .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
            )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            port: 8565,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub debounce_ms: u64,
    pub max_wait_ms: u64,
    pub queue_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let settings = ControllerSettings::default();
        Self {
            debounce_ms: settings.debounce.as_millis() as u64,
            max_wait_ms: settings.max_wait.as_millis() as u64,
            queue_size: settings.queue_size,
        }
    }
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.debounce_ms),
            max_wait: Duration::from_millis(config.max_wait_ms),
            queue_size: config.queue_size,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupConfig {
    /// Display name, defaults to the group id
    pub name: String,
    pub members: Vec<String>,
    pub hue_offsets: HashMap<String, f64>,
}

impl GroupConfig {
    pub fn membership(&self) -> Membership {
        Membership {
            members: self.members.clone(),
            hue_offsets: self.hue_offsets.clone(),
        }
    }
}

/// A simulated light.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub supported_modes: BTreeSet<Capability>,
    pub effect_list: Vec<String>,
    pub min_color_temp_kelvin: Option<u32>,
    pub max_color_temp_kelvin: Option<u32>,
    pub on: bool,
    pub brightness: Option<u8>,
    pub reject_commands: bool,
}

impl DeviceConfig {
    pub fn simulated(&self, device_id: &str) -> SimulatedDevice {
        let mut snapshot = DeviceSnapshot {
            on: self.on,
            brightness: self.brightness,
            supported_modes: self.supported_modes.clone(),
            effect_list: self.effect_list.clone(),
            min_color_temp_kelvin: self.min_color_temp_kelvin,
            max_color_temp_kelvin: self.max_color_temp_kelvin,
            ..DeviceSnapshot::new(device_id)
        };
        if snapshot.supported_modes.is_empty() {
            snapshot.supported_modes.insert(Capability::OnOff);
        }
        snapshot.color_mode = snapshot
            .supported_modes
            .iter()
            .copied()
            .find(|mode| mode.is_color_mode());

        SimulatedDevice {
            snapshot,
            reject_commands: self.reject_commands,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    api: ApiConfig,
    controller: Option<Spanned<ControllerConfig>>,
    #[serde(default)]
    groups: BTreeMap<String, Spanned<RawGroup>>,
    #[serde(default)]
    devices: BTreeMap<String, Spanned<DeviceConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    name: Option<String>,
    members: Option<Spanned<Vec<Spanned<String>>>>,
    #[serde(default)]
    hue_offsets: HashMap<String, Spanned<f64>>,
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// Returns the config together with any warnings. Errors are collected
    /// across the whole file and reported together.
    pub fn from_file(path: &Path) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e,
        })?;

        Self::parse(SourceInfo {
            file_path: path.to_path_buf(),
            content,
        })
    }

    pub fn parse(source: SourceInfo) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let raw: RawConfig = toml::from_str(&source.content).map_err(|e| ConfigError::Parse {
            path: source.file_path.clone(),
            error: e,
        })?;

        let mut diagnostics = Vec::new();
        if source.content.trim().is_empty() {
            diagnostics.push(Diagnostic::Warning(Warning::EmptyConfig {
                file_path: source.file_path.clone(),
            }));
        }

        let config = Self::from_raw(raw, &mut diagnostics);

        if diagnostics.iter().any(|d| d.is_error()) {
            Err(ConfigError::Invalid(format_diagnostics(&diagnostics, &source)))
        } else {
            Ok((config, diagnostics))
        }
    }

    fn from_raw(raw: RawConfig, diagnostics: &mut Vec<Diagnostic>) -> Self {
        let mut error = |e: ValidationError| diagnostics.push(Diagnostic::Error(Error::Validation(e)));

        let controller = match raw.controller {
            Some(controller) => {
                if controller.get_ref().queue_size == 0 {
                    error(
                        ValidationError::new("controller.queue_size", "must be at least 1")
                            .at(controller.span(), "in this table"),
                    );
                }
                controller.into_inner()
            }
            None => ControllerConfig::default(),
        };

        let mut devices = BTreeMap::new();
        for (id, device) in raw.devices {
            let span = device.span();
            let device = device.into_inner();
            if let (Some(min), Some(max)) = (device.min_color_temp_kelvin, device.max_color_temp_kelvin) {
                if min > max {
                    error(
                        ValidationError::new(
                            format!("devices.{}", id),
                            format!("color temperature range {}K..{}K is inverted", min, max),
                        )
                        .at(span, "min_color_temp_kelvin is above max_color_temp_kelvin"),
                    );
                }
            }
            devices.insert(id, device);
        }

        let mut groups = BTreeMap::new();
        let mut undefined = Vec::new();
        for (id, group) in raw.groups {
            let group_span = group.span();
            let group = group.into_inner();

            let members = match group.members {
                Some(members) if !members.get_ref().is_empty() => members.into_inner(),
                Some(members) => {
                    error(
                        ValidationError::new(
                            format!("groups.{}.members", id),
                            "a group needs at least one member",
                        )
                        .at(members.span(), "empty member list"),
                    );
                    Vec::new()
                }
                None => {
                    error(
                        ValidationError::new(format!("groups.{}.members", id), "missing member list")
                            .at(group_span, "group defined here"),
                    );
                    Vec::new()
                }
            };

            let mut seen = HashSet::new();
            for member in &members {
                if !seen.insert(member.get_ref().as_str()) {
                    error(
                        ValidationError::new(
                            format!("groups.{}.members", id),
                            format!("'{}' is listed more than once", member.get_ref()),
                        )
                        .at(member.span(), "duplicate member"),
                    );
                } else if !devices.contains_key(member.get_ref()) {
                    undefined.push(Warning::UndefinedDevice {
                        group: id.clone(),
                        device_id: member.get_ref().clone(),
                        span: member.span(),
                    });
                }
            }

            let mut hue_offsets = HashMap::new();
            for (device_id, offset) in group.hue_offsets {
                let field_path = format!("groups.{}.hue_offsets.\"{}\"", id, device_id);
                if !offset.get_ref().is_finite() {
                    error(
                        ValidationError::new(field_path, "hue offset must be a finite number of degrees")
                            .at(offset.span(), "not finite"),
                    );
                } else if !seen.contains(device_id.as_str()) {
                    error(
                        ValidationError::new(field_path, format!("'{}' is not a member of this group", device_id))
                            .at(offset.span(), "offset for a non-member"),
                    );
                } else {
                    hue_offsets.insert(device_id, offset.into_inner());
                }
            }

            groups.insert(
                id.clone(),
                GroupConfig {
                    name: group.name.unwrap_or_else(|| id.clone()),
                    members: members.into_iter().map(Spanned::into_inner).collect(),
                    hue_offsets,
                },
            );
        }

        diagnostics.extend(undefined.into_iter().map(Diagnostic::Warning));

        Config {
            logging: raw.logging,
            api: raw.api,
            controller,
            groups,
            devices,
        }
    }
}
