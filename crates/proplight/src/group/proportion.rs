//! Per-device brightness proportions.
//!
//! A proportion is a device's brightness relative to the group's level when it
//! was captured. Scaling the group multiplies through the stored proportions so
//! the relative "shape" of the group survives dimming and off/on cycles.

use std::collections::HashMap;
use std::collections::HashSet;

use tracing::debug;

/// Minimum drift of any single proportion before an observed batch replaces
/// the stored values.
pub const CHANGE_THRESHOLD: f64 = 0.05;

/// Proportion assumed for a device with nothing stored.
const DEFAULT_PROPORTION: f64 = 1.0;

/// Levels at or above this are treated as "full".
const FULL: u8 = u8::MAX;

/// Levels at or below this pin every device to the minimum.
const FLOOR: u8 = 1;

/// Result of scaling the group to a target level.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Targets {
    /// New brightness for each on device.
    pub brightness: HashMap<String, u8>,
    /// Proportions the brightness values were computed from.
    pub proportions: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ProportionTracker {
    proportions: HashMap<String, f64>,
}

impl ProportionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<f64> {
        self.proportions.get(device_id).copied()
    }

    pub fn proportions(&self) -> &HashMap<String, f64> {
        &self.proportions
    }

    pub fn is_empty(&self) -> bool {
        self.proportions.is_empty()
    }

    /// Record the brightness of every on device from one aggregation pass.
    ///
    /// The batch is applied all-or-nothing: only when nothing is stored yet, or
    /// when at least one device drifted by more than [`CHANGE_THRESHOLD`] from
    /// its stored proportion. Returns whether the stored values changed.
    pub fn observe(&mut self, readings: &[(&str, u8)], group_brightness: u8) -> bool {
        if group_brightness == 0 || readings.is_empty() {
            return false;
        }

        let level = f64::from(group_brightness);
        let observed: Vec<(&str, f64)> = readings
            .iter()
            .map(|(id, brightness)| (*id, f64::from(*brightness) / level))
            .collect();

        let drifted = self.proportions.is_empty()
            || observed.iter().any(|(id, proportion)| {
                let stored = self.proportions.get(*id).copied().unwrap_or(0.0);
                (proportion - stored).abs() > CHANGE_THRESHOLD
            });

        if !drifted {
            return false;
        }

        for (id, proportion) in observed {
            self.proportions.insert(id.to_string(), proportion);
        }
        debug!("Updated brightness proportions: {:?}", self.proportions);
        true
    }

    /// Compute per-device brightness for scaling the on devices to `target`.
    ///
    /// `on_devices` pairs each on device with its current brightness. Unless the
    /// target is at the floor, the proportions used become the stored baseline.
    pub fn compute_targets(&mut self, on_devices: &[(&str, u8)], target: u8) -> Targets {
        if on_devices.is_empty() {
            return Targets::default();
        }

        if target <= FLOOR {
            return Targets {
                brightness: on_devices
                    .iter()
                    .map(|(id, _)| (id.to_string(), FLOOR))
                    .collect(),
                proportions: self.lookup(on_devices).unwrap_or_default(),
            };
        }

        let targets = if target >= FULL {
            let proportions = self
                .lookup(on_devices)
                .unwrap_or_else(|| derive_from_max(on_devices));
            let max = proportions.values().copied().fold(0.0, f64::max);

            let brightness = proportions
                .iter()
                .map(|(id, proportion)| {
                    let level = if max > 0.0 {
                        (f64::from(FULL) * proportion / max).round()
                    } else {
                        f64::from(FULL)
                    };
                    (id.clone(), to_level(level))
                })
                .collect();

            Targets {
                brightness,
                proportions,
            }
        } else {
            let proportions = self
                .lookup(on_devices)
                .unwrap_or_else(|| derive_from_average(on_devices));

            let brightness = proportions
                .iter()
                .map(|(id, proportion)| {
                    let ideal = f64::from(target) * proportion;
                    (id.clone(), to_level(ideal.round()))
                })
                .collect();

            Targets {
                brightness,
                proportions,
            }
        };

        self.proportions.extend(
            targets
                .proportions
                .iter()
                .map(|(id, proportion)| (id.clone(), *proportion)),
        );
        debug!(
            "Scaled to {}: brightness={:?}, proportions={:?}",
            target, targets.brightness, targets.proportions
        );

        targets
    }

    /// Forget devices that are no longer members.
    pub fn reset(&mut self, members: &HashSet<String>) {
        self.proportions.retain(|id, _| members.contains(id));
    }

    /// Stored proportions for the given devices, or `None` if none of them has one.
    ///
    /// Devices without a stored value default to 1.0.
    fn lookup(&self, on_devices: &[(&str, u8)]) -> Option<HashMap<String, f64>> {
        if !on_devices
            .iter()
            .any(|(id, _)| self.proportions.contains_key(*id))
        {
            return None;
        }

        Some(
            on_devices
                .iter()
                .map(|(id, _)| {
                    let proportion = self.get(id).unwrap_or(DEFAULT_PROPORTION);
                    (id.to_string(), proportion)
                })
                .collect(),
        )
    }
}

fn derive_from_max(on_devices: &[(&str, u8)]) -> HashMap<String, f64> {
    let max = on_devices.iter().map(|(_, b)| *b).max().unwrap_or(0);
    on_devices
        .iter()
        .map(|(id, brightness)| {
            let proportion = if max > 0 {
                f64::from(*brightness) / f64::from(max)
            } else {
                DEFAULT_PROPORTION
            };
            (id.to_string(), proportion)
        })
        .collect()
}

fn derive_from_average(on_devices: &[(&str, u8)]) -> HashMap<String, f64> {
    let total: f64 = on_devices.iter().map(|(_, b)| f64::from(*b)).sum();
    let average = total / on_devices.len() as f64;
    on_devices
        .iter()
        .map(|(id, brightness)| {
            let proportion = if average > 0.0 {
                f64::from(*brightness) / average
            } else {
                DEFAULT_PROPORTION
            };
            (id.to_string(), proportion)
        })
        .collect()
}

fn to_level(value: f64) -> u8 {
    value.clamp(f64::from(FLOOR), f64::from(FULL)) as u8
}
