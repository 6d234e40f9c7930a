//! Reduce member device states into one group light state.

use std::collections::BTreeSet;
use std::collections::HashMap;

use tracing::debug;
use tracing::trace;

use super::color;
use super::proportion::ProportionTracker;
use crate::engine::state::Capability;
use crate::engine::state::DeviceSnapshot;
use crate::engine::state::GroupSnapshot;

/// Saturation (percent) at or below which a reported hue/saturation is white.
const WHITE_SATURATION: f64 = 5.0;

/// Minimum channel spread for a reported RGB value to count as colored.
const WHITE_RGB_SPREAD: u8 = 10;

/// Capability fields of a group, computed over every available member.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SupportedFeatures {
    pub modes: BTreeSet<Capability>,
    pub effect_list: Vec<String>,
    pub min_color_temp_kelvin: Option<u32>,
    pub max_color_temp_kelvin: Option<u32>,
}

/// Color-related part of a group state; at most one field is set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColorState {
    pub hs_color: Option<(f64, f64)>,
    pub color_temp_kelvin: Option<u32>,
    pub effect: Option<String>,
}

/// Aggregate the snapshots of all available members into a group snapshot.
///
/// Brightness readings of on devices are fed into `tracker` as one batch.
pub fn aggregate(
    devices: &[DeviceSnapshot],
    hue_offsets: &HashMap<String, f64>,
    tracker: &mut ProportionTracker,
) -> GroupSnapshot {
    if devices.is_empty() {
        return GroupSnapshot::default();
    }

    let on_devices: Vec<&DeviceSnapshot> = devices.iter().filter(|d| d.on).collect();
    debug!(
        "Found {} lights on out of {} total",
        on_devices.len(),
        devices.len()
    );

    let features = supported_features(devices);
    let mut group = GroupSnapshot {
        on: !on_devices.is_empty(),
        supported_modes: features.modes,
        effect_list: features.effect_list,
        min_color_temp_kelvin: features.min_color_temp_kelvin,
        max_color_temp_kelvin: features.max_color_temp_kelvin,
        ..Default::default()
    };

    if on_devices.is_empty() {
        return group;
    }

    let brightness = group_brightness(&on_devices);
    if brightness > 0 {
        let readings: Vec<(&str, u8)> = on_devices
            .iter()
            .map(|d| (d.id.as_str(), d.effective_brightness()))
            .collect();
        tracker.observe(&readings, brightness);
    }
    group.brightness = Some(brightness);

    let color = color_and_effect(&on_devices, hue_offsets);
    group.hs_color = color.hs_color;
    group.color_temp_kelvin = color.color_temp_kelvin;
    group.effect = color.effect;

    group
}

/// The group's representative brightness: its brightest on member.
pub fn group_brightness(on_devices: &[&DeviceSnapshot]) -> u8 {
    on_devices
        .iter()
        .map(|d| d.effective_brightness())
        .max()
        .unwrap_or(0)
}

/// Work out the group's effect, color or color temperature from its on members.
pub fn color_and_effect(
    on_devices: &[&DeviceSnapshot],
    hue_offsets: &HashMap<String, f64>,
) -> ColorState {
    if on_devices.is_empty() {
        return ColorState::default();
    }

    if let Some(effect) = on_devices.iter().find_map(|d| d.active_effect()) {
        debug!("Found active effect: {}", effect);
        return ColorState {
            effect: Some(effect.to_string()),
            ..Default::default()
        };
    }

    let collected: Vec<(f64, f64)> = on_devices
        .iter()
        .filter_map(|d| representative_color(d, hue_offsets))
        .collect();

    if let Some(average) = color::average_colors(&collected) {
        debug!("Averaged {} colors to {:?}", collected.len(), average);
        return ColorState {
            hs_color: Some(average),
            ..Default::default()
        };
    }

    let first_temperature = on_devices.iter().find_map(|d| reported_kelvin(d));
    let kelvin = first_temperature.unwrap_or(color::DEFAULT_KELVIN);
    debug!("Using color temperature {}K", kelvin);

    ColorState {
        color_temp_kelvin: Some(kelvin),
        ..Default::default()
    }
}

/// The color one on device contributes to the group average, if any.
///
/// Only the first representation the device reports is considered, in the
/// order hs, rgb, xy, Kelvin, mired. A white hs or rgb reading contributes
/// nothing; xy readings are not converted.
fn representative_color(
    device: &DeviceSnapshot,
    hue_offsets: &HashMap<String, f64>,
) -> Option<(f64, f64)> {
    if let (true, Some((hue, saturation))) = (device.supports_true_color(), device.hs_color) {
        if saturation <= WHITE_SATURATION {
            trace!(
                "{} reports low saturation ({:.1}%), treating as white",
                device.id, saturation
            );
            return None;
        }
        let hue = match hue_offsets.get(&device.id) {
            Some(offset) => color::shift_hue(hue, -offset),
            None => hue,
        };
        return Some((hue, saturation));
    }

    if let Some((r, g, b)) = device.rgb_color {
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        if max == 0 || max - min <= WHITE_RGB_SPREAD {
            trace!("{} reports white rgb {:?}", device.id, (r, g, b));
            return None;
        }
        return Some(color::rgb_to_hs(f64::from(r), f64::from(g), f64::from(b)));
    }

    if let Some(xy) = device.xy_color {
        trace!("{} reports xy {:?}, skipping", device.id, xy);
        return None;
    }

    if let Some(kelvin) = device.color_temp_kelvin.filter(|k| *k > 0) {
        return Some(color::kelvin_to_hs(kelvin));
    }

    device
        .color_temp_mired
        .filter(|m| *m > 0)
        .map(|mired| color::kelvin_to_hs(color::mired_to_kelvin(f64::from(mired))))
}

fn reported_kelvin(device: &DeviceSnapshot) -> Option<u32> {
    if let Some(kelvin) = device.color_temp_kelvin.filter(|k| *k > 0) {
        return Some(kelvin);
    }
    device
        .color_temp_mired
        .filter(|m| *m > 0)
        .map(|mired| color::mired_to_kelvin(f64::from(mired)))
}

/// Capabilities the group can promise, computed from every member (on or off).
pub fn supported_features(devices: &[DeviceSnapshot]) -> SupportedFeatures {
    let mut modes: BTreeSet<Capability> = devices
        .iter()
        .flat_map(|d| d.supported_modes.iter().copied())
        .collect();

    let color_modes = modes.iter().filter(|m| m.is_color_mode()).count();
    if color_modes > 1 {
        modes.remove(&Capability::OnOff);
    }
    if color_modes == 0 {
        modes.insert(Capability::Brightness);
    }

    let effects: BTreeSet<&String> = devices.iter().flat_map(|d| &d.effect_list).collect();

    let min_color_temp_kelvin = devices
        .iter()
        .filter_map(|d| d.min_color_temp_kelvin.filter(|k| *k > 0))
        .max();
    let max_color_temp_kelvin = devices
        .iter()
        .filter_map(|d| d.max_color_temp_kelvin.filter(|k| *k > 0))
        .min();

    SupportedFeatures {
        modes,
        effect_list: effects.into_iter().cloned().collect(),
        min_color_temp_kelvin,
        max_color_temp_kelvin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light(id: &str, on: bool, brightness: Option<u8>) -> DeviceSnapshot {
        DeviceSnapshot {
            on,
            brightness,
            supported_modes: [Capability::Hs, Capability::ColorTemp].into(),
            ..DeviceSnapshot::new(id)
        }
    }

    fn no_offsets() -> HashMap<String, f64> {
        HashMap::new()
    }

    #[test]
    fn test_no_devices_is_all_absent() {
        let mut tracker = ProportionTracker::new();
        let group = aggregate(&[], &no_offsets(), &mut tracker);
        assert_eq!(group, GroupSnapshot::default());
        assert!(group.supported_modes.is_empty());
    }

    #[test]
    fn test_all_off_clears_state_but_keeps_capabilities() {
        let mut tracker = ProportionTracker::new();
        let devices = [
            DeviceSnapshot {
                effect_list: vec!["rainbow".to_string()],
                min_color_temp_kelvin: Some(2000),
                max_color_temp_kelvin: Some(6500),
                ..light("a", false, Some(100))
            },
            light("b", false, None),
        ];

        let group = aggregate(&devices, &no_offsets(), &mut tracker);
        assert!(!group.on);
        assert_eq!(group.brightness, None);
        assert_eq!(group.hs_color, None);
        assert_eq!(group.color_temp_kelvin, None);
        assert_eq!(group.effect, None);
        assert_eq!(
            group.supported_modes,
            [Capability::ColorTemp, Capability::Hs].into()
        );
        assert_eq!(group.effect_list, vec!["rainbow".to_string()]);
        assert_eq!(group.min_color_temp_kelvin, Some(2000));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_brightness_is_max_of_on_devices() {
        let mut tracker = ProportionTracker::new();
        let devices = [
            light("a", true, Some(40)),
            light("b", true, Some(180)),
            light("c", false, Some(255)),
        ];
        let group = aggregate(&devices, &no_offsets(), &mut tracker);
        assert!(group.on);
        assert_eq!(group.brightness, Some(180));

        let b = tracker.get("b").unwrap();
        assert_eq!(b, 1.0);
        assert!((tracker.get("a").unwrap() - 40.0 / 180.0).abs() < 1e-9);
        assert_eq!(tracker.get("c"), None);
    }

    #[test]
    fn test_missing_brightness_counts_as_full() {
        let mut tracker = ProportionTracker::new();
        let devices = [light("a", true, None), light("b", true, Some(51))];
        let group = aggregate(&devices, &no_offsets(), &mut tracker);
        assert_eq!(group.brightness, Some(255));
        assert_eq!(tracker.get("b"), Some(0.2));
    }

    #[test]
    fn test_active_effect_wins_over_color() {
        let devices = [
            DeviceSnapshot {
                hs_color: Some((120.0, 90.0)),
                ..light("a", true, Some(100))
            },
            DeviceSnapshot {
                effect: Some("rainbow".to_string()),
                ..light("b", true, Some(100))
            },
        ];
        let on: Vec<&DeviceSnapshot> = devices.iter().collect();
        let state = color_and_effect(&on, &no_offsets());
        assert_eq!(state.effect.as_deref(), Some("rainbow"));
        assert_eq!(state.hs_color, None);
        assert_eq!(state.color_temp_kelvin, None);
    }

    #[test]
    fn test_effect_off_is_ignored() {
        let devices = [DeviceSnapshot {
            hs_color: Some((120.0, 90.0)),
            effect: Some("off".to_string()),
            ..light("a", true, Some(100))
        }];
        let on: Vec<&DeviceSnapshot> = devices.iter().collect();
        let state = color_and_effect(&on, &no_offsets());
        assert_eq!(state.effect, None);
        assert_eq!(state.hs_color, Some((120.0, 90.0)));
    }

    #[test]
    fn test_hue_offset_is_removed() {
        let devices = [DeviceSnapshot {
            hs_color: Some((10.0, 80.0)),
            ..light("a", true, Some(100))
        }];
        let offsets = HashMap::from([("a".to_string(), 30.0)]);
        let on: Vec<&DeviceSnapshot> = devices.iter().collect();
        let state = color_and_effect(&on, &offsets);
        assert_eq!(state.hs_color, Some((340.0, 80.0)));
    }

    #[test]
    fn test_colors_are_averaged() {
        let devices = [
            DeviceSnapshot {
                hs_color: Some((0.0, 100.0)),
                ..light("a", true, Some(100))
            },
            DeviceSnapshot {
                supported_modes: [Capability::Rgb].into(),
                rgb_color: Some((0, 0, 255)),
                ..light("b", true, Some(100))
            },
        ];
        let on: Vec<&DeviceSnapshot> = devices.iter().collect();
        let (h, s) = color_and_effect(&on, &no_offsets()).hs_color.unwrap();
        assert!((h - 300.0).abs() < 1e-9);
        assert!((s - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_white_readings_contribute_nothing() {
        let devices = [
            DeviceSnapshot {
                hs_color: Some((30.0, 4.0)),
                color_temp_kelvin: Some(4000),
                ..light("a", true, Some(100))
            },
            DeviceSnapshot {
                supported_modes: [Capability::Rgb].into(),
                rgb_color: Some((250, 245, 240)),
                ..light("b", true, Some(100))
            },
        ];
        let on: Vec<&DeviceSnapshot> = devices.iter().collect();
        let state = color_and_effect(&on, &no_offsets());
        assert_eq!(state.hs_color, None);
        assert_eq!(state.color_temp_kelvin, Some(4000));
    }

    #[test]
    fn test_kelvin_only_device_contributes_a_color() {
        let devices = [DeviceSnapshot {
            supported_modes: [Capability::ColorTemp].into(),
            color_temp_kelvin: Some(2700),
            ..light("a", true, Some(100))
        }];
        let on: Vec<&DeviceSnapshot> = devices.iter().collect();
        let state = color_and_effect(&on, &no_offsets());
        assert_eq!(state.hs_color, Some(color::kelvin_to_hs(2700)));
        assert_eq!(state.color_temp_kelvin, None);
    }

    #[test]
    fn test_legacy_mired_is_converted() {
        let devices = [DeviceSnapshot {
            supported_modes: [Capability::ColorTemp].into(),
            color_temp_mired: Some(250),
            ..light("a", true, Some(100))
        }];
        let on: Vec<&DeviceSnapshot> = devices.iter().collect();
        let state = color_and_effect(&on, &no_offsets());
        assert_eq!(state.hs_color, Some(color::kelvin_to_hs(4000)));
    }

    #[test]
    fn test_xy_is_skipped() {
        let devices = [DeviceSnapshot {
            supported_modes: [Capability::Xy].into(),
            xy_color: Some((0.7, 0.3)),
            color_temp_kelvin: Some(2700),
            ..light("a", true, Some(100))
        }];
        let on: Vec<&DeviceSnapshot> = devices.iter().collect();
        let state = color_and_effect(&on, &no_offsets());
        assert_eq!(state.hs_color, None);
        assert_eq!(state.color_temp_kelvin, Some(2700));
    }

    #[test]
    fn test_no_color_information_defaults_to_warm_white() {
        let devices = [
            DeviceSnapshot {
                supported_modes: [Capability::Brightness].into(),
                ..light("a", true, Some(100))
            },
            light("b", true, Some(20)),
        ];
        let mut tracker = ProportionTracker::new();
        let group = aggregate(&devices, &no_offsets(), &mut tracker);
        assert_eq!(group.hs_color, None);
        assert_eq!(group.color_temp_kelvin, Some(3000));
    }

    #[test]
    fn test_supported_features() {
        let devices = [
            DeviceSnapshot {
                supported_modes: [Capability::OnOff].into(),
                ..DeviceSnapshot::new("plug")
            },
            DeviceSnapshot {
                supported_modes: [Capability::ColorTemp, Capability::Effects].into(),
                effect_list: vec!["candle".to_string(), "blink".to_string()],
                min_color_temp_kelvin: Some(2200),
                max_color_temp_kelvin: Some(6500),
                ..DeviceSnapshot::new("a")
            },
            DeviceSnapshot {
                supported_modes: [Capability::Hs].into(),
                effect_list: vec!["blink".to_string(), "rainbow".to_string()],
                min_color_temp_kelvin: Some(2000),
                max_color_temp_kelvin: Some(5000),
                ..DeviceSnapshot::new("b")
            },
        ];

        let features = supported_features(&devices);
        assert_eq!(
            features.modes,
            [Capability::ColorTemp, Capability::Hs, Capability::Effects].into()
        );
        assert_eq!(features.effect_list, vec!["blink", "candle", "rainbow"]);
        assert_eq!(features.min_color_temp_kelvin, Some(2200));
        assert_eq!(features.max_color_temp_kelvin, Some(5000));
    }

    #[test]
    fn test_supported_features_defaults() {
        let features = supported_features(&[DeviceSnapshot::new("a")]);
        assert_eq!(features.modes, [Capability::Brightness].into());
        assert!(features.effect_list.is_empty());
        assert_eq!(features.min_color_temp_kelvin, None);

        let features = supported_features(&[DeviceSnapshot {
            supported_modes: [Capability::OnOff].into(),
            ..DeviceSnapshot::new("a")
        }]);
        assert_eq!(features.modes, [Capability::OnOff].into());
    }
}
