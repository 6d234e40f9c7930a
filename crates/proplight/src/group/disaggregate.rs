//! Turn one group command into per-device commands.

use std::collections::HashMap;

use tracing::debug;
use tracing::warn;

use super::color;
use super::proportion::ProportionTracker;
use crate::engine::message::DeviceCommand;
use crate::engine::message::GroupCommand;
use crate::engine::message::LightAttribute;
use crate::engine::message::TurnOn;
use crate::engine::state::DeviceSnapshot;

/// One command addressed to one member device.
pub type Dispatch = (String, DeviceCommand);

/// Plan the device commands for a group command.
///
/// `members` is the configured member list; `devices` holds the snapshots of
/// the members that are currently available. Turn-off goes to every member,
/// turn-on only to available ones.
pub fn disaggregate(
    command: &GroupCommand,
    members: &[String],
    devices: &[DeviceSnapshot],
    group_brightness: Option<u8>,
    hue_offsets: &HashMap<String, f64>,
    tracker: &mut ProportionTracker,
) -> Vec<Dispatch> {
    match command {
        GroupCommand::TurnOff => members
            .iter()
            .map(|id| (id.clone(), DeviceCommand::TurnOff))
            .collect(),
        GroupCommand::TurnOn(turn_on) => {
            turn_on_commands(turn_on, devices, group_brightness, hue_offsets, tracker)
        }
    }
}

fn turn_on_commands(
    turn_on: &TurnOn,
    devices: &[DeviceSnapshot],
    group_brightness: Option<u8>,
    hue_offsets: &HashMap<String, f64>,
    tracker: &mut ProportionTracker,
) -> Vec<Dispatch> {
    let attribute = turn_on.attribute();
    let on_devices: Vec<&DeviceSnapshot> = devices.iter().filter(|d| d.on).collect();

    if on_devices.is_empty() {
        let brightness = turn_on.target_brightness().unwrap_or(u8::MAX);
        debug!(
            "No lights on, turning on all {} at brightness {}",
            devices.len(),
            brightness
        );
        return devices
            .iter()
            .map(|d| {
                let command = DeviceCommand::TurnOn {
                    brightness: Some(brightness),
                    attribute: device_attribute(attribute.as_ref(), &d.id, hue_offsets),
                };
                (d.id.clone(), command)
            })
            .collect();
    }

    let target = turn_on
        .target_brightness()
        .or(group_brightness.filter(|b| *b > 0))
        .unwrap_or(u8::MAX);
    let current: Vec<(&str, u8)> = on_devices
        .iter()
        .map(|d| (d.id.as_str(), d.effective_brightness()))
        .collect();
    let targets = tracker.compute_targets(&current, target);
    debug!(
        "Scaling {} on lights to {}: {:?}",
        on_devices.len(),
        target,
        targets.brightness
    );

    on_devices
        .iter()
        .map(|d| {
            let command = DeviceCommand::TurnOn {
                brightness: targets.brightness.get(&d.id).copied(),
                attribute: device_attribute(attribute.as_ref(), &d.id, hue_offsets),
            };
            (d.id.clone(), command)
        })
        .collect()
}

/// Translate the group's requested attribute into what one device should receive.
///
/// Colors that can be expressed as a hue are rotated by the device's hue
/// offset; everything else is forwarded unchanged.
pub fn device_attribute(
    attribute: Option<&LightAttribute>,
    device_id: &str,
    hue_offsets: &HashMap<String, f64>,
) -> Option<LightAttribute> {
    let attribute = attribute?;
    let offset = match hue_offsets.get(device_id).copied() {
        Some(offset) if offset != 0.0 => offset,
        _ => return Some(attribute.clone()),
    };

    let adjusted = match attribute {
        LightAttribute::Hs(h, s) => LightAttribute::Hs(color::shift_hue(*h, offset), *s),
        LightAttribute::Rgb(rgb) => LightAttribute::Rgb(color::shift_rgb_hue(*rgb, offset)),
        LightAttribute::Xy(x, y) => match shifted_xy(*x, *y, offset) {
            Some((x, y)) => LightAttribute::Xy(x, y),
            None => {
                warn!(
                    "Cannot apply hue offset to xy ({}, {}) for {}, sending unchanged",
                    x, y, device_id
                );
                attribute.clone()
            }
        },
        LightAttribute::Effect(_)
        | LightAttribute::ColorTemp(_)
        | LightAttribute::Rgbw(_)
        | LightAttribute::Rgbww(_) => attribute.clone(),
    };

    Some(adjusted)
}

fn shifted_xy(x: f64, y: f64, offset: f64) -> Option<(f64, f64)> {
    let (h, s) = color::xy_to_hs(x, y)?;
    color::hs_to_xy(color::shift_hue(h, offset), s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light(id: &str, on: bool, brightness: u8) -> DeviceSnapshot {
        DeviceSnapshot {
            on,
            brightness: Some(brightness),
            ..DeviceSnapshot::new(id)
        }
    }

    fn members(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn brightness_of(plan: &[Dispatch], id: &str) -> Option<u8> {
        plan.iter().find(|(d, _)| d == id).and_then(|(_, cmd)| match cmd {
            DeviceCommand::TurnOn { brightness, .. } => *brightness,
            DeviceCommand::TurnOff => None,
        })
    }

    #[test]
    fn test_turn_off_targets_every_member() {
        let mut tracker = ProportionTracker::new();
        let devices = [light("a", true, 100)];
        let plan = disaggregate(
            &GroupCommand::TurnOff,
            &members(&["a", "b", "unavailable"]),
            &devices,
            Some(100),
            &HashMap::new(),
            &mut tracker,
        );
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|(_, cmd)| *cmd == DeviceCommand::TurnOff));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_turn_on_when_all_off_uses_same_level_everywhere() {
        let mut tracker = ProportionTracker::new();
        let devices = [light("a", false, 10), light("b", false, 200)];
        let plan = disaggregate(
            &GroupCommand::TurnOn(TurnOn::default()),
            &members(&["a", "b"]),
            &devices,
            None,
            &HashMap::new(),
            &mut tracker,
        );
        assert_eq!(brightness_of(&plan, "a"), Some(255));
        assert_eq!(brightness_of(&plan, "b"), Some(255));

        let plan = disaggregate(
            &GroupCommand::TurnOn(TurnOn::brightness(40)),
            &members(&["a", "b"]),
            &devices,
            None,
            &HashMap::new(),
            &mut tracker,
        );
        assert_eq!(brightness_of(&plan, "a"), Some(40));
        assert_eq!(brightness_of(&plan, "b"), Some(40));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_turn_on_scales_only_on_devices() {
        let mut tracker = ProportionTracker::new();
        tracker.observe(&[("a", 200), ("b", 100)], 200);
        let devices = [
            light("a", true, 200),
            light("b", true, 100),
            light("c", false, 0),
        ];

        let plan = disaggregate(
            &GroupCommand::TurnOn(TurnOn::brightness(100)),
            &members(&["a", "b", "c"]),
            &devices,
            Some(200),
            &HashMap::new(),
            &mut tracker,
        );
        assert_eq!(plan.len(), 2);
        assert_eq!(brightness_of(&plan, "a"), Some(100));
        assert_eq!(brightness_of(&plan, "b"), Some(50));
        assert_eq!(brightness_of(&plan, "c"), None);
    }

    #[test]
    fn test_turn_on_without_brightness_keeps_group_level() {
        let mut tracker = ProportionTracker::new();
        tracker.observe(&[("a", 120), ("b", 60)], 120);
        let devices = [light("a", true, 120), light("b", true, 60)];

        let plan = disaggregate(
            &GroupCommand::TurnOn(TurnOn {
                hs_color: Some((200.0, 70.0)),
                ..Default::default()
            }),
            &members(&["a", "b"]),
            &devices,
            Some(120),
            &HashMap::new(),
            &mut tracker,
        );
        assert_eq!(brightness_of(&plan, "a"), Some(120));
        assert_eq!(brightness_of(&plan, "b"), Some(60));
    }

    #[test]
    fn test_floor_target() {
        let mut tracker = ProportionTracker::new();
        tracker.observe(&[("a", 255), ("b", 30)], 255);
        let devices = [light("a", true, 255), light("b", true, 30)];

        let plan = disaggregate(
            &GroupCommand::TurnOn(TurnOn::brightness(1)),
            &members(&["a", "b"]),
            &devices,
            Some(255),
            &HashMap::new(),
            &mut tracker,
        );
        assert_eq!(brightness_of(&plan, "a"), Some(1));
        assert_eq!(brightness_of(&plan, "b"), Some(1));
    }

    #[test]
    fn test_hue_offset_is_added() {
        let offsets = HashMap::from([("a".to_string(), 30.0), ("b".to_string(), -20.0)]);
        let hs = LightAttribute::Hs(350.0, 80.0);

        assert_eq!(
            device_attribute(Some(&hs), "a", &offsets),
            Some(LightAttribute::Hs(20.0, 80.0))
        );
        assert_eq!(
            device_attribute(Some(&hs), "b", &offsets),
            Some(LightAttribute::Hs(330.0, 80.0))
        );
        assert_eq!(device_attribute(Some(&hs), "c", &offsets), Some(hs.clone()));
        assert_eq!(device_attribute(None, "a", &offsets), None);
    }

    #[test]
    fn test_offsets_leave_non_hue_attributes_alone() {
        let offsets = HashMap::from([("a".to_string(), 90.0)]);
        for attribute in [
            LightAttribute::Effect("rainbow".to_string()),
            LightAttribute::ColorTemp(2700),
            LightAttribute::Rgbw((1, 2, 3, 4)),
            LightAttribute::Rgbww((1, 2, 3, 4, 5)),
        ] {
            assert_eq!(
                device_attribute(Some(&attribute), "a", &offsets),
                Some(attribute.clone())
            );
        }
    }

    #[test]
    fn test_rgb_offset_round_trips_through_hue() {
        let offsets = HashMap::from([("a".to_string(), 120.0)]);
        let red = LightAttribute::Rgb((255, 0, 0));
        assert_eq!(
            device_attribute(Some(&red), "a", &offsets),
            Some(LightAttribute::Rgb((0, 255, 0)))
        );

        // Value (brightness of the color) is preserved
        let dim_red = LightAttribute::Rgb((128, 0, 0));
        assert_eq!(
            device_attribute(Some(&dim_red), "a", &offsets),
            Some(LightAttribute::Rgb((0, 128, 0)))
        );
    }

    #[test]
    fn test_xy_offset() {
        let offsets = HashMap::from([("a".to_string(), 240.0)]);
        let red = LightAttribute::Xy(0.701, 0.299);
        let Some(LightAttribute::Xy(x, y)) = device_attribute(Some(&red), "a", &offsets) else {
            panic!("expected xy");
        };
        // Red rotated by 240 degrees is blue
        assert!((x - 0.136).abs() < 0.002, "x = {x}");
        assert!((y - 0.04).abs() < 0.002, "y = {y}");
    }

    #[test]
    fn test_xy_offset_falls_back_when_unconvertible() {
        let offsets = HashMap::from([("a".to_string(), 45.0)]);
        let bogus = LightAttribute::Xy(0.3, 0.0);
        assert_eq!(
            device_attribute(Some(&bogus), "a", &offsets),
            Some(bogus.clone())
        );
    }
}
