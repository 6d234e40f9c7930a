//! In-memory lights.
//!
//! [`SimulatedRegistry`] behaves like a registry backed by real devices:
//! commands change the stored snapshots and every change is published on the
//! event bus, so group controllers see their own commands come back as state
//! updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use tracing::info;

use crate::engine::message::DeviceChange;
use crate::engine::message::DeviceCommand;
use crate::engine::message::DispatchError;
use crate::engine::message::LightAttribute;
use crate::engine::registry::DeviceRegistry;
use crate::engine::registry::LocalEventBus;
use crate::engine::state::Capability;
use crate::engine::state::DeviceSnapshot;
use crate::group::color;

/// A simulated light and its failure behaviour.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimulatedDevice {
    pub snapshot: DeviceSnapshot,

    /// Refuse every command with [`DispatchError::Rejected`].
    pub reject_commands: bool,

    /// Time a command takes before it is applied.
    pub latency: Duration,
}

impl SimulatedDevice {
    pub fn new(snapshot: DeviceSnapshot) -> Self {
        Self {
            snapshot,
            ..Default::default()
        }
    }
}

pub struct SimulatedRegistry {
    devices: Mutex<HashMap<String, SimulatedDevice>>,
    bus: Arc<LocalEventBus>,
}

impl SimulatedRegistry {
    pub fn new(bus: Arc<LocalEventBus>) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<LocalEventBus> {
        &self.bus
    }

    /// Add a device, or replace an existing one, publishing the change.
    pub fn insert(&self, device: SimulatedDevice) {
        let change = {
            let Ok(mut devices) = self.devices.lock() else {
                return;
            };
            let new = device.snapshot.clone();
            let old = devices
                .insert(new.id.clone(), device)
                .map(|previous| previous.snapshot);
            DeviceChange {
                device_id: new.id.clone(),
                old,
                new,
            }
        };
        self.publish(change);
    }

    /// Remove a device; it becomes unavailable to every group.
    pub fn remove(&self, device_id: &str) -> Option<SimulatedDevice> {
        self.devices.lock().ok()?.remove(device_id)
    }

    /// Change a device's state from outside, like a wall switch would.
    ///
    /// Returns false if the device is unknown.
    pub fn update<F>(&self, device_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut DeviceSnapshot),
    {
        let change = {
            let Ok(mut devices) = self.devices.lock() else {
                return false;
            };
            let Some(device) = devices.get_mut(device_id) else {
                return false;
            };
            let old = device.snapshot.clone();
            f(&mut device.snapshot);
            DeviceChange {
                device_id: device_id.to_string(),
                old: Some(old),
                new: device.snapshot.clone(),
            }
        };
        self.publish(change);
        true
    }

    pub fn set_reject_commands(&self, device_id: &str, reject: bool) -> bool {
        match self.devices.lock() {
            Ok(mut devices) => match devices.get_mut(device_id) {
                Some(device) => {
                    device.reject_commands = reject;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .lock()
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn publish(&self, change: DeviceChange) {
        if change.old.as_ref() == Some(&change.new) {
            return;
        }
        self.bus.publish(change);
    }

    fn lookup(&self, device_id: &str) -> Result<(bool, Duration), DispatchError> {
        let devices = self
            .devices
            .lock()
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;
        devices
            .get(device_id)
            .map(|d| (d.reject_commands, d.latency))
            .ok_or_else(|| DispatchError::UnknownDevice(device_id.to_string()))
    }
}

#[async_trait]
impl DeviceRegistry for SimulatedRegistry {
    fn get_snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices
            .lock()
            .ok()?
            .get(device_id)
            .map(|d| d.snapshot.clone())
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<(), DispatchError> {
        let (reject, latency) = self.lookup(device_id)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if reject {
            info!("[{}] Rejecting {:?}", device_id, command);
            return Err(DispatchError::Rejected {
                device_id: device_id.to_string(),
                reason: "simulated rejection".to_string(),
            });
        }

        debug!("[{}] Applying {:?}", device_id, command);
        if self.update(device_id, |snapshot| apply(snapshot, &command)) {
            Ok(())
        } else {
            Err(DispatchError::UnknownDevice(device_id.to_string()))
        }
    }
}

/// Apply a command the way a real light reports its new state.
pub fn apply(snapshot: &mut DeviceSnapshot, command: &DeviceCommand) {
    let (brightness, attribute) = match command {
        DeviceCommand::TurnOff => {
            snapshot.on = false;
            return;
        }
        DeviceCommand::TurnOn {
            brightness,
            attribute,
        } => (brightness, attribute),
    };

    snapshot.on = true;
    if let Some(brightness) = brightness {
        snapshot.brightness = Some(*brightness);
    } else if snapshot.brightness.is_none() {
        snapshot.brightness = Some(u8::MAX);
    }

    let Some(attribute) = attribute else {
        return;
    };
    if let LightAttribute::Effect(effect) = attribute {
        snapshot.effect = Some(effect.clone());
        return;
    }

    snapshot.effect = None;
    snapshot.hs_color = None;
    snapshot.rgb_color = None;
    snapshot.xy_color = None;
    snapshot.color_temp_kelvin = None;
    snapshot.color_temp_mired = None;

    match attribute {
        LightAttribute::Hs(h, s) => {
            snapshot.color_mode = Some(Capability::Hs);
            snapshot.hs_color = Some((*h, *s));
            snapshot.rgb_color = Some(color::hs_to_rgb(*h, *s));
        }
        LightAttribute::ColorTemp(kelvin) => {
            let kelvin = clamp_kelvin(snapshot, *kelvin);
            snapshot.color_mode = Some(Capability::ColorTemp);
            snapshot.color_temp_kelvin = Some(kelvin);
            snapshot.color_temp_mired = Some(1_000_000 / kelvin.max(1));
        }
        LightAttribute::Rgb(rgb) => set_rgb(snapshot, Capability::Rgb, *rgb),
        LightAttribute::Rgbw((r, g, b, _)) => set_rgb(snapshot, Capability::Rgbw, (*r, *g, *b)),
        LightAttribute::Rgbww((r, g, b, _, _)) => {
            set_rgb(snapshot, Capability::Rgbww, (*r, *g, *b))
        }
        LightAttribute::Xy(x, y) => {
            snapshot.color_mode = Some(Capability::Xy);
            snapshot.xy_color = Some((*x, *y));
            snapshot.hs_color = color::xy_to_hs(*x, *y);
        }
        LightAttribute::Effect(_) => {}
    }
}

fn set_rgb(snapshot: &mut DeviceSnapshot, mode: Capability, (r, g, b): (u8, u8, u8)) {
    snapshot.color_mode = Some(mode);
    snapshot.rgb_color = Some((r, g, b));
    snapshot.hs_color = Some(color::rgb_to_hs(f64::from(r), f64::from(g), f64::from(b)));
}

fn clamp_kelvin(snapshot: &DeviceSnapshot, kelvin: u32) -> u32 {
    let min = snapshot.min_color_temp_kelvin.unwrap_or(0);
    let max = snapshot.max_color_temp_kelvin.unwrap_or(u32::MAX);
    if min <= max {
        kelvin.clamp(min, max)
    } else {
        kelvin
    }
}
