use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;

use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

use super::controller::ControllerSettings;
use super::controller::GroupController;
use super::controller::GroupHandle;
use super::controller::Membership;
use super::registry::DeviceRegistry;
use super::registry::EventBus;
use crate::config::Config;

/// A running group as seen from outside the engine.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub handle: GroupHandle,
}

struct Entry {
    group: Group,
    membership: Membership,
    task: JoinHandle<()>,
}

/// proplight engine
///
/// Owns one controller per light group, keyed by group id, and the shared
/// collaborators they talk to.
pub struct Engine {
    registry: Arc<dyn DeviceRegistry>,
    bus: Arc<dyn EventBus>,
    settings: Mutex<ControllerSettings>,
    groups: RwLock<BTreeMap<String, Entry>>,
}

impl Engine {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        bus: Arc<dyn EventBus>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            registry,
            bus,
            settings: Mutex::new(settings),
            groups: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create an engine and start every group in the configuration.
    pub fn from_config(
        cfg: &Config,
        registry: Arc<dyn DeviceRegistry>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let engine = Self::new(registry, bus, ControllerSettings::from(&cfg.controller));
        for (id, group) in &cfg.groups {
            engine.start_group(id.clone(), group.name.clone(), group.membership());
        }
        engine
    }

    /// Spawn a controller for a group, replacing any group with the same id.
    pub fn start_group(&self, id: String, name: String, membership: Membership) -> GroupHandle {
        let settings = *self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        let (handle, task) = GroupController::spawn(
            id.clone(),
            membership.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.bus),
            settings,
        );

        let entry = Entry {
            group: Group {
                id: id.clone(),
                name,
                handle: handle.clone(),
            },
            membership,
            task,
        };

        let previous = self
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), entry);
        if let Some(previous) = previous {
            warn!("Group '{}' replaced while running", id);
            previous.task.abort();
        }

        info!("Started group '{}'", id);
        handle
    }

    pub fn group(&self, id: &str) -> Option<Group> {
        self.groups
            .read()
            .ok()?
            .get(id)
            .map(|entry| entry.group.clone())
    }

    /// All groups, ordered by id.
    pub fn groups(&self) -> Vec<Group> {
        self.groups
            .read()
            .map(|groups| groups.values().map(|e| e.group.clone()).collect())
            .unwrap_or_default()
    }

    /// Bring the running groups in line with a reloaded configuration.
    ///
    /// New groups are started, removed ones stopped, and groups whose members
    /// or hue offsets changed are reconfigured in place. Controller timing
    /// changes take effect for groups started from now on.
    pub async fn apply_config(&self, cfg: &Config) {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) =
            ControllerSettings::from(&cfg.controller);

        let mut removed = Vec::new();
        let mut changed = Vec::new();
        let mut added = Vec::new();
        {
            let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);

            let stale: Vec<String> = groups
                .keys()
                .filter(|id| !cfg.groups.contains_key(*id))
                .cloned()
                .collect();
            for id in stale {
                if let Some(entry) = groups.remove(&id) {
                    removed.push(entry);
                }
            }

            for (id, group) in &cfg.groups {
                let membership = group.membership();
                match groups.get_mut(id) {
                    Some(entry) => {
                        entry.group.name = group.name.clone();
                        if entry.membership != membership {
                            entry.membership = membership.clone();
                            changed.push((entry.group.handle.clone(), membership));
                        }
                    }
                    None => added.push((id.clone(), group.name.clone(), membership)),
                }
            }
        }

        for entry in removed {
            info!("Stopping removed group '{}'", entry.group.id);
            stop(entry).await;
        }

        for (handle, membership) in changed {
            info!("Reconfiguring group '{}'", handle.id());
            if let Err(e) = handle.reconfigure(membership).await {
                warn!("Failed to reconfigure group: {}", e);
            }
        }

        for (id, name, membership) in added {
            self.start_group(id, name, membership);
        }
    }

    /// Stop every group controller and wait for them to finish.
    pub async fn shutdown(&self) {
        let entries: Vec<Entry> = {
            let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *groups).into_values().collect()
        };

        info!("Engine shutting down {} groups", entries.len());
        for entry in entries {
            stop(entry).await;
        }
    }
}

async fn stop(entry: Entry) {
    if let Err(e) = entry.group.handle.shutdown().await {
        warn!("Group '{}' already stopped: {}", entry.group.id, e);
    }
    if let Err(e) = entry.task.await {
        warn!("Group '{}' task failed: {}", entry.group.id, e);
    }
}
