use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::message::CommandReport;
use super::message::DeviceChange;
use super::message::DeviceFailure;
use super::message::DispatchError;
use super::message::GroupCommand;
use super::registry::DeviceChangeReceiver;
use super::registry::DeviceChangeSender;
use super::registry::DeviceRegistry;
use super::registry::EventBus;
use super::registry::SubscriptionId;
use super::state::DeviceSnapshot;
use super::state::GroupSnapshot;
use crate::group::aggregate;
use crate::group::disaggregate;
use crate::group::disaggregate::Dispatch;
use crate::group::proportion::ProportionTracker;

/// Capacity of a controller's control message queue.
const CONTROL_CHANNEL_SIZE: usize = 32;

/// Members of a group and their per-device hue corrections.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Membership {
    /// Member device ids, in configuration order.
    pub members: Vec<String>,

    /// Hue offset in degrees, keyed by device id.
    pub hue_offsets: HashMap<String, f64>,
}

impl Membership {
    pub fn new(members: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            hue_offsets: HashMap::new(),
        }
    }

    pub fn with_offset(mut self, device_id: impl Into<String>, degrees: f64) -> Self {
        self.hue_offsets.insert(device_id.into(), degrees);
        self
    }

    fn member_set(&self) -> HashSet<String> {
        self.members.iter().cloned().collect()
    }
}

/// Timing and sizing of a group controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    /// Quiet period after a device change before re-aggregating.
    pub debounce: Duration,

    /// Upper bound on how long a burst of changes may postpone re-aggregation.
    pub max_wait: Duration,

    /// Capacity of the device change queue.
    pub queue_size: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            max_wait: Duration::from_millis(250),
            queue_size: 256,
        }
    }
}

/// What a group controller is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    /// A member changed and a debounced refresh is pending.
    Updating,
    Commanding,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("group controller '{0}' is not running")]
    Stopped(String),
}

enum ControlMessage {
    Command {
        command: GroupCommand,
        reply: oneshot::Sender<CommandReport>,
    },
    Reconfigure {
        membership: Membership,
        reply: oneshot::Sender<()>,
    },
    Refresh {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

struct PendingRefresh {
    first_change: Instant,
    deadline: Instant,
}

/// Owner of one group's aggregated state and proportions.
///
/// Runs as its own task; all mutation happens there, driven by control
/// messages from [`GroupHandle`]s and change events from the event bus.
pub struct GroupController {
    group_id: String,
    membership: Membership,
    tracker: ProportionTracker,
    registry: Arc<dyn DeviceRegistry>,
    bus: Arc<dyn EventBus>,
    subscription: Option<SubscriptionId>,
    settings: ControllerSettings,
    pending: Option<PendingRefresh>,
    snapshot_tx: watch::Sender<Arc<GroupSnapshot>>,
    phase_tx: watch::Sender<Phase>,
    control_rx: mpsc::Receiver<ControlMessage>,
    events_tx: DeviceChangeSender,
    events_rx: DeviceChangeReceiver,
}

impl GroupController {
    /// Start a controller task for a group and return a handle to it.
    pub fn spawn(
        group_id: String,
        membership: Membership,
        registry: Arc<dyn DeviceRegistry>,
        bus: Arc<dyn EventBus>,
        settings: ControllerSettings,
    ) -> (GroupHandle, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(settings.queue_size.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(GroupSnapshot::default()));
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);

        let controller = Self {
            group_id: group_id.clone(),
            membership,
            tracker: ProportionTracker::new(),
            registry,
            bus,
            subscription: None,
            settings,
            pending: None,
            snapshot_tx,
            phase_tx,
            control_rx,
            events_tx,
            events_rx,
        };

        let handle = GroupHandle {
            group_id,
            control_tx,
            snapshot_rx,
            phase_rx,
        };

        (handle, tokio::spawn(controller.run()))
    }

    async fn run(mut self) {
        info!(
            "[{}] Controller starting with {} members",
            self.group_id,
            self.membership.members.len()
        );
        self.subscribe();
        self.refresh();

        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);

            tokio::select! {
                msg = self.control_rx.recv() => match msg {
                    Some(ControlMessage::Shutdown) | None => break,
                    Some(msg) => self.handle_control(msg).await,
                },
                Some(change) = self.events_rx.recv() => self.schedule_refresh(change),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.refresh();
                }
            }
        }

        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(id);
        }
        info!("[{}] Controller stopped", self.group_id);
    }

    async fn handle_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Command { command, reply } => {
                let report = self.execute(command).await;
                let _ = reply.send(report);
            }
            ControlMessage::Reconfigure { membership, reply } => {
                self.reconfigure(membership);
                let _ = reply.send(());
            }
            ControlMessage::Refresh { reply } => {
                self.refresh();
                let _ = reply.send(());
            }
            ControlMessage::Shutdown => {}
        }
    }

    fn subscribe(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(id);
        }
        if !self.membership.members.is_empty() {
            let id = self
                .bus
                .subscribe(&self.membership.members, self.events_tx.clone());
            self.subscription = Some(id);
        }
    }

    /// Push the pending refresh out by the debounce interval, bounded by `max_wait`.
    fn schedule_refresh(&mut self, change: DeviceChange) {
        if !self.membership.members.contains(&change.device_id) {
            trace!(
                "[{}] Ignoring change for non-member {}",
                self.group_id, change.device_id
            );
            return;
        }

        debug!(
            "[{}] State change detected for {}",
            self.group_id, change.device_id
        );
        if let Some(old) = &change.old {
            trace!(
                "[{}]   on: {} -> {}, brightness: {:?} -> {:?}",
                self.group_id, old.on, change.new.on, old.brightness, change.new.brightness
            );
        }

        let now = Instant::now();
        self.pending = Some(match self.pending.take() {
            Some(pending) => PendingRefresh {
                first_change: pending.first_change,
                deadline: (now + self.settings.debounce)
                    .min(pending.first_change + self.settings.max_wait),
            },
            None => PendingRefresh {
                first_change: now,
                deadline: now + self.settings.debounce,
            },
        });
        self.set_phase(Phase::Updating);
    }

    fn set_phase(&self, phase: Phase) {
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }

    /// Snapshots of the members the registry currently knows about.
    fn read_devices(&self) -> Vec<DeviceSnapshot> {
        self.membership
            .members
            .iter()
            .filter_map(|id| self.registry.get_snapshot(id))
            .collect()
    }

    /// Re-aggregate and publish the group snapshot.
    ///
    /// Any pending debounced refresh is satisfied by this one.
    fn refresh(&mut self) {
        self.pending = None;
        let devices = self.read_devices();
        let snapshot = aggregate::aggregate(&devices, &self.membership.hue_offsets, &mut self.tracker);
        debug!("[{}] Aggregated: {:?}", self.group_id, snapshot);

        self.snapshot_tx.send_if_modified(|current| {
            if **current == snapshot {
                return false;
            }
            *current = Arc::new(snapshot);
            true
        });

        self.set_phase(Phase::Idle);
    }

    async fn execute(&mut self, command: GroupCommand) -> CommandReport {
        self.set_phase(Phase::Commanding);
        info!("[{}] Executing {:?}", self.group_id, command);

        let devices = self.read_devices();
        let on_devices: Vec<&DeviceSnapshot> = devices.iter().filter(|d| d.on).collect();
        let group_brightness = Some(aggregate::group_brightness(&on_devices));

        let plan = disaggregate::disaggregate(
            &command,
            &self.membership.members,
            &devices,
            group_brightness,
            &self.membership.hue_offsets,
            &mut self.tracker,
        );
        let report = dispatch(&self.registry, plan).await;
        if report.is_complete() {
            debug!("[{}] Command delivered to {} devices", self.group_id, report.dispatched);
        } else {
            warn!("[{}] Command {}", self.group_id, report);
        }

        self.refresh();
        report
    }

    fn reconfigure(&mut self, membership: Membership) {
        let old_members = self.membership.member_set();
        let new_members = membership.member_set();
        self.membership = membership;

        if old_members != new_members {
            info!(
                "[{}] Members changed, now tracking {} devices",
                self.group_id,
                new_members.len()
            );
            self.subscribe();
            self.tracker.reset(&new_members);
        } else {
            debug!("[{}] Hue offsets updated", self.group_id);
        }

        self.refresh();
    }
}

/// Send every planned command at once and wait for all of them.
async fn dispatch(registry: &Arc<dyn DeviceRegistry>, plan: Vec<Dispatch>) -> CommandReport {
    let dispatched = plan.len();
    let mut outstanding: HashSet<String> = plan.iter().map(|(id, _)| id.clone()).collect();
    let mut tasks = JoinSet::new();

    for (device_id, command) in plan {
        let registry = Arc::clone(registry);
        tasks.spawn(async move {
            let result = registry.send_command(&device_id, command).await;
            (device_id, result)
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((device_id, Ok(()))) => {
                outstanding.remove(&device_id);
            }
            Ok((device_id, Err(e))) => {
                warn!("Failed to send command to {}: {}", device_id, e);
                outstanding.remove(&device_id);
                failures.push(DeviceFailure {
                    device_id,
                    error: e.to_string(),
                });
            }
            Err(e) => warn!("Dispatch task failed: {}", e),
        }
    }

    // Tasks that panicked never reported back
    failures.extend(outstanding.into_iter().map(|device_id| DeviceFailure {
        error: DispatchError::Task(device_id.clone()).to_string(),
        device_id,
    }));
    failures.sort_by(|a, b| a.device_id.cmp(&b.device_id));

    CommandReport {
        dispatched,
        failures,
    }
}

/// Cloneable handle to a running [`GroupController`].
#[derive(Clone)]
pub struct GroupHandle {
    group_id: String,
    control_tx: mpsc::Sender<ControlMessage>,
    snapshot_rx: watch::Receiver<Arc<GroupSnapshot>>,
    phase_rx: watch::Receiver<Phase>,
}

impl GroupHandle {
    pub fn id(&self) -> &str {
        &self.group_id
    }

    /// Latest published group state.
    pub fn snapshot(&self) -> Arc<GroupSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase_rx.borrow()
    }

    /// Receiver that is notified whenever the group snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<GroupSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Invoke `callback` with every future snapshot change.
    ///
    /// The callback runs on its own task, which ends when the controller stops.
    pub fn on_update<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&GroupSnapshot) + Send + 'static,
    {
        let mut rx = self.snapshot_rx.clone();
        rx.borrow_and_update();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                callback(&snapshot);
            }
        })
    }

    /// Run a group command; resolves once every device command has completed
    /// and the group state has been re-aggregated.
    pub async fn issue_command(&self, command: GroupCommand) -> Result<CommandReport, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlMessage::Command { command, reply }).await?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Replace the member list and hue offsets.
    pub async fn reconfigure(&self, membership: Membership) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlMessage::Reconfigure { membership, reply })
            .await?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Re-aggregate immediately, skipping any pending debounce.
    pub async fn refresh(&self) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlMessage::Refresh { reply }).await?;
        rx.await.map_err(|_| self.stopped())
    }

    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.send(ControlMessage::Shutdown).await
    }

    async fn send(&self, msg: ControlMessage) -> Result<(), ControllerError> {
        self.control_tx.send(msg).await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> ControllerError {
        ControllerError::Stopped(self.group_id.clone())
    }
}

impl std::fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupHandle")
            .field("group_id", &self.group_id)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::message::DeviceCommand;
    use crate::engine::message::TurnOn;
    use crate::engine::registry::LocalEventBus;
    use crate::engine::state::Capability;

    /// Registry that records commands without changing any state.
    #[derive(Default)]
    struct MockRegistry {
        devices: Mutex<HashMap<String, DeviceSnapshot>>,
        sent: Mutex<Vec<(String, DeviceCommand)>>,
        failing: HashSet<String>,
        reads: AtomicUsize,
    }

    impl MockRegistry {
        fn with_devices(devices: Vec<DeviceSnapshot>) -> Self {
            Self {
                devices: Mutex::new(devices.into_iter().map(|d| (d.id.clone(), d)).collect()),
                ..Default::default()
            }
        }

        fn set(&self, device: DeviceSnapshot) {
            self.devices.lock().unwrap().insert(device.id.clone(), device);
        }

        fn sent(&self) -> Vec<(String, DeviceCommand)> {
            let mut sent = self.sent.lock().unwrap().clone();
            sent.sort_by(|a, b| a.0.cmp(&b.0));
            sent
        }
    }

    #[async_trait]
    impl DeviceRegistry for MockRegistry {
        fn get_snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.devices.lock().unwrap().get(device_id).cloned()
        }

        async fn send_command(
            &self,
            device_id: &str,
            command: DeviceCommand,
        ) -> Result<(), DispatchError> {
            if self.failing.contains(device_id) {
                return Err(DispatchError::Unavailable(device_id.to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((device_id.to_string(), command));
            Ok(())
        }
    }

    fn light(id: &str, on: bool, brightness: u8) -> DeviceSnapshot {
        DeviceSnapshot {
            on,
            brightness: Some(brightness),
            supported_modes: [Capability::Hs].into(),
            ..DeviceSnapshot::new(id)
        }
    }

    fn spawn(
        registry: Arc<MockRegistry>,
        bus: Arc<LocalEventBus>,
        members: &[&str],
    ) -> GroupHandle {
        let (handle, _task) = GroupController::spawn(
            "test".to_string(),
            Membership::new(members.iter().copied()),
            registry,
            bus,
            ControllerSettings::default(),
        );
        handle
    }

    #[tokio::test]
    async fn test_initial_aggregation() {
        let registry = Arc::new(MockRegistry::with_devices(vec![
            light("a", true, 100),
            light("b", true, 200),
        ]));
        let handle = spawn(registry, Arc::new(LocalEventBus::new()), &["a", "b", "missing"]);
        handle.refresh().await.unwrap();

        let snapshot = handle.snapshot();
        assert!(snapshot.on);
        assert_eq!(snapshot.brightness, Some(200));
        assert_eq!(handle.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_fan_out_survives_failing_device() {
        let registry = Arc::new(MockRegistry {
            failing: HashSet::from(["b".to_string()]),
            ..MockRegistry::with_devices(vec![
                light("a", false, 0),
                light("b", false, 0),
                light("c", false, 0),
            ])
        });
        let handle = spawn(registry.clone(), Arc::new(LocalEventBus::new()), &["a", "b", "c"]);

        let report = handle
            .issue_command(GroupCommand::TurnOn(TurnOn::brightness(100)))
            .await
            .unwrap();

        assert_eq!(report.dispatched, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].device_id, "b");

        let sent: Vec<String> = registry.sent().into_iter().map(|(id, _)| id).collect();
        assert_eq!(sent, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_command_reaggregates_before_returning() {
        let registry = Arc::new(MockRegistry::with_devices(vec![light("a", true, 100)]));
        let handle = spawn(registry.clone(), Arc::new(LocalEventBus::new()), &["a"]);
        handle.refresh().await.unwrap();
        let reads_before = registry.reads.load(Ordering::SeqCst);

        // The mock does not apply commands, so mimic the device here
        registry.set(light("a", true, 50));
        handle
            .issue_command(GroupCommand::TurnOn(TurnOn::brightness(50)))
            .await
            .unwrap();

        assert!(registry.reads.load(Ordering::SeqCst) >= reads_before + 2);
        assert_eq!(handle.snapshot().brightness, Some(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_are_debounced() {
        let registry = Arc::new(MockRegistry::with_devices(vec![light("a", true, 100)]));
        let bus = Arc::new(LocalEventBus::new());
        let handle = spawn(registry.clone(), bus.clone(), &["a"]);
        handle.refresh().await.unwrap();
        let reads_before = registry.reads.load(Ordering::SeqCst);

        for brightness in [110, 120, 130, 140, 150] {
            let new = light("a", true, brightness);
            registry.set(new.clone());
            bus.publish(DeviceChange {
                device_id: "a".to_string(),
                old: None,
                new,
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.snapshot().brightness, Some(100));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.snapshot().brightness, Some(150));
        assert_eq!(registry.reads.load(Ordering::SeqCst), reads_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_changes_are_bounded_by_max_wait() {
        let registry = Arc::new(MockRegistry::with_devices(vec![light("a", true, 1)]));
        let bus = Arc::new(LocalEventBus::new());
        let handle = spawn(registry.clone(), bus.clone(), &["a"]);
        handle.refresh().await.unwrap();

        // A change every 20ms never leaves a 50ms quiet period
        let mut refreshed_at = None;
        for step in 1..=20u8 {
            let new = light("a", true, step * 10);
            registry.set(new.clone());
            bus.publish(DeviceChange {
                device_id: "a".to_string(),
                old: None,
                new,
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
            if refreshed_at.is_none() && handle.snapshot().brightness != Some(1) {
                refreshed_at = Some(step);
            }
        }

        let step = refreshed_at.expect("max_wait should force a refresh");
        assert!(step <= 13, "refreshed only after {step} changes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_is_updating_while_refresh_pending() {
        let registry = Arc::new(MockRegistry::with_devices(vec![light("a", true, 100)]));
        let bus = Arc::new(LocalEventBus::new());
        let handle = spawn(registry.clone(), bus.clone(), &["a"]);
        handle.refresh().await.unwrap();
        assert_eq!(handle.phase(), Phase::Idle);

        let new = light("a", true, 180);
        registry.set(new.clone());
        bus.publish(DeviceChange {
            device_id: "a".to_string(),
            old: None,
            new,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.phase(), Phase::Updating);
        assert_eq!(handle.snapshot().brightness, Some(100));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.phase(), Phase::Idle);
        assert_eq!(handle.snapshot().brightness, Some(180));
    }

    #[tokio::test]
    async fn test_on_update_callback() {
        let registry = Arc::new(MockRegistry::with_devices(vec![light("a", false, 0)]));
        let handle = spawn(registry.clone(), Arc::new(LocalEventBus::new()), &["a"]);
        handle.refresh().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.on_update(move |snapshot| {
            let _ = tx.send(snapshot.on);
        });

        registry.set(light("a", true, 10));
        handle.refresh().await.unwrap();
        assert_eq!(rx.recv().await, Some(true));
    }

    #[tokio::test]
    async fn test_reconfigure_resets_removed_members() {
        let registry = Arc::new(MockRegistry::with_devices(vec![
            light("a", true, 200),
            light("b", true, 100),
            light("c", true, 50),
        ]));
        let bus = Arc::new(LocalEventBus::new());
        let handle = spawn(registry.clone(), bus.clone(), &["a", "b"]);
        handle.refresh().await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        handle
            .reconfigure(Membership::new(["a", "c"]).with_offset("c", 15.0))
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(handle.snapshot().brightness, Some(200));

        handle
            .issue_command(GroupCommand::TurnOff)
            .await
            .unwrap();
        let sent: Vec<String> = registry.sent().into_iter().map(|(id, _)| id).collect();
        assert_eq!(sent, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let registry = Arc::new(MockRegistry::default());
        let bus = Arc::new(LocalEventBus::new());
        let (handle, task) = GroupController::spawn(
            "test".to_string(),
            Membership::new(["a"]),
            registry,
            bus.clone(),
            ControllerSettings::default(),
        );
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(bus.subscriber_count(), 0);
        assert!(matches!(
            handle.issue_command(GroupCommand::TurnOff).await,
            Err(ControllerError::Stopped(_))
        ));
    }
}
