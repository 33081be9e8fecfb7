mod error;
mod mutations;
pub mod overlap;
mod queries;

pub use error::EngineError;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;

use crate::calendar::Calendar;
use crate::devices::DeviceRegistry;
use crate::model::*;
use crate::wal::Wal;

pub type SharedDeviceState = Arc<RwLock<DeviceState>>;

type DeviceWriteGuards = Vec<(DeviceId, OwnedRwLockWriteGuard<DeviceState>)>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Shift store plus overlap graph, one lock per device.
pub struct Engine {
    devices: BTreeMap<DeviceId, SharedDeviceState>,
    registry: DeviceRegistry,
    calendar: Calendar,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: shift id → device currently holding it.
    pub(super) shift_to_device: DashMap<ShiftId, DeviceId>,
}

/// Apply a logged event during replay. Events naming devices that are no
/// longer registered are skipped.
fn replay_event(
    states: &mut BTreeMap<DeviceId, DeviceState>,
    index: &DashMap<ShiftId, DeviceId>,
    event: &Event,
) {
    match event {
        Event::ShiftCreated { id, user_id, device, span } => {
            let Some(ds) = states.get_mut(device) else {
                warn!(shift = %id, device = %device, "replay: unregistered device, skipping shift");
                return;
            };
            overlap::attach(ds, Shift::new(*id, user_id.clone(), device.clone(), *span));
            index.insert(*id, device.clone());
        }
        Event::ShiftUpdated { id, user_id, device, span } => {
            let Some((_, home)) = index.remove(id) else {
                warn!(shift = %id, "replay: update for unknown shift");
                return;
            };
            let Some(mut shift) = states.get_mut(&home).and_then(|ds| overlap::detach(ds, id)) else {
                return;
            };
            let Some(target) = states.get_mut(device) else {
                warn!(shift = %id, device = %device, "replay: unregistered device, dropping shift");
                return;
            };
            shift.user_id = user_id.clone();
            shift.device = device.clone();
            shift.span = *span;
            overlap::attach(target, shift);
            index.insert(*id, device.clone());
        }
        Event::ShiftDeleted { id, .. } => {
            if let Some((_, home)) = index.remove(id)
                && let Some(ds) = states.get_mut(&home)
            {
                overlap::detach(ds, id);
            }
        }
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, registry: DeviceRegistry, calendar: Calendar) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let shift_to_device = DashMap::new();
        let mut states: BTreeMap<DeviceId, DeviceState> = registry
            .list_devices()
            .into_iter()
            .map(|id| (id.clone(), DeviceState::new(id)))
            .collect();
        for event in &events {
            replay_event(&mut states, &shift_to_device, event);
        }
        tracing::debug!(events = events.len(), shifts = shift_to_device.len(), "WAL replayed");
        metrics::gauge!(crate::observability::SHIFTS_ACTIVE).set(shift_to_device.len() as f64);

        let devices = states
            .into_iter()
            .map(|(id, ds)| (id, Arc::new(RwLock::new(ds))))
            .collect();

        Ok(Self {
            devices,
            registry,
            calendar,
            wal_tx,
            shift_to_device,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    pub fn shift_count(&self) -> usize {
        self.shift_to_device.len()
    }

    pub fn device_for_shift(&self, id: &ShiftId) -> Option<DeviceId> {
        self.shift_to_device.get(id).map(|e| e.value().clone())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Write-lock the given devices in sorted order (deadlock-free across callers).
    pub(super) async fn lock_devices(&self, ids: &[DeviceId]) -> Result<DeviceWriteGuards, EngineError> {
        let mut sorted: Vec<DeviceId> = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            let rs = self
                .devices
                .get(&id)
                .ok_or_else(|| EngineError::UnknownDevice(id.to_string()))?
                .clone();
            guards.push((id, rs.write_owned().await));
        }
        Ok(guards)
    }

    /// Lock the device holding `id` (plus `also`, if given) and confirm the
    /// shift is still there. A concurrent move or delete sends us round again.
    pub(super) async fn lock_shift(
        &self,
        id: &ShiftId,
        also: Option<&DeviceId>,
    ) -> Result<(DeviceId, DeviceWriteGuards), EngineError> {
        loop {
            let home = self.device_for_shift(id).ok_or(EngineError::NotFound(*id))?;
            let mut wanted = vec![home.clone()];
            wanted.extend(also.cloned());
            let guards = self.lock_devices(&wanted).await?;
            if guards.iter().any(|(d, g)| *d == home && g.get(id).is_some()) {
                return Ok((home, guards));
            }
        }
    }

    /// Read-lock every device in sorted order. Holding all guards together
    /// gives a snapshot no mutation can be half-way through.
    pub(super) async fn read_all(&self) -> Vec<OwnedRwLockReadGuard<DeviceState>> {
        let mut guards = Vec::with_capacity(self.devices.len());
        for rs in self.devices.values() {
            guards.push(rs.clone().read_owned().await);
        }
        guards
    }

    pub(super) fn shared_device(&self, id: &DeviceId) -> Option<SharedDeviceState> {
        self.devices.get(id).cloned()
    }
}

pub(super) fn device_guard<'a>(
    guards: &'a mut DeviceWriteGuards,
    device: &DeviceId,
) -> Result<&'a mut DeviceState, EngineError> {
    guards
        .iter_mut()
        .find(|(id, _)| id == device)
        .map(|(_, g)| &mut **g)
        .ok_or_else(|| EngineError::UnknownDevice(device.to_string()))
}
