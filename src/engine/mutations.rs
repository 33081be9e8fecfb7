use tokio::sync::oneshot;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{MUTATIONS_TOTAL, OVERLAP_LINKS_CREATED_TOTAL, SHIFTS_ACTIVE};

use super::overlap::{self, validate_span};
use super::{device_guard, Engine, EngineError, WalCommand};

/// Users schedule for themselves; admins for anyone.
fn authorize(actor: &Actor, owner: &str) -> Result<(), EngineError> {
    if actor.role.acts_for_others() || actor.user_id == owner {
        Ok(())
    } else {
        Err(EngineError::Forbidden(format!(
            "{} may not schedule shifts of {owner}",
            actor.user_id
        )))
    }
}

fn validate_user_id(user_id: &str) -> Result<(), EngineError> {
    if user_id.is_empty() {
        return Err(EngineError::InvalidUser(String::new()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

fn check_capacity(ds: &DeviceState) -> Result<(), EngineError> {
    if ds.len() >= MAX_SHIFTS_PER_DEVICE {
        return Err(EngineError::LimitExceeded("too many shifts on device"));
    }
    Ok(())
}

fn debug_verify(ds: &DeviceState) {
    #[cfg(debug_assertions)]
    if let Err(violation) = overlap::verify(ds) {
        panic!("overlap graph corrupted on {}: {violation}", ds.id);
    }
    #[cfg(not(debug_assertions))]
    let _ = ds;
}

impl Engine {
    pub async fn create_shift(
        &self,
        actor: &Actor,
        user_id: &str,
        device: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Shift, EngineError> {
        validate_user_id(user_id)?;
        authorize(actor, user_id)?;
        let device = self.registry().resolve(device)?;
        let span = validate_span(start, end)?;

        let mut guards = self.lock_devices(std::slice::from_ref(&device)).await?;
        let ds = device_guard(&mut guards, &device)?;
        check_capacity(ds)?;

        let id = Ulid::new();
        let event = Event::ShiftCreated {
            id,
            user_id: user_id.to_string(),
            device: device.clone(),
            span,
        };
        self.wal_append(&event).await?;

        let linked = overlap::attach(ds, Shift::new(id, user_id.to_string(), device.clone(), span));
        self.shift_to_device.insert(id, device.clone());
        debug_verify(ds);

        metrics::counter!(MUTATIONS_TOTAL, "op" => "create").increment(1);
        metrics::counter!(OVERLAP_LINKS_CREATED_TOTAL).increment(linked as u64);
        metrics::gauge!(SHIFTS_ACTIVE).set(self.shift_count() as f64);
        debug!(shift = %id, device = %device, user = user_id, overlaps = linked, "shift created");

        ds.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Apply `patch`. Moving the shift in time or to another device recomputes
    /// its links; an owner-only change keeps the overlap set as is.
    pub async fn update_shift(
        &self,
        actor: &Actor,
        id: ShiftId,
        patch: ShiftPatch,
    ) -> Result<Shift, EngineError> {
        let target = patch
            .device
            .as_deref()
            .map(|d| self.registry().resolve(d))
            .transpose()?;
        if let Some(user_id) = &patch.user_id {
            validate_user_id(user_id)?;
        }

        let (home, mut guards) = self.lock_shift(&id, target.as_ref()).await?;
        let current = device_guard(&mut guards, &home)?
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        authorize(actor, &current.user_id)?;
        let user_id = patch.user_id.unwrap_or_else(|| current.user_id.clone());
        if user_id != current.user_id {
            authorize(actor, &user_id)?;
        }
        let device = target.unwrap_or_else(|| home.clone());
        let span = validate_span(
            patch.start.unwrap_or(current.span.start),
            patch.end.unwrap_or(current.span.end),
        )?;

        let relink = device != current.device || span != current.span;
        if !relink && user_id == current.user_id {
            return Ok(current);
        }
        if device != home {
            check_capacity(device_guard(&mut guards, &device)?)?;
        }

        let event = Event::ShiftUpdated {
            id,
            user_id: user_id.clone(),
            device: device.clone(),
            span,
        };
        self.wal_append(&event).await?;

        let mut linked = 0;
        if relink {
            let mut moved = overlap::detach(device_guard(&mut guards, &home)?, &id)
                .ok_or(EngineError::NotFound(id))?;
            moved.user_id = user_id;
            moved.device = device.clone();
            moved.span = span;
            linked = overlap::attach(device_guard(&mut guards, &device)?, moved);
            self.shift_to_device.insert(id, device.clone());
        } else if let Some(shift) = device_guard(&mut guards, &home)?.get_mut(&id) {
            shift.user_id = user_id;
        }
        for (_, g) in &guards {
            debug_verify(g);
        }

        metrics::counter!(MUTATIONS_TOTAL, "op" => "update").increment(1);
        metrics::counter!(OVERLAP_LINKS_CREATED_TOTAL).increment(linked as u64);
        debug!(shift = %id, from = %home, to = %device, relinked = relink, "shift updated");

        device_guard(&mut guards, &device)?
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn delete_shift(&self, actor: &Actor, id: ShiftId) -> Result<(), EngineError> {
        let (home, mut guards) = self.lock_shift(&id, None).await?;
        let ds = device_guard(&mut guards, &home)?;
        let owner = ds
            .get(&id)
            .map(|s| s.user_id.clone())
            .ok_or(EngineError::NotFound(id))?;
        authorize(actor, &owner)?;

        let event = Event::ShiftDeleted {
            id,
            device: home.clone(),
        };
        self.wal_append(&event).await?;

        overlap::detach(ds, &id);
        self.shift_to_device.remove(&id);
        debug_verify(ds);

        metrics::counter!(MUTATIONS_TOTAL, "op" => "delete").increment(1);
        metrics::gauge!(SHIFTS_ACTIVE).set(self.shift_count() as f64);
        debug!(shift = %id, device = %home, "shift deleted");
        Ok(())
    }

    /// Rewrite the WAL as one `ShiftCreated` per live shift.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Hold every read lock until the writer has swapped files: a mutation
        // logged after the snapshot would otherwise be lost.
        let guards = self.read_all().await;
        let events: Vec<Event> = guards
            .iter()
            .flat_map(|ds| ds.shifts.iter())
            .map(|s| Event::ShiftCreated {
                id: s.id,
                user_id: s.user_id.clone(),
                device: s.device.clone(),
                span: s.span,
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
