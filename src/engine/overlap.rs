use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidRange { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SHIFT_DURATION_MS {
        return Err(EngineError::LimitExceeded("shift too long"));
    }
    Ok(span)
}

/// Place `shift` on the device and link it with every shift it intersects.
/// Any overlap ids the shift carried in are discarded and recomputed.
/// Returns the number of links created.
pub(crate) fn attach(ds: &mut DeviceState, mut shift: Shift) -> usize {
    debug_assert_eq!(shift.device, ds.id, "shift attached to foreign device");
    let peers: Vec<ShiftId> = ds
        .overlapping(&shift.span)
        .map(|s| s.id)
        .filter(|id| *id != shift.id)
        .collect();

    for peer_id in &peers {
        if let Some(peer) = ds.get_mut(peer_id) {
            peer.overlaps.insert(shift.id);
        }
    }
    shift.overlaps = peers.iter().copied().collect();
    ds.insert_shift(shift);
    peers.len()
}

/// Take the shift off the device and drop it from every peer's overlap set.
pub(crate) fn detach(ds: &mut DeviceState, id: &ShiftId) -> Option<Shift> {
    let shift = ds.remove_shift(id)?;
    for peer_id in &shift.overlaps {
        if let Some(peer) = ds.get_mut(peer_id) {
            peer.overlaps.remove(id);
        }
    }
    Some(shift)
}

/// Check the overlap graph of one device: every link is symmetric, points at a
/// live shift, and matches the interval test exactly.
pub fn verify(ds: &DeviceState) -> Result<(), String> {
    for shift in &ds.shifts {
        if shift.device != ds.id {
            return Err(format!("shift {} stored under device {}", shift.id, ds.id));
        }
        for peer_id in &shift.overlaps {
            let Some(peer) = ds.get(peer_id) else {
                return Err(format!("shift {} links missing shift {peer_id}", shift.id));
            };
            if !peer.overlaps.contains(&shift.id) {
                return Err(format!("link {} -> {peer_id} is not symmetric", shift.id));
            }
        }
        for other in &ds.shifts {
            if other.id == shift.id {
                continue;
            }
            let intersects = shift.span.overlaps(&other.span);
            if intersects != shift.overlaps.contains(&other.id) {
                return Err(format!(
                    "shift {} and {} intersect={intersects} but linked={}",
                    shift.id,
                    other.id,
                    !intersects
                ));
            }
        }
    }
    Ok(())
}
