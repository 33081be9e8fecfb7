use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub type ShiftId = Ulid;

/// Identifier of a user in the external directory.
pub type UserId = String;

/// Ids of the other shifts on the same device whose span intersects this one.
pub type OverlapSet = BTreeSet<ShiftId>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching boundaries do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    /// Admins may schedule on behalf of anyone.
    pub fn acts_for_others(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Who is performing a mutation. Handed in by the session layer on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<UserId>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    pub id: ShiftId,
    pub user_id: UserId,
    pub device: DeviceId,
    pub span: Span,
    pub overlaps: OverlapSet,
}

impl Shift {
    pub fn new(id: ShiftId, user_id: UserId, device: DeviceId, span: Span) -> Self {
        Self {
            id,
            user_id,
            device,
            span,
            overlaps: OverlapSet::new(),
        }
    }
}

/// Partial update of a shift. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShiftPatch {
    pub user_id: Option<UserId>,
    pub device: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl ShiftPatch {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.device.is_none() && self.start.is_none() && self.end.is_none()
    }
}

/// Directory entry for a user, as returned by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct DeviceState {
    pub id: DeviceId,
    /// Shifts on this device, sorted by `(span.start, id)`.
    pub shifts: Vec<Shift>,
}

impl DeviceState {
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            shifts: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.shifts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shifts.is_empty()
    }

    /// Insert shift maintaining sort order by `(span.start, id)`.
    pub fn insert_shift(&mut self, shift: Shift) {
        let key = (shift.span.start, shift.id);
        let pos = self
            .shifts
            .binary_search_by(|s| (s.span.start, s.id).cmp(&key))
            .unwrap_or_else(|e| e);
        self.shifts.insert(pos, shift);
    }

    pub fn remove_shift(&mut self, id: &ShiftId) -> Option<Shift> {
        let pos = self.shifts.iter().position(|s| s.id == *id)?;
        Some(self.shifts.remove(pos))
    }

    pub fn get(&self, id: &ShiftId) -> Option<&Shift> {
        self.shifts.iter().find(|s| s.id == *id)
    }

    pub fn get_mut(&mut self, id: &ShiftId) -> Option<&mut Shift> {
        self.shifts.iter_mut().find(|s| s.id == *id)
    }

    /// Return only shifts whose span overlaps the query window.
    /// Uses binary search to skip shifts starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Shift> {
        let right_bound = self.shifts.partition_point(|s| s.span.start < query.end);
        self.shifts[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

/// WAL record format. Flat, no nesting.
/// Overlap links are derived and never logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ShiftCreated {
        id: ShiftId,
        user_id: UserId,
        device: DeviceId,
        span: Span,
    },
    ShiftUpdated {
        id: ShiftId,
        user_id: UserId,
        device: DeviceId,
        span: Span,
    },
    ShiftDeleted {
        id: ShiftId,
        device: DeviceId,
    },
}

impl Event {
    pub fn shift_id(&self) -> ShiftId {
        match self {
            Event::ShiftCreated { id, .. }
            | Event::ShiftUpdated { id, .. }
            | Event::ShiftDeleted { id, .. } => *id,
        }
    }
}
