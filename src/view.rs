use std::collections::HashMap;

use serde::Serialize;

use crate::engine::EngineError;
use crate::model::*;

/// A shift as the calendar draws it: joined with the owner's display data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftBlock {
    pub id: ShiftId,
    pub user_id: UserId,
    pub name: String,
    pub color: String,
    pub selected_device: DeviceId,
    pub start_time: Ms,
    pub end_time: Ms,
    #[serde(rename = "isOverlapShiftId")]
    pub overlap_ids: Vec<ShiftId>,
}

/// Source of display data for a user id.
pub trait UserLookup {
    fn user(&self, id: &str) -> Option<&UserProfile>;
}

impl UserLookup for HashMap<UserId, UserProfile> {
    fn user(&self, id: &str) -> Option<&UserProfile> {
        self.get(id)
    }
}

impl ShiftBlock {
    pub fn from_shift(shift: &Shift, owner: &UserProfile) -> Self {
        Self {
            id: shift.id,
            user_id: shift.user_id.clone(),
            name: owner.name.clone(),
            color: owner.color.clone(),
            selected_device: shift.device.clone(),
            start_time: shift.span.start,
            end_time: shift.span.end,
            overlap_ids: shift.overlaps.iter().copied().collect(),
        }
    }
}

/// Join shifts with their owners. Every owner must resolve; the blocks come
/// back ordered by `(start, id)`.
pub fn to_blocks(shifts: &[Shift], users: &impl UserLookup) -> Result<Vec<ShiftBlock>, EngineError> {
    let mut blocks = shifts
        .iter()
        .map(|s| {
            users
                .user(&s.user_id)
                .map(|u| ShiftBlock::from_shift(s, u))
                .ok_or_else(|| EngineError::UnknownUser(s.user_id.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    blocks.sort_by_key(|b| (b.start_time, b.id));
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn profile(id: &str, name: &str, color: &str) -> UserProfile {
        UserProfile {
            id: id.into(),
            email: format!("{id}@example.com"),
            name: name.into(),
            color: color.into(),
            role: Role::User,
        }
    }

    fn users() -> HashMap<UserId, UserProfile> {
        [profile("u1", "Aoi", "#ff0000"), profile("u2", "Ren", "#00ff00")]
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect()
    }

    fn shift(user: &str, start: Ms, end: Ms) -> Shift {
        Shift::new(Ulid::new(), user.into(), DeviceId::new("WHITE_PC"), Span::new(start, end))
    }

    #[test]
    fn joins_owner_display_data() {
        let mut a = shift("u1", 100, 300);
        let b = shift("u2", 200, 400);
        a.overlaps.insert(b.id);

        let blocks = to_blocks(&[b.clone(), a.clone()], &users()).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].id, a.id);
        assert_eq!(blocks[0].name, "Aoi");
        assert_eq!(blocks[0].color, "#ff0000");
        assert_eq!(blocks[0].overlap_ids, vec![b.id]);
        assert_eq!(blocks[1].name, "Ren");
        assert!(blocks[1].overlap_ids.is_empty());
    }

    #[test]
    fn equal_starts_ordered_by_id() {
        let (lo, hi) = {
            let (a, b) = (Ulid::new(), Ulid::new());
            (a.min(b), a.max(b))
        };
        let device = DeviceId::new("WHITE_PC");
        let first = Shift::new(hi, "u2".into(), device.clone(), Span::new(500, 900));
        let second = Shift::new(lo, "u1".into(), device, Span::new(500, 600));
        let early = shift("u1", 100, 200);

        let blocks = to_blocks(&[first, second, early.clone()], &users()).unwrap();
        let ids: Vec<ShiftId> = blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![early.id, lo, hi]);
    }

    #[test]
    fn missing_owner_fails_whole_view() {
        let shifts = vec![shift("u1", 0, 10), shift("ghost", 20, 30)];
        let err = to_blocks(&shifts, &users()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownUser(id) if id == "ghost"));
    }

    #[test]
    fn serializes_calendar_field_names() {
        let s = shift("u1", 1_000, 2_000);
        let block = ShiftBlock::from_shift(&s, &users()["u1"]);
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["selectedDevice"], "WHITE_PC");
        assert_eq!(json["startTime"], 1_000);
        assert_eq!(json["endTime"], 2_000);
        assert!(json["isOverlapShiftId"].as_array().unwrap().is_empty());
    }

    #[test]
    fn empty_input_empty_view() {
        assert!(to_blocks(&[], &users()).unwrap().is_empty());
    }
}
