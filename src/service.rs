use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::debug;

use crate::calendar::Calendar;
use crate::engine::{Engine, EngineError};
use crate::identity::IdentityProvider;
use crate::model::*;
use crate::view::{to_blocks, ShiftBlock};

/// Calendar-facing entry point: turns day and month identifiers into block
/// lists and forwards mutations with the caller's identity attached.
#[derive(Clone)]
pub struct CalendarService {
    engine: Arc<Engine>,
    identity: Arc<dyn IdentityProvider>,
}

impl CalendarService {
    pub fn new(engine: Arc<Engine>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { engine, identity }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub async fn day_view(&self, year: i32, month: u32, day: u32) -> Result<Vec<ShiftBlock>, EngineError> {
        let shifts = self.engine.query_by_day(year, month, day).await?;
        self.render(&shifts).await
    }

    pub async fn month_view(&self, year: i32, month: u32) -> Result<Vec<ShiftBlock>, EngineError> {
        let shifts = self.engine.query_by_month(year, month).await?;
        self.render(&shifts).await
    }

    /// Look up each distinct owner once, then join.
    async fn render(&self, shifts: &[Shift]) -> Result<Vec<ShiftBlock>, EngineError> {
        let owners: BTreeSet<&str> = shifts.iter().map(|s| s.user_id.as_str()).collect();
        let resolved = try_join_all(owners.iter().map(|id| self.identity.resolve_user_by_id(id))).await?;
        let users: HashMap<UserId, UserProfile> = resolved
            .into_iter()
            .flatten()
            .map(|u| (u.id.clone(), u))
            .collect();
        debug!(shifts = shifts.len(), users = users.len(), "rendering view");
        to_blocks(shifts, &users)
    }

    /// Sign-in style lookup of the caller.
    pub async fn resolve_actor(&self, email: &str) -> Result<Actor, EngineError> {
        match self.identity.resolve_user_by_email(email).await? {
            Some(user) => Ok(Actor::new(user.id, user.role)),
            None => Err(EngineError::Unauthorized(email.to_string())),
        }
    }

    /// Owners must exist in the directory, otherwise every view covering
    /// the shift would fail to render. Only admins can name someone else;
    /// everyone else is left to the engine's authorization check.
    async fn require_owner(&self, actor: &Actor, user_id: &str) -> Result<(), EngineError> {
        if !actor.role.acts_for_others() || actor.user_id == user_id {
            return Ok(());
        }
        match self.identity.resolve_user_by_id(user_id).await? {
            Some(_) => Ok(()),
            None => Err(EngineError::InvalidUser(user_id.to_string())),
        }
    }

    pub async fn create(
        &self,
        actor: &Actor,
        user_id: &str,
        device: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Shift, EngineError> {
        self.require_owner(actor, user_id).await?;
        self.engine.create_shift(actor, user_id, device, start, end).await
    }

    pub async fn update(&self, actor: &Actor, id: ShiftId, patch: ShiftPatch) -> Result<Shift, EngineError> {
        if let Some(owner) = &patch.user_id {
            self.require_owner(actor, owner).await?;
        }
        self.engine.update_shift(actor, id, patch).await
    }

    pub async fn delete(&self, actor: &Actor, id: ShiftId) -> Result<(), EngineError> {
        self.engine.delete_shift(actor, id).await
    }
}

fn parse_parts<const N: usize>(raw: &str) -> Option<[u32; N]> {
    let sep = if raw.contains('/') { '/' } else { '-' };
    let mut out = [0u32; N];
    let mut parts = raw.split(sep);
    for (i, slot) in out.iter_mut().enumerate() {
        let part = parts.next()?;
        // Four-digit year, then one or two digits per component.
        let width_ok = if i == 0 { part.len() == 4 } else { (1..=2).contains(&part.len()) };
        if !width_ok || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *slot = part.parse().ok()?;
    }
    parts.next().is_none().then_some(out)
}

/// Parse `YYYY-MM-DD` or `YYYY/M/D` into a valid calendar date.
pub fn parse_day(raw: &str) -> Result<(i32, u32, u32), EngineError> {
    let [y, m, d] = parse_parts::<3>(raw.trim()).ok_or_else(|| EngineError::InvalidDate(raw.to_string()))?;
    let year = y as i32;
    Calendar::date(year, m, d)?;
    Ok((year, m, d))
}

/// Parse `YYYY-MM` or `YYYY/M` into a valid calendar month.
pub fn parse_month(raw: &str) -> Result<(i32, u32), EngineError> {
    let [y, m] = parse_parts::<2>(raw.trim()).ok_or_else(|| EngineError::InvalidDate(raw.to_string()))?;
    let year = y as i32;
    Calendar::days_in_month(year, m)?;
    Ok((year, m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceRegistry;
    use crate::identity::StaticDirectory;

    /// 2024-02-03T00:00:00Z
    const FEB3: Ms = 1_706_918_400_000;
    const H: Ms = 3_600_000;

    fn profile(id: &str, role: Role) -> UserProfile {
        UserProfile {
            id: id.into(),
            email: format!("{id}@example.com"),
            name: id.to_uppercase(),
            color: "#123456".into(),
            role,
        }
    }

    fn service(name: &str) -> CalendarService {
        let dir = std::env::temp_dir().join("shiftboard_test_service");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let engine = Engine::new(path, DeviceRegistry::default(), Calendar::default()).unwrap();
        let identity = StaticDirectory::new([
            profile("boss", Role::Admin),
            profile("u1", Role::User),
            profile("u2", Role::User),
        ]);
        CalendarService::new(Arc::new(engine), Arc::new(identity))
    }

    #[test]
    fn parses_day_formats() {
        assert_eq!(parse_day("2024-02-03").unwrap(), (2024, 2, 3));
        assert_eq!(parse_day("2024/2/3").unwrap(), (2024, 2, 3));
        assert_eq!(parse_day("2024/12/31").unwrap(), (2024, 12, 31));
        for bad in ["2024-02-30", "2024-13-01", "24-02-03", "2024-02", "2024-02-03-01", "abcd-ef-gh", "", "2024-2-3x"] {
            assert!(matches!(parse_day(bad), Err(EngineError::InvalidDate(_))), "{bad}");
        }
    }

    #[test]
    fn parses_month_formats() {
        assert_eq!(parse_month("2024-02").unwrap(), (2024, 2));
        assert_eq!(parse_month("2024/2").unwrap(), (2024, 2));
        for bad in ["2024-00", "2024-13", "2024", "2024-02-03", "1969-12"] {
            assert!(matches!(parse_month(bad), Err(EngineError::InvalidDate(_))), "{bad}");
        }
    }

    #[tokio::test]
    async fn day_view_joins_users_and_links() {
        let svc = service("day_view.wal");
        let boss = svc.resolve_actor("boss@example.com").await.unwrap();
        let a = svc.create(&boss, "u1", "WHITE_PC", FEB3 + 9 * H, FEB3 + 11 * H).await.unwrap();
        let b = svc.create(&boss, "u2", "WHITE_PC", FEB3 + 10 * H, FEB3 + 12 * H).await.unwrap();
        svc.create(&boss, "u2", "BLACK_PC", FEB3 + 10 * H, FEB3 + 12 * H).await.unwrap();

        let blocks = svc.day_view(2024, 2, 3).await.unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].id, a.id);
        assert_eq!(blocks[0].name, "U1");
        assert_eq!(blocks[0].overlap_ids, vec![b.id]);
        let black = blocks.iter().find(|b| b.selected_device.as_str() == "BLACK_PC").unwrap();
        assert!(black.overlap_ids.is_empty());

        assert!(svc.day_view(2024, 2, 4).await.unwrap().is_empty());
        assert_eq!(svc.month_view(2024, 2).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn owners_must_be_in_directory() {
        let svc = service("owner_check.wal");
        let boss = svc.resolve_actor("boss@example.com").await.unwrap();
        assert!(matches!(
            svc.create(&boss, "ghost", "MAC1", FEB3, FEB3 + H).await,
            Err(EngineError::InvalidUser(id)) if id == "ghost"
        ));
        assert!(matches!(
            svc.create(&boss, "", "MAC1", FEB3, FEB3 + H).await,
            Err(EngineError::InvalidUser(_))
        ));

        let s = svc.create(&boss, "u1", "MAC1", FEB3, FEB3 + H).await.unwrap();
        let patch = ShiftPatch {
            user_id: Some("ghost".into()),
            ..Default::default()
        };
        assert!(matches!(svc.update(&boss, s.id, patch).await, Err(EngineError::InvalidUser(_))));
        let patch = ShiftPatch {
            user_id: Some("u2".into()),
            ..Default::default()
        };
        assert_eq!(svc.update(&boss, s.id, patch).await.unwrap().user_id, "u2");
        assert_eq!(svc.day_view(2024, 2, 3).await.unwrap().len(), 1);

        // Non-admins learn nothing about the directory from a rejected write.
        let u1 = svc.resolve_actor("u1@example.com").await.unwrap();
        assert!(matches!(
            svc.create(&u1, "ghost", "MAC1", FEB3, FEB3 + H).await,
            Err(EngineError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn view_fails_on_unknown_owner() {
        let svc = service("unknown_owner.wal");
        let boss = svc.resolve_actor("boss@example.com").await.unwrap();
        // Owner dropped from the directory after the shift was written.
        svc.engine().create_shift(&boss, "ghost", "MAC1", FEB3, FEB3 + H).await.unwrap();
        assert!(matches!(
            svc.day_view(2024, 2, 3).await,
            Err(EngineError::UnknownUser(id)) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn actor_resolution() {
        let svc = service("actor.wal");
        let u1 = svc.resolve_actor("u1@example.com").await.unwrap();
        assert_eq!(u1, Actor::new("u1", Role::User));
        assert!(matches!(
            svc.resolve_actor("nobody@example.com").await,
            Err(EngineError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn mutations_pass_actor_through() {
        let svc = service("pass_through.wal");
        let u1 = svc.resolve_actor("u1@example.com").await.unwrap();
        let u2 = svc.resolve_actor("u2@example.com").await.unwrap();
        let s = svc.create(&u1, "u1", "LAPTOP", FEB3, FEB3 + H).await.unwrap();

        let patch = ShiftPatch {
            end: Some(FEB3 + 2 * H),
            ..Default::default()
        };
        assert!(matches!(svc.update(&u2, s.id, patch.clone()).await, Err(EngineError::Forbidden(_))));
        assert_eq!(svc.update(&u1, s.id, patch).await.unwrap().span.end, FEB3 + 2 * H);
        assert!(matches!(svc.delete(&u2, s.id).await, Err(EngineError::Forbidden(_))));
        svc.delete(&u1, s.id).await.unwrap();
        assert!(svc.day_view(2024, 2, 3).await.unwrap().is_empty());
    }
}
