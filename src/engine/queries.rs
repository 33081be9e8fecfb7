use crate::model::*;

use super::{overlap, Engine, EngineError};

impl Engine {
    pub async fn get_shift(&self, id: ShiftId) -> Result<Shift, EngineError> {
        // A concurrent move can relocate the shift between the index lookup
        // and the read lock; look again when that happens.
        loop {
            let home = self.device_for_shift(&id).ok_or(EngineError::NotFound(id))?;
            let rs = self
                .shared_device(&home)
                .ok_or_else(|| EngineError::UnknownDevice(home.to_string()))?;
            let guard = rs.read().await;
            if let Some(shift) = guard.get(&id) {
                return Ok(shift.clone());
            }
        }
    }

    /// Every shift, on any device, whose span intersects `window`, ordered by
    /// `(start, id)`. Overlap sets in the result refer to each other
    /// consistently because all devices are read under one snapshot.
    pub async fn query_range(&self, window: Span) -> Vec<Shift> {
        let guards = self.read_all().await;
        let mut hits: Vec<Shift> = guards
            .iter()
            .flat_map(|ds| ds.overlapping(&window))
            .cloned()
            .collect();
        drop(guards);
        hits.sort_by_key(|s| (s.span.start, s.id));
        hits
    }

    pub async fn query_by_day(&self, year: i32, month: u32, day: u32) -> Result<Vec<Shift>, EngineError> {
        let window = self.calendar().day_window(year, month, day)?;
        Ok(self.query_range(window).await)
    }

    pub async fn query_by_month(&self, year: i32, month: u32) -> Result<Vec<Shift>, EngineError> {
        let window = self.calendar().month_window(year, month)?;
        Ok(self.query_range(window).await)
    }

    pub async fn shifts_on_device(&self, device: &DeviceId) -> Result<Vec<Shift>, EngineError> {
        let rs = self
            .shared_device(device)
            .ok_or_else(|| EngineError::UnknownDevice(device.to_string()))?;
        let guard = rs.read().await;
        Ok(guard.shifts.clone())
    }

    /// Check the overlap graph of every device.
    pub async fn verify_overlaps(&self) -> Result<(), String> {
        let guards = self.read_all().await;
        for ds in &guards {
            overlap::verify(ds)?;
        }
        Ok(())
    }
}
