use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

/// Shared bounds for a new or updated area.
pub(crate) fn validate_area(area: &Area) -> Result<(), EngineError> {
    let name = area.name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation("area name must not be empty".into()));
    }
    if area.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("area name too long"));
    }
    if area.capacity == 0 {
        return Err(EngineError::Validation("capacity must be positive".into()));
    }
    if area.price_per_hour < Decimal::ZERO {
        return Err(EngineError::Validation("price_per_hour must not be negative".into()));
    }
    if area.min_booking_hours < 1 {
        return Err(EngineError::Validation("min_booking_hours must be at least 1".into()));
    }
    if area.max_booking_hours > MAX_BOOKING_HOURS {
        return Err(EngineError::Validation(format!(
            "max_booking_hours must be at most {MAX_BOOKING_HOURS}"
        )));
    }
    if area.min_booking_hours > area.max_booking_hours {
        return Err(EngineError::Validation(
            "min_booking_hours must not exceed max_booking_hours".into(),
        ));
    }
    Ok(())
}

impl Engine {
    pub async fn create_area(&self, id: Ulid, spec: AreaSpec) -> Result<Area, EngineError> {
        let _registry = self.registry_lock.lock().await;
        if self.state.len() >= MAX_AREAS_PER_CONDO {
            return Err(EngineError::LimitExceeded("too many areas"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let area = Area {
            id,
            name: spec.name.trim().to_string(),
            capacity: spec.capacity,
            price_per_hour: spec.price_per_hour,
            min_booking_hours: spec.min_booking_hours,
            max_booking_hours: spec.max_booking_hours,
            monthly_limit_per_unit: spec.monthly_limit_per_unit,
            auto_approve: spec.auto_approve,
            active: true,
            created_at: now_ms(),
        };
        validate_area(&area)?;

        let event = Event::AreaCreated { area: area.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(AreaState::new(area.clone()))));
        self.notify.send(id, &event);
        tracing::info!(area_id = %id, name = %area.name, "area created");
        Ok(area)
    }

    /// Apply a partial update. Existing reservations keep their status even
    /// when the new rules would no longer admit them.
    pub async fn update_area(&self, id: Ulid, patch: AreaPatch) -> Result<Area, EngineError> {
        let st = self.get_area_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = st.write().await;
        if patch.is_empty() {
            return Ok(guard.area.clone());
        }
        let mut next = patch.apply(&guard.area);
        next.name = next.name.trim().to_string();
        validate_area(&next)?;

        let event = Event::AreaUpdated { area: next.clone() };
        self.persist_and_apply(id, &mut guard, &event).await?;
        Ok(next)
    }

    /// Soft delete: the area stops taking requests and blocks, history stays.
    pub async fn deactivate_area(&self, id: Ulid) -> Result<Area, EngineError> {
        self.update_area(
            id,
            AreaPatch {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn get_area(&self, id: Ulid) -> Result<Area, EngineError> {
        let st = self.get_area_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = st.read().await;
        Ok(guard.area.clone())
    }

    /// Every area, active or not, ordered by name.
    pub async fn list_areas(&self) -> Vec<Area> {
        let handles: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut areas = Vec::with_capacity(handles.len());
        for st in handles {
            areas.push(st.read().await.area.clone());
        }
        areas.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        areas
    }
}
