//! Target registry: CRUD and lifecycle over monitored endpoints.
//!
//! Owns validation and event emission, and keeps the scheduler in step
//! with every lifecycle change.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::db::{DbError, EventLog, EventType, MonitorTarget, Store};
use crate::scheduler::Scheduler;

pub const MIN_FREQUENCY_SECONDS: i64 = 1;
pub const MAX_FREQUENCY_SECONDS: i64 = 3600;

/// Registry error types.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("target not found")]
    NotFound,
    #[error("a target with this IP address already exists")]
    DuplicateTarget,
    #[error("invalid IP address")]
    InvalidIp,
    #[error("frequency must be between {MIN_FREQUENCY_SECONDS} and {MAX_FREQUENCY_SECONDS} seconds")]
    InvalidFrequency,
    #[error("storage error: {0}")]
    Store(DbError),
}

impl From<DbError> for RegistryError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => RegistryError::NotFound,
            DbError::Duplicate => RegistryError::DuplicateTarget,
            other => RegistryError::Store(other),
        }
    }
}

/// Partial update for a target.
#[derive(Debug, Default, Clone)]
pub struct TargetPatch {
    pub frequency_seconds: Option<i64>,
    pub url: Option<String>,
    pub notes: Option<String>,
}

/// CRUD surface over monitor targets.
pub struct Registry {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
}

impl Registry {
    pub fn new(store: Arc<Store>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Create a target and launch its probe loop.
    pub async fn create(
        &self,
        ip: &str,
        frequency_seconds: i64,
        url: Option<&str>,
        notes: Option<&str>,
    ) -> Result<MonitorTarget, RegistryError> {
        let parsed: IpAddr = ip.trim().parse().map_err(|_| RegistryError::InvalidIp)?;
        validate_frequency(frequency_seconds)?;

        let target = self
            .store
            .add_target(&parsed.to_string(), frequency_seconds, url, notes)?;
        self.store.add_event(
            Some(target.id),
            EventType::Start,
            &format!("Started tracking {}", target.ip),
        )?;
        self.scheduler.launch(target.clone()).await;
        Ok(target)
    }

    /// All targets, paused and deleted rows included.
    pub fn list(&self) -> Result<Vec<MonitorTarget>, RegistryError> {
        Ok(self.store.get_targets()?)
    }

    pub fn get(&self, id: i64) -> Result<MonitorTarget, RegistryError> {
        Ok(self.store.get_target(id)?)
    }

    /// Partial update. A cadence change on an active target restarts its loop.
    pub async fn update(&self, id: i64, patch: TargetPatch) -> Result<MonitorTarget, RegistryError> {
        let mut target = self.store.get_target(id)?;
        if target.is_deleted() {
            return Err(RegistryError::NotFound);
        }

        let mut frequency_changed = false;
        if let Some(frequency) = patch.frequency_seconds {
            validate_frequency(frequency)?;
            frequency_changed = frequency != target.frequency_seconds;
            target.frequency_seconds = frequency;
        }
        if let Some(url) = patch.url {
            target.url = Some(url);
        }
        if let Some(notes) = patch.notes {
            target.notes = Some(notes);
        }

        self.store.update_target(&target)?;
        if frequency_changed && target.is_active {
            self.scheduler.restart(target.clone()).await;
        }
        Ok(target)
    }

    /// Stop probing. Returns only after the loop has observed the
    /// cancellation (or was abandoned past the probe timeout). Idempotent:
    /// pausing a paused target changes nothing and emits nothing.
    pub async fn pause(&self, id: i64) -> Result<MonitorTarget, RegistryError> {
        let mut target = self.store.get_target(id)?;
        if target.is_deleted() {
            return Err(RegistryError::NotFound);
        }
        if !target.is_active {
            return Ok(target);
        }

        self.scheduler.cancel(id).await;
        self.store.set_target_active(id, false)?;
        self.store.add_event(
            Some(id),
            EventType::Stop,
            &format!("Stopped tracking {}", target.ip),
        )?;
        target.is_active = false;
        Ok(target)
    }

    /// Start probing again. Idempotent on active targets; deleted targets
    /// are gone for good.
    pub async fn resume(&self, id: i64) -> Result<MonitorTarget, RegistryError> {
        let mut target = self.store.get_target(id)?;
        if target.is_deleted() {
            return Err(RegistryError::NotFound);
        }
        if target.is_active {
            return Ok(target);
        }

        self.store.set_target_active(id, true)?;
        self.store.add_event(
            Some(id),
            EventType::Start,
            &format!("Resumed tracking {}", target.ip),
        )?;
        target.is_active = true;
        self.scheduler.launch(target.clone()).await;
        Ok(target)
    }

    /// Soft-delete: the row and its history stay, the loop stops, and the
    /// target can never be resumed.
    pub async fn delete(&self, id: i64) -> Result<MonitorTarget, RegistryError> {
        let mut target = self.store.get_target(id)?;
        if target.is_deleted() {
            return Err(RegistryError::NotFound);
        }

        self.scheduler.cancel(id).await;
        let now = Utc::now();
        self.store.mark_target_deleted(id, now)?;
        self.store.add_event(
            Some(id),
            EventType::Delete,
            &format!("Deleted target {}", target.ip),
        )?;
        target.is_active = false;
        target.deleted_at = Some(now);
        Ok(target)
    }

    /// Event rows for a target, newest-first.
    pub fn events(&self, id: i64, limit: usize) -> Result<Vec<EventLog>, RegistryError> {
        // Surface NotFound for unknown ids rather than an empty list.
        self.store.get_target(id)?;
        Ok(self.store.get_events(id, limit)?)
    }
}

fn validate_frequency(frequency_seconds: i64) -> Result<(), RegistryError> {
    if !(MIN_FREQUENCY_SECONDS..=MAX_FREQUENCY_SECONDS).contains(&frequency_seconds) {
        return Err(RegistryError::InvalidFrequency);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn setup() -> (NamedTempFile, Arc<Store>, Arc<Scheduler>, Registry) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let scheduler = Arc::new(Scheduler::new(store.clone(), 5, Duration::from_secs(1)));
        let registry = Registry::new(store.clone(), scheduler.clone());
        (tmp, store, scheduler, registry)
    }

    #[tokio::test]
    async fn test_create_validates_ip_and_frequency() {
        let (_tmp, _store, scheduler, registry) = setup();

        assert!(matches!(
            registry.create("not-an-ip", 5, None, None).await,
            Err(RegistryError::InvalidIp)
        ));
        assert!(matches!(
            registry.create("192.0.2.80", 0, None, None).await,
            Err(RegistryError::InvalidFrequency)
        ));
        assert!(matches!(
            registry.create("192.0.2.80", 3601, None, None).await,
            Err(RegistryError::InvalidFrequency)
        ));

        let target = registry.create("192.0.2.80", 3600, None, None).await.unwrap();
        assert!(target.is_active);
        assert!(scheduler.is_running(target.id).await);

        // IPv6 is accepted too.
        let v6 = registry.create("2001:db8::1", 3600, None, None).await.unwrap();
        assert_eq!(v6.ip, "2001:db8::1");

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_ip() {
        let (_tmp, _store, scheduler, registry) = setup();

        let first = registry.create("192.0.2.81", 3600, None, None).await.unwrap();
        assert!(matches!(
            registry.create("192.0.2.81", 10, None, None).await,
            Err(RegistryError::DuplicateTarget)
        ));

        // The duplicate attempt must not disturb the original.
        let unchanged = registry.get(first.id).unwrap();
        assert_eq!(unchanged.frequency_seconds, 3600);
        assert!(unchanged.is_active);

        // The IP stays reserved even after delete.
        registry.delete(first.id).await.unwrap();
        assert!(matches!(
            registry.create("192.0.2.81", 10, None, None).await,
            Err(RegistryError::DuplicateTarget)
        ));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_lifecycle_emits_exactly_four_events() {
        let (_tmp, _store, scheduler, registry) = setup();

        let target = registry.create("192.0.2.82", 3600, None, None).await.unwrap();
        registry.pause(target.id).await.unwrap();
        registry.resume(target.id).await.unwrap();
        registry.delete(target.id).await.unwrap();

        let mut events = registry.events(target.id, 50).unwrap();
        events.reverse(); // oldest-first for the assertion
        let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                EventType::Start,
                EventType::Stop,
                EventType::Start,
                EventType::Delete,
            ]
        );

        assert!(!scheduler.is_running(target.id).await);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_and_resume_are_idempotent() {
        let (_tmp, _store, scheduler, registry) = setup();

        let target = registry.create("192.0.2.83", 3600, None, None).await.unwrap();

        registry.pause(target.id).await.unwrap();
        registry.pause(target.id).await.unwrap();
        assert!(!scheduler.is_running(target.id).await);

        registry.resume(target.id).await.unwrap();
        registry.resume(target.id).await.unwrap();
        assert!(scheduler.is_running(target.id).await);

        // start, stop, start: the repeated calls added nothing.
        assert_eq!(registry.events(target.id, 50).unwrap().len(), 3);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_deleted_target_cannot_come_back() {
        let (_tmp, _store, scheduler, registry) = setup();

        let target = registry.create("192.0.2.84", 3600, None, None).await.unwrap();
        registry.delete(target.id).await.unwrap();

        assert!(matches!(
            registry.resume(target.id).await,
            Err(RegistryError::NotFound)
        ));
        assert!(matches!(
            registry.pause(target.id).await,
            Err(RegistryError::NotFound)
        ));
        assert!(matches!(
            registry.delete(target.id).await,
            Err(RegistryError::NotFound)
        ));
        assert!(matches!(
            registry
                .update(target.id, TargetPatch::default())
                .await,
            Err(RegistryError::NotFound)
        ));

        // Still listed for history.
        let listed = registry.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_deleted());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_patches_fields_and_restarts_on_new_cadence() {
        let (_tmp, _store, scheduler, registry) = setup();

        let target = registry
            .create("192.0.2.85", 3600, None, Some("gateway"))
            .await
            .unwrap();

        let updated = registry
            .update(
                target.id,
                TargetPatch {
                    frequency_seconds: Some(1800),
                    url: Some("https://wiki/gw".to_string()),
                    notes: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.frequency_seconds, 1800);
        assert_eq!(updated.url.as_deref(), Some("https://wiki/gw"));
        assert_eq!(updated.notes.as_deref(), Some("gateway"));
        assert!(scheduler.is_running(target.id).await);

        assert!(matches!(
            registry
                .update(
                    target.id,
                    TargetPatch {
                        frequency_seconds: Some(0),
                        ..Default::default()
                    }
                )
                .await,
            Err(RegistryError::InvalidFrequency)
        ));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_for_unknown_target_is_not_found() {
        let (_tmp, _store, _scheduler, registry) = setup();
        assert!(matches!(
            registry.events(999, 10),
            Err(RegistryError::NotFound)
        ));
    }
}
