//! Persistence boundary for the incident store.
//!
//! The store calls the backend before committing any change; a backend error
//! aborts the change and surfaces as [`StoreError::Unavailable`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::report::{Report, ReportId};
use crate::store::model::{Alert, AlertId, Shelter, ShelterId};

/// Everything a backend holds.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub reports: Vec<Report>,
    pub alerts: Vec<Alert>,
    pub shelters: Vec<Shelter>,
}

/// A durable keyed store.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn save_report(&self, report: &Report) -> Result<(), StoreError>;
    async fn save_alert(&self, alert: &Alert) -> Result<(), StoreError>;
    async fn save_shelter(&self, shelter: &Shelter) -> Result<(), StoreError>;
    async fn load_all(&self) -> Result<PersistedState, StoreError>;
}

/// In-process backend. Can be switched off to exercise failure handling.
pub struct MemoryBackend {
    reports: Mutex<HashMap<ReportId, Report>>,
    alerts: Mutex<HashMap<AlertId, Alert>>,
    shelters: Mutex<HashMap<ShelterId, Shelter>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            reports: Mutex::new(HashMap::new()),
            alerts: Mutex::new(HashMap::new()),
            shelters: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory backend switched off".to_string()))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn put<K: std::hash::Hash + Eq, V: Clone>(map: &Mutex<HashMap<K, V>>, key: K, value: &V) {
    map.lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key, value.clone());
}

fn values<K, V: Clone>(map: &Mutex<HashMap<K, V>>) -> Vec<V> {
    map.lock()
        .unwrap_or_else(|e| e.into_inner())
        .values()
        .cloned()
        .collect()
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn save_report(&self, report: &Report) -> Result<(), StoreError> {
        self.check()?;
        put(&self.reports, report.id, report);
        Ok(())
    }

    async fn save_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.check()?;
        put(&self.alerts, alert.id, alert);
        Ok(())
    }

    async fn save_shelter(&self, shelter: &Shelter) -> Result<(), StoreError> {
        self.check()?;
        put(&self.shelters, shelter.id, shelter);
        Ok(())
    }

    async fn load_all(&self) -> Result<PersistedState, StoreError> {
        self.check()?;
        Ok(PersistedState {
            reports: values(&self.reports),
            alerts: values(&self.alerts),
            shelters: values(&self.shelters),
        })
    }
}
