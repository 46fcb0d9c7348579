//! Storage behind the protocol layer.
//!
//! The dispatcher only sees the [`StorageFacade`] trait. [`SensorStore`] is the
//! implementation used by the bridge binary: an in-memory [`ValueCache`] holding the
//! latest reading of every sensor, plus a [`HistoryStore`] of periodic samples for
//! the sensors listed in the tracked catalogue.
//!
//! # Locking
//!
//! The cache and the history each sit behind their own mutex. Sampling copies the
//! cache first and releases its lock before taking the history lock, so the two are
//! never held together.
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): Decodes pushed tables and serves history requests.
//! - [`tasks`](crate::tasks): Periodic snapshot and sampling jobs.
pub mod cache;
pub mod history;

use std::{
    io,
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, trace};
use thiserror::Error;

pub use cache::ValueCache;
pub use history::{HistoryStore, Timestamp};

use crate::protocol::{SensorId, Value};

/// Sensors with a history series unless configured otherwise.
pub const DEFAULT_SENSORS: &[(SensorId, &str)] = &[
    (103, "temp_cabin"),
    (104, "temp_ac"),
    (106, "battery_ls"),
    (108, "fresh_water"),
    (122, "temp_bedroom"),
    (123, "hum_bedroom"),
    (124, "lum_bedroom"),
    (147, "temp_ls"),
    (148, "hum_ls"),
    (149, "lum_ls"),
    (159, "temp_sc"),
    (160, "hum_sc"),
    (161, "lum_sc"),
];

pub fn sensor_name(sensor_id: SensorId) -> Option<&'static str> {
    DEFAULT_SENSORS
        .iter()
        .find(|(id, _)| *id == sensor_id)
        .map(|(_, name)| *name)
}

pub fn default_tracked() -> Vec<SensorId> {
    DEFAULT_SENSORS.iter().map(|(id, _)| *id).collect()
}

/// Current time as seconds since the Unix epoch.
pub fn now_secs() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage IO error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode history: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode history: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
}

/// Operations the protocol layer needs from persistence.
pub trait StorageFacade: Send + Sync {
    /// Records the latest value of a sensor. Failures are absorbed by the store.
    fn store(&self, sensor_id: SensorId, value: Value);

    /// History of a sensor since `since`, oldest first. `None` when the sensor has
    /// no series.
    fn query_history(
        &self,
        sensor_id: SensorId,
        since: Timestamp,
    ) -> Option<Vec<(Timestamp, Value)>>;

    /// Current value of every sensor slot, indexed by sensor id.
    fn snapshot(&self) -> Vec<Option<Value>>;
}

pub struct SensorStore {
    cache: ValueCache,
    history: Mutex<HistoryStore>,
}

impl SensorStore {
    pub fn new(history: HistoryStore) -> Self {
        Self {
            cache: ValueCache::new(),
            history: Mutex::new(history),
        }
    }

    /// Copies the current cache into the history and persists it.
    pub fn sample_history(&self, now: Timestamp) -> Result<usize, StorageError> {
        let values = self.cache.snapshot();
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let added = history.sample(&values, now);
        history.persist()?;
        Ok(added)
    }

    pub fn persist(&self) -> Result<(), StorageError> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .persist()
    }
}

impl StorageFacade for SensorStore {
    fn store(&self, sensor_id: SensorId, value: Value) {
        match sensor_name(sensor_id) {
            Some(name) => debug!("setting {name} ({sensor_id}) to {value}"),
            None => trace!("setting sensor {sensor_id} to {value}"),
        }
        self.cache.set(sensor_id, value);
    }

    fn query_history(
        &self,
        sensor_id: SensorId,
        since: Timestamp,
    ) -> Option<Vec<(Timestamp, Value)>> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .query(sensor_id, since)
    }

    fn snapshot(&self) -> Vec<Option<Value>> {
        self.cache.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::storage::history::DEFAULT_RETENTION_SECS;

    #[test]
    fn store_then_sample() {
        let store = SensorStore::new(HistoryStore::in_memory(&[103], DEFAULT_RETENTION_SECS));
        store.store(103, Value::Float(20.5));
        store.store(7, Value::Int(1));

        assert_eq!(store.sample_history(1_000).unwrap(), 1);
        assert_eq!(
            store.query_history(103, 0),
            Some(vec![(1_000, Value::Float(20.5))])
        );
        assert_eq!(store.query_history(7, 0), None);
        assert_eq!(store.snapshot()[7], Some(Value::Int(1)));
    }

    #[test]
    fn sample_history_persists() {
        let temp = TempDir::new("store").unwrap();
        let path = temp.path().join("history.bin");
        let store = SensorStore::new(HistoryStore::open(
            path.clone(),
            &[104],
            DEFAULT_RETENTION_SECS,
        ));
        store.store(104, Value::Int(4));
        store.sample_history(10).unwrap();

        let reopened = HistoryStore::open(path, &[104], DEFAULT_RETENTION_SECS);
        assert_eq!(reopened.query(104, 0), Some(vec![(10, Value::Int(4))]));
    }

    #[test]
    fn catalogue_names() {
        assert_eq!(sensor_name(103), Some("temp_cabin"));
        assert_eq!(sensor_name(1), None);
        assert_eq!(default_tracked().len(), DEFAULT_SENSORS.len());
    }
}
