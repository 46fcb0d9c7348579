use std::sync::{Mutex, PoisonError};

use crate::protocol::{SensorId, Value};

/// Number of addressable sensor slots, one per 8-bit id.
pub const SLOTS: usize = 256;

/// Latest value reported for every sensor, guarded by a single lock so readers
/// never observe a partially updated table.
#[derive(Debug)]
pub struct ValueCache {
    slots: Mutex<[Option<Value>; SLOTS]>,
}

impl Default for ValueCache {
    fn default() -> Self {
        Self {
            slots: Mutex::new([None; SLOTS]),
        }
    }
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sensor_id: SensorId, value: Value) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots[usize::from(sensor_id)] = Some(value);
    }

    pub fn get(&self, sensor_id: SensorId) -> Option<Value> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots[usize::from(sensor_id)]
    }

    pub fn snapshot(&self) -> Vec<Option<Value>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.to_vec()
    }
}
