//! Sampled sensor history.
//!
//! Only *tracked* sensors have a series. The periodic sampler copies the current
//! value of each tracked sensor into its series and drops samples that fall out of
//! the retention window. The whole store is written to disk with `bincode` after
//! every sample so a restart picks up where it left off.
//!
//! # On-disk format
//!
//! A single bincode-encoded `Vec<Series>` using the standard configuration with
//! big-endian, fixed-width integers and a 64 MiB decode limit. The file is
//! replaced atomically by writing a sibling `.tmp` file and renaming it over the
//! original.
use std::{
    collections::{BTreeMap, VecDeque},
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_std_read, encode_into_std_write,
};
use log::{debug, info, warn};

use super::StorageError;
use crate::protocol::{SensorId, Value};

/// Seconds since the Unix epoch.
pub type Timestamp = u64;

pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

const MAX_HISTORY_BYTES: usize = 64 * 1024 * 1024;

type HistoryConfig = Configuration<BigEndian, Fixint, Limit<MAX_HISTORY_BYTES>>;

#[derive(Debug, Encode, Decode)]
struct Series {
    sensor_id: SensorId,
    samples: Vec<(Timestamp, Value)>,
}

pub struct HistoryStore {
    config: HistoryConfig,
    series: BTreeMap<SensorId, VecDeque<(Timestamp, Value)>>,
    retention: u64,
    path: Option<PathBuf>,
}

impl HistoryStore {
    /// History kept in memory only.
    pub fn in_memory(tracked: &[SensorId], retention: u64) -> Self {
        Self {
            config: config(),
            series: tracked.iter().map(|id| (*id, VecDeque::new())).collect(),
            retention,
            path: None,
        }
    }

    /// Loads history from `path`. A missing or unreadable file starts every
    /// tracked series empty; series for sensors no longer tracked are dropped.
    pub fn open(path: PathBuf, tracked: &[SensorId], retention: u64) -> Self {
        let mut store = Self::in_memory(tracked, retention);

        match load(&path, store.config) {
            Ok(Some(saved)) => {
                for Series { sensor_id, samples } in saved {
                    match store.series.get_mut(&sensor_id) {
                        Some(series) => series.extend(samples),
                        None => debug!("dropping history of untracked sensor {sensor_id}"),
                    }
                }
                info!("loaded history from {}", path.display());
            }
            Ok(None) => info!("no history at {}, starting empty", path.display()),
            Err(e) => warn!("history at {} is unreadable, starting empty: {e}", path.display()),
        }

        store.path = Some(path);
        store
    }

    pub fn is_tracked(&self, sensor_id: SensorId) -> bool {
        self.series.contains_key(&sensor_id)
    }

    /// Samples recorded at or after `since`, oldest first. `None` when the sensor
    /// is not tracked.
    pub fn query(&self, sensor_id: SensorId, since: Timestamp) -> Option<Vec<(Timestamp, Value)>> {
        self.series.get(&sensor_id).map(|series| {
            series
                .iter()
                .filter(|(ts, _)| *ts >= since)
                .copied()
                .collect()
        })
    }

    /// Appends the current value of every tracked sensor and prunes samples older
    /// than the retention window. Returns the number of samples appended.
    pub fn sample(&mut self, values: &[Option<Value>], now: Timestamp) -> usize {
        let oldest = now.saturating_sub(self.retention);
        let mut added = 0;

        for (sensor_id, series) in self.series.iter_mut() {
            if let Some(Some(value)) = values.get(usize::from(*sensor_id)) {
                series.push_back((now, *value));
                added += 1;
            }
            while series.front().is_some_and(|(ts, _)| *ts < oldest) {
                series.pop_front();
            }
        }

        debug!("sampled {added} values into history");
        added
    }

    /// Writes the store to its file. In-memory stores do nothing.
    pub fn persist(&self) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let saved = self
            .series
            .iter()
            .map(|(sensor_id, samples)| Series {
                sensor_id: *sensor_id,
                samples: samples.iter().copied().collect(),
            })
            .collect::<Vec<_>>();

        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            encode_into_std_write(saved, &mut writer, self.config)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;

        debug!("history persisted to {}", path.display());
        Ok(())
    }
}

fn config() -> HistoryConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_HISTORY_BYTES>()
}

fn load(path: &Path, config: HistoryConfig) -> Result<Option<Vec<Series>>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = BufReader::new(File::open(path)?);
    Ok(Some(decode_from_std_read(&mut reader, config)?))
}
