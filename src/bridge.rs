//! Process wiring.
//!
//! [`Bridge`] owns the sensor store, the gateway supervisor and the background
//! tasks for the lifetime of the process.
use std::{path::PathBuf, sync::Arc, time::Duration};

use log::{error, info};

use crate::{
    protocol::{SensorId, Supervisor, SupervisorConfig, SupervisorHandle},
    storage::{
        HistoryStore, SensorStore, StorageError, StorageFacade, default_tracked,
        history::DEFAULT_RETENTION_SECS, now_secs, sensor_name,
    },
    tasks::PeriodicTask,
};

const HISTORY_FILE: &str = "history.bin";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub supervisor: SupervisorConfig,
    /// Directory holding the history file. History stays in memory when unset.
    pub data_dir: Option<PathBuf>,
    pub tracked: Vec<SensorId>,
    pub retention: Duration,
    pub snapshot_interval: Duration,
    pub sample_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            data_dir: None,
            tracked: default_tracked(),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            snapshot_interval: Duration::from_secs(30 * 60),
            sample_interval: Duration::from_secs(10 * 60),
        }
    }
}

pub struct Bridge {
    config: BridgeConfig,
    storage: Arc<SensorStore>,
    supervisor: Supervisor<SensorStore>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let retention = config.retention.as_secs();
        let history = match &config.data_dir {
            Some(dir) => HistoryStore::open(dir.join(HISTORY_FILE), &config.tracked, retention),
            None => HistoryStore::in_memory(&config.tracked, retention),
        };
        let storage = Arc::new(SensorStore::new(history));
        let supervisor = Supervisor::new(config.supervisor.clone(), Arc::clone(&storage));

        Self {
            config,
            storage,
            supervisor,
        }
    }

    pub fn storage(&self) -> Arc<SensorStore> {
        Arc::clone(&self.storage)
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.supervisor.handle()
    }

    /// Serves the gateway until shut down through a [`SupervisorHandle`], then stops
    /// the background tasks and persists history one last time.
    pub fn run(self) -> Result<(), StorageError> {
        let snapshot = {
            let storage = Arc::clone(&self.storage);
            PeriodicTask::spawn("snapshot", self.config.snapshot_interval, move || {
                log_snapshot(storage.as_ref())
            })
        };
        let sampler = {
            let storage = Arc::clone(&self.storage);
            PeriodicTask::spawn("history-sampler", self.config.sample_interval, move || {
                match storage.sample_history(now_secs()) {
                    Ok(added) => info!("sampled {added} sensors into history"),
                    Err(e) => error!("failed to sample history: {e}"),
                }
            })
        };

        self.supervisor.run();

        drop(snapshot);
        drop(sampler);
        self.storage.persist()?;
        info!("bridge stopped");
        Ok(())
    }
}

fn log_snapshot(storage: &dyn StorageFacade) {
    let values = storage.snapshot();
    let populated = values
        .iter()
        .enumerate()
        .filter_map(|(id, value)| value.map(|value| (id, value)))
        .map(|(id, value)| {
            let name = SensorId::try_from(id).ok().and_then(sensor_name);
            match name {
                Some(name) => format!("{name}={value}"),
                None => format!("{id}={value}"),
            }
        })
        .collect::<Vec<_>>();

    info!(
        "value table snapshot ({} of {} populated): [{}]",
        populated.len(),
        values.len(),
        populated.join(", ")
    );
}
