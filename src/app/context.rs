use std::path::PathBuf;
use std::sync::Arc;

use crate::app::{ListmillError, Result};
use crate::assembler::{NoSplit, ScopeSplitter};
use crate::config::EngineConfig;
use crate::engine::{AssetEngine, PatchWorker};
use crate::events::EventBus;
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::storage::{MemoryStorage, SqliteStorage};

pub struct AppContext {
    pub engine: Arc<AssetEngine>,
    pub events: Arc<EventBus>,
}

impl AppContext {
    pub fn new(config: EngineConfig, data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => Self::default_data_dir()?,
        };

        let storage = Arc::new(SqliteStorage::new(data_dir.join("listmill.db"))?);
        let settings = Arc::new(SqliteStorage::new(data_dir.join("settings.db"))?);
        let transport: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.fetch_timeout_secs));
        Ok(Self::build(config, storage, settings, transport, None))
    }

    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        let storage = Arc::new(MemoryStorage::new());
        let settings = Arc::new(MemoryStorage::new());
        let transport: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.fetch_timeout_secs));
        Ok(Self::build(config, storage, settings, transport, None))
    }

    fn build(
        config: EngineConfig,
        storage: Arc<dyn crate::storage::Storage>,
        settings: Arc<dyn crate::storage::Storage>,
        transport: Arc<dyn Fetcher>,
        patch_worker: Option<Arc<dyn PatchWorker>>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let splitter: Arc<dyn ScopeSplitter> = Arc::new(NoSplit);
        let engine = AssetEngine::new(
            config,
            storage,
            settings,
            transport,
            splitter,
            events.clone(),
            patch_worker,
        );
        Self { engine, events }
    }

    fn default_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| ListmillError::Config("Could not find data directory".into()))?;
        let listmill_dir = data_dir.join("listmill");
        std::fs::create_dir_all(&listmill_dir)?;
        Ok(listmill_dir)
    }
}
