//! Shared test doubles: a scripted transport and a fully in-memory
//! engine builder.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::assembler::NoSplit;
use crate::config::EngineConfig;
use crate::engine::{AssetEngine, PatchWorker};
use crate::events::EventBus;
use crate::fetcher::{FetchedText, Fetcher};
use crate::storage::{MemoryStorage, Storage};

pub(crate) struct ScriptedTransport {
    bodies: Mutex<HashMap<String, FetchedText>>,
    pub(crate) requested: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            bodies: Mutex::new(HashMap::new()),
            requested: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn body(self: &Arc<Self>, url: &str, content: &str) -> Arc<Self> {
        self.bodies.lock().unwrap().insert(
            url.to_string(),
            FetchedText {
                url: url.to_string(),
                content: content.to_string(),
                status: 200,
                resource_time: 0,
                error: None,
            },
        );
        self.clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requested.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for ScriptedTransport {
    async fn fetch(&self, url: &str) -> FetchedText {
        self.requested.lock().unwrap().push(url.to_string());
        let bare = url.split('?').next().unwrap_or(url);
        match self.bodies.lock().unwrap().get(bare) {
            Some(reply) => reply.clone(),
            None => FetchedText::failure(bare, 404, "404 Not Found"),
        }
    }
}

pub(crate) fn engine(transport: Arc<ScriptedTransport>) -> Arc<AssetEngine> {
    engine_with(
        transport,
        EngineConfig::default(),
        Arc::new(MemoryStorage::new()),
        None,
    )
}

pub(crate) fn engine_on(
    transport: Arc<ScriptedTransport>,
    storage: Arc<dyn Storage>,
) -> Arc<AssetEngine> {
    engine_with(transport, EngineConfig::default(), storage, None)
}

pub(crate) fn engine_with(
    transport: Arc<ScriptedTransport>,
    mut config: EngineConfig,
    storage: Arc<dyn Storage>,
    patch_worker: Option<Arc<dyn PatchWorker>>,
) -> Arc<AssetEngine> {
    config.local_root = PathBuf::from("/nonexistent");
    AssetEngine::new(
        config,
        storage,
        Arc::new(MemoryStorage::new()),
        transport,
        Arc::new(NoSplit),
        Arc::new(EventBus::new()),
        patch_worker,
    )
}
