//! Per-project store registry.
//!
//! Each project id maps to one `ChunkStore` behind a mutex, which is what
//! enforces the single-writer rule. Stores live under
//! `<index_path>/<project_id>/`.

use crate::config::Settings;
use crate::error::{StoreError, StoreResult};
use crate::indexing::store::ChunkStore;
use crate::storage::persistence::{ProjectInfo, StorageLayout};
use crate::vector::DeviceBackend;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub type SharedStore = Arc<Mutex<ChunkStore>>;

pub struct StoreRegistry {
    settings: Arc<Settings>,
    device: Arc<dyn DeviceBackend>,
    stores: DashMap<String, SharedStore>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("index_path", &self.settings.index_path)
            .field("projects", &self.stores.len())
            .finish()
    }
}

impl StoreRegistry {
    pub fn new(settings: Arc<Settings>, device: Arc<dyn DeviceBackend>) -> Self {
        Self {
            settings,
            device,
            stores: DashMap::new(),
        }
    }

    /// Directory holding every project store.
    pub fn root(&self) -> &Path {
        &self.settings.index_path
    }

    /// Storage directory for `project_id`.
    pub fn project_path(&self, project_id: &str) -> PathBuf {
        self.settings.index_path.join(project_id)
    }

    /// The open store for `project_id`, opening it on first use.
    pub fn get_or_open(
        &self,
        project_id: &str,
        model_name: &str,
        dimension: usize,
    ) -> StoreResult<SharedStore> {
        if project_id.is_empty()
            || project_id.contains(['/', '\\'])
            || project_id == "."
            || project_id == ".."
        {
            return Err(StoreError::InvalidInput(format!(
                "'{project_id}' is not a valid project id"
            )));
        }

        if let Some(store) = self.get(project_id) {
            return Ok(store);
        }

        // No map shard is locked while the store opens
        let base_path = self.project_path(project_id);
        let store = ChunkStore::open(
            self.settings.clone(),
            &base_path,
            model_name,
            dimension,
            self.device.clone(),
        )?;

        let layout = StorageLayout::new(&base_path);
        if ProjectInfo::load(&layout)?.is_none() {
            ProjectInfo::new(project_id, None).save(&layout)?;
        }

        let shared = match self.stores.entry(project_id.to_string()) {
            Entry::Occupied(entry) => {
                debug!("Store for project {project_id} was opened concurrently, reusing it");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                debug!("Opened store for project {project_id} at {}", base_path.display());
                entry.insert(Arc::new(Mutex::new(store))).value().clone()
            }
        };
        Ok(shared)
    }

    pub fn get(&self, project_id: &str) -> Option<SharedStore> {
        self.stores.get(project_id).map(|entry| entry.value().clone())
    }

    /// Close and forget the store for `project_id`.
    pub fn close(&self, project_id: &str) -> bool {
        match self.stores.remove(project_id) {
            Some((_, store)) => {
                store.lock().close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let ids = self.project_ids();
        for id in ids {
            self.close(&id);
        }
    }

    pub fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
