//! Board metadata and geometry

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::game::{BoardGeometry, BoardId};

use super::{read_json, StoreError};

/// Catalog entry describing a board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardMeta {
    pub id: BoardId,
    pub name: String,
    /// Players required to start a session
    pub players: u32,
    #[serde(default)]
    pub level: Option<u32>,
    /// Planning time limit in seconds, shown to clients
    #[serde(default)]
    pub timer: Option<u32>,
}

/// Stored board: metadata plus geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardRecord {
    pub meta: BoardMeta,
    pub geometry: BoardGeometry,
}

/// Read-only access to board definitions
pub trait BoardCatalog: Send + Sync {
    fn meta(&self, board_id: BoardId) -> Option<BoardMeta>;

    fn geometry(&self, board_id: BoardId) -> Option<Arc<BoardGeometry>>;

    fn list(&self) -> Vec<BoardMeta>;
}

struct StoredBoard {
    meta: BoardMeta,
    geometry: Arc<BoardGeometry>,
}

/// In-memory board catalog
#[derive(Default)]
pub struct BoardStore {
    boards: DashMap<BoardId, StoredBoard>,
}

impl BoardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of board records
    pub fn load_json(&self, path: &Path) -> Result<usize, StoreError> {
        let records: Vec<BoardRecord> = read_json(path)?;
        let count = records.len();
        for record in records {
            self.insert(record);
        }
        info!(count, path = %path.display(), "Loaded boards");
        Ok(count)
    }

    pub fn insert(&self, record: BoardRecord) {
        self.boards.insert(
            record.meta.id,
            StoredBoard {
                meta: record.meta,
                geometry: Arc::new(record.geometry),
            },
        );
    }
}

impl BoardCatalog for BoardStore {
    fn meta(&self, board_id: BoardId) -> Option<BoardMeta> {
        self.boards.get(&board_id).map(|b| b.meta.clone())
    }

    fn geometry(&self, board_id: BoardId) -> Option<Arc<BoardGeometry>> {
        self.boards.get(&board_id).map(|b| b.geometry.clone())
    }

    fn list(&self) -> Vec<BoardMeta> {
        let mut metas: Vec<BoardMeta> = self.boards.iter().map(|b| b.meta.clone()).collect();
        metas.sort_by_key(|m| m.id);
        metas
    }
}
