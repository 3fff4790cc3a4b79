//! In-memory user and board stores

pub mod boards;
pub mod users;

pub use boards::{BoardCatalog, BoardMeta, BoardRecord, BoardStore};
pub use users::{UserDirectory, UserProfile, UserStore};

/// Errors raised while loading store contents
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read and deserialize a JSON file
fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T, StoreError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| StoreError::Json {
        path: display,
        source,
    })
}
