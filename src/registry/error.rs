use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Schema conflict for {id}: stored as {existing_kind}/{existing_namespace}, requested {kind}/{namespace}")]
    SchemaConflict {
        id: String,
        existing_kind: String,
        existing_namespace: String,
        kind: String,
        namespace: String,
    },

    #[error("Entity {id} was removed and is cooling down ({remaining_secs}s left)")]
    CoolingDown { id: String, remaining_secs: u64 },

    #[error("Registry lock poisoned")]
    LockPoisoned,
}
