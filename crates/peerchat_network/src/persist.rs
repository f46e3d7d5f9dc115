//! JSON files for node state that outlives a process.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::NetworkError;

/// Write `value` as pretty JSON, creating parent directories as needed.
pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), NetworkError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read a JSON file. `Ok(None)` when the file does not exist.
pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, NetworkError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&data)?))
}
