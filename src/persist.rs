// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole-file persistence shared by the stores.
//!
//! Files ending in `.yaml`/`.yml` are written as YAML, everything else as
//! pretty JSON. Writes go to a `.partial` sibling first and are renamed into
//! place, so a crash never leaves a half-written store behind.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::StoreError;

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Read and deserialize a store file
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    debug!(path = %path.display(), "Loading store file");
    let content = std::fs::read_to_string(path).map_err(|e| StoreError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let parsed = if is_yaml(path) {
        serde_yaml::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    };

    parsed.map_err(|reason| StoreError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

/// Read a store file, or write `T::default()` to it when it does not exist
pub fn load_or_create<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Serialize + Default,
{
    if path.exists() {
        return load(path);
    }

    let value = T::default();
    save(&value, path)?;
    debug!(path = %path.display(), "Created default store file");
    Ok(value)
}

/// Serialize and atomically replace a store file
pub fn save<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<(), StoreError> {
    let content = if is_yaml(path) {
        serde_yaml::to_string(value).map_err(|e| e.to_string())
    } else {
        serde_json::to_string_pretty(value).map_err(|e| e.to_string())
    }
    .map_err(|reason| StoreError::Serialize {
        path: path.to_path_buf(),
        reason,
    })?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::WriteFailed {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let partial = partial_path(path);
    std::fs::write(&partial, content).map_err(|e| StoreError::WriteFailed {
        path: partial.clone(),
        source: e,
    })?;
    std::fs::rename(&partial, path).map_err(|e| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn yaml_and_json_are_chosen_by_extension() {
        let dir = tempdir().unwrap();
        let sample = Sample {
            name: "feeds".to_string(),
            count: 3,
        };

        let yaml = dir.path().join("sample.yaml");
        save(&sample, &yaml).unwrap();
        assert!(std::fs::read_to_string(&yaml).unwrap().contains("name: feeds"));
        assert_eq!(load::<Sample>(&yaml).unwrap(), sample);

        let json = dir.path().join("sample.json");
        save(&sample, &json).unwrap();
        assert!(std::fs::read_to_string(&json).unwrap().contains("\"count\": 3"));
        assert_eq!(load::<Sample>(&json).unwrap(), sample);
    }

    #[test]
    fn save_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        save(&Sample::default(), &path).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("nested").join("store.json.partial").exists());
    }

    #[test]
    fn load_or_create_writes_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.yaml");

        let value: Sample = load_or_create(&path).unwrap();

        assert_eq!(value, Sample::default());
        assert!(path.exists());
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        match load::<Sample>(&path) {
            Err(StoreError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected parse error, got {other:?}"),
        }
    }
}
