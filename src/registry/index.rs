use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::debug;

use super::hub::{artifact_file_name, HubManifest, HubReference};
use crate::core::{FetchError, Result};

/// A hub model whose manifest is in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedModelInfo {
    pub user: String,
    pub model: String,
    pub tag: String,
    pub manifest_path: PathBuf,
    /// Size of the cached primary GGUF, `0` when it is not on disk.
    pub size: u64,
}

impl CachedModelInfo {
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}/{}:{}", self.user, self.model, self.tag)
    }
}

/// Lists the hub manifests cached in `cache_dir`. Unrelated files are
/// ignored; a missing directory lists as empty.
pub fn list_cached(cache_dir: &Path) -> Result<Vec<CachedModelInfo>> {
    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(FetchError::fs("list", cache_dir, err)),
    };

    let mut models = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| FetchError::fs("list", cache_dir, err))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(reference) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(HubReference::from_manifest_file_name)
        else {
            continue;
        };
        let size = cached_model_size(cache_dir, &reference, &path);
        models.push(CachedModelInfo {
            user: reference.owner,
            model: reference.name,
            tag: reference.tag,
            manifest_path: path,
            size,
        });
    }

    models.sort_by(|a, b| (&a.user, &a.model, &a.tag).cmp(&(&b.user, &b.model, &b.tag)));
    Ok(models)
}

fn cached_model_size(cache_dir: &Path, reference: &HubReference, manifest_path: &Path) -> u64 {
    let Ok(body) = fs::read(manifest_path) else {
        return 0;
    };
    let manifest = match HubManifest::parse(&body) {
        Ok(manifest) => manifest,
        Err(err) => {
            debug!("skipping size of {}: {err}", manifest_path.display());
            return 0;
        }
    };
    manifest
        .gguf_file()
        .map(|file| cache_dir.join(artifact_file_name(&reference.repo(), file)))
        .and_then(|path| fs::metadata(path).ok())
        .map_or(0, |metadata| metadata.len())
}
