use std::{
    ffi::OsString,
    fs,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::core::{FetchError, Result};

const ETAG_SUFFIX: &str = ".etag";
const PARTIAL_SUFFIX: &str = ".downloadInProgress";
const LEGACY_SUFFIX: &str = ".json";
const TMP_SUFFIX: &str = ".tmp";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[must_use]
pub fn etag_path(artifact: &Path) -> PathBuf {
    with_suffix(artifact, ETAG_SUFFIX)
}

#[must_use]
pub fn partial_path(artifact: &Path) -> PathBuf {
    with_suffix(artifact, PARTIAL_SUFFIX)
}

/// Writes `content` next to `path` and renames it into place.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = with_suffix(path, TMP_SUFFIX);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| FetchError::fs("create directory", parent, err))?;
    }
    if let Err(err) = fs::write(&tmp, content) {
        discard_tmp(&tmp);
        return Err(FetchError::fs("write", path, err));
    }
    if let Err(err) = fs::rename(&tmp, path) {
        error!("unable to rename file: {} to {}", tmp.display(), path.display());
        discard_tmp(&tmp);
        return Err(FetchError::fs("rename into place", path, err));
    }
    Ok(())
}

fn discard_tmp(tmp: &Path) {
    if let Err(err) = fs::remove_file(tmp) {
        if err.kind() != io::ErrorKind::NotFound {
            error!("unable to delete temporary file {}: {err}", tmp.display());
        }
    }
}

/// Removes `path` if it exists.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(FetchError::fs("delete", path, err)),
    }
}

pub fn write_etag(artifact: &Path, etag: &str) -> Result<()> {
    let sidecar = etag_path(artifact);
    write_atomic(&sidecar, etag.as_bytes())?;
    debug!("file etag saved: {}", sidecar.display());
    Ok(())
}

/// Returns the stored ETag for `artifact`, migrating a legacy `.json`
/// metadata file into a sidecar on the way.
#[must_use]
pub fn read_etag(artifact: &Path) -> Option<String> {
    let sidecar = etag_path(artifact);
    if sidecar.exists() {
        return match fs::File::open(&sidecar) {
            Ok(file) => {
                let mut line = String::new();
                BufReader::new(file).read_line(&mut line).ok()?;
                let etag = line.trim_end_matches(['\r', '\n']).to_string();
                (!etag.is_empty()).then_some(etag)
            }
            Err(err) => {
                error!("could not open .etag file for reading {}: {err}", sidecar.display());
                None
            }
        };
    }
    migrate_legacy_metadata(artifact)
}

#[derive(Deserialize)]
struct LegacyMetadata {
    etag: Option<serde_json::Value>,
}

fn migrate_legacy_metadata(artifact: &Path) -> Option<String> {
    let legacy = with_suffix(artifact, LEGACY_SUFFIX);
    let bytes = fs::read(&legacy).ok()?;
    let metadata: LegacyMetadata = match serde_json::from_slice(&bytes) {
        Ok(metadata) => metadata,
        Err(err) => {
            error!("error reading metadata file {}: {err}", legacy.display());
            return None;
        }
    };
    let etag = metadata.etag?.as_str()?.to_string();
    debug!("previous metadata file found {}", legacy.display());

    if let Err(err) = write_etag(artifact, &etag) {
        warn!("failed to migrate etag for {}: {err}", artifact.display());
    } else if let Err(err) = fs::remove_file(&legacy) {
        warn!("failed to delete old .json metadata file {}: {err}", legacy.display());
    }
    Some(etag)
}
