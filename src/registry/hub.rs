use std::fs;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::core::{FetchError, Result, Settings};
use crate::http::{bearer, mask_url, Header, Transport};
use crate::models::cache;

const DEFAULT_TAG: &str = "latest";
const MANIFEST_PREFIX: &str = "manifest";
const MANIFEST_SEPARATOR: char = '=';
const MANIFEST_EXTENSION: &str = ".json";

static REPO_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_.\-]+/[A-Za-z0-9_.\-]+$").expect("valid repo name regex")
});

/// `owner/name` plus a tag, as written `owner/name[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubReference {
    pub owner: String,
    pub name: String,
    pub tag: String,
}

impl HubReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let (repo, tag) = match reference.split_once(':') {
            Some((repo, tag)) => (repo, tag),
            None => (reference, DEFAULT_TAG),
        };
        if !REPO_NAME.is_match(repo) {
            return Err(FetchError::InvalidRepo(reference.to_string()));
        }
        if tag.is_empty() || tag.contains([':', '/', '\\', MANIFEST_SEPARATOR]) {
            return Err(FetchError::InvalidReference(reference.to_string()));
        }
        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| FetchError::InvalidRepo(reference.to_string()))?;
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    #[must_use]
    pub fn repo(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// `manifest=<owner>=<name>=<tag>.json`
    #[must_use]
    pub fn manifest_file_name(&self) -> String {
        let sep = MANIFEST_SEPARATOR;
        format!(
            "{MANIFEST_PREFIX}{sep}{}{sep}{}{sep}{}{MANIFEST_EXTENSION}",
            self.owner, self.name, self.tag
        )
    }

    /// Inverse of [`HubReference::manifest_file_name`]; `None` for any other
    /// file name.
    #[must_use]
    pub fn from_manifest_file_name(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(MANIFEST_EXTENSION)?;
        let parts: Vec<&str> = stem.split(MANIFEST_SEPARATOR).collect();
        match parts.as_slice() {
            [MANIFEST_PREFIX, owner, name, tag] => Some(Self {
                owner: (*owner).to_string(),
                name: (*name).to_string(),
                tag: (*tag).to_string(),
            }),
            _ => None,
        }
    }
}

/// The files a hub manifest points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubFile {
    pub repo: String,
    pub gguf_file: String,
    pub mmproj_file: Option<String>,
    /// Read from the local manifest cache instead of the hub.
    pub from_cache: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HubManifest {
    #[serde(default)]
    gguf_file: Option<FileRef>,
    #[serde(default)]
    mmproj_file: Option<FileRef>,
}

#[derive(Debug, Default, Deserialize)]
struct FileRef {
    #[serde(default)]
    rfilename: Option<String>,
}

impl HubManifest {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|err| FetchError::InvalidManifest(err.to_string()))
    }

    pub(crate) fn gguf_file(&self) -> Option<&str> {
        file_name(&self.gguf_file)
    }

    fn mmproj_file(&self) -> Option<&str> {
        file_name(&self.mmproj_file)
    }
}

fn file_name(file: &Option<FileRef>) -> Option<&str> {
    file.as_ref()
        .and_then(|file| file.rfilename.as_deref())
        .filter(|name| !name.is_empty())
}

/// Where a hub file of `repo` lives in the cache: `<owner>_<name>_<file>`
/// with every `/` turned into `_`.
#[must_use]
pub fn artifact_file_name(repo: &str, file: &str) -> String {
    format!("{repo}_{file}").replace('/', "_")
}

#[must_use]
pub fn artifact_url(endpoint: &str, repo: &str, file: &str) -> String {
    format!("{endpoint}{repo}/resolve/main/{file}")
}

fn manifest_url(endpoint: &str, reference: &HubReference) -> String {
    format!(
        "{endpoint}v2/{}/{}/manifests/{}",
        reference.owner, reference.name, reference.tag
    )
}

/// Resolves `owner/name[:tag]` into the GGUF file (and optional projector)
/// the hub recommends, falling back to a cached manifest when the hub cannot
/// be reached.
pub fn resolve(
    transport: &dyn Transport,
    settings: &Settings,
    reference: &str,
    bearer_token: Option<&str>,
    offline: bool,
) -> Result<HubFile> {
    let reference = HubReference::parse(reference)?;
    let repo = reference.repo();
    let url = manifest_url(&settings.hub_endpoint, &reference);
    let cache_path = settings.cache_file(&reference.manifest_file_name());

    let mut headers: Vec<Header> = settings.header_list();
    headers.push(("User-Agent".to_string(), settings.user_agent.clone()));
    headers.push(("Accept".to_string(), "application/json".to_string()));
    if let Some(token) = bearer_token.filter(|token| !token.is_empty()) {
        headers.push(bearer(token));
    }

    let live = if offline {
        None
    } else {
        match transport.get_content(&url, &headers) {
            Ok(content) => Some(content),
            Err(err) => {
                error!("failed to get manifest at {}: {err}", mask_url(&url));
                None
            }
        }
    };

    let (status, body, from_cache) = match live {
        Some(content) => (content.status, content.body, false),
        None => {
            if !cache_path.exists() {
                let (repo, tag) = (repo.clone(), reference.tag.clone());
                return Err(if offline {
                    FetchError::ManifestOffline { repo, tag }
                } else {
                    FetchError::ManifestUnreachable { repo, tag }
                });
            }
            info!("using cached response: {}", cache_path.display());
            let body = fs::read(&cache_path)
                .map_err(|err| FetchError::fs("read cached manifest", &cache_path, err))?;
            (200, body, true)
        }
    };

    match status {
        200 | 304 => {}
        401 => return Err(FetchError::Unauthorized { repo }),
        status => {
            warn!(
                "error from hub API, response code: {status}, data: {}",
                String::from_utf8_lossy(&body)
            );
            return Err(FetchError::HttpStatus { url, status });
        }
    }

    let manifest = HubManifest::parse(&body)?;
    let Some(gguf_file) = manifest.gguf_file() else {
        return Err(FetchError::MissingArtifact { repo });
    };
    if !from_cache {
        cache::write_atomic(&cache_path, &body)?;
    }

    Ok(HubFile {
        gguf_file: gguf_file.to_string(),
        mmproj_file: manifest.mmproj_file().map(str::to_string),
        repo,
        from_cache,
    })
}
