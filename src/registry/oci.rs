use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::core::{FetchError, OciSettings, Result, Settings};
use crate::http::{bearer, mask_url, Header, Transport};
use crate::models::{DownloadTask, Downloader};

const DEFAULT_TAG: &str = "latest";
const MODEL_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.ai.gguf.v3";
const MODEL_FORMAT_MARKER: &str = "gguf";
const MANIFEST_ACCEPT: &str =
    "application/vnd.docker.distribution.manifest.v2+json,application/vnd.oci.image.manifest.v1+json";

static DIGEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sha256:([a-fA-F0-9]{64})$").expect("valid digest regex"));
static REPOSITORY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)+$")
        .expect("valid repository regex")
});
static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid tag regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciReference {
    pub repository: String,
    pub tag: String,
}

impl OciReference {
    /// Parses `[namespace/]name[:tag]`, placing bare names under
    /// `default_namespace`.
    pub fn parse(reference: &str, default_namespace: &str) -> Result<Self> {
        let (repository, tag) = match reference.split_once(':') {
            Some((repository, tag)) => (repository, tag),
            None => (reference, DEFAULT_TAG),
        };
        let repository = if repository.contains('/') {
            repository.to_string()
        } else {
            format!("{default_namespace}/{repository}")
        };
        if !REPOSITORY.is_match(&repository) || !TAG.is_match(tag) {
            return Err(FetchError::InvalidReference(reference.to_string()));
        }
        Ok(Self {
            repository,
            tag: tag.to_string(),
        })
    }

    /// `<namespace>_<name>_<tag>.gguf`
    #[must_use]
    pub fn local_file_name(&self) -> String {
        format!("{}_{}.gguf", self.repository.replace('/', "_"), self.tag)
    }
}

/// Checks `digest` is `sha256:<64 hex>` and returns it with lowercase hex.
pub fn validate_digest(digest: &str) -> Result<String> {
    let captures = DIGEST
        .captures(digest)
        .ok_or_else(|| FetchError::InvalidDigest(digest.to_string()))?;
    Ok(format!("sha256:{}", captures[1].to_ascii_lowercase()))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageManifest {
    #[serde(default)]
    layers: Vec<Layer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Layer {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    digest: Option<String>,
}

impl Layer {
    fn is_model(&self) -> bool {
        self.media_type.as_deref().map_or(false, |media_type| {
            media_type == MODEL_LAYER_MEDIA_TYPE || media_type.contains(MODEL_FORMAT_MARKER)
        })
    }
}

/// Resolves an OCI model reference and downloads its GGUF layer into the
/// cache. Always goes to the network.
pub fn resolve(downloader: &Downloader, settings: &Settings, reference: &str) -> Result<PathBuf> {
    let result = OciReference::parse(reference, &settings.oci.default_namespace)
        .and_then(|parsed| pull(downloader, settings, &parsed));
    if let Err(err) = &result {
        error!("OCI model download failed for {reference}: {err}");
    }
    result
}

fn pull(downloader: &Downloader, settings: &Settings, reference: &OciReference) -> Result<PathBuf> {
    let transport = downloader.transport().as_ref();
    let oci = &settings.oci;
    let extra = settings.header_list();

    let token = fetch_token(transport, oci, &extra, &reference.repository)?;
    let digest = fetch_model_digest(transport, oci, &extra, reference, &token)?;
    info!(
        "selected model layer {digest} for {}:{}",
        reference.repository, reference.tag
    );

    let blob_url = format!("{}v2/{}/blobs/{digest}", oci.registry_url, reference.repository);
    let task = DownloadTask::new(blob_url, settings.cache_file(&reference.local_file_name()))
        .with_bearer_token(Some(token))
        .with_headers(extra);
    downloader.fetch(&task, false)?;
    Ok(task.destination)
}

fn fetch_token(
    transport: &dyn Transport,
    oci: &OciSettings,
    extra: &[Header],
    repository: &str,
) -> Result<String> {
    let url = format!(
        "{}?service={}&scope=repository:{repository}:pull",
        oci.auth_url, oci.service
    );
    let content = transport
        .get_content(&url, extra)
        .map_err(|source| FetchError::Transport {
            url: url.clone(),
            source,
        })?;
    if content.status != 200 {
        return Err(FetchError::HttpStatus {
            url,
            status: content.status,
        });
    }
    let response: TokenResponse = serde_json::from_slice(&content.body)
        .map_err(|err| FetchError::InvalidManifest(format!("token response: {err}")))?;
    debug!("obtained registry token from {}", mask_url(&oci.auth_url));
    response
        .token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| FetchError::InvalidManifest("token response has no token".into()))
}

fn fetch_model_digest(
    transport: &dyn Transport,
    oci: &OciSettings,
    extra: &[Header],
    reference: &OciReference,
    token: &str,
) -> Result<String> {
    let url = format!(
        "{}v2/{}/manifests/{}",
        oci.registry_url, reference.repository, reference.tag
    );
    let mut headers = extra.to_vec();
    headers.push(bearer(token));
    headers.push(("Accept".to_string(), MANIFEST_ACCEPT.to_string()));

    let content = transport
        .get_content(&url, &headers)
        .map_err(|source| FetchError::Transport {
            url: url.clone(),
            source,
        })?;
    if content.status != 200 {
        return Err(FetchError::HttpStatus {
            url,
            status: content.status,
        });
    }
    let manifest: ImageManifest = serde_json::from_slice(&content.body)
        .map_err(|err| FetchError::InvalidManifest(err.to_string()))?;

    let layer = manifest
        .layers
        .iter()
        .find(|layer| layer.is_model())
        .ok_or_else(|| FetchError::NoModelLayer {
            repo: reference.repository.clone(),
            tag: reference.tag.clone(),
        })?;
    validate_digest(layer.digest.as_deref().unwrap_or_default())
}
