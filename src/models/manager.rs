use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use tracing::info;

use super::{
    download::{filename_from_uri, DownloadTask, Downloader},
    split::download_model,
};
use crate::core::{FetchError, Result, Settings};
use crate::http::{ReqwestTransport, Transport};
use crate::registry::{self, hub, CachedModelInfo};

/// Local paths of a model pulled from the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubModel {
    pub repo: String,
    pub model_path: PathBuf,
    pub mmproj_path: Option<PathBuf>,
}

/// Entry point for callers: every pull goes through one [`Downloader`]
/// configured from [`Settings`].
pub struct ModelManager {
    settings: Settings,
    downloader: Downloader,
}

impl ModelManager {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&settings.user_agent, settings.request_timeout())
            .context("build http client")?;
        Ok(Self::with_transport(settings, Arc::new(transport)))
    }

    pub fn with_transport(settings: Settings, transport: Arc<dyn Transport>) -> Self {
        let downloader = Downloader::new(transport, settings.retry.policy());
        Self {
            settings,
            downloader,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        self.settings.cache_dir.as_path()
    }

    pub fn ensure_directory(&self) -> Result<()> {
        fs::create_dir_all(self.root())
            .map_err(|err| FetchError::fs("create cache directory", self.root(), err))
    }

    /// Downloads `url` to `path`, or into the cache under the URL's last
    /// path segment.
    pub fn pull_url(&self, url: &str, path: Option<&Path>) -> Result<PathBuf> {
        let is_http = url.starts_with("http://") || url.starts_with("https://");
        if !is_http {
            return Err(FetchError::InvalidReference(url.to_string()));
        }
        let destination = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let name = filename_from_uri(url)
                    .ok_or_else(|| FetchError::InvalidReference(url.to_string()))?;
                self.ensure_directory()?;
                self.settings.cache_file(&name)
            }
        };
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| FetchError::fs("create directory", parent, err))?;
        }

        let task = self.task(url.to_string(), destination);
        download_model(&self.downloader, &task, self.settings.offline)?;
        Ok(task.destination)
    }

    /// Resolves `owner/name[:tag]` on the hub and downloads its GGUF file
    /// (every shard of it) plus the projector file when one is listed.
    pub fn pull_hub(&self, reference: &str) -> Result<HubModel> {
        self.ensure_directory()?;
        let offline = self.settings.offline;
        let file = hub::resolve(
            self.downloader.transport().as_ref(),
            &self.settings,
            reference,
            self.settings.bearer_token.as_deref(),
            offline,
        )?;
        info!(
            "resolved {reference} to {} (from cache: {})",
            file.gguf_file, file.from_cache
        );

        let model = self.hub_task(&file.repo, &file.gguf_file);
        download_model(&self.downloader, &model, offline)?;

        let mmproj_path = match &file.mmproj_file {
            Some(mmproj) => {
                let task = self.hub_task(&file.repo, mmproj);
                self.downloader.fetch(&task, offline)?;
                Some(task.destination)
            }
            None => None,
        };

        Ok(HubModel {
            repo: file.repo,
            model_path: model.destination,
            mmproj_path,
        })
    }

    /// Resolves an OCI reference and downloads its model layer. Never
    /// offline.
    pub fn pull_oci(&self, reference: &str) -> Result<PathBuf> {
        self.ensure_directory()?;
        registry::oci::resolve(&self.downloader, &self.settings, reference)
    }

    pub fn list_cached(&self) -> Result<Vec<CachedModelInfo>> {
        registry::list_cached(self.root())
    }

    fn hub_task(&self, repo: &str, file: &str) -> DownloadTask {
        let url = hub::artifact_url(&self.settings.hub_endpoint, repo, file);
        let destination = self
            .settings
            .cache_file(&hub::artifact_file_name(repo, file));
        self.task(url, destination)
    }

    fn task(&self, url: String, destination: PathBuf) -> DownloadTask {
        DownloadTask::new(url, destination)
            .with_bearer_token(self.settings.bearer_token.clone())
            .with_headers(self.settings.header_list())
    }
}
