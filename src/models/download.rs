use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use tracing::{debug, error, info, warn};

use super::{cache, RetryPolicy};
use crate::core::{FetchError, Result};
use crate::http::{bearer, mask_url, Header, Probe, Transport, TransportError};

const CHUNK_SIZE: usize = 32 * 1024;
const RANGE_NOT_SATISFIABLE: u16 = 416;

/// One file to bring into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub url: String,
    pub destination: PathBuf,
    pub bearer_token: Option<String>,
    pub headers: Vec<Header>,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            bearer_token: None,
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|token| !token.is_empty());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    fn request_headers(&self) -> Vec<Header> {
        let mut headers = self.headers.clone();
        if let Some(token) = &self.bearer_token {
            headers.push(bearer(token));
        }
        headers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Offline mode and the artifact was already present.
    CachedOffline,
    /// The stored ETag matches the server's, nothing was transferred.
    CacheHit,
    /// The freshness probe failed but a local copy exists.
    CacheFallback,
    Downloaded { bytes: u64, resumed_from: u64 },
}

impl FetchOutcome {
    #[must_use]
    pub fn transferred(&self) -> u64 {
        match self {
            Self::Downloaded { bytes, .. } => *bytes,
            _ => 0,
        }
    }
}

/// The single choke point for artifact transfers.
pub struct Downloader {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn fetch(&self, task: &DownloadTask, offline: bool) -> Result<FetchOutcome> {
        if offline {
            return fetch_offline(&task.destination);
        }

        let headers = task.request_headers();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(task, &headers) {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && self.retry.has_next(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        "attempt {attempt}/{} for {} failed: {err}; retrying after {} milliseconds...",
                        self.retry.max_attempts,
                        mask_url(&task.url),
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                }
                Err(err) if err.is_retryable() => {
                    error!(
                        "download of {} failed after {attempt} attempts: {err}",
                        mask_url(&task.url)
                    );
                    return Err(FetchError::RetriesExhausted {
                        url: task.url.clone(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt(&self, task: &DownloadTask, headers: &[Header]) -> Result<FetchOutcome> {
        let path = task.destination.as_path();
        let file_exists = path.exists();
        let last_etag = if file_exists {
            cache::read_etag(path)
        } else {
            info!("no previous model file found {}", path.display());
            None
        };

        let probe = match self.transport.head(&task.url, headers) {
            Ok(probe) if probe.is_success() => Some(probe),
            Ok(probe) => {
                warn!("HEAD invalid http status code received: {}", probe.status);
                None
            }
            Err(source) => {
                warn!("HEAD request to {} failed: {source}", mask_url(&task.url));
                if file_exists {
                    info!("using cached file (HEAD failed): {}", path.display());
                    return Ok(FetchOutcome::CacheFallback);
                }
                return Err(FetchError::Transport {
                    url: task.url.clone(),
                    source,
                });
            }
        };
        let probe = match probe {
            Some(probe) => probe,
            None if file_exists => {
                info!("using cached file (HEAD failed): {}", path.display());
                return Ok(FetchOutcome::CacheFallback);
            }
            None => Probe::default(),
        };

        let server_etag = probe.etag.clone();
        let mut from_scratch = false;
        if file_exists {
            match (last_etag.as_deref(), server_etag.as_deref()) {
                (Some(previous), Some(current)) if previous == current => {
                    info!("using cached file: {}", path.display());
                    return Ok(FetchOutcome::CacheHit);
                }
                (_, None) => {
                    info!("using cached file (server sent no etag): {}", path.display());
                    return Ok(FetchOutcome::CacheHit);
                }
                (Some(previous), Some(current)) => {
                    warn!("ETag header is different ({previous} != {current}): triggering a new download");
                }
                (None, Some(_)) => {
                    warn!("no stored etag for {}: triggering a new download", path.display());
                }
            }
            from_scratch = true;
        }

        if from_scratch {
            warn!("deleting previous downloaded file: {}", path.display());
            cache::remove_if_exists(path)?;
            cache::remove_if_exists(&cache::etag_path(path))?;
        }

        let partial = cache::partial_path(path);
        let mut offset = 0;
        if partial.exists() {
            if probe.supports_ranges() && !from_scratch {
                offset = fs::metadata(&partial)
                    .map_err(|err| FetchError::fs("stat", &partial, err))?
                    .len();
            } else {
                cache::remove_if_exists(&partial)?;
            }
        }

        info!(
            "trying to download model from {} to {} (etag:{})...",
            mask_url(&task.url),
            partial.display(),
            server_etag.as_deref().unwrap_or_default()
        );
        let transfer = self.pull(&task.url, headers, &partial, offset)?;

        if let Err(err) = fs::rename(&partial, path) {
            error!(
                "unable to rename file: {} to {}",
                partial.display(),
                path.display()
            );
            return Err(FetchError::fs("rename into place", path, err));
        }
        if let Some(etag) = &server_etag {
            cache::write_etag(path, etag)?;
        }

        Ok(FetchOutcome::Downloaded {
            bytes: transfer.received,
            resumed_from: transfer.start,
        })
    }

    fn pull(&self, url: &str, headers: &[Header], partial: &Path, offset: u64) -> Result<Transfer> {
        let mut request_headers = headers.to_vec();
        if offset > 0 {
            info!("server supports range requests, resuming download from byte {offset}");
            request_headers.push(("Range".to_string(), format!("bytes={offset}-")));
        }

        let transport_error = |source: TransportError| FetchError::Transport {
            url: url.to_string(),
            source,
        };

        let mut response = self.transport.get(url, &request_headers).map_err(transport_error)?;
        if offset > 0 && response.status == RANGE_NOT_SATISFIABLE {
            warn!(
                "server rejected resume from byte {offset}, discarding {} and restarting",
                partial.display()
            );
            cache::remove_if_exists(partial)?;
            return self.pull(url, headers, partial, 0);
        }
        if !response.is_success() {
            error!("invalid http status code received: {}", response.status);
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        let resumed = offset > 0 && response.status == 206;
        if offset > 0 && !resumed {
            warn!(
                "server did not respond with 206 Partial Content for a resume request (status {}), restarting from byte 0",
                response.status
            );
        }
        let start = if resumed { offset } else { 0 };
        let expected = response.content_length.map(|length| start + length);

        let mut file = if resumed {
            OpenOptions::new().append(true).open(partial)
        } else {
            File::create(partial)
        }
        .map_err(|err| FetchError::fs("open for writing", partial, err))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        loop {
            let read = match response.body().read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(transport_error(TransportError::Body(err))),
            };
            file.write_all(&buffer[..read])
                .map_err(|err| FetchError::fs("write", partial, err))?;
            received += read as u64;
        }
        file.flush()
            .map_err(|err| FetchError::fs("flush", partial, err))?;

        if let Some(expected) = expected {
            if start + received < expected {
                return Err(FetchError::Truncated {
                    url: url.to_string(),
                    received: start + received,
                    expected,
                });
            }
        }
        debug!("received {received} bytes into {}", partial.display());
        Ok(Transfer { start, received })
    }
}

struct Transfer {
    start: u64,
    received: u64,
}

fn fetch_offline(path: &Path) -> Result<FetchOutcome> {
    if !path.exists() {
        error!(
            "required file is not available in cache (offline mode): {}",
            path.display()
        );
        return Err(FetchError::NotCached {
            path: path.to_path_buf(),
        });
    }
    info!("using cached file (offline mode): {}", path.display());
    Ok(FetchOutcome::CachedOffline)
}

pub(crate) fn filename_from_uri(uri: &str) -> Option<String> {
    let last_segment = uri.split('/').last()?;
    let clean = last_segment.split('?').next()?.split('#').next()?.trim();
    if clean.is_empty() {
        None
    } else {
        Some(clean.to_string())
    }
}
