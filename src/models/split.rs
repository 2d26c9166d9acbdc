use std::ffi::OsStr;

use tracing::info;

use super::{
    download::{DownloadTask, Downloader, FetchOutcome},
    metadata::read_split_count,
    service::fetch_many,
};
use crate::core::{FetchError, Result};

/// `<prefix>-NNNNN-of-MMMMM.gguf`, with 1-based shard numbers.
#[must_use]
pub fn split_path(prefix: &str, number: u16, count: u16) -> String {
    format!("{prefix}-{number:05}-of-{count:05}.gguf")
}

/// Inverse of [`split_path`]: the prefix of `name` if it is shard `number`
/// of `count`.
#[must_use]
pub fn split_prefix(name: &str, number: u16, count: u16) -> Option<&str> {
    name.strip_suffix(&format!("-{number:05}-of-{count:05}.gguf"))
        .filter(|prefix| !prefix.is_empty())
}

/// Fetches `task` and, when the file declares more than one shard, the
/// remaining shards next to it.
pub fn download_model(
    downloader: &Downloader,
    task: &DownloadTask,
    offline: bool,
) -> Result<FetchOutcome> {
    let outcome = downloader.fetch(task, offline)?;

    let count = match read_split_count(&task.destination)? {
        Some(count) if count > 1 => count,
        _ => return Ok(outcome),
    };
    let shards = shard_tasks(task, count)?;
    info!(
        "{} declares {count} shards, fetching {} more",
        task.destination.display(),
        shards.len()
    );
    fetch_many(downloader, &shards, offline)?;
    Ok(outcome)
}

fn shard_tasks(primary: &DownloadTask, count: u16) -> Result<Vec<DownloadTask>> {
    let mismatch = |name: String| FetchError::SplitNameMismatch { name, count };

    let file_name = primary
        .destination
        .file_name()
        .and_then(OsStr::to_str)
        .ok_or_else(|| mismatch(primary.destination.display().to_string()))?;
    let path_prefix =
        split_prefix(file_name, 1, count).ok_or_else(|| mismatch(file_name.to_string()))?;
    let url_prefix =
        split_prefix(&primary.url, 1, count).ok_or_else(|| mismatch(primary.url.clone()))?;
    let directory = primary.destination.parent().unwrap_or(primary.destination.as_path());

    Ok((2..=count)
        .map(|number| DownloadTask {
            url: split_path(url_prefix, number, count),
            destination: directory.join(split_path(path_prefix, number, count)),
            bearer_token: primary.bearer_token.clone(),
            headers: primary.headers.clone(),
        })
        .collect())
}
