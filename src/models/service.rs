use std::thread;

use crossbeam_channel::unbounded;
use tracing::{debug, error};

use super::download::{DownloadTask, Downloader, FetchOutcome};
use crate::core::{FetchError, Result};
use crate::http::mask_url;

/// Fetches every task on its own thread and waits for all of them.
///
/// Members keep going when a sibling fails; the batch reports failure if any
/// member failed, carrying the error of the lowest-indexed failure.
pub fn fetch_many(
    downloader: &Downloader,
    tasks: &[DownloadTask],
    offline: bool,
) -> Result<Vec<FetchOutcome>> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    let (sender, receiver) = unbounded();
    thread::scope(|scope| {
        for (index, task) in tasks.iter().enumerate() {
            let sender = sender.clone();
            scope.spawn(move || {
                let result = downloader.fetch(task, offline);
                let _ = sender.send((index, result));
            });
        }
    });
    drop(sender);

    let mut outcomes: Vec<Option<FetchOutcome>> = vec![None; tasks.len()];
    let mut failures: Vec<(usize, FetchError)> = Vec::new();
    for (index, result) in receiver.iter() {
        match result {
            Ok(outcome) => outcomes[index] = Some(outcome),
            Err(err) => {
                error!("download of {} failed: {err}", mask_url(&tasks[index].url));
                failures.push((index, err));
            }
        }
    }

    if failures.is_empty() {
        let outcomes: Vec<FetchOutcome> = outcomes.into_iter().flatten().collect();
        let bytes: u64 = outcomes.iter().map(FetchOutcome::transferred).sum();
        debug!("batch of {} downloads finished, {bytes} bytes transferred", tasks.len());
        return Ok(outcomes);
    }

    failures.sort_by_key(|(index, _)| *index);
    let failed = failures.len();
    let (_, first) = failures.swap_remove(0);
    Err(FetchError::BatchFailed {
        failed,
        total: tasks.len(),
        first: Box::new(first),
    })
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use super::*;
    use crate::core::ErrorKind;
    use crate::http::testing::{FakeTransport, Resource};
    use crate::models::RetryPolicy;

    fn shard_url(index: usize) -> String {
        format!("https://models.example/shard-{index}.gguf")
    }

    #[test]
    fn every_member_is_installed() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new();
        let tasks: Vec<_> = (1..=4)
            .map(|index| {
                transport.serve(&shard_url(index), Resource::new(format!("shard {index}")));
                DownloadTask::new(shard_url(index), dir.path().join(format!("{index}.gguf")))
            })
            .collect();
        let downloader = Downloader::new(Arc::new(transport.clone()), RetryPolicy::immediate(3));

        let outcomes = fetch_many(&downloader, &tasks, false).unwrap();

        assert_eq!(outcomes.len(), 4);
        for (index, task) in (1..=4).zip(&tasks) {
            assert_eq!(
                fs::read_to_string(&task.destination).unwrap(),
                format!("shard {index}")
            );
        }
    }

    #[test]
    fn one_failure_fails_the_batch_without_stopping_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new();
        transport.serve(&shard_url(1), Resource::new("one"));
        transport.serve(&shard_url(3), Resource::new("three"));
        let tasks: Vec<_> = (1..=3)
            .map(|index| {
                DownloadTask::new(shard_url(index), dir.path().join(format!("{index}.gguf")))
            })
            .collect();
        let downloader = Downloader::new(Arc::new(transport), RetryPolicy::immediate(3));

        let err = fetch_many(&downloader, &tasks, false).unwrap_err();

        match &err {
            FetchError::BatchFailed { failed, total, first } => {
                assert_eq!((*failed, *total), (1, 3));
                assert!(matches!(**first, FetchError::HttpStatus { status: 404, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(tasks[0].destination.exists());
        assert!(tasks[2].destination.exists());
    }

    #[test]
    fn empty_batch_succeeds() {
        let transport = FakeTransport::new();
        let downloader = Downloader::new(Arc::new(transport.clone()), RetryPolicy::immediate(3));
        assert!(fetch_many(&downloader, &[], false).unwrap().is_empty());
        assert_eq!(transport.total_requests(), 0);
    }
}
