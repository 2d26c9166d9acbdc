pub(crate) mod cache;
mod download;
mod manager;
mod metadata;
mod retry;
mod service;
mod split;

pub use download::{DownloadTask, Downloader, FetchOutcome};
pub use manager::{HubModel, ModelManager};
pub use metadata::read_split_count;
pub use retry::RetryPolicy;
pub use service::fetch_many;
pub use split::{download_model, split_path, split_prefix};
