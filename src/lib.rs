pub mod core;
pub mod http;
pub mod models;
pub mod registry;

pub use crate::core::{ErrorKind, FetchError, Settings};
pub use crate::models::{HubModel, ModelManager};
pub use crate::registry::CachedModelInfo;
