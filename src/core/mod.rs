pub mod error;
pub mod logging;
pub mod settings;

pub use error::{ErrorKind, FetchError, Result};
pub use settings::{OciSettings, RetrySettings, Settings};
