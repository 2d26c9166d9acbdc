pub mod hub;
pub mod index;
pub mod oci;

pub use hub::{HubFile, HubReference};
pub use index::{list_cached, CachedModelInfo};
pub use oci::{validate_digest, OciReference};
