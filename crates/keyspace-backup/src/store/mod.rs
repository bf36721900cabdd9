//! `ObjectStore` backends selected by `[store] kind`.

use crate::collab::ObjectStore;
use crate::config::{StoreConfig, StoreKind};
use crate::error::Result;

pub mod http;
pub mod local;
pub mod s3;

pub use http::HttpStore;
pub use local::LocalStore;
pub use s3::S3Store;

pub fn open_store(cfg: &StoreConfig) -> Result<Box<dyn ObjectStore>> {
    let store: Box<dyn ObjectStore> = match cfg.kind {
        StoreKind::S3 => Box::new(S3Store::new(&cfg.s3)?),
        StoreKind::Http => Box::new(HttpStore::new(&cfg.http)?),
        StoreKind::Local => Box::new(LocalStore::new(&cfg.local.root)?),
    };
    tracing::debug!(kind = ?cfg.kind, "object store ready");
    Ok(store)
}

/// Keys are stored without their leading `/`.
pub(crate) fn object_name(key: &str) -> &str {
    key.trim_start_matches('/')
}
