//! Remote store adapters.
//!
//! [`DirRemoteStore`] syncs through a shared directory, [`HttpRemoteStore`]
//! through a small JSON API. Both accept only sealed records from the engine
//! and keep the stored copy unless a put carries a strictly higher version
//! that does not revive a tombstone.

mod dir;
mod http;

pub use dir::DirRemoteStore;
pub use http::HttpRemoteStore;
