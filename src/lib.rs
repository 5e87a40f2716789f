#![deny(
    clippy::all,
    clippy::missing_const_for_fn,
    clippy::pedantic,
    clippy::missing_docs_in_private_items,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    unsafe_code,
    unused
)]
#![doc = include_str!("../README.md")]
#![allow(
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::semicolon_if_nothing_returned
)]

pub mod bucket;
pub mod error;
pub mod headers;
pub mod limiter;
pub mod request;

mod manager;

pub use self::{
    bucket::{Bucket, BucketGuard},
    error::{RatelimitError, RatelimitErrorType},
    headers::RatelimitHeaders,
    limiter::{GlobalLimiter, WindowedLimiter, GLOBAL_LIMIT_PERIOD},
    manager::BucketManager,
    request::{CompiledRoute, Method, Route},
};

/// Sentinel bucket hash for routes the API has not assigned a bucket to yet.
///
/// Buckets whose name begins with this sentinel are *unresolved*: their
/// acquirers skip the per-bucket window, since no window parameters have
/// been learned, but still take the bucket's gate and the global limiter.
pub const UNKNOWN_HASH: &str = "UNKNOWN";
