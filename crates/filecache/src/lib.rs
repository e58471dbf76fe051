//! A filesystem-backed artifact cache.
//!
//! Artifacts are pulled in from an [`EntrySource`], kept on a [`Filesystem`] for a renewable
//! time to live, and copied out on demand. See [`FileCache`] for the entry point.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod fs;
pub mod logging;
pub mod source;

pub use caching::{CacheError, CacheResult, FileCache};
pub use config::Config;
pub use fs::{Filesystem, LocalFilesystem};
pub use source::{EntrySource, FilesystemSource};
