//! Disk cache for large remote resources that can be read while they are still being
//! transferred, and resumed across restarts without fetching bytes again.
//!
//! A [`CacheManager`] hands out [`CacheReader`]s. Reading waits for the requested bytes, which a
//! single background [`Loader`] per resource copies block by block from a [`RemoteSource`] into
//! the resource's data file. Which blocks are present is tracked by the [`CacheEntry`], whose
//! metadata the manager persists periodically next to the data.

mod config;
mod data_access;
mod entry;
pub mod error;
mod holder;
mod loader;
mod manager;
mod persister;
mod reader;
mod remote;
mod resolver;
mod store;
mod sweep;

#[rustfmt::skip]
pub use config::CacheConfig;
#[rustfmt::skip]
pub use data_access::{
    DataAccess, DataAccessFactory, FileDataAccess, FileDataAccessFactory, OpenedDataAccess,
    ReportingDataAccess, HEADER_LEN,
};
#[rustfmt::skip]
pub use entry::{CacheEntry, WriteListener};
#[rustfmt::skip]
pub use loader::{Loader, Step};
#[rustfmt::skip]
pub use manager::CacheManager;
#[rustfmt::skip]
pub use persister::CacheEntryPersister;
#[rustfmt::skip]
pub use reader::CacheReader;
#[rustfmt::skip]
pub use remote::{HttpRemote, HttpStream, RemoteSource, RemoteStream};
#[rustfmt::skip]
pub use resolver::{CachingUrlInfoResolver, HttpUrlInfoResolver, UrlInfo, UrlInfoResolver};
#[rustfmt::skip]
pub use store::{CacheEntryStore, IndexRecord};
#[rustfmt::skip]
pub use sweep::SweepStats;
