//! Infrastructure layer: record and object stores, external clients, the
//! request-path pipeline and scheduled maintenance jobs.

pub mod blob;
pub mod bootstrap;
pub mod cache;
pub mod composition;
pub mod config;
pub mod fetch;
pub mod gateway;
pub mod ledger;
pub mod maintenance;
pub mod retry;
pub mod service;
pub mod store;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
