//! Rental engine for upstream proxy ports. A small axum daemon leases
//! endpoints out of a fixed catalog, queues callers when nothing matching is
//! free, and rotates exit addresses whenever a port comes back.

use std::sync::Arc;

pub mod allocator;
pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod notify;
pub mod rotation;
pub mod testing;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::db::Store;
use crate::notify::AdminNotifier;
use crate::rotation::ProxyProber;

/// Shared handles threaded through the routes and background jobs.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub cfg: Arc<Config>,
    pub prober: Arc<dyn ProxyProber>,
    pub notifier: Arc<dyn AdminNotifier>,
    pub auth: Arc<dyn Authenticator>,
}
