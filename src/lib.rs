pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod execution;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod services;
pub mod trigger;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::StateStore;
use crate::execution::{Dispatcher, IdempotencyGuard};
use crate::registry::SubscriptionRegistry;
use crate::services::subscriptions::SubscriptionService;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub config: AppConfig,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub registry: Arc<SubscriptionRegistry>,
    pub guard: Arc<IdempotencyGuard>,
    pub subscriptions: Arc<SubscriptionService>,
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub pause_flag: Arc<AtomicBool>,
}

impl AppState {
    pub fn is_paused(&self) -> bool {
        self.pause_flag.load(Ordering::SeqCst)
    }
}
