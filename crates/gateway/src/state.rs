//! Shared application state passed to all API handlers.

use std::sync::Arc;

use wg_domain::config::Config;
use wg_driver::Driver;
use wg_store::Store;
use wg_worker::WorkerClient;

use crate::channels::ChannelRegistry;
use crate::dispatch::{CancelMap, Dispatcher};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub driver: Arc<dyn Driver>,
    pub worker: WorkerClient,
    pub channels: Arc<ChannelRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub cancels: Arc<CancelMap>,
}

impl AppState {
    pub fn build(config: Arc<Config>, store: Arc<Store>, driver: Arc<dyn Driver>) -> Self {
        let worker = WorkerClient::new();

        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(crate::channels::DuplexChannel::new()));
        registry.register(Arc::new(crate::channels::WebhookDemoChannel::new(
            config.channels.webhook_demo.clone(),
        )));
        let channels = Arc::new(registry);

        let cancels = Arc::new(CancelMap::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            driver.clone(),
            worker.clone(),
            channels.clone(),
            cancels.clone(),
        ));

        Self {
            config,
            store,
            driver,
            worker,
            channels,
            dispatcher,
            cancels,
        }
    }
}
