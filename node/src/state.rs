use crate::chats::ChatDirectory;
use crate::config::AppConfig;
use crate::sync::Connectivity;
use chatmirror_messaging::OutboundTransport;
use std::sync::Arc;
use tokio::sync::watch;

pub struct AppState {
    config: AppConfig,
    directory: Arc<ChatDirectory>,
    transport: Arc<dyn OutboundTransport>,
    connectivity: watch::Receiver<Connectivity>,
    checkpoint: watch::Receiver<i64>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        directory: Arc<ChatDirectory>,
        transport: Arc<dyn OutboundTransport>,
        connectivity: watch::Receiver<Connectivity>,
        checkpoint: watch::Receiver<i64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            directory,
            transport,
            connectivity,
            checkpoint,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build_id(&self) -> &str {
        &self.config.build_id
    }

    pub fn directory(&self) -> &ChatDirectory {
        &self.directory
    }

    pub fn transport(&self) -> &dyn OutboundTransport {
        self.transport.as_ref()
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    /// Remote checkpoint of the last successful sync.
    pub fn checkpoint(&self) -> i64 {
        *self.checkpoint.borrow()
    }
}
