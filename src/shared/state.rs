use std::sync::Arc;

use crate::backends::BackendRegistry;
use crate::config::AppConfig;
use crate::notify::NotificationDispatcher;
use crate::realtime::UpdatePublisher;
use crate::shared::utils::DbPool;

pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub registry: Arc<BackendRegistry>,
    pub publisher: Arc<UpdatePublisher>,
    pub notifier: Arc<NotificationDispatcher>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            publisher: Arc::clone(&self.publisher),
            notifier: Arc::clone(&self.notifier),
        }
    }
}
