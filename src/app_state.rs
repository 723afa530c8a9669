use std::sync::Arc;

use crate::services::{
    bot::MessageHandler, chat::ChatClient, queue::JobQueue, records::RecordStore,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub queue: Arc<dyn JobQueue>,
    pub chat: Arc<dyn ChatClient>,
    pub handler: Arc<dyn MessageHandler>,
}

impl AppState {
    pub fn new(
        records: Arc<dyn RecordStore>,
        queue: Arc<dyn JobQueue>,
        chat: Arc<dyn ChatClient>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            records,
            queue,
            chat,
            handler,
        }
    }
}
