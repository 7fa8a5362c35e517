//! Shared application state

use std::sync::Arc;

use crate::auth::IdentityProvider;
use crate::chat::{ChatService, ChatStore};
use crate::config::Config;
use crate::websocket::Hub;

/// Everything a handler can reach. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ChatStore>,
    pub hub: Hub,
    pub chat: ChatService,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    /// Wire the service layer around an already-running hub
    pub fn new(
        config: Config,
        store: Arc<dyn ChatStore>,
        hub: Hub,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let chat = ChatService::new(Arc::clone(&store), hub.clone(), config.purge_retention());
        Self {
            config: Arc::new(config),
            store,
            hub,
            chat,
            identity,
        }
    }
}
