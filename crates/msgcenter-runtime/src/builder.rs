//! Session Builder API
//!
//! Builder-style construction of a `SessionManager` from its configuration
//! and external collaborators.

use msgcenter_core::{
    create_event_channel, ContactDirectory, Connector, Credentials, MediaStorage,
    MemoryMessageStore, MessageCenterError, MessageCenterResult, MessageStore, Preferences,
    PushRegistrar, SessionConfig,
};
use std::sync::Arc;
use tracing::info;

use crate::session::{Collaborators, SessionCore, SessionManager};

// ----------------------------------------------------------------------------
// Session Builder
// ----------------------------------------------------------------------------

/// Builder for a message center session
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
    store: Option<Arc<dyn MessageStore>>,
    credentials: Option<Arc<dyn Credentials>>,
    preferences: Option<Arc<dyn Preferences>>,
    media: Option<Arc<dyn MediaStorage>>,
    registrar: Option<Arc<dyn PushRegistrar>>,
    contacts: Option<Arc<dyn ContactDirectory>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the connector used to reach the server
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the message store; defaults to an in-memory store
    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn Credentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_preferences(mut self, preferences: Arc<dyn Preferences>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaStorage>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn PushRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_contacts(mut self, contacts: Arc<dyn ContactDirectory>) -> Self {
        self.contacts = Some(contacts);
        self
    }

    /// Validate the configuration and assemble the session
    pub fn build(self) -> MessageCenterResult<SessionManager> {
        self.config.validate()?;

        let collaborators = Collaborators {
            connector: required(self.connector, "connector")?,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryMessageStore::new())),
            credentials: required(self.credentials, "credentials")?,
            preferences: required(self.preferences, "preferences")?,
            media: required(self.media, "media storage")?,
            registrar: required(self.registrar, "push registrar")?,
            contacts: required(self.contacts, "contact directory")?,
        };

        let (event_sender, event_receiver) = create_event_channel(self.config.event_buffer_size);
        let core = SessionCore::new(self.config, collaborators, event_sender);
        info!("message center session built");
        Ok(SessionManager::new(core, event_receiver))
    }
}

fn required<T: ?Sized>(value: Option<Arc<T>>, name: &str) -> MessageCenterResult<Arc<T>> {
    value.ok_or_else(|| MessageCenterError::configuration(format!("{name} is required")))
}
