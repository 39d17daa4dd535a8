//! Shared fixture for session integration tests

#![allow(dead_code)]

use msgcenter_harness::{
    FakeContacts, FakeRegistrar, MemoryMediaStorage, MemoryPreferences, ScriptedServer,
    ServerScript,
};
use msgcenter_runtime::{
    MemoryMessageStore, ServerEndpoint, SessionBuilder, SessionConfig, SessionEvent,
    SessionEventReceiver, SessionManager, StaticCredentials,
};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn endpoint() -> ServerEndpoint {
    ServerEndpoint::new("msg.test", 5222)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Knobs applied before the session is built
pub struct Setup {
    pub config: SessionConfig,
    pub script: ServerScript,
    pub preferences: MemoryPreferences,
    pub registrar: FakeRegistrar,
    pub token: Option<String>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            config: SessionConfig::testing(),
            script: ServerScript::default(),
            preferences: MemoryPreferences::new(),
            registrar: FakeRegistrar::new(),
            token: Some("token-1".into()),
        }
    }
}

impl Setup {
    pub fn build(self) -> Fixture {
        init_tracing();
        let server = ScriptedServer::with_script(self.script);
        let store = Arc::new(MemoryMessageStore::new());
        let preferences = Arc::new(self.preferences);
        let registrar = Arc::new(self.registrar);
        let contacts = Arc::new(FakeContacts::new());
        let media = Arc::new(MemoryMediaStorage::new());
        let credentials = match self.token {
            Some(token) => StaticCredentials::new(token),
            None => StaticCredentials::none(),
        };

        let mut session = SessionBuilder::new()
            .with_config(self.config)
            .with_connector(server.connector())
            .with_store(store.clone())
            .with_credentials(Arc::new(credentials))
            .with_preferences(preferences.clone())
            .with_media(media.clone())
            .with_registrar(registrar.clone())
            .with_contacts(contacts.clone())
            .build()
            .expect("session builds");
        let events = session.take_event_receiver().expect("event receiver");

        Fixture {
            server,
            store,
            preferences,
            registrar,
            contacts,
            media,
            session,
            events,
        }
    }
}

pub struct Fixture {
    pub server: ScriptedServer,
    pub store: Arc<MemoryMessageStore>,
    pub preferences: Arc<MemoryPreferences>,
    pub registrar: Arc<FakeRegistrar>,
    pub contacts: Arc<FakeContacts>,
    pub media: Arc<MemoryMediaStorage>,
    pub session: SessionManager,
    pub events: SessionEventReceiver,
}

impl Fixture {
    pub fn new() -> Self {
        Setup::default().build()
    }

    /// Start the session and wait until it logged in
    pub async fn start_connected(&mut self) {
        self.session.start(endpoint()).expect("session starts");
        self.wait_event(|event| matches!(event, SessionEvent::Connected))
            .await;
    }

    /// Wait for the first event matching `predicate`, dropping the ones before it
    pub async fn wait_event(&mut self, predicate: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(event) if predicate(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .expect("expected event not received")
    }

    /// Events already published, without waiting
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait until the server saw `count` requests with this name
    pub async fn wait_requests(&self, name: &str, count: usize) {
        assert!(
            self.server.wait_for(name, count, WAIT).await,
            "expected {count} {name} request(s), got {}",
            self.server.count(name)
        );
    }
}

/// Poll `condition` until it holds
pub async fn eventually(condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(WAIT, poll)
        .await
        .expect("condition not reached in time");
}

/// Let spawned tasks and the worker run to quiescence
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
