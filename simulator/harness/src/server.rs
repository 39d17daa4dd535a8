//! Scripted Server
//!
//! An in-memory stand-in for the messaging server. Every request sent over
//! a connection is recorded and answered according to a `ServerScript`;
//! tests push inbound frames, drop the link and make connects fail to drive
//! the session through its recovery paths.

use async_trait::async_trait;
use msgcenter_core::{
    inbound_channel, ConnectedSession, Connection, ConnectionError, Connector, DeliveryId,
    Inbound, InboundSender, IncomingMessage, LoginStatus, LookupEntry, ProtocolRequest,
    ProtocolResponse, ServerEndpoint, TransactionId, UpdateStatus,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// ----------------------------------------------------------------------------
// Script
// ----------------------------------------------------------------------------

/// How the server answers requests
#[derive(Debug, Clone)]
pub struct ServerScript {
    /// Status code of the login response (0 logs in)
    pub login_status: i32,
    /// Answer logins with the legacy authenticate response
    pub legacy_authenticate: bool,
    /// Never answer logins
    pub ignore_login: bool,
    /// Capability list returned for server info queries
    pub supports: Vec<String>,
    /// Outcome of user info updates
    pub update_status: UpdateStatus,
    /// Entries returned for user lookups
    pub lookup: Vec<LookupEntry>,
    /// Requests (by name) the server records but never answers
    pub unanswered: Vec<&'static str>,
    /// Restart transaction numbering on every connection
    pub per_connection_tx_ids: bool,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            login_status: LoginStatus::LOGGED_IN_CODE,
            legacy_authenticate: false,
            ignore_login: false,
            supports: vec!["mailbox".into(), "presence".into()],
            update_status: UpdateStatus::Success,
            lookup: Vec::new(),
            unanswered: Vec::new(),
            per_connection_tx_ids: false,
        }
    }
}

impl ServerScript {
    /// Script announcing a push sender id in its capability list
    pub fn with_push_sender(sender_id: &str) -> Self {
        let mut script = Self::default();
        script
            .supports
            .push(format!("{}{}", msgcenter_core::PUSH_SENDER_CAPABILITY, sender_id));
        script
    }
}

// ----------------------------------------------------------------------------
// Server State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    script: ServerScript,
    requests: Vec<ProtocolRequest>,
    next_tx: u64,
    next_delivery: u64,
    connects: u32,
    connection_id: u64,
    failing_connects: u32,
    unreachable: bool,
    link: Option<InboundSender>,
    disconnect_on: Option<&'static str>,
    mailbox: Vec<IncomingMessage>,
}

impl ServerState {
    fn next_tx(&mut self) -> TransactionId {
        self.next_tx += 1;
        TransactionId::new(format!("tx-{}", self.next_tx))
    }

    fn respond(&mut self, request: &ProtocolRequest) -> Option<ProtocolResponse> {
        let script = &self.script;
        if script.unanswered.contains(&request.name()) {
            return None;
        }
        match request {
            ProtocolRequest::Login { .. } if script.ignore_login => None,
            ProtocolRequest::Login { .. } if script.legacy_authenticate => {
                Some(ProtocolResponse::Authenticate {
                    valid: script.login_status == LoginStatus::LOGGED_IN_CODE,
                })
            }
            ProtocolRequest::Login { .. } => Some(ProtocolResponse::Login(LoginStatus::from_code(
                script.login_status,
            ))),
            ProtocolRequest::ServerInfo => Some(ProtocolResponse::ServerInfo {
                supports: script.supports.clone(),
            }),
            ProtocolRequest::UserInfoUpdate(_) => {
                Some(ProtocolResponse::UserInfoUpdate(script.update_status))
            }
            ProtocolRequest::SendMessage { .. } => {
                self.next_delivery += 1;
                Some(ProtocolResponse::MessageSent {
                    delivery_id: DeliveryId::new(format!("d-{}", self.next_delivery)),
                })
            }
            ProtocolRequest::UserLookup { user_ids } => Some(ProtocolResponse::UserLookup(
                script
                    .lookup
                    .iter()
                    .filter(|entry| user_ids.iter().any(|id| id.matches(&entry.user_id)))
                    .cloned()
                    .collect(),
            )),
            ProtocolRequest::MailboxFetch => {
                Some(ProtocolResponse::Mailbox(std::mem::take(&mut self.mailbox)))
            }
            ProtocolRequest::PresenceSubscribe { .. }
            | ProtocolRequest::Received { .. }
            | ProtocolRequest::Upload { .. } => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Scripted Server
// ----------------------------------------------------------------------------

/// Shared handle on the scripted server
#[derive(Clone, Default)]
pub struct ScriptedServer {
    state: Arc<Mutex<ServerState>>,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: ServerScript) -> Self {
        let server = Self::new();
        server.lock().script = script;
        server
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connector reaching this server
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(ScriptedConnector {
            server: self.clone(),
        })
    }

    pub fn set_script(&self, script: ServerScript) {
        self.lock().script = script;
    }

    pub fn update_script(&self, update: impl FnOnce(&mut ServerScript)) {
        update(&mut self.lock().script);
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<ProtocolRequest> {
        self.lock().requests.clone()
    }

    /// Requests with the given log name (see `ProtocolRequest::name`)
    pub fn requests_named(&self, name: &str) -> Vec<ProtocolRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|request| request.name() == name)
            .cloned()
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.requests_named(name).len()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    /// Fail the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Refuse every connection attempt while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().link.as_ref().is_some_and(|link| !link.is_closed())
    }

    /// Drop the live connection
    pub fn disconnect(&self) {
        debug!("scripted server dropping connection");
        self.lock().link = None;
    }

    /// Drop the connection when the next request with this name arrives
    pub fn disconnect_on(&self, name: &'static str) {
        self.lock().disconnect_on = Some(name);
    }

    /// Messages returned by the next mailbox fetch
    pub fn queue_mailbox(&self, messages: Vec<IncomingMessage>) {
        self.lock().mailbox.extend(messages);
    }

    /// Push a frame to the client; `false` when not connected
    pub fn deliver(&self, frame: Inbound) -> bool {
        match self.lock().link.as_ref() {
            Some(link) => link.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn deliver_message(&self, message: IncomingMessage) -> bool {
        self.deliver(Inbound::Message(message))
    }

    pub fn deliver_mailbox(&self, messages: Vec<IncomingMessage>) -> bool {
        self.deliver(Inbound::Mailbox(messages))
    }

    /// Send a response for an arbitrary transaction id
    pub fn respond(&self, tx_id: impl Into<TransactionId>, response: ProtocolResponse) -> bool {
        self.deliver(Inbound::Response {
            tx_id: tx_id.into(),
            response,
        })
    }

    /// Wait until at least `count` requests with this name were received
    pub async fn wait_for(&self, name: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count(name) >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Wait until the client holds a live connection
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_connected() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }
}

// ----------------------------------------------------------------------------
// Connector and Connection
// ----------------------------------------------------------------------------

struct ScriptedConnector {
    server: ScriptedServer,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<ConnectedSession, ConnectionError> {
        let mut state = self.server.lock();
        state.connects += 1;
        if state.unreachable || state.failing_connects > 0 {
            state.failing_connects = state.failing_connects.saturating_sub(1);
            return Err(ConnectionError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: "scripted failure".into(),
            });
        }

        let (sender, inbound) = inbound_channel();
        state.connection_id += 1;
        if state.script.per_connection_tx_ids {
            state.next_tx = 0;
        }
        state.link = Some(sender);
        debug!(%endpoint, connection_id = state.connection_id, "scripted connection established");
        Ok(ConnectedSession {
            connection: Box::new(ScriptedConnection {
                server: self.server.clone(),
                connection_id: state.connection_id,
            }),
            inbound,
        })
    }
}

struct ScriptedConnection {
    server: ScriptedServer,
    connection_id: u64,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send(&mut self, request: ProtocolRequest) -> Result<TransactionId, ConnectionError> {
        let mut state = self.server.lock();
        if state.connection_id != self.connection_id || state.link.is_none() {
            return Err(ConnectionError::Closed {
                reason: "connection dropped".into(),
            });
        }

        state.requests.push(request.clone());
        if state.disconnect_on == Some(request.name()) {
            state.disconnect_on = None;
            state.link = None;
            return Err(ConnectionError::Closed {
                reason: format!("dropped on {}", request.name()),
            });
        }

        let tx_id = state.next_tx();
        if let Some(response) = state.respond(&request) {
            if let Some(link) = state.link.as_ref() {
                let _ = link.send(Inbound::Response {
                    tx_id: tx_id.clone(),
                    response,
                });
            }
        }
        Ok(tx_id)
    }

    fn is_connected(&self) -> bool {
        let state = self.server.lock();
        state.connection_id == self.connection_id && state.link.is_some()
    }

    async fn close(&mut self) {
        let mut state = self.server.lock();
        if state.connection_id == self.connection_id {
            state.link = None;
        }
    }
}
