//! Authentication handshake
//!
//! Runs once per established connection: `Connecting -> Authenticating ->
//! Authenticated`. The login response is correlated like any other response;
//! frames that arrive before it are buffered and handed back to the worker.

use msgcenter_core::{
    Connection, ConnectionError, Inbound, InboundReceiver, LoginStatus, MessageCenterError,
    MessageCenterResult, ProtocolRequest, ProtocolResponse,
};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::correlator::TransactionCorrelator;

/// Status code reported for login responses we cannot interpret
const UNRECOGNIZED_STATUS: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    Authenticating,
    Authenticated,
}

/// Handshake over one connection
pub struct Handshake<'a> {
    state: HandshakeState,
    correlator: &'a TransactionCorrelator,
    login_timeout: Duration,
    deferred: Vec<Inbound>,
}

impl<'a> Handshake<'a> {
    pub fn new(correlator: &'a TransactionCorrelator, login_timeout: Duration) -> Self {
        Self {
            state: HandshakeState::Connecting,
            correlator,
            login_timeout,
            deferred: Vec::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Frames received while waiting for the login response
    pub fn take_deferred(&mut self) -> Vec<Inbound> {
        std::mem::take(&mut self.deferred)
    }

    /// Log in with the token; on failure the state falls back to `Connecting`
    pub async fn authenticate(
        &mut self,
        connection: &mut dyn Connection,
        inbound: &mut InboundReceiver,
        auth_token: &str,
    ) -> MessageCenterResult<()> {
        self.state = HandshakeState::Authenticating;
        let result = self.login(connection, inbound, auth_token).await;
        match &result {
            Ok(()) => {
                info!("authenticated");
                self.state = HandshakeState::Authenticated;
            }
            Err(err) => {
                warn!(error = %err, "login failed");
                self.state = HandshakeState::Connecting;
            }
        }
        result
    }

    async fn login(
        &mut self,
        connection: &mut dyn Connection,
        inbound: &mut InboundReceiver,
        auth_token: &str,
    ) -> MessageCenterResult<()> {
        let tx_id = connection
            .send(ProtocolRequest::Login {
                auth_token: auth_token.to_owned(),
            })
            .await?;

        let (sender, mut receiver) = oneshot::channel();
        self.correlator.register(
            tx_id.clone(),
            Box::new(move |response| {
                let _ = sender.send(response);
            }),
        )?;

        let wait = async {
            loop {
                tokio::select! {
                    response = &mut receiver => {
                        return response.map_err(|_| MessageCenterError::channel("login response"));
                    }
                    frame = inbound.recv() => match frame {
                        Some(Inbound::Response { tx_id, response }) if self.correlator.is_pending(&tx_id) => {
                            self.correlator.dispatch(&tx_id, response);
                        }
                        Some(frame) => {
                            debug!("deferring frame received before login");
                            self.deferred.push(frame);
                        }
                        None => {
                            return Err(ConnectionError::Closed {
                                reason: "closed during login".into(),
                            }
                            .into());
                        }
                    }
                }
            }
        };

        let response = match tokio::time::timeout(self.login_timeout, wait).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.correlator.forget(&tx_id);
                return Err(err);
            }
            Err(_) => {
                self.correlator.forget(&tx_id);
                return Err(ConnectionError::Timeout {
                    duration_ms: self.login_timeout.as_millis() as u64,
                }
                .into());
            }
        };

        match response {
            ProtocolResponse::Login(LoginStatus::LoggedIn)
            | ProtocolResponse::Authenticate { valid: true } => Ok(()),
            ProtocolResponse::Login(LoginStatus::Rejected(status)) => {
                Err(MessageCenterError::LoginRejected { status })
            }
            ProtocolResponse::Authenticate { valid: false } => Err(MessageCenterError::LoginRejected {
                status: UNRECOGNIZED_STATUS,
            }),
            other => {
                warn!(response = ?other, "unexpected login response");
                Err(MessageCenterError::LoginRejected {
                    status: UNRECOGNIZED_STATUS,
                })
            }
        }
    }
}
