//! Message Center Core
//!
//! Data model, protocol structures, errors and configuration of the message
//! center session, together with the pure pieces of its machinery: the
//! delay-aware job queue and the push registration state machine.

pub mod collaborators;
pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod job;
pub mod message;
pub mod protocol;
pub mod push;
pub mod queue;
pub mod store;
pub mod types;

pub use collaborators::{
    ContactDirectory, Credentials, MediaStorage, Preferences, PushRegistrar, StaticCredentials,
};
pub use config::SessionConfig;
pub use connection::{inbound_channel, ConnectedSession, Connection, Connector, InboundReceiver, InboundSender};
pub use errors::{ConnectionError, MessageCenterError, MessageCenterResult, PushError, StoreError};
pub use events::{create_event_channel, SessionEvent, SessionEventReceiver, SessionEventSender, StopReason};
pub use job::{Job, JobEvent, JobKind, JobListener, JobProgress, JobStatus, NoopJobListener, ResponseHandler};
pub use message::{ContentKind, IncomingMessage, MessageKind, PresenceData, ReceiptEntry, ReceiptStatus};
pub use protocol::{
    Inbound, LoginStatus, LookupEntry, OutgoingContent, ProtocolRequest, ProtocolResponse,
    UpdateStatus, UserInfoUpdate, PUSH_SENDER_CAPABILITY,
};
pub use push::{PushAction, PushActions, PushEvent, PushRegistration, PushSenderId, PushState};
pub use queue::{JobQueue, PushOutcome};
pub use store::{Direction, MemoryMessageStore, MessageStatus, MessageStore, OutgoingRecord, StoredMessage};
pub use types::{DeliveryId, JobId, LocalMessageId, ServerEndpoint, Timestamp, TransactionId, UserId};
