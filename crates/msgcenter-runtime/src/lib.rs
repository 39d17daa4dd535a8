//! Message Center Runtime
//!
//! The concurrent half of the message center session: the request worker
//! that owns the connection, the transaction correlator and login
//! handshake, the incoming message processor, the push coordinator and the
//! session manager tying them together.
//!
//! ```text
//! callers --submit--> JobQueue --due job--> RequestWorker --request--> server
//!                                               |  ^
//!        IncomingProcessor <--messages----------+  +--responses--> TransactionCorrelator
//! ```

pub mod builder;
pub mod correlator;
pub mod handshake;
pub mod jobs;
pub mod processor;
pub mod push;
pub mod session;
pub mod submit;
pub mod worker;

pub use builder::SessionBuilder;
pub use correlator::TransactionCorrelator;
pub use handshake::{Handshake, HandshakeState};
pub use jobs::{AckJob, RequestJob, SendMessageJob, SendPayload};
pub use processor::IncomingProcessor;
pub use push::PushCoordinator;
pub use session::SessionManager;
pub use submit::JobSink;
pub use worker::{RefCount, RequestWorker, WorkerCommand, WorkerContext, WorkerHandle, WorkerHooks};

// Re-export core types for convenience
pub use msgcenter_core::*;
