//! Message Center Harness
//!
//! Test infrastructure for the message center session: a scripted server
//! reachable through the `Connector` seam and in-memory fakes for every
//! external collaborator.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use msgcenter_harness::{ScriptedServer, ServerScript};
//!
//! let server = ScriptedServer::with_script(ServerScript::with_push_sender("sender123"));
//! let connector = server.connector();
//! // build a session with `connector`, start it, then:
//! assert!(server.wait_for("server-info", 1, Duration::from_secs(1)).await);
//! ```
//!
//! # Server Behaviour
//!
//! - **Logins** are answered with the scripted status code
//! - **Requests** are recorded in order and answered under `tx-N` ids
//! - **Sent messages** get delivery ids `d-1`, `d-2`, ...
//! - **Failures**: refused connects, dropped links, drop-on-request

pub mod collaborators;
pub mod server;

pub use collaborators::{FakeContacts, FakeRegistrar, MemoryMediaStorage, MemoryPreferences};
pub use server::{ScriptedServer, ServerScript};
