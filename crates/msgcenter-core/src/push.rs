//! Push notification registration lifecycle
//!
//! Tracks the device's registration with the platform push service and
//! decides when the server must be told about a new (or cleared)
//! registration id. The machine is pure: it consumes `PushEvent`s and
//! returns the `PushAction`s the caller has to carry out.
//!
//! ```text
//! Unregistered --enable (sender known)--> Registering
//! Registering  --registration obtained--> Registered(id)
//! Registered   --sender changed---------> Cycling
//! Cycling      --platform unregistered--> Registering
//! any          --disable----------------> Unregistered
//! ```

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::{PoisonError, RwLock};

use crate::types::JobId;

// ----------------------------------------------------------------------------
// Push Sender
// ----------------------------------------------------------------------------

/// Process-wide push sender id announced by the server
///
/// Owned by the session manager, set by the capability response handler,
/// read by the registration state machine and cleared when the session stops.
#[derive(Debug, Default)]
pub struct PushSenderId(RwLock<Option<String>>);

impl PushSenderId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, sender_id: impl Into<String>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(sender_id.into());
    }

    pub fn clear(&self) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

// ----------------------------------------------------------------------------
// States, Events, Actions
// ----------------------------------------------------------------------------

/// Registration state of this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushState {
    Unregistered,
    Registering,
    Registered(String),
    /// Unregister in progress; re-register under the new sender once confirmed
    Cycling,
}

/// Inputs to the registration state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// User enabled push notifications
    Enable,
    /// User disabled push notifications
    Disable,
    /// Server capability info announced a sender id
    SenderAnnounced {
        sender_id: String,
        /// Sender id persisted from a previous session
        stored_sender_id: Option<String>,
    },
    /// Platform handed us a registration id
    RegistrationObtained(String),
    /// Platform reported that no registration exists (unregister completed)
    PlatformUnregistered,
}

impl PushEvent {
    /// Map a platform "registration id changed" signal onto an explicit event
    pub fn from_registration(registration_id: Option<String>) -> Self {
        match registration_id {
            Some(id) if !id.is_empty() => Self::RegistrationObtained(id),
            _ => Self::PlatformUnregistered,
        }
    }
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAction {
    RegisterWithPlatform { sender_id: String },
    UnregisterFromPlatform,
    PersistSenderId(String),
    /// Send a user info update carrying the id; `None` clears it server side
    InformServer(Option<String>),
}

pub type PushActions = SmallVec<[PushAction; 2]>;

// ----------------------------------------------------------------------------
// Push Registration
// ----------------------------------------------------------------------------

/// Push registration state machine
#[derive(Debug, Clone)]
pub struct PushRegistration {
    state: PushState,
    enabled: bool,
    /// Server confirmed the current registration id
    acknowledged: bool,
    /// The last server update we emitted cleared the id
    cleared_on_server: bool,
    /// Update job whose response decides `acknowledged`
    pending_update: Option<JobId>,
}

impl PushRegistration {
    /// Create the machine from the platform's cached registration, if any
    pub fn new(enabled: bool, cached_registration: Option<String>) -> Self {
        let state = match cached_registration {
            Some(id) if !id.is_empty() => PushState::Registered(id),
            _ => PushState::Unregistered,
        };
        Self {
            state,
            enabled,
            acknowledged: false,
            cleared_on_server: false,
            pending_update: None,
        }
    }

    pub fn state(&self) -> &PushState {
        &self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn registration_id(&self) -> Option<&str> {
        match &self.state {
            PushState::Registered(id) => Some(id),
            _ => None,
        }
    }

    /// Feed an event, returning the actions to perform in order
    pub fn handle(&mut self, event: PushEvent, sender: &PushSenderId) -> PushActions {
        let mut actions = PushActions::new();
        match event {
            PushEvent::Enable => {
                self.enabled = true;
                if self.state == PushState::Unregistered {
                    self.begin_registration(sender, &mut actions);
                }
            }

            PushEvent::Disable => {
                self.enabled = false;
                if matches!(self.state, PushState::Registered(_) | PushState::Cycling) {
                    actions.push(PushAction::UnregisterFromPlatform);
                }
                self.state = PushState::Unregistered;
                self.inform_server(None, &mut actions);
            }

            PushEvent::SenderAnnounced {
                sender_id,
                stored_sender_id,
            } => {
                sender.set(sender_id.clone());
                if !self.enabled {
                    return actions;
                }
                actions.push(PushAction::PersistSenderId(sender_id.clone()));

                let changed = stored_sender_id.is_some_and(|stored| stored != sender_id);
                match self.state.clone() {
                    PushState::Registered(_) if changed => {
                        self.state = PushState::Cycling;
                        actions.push(PushAction::UnregisterFromPlatform);
                    }
                    PushState::Registered(id) => {
                        self.inform_server(Some(id), &mut actions);
                    }
                    PushState::Cycling => {}
                    PushState::Unregistered | PushState::Registering => {
                        self.begin_registration(sender, &mut actions);
                    }
                }
            }

            PushEvent::RegistrationObtained(id) => {
                if !self.enabled {
                    // registration completed after the user disabled push
                    actions.push(PushAction::UnregisterFromPlatform);
                    return actions;
                }
                self.state = PushState::Registered(id.clone());
                self.inform_server(Some(id), &mut actions);
            }

            PushEvent::PlatformUnregistered => match self.state {
                PushState::Cycling => {
                    self.state = PushState::Unregistered;
                    self.begin_registration(sender, &mut actions);
                }
                PushState::Registered(_) | PushState::Registering => {
                    self.state = PushState::Unregistered;
                    self.inform_server(None, &mut actions);
                }
                PushState::Unregistered => {
                    if !self.cleared_on_server {
                        self.inform_server(None, &mut actions);
                    }
                }
            },
        }
        actions
    }

    fn begin_registration(&mut self, sender: &PushSenderId, actions: &mut PushActions) {
        if let Some(sender_id) = sender.get() {
            self.state = PushState::Registering;
            actions.push(PushAction::RegisterWithPlatform { sender_id });
        }
    }

    fn inform_server(&mut self, registration_id: Option<String>, actions: &mut PushActions) {
        self.acknowledged = false;
        self.cleared_on_server = registration_id.is_none();
        actions.push(PushAction::InformServer(registration_id));
    }

    /// Remember the job carrying the latest server update
    pub fn update_submitted(&mut self, job_id: JobId) {
        self.pending_update = Some(job_id);
    }

    /// Server answered the update job; stale jobs are ignored
    pub fn update_answered(&mut self, job_id: JobId, success: bool) {
        if self.pending_update != Some(job_id) {
            return;
        }
        self.pending_update = None;
        self.acknowledged = success && self.registration_id().is_some();
    }

    /// Update job failed; the state is kept, only the acknowledgement is reset
    pub fn update_failed(&mut self, job_id: JobId) {
        if self.pending_update == Some(job_id) {
            self.pending_update = None;
        }
        self.acknowledged = false;
    }

    /// Drop transaction bookkeeping when the session stops
    pub fn reset_session(&mut self) {
        self.pending_update = None;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn inform_count(actions: &PushActions, id: Option<&str>) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, PushAction::InformServer(x) if x.as_deref() == id))
            .count()
    }

    #[test]
    fn test_enable_without_sender_stays_unregistered() {
        let sender = PushSenderId::new();
        let mut push = PushRegistration::new(false, None);
        let actions = push.handle(PushEvent::Enable, &sender);
        assert!(actions.is_empty());
        assert_eq!(push.state(), &PushState::Unregistered);
        assert!(push.is_enabled());
    }

    #[test]
    fn test_sender_announced_starts_registration_without_cycling() {
        let sender = PushSenderId::new();
        let mut push = PushRegistration::new(true, None);
        let actions = push.handle(
            PushEvent::SenderAnnounced {
                sender_id: "sender123".into(),
                stored_sender_id: None,
            },
            &sender,
        );
        assert_eq!(push.state(), &PushState::Registering);
        assert_eq!(sender.get().as_deref(), Some("sender123"));
        assert_eq!(
            actions.as_slice(),
            &[
                PushAction::PersistSenderId("sender123".into()),
                PushAction::RegisterWithPlatform {
                    sender_id: "sender123".into()
                },
            ]
        );
    }

    #[test]
    fn test_registration_informs_server() {
        let sender = PushSenderId::new();
        sender.set("s");
        let mut push = PushRegistration::new(true, None);
        push.handle(PushEvent::Enable, &sender);
        assert_eq!(push.state(), &PushState::Registering);

        let actions = push.handle(PushEvent::RegistrationObtained("reg-1".into()), &sender);
        assert_eq!(push.state(), &PushState::Registered("reg-1".into()));
        assert_eq!(inform_count(&actions, Some("reg-1")), 1);
    }

    #[test]
    fn test_sender_change_cycles_then_reregisters() {
        let sender = PushSenderId::new();
        let mut push = PushRegistration::new(true, Some("old-reg".into()));

        let actions = push.handle(
            PushEvent::SenderAnnounced {
                sender_id: "new-sender".into(),
                stored_sender_id: Some("old-sender".into()),
            },
            &sender,
        );
        assert_eq!(push.state(), &PushState::Cycling);
        assert!(actions.contains(&PushAction::UnregisterFromPlatform));

        let actions = push.handle(PushEvent::from_registration(None), &sender);
        assert_eq!(push.state(), &PushState::Registering);
        assert_eq!(
            actions.as_slice(),
            &[PushAction::RegisterWithPlatform {
                sender_id: "new-sender".into()
            }]
        );
    }

    #[test]
    fn test_same_sender_resends_existing_registration() {
        let sender = PushSenderId::new();
        let mut push = PushRegistration::new(true, Some("reg".into()));
        let actions = push.handle(
            PushEvent::SenderAnnounced {
                sender_id: "s".into(),
                stored_sender_id: Some("s".into()),
            },
            &sender,
        );
        assert_eq!(push.state(), &PushState::Registered("reg".into()));
        assert_eq!(inform_count(&actions, Some("reg")), 1);
    }

    #[test]
    fn test_disable_from_any_state_emits_one_clear() {
        let sender = PushSenderId::new();
        sender.set("s");
        let starts = [
            PushRegistration::new(true, None),
            PushRegistration::new(true, Some("reg".into())),
            {
                let mut p = PushRegistration::new(true, None);
                p.handle(PushEvent::Enable, &sender);
                p
            },
            {
                let mut p = PushRegistration::new(true, Some("reg".into()));
                p.handle(
                    PushEvent::SenderAnnounced {
                        sender_id: "s".into(),
                        stored_sender_id: Some("other".into()),
                    },
                    &sender,
                );
                p
            },
        ];

        for mut push in starts {
            let mut actions = push.handle(PushEvent::Disable, &sender);
            // the platform later confirms the unregister
            actions.extend(push.handle(PushEvent::PlatformUnregistered, &sender));
            assert_eq!(push.state(), &PushState::Unregistered);
            assert_eq!(inform_count(&actions, None), 1);
            assert!(!push.is_enabled());
        }
    }

    #[test]
    fn test_registration_after_disable_is_undone() {
        let sender = PushSenderId::new();
        let mut push = PushRegistration::new(true, None);
        push.handle(PushEvent::Disable, &sender);
        let actions = push.handle(PushEvent::RegistrationObtained("late".into()), &sender);
        assert_eq!(actions.as_slice(), &[PushAction::UnregisterFromPlatform]);
        assert_eq!(push.state(), &PushState::Unregistered);
    }

    #[test]
    fn test_acknowledgement_tracking() {
        let sender = PushSenderId::new();
        let mut push = PushRegistration::new(true, None);
        push.handle(PushEvent::RegistrationObtained("reg".into()), &sender);

        let stale = JobId::new();
        let current = JobId::new();
        push.update_submitted(current);
        push.update_answered(stale, true);
        assert!(!push.is_acknowledged());

        push.update_answered(current, true);
        assert!(push.is_acknowledged());

        push.update_failed(JobId::new());
        assert!(!push.is_acknowledged());
        assert_eq!(push.state(), &PushState::Registered("reg".into()));
    }
}
