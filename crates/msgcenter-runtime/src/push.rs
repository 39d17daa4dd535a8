//! Push Coordinator
//!
//! Owns the push registration state machine and carries out the actions it
//! requests: platform (un)registration through the registrar, sender id
//! persistence through the preferences, and user info update jobs telling
//! the server about the registration id.

use msgcenter_core::{
    Job, JobId, Preferences, ProtocolResponse, PushAction, PushEvent, PushRegistrar, PushRegistration,
    PushSenderId, PushState,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::jobs::RequestJob;
use crate::submit::JobSink;

pub struct PushCoordinator {
    machine: Mutex<PushRegistration>,
    sender_id: Arc<PushSenderId>,
    registrar: Arc<dyn PushRegistrar>,
    preferences: Arc<dyn Preferences>,
}

impl PushCoordinator {
    /// Initial state comes from the preferences and the registrar's cached id
    pub fn new(
        registrar: Arc<dyn PushRegistrar>,
        preferences: Arc<dyn Preferences>,
        sender_id: Arc<PushSenderId>,
    ) -> Self {
        let machine = PushRegistration::new(preferences.push_enabled(), registrar.registration_id());
        Self {
            machine: Mutex::new(machine),
            sender_id,
            registrar,
            preferences,
        }
    }

    fn machine(&self) -> MutexGuard<'_, PushRegistration> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> PushState {
        self.machine().state().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.machine().is_enabled()
    }

    /// Whether the server acknowledged the current registration id
    pub fn is_acknowledged(&self) -> bool {
        self.machine().is_acknowledged()
    }

    pub fn registration_id(&self) -> Option<String> {
        self.machine().registration_id().map(str::to_owned)
    }

    pub fn sender_id(&self) -> Option<String> {
        self.sender_id.get()
    }

    /// Capability info announced a sender id
    pub fn sender_announced(self: &Arc<Self>, sender_id: &str, sink: &dyn JobSink) {
        let stored_sender_id = self.preferences.push_sender_id();
        self.handle(
            PushEvent::SenderAnnounced {
                sender_id: sender_id.to_owned(),
                stored_sender_id,
            },
            sink,
        );
    }

    /// Feed an event and perform the resulting actions
    pub fn handle(self: &Arc<Self>, event: PushEvent, sink: &dyn JobSink) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            debug!(?event, "push registration event");
            let actions = self.machine().handle(event, &self.sender_id);
            for action in actions {
                if let Some(next) = self.apply(action, sink) {
                    events.push_back(next);
                }
            }
        }
    }

    fn apply(self: &Arc<Self>, action: PushAction, sink: &dyn JobSink) -> Option<PushEvent> {
        match action {
            PushAction::RegisterWithPlatform { sender_id } => {
                if let Some(cached) = self.registrar.registration_id().filter(|id| !id.is_empty()) {
                    debug!("platform registration already cached");
                    return Some(PushEvent::RegistrationObtained(cached));
                }
                info!(%sender_id, "registering with push platform");
                let registrar = self.registrar.clone();
                tokio::spawn(async move {
                    if let Err(err) = registrar.register(&sender_id).await {
                        warn!(error = %err, "push registration request failed");
                    }
                });
            }
            PushAction::UnregisterFromPlatform => {
                info!("unregistering from push platform");
                let registrar = self.registrar.clone();
                tokio::spawn(async move {
                    if let Err(err) = registrar.unregister().await {
                        warn!(error = %err, "push unregistration request failed");
                    }
                });
            }
            PushAction::PersistSenderId(sender_id) => {
                self.preferences.set_push_sender_id(&sender_id);
            }
            PushAction::InformServer(registration_id) => {
                let job = RequestJob::push_registration(registration_id);
                let job_id = job.id();
                let coordinator = Arc::clone(self);
                let job = job.on_response(move |response| {
                    let success = matches!(
                        response,
                        ProtocolResponse::UserInfoUpdate(status) if status.is_success()
                    );
                    coordinator.update_answered(job_id, success);
                });
                self.machine().update_submitted(job_id);
                sink.submit(Arc::new(job), Duration::ZERO);
            }
        }
        None
    }

    fn update_answered(&self, job_id: JobId, success: bool) {
        let acknowledged = {
            let mut machine = self.machine();
            machine.update_answered(job_id, success);
            machine.is_acknowledged()
        };
        debug!(%job_id, success, "push registration update answered");
        self.registrar.set_registered_on_server(acknowledged);
    }

    /// The update job failed; the state is kept
    pub fn update_failed(&self, job_id: JobId) {
        self.machine().update_failed(job_id);
        self.registrar.set_registered_on_server(false);
    }

    /// Discard the in-flight update handle when the session stops
    pub fn reset_session(&self) {
        self.machine().reset_session();
        self.sender_id.clear();
    }
}
