//! Integration tests for push notification registration
//!
//! The server announces a sender id in its capability list; the session
//! registers with the platform, reports the registration id to the server
//! and cycles the registration when the sender changes.

mod common;

use common::{eventually, settle, Fixture, Setup};
use msgcenter_harness::{FakeRegistrar, MemoryPreferences, ServerScript};
use msgcenter_runtime::{
    Preferences, ProtocolRequest, PushState, SessionEvent, StopReason, UpdateStatus,
    UserInfoUpdate,
};

fn push_updates(fixture: &Fixture) -> Vec<String> {
    fixture
        .server
        .requests_named("user-info-update")
        .into_iter()
        .filter_map(|request| match request {
            ProtocolRequest::UserInfoUpdate(UserInfoUpdate {
                push_registration_id: Some(id),
                ..
            }) => Some(id),
            _ => None,
        })
        .collect()
}

fn setup(preferences: MemoryPreferences, registrar: FakeRegistrar) -> Setup {
    Setup {
        script: ServerScript::with_push_sender("sender123"),
        preferences,
        registrar,
        ..Setup::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_sender_announcement_registers_without_cycling() {
    let mut fixture = setup(
        MemoryPreferences::new().with_push_enabled(true),
        FakeRegistrar::new(),
    )
    .build();
    fixture.start_connected().await;

    let registrar = fixture.registrar.clone();
    eventually(|| registrar.registrations() == vec!["sender123".to_string()]).await;
    assert_eq!(fixture.session.push_state(), PushState::Registering);
    assert_eq!(fixture.registrar.unregistrations(), 0);
    assert_eq!(
        fixture.preferences.push_sender_id().as_deref(),
        Some("sender123")
    );
    assert_eq!(fixture.session.push_sender_id().as_deref(), Some("sender123"));
    assert!(push_updates(&fixture).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_obtained_registration_is_acknowledged_by_server() {
    let mut fixture = setup(
        MemoryPreferences::new().with_push_enabled(true),
        FakeRegistrar::new(),
    )
    .build();
    fixture.start_connected().await;
    let registrar = fixture.registrar.clone();
    eventually(|| !registrar.registrations().is_empty()).await;

    fixture
        .session
        .push_registration_changed(Some("reg-1".into()));
    assert_eq!(
        fixture.session.push_state(),
        PushState::Registered("reg-1".into())
    );

    let session = &fixture.session;
    eventually(|| session.push_acknowledged()).await;
    assert!(fixture.registrar.is_registered_on_server());
    assert_eq!(push_updates(&fixture), vec!["reg-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_disable_clears_registration_once() {
    let mut fixture = setup(
        MemoryPreferences::new()
            .with_push_enabled(true)
            .with_sender_id("sender123"),
        FakeRegistrar::with_cached_id("reg-1"),
    )
    .build();
    fixture.start_connected().await;

    let session = &fixture.session;
    eventually(|| session.push_acknowledged()).await;

    fixture.session.push_disable();
    assert_eq!(fixture.session.push_state(), PushState::Unregistered);
    assert!(!fixture.session.push_acknowledged());

    let registrar = fixture.registrar.clone();
    eventually(|| registrar.unregistrations() == 1).await;

    // the platform confirms the removal; the server was already told
    fixture.session.push_registration_changed(None);
    settle().await;
    let server = fixture.server.clone();
    eventually(|| server.count("user-info-update") >= 3).await;
    settle().await;

    assert_eq!(
        push_updates(&fixture),
        vec!["reg-1".to_string(), String::new()]
    );
    assert!(!fixture.registrar.is_registered_on_server());
}

#[tokio::test(start_paused = true)]
async fn test_changed_sender_cycles_registration() {
    let mut fixture = setup(
        MemoryPreferences::new()
            .with_push_enabled(true)
            .with_sender_id("old-sender"),
        FakeRegistrar::with_cached_id("reg-old"),
    )
    .build();
    assert_eq!(
        fixture.session.push_state(),
        PushState::Registered("reg-old".into())
    );
    fixture.start_connected().await;

    let registrar = fixture.registrar.clone();
    eventually(|| registrar.unregistrations() == 1).await;
    assert_eq!(fixture.session.push_state(), PushState::Cycling);
    assert_eq!(
        fixture.preferences.push_sender_id().as_deref(),
        Some("sender123")
    );

    fixture.session.push_registration_changed(None);
    eventually(|| registrar.registrations() == vec!["sender123".to_string()]).await;
    assert_eq!(fixture.session.push_state(), PushState::Registering);

    fixture
        .session
        .push_registration_changed(Some("reg-new".into()));
    let session = &fixture.session;
    eventually(|| session.push_acknowledged()).await;
    assert_eq!(push_updates(&fixture), vec!["reg-new".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_push_only_records_sender() {
    let mut fixture = setup(MemoryPreferences::new(), FakeRegistrar::new()).build();
    fixture.start_connected().await;

    let session = &fixture.session;
    eventually(|| session.push_sender_id().is_some()).await;
    settle().await;
    assert!(fixture.registrar.registrations().is_empty());
    assert_eq!(fixture.preferences.push_sender_id(), None);
    assert_eq!(fixture.session.push_state(), PushState::Unregistered);

    // enabling later registers under the announced sender
    fixture.session.push_enable();
    let registrar = fixture.registrar.clone();
    eventually(|| registrar.registrations() == vec!["sender123".to_string()]).await;
    assert_eq!(fixture.session.push_state(), PushState::Registering);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_update_is_not_acknowledged() {
    let mut setup = setup(
        MemoryPreferences::new()
            .with_push_enabled(true)
            .with_sender_id("sender123"),
        FakeRegistrar::with_cached_id("reg-1"),
    );
    setup.script.update_status = UpdateStatus::Failure(3);
    let mut fixture = setup.build();
    fixture.start_connected().await;

    let server = fixture.server.clone();
    eventually(|| server.count("user-info-update") >= 2).await;
    settle().await;
    assert!(!fixture.session.push_acknowledged());
    assert!(!fixture.registrar.is_registered_on_server());
    assert_eq!(
        fixture.session.push_state(),
        PushState::Registered("reg-1".into())
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_forgets_announced_sender() {
    let mut fixture = setup(MemoryPreferences::new(), FakeRegistrar::new()).build();
    fixture.start_connected().await;
    let session = &fixture.session;
    eventually(|| session.push_sender_id().is_some()).await;

    fixture.session.stop();
    assert_eq!(fixture.session.push_sender_id(), None);
    fixture
        .wait_event(|event| {
            matches!(
                event,
                SessionEvent::WorkerStopped {
                    reason: StopReason::Requested
                }
            )
        })
        .await;
}
