//! Integration tests for the session lifecycle
//!
//! Login and post-login steps, held jobs, the hold/release/idle protocol,
//! reconnect policy and missing credentials.

mod common;

use common::{endpoint, eventually, settle, Fixture, Setup};
use msgcenter_harness::ServerScript;
use msgcenter_runtime::{
    LookupEntry, ProtocolRequest, ProtocolResponse, SessionEvent, StopReason, UserId,
    UserInfoUpdate,
};
use std::time::Duration;
use tokio::time::Instant;

fn stopped(reason: StopReason) -> impl Fn(&SessionEvent) -> bool {
    move |event: &SessionEvent| matches!(event, SessionEvent::WorkerStopped { reason: r } if *r == reason)
}

#[tokio::test(start_paused = true)]
async fn test_login_then_capabilities_and_status() {
    let setup = Setup {
        preferences: msgcenter_harness::MemoryPreferences::new().with_status("at lunch"),
        ..Setup::default()
    };
    let mut fixture = setup.build();
    fixture.start_connected().await;
    fixture.wait_requests("user-info-update", 1).await;

    assert!(fixture.session.is_running());
    assert!(fixture.session.is_authenticated());

    let requests = fixture.server.requests();
    assert_eq!(
        requests[0],
        ProtocolRequest::Login {
            auth_token: "token-1".into()
        }
    );
    assert_eq!(requests[1], ProtocolRequest::ServerInfo);
    assert_eq!(
        requests[2],
        ProtocolRequest::UserInfoUpdate(UserInfoUpdate {
            status_message: Some("at lunch".into()),
            ..UserInfoUpdate::default()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_legacy_authenticate_response_logs_in() {
    let setup = Setup {
        script: ServerScript {
            legacy_authenticate: true,
            ..ServerScript::default()
        },
        ..Setup::default()
    };
    let mut fixture = setup.build();
    fixture.start_connected().await;
    assert!(fixture.session.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_start_is_noop_while_running() {
    let mut fixture = Fixture::new();
    fixture.start_connected().await;
    fixture.session.start(endpoint()).unwrap();
    settle().await;
    assert_eq!(fixture.server.connect_count(), 1);
    assert_eq!(fixture.server.count("login"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_update_status_requires_login() {
    let mut fixture = Fixture::new();
    assert!(!fixture.session.update_status());

    fixture.start_connected().await;
    fixture.wait_requests("user-info-update", 1).await;
    fixture.preferences.set_status(Some("busy"));
    assert!(fixture.session.update_status());
    fixture.wait_requests("user-info-update", 2).await;

    let last = fixture.server.requests_named("user-info-update").pop().unwrap();
    assert_eq!(
        last,
        ProtocolRequest::UserInfoUpdate(UserInfoUpdate {
            status_message: Some("busy".into()),
            ..UserInfoUpdate::default()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_held_jobs_run_in_order_after_start() {
    let setup = Setup {
        script: ServerScript {
            lookup: vec![LookupEntry {
                user_id: UserId::new("bob"),
                status_message: Some("hello".into()),
                last_seen: Some(42),
            }],
            ..ServerScript::default()
        },
        ..Setup::default()
    };
    let mut fixture = setup.build();

    fixture.session.fetch_mailbox();
    let lookup = fixture.session.lookup_users(vec![UserId::new("BOB")]);
    assert_eq!(fixture.session.held_jobs(), 2);
    assert_eq!(fixture.server.connect_count(), 0);

    fixture.start_connected().await;
    let entries = tokio::time::timeout(common::WAIT, lookup)
        .await
        .expect("lookup answered")
        .expect("lookup sender kept");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status_message.as_deref(), Some("hello"));

    fixture.wait_requests("user-info-update", 1).await;
    let names: Vec<&str> = fixture
        .server
        .requests()
        .iter()
        .map(ProtocolRequest::name)
        .collect();
    assert_eq!(
        names,
        vec!["login", "mailbox-fetch", "user-lookup", "server-info", "user-info-update"]
    );
    assert_eq!(fixture.session.held_jobs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_presence_subscriptions_restored_after_login() {
    let mut fixture = Fixture::new();
    fixture.session.subscribe_presence(UserId::new("alice"), 3);
    fixture.start_connected().await;
    fixture.wait_requests("presence-subscribe", 2).await;

    // one held from the call, one restored by the login steps
    for request in fixture.server.requests_named("presence-subscribe") {
        assert_eq!(
            request,
            ProtocolRequest::PresenceSubscribe {
                user_id: UserId::new("alice"),
                event_mask: 3
            }
        );
    }

    fixture.session.unsubscribe_presence(&UserId::new("alice"));
    fixture.wait_requests("presence-subscribe", 3).await;
    let last = fixture
        .server
        .requests_named("presence-subscribe")
        .pop()
        .unwrap();
    assert_eq!(
        last,
        ProtocolRequest::PresenceSubscribe {
            user_id: UserId::new("alice"),
            event_mask: 0
        }
    );
    assert!(fixture.session.presence_subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_waits_for_release_then_grace() {
    let mut fixture = Fixture::new();
    fixture.start_connected().await;
    fixture.wait_requests("user-info-update", 1).await;

    fixture.session.hold();
    fixture.session.idle();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(fixture.session.is_running(), "held worker must not idle out");

    let released_at = Instant::now();
    fixture.session.release();
    assert_eq!(fixture.session.ref_count(), 0);
    fixture.wait_event(stopped(StopReason::Idle)).await;

    assert!(released_at.elapsed() >= fixture.session.config().idle_grace);
    assert!(!fixture.session.is_running());
    assert!(!fixture.session.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_hold_during_grace_cancels_idle_shutdown() {
    let mut fixture = Fixture::new();
    fixture.start_connected().await;
    fixture.wait_requests("user-info-update", 1).await;

    fixture.session.idle();
    tokio::time::sleep(Duration::from_millis(50)).await;
    fixture.session.hold();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(fixture.session.is_running());

    fixture.session.release();
    fixture.wait_event(stopped(StopReason::Idle)).await;
}

#[tokio::test(start_paused = true)]
async fn test_release_never_goes_negative() {
    let fixture = Fixture::new();
    fixture.session.release();
    assert_eq!(fixture.session.ref_count(), 0);
    fixture.session.hold();
    fixture.session.hold();
    fixture.session.release();
    assert_eq!(fixture.session.ref_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_keeps_held_jobs_for_next_worker() {
    let mut fixture = Fixture::new();
    fixture.start_connected().await;
    fixture.wait_requests("user-info-update", 1).await;

    fixture.session.stop();
    fixture.wait_event(stopped(StopReason::Requested)).await;
    assert!(!fixture.session.is_running());

    fixture.session.fetch_mailbox();
    assert_eq!(fixture.session.held_jobs(), 1);

    fixture.session.restart().unwrap();
    fixture.wait_requests("mailbox-fetch", 1).await;
    assert_eq!(fixture.server.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_login_exhausts_attempts() {
    let setup = Setup {
        script: ServerScript {
            login_status: 4,
            ..ServerScript::default()
        },
        ..Setup::default()
    };
    let mut fixture = setup.build();
    fixture.session.start(endpoint()).unwrap();

    fixture
        .wait_event(stopped(StopReason::ReconnectFailed { attempts: 2 }))
        .await;
    assert_eq!(fixture.server.count("login"), 2);
    assert!(!fixture.session.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_login_times_out() {
    let setup = Setup {
        script: ServerScript {
            ignore_login: true,
            ..ServerScript::default()
        },
        ..Setup::default()
    };
    let mut fixture = setup.build();
    let started = Instant::now();
    fixture.session.start(endpoint()).unwrap();

    fixture
        .wait_event(stopped(StopReason::ReconnectFailed { attempts: 2 }))
        .await;
    assert!(started.elapsed() >= fixture.session.config().login_timeout * 2);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_server_keeps_queue_for_next_worker() {
    let mut fixture = Fixture::new();
    fixture.server.set_unreachable(true);
    fixture.session.fetch_mailbox();
    fixture.session.start(endpoint()).unwrap();

    fixture
        .wait_event(stopped(StopReason::ReconnectFailed { attempts: 2 }))
        .await;
    assert_eq!(fixture.server.connect_count(), 2);
    assert_eq!(fixture.session.held_jobs(), 1);

    fixture.server.set_unreachable(false);
    fixture.start_connected().await;
    fixture.wait_requests("mailbox-fetch", 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_connect_failure_recovers() {
    let mut fixture = Fixture::new();
    fixture.server.fail_next_connects(1);
    fixture.start_connected().await;
    assert_eq!(fixture.server.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_credentials_stop_worker() {
    let setup = Setup {
        token: None,
        ..Setup::default()
    };
    let mut fixture = setup.build();
    fixture.session.start(endpoint()).unwrap();

    fixture.wait_event(stopped(StopReason::NoCredentials)).await;
    assert_eq!(fixture.server.connect_count(), 0);
    assert!(!fixture.session.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_requeues_interrupted_lookup() {
    let setup = Setup {
        script: ServerScript {
            lookup: vec![LookupEntry {
                user_id: UserId::new("bob"),
                status_message: None,
                last_seen: None,
            }],
            ..ServerScript::default()
        },
        ..Setup::default()
    };
    let mut fixture = setup.build();
    fixture.start_connected().await;
    fixture.wait_requests("user-info-update", 1).await;

    fixture.server.disconnect_on("user-lookup");
    let lookup = fixture.session.lookup_users(vec![UserId::new("bob")]);

    // the worker logs in again before the interrupted job resumes
    fixture
        .wait_event(|event| matches!(event, SessionEvent::Connected))
        .await;
    let entries = tokio::time::timeout(common::WAIT, lookup)
        .await
        .expect("lookup answered")
        .expect("lookup sender kept");
    assert_eq!(entries.len(), 1);
    assert_eq!(fixture.server.count("user-lookup"), 2);
    assert_eq!(fixture.server.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_link_reconnects() {
    let mut fixture = Fixture::new();
    fixture.start_connected().await;
    fixture.wait_requests("user-info-update", 1).await;

    fixture.server.disconnect();
    fixture
        .wait_event(|event| matches!(event, SessionEvent::Connected))
        .await;
    assert_eq!(fixture.server.count("login"), 2);
    eventually(|| fixture.server.count("server-info") == 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_response_is_ignored() {
    let mut fixture = Fixture::new();
    fixture.start_connected().await;
    fixture.wait_requests("user-info-update", 1).await;

    assert!(fixture.server.respond(
        "tx-999",
        ProtocolResponse::ServerInfo {
            supports: vec!["google_gcm=rogue".into()],
        },
    ));
    settle().await;

    assert!(fixture.session.is_running());
    assert_eq!(fixture.session.push_sender_id(), None);

    fixture.session.fetch_mailbox();
    fixture.wait_requests("mailbox-fetch", 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_lookups_resolve_independently() {
    let entry = |id: &str| LookupEntry {
        user_id: UserId::new(id),
        status_message: None,
        last_seen: None,
    };
    let setup = Setup {
        script: ServerScript {
            lookup: vec![entry("bob"), entry("carol")],
            ..ServerScript::default()
        },
        ..Setup::default()
    };
    let mut fixture = setup.build();
    fixture.start_connected().await;

    let receivers: Vec<_> = ["bob", "carol", "nobody"]
        .into_iter()
        .map(|id| fixture.session.lookup_users(vec![UserId::new(id)]))
        .collect();
    let results = tokio::time::timeout(common::WAIT, futures::future::join_all(receivers))
        .await
        .expect("lookups answered");

    let found: Vec<usize> = results
        .into_iter()
        .map(|result| result.expect("lookup sender kept").len())
        .collect();
    assert_eq!(found, vec![1, 1, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_hold_starts_stopped_worker() {
    let mut fixture = Fixture::new();
    fixture.start_connected().await;
    fixture.session.stop();
    fixture.wait_event(stopped(StopReason::Requested)).await;
    assert!(!fixture.session.is_running());

    fixture.session.hold();
    assert!(fixture.session.is_running());
    fixture
        .wait_event(|event| matches!(event, SessionEvent::Connected))
        .await;
    assert_eq!(fixture.server.connect_count(), 2);
    assert_eq!(fixture.session.ref_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_drops_transactions_of_lost_connection() {
    let setup = Setup {
        script: ServerScript {
            lookup: vec![LookupEntry {
                user_id: UserId::new("bob"),
                status_message: None,
                last_seen: None,
            }],
            unanswered: vec!["user-lookup"],
            per_connection_tx_ids: true,
            ..ServerScript::default()
        },
        ..Setup::default()
    };
    let mut fixture = setup.build();
    fixture.start_connected().await;
    fixture.wait_requests("user-info-update", 1).await;

    let lost = fixture.session.lookup_users(vec![UserId::new("bob")]);
    fixture.wait_requests("user-lookup", 1).await;

    // the next connection numbers its transactions from the start again
    fixture.server.update_script(|script| script.unanswered.clear());
    fixture.server.disconnect();
    fixture
        .wait_event(|event| matches!(event, SessionEvent::Connected))
        .await;
    fixture.wait_requests("user-info-update", 2).await;

    let answered = fixture.session.lookup_users(vec![UserId::new("bob")]);
    let entries = tokio::time::timeout(common::WAIT, answered)
        .await
        .expect("lookup answered")
        .expect("lookup sender kept");
    assert_eq!(entries.len(), 1);

    let lost = tokio::time::timeout(common::WAIT, lost)
        .await
        .expect("lost lookup resolved");
    assert!(lost.is_err(), "handler of the lost connection is dropped");
}
