use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use super::{CountingBroker, ScriptedSource, granted_ticket, scope_vec};
use crate::auth::CredentialManager;
use crate::error::Error;
use crate::ticket::Ticket;

fn manager(source: ScriptedSource, broker: CountingBroker) -> (CredentialManager, Arc<CountingBroker>) {
    let broker = Arc::new(broker);
    let manager = CredentialManager::new(Arc::new(source), broker.clone());
    (manager, broker)
}

#[tokio::test]
async fn test_cached_ticket_short_circuits() {
    let (manager, broker) = manager(
        ScriptedSource::new(vec![]),
        CountingBroker::new(granted_ticket(&["read"])),
    );
    let cancel = CancellationToken::new();
    let scopes = scope_vec(&["read"]);

    manager.authenticate(&scopes, true, &cancel).await.unwrap();
    manager.authenticate(&scopes, true, &cancel).await.unwrap();

    assert_eq!(broker.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cached_superset_grant_covers_other_scopes_without_prompting() {
    let (manager, broker) = manager(
        ScriptedSource::new(vec![]),
        CountingBroker::new(granted_ticket(&["read", "write"])),
    );
    let cancel = CancellationToken::new();

    manager
        .authenticate(&scope_vec(&["read"]), true, &cancel)
        .await
        .unwrap();
    assert_eq!(broker.logins.load(Ordering::SeqCst), 1);

    // A different subset of the granted scopes is served from the cached
    // ticket even though prompting is forbidden.
    let ticket = manager
        .authenticate(&scope_vec(&["write"]), false, &cancel)
        .await
        .unwrap();
    assert!(ticket.has_auth_token());
    assert_eq!(broker.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_expired_ticket_forces_silent_refresh() {
    let mut stale = granted_ticket(&["read"]);
    stale.refresh_token = Some("rt-1".to_string());
    stale.expiration = Some(Utc::now() - ChronoDuration::minutes(1));

    let mut fresh = granted_ticket(&["read"]);
    fresh.refresh_token = Some("rt-2".to_string());
    fresh.expiration = Some(Utc::now() + ChronoDuration::hours(1));

    let source = ScriptedSource::new(vec![Ok(fresh)]);
    let (manager, broker) = manager(source, CountingBroker::new(stale));
    let cancel = CancellationToken::new();
    let scopes = scope_vec(&["read"]);

    // First pass logs in interactively and persists the refresh handle.
    manager.authenticate(&scopes, true, &cancel).await.unwrap();
    assert_eq!(manager.connection_string().as_deref(), Some("rt-1"));

    // The cached ticket has expired, so the second pass refreshes silently
    // and rotates the persisted handle.
    let ticket = manager.authenticate(&scopes, true, &cancel).await.unwrap();
    assert!(!ticket.is_expired());
    assert_eq!(manager.connection_string().as_deref(), Some("rt-2"));
    assert_eq!(broker.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_refresh_handle_falls_through_to_login() {
    let source = ScriptedSource::new(vec![Err(Error::AccessDenied)]);
    let (manager, broker) = manager(source, CountingBroker::new(granted_ticket(&["read"])));
    manager.restore_connection_string("stale-handle");
    let cancel = CancellationToken::new();

    let ticket = manager
        .authenticate(&scope_vec(&["read"]), true, &cancel)
        .await
        .unwrap();
    assert!(ticket.has_auth_token());
    assert_eq!(broker.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_no_prompt_denies_instead_of_logging_in() {
    let (manager, broker) = manager(
        ScriptedSource::new(vec![]),
        CountingBroker::new(granted_ticket(&["read"])),
    );
    let cancel = CancellationToken::new();

    let error = manager
        .authenticate(&scope_vec(&["read"]), false, &cancel)
        .await
        .unwrap_err();
    assert!(error.is_access_denied());
    assert_eq!(broker.logins.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_authenticate_prompts_once() {
    let broker = CountingBroker::new(granted_ticket(&["read"]))
        .with_delay(Duration::from_millis(50));
    let (manager, broker) = manager(ScriptedSource::new(vec![]), broker);
    let manager = Arc::new(manager);
    let cancel = CancellationToken::new();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager.authenticate(&scope_vec(&["read"]), true, &cancel).await
            })
        })
        .collect();
    for result in futures::future::join_all(handles).await {
        result.unwrap().unwrap();
    }

    // The second caller waited out the first and took its cached ticket.
    assert_eq!(broker.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_declined_scope_fails_after_explicit_grant_chance() {
    let mut ticket = granted_ticket(&["read"]);
    ticket.declined_scopes = scope_vec(&["write"]);
    let (manager, broker) = manager(ScriptedSource::new(vec![]), CountingBroker::new(ticket));
    let cancel = CancellationToken::new();

    manager
        .authenticate(&scope_vec(&["read"]), true, &cancel)
        .await
        .unwrap();

    // The broker keeps declining "write"; after the explicit chance the
    // request fails rather than looping.
    let error = manager
        .authenticate(&scope_vec(&["write"]), true, &cancel)
        .await
        .unwrap_err();
    assert!(error.is_access_denied());
    assert!(broker.saw_denied_request.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_refresh_only_grant_is_redeemed() {
    let refresh_only = Ticket {
        refresh_token: Some("rt".to_string()),
        granted_scopes: scope_vec(&["read"]),
        ..Ticket::default()
    };
    let source = ScriptedSource::new(vec![Ok(granted_ticket(&["read"]))]);
    let (manager, _broker) = manager(source, CountingBroker::new(refresh_only));
    let cancel = CancellationToken::new();

    let ticket = manager
        .authenticate(&scope_vec(&["read"]), true, &cancel)
        .await
        .unwrap();
    assert!(ticket.has_auth_token());
    assert_eq!(manager.connection_string().as_deref(), Some("rt"));
}

#[tokio::test]
async fn test_invalidate_keeps_connection_string() {
    let mut ticket = granted_ticket(&["read"]);
    ticket.refresh_token = Some("rt-1".to_string());
    let source = ScriptedSource::new(vec![Ok(granted_ticket(&["read"]))]);
    let (manager, broker) = manager(source, CountingBroker::new(ticket));
    let cancel = CancellationToken::new();
    let scopes = scope_vec(&["read"]);

    manager.authenticate(&scopes, true, &cancel).await.unwrap();
    manager.invalidate();
    assert!(manager.cached_ticket().is_none());
    assert_eq!(manager.connection_string().as_deref(), Some("rt-1"));

    // Re-authentication goes through the kept handle, not the broker.
    manager.authenticate(&scopes, true, &cancel).await.unwrap();
    assert_eq!(broker.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_add_new_always_prompts_and_replaces_ticket() {
    let (manager, broker) = manager(
        ScriptedSource::new(vec![]),
        CountingBroker::new(granted_ticket(&["read", "write"])),
    );
    let cancel = CancellationToken::new();

    manager.authenticate(&scope_vec(&["read"]), true, &cancel).await.unwrap();
    assert_eq!(broker.logins.load(Ordering::SeqCst), 1);

    // A valid cached ticket does not short-circuit an explicit add.
    let ticket = manager.add_new(&scope_vec(&["read"]), &cancel).await.unwrap();
    assert_eq!(broker.logins.load(Ordering::SeqCst), 2);
    assert_eq!(
        manager.cached_ticket().unwrap().granted_scopes,
        ticket.granted_scopes
    );
}

#[tokio::test]
async fn test_connection_string_listener_can_defer() {
    let mut ticket = granted_ticket(&["read"]);
    ticket.refresh_token = Some("rt-1".to_string());
    let (manager, _broker) = manager(ScriptedSource::new(vec![]), CountingBroker::new(ticket));
    let cancel = CancellationToken::new();

    let persisted = Arc::new(Mutex::new(None::<String>));
    let durable = Arc::new(AtomicBool::new(false));
    let persisted_in_listener = persisted.clone();
    let durable_in_listener = durable.clone();
    manager.on_connection_string_changed(move |event| {
        let deferral = event.deferral().unwrap();
        let value = event.connection_string().to_string();
        let persisted = persisted_in_listener.clone();
        let durable = durable_in_listener.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            *persisted.lock().unwrap() = Some(value);
            durable.store(true, Ordering::SeqCst);
            deferral.complete();
        });
    });

    manager
        .authenticate(&scope_vec(&["read"]), true, &cancel)
        .await
        .unwrap();

    // The save waited for the deferral, so the value is already durable.
    assert!(durable.load(Ordering::SeqCst));
    assert_eq!(persisted.lock().unwrap().as_deref(), Some("rt-1"));
}

#[tokio::test]
async fn test_cancelled_authenticate_short_circuits() {
    let (manager, broker) = manager(
        ScriptedSource::new(vec![]),
        CountingBroker::new(granted_ticket(&["read"])),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = manager
        .authenticate(&scope_vec(&["read"]), true, &cancel)
        .await
        .unwrap_err();
    assert!(error.is_cancelled());
    assert_eq!(broker.logins.load(Ordering::SeqCst), 0);
}
