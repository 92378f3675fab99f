mod auth;
mod facade;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::memory::MemoryProvider;
use crate::provider::{Broker, CredentialSource, FileContent, LoginRequest};
use crate::ticket::Ticket;

/// A provider with a couple of directories and one file:
///   docs/notes.txt, pics/
pub(crate) fn seeded_provider() -> MemoryProvider {
    let provider = MemoryProvider::new();
    provider.add_directory("", Entry::directory("docs", "docs"));
    provider.add_directory("", Entry::directory("pics", "pics"));
    provider.add_file("docs", Entry::file("notes.txt", "notes.txt"), b"hello");
    provider
}

pub(crate) fn content(bytes: &[u8]) -> FileContent {
    Box::pin(std::io::Cursor::new(bytes.to_vec()))
}

pub(crate) async fn read_all(mut content: FileContent) -> Vec<u8> {
    let mut bytes = Vec::new();
    content.read_to_end(&mut bytes).await.unwrap();
    bytes
}

pub(crate) fn scope_vec(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn granted_ticket(scopes: &[&str]) -> Ticket {
    Ticket {
        auth_token: Some("token".to_string()),
        granted_scopes: scope_vec(scopes),
        ..Ticket::default()
    }
}

/// Forwards logins to the broker and answers silent refreshes from a
/// script, denying once the script runs out.
pub(crate) struct ScriptedSource {
    refresh: Mutex<VecDeque<Result<Ticket>>>,
    pub refresh_calls: AtomicUsize,
    pub last_refresh_handle: Mutex<Option<String>>,
}

impl ScriptedSource {
    pub fn new(refresh: Vec<Result<Ticket>>) -> Self {
        ScriptedSource {
            refresh: Mutex::new(refresh.into()),
            refresh_calls: AtomicUsize::new(0),
            last_refresh_handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CredentialSource for ScriptedSource {
    async fn refresh_ticket(
        &self,
        connection_string: &str,
        _cancel: &CancellationToken,
    ) -> Result<Ticket> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_refresh_handle.lock().unwrap() = Some(connection_string.to_string());
        self.refresh
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::AccessDenied))
    }

    async fn login(
        &self,
        broker: &dyn Broker,
        connection_string: Option<&str>,
        scopes: &[String],
        requesting_denied_scope: bool,
        cancel: &CancellationToken,
    ) -> Result<Ticket> {
        broker
            .login(
                LoginRequest {
                    scopes: scopes.to_vec(),
                    requesting_denied_scope,
                    connection_string: connection_string.map(str::to_string),
                },
                cancel,
            )
            .await
    }
}

/// Hands out the same ticket on every login and counts how often it was
/// asked, optionally sleeping to widen race windows.
pub(crate) struct CountingBroker {
    ticket: Ticket,
    pub logins: AtomicUsize,
    pub saw_denied_request: AtomicBool,
    delay: Duration,
}

impl CountingBroker {
    pub fn new(ticket: Ticket) -> Self {
        CountingBroker {
            ticket,
            logins: AtomicUsize::new(0),
            saw_denied_request: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Broker for CountingBroker {
    async fn login(&self, request: LoginRequest, _cancel: &CancellationToken) -> Result<Ticket> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if request.requesting_denied_scope {
            self.saw_denied_request.store(true, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.ticket.clone())
    }
}
