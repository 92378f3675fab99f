//! The credential manager: produces a usable ticket for a requested scope
//! set while minimizing user interaction and serializing concurrent
//! authentication attempts.

use std::sync::{Arc, Mutex};

use diagnostics::{log_debug, log_info};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::ConnectionStringEvent;
use crate::provider::{Broker, CredentialSource};
use crate::ticket::{Ticket, reconcile};

type ConnectionObserver = Box<dyn Fn(&ConnectionStringEvent) + Send + Sync>;

/// Serializes authentication, silent refresh, interactive login, and scope
/// reconciliation for one filesystem.
///
/// The whole authenticate sequence runs under one lock, so concurrent
/// callers never trigger duplicate interactive prompts: the second caller
/// observes the first caller's freshly cached ticket.
pub struct CredentialManager {
    source: Arc<dyn CredentialSource>,
    broker: Arc<dyn Broker>,
    state: Mutex<State>,
    auth_lock: tokio::sync::Mutex<()>,
    observers: Mutex<Vec<ConnectionObserver>>,
}

#[derive(Default)]
struct State {
    ticket: Option<Ticket>,
    /// Opaque refresh handle persisted across sessions.
    connection_string: Option<String>,
}

impl CredentialManager {
    pub fn new(source: Arc<dyn CredentialSource>, broker: Arc<dyn Broker>) -> Self {
        CredentialManager {
            source,
            broker,
            state: Mutex::new(State::default()),
            auth_lock: tokio::sync::Mutex::new(()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Restores a persisted connection string from a previous session.
    pub fn restore_connection_string(&self, connection_string: impl Into<String>) {
        self.state.lock().expect("manager lock poisoned").connection_string =
            Some(connection_string.into());
    }

    pub fn connection_string(&self) -> Option<String> {
        self.state
            .lock()
            .expect("manager lock poisoned")
            .connection_string
            .clone()
    }

    /// Registers a listener for connection string changes. Listeners may
    /// take a deferral from the event to make persistence durable before
    /// the triggering operation returns.
    pub fn on_connection_string_changed(
        &self,
        observer: impl Fn(&ConnectionStringEvent) + Send + Sync + 'static,
    ) {
        self.observers
            .lock()
            .expect("manager lock poisoned")
            .push(Box::new(observer));
    }

    /// Scopes required for the given directory, per the credential source.
    pub fn scopes(&self, dir_id: &str) -> Vec<String> {
        self.source.scopes(dir_id)
    }

    /// Produces a ticket covering `scopes`.
    ///
    /// 1. Return the cached ticket when it covers the scopes and has not
    ///    expired.
    /// 2. Otherwise attempt a silent refresh through the persisted
    ///    connection string; an access-denied refresh failure falls through
    ///    to the interactive path, everything else propagates.
    /// 3. Otherwise, when prompting is allowed, run an interactive login.
    ///    A ticket that still lacks scope after an explicit grant fails
    ///    with `AccessDenied`.
    /// 4. Otherwise fail with `AccessDenied`.
    pub async fn authenticate(
        &self,
        scopes: &[String],
        allow_prompt: bool,
        cancel: &CancellationToken,
    ) -> Result<Ticket> {
        let _guard = self.auth_lock.lock().await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut needs_new = false;
        let mut needs_denied = false;

        if let Some(ticket) = self.cached_ticket() {
            let check = reconcile(&ticket, scopes);
            needs_new = check.needs_new;
            needs_denied = check.needs_denied;
            if check.satisfied() && !ticket.is_expired() {
                log_debug!("authenticate: cached ticket satisfies request");
                return Ok(ticket);
            }
        }

        let connection_string = self.connection_string().filter(|s| !s.trim().is_empty());
        if let Some(stored) = connection_string.as_deref()
            && !needs_new
            && !needs_denied
        {
            match self.source.refresh_ticket(stored, cancel).await {
                Ok(ticket) => {
                    if let Some(refresh_token) = ticket.refresh_token.as_deref()
                        && !refresh_token.trim().is_empty()
                        && refresh_token != stored
                    {
                        self.save_connection_string(refresh_token).await;
                    }
                    let check = reconcile(&ticket, scopes);
                    needs_denied = check.needs_denied;
                    if ticket.has_auth_token() {
                        self.cache_ticket(ticket.clone());
                        if check.satisfied() {
                            log_info!("authenticate: silent refresh succeeded");
                            return Ok(ticket);
                        }
                    }
                }
                // Access denial here means the refresh handle went stale;
                // fall through to the interactive path.
                Err(Error::AccessDenied) => {
                    log_debug!("authenticate: silent refresh denied, falling through");
                }
                Err(other) => return Err(other),
            }
        }

        if !allow_prompt {
            return Err(Error::AccessDenied);
        }

        log_info!("authenticate: interactive login");
        let ticket = self
            .source
            .login(
                self.broker.as_ref(),
                connection_string.as_deref(),
                scopes,
                needs_denied,
                cancel,
            )
            .await?;
        let check = reconcile(&ticket, scopes);
        if !check.satisfied() {
            // The user was given the chance and still lacks scope.
            return Err(Error::AccessDenied);
        }

        let ticket = if let Some(refresh_token) = ticket.refresh_token.clone() {
            self.save_connection_string(&refresh_token).await;
            if ticket.has_auth_token() {
                ticket
            } else {
                // A refresh-only grant: redeem it immediately.
                self.source.refresh_ticket(&refresh_token, cancel).await?
            }
        } else {
            if let Some(auth_token) = ticket.auth_token.clone() {
                self.save_connection_string(&auth_token).await;
            }
            ticket
        };

        self.cache_ticket(ticket.clone());
        Ok(ticket)
    }

    /// Unconditional interactive login that replaces the cached ticket,
    /// used to attach an additional account.
    pub async fn add_new(&self, scopes: &[String], cancel: &CancellationToken) -> Result<Ticket> {
        let _guard = self.auth_lock.lock().await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let connection_string = self.connection_string();
        let ticket = self
            .source
            .login(
                self.broker.as_ref(),
                connection_string.as_deref(),
                scopes,
                false,
                cancel,
            )
            .await?;
        self.cache_ticket(ticket.clone());
        if let Some(handle) = ticket.refresh_token.clone().or_else(|| ticket.auth_token.clone()) {
            self.save_connection_string(&handle).await;
        }
        Ok(ticket)
    }

    /// Clears the cached ticket. The persisted connection string is kept so
    /// a future silent refresh can be attempted.
    pub fn invalidate(&self) {
        self.state.lock().expect("manager lock poisoned").ticket = None;
    }

    pub fn cached_ticket(&self) -> Option<Ticket> {
        self.state
            .lock()
            .expect("manager lock poisoned")
            .ticket
            .clone()
    }

    fn cache_ticket(&self, ticket: Ticket) {
        self.state.lock().expect("manager lock poisoned").ticket = Some(ticket);
    }

    async fn save_connection_string(&self, connection_string: &str) {
        self.state
            .lock()
            .expect("manager lock poisoned")
            .connection_string = Some(connection_string.to_string());
        let event = ConnectionStringEvent::new(connection_string.to_string());
        {
            let observers = self.observers.lock().expect("manager lock poisoned");
            for observer in observers.iter() {
                observer(&event);
            }
        }
        event.wait().await;
    }
}
