//! anyfs - a provider-agnostic asynchronous virtual filesystem facade.
//!
//! One async API surface (list, get, create, rename, move, copy, delete,
//! search, open) over pluggable storage providers. A provider implements a
//! small set of override hooks ([`Provider`]); the facade ([`FileSystem`])
//! supplies identifier normalization, capability gating, an identity-keyed
//! weak cache, deferrable change events, credential gating, and error
//! normalization on top of them.
//!
//! Providers that authenticate plug a [`CredentialSource`] and a [`Broker`]
//! into a [`CredentialManager`], which serializes refresh/login attempts and
//! reconciles requested vs. granted/declined scopes.

pub mod auth;
pub mod barrier;
pub mod cache;
pub mod entry;
pub mod error;
pub mod event;
pub mod fs;
pub mod memory;
pub mod path;
pub mod provider;
pub mod ticket;

#[cfg(test)]
mod tests;

pub use auth::CredentialManager;
pub use barrier::{Deferral, Deferrals};
pub use cache::{ListEdit, Listing, WeakCache};
pub use entry::{Drive, Entry, EntryKind};
pub use error::{Error, Result};
pub use event::{ChangeEvent, ChangeKind, ConnectionStringEvent, RefreshedEvent};
pub use fs::FileSystem;
pub use memory::MemoryProvider;
pub use provider::{
    Addressing, Broker, CredentialSource, FileContent, LoginRequest, Provider, SearchHit,
};
pub use ticket::{ScopeCheck, Ticket, reconcile};
