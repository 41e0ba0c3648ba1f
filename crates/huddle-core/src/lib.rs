//! Huddle messaging core
//!
//! Channel directory, per-channel message cache with pagination, optimistic
//! sends and reactions reconciled against the server, typing presence,
//! "@mention" completion and attachment checks. Networking is behind
//! [`transport::ChatTransport`]; [`session::ChatSession`] ties it together.

pub mod attachment;
pub mod composer;
pub mod config;
pub mod directory;
pub mod error;
pub mod mention;
pub mod message;
pub mod notice;
pub mod reactions;
pub mod session;
pub mod store;
pub mod timer;
pub mod transport;
pub mod typing;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use config::ChatConfig;
pub use error::{ChatError, Result, TransportError, ValidationError};
pub use message::{CorrelationId, Draft, Message, MessageId, MessageStatus, Viewer};
pub use session::{ChatSession, SendOutcome, SessionEvent};
pub use transport::ChatTransport;

// A panic while holding one of these leaves plain data behind, never a
// half-applied invariant, so the poisoned guard is taken as is.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
