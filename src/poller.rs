//! Background message polling.
//!
//! A poller wakes on a fixed interval, asks one snode of our swarm for new
//! messages across a set of namespaces (one batch RPC per iteration),
//! decrypts what it gets and hands the results to the session's
//! `on_message` callbacks. Per-namespace cursors (`last_hash_{n}`) are
//! persisted only after a namespace's messages have been delivered, so a
//! crash can only cause re-delivery, never loss.
//!
//! The poller holds a weak reference to its session; the session owns the
//! poller handles and stops them when it is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::envelope::{Content, DataMessage, EnvelopeType};
use crate::session::{Session, SessionError};

/// Message storage partitions on a snode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SnodeNamespace {
    UserMessages = 0,
    ClosedGroupMessage = 1,
    ConvoInfoVolatile = 2,
    UserContacts = 3,
    UserProfile = 4,
    UserGroups = 5,
}

impl SnodeNamespace {
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Storage key of this namespace's retrieve cursor.
    pub fn cursor_key(self) -> String {
        format!("last_hash_{}", self.id())
    }

    /// Which envelope type messages in this namespace carry.
    pub fn envelope_type(self) -> EnvelopeType {
        match self {
            SnodeNamespace::ClosedGroupMessage => EnvelopeType::ClosedGroupMessage,
            _ => EnvelopeType::SessionMessage,
        }
    }

    /// The namespaces polled by default.
    pub fn default_poll_set() -> Vec<SnodeNamespace> {
        vec![
            SnodeNamespace::UserMessages,
            SnodeNamespace::ConvoInfoVolatile,
            SnodeNamespace::UserContacts,
            SnodeNamespace::UserGroups,
            SnodeNamespace::UserProfile,
        ]
    }
}

/// A decrypted incoming message.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub namespace: SnodeNamespace,
    /// Server-assigned hash, also the cursor value.
    pub hash: String,
    /// Authenticated sender session id, recovered during decryption.
    pub author_session_id: String,
    /// Envelope timestamp (ms).
    pub timestamp: u64,
    pub content: Content,
}

impl IncomingMessage {
    pub fn data_message(&self) -> Option<&DataMessage> {
        self.content.data_message.as_ref()
    }

    pub fn body(&self) -> Option<&str> {
        self.data_message().and_then(|dm| dm.body.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct PollerOptions {
    pub interval: Duration,
    pub namespaces: Vec<SnodeNamespace>,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            namespaces: SnodeNamespace::default_poll_set(),
        }
    }
}

/// Periodic retrieve loop over a session.
pub struct Poller {
    session: Weak<Session>,
    options: PollerOptions,
    polling: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Poller {
    pub(crate) fn new(session: Weak<Session>, options: PollerOptions) -> Self {
        Self {
            session,
            options,
            polling: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// Start the background loop. A second `start` is a no-op while the
    /// loop is running.
    pub fn start(&self) -> Result<(), SessionError> {
        let session = self.session.upgrade().ok_or(SessionError::NotAuthorized)?;
        if !session.is_authorized() {
            return Err(SessionError::NotAuthorized);
        }
        if self.polling.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak = self.session.clone();
        let polling = self.polling.clone();
        let interval = self.options.interval;
        let namespaces = self.options.namespaces.clone();

        let handle = tokio::spawn(async move {
            while polling.load(Ordering::SeqCst) {
                match weak.upgrade() {
                    Some(session) => {
                        if let Err(error) = session.poll_namespaces(&namespaces).await {
                            log::error!("error during polling: {error}");
                        }
                    }
                    None => break, // session dropped
                }
                tokio::time::sleep(interval).await;
            }
        });
        *self.task.lock().expect("poller task lock") = Some(handle);
        Ok(())
    }

    /// Stop polling. The in-flight iteration is cancelled; cursors for a
    /// cancelled iteration are not advanced.
    pub fn stop(&self) {
        self.polling.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().expect("poller task lock").take() {
            handle.abort();
        }
    }

    /// One manual poll outside the background loop.
    pub async fn poll(&self) -> Result<Vec<IncomingMessage>, SessionError> {
        let session = self.session.upgrade().ok_or(SessionError::NotAuthorized)?;
        session.poll_namespaces(&self.options.namespaces).await
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}
