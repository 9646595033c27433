//! Client library for the Session decentralized messenger.
//!
//! Messages are end-to-end encrypted and parked for a limited TTL on a
//! permissionless pool of service nodes ("snodes"); a deterministic subset
//! of the pool (the *swarm*) is responsible for any given account. This
//! crate implements the client side of that protocol:
//!
//! * account identity from a 13-word mnemonic ([`mnemonic`], [`keys`])
//! * snode discovery and swarm resolution ([`snodes`], [`swarm`])
//! * deniable one-to-one and closed-group message crypto ([`encryption`],
//!   [`padding`], [`attachments`])
//! * the envelope wire schema ([`envelope`])
//! * signed store/retrieve RPCs and community-server request signing
//!   ([`rpc`], [`signing`])
//! * a background polling pipeline with persistent cursors ([`poller`])
//!
//! all composed behind the [`Session`] facade, which owns every cache and
//! is the only stateful object in the crate. Storage and networking are
//! capability interfaces ([`storage::Storage`], [`transport::Transport`])
//! with ready-made implementations.
//!
//! ```no_run
//! use session_core::{Session, SessionConfig, PollerOptions};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), session_core::SessionError> {
//! let session = Arc::new(Session::new(SessionConfig::default())?);
//! session.set_mnemonic("thirteen words of mnemonic go here ...", None).await?;
//! session.init().await;
//!
//! session.on_message(|message| {
//!     println!("{}: {:?}", message.author_session_id, message.body());
//! });
//! let poller = session.start_polling(PollerOptions::default())?;
//!
//! session.send_message("05…recipient id…", "hello").await?;
//! # poller.stop();
//! # Ok(())
//! # }
//! ```

pub mod attachments;
pub mod codec;
pub mod encryption;
pub mod envelope;
pub mod keys;
pub mod mnemonic;
pub mod padding;
pub mod poller;
pub mod profile;
pub mod rpc;
pub mod session;
pub mod signing;
pub mod snodes;
pub mod storage;
pub mod swarm;
pub mod transport;
pub mod wordlist;

pub use envelope::{AttachmentPointer, Content, DataMessage, Envelope, EnvelopeType, Quote};
pub use keys::{KeyError, KeyPair};
pub use mnemonic::{decode_mnemonic, generate_mnemonic, mnemonic_to_seed, MnemonicError};
pub use padding::PaddingScheme;
pub use poller::{IncomingMessage, Poller, PollerOptions, SnodeNamespace};
pub use session::{
    Avatar, OutgoingMessage, SendResult, Session, SessionConfig, SessionError,
};
pub use snodes::DiscoveryError;
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use swarm::{Snode, Swarm, SwarmResolveOptions};
pub use transport::{FetchError, HttpTransport, Request, Response, Transport, WsTransport};
