//! The session facade.
//!
//! A [`Session`] ties together key material, the snode pool, swarm caches,
//! message crypto and storage. All mutable state lives on the session
//! (there are no globals) and mutations happen between suspension points,
//! so concurrent readers always observe coherent snapshots.
//!
//! Authorization is single-shot: a session accepts exactly one mnemonic
//! for its lifetime.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::attachments::{self, AttachmentError};
use crate::codec;
use crate::encryption::{self, DecryptError, EncryptError, GroupKey};
use crate::envelope::{
    self, AttachmentPointer, Content, DataMessage, EnvelopeError, EnvelopeType, Quote,
};
use crate::keys::KeyPair;
use crate::mnemonic::MnemonicError;
use crate::poller::{IncomingMessage, Poller, PollerOptions, SnodeNamespace};
use crate::rpc::{self, RpcCall, StoredMessage};
use crate::signing;
use crate::snodes::{self, DiscoveryError};
use crate::storage::{MemoryStorage, Storage, StorageError};
use crate::swarm::{self, Snode, Swarm, SwarmResolveOptions};
use crate::transport::{FetchError, HttpTransport, Request, Transport};
use crate::padding::PaddingScheme;

/// Store TTL: one day, in milliseconds.
pub const DEFAULT_TTL_MS: u64 = 86_400_000;

/// Attempts before the store path gives up.
const STORE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum SessionError {
    // caller contract
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(#[from] MnemonicError),
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("invalid attachment: {0}")]
    InvalidAttachment(#[from] AttachmentError),
    // lifecycle
    #[error("instance is not initialized; use set_mnemonic first")]
    NotAuthorized,
    #[error("mnemonic can't be set after it was already set")]
    AlreadyInitialized,
    // downstream
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Encrypt(#[from] EncryptError),
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Which length-hiding padding the deployment speaks.
    pub padding: PaddingScheme,
    pub swarm: SwarmResolveOptions,
    /// Store TTL in milliseconds.
    pub ttl_ms: u64,
    /// Optional HTTP/SOCKS proxy url for the default transport.
    pub proxy: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            padding: PaddingScheme::default(),
            swarm: SwarmResolveOptions::default(),
            ttl_ms: DEFAULT_TTL_MS,
            proxy: None,
        }
    }
}

/// Cached avatar pointer: where the encrypted blob lives and its key.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Avatar {
    pub url: String,
    #[serde(with = "avatar_key_hex")]
    pub key: Vec<u8>,
}

mod avatar_key_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub message_hash: String,
    pub timestamp: u64,
}

/// Optional parts of an outgoing message.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub text: Option<String>,
    pub attachments: Vec<AttachmentPointer>,
    pub quote: Option<Quote>,
}

#[derive(Default)]
struct AccountState {
    mnemonic: Option<String>,
    keypair: Option<Arc<KeyPair>>,
    session_id: Option<String>,
    display_name: Option<String>,
    avatar: Option<Avatar>,
}

type MessageCallback = Box<dyn Fn(&IncomingMessage) + Send + Sync>;

pub struct Session {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    config: SessionConfig,

    authorized: AtomicBool,
    state: StdRwLock<AccountState>,

    snodes: RwLock<Option<Vec<Snode>>>,
    our_swarms: RwLock<Option<Vec<Swarm>>>,
    our_swarm: RwLock<Option<Swarm>>,

    group_keys: StdRwLock<Vec<GroupKey>>,
    network_offset_ms: AtomicI64,

    callbacks: StdRwLock<Vec<MessageCallback>>,
    pollers: StdMutex<Vec<Arc<Poller>>>,
}

impl Session {
    /// A session over in-memory storage and the default HTTP transport.
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let transport = HttpTransport::with_proxy(config.proxy.as_deref())?;
        Ok(Self::with_parts(
            Arc::new(MemoryStorage::new()),
            Arc::new(transport),
            config,
        ))
    }

    /// A session over caller-provided storage and transport.
    pub fn with_parts(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        Self {
            storage,
            transport,
            config,
            authorized: AtomicBool::new(false),
            state: StdRwLock::new(AccountState::default()),
            snodes: RwLock::new(None),
            our_swarms: RwLock::new(None),
            our_swarm: RwLock::new(None),
            group_keys: StdRwLock::new(Vec::new()),
            network_offset_ms: AtomicI64::new(0),
            callbacks: StdRwLock::new(Vec::new()),
            pollers: StdMutex::new(Vec::new()),
        }
    }

    // ─── Identity ────────────────────────────────────────────────────────────

    /// Accept the account mnemonic, derive keys and mark the session
    /// authorized. Allowed exactly once.
    pub async fn set_mnemonic(
        &self,
        mnemonic: &str,
        display_name: Option<&str>,
    ) -> Result<(), SessionError> {
        if self.authorized.load(Ordering::SeqCst) {
            return Err(SessionError::AlreadyInitialized);
        }
        let mnemonic = mnemonic.trim();
        let word_count = mnemonic.split_whitespace().count();
        if word_count != 13 {
            return Err(SessionError::InvalidMnemonic(MnemonicError::WordCount(
                word_count,
            )));
        }

        let keypair = KeyPair::from_mnemonic(mnemonic).map_err(|e| match e {
            crate::keys::KeyError::InvalidMnemonic(m) => SessionError::InvalidMnemonic(m),
            crate::keys::KeyError::InvalidPublicKey => {
                SessionError::InvalidOptions("unusable key material".into())
            }
        })?;
        let session_id = keypair.session_id();

        {
            let mut state = self.state.write().expect("account state");
            state.mnemonic = Some(mnemonic.to_owned());
            state.keypair = Some(Arc::new(keypair));
            state.session_id = Some(session_id);
            state.display_name = display_name.map(str::to_owned);
        }

        // the mnemonic is critical state; the display name is best-effort
        self.storage.set("mnemonic", mnemonic).await?;
        if let Some(name) = display_name {
            if let Err(error) = self.storage.set("display_name", name).await {
                log::warn!("failed to persist display name: {error}");
            }
        }

        self.authorized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Result<String, SessionError> {
        self.state
            .read()
            .expect("account state")
            .session_id
            .clone()
            .ok_or(SessionError::NotAuthorized)
    }

    pub fn keypair(&self) -> Option<Arc<KeyPair>> {
        self.state.read().expect("account state").keypair.clone()
    }

    pub fn mnemonic(&self) -> Option<String> {
        self.state.read().expect("account state").mnemonic.clone()
    }

    pub fn display_name(&self) -> Option<String> {
        self.state.read().expect("account state").display_name.clone()
    }

    /// Update the display name; persistence is best-effort.
    pub async fn set_display_name(&self, name: &str) {
        self.state.write().expect("account state").display_name = Some(name.to_owned());
        if let Err(error) = self.storage.set("display_name", name).await {
            log::warn!("failed to persist display name: {error}");
        }
    }

    pub fn avatar(&self) -> Option<Avatar> {
        self.state.read().expect("account state").avatar.clone()
    }

    /// Update the avatar pointer; persistence is best-effort.
    pub async fn set_avatar(&self, avatar: Avatar) {
        let serialized = serde_json::to_string(&avatar).unwrap_or_default();
        self.state.write().expect("account state").avatar = Some(avatar);
        if let Err(error) = self.storage.set("avatar", &serialized).await {
            log::warn!("failed to persist avatar: {error}");
        }
    }

    /// Register a pre-shared closed-group key (hex of 32 bytes). Keys for
    /// every known epoch accumulate in the decryption keyring.
    pub fn add_group_key(&self, group_key_hex: &str) -> Result<(), SessionError> {
        let key = encryption::group_key_from_hex(group_key_hex)
            .ok_or_else(|| SessionError::InvalidOptions("group key must be 32 bytes hex".into()))?;
        self.group_keys.write().expect("group keys").push(key);
        Ok(())
    }

    /// Register a callback invoked synchronously for every decrypted data
    /// message the poller delivers.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&IncomingMessage) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .expect("callbacks")
            .push(Box::new(callback));
    }

    // ─── Startup / network time ──────────────────────────────────────────────

    /// Restore cached state and synchronise the clock against the network.
    /// Every step is best-effort.
    pub async fn init(&self) {
        if let Ok(Some(raw)) = self.storage.get("avatar").await {
            if let Ok(avatar) = serde_json::from_str::<Avatar>(&raw) {
                self.state.write().expect("account state").avatar = Some(avatar);
            }
        }
        if let Ok(Some(name)) = self.storage.get("display_name").await {
            let mut state = self.state.write().expect("account state");
            if state.display_name.is_none() {
                state.display_name = Some(name);
            }
        }
        if let Err(error) = self.sync_network_time().await {
            log::debug!("network time sync skipped: {error}");
        }
    }

    async fn sync_network_time(&self) -> Result<(), SessionError> {
        let snodes = self.get_snodes().await?;
        let Some(snode) = snodes.first() else {
            return Ok(());
        };
        let response = self
            .transport
            .request(Request::head(snode.storage_url()))
            .await?;
        if let Some(date) = response.header("date") {
            if let Ok(server) = chrono::DateTime::parse_from_rfc2822(date) {
                let now = system_now_ms() as i64;
                let offset = server.timestamp_millis() - now;
                self.network_offset_ms.store(offset, Ordering::SeqCst);
                log::debug!("network time offset: {offset} ms");
            }
        }
        Ok(())
    }

    /// Milliseconds since epoch, adjusted by the network offset.
    pub fn now_with_network_offset(&self) -> u64 {
        let now = system_now_ms() as i64;
        (now + self.network_offset_ms.load(Ordering::SeqCst)).max(0) as u64
    }

    // ─── Snode pool / swarms ─────────────────────────────────────────────────

    /// The snode pool, fetched from the seeds on first use.
    pub async fn get_snodes(&self) -> Result<Vec<Snode>, SessionError> {
        if let Some(cached) = self.snodes.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let fetched = snodes::fetch_snodes(self.transport.as_ref()).await?;
        *self.snodes.write().await = Some(fetched.clone());
        Ok(fetched)
    }

    /// Drop the cached pool and fetch a fresh one.
    pub async fn refresh_snodes(&self) -> Result<Vec<Snode>, SessionError> {
        *self.snodes.write().await = None;
        self.get_snodes().await
    }

    /// Resolve the swarms holding messages for `session_id`.
    pub async fn get_swarms_for(&self, session_id: &str) -> Result<Vec<Swarm>, SessionError> {
        let pool = self.get_snodes().await?;
        let swarms =
            swarm::fetch_swarms_for(self.transport.as_ref(), &pool, session_id, &self.config.swarm)
                .await?;
        Ok(swarms)
    }

    /// Our own swarm, resolved lazily and cached; one of the candidate
    /// swarms picked uniformly at random.
    pub async fn get_our_swarm(&self) -> Result<Swarm, SessionError> {
        if let Some(cached) = self.our_swarm.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let session_id = self.session_id()?;
        let swarms = self.get_swarms_for(&session_id).await?;
        let chosen = choose(&swarms)
            .ok_or_else(|| FetchError::Snode("no swarms found for this account".into()))?;
        *self.our_swarms.write().await = Some(swarms);
        *self.our_swarm.write().await = Some(chosen.clone());
        Ok(chosen)
    }

    /// Forget the cached swarm so the next use re-resolves it.
    pub async fn invalidate_our_swarm(&self) {
        *self.our_swarm.write().await = None;
        *self.our_swarms.write().await = None;
    }

    // ─── Sending ─────────────────────────────────────────────────────────────

    /// Send a text message to another session id.
    pub async fn send_message(&self, to: &str, text: &str) -> Result<SendResult, SessionError> {
        self.send_message_with(
            to,
            OutgoingMessage { text: Some(text.to_owned()), ..Default::default() },
        )
        .await
    }

    /// Send a message with optional attachments and quote.
    pub async fn send_message_with(
        &self,
        to: &str,
        message: OutgoingMessage,
    ) -> Result<SendResult, SessionError> {
        let keypair = self.keypair().ok_or(SessionError::NotAuthorized)?;
        validate_session_id(to)?;

        let timestamp = self.now_with_network_offset();
        let content = Content {
            data_message: Some(DataMessage {
                body: message.text,
                attachments: message.attachments,
                timestamp: Some(timestamp),
                quote: message.quote,
            }),
            ..Default::default()
        };
        let plaintext = prost::Message::encode_to_vec(&content);

        let encrypted = encryption::encrypt(
            &keypair,
            to,
            &plaintext,
            EnvelopeType::SessionMessage,
            self.config.padding,
        )?;
        let env = envelope::build_envelope(
            encrypted.envelope_type,
            None,
            timestamp,
            encrypted.ciphertext,
        );
        let data64 = codec::bytes_to_base64(&envelope::wrap_envelope(&env));

        let message_hash = self.store_message(to, &data64, timestamp).await?;
        Ok(SendResult { message_hash, timestamp })
    }

    /// Store an already-wrapped message on the recipient's swarm, retrying
    /// across swarms on failure.
    async fn store_message(
        &self,
        destination: &str,
        data64: &str,
        timestamp: u64,
    ) -> Result<String, SessionError> {
        let to_self = self
            .state
            .read()
            .expect("account state")
            .session_id
            .as_deref()
            == Some(destination);
        let mut swarms = if to_self {
            vec![self.get_our_swarm().await?]
        } else {
            self.get_swarms_for(destination).await?
        };

        let mut last_error: Option<FetchError> = None;
        for _ in 0..STORE_ATTEMPTS {
            let Some(swarm) = choose(&swarms) else { break };
            let Some(snode) = choose(&swarm.snodes) else { break };

            let call = RpcCall::new(
                "store",
                json!({
                    "pubkey": destination,
                    "timestamp": timestamp,
                    "ttl": self.config.ttl_ms,
                    "data": data64,
                }),
            );
            match rpc::snode_single_request(self.transport.as_ref(), &snode.storage_url(), &call)
                .await
            {
                Ok(response) if response.is_ok() => {
                    let hash = response
                        .json::<serde_json::Value>()
                        .ok()
                        .and_then(|v| v.get("hash").and_then(|h| h.as_str()).map(str::to_owned));
                    if hash.is_none() {
                        log::warn!("store succeeded but returned no hash");
                    }
                    return Ok(hash.unwrap_or_default());
                }
                Ok(response) => {
                    log::warn!(
                        "snode {} failed to store message with status {}",
                        snode.host,
                        response.status
                    );
                    last_error = Some(FetchError::Snode(format!(
                        "store failed with status {}",
                        response.status
                    )));
                }
                Err(error) => {
                    log::warn!("store request to {} failed: {error}", snode.host);
                    last_error = Some(error);
                }
            }
            // drop the failing swarm and try another
            swarms.retain(|s| s != &swarm);
        }

        Err(SessionError::Fetch(FetchError::Snode(format!(
            "failed to store message after {STORE_ATTEMPTS} attempts; last error: {}",
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "no swarms".into())
        ))))
    }

    // ─── Attachments ─────────────────────────────────────────────────────────

    /// Encrypt and upload an attachment to our swarm, returning the
    /// pointer to embed in an outgoing message.
    pub async fn upload_attachment(
        &self,
        data: &[u8],
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<AttachmentPointer, SessionError> {
        let session_id = self.session_id()?;
        let encrypted = attachments::encrypt_attachment(data, true);

        let swarm = self.get_our_swarm().await?;
        let snode = choose(&swarm.snodes)
            .ok_or_else(|| FetchError::Snode("empty swarm".into()))?;

        let call = RpcCall::new(
            "store",
            json!({
                "pubkey": session_id,
                "timestamp": self.now_with_network_offset(),
                "ttl": self.config.ttl_ms,
                "data": codec::bytes_to_base64(&encrypted.ciphertext),
            }),
        );
        let response =
            rpc::snode_single_request(self.transport.as_ref(), &snode.storage_url(), &call).await?;
        if !response.is_ok() {
            return Err(SessionError::Fetch(FetchError::Snode(format!(
                "failed to upload attachment: status {}",
                response.status
            ))));
        }
        let id = response
            .json::<serde_json::Value>()
            .ok()
            .and_then(|v| {
                v.get("hash")
                    .or_else(|| v.get("id"))
                    .and_then(|h| h.as_str())
                    .map(str::to_owned)
            })
            .unwrap_or_default();

        Ok(AttachmentPointer {
            id: 0,
            content_type: content_type.map(str::to_owned),
            key: encrypted.key.to_vec(),
            size: Some(data.len() as u32),
            digest: encrypted.digest.to_vec(),
            file_name: file_name.map(str::to_owned),
            width: None,
            height: None,
            caption: None,
            url: format!("https://{}:{}/attachments/{id}", snode.host, snode.port),
        })
    }

    /// Download and decrypt an attachment by its pointer.
    pub async fn download_attachment(
        &self,
        pointer: &AttachmentPointer,
    ) -> Result<Vec<u8>, SessionError> {
        let response = self.transport.request(Request::get(&pointer.url)).await?;
        if !response.is_ok() {
            return Err(SessionError::Fetch(FetchError::Snode(format!(
                "failed to download attachment: status {}",
                response.status
            ))));
        }
        let plaintext = attachments::decrypt_attachment(
            &response.body,
            &pointer.key,
            &pointer.digest,
            pointer.size.map(|s| s as usize),
        )?;
        Ok(plaintext)
    }

    // ─── Polling ─────────────────────────────────────────────────────────────

    /// Start a background poller over the given options.
    pub fn start_polling(
        self: &Arc<Self>,
        options: PollerOptions,
    ) -> Result<Arc<Poller>, SessionError> {
        let poller = Arc::new(Poller::new(Arc::downgrade(self), options));
        poller.start()?;
        self.pollers.lock().expect("pollers").push(poller.clone());
        Ok(poller)
    }

    /// One retrieve pass over `namespaces`: fetch, decrypt, deliver,
    /// advance cursors. Used by [`Poller`] and callable directly.
    pub async fn poll_namespaces(
        &self,
        namespaces: &[SnodeNamespace],
    ) -> Result<Vec<IncomingMessage>, SessionError> {
        let keypair = self.keypair().ok_or(SessionError::NotAuthorized)?;
        let session_id = self.session_id()?;

        let swarm = self.get_our_swarm().await?;
        let snode = choose(&swarm.snodes)
            .ok_or_else(|| FetchError::Snode("empty swarm".into()))?;

        // one signed retrieve sub-request per namespace
        let mut calls = Vec::with_capacity(namespaces.len());
        for namespace in namespaces {
            let timestamp = self.now_with_network_offset();
            let last_hash = self
                .storage
                .get(&namespace.cursor_key())
                .await?
                .unwrap_or_default();
            let signature =
                signing::sign_snode_request(&keypair, "retrieve", namespace.id(), timestamp);
            calls.push(RpcCall::new(
                "retrieve",
                json!({
                    "pubkey": session_id,
                    "namespace": namespace.id(),
                    "last_hash": last_hash,
                    "timestamp": timestamp,
                    "signature": signature.signature,
                    "pubkeyEd25519": signature.pubkey_ed25519,
                }),
            ));
        }

        let results = match rpc::snode_batch_request(
            self.transport.as_ref(),
            &snode.storage_url(),
            &calls,
        )
        .await
        {
            Ok(results) => results,
            Err(error) => {
                // the next iteration re-resolves a fresh swarm
                self.invalidate_our_swarm().await;
                return Err(error.into());
            }
        };

        let group_keys = self.group_keys.read().expect("group keys").clone();
        let mut delivered = Vec::new();
        let mut cursors: Vec<(SnodeNamespace, String)> = Vec::new();

        for (namespace, entry) in namespaces.iter().zip(results) {
            if !entry.is_ok() {
                log::warn!(
                    "retrieve for namespace {} failed with code {:?}",
                    namespace.id(),
                    entry.code
                );
                continue;
            }
            let raw_messages: Vec<StoredMessage> = entry
                .body
                .as_ref()
                .and_then(|body| body.get("messages"))
                .and_then(|m| serde_json::from_value(m.clone()).ok())
                .unwrap_or_default();
            if raw_messages.is_empty() {
                continue;
            }

            let new_cursor = raw_messages.last().map(|m| m.hash.clone());
            for raw in raw_messages {
                match self.process_stored_message(*namespace, &raw, &keypair, &group_keys) {
                    Ok(message) => {
                        if message.data_message().is_some() {
                            let callbacks = self.callbacks.read().expect("callbacks");
                            for callback in callbacks.iter() {
                                callback(&message);
                            }
                        }
                        delivered.push(message);
                    }
                    Err(error) => {
                        // drop the message; the advancing cursor makes sure
                        // it is not fetched again
                        log::warn!("failed to decrypt message {}: {error}", raw.hash);
                    }
                }
            }

            // cursor moves only after every message above was delivered
            if let Some(hash) = new_cursor {
                self.storage.set(&namespace.cursor_key(), &hash).await?;
                cursors.push((*namespace, hash));
            }
        }

        if !cursors.is_empty() {
            // merge into the aggregate snapshot
            let mut snapshot: serde_json::Map<String, serde_json::Value> = self
                .storage
                .get("lastHashes")
                .await
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default();
            for (namespace, hash) in cursors {
                snapshot.insert(
                    namespace.id().to_string(),
                    serde_json::Value::String(hash),
                );
            }
            if let Err(error) = self
                .storage
                .set("lastHashes", &serde_json::Value::Object(snapshot).to_string())
                .await
            {
                log::warn!("failed to persist cursor snapshot: {error}");
            }
        }

        Ok(delivered)
    }

    fn process_stored_message(
        &self,
        namespace: SnodeNamespace,
        raw: &StoredMessage,
        keypair: &KeyPair,
        group_keys: &[GroupKey],
    ) -> Result<IncomingMessage, SessionError> {
        let data = codec::base64_to_bytes(&raw.data)
            .map_err(|e| SessionError::InvalidOptions(format!("bad message data: {e}")))?;

        // tolerate both wrapped envelopes and bare ciphertext
        let (ciphertext, envelope_timestamp) = match envelope::extract_envelope(&data) {
            Ok(env) => {
                EnvelopeType::try_from(env.r#type)
                    .map_err(|_| DecryptError::UnknownType(env.r#type))?;
                (env.content, env.timestamp)
            }
            Err(_) => (data, 0),
        };

        let decrypted = encryption::decrypt(
            keypair,
            &ciphertext,
            namespace.envelope_type(),
            group_keys,
            self.config.padding,
        )?;
        let content: Content = prost::Message::decode(decrypted.plaintext.as_slice())
            .map_err(EnvelopeError::Decode)?;

        let timestamp = content
            .data_message
            .as_ref()
            .and_then(|dm| dm.timestamp)
            .or(raw.timestamp)
            .unwrap_or(envelope_timestamp);

        Ok(IncomingMessage {
            namespace,
            hash: raw.hash.clone(),
            author_session_id: format!("05{}", decrypted.sender),
            timestamp,
            content,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // stop-on-drop for every poller this session spawned
        if let Ok(pollers) = self.pollers.lock() {
            for poller in pollers.iter() {
                poller.stop();
            }
        }
    }
}

fn validate_session_id(id: &str) -> Result<(), SessionError> {
    if id.len() != 66 || !id.starts_with("05") || !codec::is_hex(&id[2..]) {
        return Err(SessionError::InvalidSessionId(id.to_owned()));
    }
    Ok(())
}

/// Clone a uniformly random element out of a slice.
fn choose<T: Clone>(items: &[T]) -> Option<T> {
    use rand::Rng;
    if items.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..items.len());
    Some(items[index].clone())
}

fn system_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;
    use crate::transport::Response;
    use std::collections::HashMap;

    const MNEMONIC: &str = "session session session session session session session \
                            session session session session session session";

    fn session_with(mock: MockTransport) -> Arc<Session> {
        let (session, _) = session_and_mock(mock);
        session
    }

    fn session_and_mock(mock: MockTransport) -> (Arc<Session>, Arc<MockTransport>) {
        let mock = Arc::new(mock);
        let session = Arc::new(Session::with_parts(
            Arc::new(MemoryStorage::new()),
            mock.clone(),
            SessionConfig::default(),
        ));
        (session, mock)
    }

    fn cached_snode() -> Vec<Snode> {
        vec![Snode {
            host: "1.1.1.1".into(),
            port: 22021,
            pubkey_x25519: "x".into(),
            pubkey_ed25519: "e".into(),
        }]
    }

    fn swarm_batch_response(hosts: &[&str]) -> Response {
        let snodes: Vec<serde_json::Value> = hosts
            .iter()
            .map(|h| json!({"ip": h, "port": 22021, "x25519": "aa", "ed25519": "bb"}))
            .collect();
        MockTransport::json_response(
            200,
            json!({"results": [{"code": 200, "body": {"snodes": snodes}}]}),
        )
    }

    #[tokio::test]
    async fn set_mnemonic_authorizes_once() {
        let session = session_with(MockTransport::new(vec![]));
        assert!(!session.is_authorized());
        assert!(matches!(session.session_id(), Err(SessionError::NotAuthorized)));

        session.set_mnemonic(MNEMONIC, Some("alice")).await.unwrap();
        assert!(session.is_authorized());
        assert_eq!(
            session.session_id().unwrap(),
            "0512742fb4ac033a8a33f5776aa0e7e88f35f7af9f65dee31e57fbc7d6f8664b12"
        );
        assert_eq!(session.display_name().as_deref(), Some("alice"));
        assert_eq!(
            session.storage.get("mnemonic").await.unwrap().as_deref(),
            Some(MNEMONIC)
        );

        assert!(matches!(
            session.set_mnemonic(MNEMONIC, None).await,
            Err(SessionError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn set_mnemonic_rejects_wrong_word_count() {
        let session = session_with(MockTransport::new(vec![]));
        assert!(matches!(
            session.set_mnemonic("one two three", None).await,
            Err(SessionError::InvalidMnemonic(MnemonicError::WordCount(3)))
        ));
        assert!(!session.is_authorized());
    }

    #[tokio::test]
    async fn send_message_validates_recipient() {
        let session = session_with(MockTransport::new(vec![]));
        session.set_mnemonic(MNEMONIC, None).await.unwrap();

        for bad in ["", "05short", &format!("06{}", "ab".repeat(32))] {
            assert!(matches!(
                session.send_message(bad, "hi").await,
                Err(SessionError::InvalidSessionId(_))
            ));
        }
    }

    #[tokio::test]
    async fn send_message_requires_authorization() {
        let session = session_with(MockTransport::new(vec![]));
        let to = format!("05{}", "ab".repeat(32));
        assert!(matches!(
            session.send_message(&to, "hi").await,
            Err(SessionError::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn send_message_stores_on_recipient_swarm() {
        let recipient = KeyPair::generate();
        let mock = MockTransport::new(vec![
            // swarm resolution for the recipient
            Ok(swarm_batch_response(&["7.7.7.7"])),
            // store
            Ok(MockTransport::json_response(200, json!({"hash": "stored-hash"}))),
        ]);
        let session = session_with(mock);
        session.set_mnemonic(MNEMONIC, None).await.unwrap();
        // seed the snode cache so no discovery request is needed
        *session.snodes.write().await = Some(cached_snode());

        let result = session
            .send_message(&recipient.session_id(), "hello over the swarm")
            .await
            .unwrap();
        assert_eq!(result.message_hash, "stored-hash");
        assert!(result.timestamp > 0);
    }

    #[tokio::test]
    async fn store_gives_up_when_swarms_are_exhausted() {
        let recipient = KeyPair::generate();
        let mock = MockTransport::new(vec![
            Ok(swarm_batch_response(&["7.7.7.7"])),
            // store fails; only one swarm, so the path must give up
            Ok(MockTransport::json_response(500, json!({}))),
        ]);
        let session = session_with(mock);
        session.set_mnemonic(MNEMONIC, None).await.unwrap();
        *session.snodes.write().await = Some(cached_snode());

        let error = session
            .send_message(&recipient.session_id(), "doomed")
            .await
            .unwrap_err();
        assert!(matches!(error, SessionError::Fetch(FetchError::Snode(_))));
    }

    /// Build the stored `data` field for a message from `sender` to `session`.
    fn stored_data_for(sender: &KeyPair, recipient_id: &str, body: &str, ts: u64) -> String {
        let content = Content {
            data_message: Some(DataMessage {
                body: Some(body.to_owned()),
                attachments: vec![],
                timestamp: Some(ts),
                quote: None,
            }),
            ..Default::default()
        };
        let plaintext = prost::Message::encode_to_vec(&content);
        let encrypted = encryption::encrypt(
            sender,
            recipient_id,
            &plaintext,
            EnvelopeType::SessionMessage,
            PaddingScheme::default(),
        )
        .unwrap();
        let env = envelope::build_envelope(
            EnvelopeType::SessionMessage,
            None,
            ts,
            encrypted.ciphertext,
        );
        codec::bytes_to_base64(&envelope::wrap_envelope(&env))
    }

    #[tokio::test]
    async fn poll_delivers_messages_and_advances_cursor() {
        let sender = KeyPair::generate();
        let our_id = "0512742fb4ac033a8a33f5776aa0e7e88f35f7af9f65dee31e57fbc7d6f8664b12";

        let m1 = stored_data_for(&sender, our_id, "first", 1111);
        let m2 = stored_data_for(&sender, our_id, "second", 2222);

        let mock = MockTransport::new(vec![
            // our swarm resolution
            Ok(swarm_batch_response(&["2.2.2.2"])),
            // retrieve batch for namespace 0
            Ok(MockTransport::json_response(
                200,
                json!({"results": [{"code": 200, "body": {"messages": [
                    {"hash": "h1", "data": m1, "pubkey": our_id},
                    {"hash": "h2", "data": m2, "pubkey": our_id},
                ]}}]}),
            )),
        ]);
        let session = session_with(mock);
        session.set_mnemonic(MNEMONIC, None).await.unwrap();
        *session.snodes.write().await = Some(cached_snode());

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        session.on_message(move |message| {
            seen_clone
                .lock()
                .unwrap()
                .push(message.body().unwrap_or_default().to_owned());
        });

        let delivered = session
            .poll_namespaces(&[SnodeNamespace::UserMessages])
            .await
            .unwrap();

        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].body(), Some("first"));
        assert_eq!(delivered[1].body(), Some("second"));
        let expected_author = format!("05{}", hex::encode(sender.x25519_public.as_bytes()));
        assert_eq!(delivered[0].author_session_id, expected_author);

        // callbacks ran synchronously, in order
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);

        // cursor advanced to the last hash and the snapshot was written
        assert_eq!(
            session.storage.get("last_hash_0").await.unwrap().as_deref(),
            Some("h2")
        );
        let snapshot = session.storage.get("lastHashes").await.unwrap().unwrap();
        assert!(snapshot.contains("h2"));
    }

    #[tokio::test]
    async fn poll_drops_undecryptable_messages_but_advances() {
        let sender = KeyPair::generate();
        let our_id = "0512742fb4ac033a8a33f5776aa0e7e88f35f7af9f65dee31e57fbc7d6f8664b12";
        let good = stored_data_for(&sender, our_id, "good", 1);

        // an envelope with a wire type no peer uses
        let unknown_type = envelope::Envelope {
            r#type: 4,
            source: None,
            timestamp: 1,
            content: vec![1, 2, 3],
        };
        let unknown = codec::bytes_to_base64(&envelope::wrap_envelope(&unknown_type));

        let mock = MockTransport::new(vec![
            Ok(swarm_batch_response(&["2.2.2.2"])),
            Ok(MockTransport::json_response(
                200,
                json!({"results": [{"code": 200, "body": {"messages": [
                    {"hash": "bad", "data": codec::bytes_to_base64(b"garbage")},
                    {"hash": "odd", "data": unknown},
                    {"hash": "ok", "data": good},
                ]}}]}),
            )),
        ]);
        let session = session_with(mock);
        session.set_mnemonic(MNEMONIC, None).await.unwrap();
        *session.snodes.write().await = Some(cached_snode());

        let delivered = session
            .poll_namespaces(&[SnodeNamespace::UserMessages])
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body(), Some("good"));
        // the undecryptable message is skipped over for good
        assert_eq!(
            session.storage.get("last_hash_0").await.unwrap().as_deref(),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn poll_skips_failed_namespaces_without_cursor_movement() {
        let mock = MockTransport::new(vec![
            Ok(swarm_batch_response(&["2.2.2.2"])),
            Ok(MockTransport::json_response(
                200,
                json!({"results": [
                    {"code": 500, "body": {}},
                    {"code": 200, "body": {"messages": []}},
                ]}),
            )),
        ]);
        let session = session_with(mock);
        session.set_mnemonic(MNEMONIC, None).await.unwrap();
        *session.snodes.write().await = Some(cached_snode());

        let delivered = session
            .poll_namespaces(&[SnodeNamespace::UserMessages, SnodeNamespace::UserContacts])
            .await
            .unwrap();
        assert!(delivered.is_empty());
        assert_eq!(session.storage.get("last_hash_0").await.unwrap(), None);
        assert_eq!(session.storage.get("last_hash_3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn retrieve_requests_carry_signature_params() {
        let (session, mock) = session_and_mock(MockTransport::new(vec![
            Ok(swarm_batch_response(&["2.2.2.2"])),
            Ok(MockTransport::json_response(
                200,
                json!({"results": [{"code": 200, "body": {"messages": []}}]}),
            )),
        ]));
        session.set_mnemonic(MNEMONIC, None).await.unwrap();
        *session.snodes.write().await = Some(cached_snode());

        session
            .poll_namespaces(&[SnodeNamespace::ConvoInfoVolatile])
            .await
            .unwrap();

        let requests = mock.requests.lock().unwrap();
        let crate::transport::RequestBody::Json(body) =
            requests[1].body.as_ref().unwrap().clone()
        else {
            panic!("expected json body")
        };
        let sub = &body["params"]["requests"][0];
        assert_eq!(sub["method"], "retrieve");
        assert_eq!(sub["params"]["namespace"], 2);
        assert_eq!(sub["params"]["last_hash"], "");
        assert_eq!(sub["params"]["pubkeyEd25519"].as_str().unwrap().len(), 64);
        let signature = sub["params"]["signature"].as_str().unwrap();
        assert_eq!(codec::base64_to_bytes(signature).unwrap().len(), 64);
    }

    #[tokio::test]
    async fn polling_stops_cleanly() {
        let (session, mock) = session_and_mock(MockTransport::new(vec![
            Ok(swarm_batch_response(&["2.2.2.2"])),
            Ok(MockTransport::json_response(
                200,
                json!({"results": [{"code": 200, "body": {"messages": []}}]}),
            )),
        ]));
        session.set_mnemonic(MNEMONIC, None).await.unwrap();
        *session.snodes.write().await = Some(cached_snode());

        let poller = session
            .start_polling(PollerOptions {
                interval: std::time::Duration::from_millis(50),
                namespaces: vec![SnodeNamespace::UserMessages],
            })
            .unwrap();
        assert!(poller.is_polling());

        // let the first iteration run, then stop
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        poller.stop();
        assert!(!poller.is_polling());

        let after_stop = mock.request_count();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(
            mock.request_count(),
            after_stop,
            "no transport calls after stop"
        );
    }

    #[tokio::test]
    async fn polling_requires_authorization() {
        let session = session_with(MockTransport::new(vec![]));
        let result = session.start_polling(PollerOptions::default());
        assert!(matches!(result, Err(SessionError::NotAuthorized)));
    }

    #[tokio::test]
    async fn network_time_offset_applies_to_timestamps() {
        let mut headers = HashMap::new();
        headers.insert(
            "date".to_owned(),
            // far in the past: offset becomes strongly negative
            "Thu, 01 Jan 2015 00:00:00 GMT".to_owned(),
        );
        let mock = MockTransport::new(vec![
            // discovery
            Ok(MockTransport::json_response(
                200,
                json!({"result": {"service_node_states": [
                    {"public_ip": "3.3.3.3", "storage_port": 1,
                     "pubkey_x25519": "x", "pubkey_ed25519": "e"}
                ]}}),
            )),
            // HEAD for the date header
            Ok(Response { status: 200, headers, body: Vec::new() }),
        ]);
        let session = session_with(mock);
        session.init().await;

        let adjusted = session.now_with_network_offset();
        let now = system_now_ms();
        assert!(adjusted < now, "offset into the past must apply");
    }

    #[tokio::test]
    async fn group_key_registration_validates_hex() {
        let session = session_with(MockTransport::new(vec![]));
        assert!(session.add_group_key(&"ab".repeat(32)).is_ok());
        assert!(matches!(
            session.add_group_key("zz"),
            Err(SessionError::InvalidOptions(_))
        ));
    }

    #[tokio::test]
    async fn group_messages_decrypt_through_keyring() {
        let sender = KeyPair::generate();
        let mut key = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut key);

        // group ciphertext, no envelope wrapper (older peers send bare)
        let content = Content {
            data_message: Some(DataMessage {
                body: Some("to the group".to_owned()),
                attachments: vec![],
                timestamp: Some(5),
                quote: None,
            }),
            ..Default::default()
        };
        let plaintext = prost::Message::encode_to_vec(&content);
        let encrypted = encryption::encrypt(
            &sender,
            &hex::encode(key),
            &plaintext,
            EnvelopeType::ClosedGroupMessage,
            PaddingScheme::default(),
        )
        .unwrap();
        let env = envelope::build_envelope(
            EnvelopeType::ClosedGroupMessage,
            Some("group-source"),
            5,
            encrypted.ciphertext,
        );
        let data = codec::bytes_to_base64(&envelope::wrap_envelope(&env));

        let mock = MockTransport::new(vec![
            Ok(swarm_batch_response(&["2.2.2.2"])),
            Ok(MockTransport::json_response(
                200,
                json!({"results": [{"code": 200, "body": {"messages": [
                    {"hash": "g1", "data": data},
                ]}}]}),
            )),
        ]);
        let session = session_with(mock);
        session.set_mnemonic(MNEMONIC, None).await.unwrap();
        session.add_group_key(&hex::encode(key)).unwrap();
        *session.snodes.write().await = Some(cached_snode());

        let delivered = session
            .poll_namespaces(&[SnodeNamespace::ClosedGroupMessage])
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body(), Some("to the group"));
    }
}
