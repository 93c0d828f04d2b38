//! Nostr record model: tags, unsigned inner records, signed events and keys.

use std::fmt;

use rand::thread_rng;
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EventError;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. The reservation layer relies on:
///
/// - `p` – the recipient public key
/// - `e` – thread markers pointing at earlier inner records
/// - `nonce` – proof-of-work nonce and claimed difficulty
/// - `party_size`, `time`, `tzid`, `status`, ... – reservation fields
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved. For
/// example, a `["tzid", "UTC"]` tag is represented as
/// `Tag(vec!["tzid".into(), "UTC".into()])`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from any iterator of string-like parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    /// Tag name, i.e. the first element.
    pub fn name(&self) -> Option<&str> {
        self.get(0)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.get(1)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn is(&self, name: &str) -> bool {
        self.name() == Some(name)
    }
}

/// First value of the first tag called `name`.
pub fn tag_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter().find(|t| t.is(name)).and_then(Tag::value)
}

/// Common read access over unsigned and signed records.
pub trait Record {
    fn id(&self) -> &str;
    fn pubkey(&self) -> &str;
    fn kind(&self) -> u32;
    fn created_at(&self) -> u64;
    fn tags(&self) -> &[Tag];
    fn content(&self) -> &str;
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Recompute the Nostr event hash from its fields.
///
/// The canonical form is the JSON array
/// `[0, pubkey, created_at, kind, tags, content]`.
pub fn event_hash(pubkey: &str, created_at: u64, kind: u32, tags: &[Tag], content: &str) -> [u8; 32] {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    Sha256::digest(arr.to_string().as_bytes()).into()
}

/// Unsigned record whose id is derived from its fields.
///
/// Used as the inner payload holder of a privacy envelope. It is never signed,
/// so leaking it does not prove who wrote it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "RawUnsigned")]
pub struct UnsignedEvent {
    /// Hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Author public key (x-only hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number, e.g. `9901`.
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

/// Wire shape of an unsigned record. The `id` field is ignored on input.
#[derive(Deserialize)]
struct RawUnsigned {
    pubkey: String,
    created_at: u64,
    kind: u32,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    content: String,
}

impl From<RawUnsigned> for UnsignedEvent {
    fn from(raw: RawUnsigned) -> Self {
        UnsignedEvent::new(raw.pubkey, raw.created_at, raw.kind, raw.tags, raw.content)
    }
}

impl UnsignedEvent {
    /// Create a record and compute its id.
    pub fn new(
        pubkey: impl Into<String>,
        created_at: u64,
        kind: u32,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Self {
        let mut ev = UnsignedEvent {
            id: String::new(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags,
            content: content.into(),
        };
        ev.id = ev.compute_id();
        ev
    }

    pub fn compute_id(&self) -> String {
        hex::encode(event_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
    }

    /// Replace the tags and refresh the id.
    pub fn with_tags(mut self, tags: Vec<Tag>) -> Self {
        self.tags = tags;
        self.id = self.compute_id();
        self
    }

    /// Sign the record with `keys`, which must match `pubkey`.
    pub fn sign(self, keys: &Keys) -> Result<Event, EventError> {
        if keys.public_key_hex() != self.pubkey {
            return Err(EventError::InvalidSignature(self.id));
        }
        let hash = event_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        let secp = Secp256k1::new();
        let msg = Message::from_digest(hash);
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &keys.keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey: self.pubkey,
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

impl Record for UnsignedEvent {
    fn id(&self) -> &str {
        &self.id
    }
    fn pubkey(&self) -> &str {
        &self.pubkey
    }
    fn kind(&self) -> u32 {
        self.kind
    }
    fn created_at(&self) -> u64 {
        self.created_at
    }
    fn tags(&self) -> &[Tag] {
        &self.tags
    }
    fn content(&self) -> &str {
        &self.content
    }
}

/// Signed Nostr event as published to relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "79be...",
///   "kind": 1059,
///   "created_at": 1700000000,
///   "tags": [["p", "b0c1..."]],
///   "content": "AQ...",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `13` or `1059`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Verify the event's id and Schnorr signature.
    pub fn verify(&self) -> Result<(), EventError> {
        let hash = event_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        let calc_id = hex::encode(hash);
        if calc_id != self.id {
            return Err(EventError::IdMismatch {
                expected: calc_id,
                actual: self.id.clone(),
            });
        }
        let bad_sig = || EventError::InvalidSignature(self.id.clone());
        let sig_bytes = hex::decode(&self.sig).map_err(|_| bad_sig())?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| bad_sig())?;
        let pk = parse_public_key(&self.pubkey)?;
        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &Message::from_digest(hash), &pk)
            .map_err(|_| bad_sig())
    }

    /// Drop the signature, keeping the fields.
    pub fn into_unsigned(self) -> UnsignedEvent {
        UnsignedEvent {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }
}

impl Record for Event {
    fn id(&self) -> &str {
        &self.id
    }
    fn pubkey(&self) -> &str {
        &self.pubkey
    }
    fn kind(&self) -> u32 {
        self.kind
    }
    fn created_at(&self) -> u64 {
        self.created_at
    }
    fn tags(&self) -> &[Tag] {
        &self.tags
    }
    fn content(&self) -> &str {
        &self.content
    }
}

/// Parse an x-only public key from hex.
pub fn parse_public_key(hex_key: &str) -> Result<XOnlyPublicKey, EventError> {
    let bytes = hex::decode(hex_key).map_err(|_| EventError::InvalidPublicKey(hex_key.into()))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|_| EventError::InvalidPublicKey(hex_key.into()))
}

/// A secp256k1 keypair used to sign records and derive shared secrets.
#[derive(Clone, Copy)]
pub struct Keys {
    keypair: Keypair,
}

impl Keys {
    /// Fresh random keypair, e.g. for a single-use envelope key.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        Keys {
            keypair: Keypair::new(&secp, &mut thread_rng()),
        }
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self, EventError> {
        let bytes = hex::decode(secret.trim()).map_err(|_| EventError::InvalidSecretKey)?;
        let secp = Secp256k1::new();
        let keypair =
            Keypair::from_seckey_slice(&secp, &bytes).map_err(|_| EventError::InvalidSecretKey)?;
        Ok(Keys { keypair })
    }

    pub fn public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().serialize())
    }

    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key().secret_bytes())
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Keys {
        Keys::from_secret_hex(&"01".repeat(32)).unwrap()
    }

    #[test]
    fn event_hash_matches_reference() {
        let tags = vec![Tag::new(["t", "news"])];
        let mut hasher = Sha256::new();
        hasher.update(br#"[0,"pk",1,1,[["t","news"]],"hi"]"#);
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(event_hash("pk", 1, 1, &tags, "hi"), expected);
    }

    #[test]
    fn sign_and_verify() {
        let k = keys();
        let ev = UnsignedEvent::new(k.public_key_hex(), 1, 1, vec![], "hello")
            .sign(&k)
            .unwrap();
        ev.verify().unwrap();
    }

    #[test]
    fn verify_rejects_tampered_content() {
        let k = keys();
        let mut ev = UnsignedEvent::new(k.public_key_hex(), 1, 1, vec![], "hello")
            .sign(&k)
            .unwrap();
        ev.content = "bye".into();
        assert!(matches!(ev.verify(), Err(EventError::IdMismatch { .. })));
    }

    #[test]
    fn verify_rejects_foreign_signature() {
        let k = keys();
        let other = Keys::generate();
        let mut ev = UnsignedEvent::new(k.public_key_hex(), 1, 1, vec![], "hello")
            .sign(&k)
            .unwrap();
        let forged = UnsignedEvent::new(other.public_key_hex(), 1, 1, vec![], "hello")
            .sign(&other)
            .unwrap();
        ev.sig = forged.sig;
        assert!(matches!(ev.verify(), Err(EventError::InvalidSignature(_))));
    }

    #[test]
    fn sign_requires_matching_key() {
        let ev = UnsignedEvent::new(keys().public_key_hex(), 1, 1, vec![], "");
        assert!(ev.sign(&Keys::generate()).is_err());
    }

    #[test]
    fn deserializing_unsigned_rederives_id() {
        let k = keys();
        let ev = UnsignedEvent::new(k.public_key_hex(), 5, 9901, vec![Tag::new(["p", "x"])], "m");
        let mut json = serde_json::to_value(&ev).unwrap();
        json["id"] = serde_json::Value::String("ff".repeat(32));
        let back: UnsignedEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn tag_helpers() {
        let tags = vec![Tag::new(["p", "abc"]), Tag::new(["tzid", "UTC"])];
        assert_eq!(tag_value(&tags, "tzid"), Some("UTC"));
        assert_eq!(tag_value(&tags, "time"), None);
        assert_eq!(tags[0].name(), Some("p"));
        assert!(Tag::new(Vec::<String>::new()).name().is_none());
    }

    #[test]
    fn keys_round_trip_and_debug_hides_secret() {
        let k = Keys::generate();
        let again = Keys::from_secret_hex(&k.secret_key_hex()).unwrap();
        assert_eq!(k.public_key_hex(), again.public_key_hex());
        assert!(!format!("{k:?}").contains(&k.secret_key_hex()));
        assert!(Keys::from_secret_hex("zz").is_err());
    }
}
