//! Three-stage privacy wrapping (NIP-59 gift wrap).
//!
//! ```text
//! inner record (unsigned, real author, real time)
//!   -> seal      kind 13, signed by the sender, content = enc(inner)
//!   -> envelope  kind 1059, signed by a one-time key, content = enc(seal),
//!                tagged ["p", recipient]
//! ```
//!
//! Relays only ever see the outer envelope: a throwaway author, a recipient
//! tag and ciphertext. Seal and envelope timestamps are pushed a random
//! amount into the past so publication time does not leak the real one.

use rand::Rng;

use crate::{
    cipher::Cipher,
    error::EnvelopeError,
    event::{unix_now, Event, Keys, Tag, UnsignedEvent},
};

pub const SEAL_KIND: u32 = 13;
pub const GIFT_WRAP_KIND: u32 = 1059;

/// Upper bound of the random backdating applied to seals and envelopes.
pub const MAX_TIMESTAMP_JITTER: u64 = 2 * 24 * 60 * 60;

/// A successfully opened envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub inner: UnsignedEvent,
    pub envelope: Event,
}

/// Result of unwrapping a batch of envelopes.
#[derive(Debug, Default)]
pub struct UnwrapBatch {
    pub opened: Vec<Opened>,
    /// Envelope id and the reason it could not be opened.
    pub failed: Vec<(String, EnvelopeError)>,
}

impl UnwrapBatch {
    pub fn inner_records(&self) -> Vec<UnsignedEvent> {
        self.opened.iter().map(|o| o.inner.clone()).collect()
    }

    /// Failures other than "addressed to someone else".
    pub fn suspicious(&self) -> impl Iterator<Item = &(String, EnvelopeError)> {
        self.failed.iter().filter(|(_, e)| !e.is_not_mine())
    }
}

fn jittered(now: u64) -> u64 {
    now.saturating_sub(rand::thread_rng().gen_range(0..=MAX_TIMESTAMP_JITTER))
}

/// Build the unsigned inner record authored by `sender`.
pub fn build_inner(
    sender: &Keys,
    kind: u32,
    tags: Vec<Tag>,
    content: impl Into<String>,
    created_at: u64,
) -> UnsignedEvent {
    UnsignedEvent::new(sender.public_key_hex(), created_at, kind, tags, content)
}

/// Encrypt `inner` to the recipient and sign the seal as the sender.
pub fn build_seal<C: Cipher>(
    cipher: &C,
    inner: &UnsignedEvent,
    sender: &Keys,
    recipient_pubkey: &str,
) -> Result<Event, EnvelopeError> {
    let sender_pubkey = sender.public_key_hex();
    if inner.pubkey != sender_pubkey {
        return Err(EnvelopeError::SenderMismatch {
            seal: sender_pubkey,
            inner: inner.pubkey.clone(),
        });
    }
    let plaintext = serde_json::to_string(inner).map_err(|e| EnvelopeError::Malformed {
        stage: "inner",
        reason: e.to_string(),
    })?;
    let content = cipher.encrypt(&plaintext, sender, recipient_pubkey)?;
    let seal = UnsignedEvent::new(sender_pubkey, jittered(unix_now()), SEAL_KIND, vec![], content);
    Ok(seal.sign(sender)?)
}

/// Encrypt `seal` under a fresh one-time key and address it to the recipient.
pub fn build_outer<C: Cipher>(
    cipher: &C,
    seal: &Event,
    recipient_pubkey: &str,
) -> Result<Event, EnvelopeError> {
    let ephemeral = Keys::generate();
    let plaintext = serde_json::to_string(seal).map_err(|e| EnvelopeError::Malformed {
        stage: "seal",
        reason: e.to_string(),
    })?;
    let content = cipher.encrypt(&plaintext, &ephemeral, recipient_pubkey)?;
    let outer = UnsignedEvent::new(
        ephemeral.public_key_hex(),
        jittered(unix_now()),
        GIFT_WRAP_KIND,
        vec![Tag::new(["p", recipient_pubkey])],
        content,
    );
    Ok(outer.sign(&ephemeral)?)
}

/// Seal and wrap an existing inner record for one recipient.
pub fn wrap_inner<C: Cipher>(
    cipher: &C,
    inner: &UnsignedEvent,
    sender: &Keys,
    recipient_pubkey: &str,
) -> Result<Event, EnvelopeError> {
    let seal = build_seal(cipher, inner, sender, recipient_pubkey)?;
    build_outer(cipher, &seal, recipient_pubkey)
}

/// Build the inner record and wrap it for `recipient_pubkey` in one step.
pub fn wrap<C: Cipher>(
    cipher: &C,
    sender: &Keys,
    recipient_pubkey: &str,
    kind: u32,
    tags: Vec<Tag>,
    content: &str,
) -> Result<Event, EnvelopeError> {
    let inner = build_inner(sender, kind, tags, content, unix_now());
    wrap_inner(cipher, &inner, sender, recipient_pubkey)
}

/// Open an envelope addressed to `recipient`.
///
/// [`EnvelopeError::DecryptionFailed`] is the normal result for envelopes
/// meant for someone else.
pub fn unwrap<C: Cipher>(
    cipher: &C,
    outer: &Event,
    recipient: &Keys,
) -> Result<UnsignedEvent, EnvelopeError> {
    if outer.kind != GIFT_WRAP_KIND {
        return Err(EnvelopeError::UnexpectedKind {
            stage: "envelope",
            expected: GIFT_WRAP_KIND,
            actual: outer.kind,
        });
    }
    outer.verify()?;
    let seal_json = cipher
        .decrypt(&outer.content, recipient, &outer.pubkey)
        .map_err(|e| EnvelopeError::DecryptionFailed {
            stage: "envelope",
            reason: e.to_string(),
        })?;
    let seal: Event = serde_json::from_str(&seal_json).map_err(|e| EnvelopeError::Malformed {
        stage: "seal",
        reason: e.to_string(),
    })?;
    if seal.kind != SEAL_KIND {
        return Err(EnvelopeError::UnexpectedKind {
            stage: "seal",
            expected: SEAL_KIND,
            actual: seal.kind,
        });
    }
    seal.verify()?;
    let inner_json = cipher
        .decrypt(&seal.content, recipient, &seal.pubkey)
        .map_err(|e| EnvelopeError::DecryptionFailed {
            stage: "seal",
            reason: e.to_string(),
        })?;
    // Deserializing recomputes the id from the recovered fields.
    let inner: UnsignedEvent =
        serde_json::from_str(&inner_json).map_err(|e| EnvelopeError::Malformed {
            stage: "inner",
            reason: e.to_string(),
        })?;
    if inner.pubkey != seal.pubkey {
        return Err(EnvelopeError::SenderMismatch {
            seal: seal.pubkey,
            inner: inner.pubkey,
        });
    }
    Ok(inner)
}

/// Unwrap every envelope, collecting failures instead of stopping at them.
pub fn unwrap_many<C: Cipher>(cipher: &C, outers: &[Event], recipient: &Keys) -> UnwrapBatch {
    let mut batch = UnwrapBatch::default();
    for outer in outers {
        match unwrap(cipher, outer, recipient) {
            Ok(inner) => batch.opened.push(Opened {
                inner,
                envelope: outer.clone(),
            }),
            Err(e) => {
                if e.is_not_mine() {
                    tracing::debug!(envelope = %outer.id, "skipping envelope not addressed to us");
                } else {
                    tracing::warn!(envelope = %outer.id, error = %e, "dropping undecodable envelope");
                }
                batch.failed.push((outer.id.clone(), e));
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cipher::ConversationCipher, event::tag_value};

    const CIPHER: ConversationCipher = ConversationCipher;

    fn inner_for(sender: &Keys) -> UnsignedEvent {
        build_inner(
            sender,
            9901,
            vec![Tag::new(["party_size", "2"])],
            "window seat please",
            1_729_000_000,
        )
    }

    #[test]
    fn wrap_unwrap_recovers_fields() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let inner = inner_for(&alice);
        let outer = wrap_inner(&CIPHER, &inner, &alice, &bob.public_key_hex()).unwrap();
        assert_eq!(unwrap(&CIPHER, &outer, &bob).unwrap(), inner);
    }

    #[test]
    fn wrap_builds_inner_and_envelope() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let outer = wrap(&CIPHER, &alice, &bob.public_key_hex(), 9901, vec![], "hi").unwrap();
        let inner = unwrap(&CIPHER, &outer, &bob).unwrap();
        assert_eq!(inner.content, "hi");
        assert_eq!(inner.pubkey, alice.public_key_hex());
    }

    #[test]
    fn outer_hides_sender() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let outer = wrap_inner(&CIPHER, &inner_for(&alice), &alice, &bob.public_key_hex()).unwrap();
        assert_eq!(outer.kind, GIFT_WRAP_KIND);
        assert_ne!(outer.pubkey, alice.public_key_hex());
        assert_eq!(tag_value(&outer.tags, "p"), Some(bob.public_key_hex().as_str()));
        assert!(!outer.content.contains("window seat"));
        outer.verify().unwrap();
        let again = wrap_inner(&CIPHER, &inner_for(&alice), &alice, &bob.public_key_hex()).unwrap();
        assert_ne!(outer.pubkey, again.pubkey);
    }

    #[test]
    fn seal_is_signed_by_sender_and_backdated() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let before = unix_now();
        let seal = build_seal(&CIPHER, &inner_for(&alice), &alice, &bob.public_key_hex()).unwrap();
        assert_eq!(seal.kind, SEAL_KIND);
        assert_eq!(seal.pubkey, alice.public_key_hex());
        assert!(seal.tags.is_empty());
        seal.verify().unwrap();
        assert!(seal.created_at <= unix_now());
        assert!(seal.created_at + MAX_TIMESTAMP_JITTER >= before);
    }

    #[test]
    fn wrong_recipient_fails_decryption() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();
        let outer = wrap_inner(&CIPHER, &inner_for(&alice), &alice, &bob.public_key_hex()).unwrap();
        let err = unwrap(&CIPHER, &outer, &carol).unwrap_err();
        assert!(matches!(err, EnvelopeError::DecryptionFailed { stage: "envelope", .. }));
        assert!(err.is_not_mine());
    }

    #[test]
    fn seal_sealed_for_someone_else_fails_decryption() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();
        // Outer layer opens for bob, but the seal inside was sealed for carol.
        let seal = build_seal(&CIPHER, &inner_for(&alice), &alice, &carol.public_key_hex()).unwrap();
        let outer = build_outer(&CIPHER, &seal, &bob.public_key_hex()).unwrap();
        let err = unwrap(&CIPHER, &outer, &bob).unwrap_err();
        assert!(matches!(err, EnvelopeError::DecryptionFailed { stage: "seal", .. }));
        assert!(err.is_not_mine());

        let batch = unwrap_many(&CIPHER, &[outer], &bob);
        assert!(batch.opened.is_empty());
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.suspicious().count(), 0);
    }

    #[test]
    fn seal_with_foreign_inner_is_rejected() {
        let alice = Keys::generate();
        let mallory = Keys::generate();
        let bob = Keys::generate();
        let err = build_seal(&CIPHER, &inner_for(&alice), &mallory, &bob.public_key_hex()).unwrap_err();
        assert!(matches!(err, EnvelopeError::SenderMismatch { .. }));
    }

    #[test]
    fn forged_seal_is_detected_on_unwrap() {
        // Mallory seals a record that claims Alice as author.
        let alice = Keys::generate();
        let mallory = Keys::generate();
        let bob = Keys::generate();
        let inner = inner_for(&alice);
        let plaintext = serde_json::to_string(&inner).unwrap();
        let content = CIPHER.encrypt(&plaintext, &mallory, &bob.public_key_hex()).unwrap();
        let seal = UnsignedEvent::new(mallory.public_key_hex(), 1, SEAL_KIND, vec![], content)
            .sign(&mallory)
            .unwrap();
        let outer = build_outer(&CIPHER, &seal, &bob.public_key_hex()).unwrap();
        let err = unwrap(&CIPHER, &outer, &bob).unwrap_err();
        assert!(matches!(err, EnvelopeError::SenderMismatch { .. }));
    }

    #[test]
    fn non_envelope_kind_is_rejected() {
        let alice = Keys::generate();
        let ev = UnsignedEvent::new(alice.public_key_hex(), 1, 1, vec![], "")
            .sign(&alice)
            .unwrap();
        assert!(matches!(
            unwrap(&CIPHER, &ev, &alice),
            Err(EnvelopeError::UnexpectedKind { expected: GIFT_WRAP_KIND, actual: 1, .. })
        ));
    }

    #[test]
    fn tampered_envelope_fails_signature() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let mut outer = wrap_inner(&CIPHER, &inner_for(&alice), &alice, &bob.public_key_hex()).unwrap();
        outer.tags.push(Tag::new(["t", "extra"]));
        assert!(matches!(unwrap(&CIPHER, &outer, &bob), Err(EnvelopeError::Event(_))));
    }

    #[test]
    fn unwrap_many_skips_foreign_envelopes() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();
        let mine = wrap_inner(&CIPHER, &inner_for(&alice), &alice, &bob.public_key_hex()).unwrap();
        let theirs = wrap_inner(&CIPHER, &inner_for(&alice), &alice, &carol.public_key_hex()).unwrap();
        let batch = unwrap_many(&CIPHER, &[theirs.clone(), mine.clone()], &bob);
        assert_eq!(batch.opened.len(), 1);
        assert_eq!(batch.opened[0].envelope, mine);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].0, theirs.id);
        assert_eq!(batch.suspicious().count(), 0);
        assert_eq!(batch.inner_records(), vec![inner_for(&alice)]);
    }
}
