//! Outbound side: build a reservation record once, wrap it for the recipient
//! and for the sender, and publish both envelopes.

use crate::{
    cipher::{Cipher, ConversationCipher},
    envelope::wrap_inner,
    error::{PublishError, RelayError},
    event::{Event, Keys, UnsignedEvent},
    relay::RelayPublisher,
    reservation::{self, BuildContext, ReservationPayload},
};

/// Outcome of a dual publish. The two envelopes succeed or fail
/// independently.
#[derive(Debug)]
pub struct Delivery {
    /// Shared inner id; later messages use it as their thread root.
    pub inner_id: String,
    pub inner: UnsignedEvent,
    pub recipient_envelope: Event,
    pub self_envelope: Event,
    pub to_recipient: Result<(), RelayError>,
    pub to_self: Result<(), RelayError>,
}

impl Delivery {
    pub fn is_complete(&self) -> bool {
        self.to_recipient.is_ok() && self.to_self.is_ok()
    }

    /// Turn any failed half into [`PublishError::Partial`].
    pub fn into_result(self) -> Result<Delivery, PublishError> {
        if self.is_complete() {
            return Ok(self);
        }
        Err(PublishError::Partial {
            inner_id: self.inner_id,
            to_recipient: self.to_recipient.err(),
            to_self: self.to_self.err(),
        })
    }
}

pub struct NegotiationPublisher<R, C = ConversationCipher> {
    relay: R,
    cipher: C,
}

impl<R: RelayPublisher> NegotiationPublisher<R> {
    pub fn new(relay: R) -> Self {
        NegotiationPublisher {
            relay,
            cipher: ConversationCipher,
        }
    }
}

impl<R: RelayPublisher, C: Cipher> NegotiationPublisher<R, C> {
    pub fn with_cipher(relay: R, cipher: C) -> Self {
        NegotiationPublisher { relay, cipher }
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    /// Build `payload` as `sender`, then publish one envelope to `recipient`
    /// and one to the sender's own key.
    ///
    /// Validation and wrapping errors abort before anything is published.
    /// Relay outcomes are reported per envelope in the returned [`Delivery`].
    pub async fn send_to_recipient_and_self(
        &self,
        payload: &ReservationPayload,
        sender: &Keys,
        recipient: &str,
        ctx: BuildContext,
    ) -> Result<Delivery, PublishError> {
        let inner = build_inner(payload, sender, recipient, ctx).await?;
        let self_pubkey = sender.public_key_hex();
        let recipient_envelope = wrap_inner(&self.cipher, &inner, sender, recipient)?;
        let self_envelope = wrap_inner(&self.cipher, &inner, sender, &self_pubkey)?;

        let (to_recipient, to_self) = tokio::join!(
            self.relay.publish(&recipient_envelope),
            self.relay.publish(&self_envelope)
        );
        tracing::info!(
            inner = %inner.id,
            kind = inner.kind,
            recipient_ok = to_recipient.is_ok(),
            self_ok = to_self.is_ok(),
            "reservation message sent"
        );
        Ok(Delivery {
            inner_id: inner.id.clone(),
            inner,
            recipient_envelope,
            self_envelope,
            to_recipient,
            to_self,
        })
    }
}

/// Build the inner record, moving to the blocking pool when it has to be
/// mined.
async fn build_inner(
    payload: &ReservationPayload,
    sender: &Keys,
    recipient: &str,
    ctx: BuildContext,
) -> Result<UnsignedEvent, PublishError> {
    if ctx.pow.is_none() {
        return Ok(reservation::build(payload, sender, recipient, &ctx)?);
    }
    let payload = payload.clone();
    let sender = *sender;
    let recipient = recipient.to_string();
    let inner = tokio::task::spawn_blocking(move || {
        reservation::build(&payload, &sender, &recipient, &ctx)
    })
    .await
    .map_err(|e| PublishError::Worker(e.to_string()))??;
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::unwrap,
        error::ProtocolError,
        event::tag_value,
        pow::{self, MineOptions},
        relay::MemoryRelay,
        reservation::{ReservationKind, ReservationRequest},
    };

    fn alice() -> Keys {
        Keys::from_secret_hex(&"1a".repeat(32)).unwrap()
    }

    fn bistro() -> Keys {
        Keys::from_secret_hex(&"1b".repeat(32)).unwrap()
    }

    fn request() -> ReservationPayload {
        ReservationPayload::Request(ReservationRequest {
            party_size: 3,
            time: 1729468800,
            tzid: "America/New_York".into(),
            message: Some("window seat please".into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn both_copies_share_the_inner_record() {
        let publisher = NegotiationPublisher::new(MemoryRelay::new());
        let delivery = publisher
            .send_to_recipient_and_self(&request(), &alice(), &bistro().public_key_hex(), BuildContext::new())
            .await
            .unwrap()
            .into_result()
            .unwrap();

        let relay = publisher.relay();
        let to_bistro = relay.addressed_to(&bistro().public_key_hex());
        let to_alice = relay.addressed_to(&alice().public_key_hex());
        assert_eq!(to_bistro.len(), 1);
        assert_eq!(to_alice.len(), 1);

        let seen_by_bistro = unwrap(&ConversationCipher, &to_bistro[0], &bistro()).unwrap();
        let seen_by_alice = unwrap(&ConversationCipher, &to_alice[0], &alice()).unwrap();
        assert_eq!(seen_by_bistro.id, delivery.inner_id);
        assert_eq!(seen_by_alice, seen_by_bistro);
        assert_eq!(seen_by_alice.pubkey, alice().public_key_hex());

        assert_ne!(to_bistro[0].pubkey, to_alice[0].pubkey);
        assert_ne!(to_bistro[0].pubkey, alice().public_key_hex());
        assert_eq!(
            tag_value(&delivery.self_envelope.tags, "p"),
            Some(alice().public_key_hex().as_str())
        );
    }

    #[tokio::test]
    async fn partial_delivery_is_reported() {
        let bistro_pk = bistro().public_key_hex();
        let publisher = NegotiationPublisher::new(MemoryRelay::refusing(bistro_pk.clone()));
        let delivery = publisher
            .send_to_recipient_and_self(&request(), &alice(), &bistro_pk, BuildContext::new())
            .await
            .unwrap();
        assert!(!delivery.is_complete());
        assert!(delivery.to_self.is_ok());
        assert_eq!(publisher.relay().events().len(), 1);

        let inner_id = delivery.inner_id.clone();
        match delivery.into_result() {
            Err(PublishError::Partial {
                inner_id: id,
                to_recipient: Some(RelayError::Rejected { .. }),
                to_self: None,
            }) => assert_eq!(id, inner_id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_payload_publishes_nothing() {
        let publisher = NegotiationPublisher::new(MemoryRelay::new());
        let modify = ReservationPayload::ModificationRequest(match request() {
            ReservationPayload::Request(r) => r,
            _ => unreachable!(),
        });
        let err = publisher
            .send_to_recipient_and_self(&modify, &alice(), &bistro().public_key_hex(), BuildContext::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PublishError::Protocol(ProtocolError::MissingThreadRoot(
                ReservationKind::ModificationRequest
            ))
        );
        assert!(publisher.relay().events().is_empty());
    }

    #[tokio::test]
    async fn mining_runs_before_wrapping() {
        let publisher = NegotiationPublisher::new(MemoryRelay::new());
        let ctx = BuildContext::new().with_pow(MineOptions::new(6, 200_000));
        let delivery = publisher
            .send_to_recipient_and_self(&request(), &alice(), &bistro().public_key_hex(), ctx)
            .await
            .unwrap();
        assert!(pow::validate(&delivery.inner));
        let opened = unwrap(&ConversationCipher, &delivery.recipient_envelope, &bistro()).unwrap();
        assert_eq!(opened.id, delivery.inner_id);
    }
}
