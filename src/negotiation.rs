//! Inbound side: opened envelopes decoded into reservation messages and
//! folded into per-negotiation threads.

use std::collections::HashSet;

use crate::{
    cipher::Cipher,
    envelope::{self, Opened},
    error::ProtocolError,
    event::{Event, Keys, Record, Tag, UnsignedEvent},
    reservation::{self, ReservationKind, ReservationPayload, ResponseStatus},
    thread::{group_by_thread, sort_thread},
};

/// One decoded reservation message together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationMessage {
    pub inner: UnsignedEvent,
    pub kind: ReservationKind,
    pub payload: ReservationPayload,
    /// Author of the inner record, as proven by the seal signature.
    pub sender: String,
    pub envelope: Event,
}

impl ReservationMessage {
    /// Decode an opened envelope. Records of other kinds give
    /// [`ProtocolError::UnexpectedKind`].
    pub fn from_opened(opened: Opened) -> Result<Self, ProtocolError> {
        let payload = reservation::parse_any(&opened.inner)?;
        Ok(ReservationMessage {
            kind: payload.kind(),
            sender: opened.inner.pubkey.clone(),
            inner: opened.inner,
            payload,
            envelope: opened.envelope,
        })
    }
}

impl Record for ReservationMessage {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn pubkey(&self) -> &str {
        &self.inner.pubkey
    }

    fn kind(&self) -> u32 {
        self.inner.kind
    }

    fn created_at(&self) -> u64 {
        self.inner.created_at
    }

    fn tags(&self) -> &[Tag] {
        &self.inner.tags
    }

    fn content(&self) -> &str {
        &self.inner.content
    }
}

/// Unwrap `outers` with `keys` and decode every reservation message found.
///
/// Envelopes for other keys and inner records of other kinds are skipped;
/// records that claim a reservation kind but fail validation are logged and
/// dropped.
pub fn open_messages<C: Cipher>(cipher: &C, outers: &[Event], keys: &Keys) -> Vec<ReservationMessage> {
    let batch = envelope::unwrap_many(cipher, outers, keys);
    let mut messages = Vec::with_capacity(batch.opened.len());
    for opened in batch.opened {
        if ReservationKind::from_kind(opened.inner.kind).is_none() {
            tracing::debug!(id = %opened.inner.id, kind = opened.inner.kind, "ignoring non-reservation record");
            continue;
        }
        let id = opened.inner.id.clone();
        match ReservationMessage::from_opened(opened) {
            Ok(message) => messages.push(message),
            Err(e) => tracing::warn!(%id, error = %e, "dropping invalid reservation record"),
        }
    }
    messages
}

/// Derived position of a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Start,
    Requested,
    Confirmed,
    Declined,
    Cancelled,
    ModificationRequested,
    ModificationConfirmed,
    ModificationDeclined,
}

impl NegotiationState {
    /// Apply one message. A request only opens a negotiation; any later copy
    /// of it leaves the state alone.
    pub fn apply(self, payload: &ReservationPayload) -> Self {
        match payload {
            ReservationPayload::Request(_) => match self {
                NegotiationState::Start => NegotiationState::Requested,
                other => other,
            },
            ReservationPayload::Response(r) => match r.status {
                ResponseStatus::Confirmed => NegotiationState::Confirmed,
                ResponseStatus::Declined => NegotiationState::Declined,
                ResponseStatus::Cancelled => NegotiationState::Cancelled,
            },
            ReservationPayload::ModificationRequest(_) => NegotiationState::ModificationRequested,
            ReservationPayload::ModificationResponse(r) => match r.status {
                ResponseStatus::Confirmed => NegotiationState::ModificationConfirmed,
                _ => NegotiationState::ModificationDeclined,
            },
        }
    }

    /// Fold a thread sorted by creation time.
    pub fn fold<'a>(payloads: impl IntoIterator<Item = &'a ReservationPayload>) -> Self {
        payloads
            .into_iter()
            .fold(NegotiationState::Start, NegotiationState::apply)
    }

    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            NegotiationState::Start
                | NegotiationState::Requested
                | NegotiationState::ModificationRequested
        )
    }
}

/// All messages of one negotiation, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationThread {
    /// Inner id of the opening request.
    pub root: String,
    pub messages: Vec<ReservationMessage>,
}

impl ConversationThread {
    pub fn state(&self) -> NegotiationState {
        NegotiationState::fold(self.messages.iter().map(|m| &m.payload))
    }

    /// The opening request, if it has been seen.
    pub fn request(&self) -> Option<&ReservationMessage> {
        self.messages.iter().find(|m| m.inner.id == self.root)
    }

    pub fn latest(&self) -> Option<&ReservationMessage> {
        self.messages.last()
    }
}

/// Group messages into threads, dropping repeated inner ids.
///
/// The same inner record shows up twice when both the self-addressed copy
/// and the recipient copy can be opened; only the first is kept.
pub fn build_threads(messages: Vec<ReservationMessage>) -> Vec<ConversationThread> {
    let mut seen = HashSet::new();
    let unique: Vec<_> = messages
        .into_iter()
        .filter(|m| seen.insert(m.inner.id.clone()))
        .collect();
    let mut threads: Vec<_> = group_by_thread(&unique)
        .into_iter()
        .map(|(root, messages)| ConversationThread {
            root,
            messages: sort_thread(messages),
        })
        .collect();
    threads.sort_by_key(|t| t.latest().map(|m| m.inner.created_at));
    threads.reverse();
    threads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cipher::ConversationCipher,
        envelope::wrap_inner,
        reservation::{BuildContext, ReservationRequest, ReservationResponse},
        thread::EventRef,
    };

    const CIPHER: ConversationCipher = ConversationCipher;

    fn alice() -> Keys {
        Keys::from_secret_hex(&"0a".repeat(32)).unwrap()
    }

    fn bistro() -> Keys {
        Keys::from_secret_hex(&"0b".repeat(32)).unwrap()
    }

    fn request() -> ReservationRequest {
        ReservationRequest {
            party_size: 2,
            time: 1729468800,
            tzid: "Europe/Paris".into(),
            ..Default::default()
        }
    }

    fn response(status: ResponseStatus) -> ReservationResponse {
        ReservationResponse {
            status,
            time: Some(1729468800),
            tzid: Some("Europe/Paris".into()),
            duration: None,
            message: None,
        }
    }

    fn request_inner(at: u64) -> UnsignedEvent {
        reservation::build_request(
            &request(),
            &alice(),
            &bistro().public_key_hex(),
            &BuildContext::new().at(at),
        )
        .unwrap()
    }

    fn response_inner(root: &str, status: ResponseStatus, at: u64) -> UnsignedEvent {
        reservation::build_response(
            &response(status),
            &bistro(),
            &alice().public_key_hex(),
            &BuildContext::new().with_root(EventRef::new(root)).at(at),
        )
        .unwrap()
    }

    #[test]
    fn open_keeps_only_reservation_messages() {
        let req = request_inner(100);
        let to_bistro = wrap_inner(&CIPHER, &req, &alice(), &bistro().public_key_hex()).unwrap();
        let to_self = wrap_inner(&CIPHER, &req, &alice(), &alice().public_key_hex()).unwrap();
        let note = envelope::wrap(&CIPHER, &alice(), &bistro().public_key_hex(), 14, vec![], "hi").unwrap();

        let opened = open_messages(&CIPHER, &[to_bistro.clone(), to_self, note], &bistro());
        assert_eq!(opened.len(), 1);
        let msg = &opened[0];
        assert_eq!(msg.inner.id, req.id);
        assert_eq!(msg.kind, ReservationKind::Request);
        assert_eq!(msg.sender, alice().public_key_hex());
        assert_eq!(msg.envelope.id, to_bistro.id);
        assert_eq!(msg.payload, ReservationPayload::Request(request()));
    }

    #[test]
    fn invalid_reservation_records_are_dropped() {
        let bogus = UnsignedEvent::new(alice().public_key_hex(), 1, 9901, vec![], "");
        let outer = wrap_inner(&CIPHER, &bogus, &alice(), &bistro().public_key_hex()).unwrap();
        assert!(open_messages(&CIPHER, &[outer], &bistro()).is_empty());
    }

    #[test]
    fn threads_deduplicate_and_sort() {
        let req = request_inner(100);
        let resp = response_inner(&req.id, ResponseStatus::Confirmed, 200);
        let other = request_inner(50);

        // Alice sees her own request through the self copy and the reply.
        let outers = vec![
            wrap_inner(&CIPHER, &resp, &bistro(), &alice().public_key_hex()).unwrap(),
            wrap_inner(&CIPHER, &req, &alice(), &alice().public_key_hex()).unwrap(),
            wrap_inner(&CIPHER, &req, &alice(), &alice().public_key_hex()).unwrap(),
            wrap_inner(&CIPHER, &other, &alice(), &alice().public_key_hex()).unwrap(),
        ];
        let threads = build_threads(open_messages(&CIPHER, &outers, &alice()));
        assert_eq!(threads.len(), 2);

        let main = &threads[0];
        assert_eq!(main.root, req.id);
        let ids: Vec<_> = main.messages.iter().map(|m| m.inner.id.as_str()).collect();
        assert_eq!(ids, vec![req.id.as_str(), resp.id.as_str()]);
        assert_eq!(main.request().map(|m| m.inner.id.as_str()), Some(req.id.as_str()));
        assert_eq!(main.state(), NegotiationState::Confirmed);

        assert_eq!(threads[1].root, other.id);
        assert_eq!(threads[1].state(), NegotiationState::Requested);
    }

    #[test]
    fn state_machine_walk() {
        let req = ReservationPayload::Request(request());
        let confirmed = ReservationPayload::Response(response(ResponseStatus::Confirmed));
        let modify = ReservationPayload::ModificationRequest(request());
        let mod_ok = ReservationPayload::ModificationResponse(response(ResponseStatus::Confirmed));
        let mod_no = ReservationPayload::ModificationResponse(ReservationResponse::new(ResponseStatus::Declined));

        assert_eq!(NegotiationState::fold([]), NegotiationState::Start);
        assert_eq!(NegotiationState::fold([&req]), NegotiationState::Requested);
        assert_eq!(NegotiationState::fold([&req, &confirmed]), NegotiationState::Confirmed);
        assert_eq!(
            NegotiationState::fold([&req, &confirmed, &modify]),
            NegotiationState::ModificationRequested
        );
        assert_eq!(
            NegotiationState::fold([&req, &confirmed, &modify, &mod_ok]),
            NegotiationState::ModificationConfirmed
        );
        assert_eq!(
            NegotiationState::fold([&req, &confirmed, &modify, &mod_no]),
            NegotiationState::ModificationDeclined
        );
        // A repeated request does not reopen a settled negotiation.
        assert_eq!(NegotiationState::fold([&req, &confirmed, &req]), NegotiationState::Confirmed);
    }

    #[test]
    fn terminal_states() {
        use NegotiationState::*;
        for s in [Confirmed, Declined, Cancelled, ModificationConfirmed, ModificationDeclined] {
            assert!(s.is_terminal(), "{s:?}");
        }
        for s in [Start, Requested, ModificationRequested] {
            assert!(!s.is_terminal(), "{s:?}");
        }
    }
}
