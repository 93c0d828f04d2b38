//! Private reservation negotiation over public Nostr relays.
//!
//! A requester and a business exchange four kinds of reservation messages.
//! Each message is an unsigned inner record, sealed and gift-wrapped so that
//! relays only ever see a one-time author, a recipient tag and ciphertext.
//! Messages of one negotiation share a thread root and can be folded into a
//! [`negotiation::NegotiationState`].

pub mod cipher;
pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod negotiation;
pub mod pow;
pub mod publisher;
pub mod relay;
pub mod reservation;
pub mod thread;
pub mod time_codec;
