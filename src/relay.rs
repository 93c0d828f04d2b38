//! Relay transport: publishing envelopes and fetching the ones addressed to us.
//!
//! Relays speak NIP-01 over WebSocket: `["EVENT", ev]` is answered with
//! `["OK", id, accepted, message]`, and `["REQ", sub, filter]` streams
//! matching events followed by `["EOSE", sub]`.

use std::{
    collections::HashSet,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures_util::{future::join_all, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use url::Url;

use crate::{
    envelope::{GIFT_WRAP_KIND, MAX_TIMESTAMP_JITTER},
    error::RelayError,
    event::{tag_value, Event},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that accepts signed envelopes for publication.
#[allow(async_fn_in_trait)]
pub trait RelayPublisher {
    async fn publish(&self, event: &Event) -> Result<(), RelayError>;
}

/// In-process relay. Keeps every accepted event in arrival order.
#[derive(Debug, Default)]
pub struct MemoryRelay {
    events: Mutex<Vec<Event>>,
    refuse_for: HashSet<String>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay that rejects envelopes whose `p` tag names `pubkey`.
    pub fn refusing(pubkey: impl Into<String>) -> Self {
        MemoryRelay {
            events: Mutex::default(),
            refuse_for: HashSet::from([pubkey.into()]),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stored envelopes tagged for `pubkey`.
    pub fn addressed_to(&self, pubkey: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| tag_value(&e.tags, "p") == Some(pubkey))
            .collect()
    }
}

impl RelayPublisher for MemoryRelay {
    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        if let Some(p) = tag_value(&event.tags, "p") {
            if self.refuse_for.contains(p) {
                return Err(RelayError::Rejected {
                    relay: "memory".into(),
                    id: event.id.clone(),
                    reason: "blocked: recipient refused".into(),
                });
            }
        }
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if !events.iter().any(|e| e.id == event.id) {
            events.push(event.clone());
        }
        Ok(())
    }
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

type WsStream = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Parse a relay frame into its JSON array.
fn frame(msg: Message) -> Option<Vec<Value>> {
    let Message::Text(txt) = msg else {
        return None;
    };
    match serde_json::from_str(&txt) {
        Ok(Value::Array(arr)) => Some(arr),
        _ => None,
    }
}

/// One relay reached over WebSocket.
#[derive(Debug, Clone)]
pub struct WsRelay {
    pub url: String,
    pub tor_socks: Option<String>,
    pub timeout: Duration,
}

impl WsRelay {
    pub fn new(url: impl Into<String>) -> Self {
        WsRelay {
            url: url.into(),
            tor_socks: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_proxy(mut self, tor_socks: Option<String>) -> Self {
        self.tor_socks = tor_socks;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn connect_error(&self, reason: impl ToString) -> RelayError {
        RelayError::Connect {
            relay: self.url.clone(),
            reason: reason.to_string(),
        }
    }

    async fn connect(&self) -> Result<WsStream, RelayError> {
        connect_ws(&self.url, self.tor_socks.as_deref())
            .await
            .map_err(|e| self.connect_error(format!("{e:#}")))
    }

    async fn send_and_confirm(&self, event: &Event) -> Result<(), RelayError> {
        let mut ws = self.connect().await?;
        let msg = json!(["EVENT", event]);
        ws.send(Message::Text(msg.to_string()))
            .await
            .map_err(|e| self.connect_error(e))?;
        while let Some(msg) = ws.next().await {
            let Some(arr) = frame(msg.map_err(|e| self.connect_error(e))?) else {
                continue;
            };
            match arr.first().and_then(Value::as_str) {
                Some("OK") if arr.get(1).and_then(Value::as_str) == Some(event.id.as_str()) => {
                    let accepted = arr.get(2).and_then(Value::as_bool).unwrap_or(false);
                    let reason = arr.get(3).and_then(Value::as_str).unwrap_or_default();
                    let _ = ws.close(None).await;
                    if accepted {
                        return Ok(());
                    }
                    return Err(RelayError::Rejected {
                        relay: self.url.clone(),
                        id: event.id.clone(),
                        reason: reason.to_string(),
                    });
                }
                Some("NOTICE") => {
                    tracing::debug!(relay = %self.url, notice = ?arr.get(1), "relay notice");
                }
                _ => {}
            }
        }
        Err(self.connect_error("connection closed before OK"))
    }

    /// Run one subscription until end of stored events.
    pub async fn fetch(&self, filter: Value) -> Result<Vec<Event>, RelayError> {
        let work = async {
            let mut ws = self.connect().await?;
            let sub_id = format!("reswire-{:08x}", rand::random::<u32>());
            let req = json!(["REQ", sub_id, filter]);
            ws.send(Message::Text(req.to_string()))
                .await
                .map_err(|e| self.connect_error(e))?;
            let mut events = Vec::new();
            while let Some(msg) = ws.next().await {
                let Some(arr) = frame(msg.map_err(|e| self.connect_error(e))?) else {
                    continue;
                };
                if arr.get(1).and_then(Value::as_str) != Some(sub_id.as_str()) {
                    continue;
                }
                match arr.first().and_then(Value::as_str) {
                    Some("EVENT") => match arr.get(2).cloned().map(serde_json::from_value::<Event>) {
                        Some(Ok(ev)) => events.push(ev),
                        _ => tracing::debug!(relay = %self.url, "skipping unparsable event"),
                    },
                    Some("EOSE") => {
                        let close = json!(["CLOSE", sub_id]);
                        let _ = ws.send(Message::Text(close.to_string())).await;
                        let _ = ws.close(None).await;
                        return Ok(events);
                    }
                    Some("CLOSED") => {
                        return Err(RelayError::Rejected {
                            relay: self.url.clone(),
                            id: sub_id.clone(),
                            reason: arr.get(2).and_then(Value::as_str).unwrap_or_default().into(),
                        })
                    }
                    _ => {}
                }
            }
            Err(self.connect_error("connection closed before EOSE"))
        };
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| RelayError::Timeout {
                relay: self.url.clone(),
            })?
    }

    /// Envelopes tagged for `pubkey`. `since` is widened by the timestamp
    /// jitter applied when wrapping.
    pub async fn fetch_envelopes(
        &self,
        pubkey: &str,
        since: Option<u64>,
    ) -> Result<Vec<Event>, RelayError> {
        self.fetch(envelope_filter(pubkey, since)).await
    }
}

impl RelayPublisher for WsRelay {
    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        let result = tokio::time::timeout(self.timeout, self.send_and_confirm(event))
            .await
            .map_err(|_| RelayError::Timeout {
                relay: self.url.clone(),
            })?;
        match &result {
            Ok(()) => tracing::debug!(relay = %self.url, id = %event.id, "published"),
            Err(e) => tracing::warn!(relay = %self.url, id = %event.id, error = %e, "publish failed"),
        }
        result
    }
}

/// REQ filter for gift-wrapped envelopes addressed to `pubkey`.
pub fn envelope_filter(pubkey: &str, since: Option<u64>) -> Value {
    let mut filter = json!({ "kinds": [GIFT_WRAP_KIND], "#p": [pubkey] });
    if let Some(since) = since {
        filter["since"] = json!(since.saturating_sub(MAX_TIMESTAMP_JITTER));
    }
    filter
}

/// Every configured relay, used together.
#[derive(Debug, Clone, Default)]
pub struct RelayPool {
    pub relays: Vec<WsRelay>,
}

impl RelayPool {
    pub fn new(urls: &[String], tor_socks: Option<&str>, timeout: Duration) -> Self {
        RelayPool {
            relays: urls
                .iter()
                .map(|u| {
                    WsRelay::new(u.clone())
                        .with_proxy(tor_socks.map(str::to_string))
                        .with_timeout(timeout)
                })
                .collect(),
        }
    }

    /// Fetch envelopes for `pubkey` from every relay, merged by id.
    pub async fn fetch_envelopes(
        &self,
        pubkey: &str,
        since: Option<u64>,
    ) -> Result<Vec<Event>, RelayError> {
        if self.relays.is_empty() {
            return Err(RelayError::NoRelays);
        }
        let results = join_all(self.relays.iter().map(|r| r.fetch_envelopes(pubkey, since))).await;
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        let mut errors = Vec::new();
        let mut any_ok = false;
        for (relay, result) in self.relays.iter().zip(results) {
            match result {
                Ok(batch) => {
                    any_ok = true;
                    events.extend(batch.into_iter().filter(|e| seen.insert(e.id.clone())));
                }
                Err(e) => {
                    tracing::warn!(relay = %relay.url, error = %e, "fetch failed");
                    errors.push(e);
                }
            }
        }
        if any_ok {
            Ok(events)
        } else {
            Err(RelayError::AllFailed(errors))
        }
    }
}

impl RelayPublisher for RelayPool {
    /// Succeeds when at least one relay accepts the event.
    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        if self.relays.is_empty() {
            return Err(RelayError::NoRelays);
        }
        let results = join_all(self.relays.iter().map(|r| r.publish(event))).await;
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        if accepted > 0 {
            tracing::info!(id = %event.id, accepted, total = self.relays.len(), "envelope published");
            return Ok(());
        }
        Err(RelayError::AllFailed(
            results.into_iter().filter_map(Result::err).collect(),
        ))
    }
}
