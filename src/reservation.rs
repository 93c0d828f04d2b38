//! Reservation negotiation messages.
//!
//! Four kinds travel inside privacy envelopes:
//!
//! | kind | message                   | thread root |
//! |------|---------------------------|-------------|
//! | 9901 | reservation request       | none        |
//! | 9902 | reservation response      | required    |
//! | 9903 | modification request      | required    |
//! | 9904 | modification response     | required    |
//!
//! Structured fields are carried as `[name, value]` tags; the free-text
//! message is the record content. The root marker always points at the inner
//! id of the original request, never at an envelope id.

use std::{fmt, str::FromStr};

use url::Url;

use crate::{
    error::ProtocolError,
    event::{parse_public_key, tag_value, unix_now, Keys, Tag, UnsignedEvent},
    pow::{self, MineOptions},
    thread::{attach_markers, read_marker_tags, EventRef},
    time_codec,
};

pub const RESERVATION_REQUEST_KIND: u32 = 9901;
pub const RESERVATION_RESPONSE_KIND: u32 = 9902;
pub const MODIFICATION_REQUEST_KIND: u32 = 9903;
pub const MODIFICATION_RESPONSE_KIND: u32 = 9904;
/// Handler-information records advertise which of the kinds above a business
/// accepts.
pub const HANDLER_INFO_KIND: u32 = 31990;

pub const MIN_PARTY_SIZE: u8 = 1;
pub const MAX_PARTY_SIZE: u8 = 20;
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// The closed set of reservation message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationKind {
    Request,
    Response,
    ModificationRequest,
    ModificationResponse,
}

impl ReservationKind {
    pub const ALL: [ReservationKind; 4] = [
        ReservationKind::Request,
        ReservationKind::Response,
        ReservationKind::ModificationRequest,
        ReservationKind::ModificationResponse,
    ];

    /// Record kind number.
    pub fn kind(self) -> u32 {
        match self {
            ReservationKind::Request => RESERVATION_REQUEST_KIND,
            ReservationKind::Response => RESERVATION_RESPONSE_KIND,
            ReservationKind::ModificationRequest => MODIFICATION_REQUEST_KIND,
            ReservationKind::ModificationResponse => MODIFICATION_RESPONSE_KIND,
        }
    }

    pub fn from_kind(kind: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.kind() == kind)
    }

    /// Everything but the opening request must name its thread root.
    pub fn requires_root(self) -> bool {
        !matches!(self, ReservationKind::Request)
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            ReservationKind::Response | ReservationKind::ModificationResponse
        )
    }

    /// Statuses a response of this kind may carry.
    pub fn allowed_statuses(self) -> &'static [ResponseStatus] {
        match self {
            ReservationKind::Response => &[
                ResponseStatus::Confirmed,
                ResponseStatus::Declined,
                ResponseStatus::Cancelled,
            ],
            ReservationKind::ModificationResponse => {
                &[ResponseStatus::Confirmed, ResponseStatus::Declined]
            }
            _ => &[],
        }
    }
}

impl fmt::Display for ReservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReservationKind::Request => "reservation request",
            ReservationKind::Response => "reservation response",
            ReservationKind::ModificationRequest => "modification request",
            ReservationKind::ModificationResponse => "modification response",
        };
        write!(f, "{name} ({})", self.kind())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Confirmed,
    Declined,
    Cancelled,
}

impl ResponseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::Confirmed => "confirmed",
            ResponseStatus::Declined => "declined",
            ResponseStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(ResponseStatus::Confirmed),
            "declined" => Ok(ResponseStatus::Declined),
            "cancelled" => Ok(ResponseStatus::Cancelled),
            other => Err(other.to_string()),
        }
    }
}

/// Body of a reservation request or modification request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationRequest {
    pub party_size: u8,
    /// Requested start, Unix seconds.
    pub time: i64,
    /// IANA zone the requester means `time` in.
    pub tzid: String,
    pub name: Option<String>,
    /// `tel:` URI.
    pub telephone: Option<String>,
    /// `mailto:` URI.
    pub email: Option<String>,
    /// Seconds.
    pub duration: Option<u64>,
    pub earliest_time: Option<i64>,
    pub latest_time: Option<i64>,
    pub message: Option<String>,
}

/// Body of a reservation response or modification response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationResponse {
    pub status: ResponseStatus,
    pub time: Option<i64>,
    pub tzid: Option<String>,
    pub duration: Option<u64>,
    pub message: Option<String>,
}

impl ReservationResponse {
    pub fn new(status: ResponseStatus) -> Self {
        ReservationResponse {
            status,
            time: None,
            tzid: None,
            duration: None,
            message: None,
        }
    }
}

/// A decoded reservation message, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationPayload {
    Request(ReservationRequest),
    Response(ReservationResponse),
    ModificationRequest(ReservationRequest),
    ModificationResponse(ReservationResponse),
}

impl ReservationPayload {
    pub fn kind(&self) -> ReservationKind {
        match self {
            ReservationPayload::Request(_) => ReservationKind::Request,
            ReservationPayload::Response(_) => ReservationKind::Response,
            ReservationPayload::ModificationRequest(_) => ReservationKind::ModificationRequest,
            ReservationPayload::ModificationResponse(_) => ReservationKind::ModificationResponse,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ReservationPayload::Request(r) | ReservationPayload::ModificationRequest(r) => {
                r.message.as_deref()
            }
            ReservationPayload::Response(r) | ReservationPayload::ModificationResponse(r) => {
                r.message.as_deref()
            }
        }
    }

    /// Status carried by response kinds.
    pub fn status(&self) -> Option<ResponseStatus> {
        match self {
            ReservationPayload::Response(r) | ReservationPayload::ModificationResponse(r) => {
                Some(r.status)
            }
            _ => None,
        }
    }
}

/// Per-message build options.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Defaults to now.
    pub created_at: Option<u64>,
    /// Inner id of the original request.
    pub root: Option<EventRef>,
    pub reply: Option<EventRef>,
    /// Appended after the reservation and thread tags.
    pub extra_tags: Vec<Tag>,
    /// Mine the inner record to this difficulty before returning it.
    pub pow: Option<MineOptions>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, root: EventRef) -> Self {
        self.root = Some(root);
        self
    }

    pub fn with_reply(mut self, reply: EventRef) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_pow(mut self, opts: MineOptions) -> Self {
        self.pow = Some(opts);
        self
    }

    pub fn with_extra_tags(mut self, tags: Vec<Tag>) -> Self {
        self.extra_tags = tags;
        self
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidField {
        field,
        reason: reason.into(),
    }
}

/// A `scheme:` URI, returning its opaque path.
fn uri_path(field: &'static str, uri: &str, scheme: &str) -> Result<String, ProtocolError> {
    let url = Url::parse(uri).map_err(|e| invalid(field, format!("{uri:?} is not a URI: {e}")))?;
    if url.scheme() != scheme {
        return Err(invalid(field, format!("must be a {scheme}: URI")));
    }
    Ok(url.path().to_string())
}

fn validate_tel(uri: &str) -> Result<(), ProtocolError> {
    let number = uri_path("telephone", uri, "tel")?;
    let number = number.as_str();
    let digits = number.strip_prefix('+').unwrap_or(number);
    if !digits.chars().any(|c| c.is_ascii_digit()) {
        return Err(invalid("telephone", "must contain digits"));
    }
    if !digits
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '-' | '.' | '(' | ')' | ' '))
    {
        return Err(invalid("telephone", format!("unexpected characters in {uri:?}")));
    }
    Ok(())
}

fn validate_mailto(uri: &str) -> Result<(), ProtocolError> {
    let address = uri_path("email", uri, "mailto")?;
    let Some((local, domain)) = address.split_once('@') else {
        return Err(invalid("email", "missing @"));
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(invalid("email", format!("malformed address {address:?}")));
    }
    if address.chars().any(char::is_whitespace) {
        return Err(invalid("email", "must not contain whitespace"));
    }
    Ok(())
}

fn validate_message(message: Option<&str>) -> Result<(), ProtocolError> {
    if let Some(m) = message {
        if m.is_empty() {
            return Err(invalid("message", "leave it out instead of sending it empty"));
        }
        let len = m.chars().count();
        if len > MAX_MESSAGE_CHARS {
            return Err(invalid(
                "message",
                format!("{len} characters exceeds the {MAX_MESSAGE_CHARS} limit"),
            ));
        }
    }
    Ok(())
}

fn validate_duration(duration: Option<u64>) -> Result<(), ProtocolError> {
    if duration == Some(0) {
        return Err(invalid("duration", "must be positive"));
    }
    Ok(())
}

/// Check a request or modification request body.
pub fn validate_request(req: &ReservationRequest) -> Result<(), ProtocolError> {
    if !(MIN_PARTY_SIZE..=MAX_PARTY_SIZE).contains(&req.party_size) {
        return Err(invalid(
            "party_size",
            format!(
                "{} is outside {MIN_PARTY_SIZE}..={MAX_PARTY_SIZE}",
                req.party_size
            ),
        ));
    }
    if req.tzid.trim().is_empty() {
        return Err(invalid("tzid", "must not be empty"));
    }
    if let Some(name) = &req.name {
        if name.trim().is_empty() {
            return Err(invalid("name", "must not be blank"));
        }
    }
    if let Some(tel) = &req.telephone {
        validate_tel(tel)?;
    }
    if let Some(email) = &req.email {
        validate_mailto(email)?;
    }
    validate_duration(req.duration)?;
    if let (Some(earliest), Some(latest)) = (req.earliest_time, req.latest_time) {
        if earliest > latest {
            return Err(invalid("earliest_time", "must not be after latest_time"));
        }
    }
    validate_message(req.message.as_deref())
}

/// Check a response body against the statuses `kind` allows.
pub fn validate_response(
    resp: &ReservationResponse,
    kind: ReservationKind,
) -> Result<(), ProtocolError> {
    if !kind.allowed_statuses().contains(&resp.status) {
        return Err(ProtocolError::InvalidStatus {
            status: resp.status.to_string(),
            kind,
        });
    }
    if let Some(tzid) = &resp.tzid {
        if tzid.trim().is_empty() {
            return Err(invalid("tzid", "must not be empty"));
        }
    }
    if resp.status == ResponseStatus::Confirmed && (resp.time.is_none() || resp.tzid.is_none()) {
        return Err(ProtocolError::ConfirmedRequiresTime);
    }
    if resp.time.is_some() && resp.tzid.is_none() {
        return Err(invalid("tzid", "required when time is set"));
    }
    validate_duration(resp.duration)?;
    validate_message(resp.message.as_deref())
}

fn request_tags(recipient: &str, req: &ReservationRequest) -> Vec<Tag> {
    let mut tags = vec![
        Tag::new(["p", recipient]),
        Tag::new(["party_size".to_string(), req.party_size.to_string()]),
        Tag::new(["time".to_string(), req.time.to_string()]),
        Tag::new(["tzid", req.tzid.as_str()]),
    ];
    if let Some(name) = &req.name {
        tags.push(Tag::new(["name", name.as_str()]));
    }
    if let Some(tel) = &req.telephone {
        tags.push(Tag::new(["telephone", tel.as_str()]));
    }
    if let Some(email) = &req.email {
        tags.push(Tag::new(["email", email.as_str()]));
    }
    if let Some(d) = req.duration {
        tags.push(Tag::new(["duration".to_string(), d.to_string()]));
    }
    if let Some(t) = req.earliest_time {
        tags.push(Tag::new(["earliest_time".to_string(), t.to_string()]));
    }
    if let Some(t) = req.latest_time {
        tags.push(Tag::new(["latest_time".to_string(), t.to_string()]));
    }
    tags
}

fn response_tags(recipient: &str, resp: &ReservationResponse) -> Vec<Tag> {
    let mut tags = vec![
        Tag::new(["p", recipient]),
        Tag::new(["status", resp.status.as_str()]),
    ];
    if let Some(t) = resp.time {
        tags.push(Tag::new(["time".to_string(), t.to_string()]));
    }
    if let Some(tzid) = &resp.tzid {
        tags.push(Tag::new(["tzid", tzid.as_str()]));
    }
    if let Some(d) = resp.duration {
        tags.push(Tag::new(["duration".to_string(), d.to_string()]));
    }
    tags
}

/// Attach markers and extra tags, build the record, mine it if asked, and
/// re-check the finished record.
fn finish(
    kind: ReservationKind,
    sender: &Keys,
    tags: Vec<Tag>,
    message: Option<&str>,
    ctx: &BuildContext,
) -> Result<UnsignedEvent, ProtocolError> {
    let mut tags = attach_markers(tags, ctx.root.as_ref(), ctx.reply.as_ref())?;
    tags.extend(ctx.extra_tags.iter().cloned());
    if kind.requires_root() && read_marker_tags(&tags).root.is_none() {
        return Err(ProtocolError::MissingThreadRoot(kind));
    }
    let created_at = ctx.created_at.unwrap_or_else(unix_now);
    let mut inner = UnsignedEvent::new(
        sender.public_key_hex(),
        created_at,
        kind.kind(),
        tags,
        message.unwrap_or_default(),
    );
    if let Some(opts) = &ctx.pow {
        inner = pow::mine(inner, opts, None)?.event;
    }
    parse(kind, &inner)?;
    tracing::debug!(kind = kind.kind(), id = %inner.id, "built reservation record");
    Ok(inner)
}

fn check_recipient(recipient: &str) -> Result<(), ProtocolError> {
    parse_public_key(recipient)
        .map(|_| ())
        .map_err(|e| invalid("recipient", e.to_string()))
}

fn build_request_kind(
    kind: ReservationKind,
    req: &ReservationRequest,
    sender: &Keys,
    recipient: &str,
    ctx: &BuildContext,
) -> Result<UnsignedEvent, ProtocolError> {
    validate_request(req)?;
    check_recipient(recipient)?;
    finish(kind, sender, request_tags(recipient, req), req.message.as_deref(), ctx)
}

fn build_response_kind(
    kind: ReservationKind,
    resp: &ReservationResponse,
    sender: &Keys,
    recipient: &str,
    ctx: &BuildContext,
) -> Result<UnsignedEvent, ProtocolError> {
    validate_response(resp, kind)?;
    check_recipient(recipient)?;
    finish(kind, sender, response_tags(recipient, resp), resp.message.as_deref(), ctx)
}

/// Build the inner record of a new reservation request.
pub fn build_request(
    req: &ReservationRequest,
    sender: &Keys,
    recipient: &str,
    ctx: &BuildContext,
) -> Result<UnsignedEvent, ProtocolError> {
    build_request_kind(ReservationKind::Request, req, sender, recipient, ctx)
}

/// Build a modification request. `ctx.root` must name the original request.
pub fn build_modification_request(
    req: &ReservationRequest,
    sender: &Keys,
    recipient: &str,
    ctx: &BuildContext,
) -> Result<UnsignedEvent, ProtocolError> {
    build_request_kind(ReservationKind::ModificationRequest, req, sender, recipient, ctx)
}

/// Build a response to a request. `ctx.root` must name the original request.
pub fn build_response(
    resp: &ReservationResponse,
    sender: &Keys,
    recipient: &str,
    ctx: &BuildContext,
) -> Result<UnsignedEvent, ProtocolError> {
    build_response_kind(ReservationKind::Response, resp, sender, recipient, ctx)
}

/// Build a response to a modification request.
pub fn build_modification_response(
    resp: &ReservationResponse,
    sender: &Keys,
    recipient: &str,
    ctx: &BuildContext,
) -> Result<UnsignedEvent, ProtocolError> {
    build_response_kind(ReservationKind::ModificationResponse, resp, sender, recipient, ctx)
}

/// Build whichever kind `payload` is.
pub fn build(
    payload: &ReservationPayload,
    sender: &Keys,
    recipient: &str,
    ctx: &BuildContext,
) -> Result<UnsignedEvent, ProtocolError> {
    match payload {
        ReservationPayload::Request(r) => build_request(r, sender, recipient, ctx),
        ReservationPayload::Response(r) => build_response(r, sender, recipient, ctx),
        ReservationPayload::ModificationRequest(r) => {
            build_modification_request(r, sender, recipient, ctx)
        }
        ReservationPayload::ModificationResponse(r) => {
            build_modification_response(r, sender, recipient, ctx)
        }
    }
}

fn required<'a>(tags: &'a [Tag], name: &'static str) -> Result<&'a str, ProtocolError> {
    tag_value(tags, name).ok_or(ProtocolError::MissingTag(name))
}

fn number<T: FromStr>(name: &'static str, value: &str) -> Result<T, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::MalformedTag {
        tag: name,
        value: value.to_string(),
    })
}

fn optional_number<T: FromStr>(tags: &[Tag], name: &'static str) -> Result<Option<T>, ProtocolError> {
    tag_value(tags, name).map(|v| number(name, v)).transpose()
}

/// A time tag as Unix seconds. Older payloads carried ISO-8601 strings; those
/// are converted and the zone they imply is returned alongside.
fn time_value(name: &'static str, value: &str) -> Result<(i64, Option<String>), ProtocolError> {
    if let Ok(unix) = value.parse::<i64>() {
        return Ok((unix, None));
    }
    let encoded = time_codec::encode(value).map_err(|_| ProtocolError::MalformedTag {
        tag: name,
        value: value.to_string(),
    })?;
    tracing::debug!(tag = name, value, tzid = %encoded.tzid, "converted legacy ISO time tag");
    Ok((encoded.unix, Some(encoded.tzid)))
}

fn optional_time(tags: &[Tag], name: &'static str) -> Result<Option<(i64, Option<String>)>, ProtocolError> {
    tag_value(tags, name).map(|v| time_value(name, v)).transpose()
}

fn message_of(inner: &UnsignedEvent) -> Option<String> {
    if inner.content.is_empty() {
        None
    } else {
        Some(inner.content.clone())
    }
}

fn check_common(kind: ReservationKind, inner: &UnsignedEvent) -> Result<(), ProtocolError> {
    if inner.kind != kind.kind() {
        return Err(ProtocolError::UnexpectedKind {
            expected: kind.kind(),
            actual: inner.kind,
        });
    }
    let recipient = required(&inner.tags, "p")?;
    if parse_public_key(recipient).is_err() {
        return Err(ProtocolError::MalformedTag {
            tag: "p",
            value: recipient.to_string(),
        });
    }
    if kind.requires_root() && read_marker_tags(&inner.tags).root.is_none() {
        return Err(ProtocolError::MissingThreadRoot(kind));
    }
    Ok(())
}

fn parse_request_kind(
    kind: ReservationKind,
    inner: &UnsignedEvent,
) -> Result<ReservationRequest, ProtocolError> {
    check_common(kind, inner)?;
    let tags = &inner.tags;
    let party_size = number("party_size", required(tags, "party_size")?)?;
    let (time, inferred_zone) = time_value("time", required(tags, "time")?)?;
    let tzid = match (tag_value(tags, "tzid"), inferred_zone) {
        (Some(tzid), _) => tzid.to_string(),
        (None, Some(zone)) => zone,
        (None, None) => return Err(ProtocolError::MissingTag("tzid")),
    };
    let req = ReservationRequest {
        party_size,
        time,
        tzid,
        name: tag_value(tags, "name").map(str::to_string),
        telephone: tag_value(tags, "telephone").map(str::to_string),
        email: tag_value(tags, "email").map(str::to_string),
        duration: optional_number(tags, "duration")?,
        earliest_time: optional_time(tags, "earliest_time")?.map(|(t, _)| t),
        latest_time: optional_time(tags, "latest_time")?.map(|(t, _)| t),
        message: message_of(inner),
    };
    validate_request(&req)?;
    Ok(req)
}

fn parse_response_kind(
    kind: ReservationKind,
    inner: &UnsignedEvent,
) -> Result<ReservationResponse, ProtocolError> {
    check_common(kind, inner)?;
    let tags = &inner.tags;
    let raw_status = required(tags, "status")?;
    let status = raw_status
        .parse::<ResponseStatus>()
        .map_err(|status| ProtocolError::InvalidStatus { status, kind })?;
    let time = optional_time(tags, "time")?;
    let tzid = tag_value(tags, "tzid")
        .map(str::to_string)
        .or_else(|| time.as_ref().and_then(|(_, zone)| zone.clone()));
    let resp = ReservationResponse {
        status,
        time: time.map(|(t, _)| t),
        tzid,
        duration: optional_number(tags, "duration")?,
        message: message_of(inner),
    };
    validate_response(&resp, kind)?;
    Ok(resp)
}

pub fn parse_request(inner: &UnsignedEvent) -> Result<ReservationRequest, ProtocolError> {
    parse_request_kind(ReservationKind::Request, inner)
}

pub fn parse_modification_request(
    inner: &UnsignedEvent,
) -> Result<ReservationRequest, ProtocolError> {
    parse_request_kind(ReservationKind::ModificationRequest, inner)
}

pub fn parse_response(inner: &UnsignedEvent) -> Result<ReservationResponse, ProtocolError> {
    parse_response_kind(ReservationKind::Response, inner)
}

pub fn parse_modification_response(
    inner: &UnsignedEvent,
) -> Result<ReservationResponse, ProtocolError> {
    parse_response_kind(ReservationKind::ModificationResponse, inner)
}

/// Decode `inner` as `expected`, failing on any other kind.
pub fn parse(
    expected: ReservationKind,
    inner: &UnsignedEvent,
) -> Result<ReservationPayload, ProtocolError> {
    Ok(match expected {
        ReservationKind::Request => ReservationPayload::Request(parse_request(inner)?),
        ReservationKind::Response => ReservationPayload::Response(parse_response(inner)?),
        ReservationKind::ModificationRequest => {
            ReservationPayload::ModificationRequest(parse_modification_request(inner)?)
        }
        ReservationKind::ModificationResponse => {
            ReservationPayload::ModificationResponse(parse_modification_response(inner)?)
        }
    })
}

/// Decode `inner` as whatever reservation kind it declares.
pub fn parse_any(inner: &UnsignedEvent) -> Result<ReservationPayload, ProtocolError> {
    let kind = ReservationKind::from_kind(inner.kind).ok_or(ProtocolError::UnexpectedKind {
        expected: RESERVATION_REQUEST_KIND,
        actual: inner.kind,
    })?;
    parse(kind, inner)
}

/// Recipient named by the `p` tag.
pub fn recipient_of(inner: &UnsignedEvent) -> Option<&str> {
    tag_value(&inner.tags, "p")
}
