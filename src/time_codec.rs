//! Conversion between ISO-8601 timestamps and `(unix seconds, IANA zone)` pairs.
//!
//! Reservation records carry a numeric `time` plus a `tzid` tag. Going from a
//! string with a bare numeric offset back to a zone is inherently lossy, so
//! [`encode`] reports where the zone came from via [`ZoneSource`]. Anything
//! other than [`ZoneSource::Utc`] or [`ZoneSource::Explicit`] is a guess.

use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::TimeError;

/// Where the zone identifier of an [`EncodedTime`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneSource {
    /// The input ended in `Z`.
    Utc,
    /// Supplied by the caller.
    Explicit,
    /// The host's zone matched the offset at that instant.
    System,
    /// Found in the offset lookup table.
    Table,
    /// No named zone matched; an `Etc/GMT±N` zone was synthesized.
    Synthetic,
}

impl ZoneSource {
    /// Whether the zone was inferred from a bare offset.
    pub fn is_inferred(self) -> bool {
        matches!(self, ZoneSource::System | ZoneSource::Table | ZoneSource::Synthetic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTime {
    pub unix: i64,
    pub tzid: String,
    pub source: ZoneSource,
}

/// Candidate zones per UTC offset (seconds). Several entries share an offset
/// so that both standard and daylight time map somewhere sensible; the first
/// whose real offset at the instant matches wins.
const OFFSET_ZONES: &[(i32, &str)] = &[
    (-36000, "Pacific/Honolulu"),
    (-34200, "Pacific/Marquesas"),
    (-32400, "America/Anchorage"),
    (-28800, "America/Anchorage"),
    (-28800, "America/Los_Angeles"),
    (-25200, "America/Los_Angeles"),
    (-25200, "America/Denver"),
    (-25200, "America/Phoenix"),
    (-21600, "America/Denver"),
    (-21600, "America/Chicago"),
    (-21600, "America/Mexico_City"),
    (-18000, "America/Chicago"),
    (-18000, "America/New_York"),
    (-18000, "America/Bogota"),
    (-14400, "America/New_York"),
    (-14400, "America/Halifax"),
    (-14400, "America/Caracas"),
    (-12600, "America/St_Johns"),
    (-10800, "America/Halifax"),
    (-10800, "America/Sao_Paulo"),
    (-10800, "America/Argentina/Buenos_Aires"),
    (-9000, "America/St_Johns"),
    (-3600, "Atlantic/Azores"),
    (0, "Europe/London"),
    (0, "Atlantic/Reykjavik"),
    (3600, "Europe/London"),
    (3600, "Europe/Paris"),
    (3600, "Africa/Lagos"),
    (7200, "Europe/Paris"),
    (7200, "Europe/Athens"),
    (7200, "Africa/Johannesburg"),
    (10800, "Europe/Athens"),
    (10800, "Europe/Moscow"),
    (12600, "Asia/Tehran"),
    (14400, "Asia/Dubai"),
    (16200, "Asia/Kabul"),
    (18000, "Asia/Karachi"),
    (19800, "Asia/Kolkata"),
    (20700, "Asia/Kathmandu"),
    (21600, "Asia/Dhaka"),
    (23400, "Asia/Yangon"),
    (25200, "Asia/Bangkok"),
    (28800, "Asia/Singapore"),
    (28800, "Australia/Perth"),
    (31500, "Australia/Eucla"),
    (32400, "Asia/Tokyo"),
    (34200, "Australia/Darwin"),
    (34200, "Australia/Adelaide"),
    (36000, "Australia/Sydney"),
    (36000, "Australia/Brisbane"),
    (37800, "Australia/Adelaide"),
    (39600, "Australia/Sydney"),
    (43200, "Pacific/Auckland"),
    (45900, "Pacific/Chatham"),
    (46800, "Pacific/Auckland"),
    (49500, "Pacific/Chatham"),
    (50400, "Pacific/Kiritimati"),
];

/// Parse an ISO-8601 timestamp with a numeric offset or `Z`.
///
/// The zone of a `Z` input is `UTC`. For numeric offsets the zone is inferred:
/// the host zone if it has that offset at that instant, then the lookup table,
/// then a synthetic `Etc/GMT±N` zone.
pub fn encode(iso: &str) -> Result<EncodedTime, TimeError> {
    let system = iana_time_zone::get_timezone().ok();
    encode_with_system_zone(iso, system.as_deref())
}

/// [`encode`] with an explicit notion of the host zone.
pub fn encode_with_system_zone(iso: &str, system: Option<&str>) -> Result<EncodedTime, TimeError> {
    let (dt, is_utc) = parse_iso(iso)?;
    let unix = dt.timestamp();
    if is_utc {
        return Ok(EncodedTime {
            unix,
            tzid: "UTC".into(),
            source: ZoneSource::Utc,
        });
    }
    let offset = dt.offset().local_minus_utc();
    let (tzid, source) = infer_zone(offset, &dt.with_timezone(&Utc), system);
    if source.is_inferred() {
        tracing::debug!(iso, offset, tzid = %tzid, ?source, "inferred zone from offset");
    }
    Ok(EncodedTime { unix, tzid, source })
}

/// Parse `iso` for its instant and attach a caller-supplied zone.
pub fn encode_in_zone(iso: &str, tzid: &str) -> Result<EncodedTime, TimeError> {
    parse_zone(tzid)?;
    let (dt, _) = parse_iso(iso)?;
    Ok(EncodedTime {
        unix: dt.timestamp(),
        tzid: tzid.to_string(),
        source: ZoneSource::Explicit,
    })
}

/// Format `unix` in `tzid` as ISO-8601 with that zone's offset at the instant.
///
/// UTC zones are rendered with a `Z` suffix.
pub fn decode(unix: i64, tzid: &str) -> Result<String, TimeError> {
    let tz = parse_zone(tzid)?;
    let dt = tz
        .timestamp_opt(unix, 0)
        .single()
        .ok_or(TimeError::InvalidTimestamp(unix))?;
    if is_utc_zone(&tz) {
        return Ok(dt.format("%Y-%m-%dT%H:%M:%SZ").to_string());
    }
    Ok(dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string())
}

fn parse_zone(tzid: &str) -> Result<Tz, TimeError> {
    if tzid.trim().is_empty() {
        return Err(TimeError::InvalidTimezone(tzid.into()));
    }
    tzid.parse::<Tz>()
        .map_err(|_| TimeError::InvalidTimezone(tzid.into()))
}

fn is_utc_zone(tz: &Tz) -> bool {
    matches!(
        tz.name(),
        "UTC" | "Etc/UTC" | "Etc/Universal" | "Universal" | "Etc/Zulu" | "Zulu"
    )
}

/// Accepts RFC 3339 plus the minute-precision and compact-offset forms.
fn parse_iso(iso: &str) -> Result<(DateTime<FixedOffset>, bool), TimeError> {
    let s = iso.trim();
    if s.is_empty() {
        return Err(TimeError::MalformedTimestamp(iso.into()));
    }
    let is_utc = s.ends_with('Z') || s.ends_with('z');
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok((dt, is_utc));
    }
    // chrono's `%z` does not accept `Z`, so swap it for an explicit zero offset.
    let normalized = if is_utc {
        format!("{}+00:00", &s[..s.len() - 1])
    } else {
        s.to_string()
    };
    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M%:z",
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%dT%H:%M%z",
        "%Y-%m-%d %H:%M:%S%:z",
    ];
    FORMATS
        .iter()
        .find_map(|f| DateTime::parse_from_str(&normalized, f).ok())
        .map(|dt| (dt, is_utc))
        .ok_or_else(|| TimeError::MalformedTimestamp(iso.into()))
}

fn offset_at(tz: &Tz, instant: &DateTime<Utc>) -> i32 {
    tz.offset_from_utc_datetime(&instant.naive_utc())
        .fix()
        .local_minus_utc()
}

fn infer_zone(offset: i32, instant: &DateTime<Utc>, system: Option<&str>) -> (String, ZoneSource) {
    if let Some(tz) = system.and_then(|name| name.parse::<Tz>().ok()) {
        if offset_at(&tz, instant) == offset {
            return (tz.name().to_string(), ZoneSource::System);
        }
    }
    for (table_offset, name) in OFFSET_ZONES {
        if *table_offset != offset {
            continue;
        }
        if let Ok(tz) = name.parse::<Tz>() {
            if offset_at(&tz, instant) == offset {
                return (name.to_string(), ZoneSource::Table);
            }
        }
    }
    (synthetic_zone(offset), ZoneSource::Synthetic)
}

/// `Etc/GMT` zones invert the sign: UTC+3 is `Etc/GMT-3`.
fn synthetic_zone(offset: i32) -> String {
    if offset % 3600 != 0 || !(-12 * 3600..=14 * 3600).contains(&offset) {
        tracing::warn!(offset, "offset has no Etc/GMT zone, falling back to UTC");
        return "UTC".into();
    }
    let hours = offset / 3600;
    match hours {
        0 => "Etc/GMT".into(),
        h if h > 0 => format!("Etc/GMT-{h}"),
        h => format!("Etc/GMT+{}", -h),
    }
}
