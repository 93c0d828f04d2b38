//! NIP-10 style thread markers and conversation grouping.

use std::collections::BTreeMap;

use crate::{
    error::ThreadError,
    event::{Record, Tag},
};

/// A reference to another inner record with an optional relay hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRef {
    pub id: String,
    pub relay: Option<String>,
}

impl EventRef {
    pub fn new(id: impl Into<String>) -> Self {
        EventRef {
            id: id.into(),
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: impl Into<String>) -> Self {
        self.relay = Some(relay.into());
        self
    }

    fn to_tag(&self, marker: &str) -> Tag {
        Tag::new([
            "e",
            self.id.as_str(),
            self.relay.as_deref().unwrap_or(""),
            marker,
        ])
    }
}

/// Root and reply markers read from a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadMarker {
    pub root: Option<EventRef>,
    pub reply: Option<EventRef>,
}

impl ThreadMarker {
    pub fn root_id(&self) -> Option<&str> {
        self.root.as_ref().map(|r| r.id.as_str())
    }
}

/// Append root and reply `e` tags, in that order.
pub fn attach_markers(
    mut tags: Vec<Tag>,
    root: Option<&EventRef>,
    reply: Option<&EventRef>,
) -> Result<Vec<Tag>, ThreadError> {
    if let (None, Some(reply)) = (root, reply) {
        return Err(ThreadError::ReplyWithoutRoot(reply.id.clone()));
    }
    if let Some(root) = root {
        tags.push(root.to_tag("root"));
    }
    if let Some(reply) = reply {
        tags.push(reply.to_tag("reply"));
    }
    Ok(tags)
}

/// First `root` and first `reply` marked `e` tags.
///
/// A record with only a `reply` marker is treated as replying to the root
/// directly, so the reply id doubles as its root.
pub fn read_markers<R: Record>(record: &R) -> ThreadMarker {
    read_marker_tags(record.tags())
}

pub fn read_marker_tags(tags: &[Tag]) -> ThreadMarker {
    let mut marker = ThreadMarker::default();
    for tag in tags.iter().filter(|t| t.is("e")) {
        let Some(id) = tag.get(1).filter(|id| !id.is_empty()) else {
            continue;
        };
        let reference = EventRef {
            id: id.to_string(),
            relay: tag.get(2).filter(|r| !r.is_empty()).map(str::to_string),
        };
        match tag.get(3) {
            Some("root") if marker.root.is_none() => marker.root = Some(reference),
            Some("reply") if marker.reply.is_none() => marker.reply = Some(reference),
            _ => {}
        }
    }
    if marker.root.is_none() {
        marker.root = marker.reply.clone();
    }
    marker
}

pub fn is_root<R: Record>(record: &R) -> bool {
    let m = read_markers(record);
    m.root.is_none() && m.reply.is_none()
}

/// Thread id a record belongs to: its root marker or, for roots, itself.
pub fn thread_id<R: Record>(record: &R) -> String {
    read_markers(record)
        .root
        .map(|r| r.id)
        .unwrap_or_else(|| record.id().to_string())
}

/// File each record under its thread id, keeping input order within a group.
pub fn group_by_thread<R: Record + Clone>(records: &[R]) -> BTreeMap<String, Vec<R>> {
    let mut groups: BTreeMap<String, Vec<R>> = BTreeMap::new();
    for record in records {
        groups
            .entry(thread_id(record))
            .or_default()
            .push(record.clone());
    }
    groups
}

/// Stable ascending sort by `created_at`.
pub fn sort_thread<R: Record>(mut records: Vec<R>) -> Vec<R> {
    records.sort_by_key(|r| r.created_at());
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UnsignedEvent;

    fn record(created_at: u64, tags: Vec<Tag>, content: &str) -> UnsignedEvent {
        UnsignedEvent::new("ab".repeat(32), created_at, 9901, tags, content)
    }

    #[test]
    fn attach_appends_root_then_reply() {
        let base = vec![Tag::new(["p", "x"])];
        let root = EventRef::new("r1").with_relay("wss://relay.example");
        let reply = EventRef::new("r2");
        let tags = attach_markers(base, Some(&root), Some(&reply)).unwrap();
        assert_eq!(tags[0], Tag::new(["p", "x"]));
        assert_eq!(tags[1], Tag::new(["e", "r1", "wss://relay.example", "root"]));
        assert_eq!(tags[2], Tag::new(["e", "r2", "", "reply"]));
    }

    #[test]
    fn reply_without_root_is_rejected() {
        let reply = EventRef::new("r2");
        assert_eq!(
            attach_markers(vec![], None, Some(&reply)),
            Err(ThreadError::ReplyWithoutRoot("r2".into()))
        );
        assert_eq!(attach_markers(vec![], None, None).unwrap(), vec![]);
    }

    #[test]
    fn read_markers_takes_first_occurrence() {
        let tags = vec![
            Tag::new(["e", "unmarked"]),
            Tag::new(["e", "root1", "", "root"]),
            Tag::new(["e", "root2", "", "root"]),
            Tag::new(["e", "rep", "wss://r", "reply"]),
        ];
        let m = read_markers(&record(1, tags, ""));
        assert_eq!(m.root_id(), Some("root1"));
        let reply = m.reply.unwrap();
        assert_eq!(reply.id, "rep");
        assert_eq!(reply.relay.as_deref(), Some("wss://r"));
    }

    #[test]
    fn reply_only_is_promoted_to_root() {
        let m = read_marker_tags(&[Tag::new(["e", "parent", "", "reply"])]);
        assert_eq!(m.root_id(), Some("parent"));
    }

    #[test]
    fn root_detection() {
        assert!(is_root(&record(1, vec![Tag::new(["p", "x"])], "")));
        assert!(!is_root(&record(1, vec![Tag::new(["e", "a", "", "root"])], "")));
    }

    #[test]
    fn grouping_files_roots_under_themselves() {
        let root = record(1, vec![], "root");
        let n = 3;
        let m = 4;
        let mut records = vec![root.clone()];
        for i in 0..n {
            let tags = vec![Tag::new(["e", root.id.as_str(), "", "root"])];
            records.push(record(10 + i, tags, "reply"));
        }
        for i in 0..m {
            records.push(record(100 + i, vec![], &format!("other {i}")));
        }
        let groups = group_by_thread(&records);
        assert_eq!(groups.len(), m as usize + 1);
        assert_eq!(groups[&root.id].len(), n as usize + 1);
        assert_eq!(groups.values().filter(|g| g.len() == 1).count(), m as usize);
    }

    #[test]
    fn sort_is_stable() {
        let a = record(5, vec![], "a");
        let b = record(1, vec![], "b");
        let c = record(5, vec![], "c");
        let sorted = sort_thread(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(sorted, vec![b, a, c]);
    }
}
