// Tracked changes and comments attached to a document.
//
// Entries carry stable ids: accepting a change removes it from the list,
// reopening re-inserts it with the same id and metadata. The serde shape
// is stored verbatim in the hot cache and in archive blobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::update::Component;

/// Who produced a range entry, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub ts: DateTime<Utc>,
}

/// A tracked insertion or deletion awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedChange {
    pub id: String,
    pub op: Component,
    pub metadata: RangeMeta,
}

/// An inline comment anchored to a snapshot region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRange {
    pub id: String,
    pub op: Component,
    pub metadata: RangeMeta,
}

/// All review state for one document, ordered by position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ranges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<TrackedChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<CommentRange>,
}

impl Ranges {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.comments.is_empty()
    }

    /// Accepts tracked changes by id, removing them from the list.
    /// Unknown ids are ignored. Returns how many entries were removed.
    pub fn accept_changes<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) -> usize {
        let before = self.changes.len();
        let accepted: Vec<&str> = ids.into_iter().collect();
        self.changes.retain(|change| !accepted.contains(&change.id.as_str()));
        before - self.changes.len()
    }

    /// Re-inserts a previously accepted change, keeping the list ordered
    /// by position. The id and metadata are preserved as-is.
    pub fn reopen_change(&mut self, change: TrackedChange) {
        let position = change.op.position();
        let index = self
            .changes
            .iter()
            .position(|existing| existing.op.position() > position)
            .unwrap_or(self.changes.len());
        self.changes.insert(index, change);
    }

    pub fn find_comment(&self, id: &str) -> Option<&CommentRange> {
        self.comments.iter().find(|comment| comment.id == id)
    }

    pub fn remove_comment(&mut self, id: &str) -> Option<CommentRange> {
        let index = self.comments.iter().position(|comment| comment.id == id)?;
        Some(self.comments.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::{RangeMeta, Ranges, TrackedChange};
    use crate::update::Component;
    use chrono::Utc;

    fn change(id: &str, position: usize) -> TrackedChange {
        TrackedChange {
            id: id.to_owned(),
            op: Component::insertion("x", position),
            metadata: RangeMeta { user_id: None, ts: Utc::now() },
        }
    }

    #[test]
    fn accept_removes_only_the_named_changes() {
        let mut ranges = Ranges::default();
        ranges.reopen_change(change("a", 0));
        ranges.reopen_change(change("b", 4));
        ranges.reopen_change(change("c", 9));

        let removed = ranges.accept_changes(["b", "missing"]);
        assert_eq!(removed, 1);
        assert_eq!(
            ranges.changes.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
    }

    #[test]
    fn reopen_restores_position_order_and_identity() {
        let mut ranges = Ranges::default();
        ranges.reopen_change(change("a", 0));
        ranges.reopen_change(change("c", 9));

        let reopened = change("b", 4);
        ranges.reopen_change(reopened.clone());

        assert_eq!(
            ranges.changes.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(ranges.changes[1], reopened);
    }

    #[test]
    fn empty_ranges_serialize_to_an_empty_object() {
        let encoded = serde_json::to_string(&Ranges::default()).expect("ranges should encode");
        assert_eq!(encoded, "{}");
        let decoded: Ranges = serde_json::from_str("{}").expect("ranges should decode");
        assert!(decoded.is_empty());
    }
}
