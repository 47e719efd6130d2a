// Wire types for document updates.
//
// These shapes are shared between the pending queue, the hot cache's
// recent-ops ring, and the applied-ops fan-out channel, so the serde
// field names are compatibility surface and must not change.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single operation component.
///
/// Positions are UTF-8 **byte** offsets into the snapshot as it was
/// before this component applied. Deletions and comments carry the text
/// they expect to find at that offset and fail verification otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Component {
    Insertion {
        i: String,
        p: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        u: Option<bool>,
    },
    Deletion {
        d: String,
        p: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        u: Option<bool>,
    },
    Comment {
        c: String,
        p: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        t: Option<String>,
    },
}

impl Component {
    pub fn insertion(text: impl Into<String>, position: usize) -> Self {
        Self::Insertion { i: text.into(), p: position, u: None }
    }

    pub fn deletion(text: impl Into<String>, position: usize) -> Self {
        Self::Deletion { d: text.into(), p: position, u: None }
    }

    pub fn comment(text: impl Into<String>, position: usize) -> Self {
        Self::Comment { c: text.into(), p: position, t: None }
    }

    pub fn position(&self) -> usize {
        match self {
            Self::Insertion { p, .. } | Self::Deletion { p, .. } | Self::Comment { p, .. } => *p,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Insertion { i, .. } => i,
            Self::Deletion { d, .. } => d,
            Self::Comment { c, .. } => c,
        }
    }

    /// Marks the component as part of an undo, as produced by external
    /// overwrites that revert earlier edits.
    pub fn mark_undo(&mut self) {
        match self {
            Self::Insertion { u, .. } | Self::Deletion { u, .. } => *u = Some(true),
            Self::Comment { .. } => {}
        }
    }
}

/// An ordered sequence of components applied left to right.
pub type Op = Vec<Component>;

/// Provenance attached to every update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMeta {
    /// `"external"` for synthetic overwrite updates, absent for editor ops.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Originating client session, matched against `dupIfSource`.
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    /// Epoch milliseconds at which the updater first saw this update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestion_time: Option<i64>,
}

/// An update flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    #[serde(rename = "doc")]
    pub doc_id: Uuid,
    #[serde(rename = "v")]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub op: Op,
    /// 40-char lowercase hex of the expected post-apply snapshot SHA-1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dup: Option<bool>,
    #[serde(rename = "dupIfSource", default, skip_serializing_if = "Option::is_none")]
    pub dup_if_source: Option<Vec<String>>,
    #[serde(default)]
    pub meta: UpdateMeta,
}

impl DocumentUpdate {
    pub fn is_dup(&self) -> bool {
        self.dup.unwrap_or(false)
    }

    /// Shrinks a duplicate update to the minimal confirmation shape the
    /// fan-out channel carries: doc, dup flag, version, source, and
    /// ingestion time only.
    pub fn dup_confirmation(&self) -> DocumentUpdate {
        DocumentUpdate {
            doc_id: self.doc_id,
            version: self.version,
            op: Vec::new(),
            hash: None,
            dup: Some(true),
            dup_if_source: None,
            meta: UpdateMeta {
                kind: None,
                source: self.meta.source.clone(),
                user_id: None,
                ingestion_time: self.meta.ingestion_time,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Component, DocumentUpdate, UpdateMeta};
    use uuid::Uuid;

    #[test]
    fn components_round_trip_with_short_field_names() {
        let op = vec![
            Component::insertion("hello", 3),
            Component::deletion("x", 0),
            Component::Comment { c: "note".into(), p: 5, t: Some("thread-1".into()) },
        ];

        let encoded = serde_json::to_string(&op).expect("op should encode");
        assert_eq!(
            encoded,
            r#"[{"i":"hello","p":3},{"d":"x","p":0},{"c":"note","p":5,"t":"thread-1"}]"#
        );

        let decoded: Vec<Component> = serde_json::from_str(&encoded).expect("op should decode");
        assert_eq!(decoded, op);
    }

    #[test]
    fn undo_marker_encodes_only_when_set() {
        let mut component = Component::insertion("a", 0);
        component.mark_undo();
        let encoded = serde_json::to_string(&component).expect("component should encode");
        assert_eq!(encoded, r#"{"i":"a","p":0,"u":true}"#);
    }

    #[test]
    fn dup_confirmation_drops_everything_but_identity_and_source() {
        let update = DocumentUpdate {
            doc_id: Uuid::new_v4(),
            version: 7,
            op: vec![Component::insertion("!", 5)],
            hash: Some("ab".repeat(20)),
            dup: Some(true),
            dup_if_source: Some(vec!["sess-A".into()]),
            meta: UpdateMeta {
                kind: Some("external".into()),
                source: "sess-B".into(),
                user_id: Some(Uuid::new_v4()),
                ingestion_time: Some(1_700_000_000_000),
            },
        };

        let confirmation = update.dup_confirmation();
        assert_eq!(confirmation.doc_id, update.doc_id);
        assert_eq!(confirmation.version, 7);
        assert!(confirmation.op.is_empty());
        assert_eq!(confirmation.hash, None);
        assert_eq!(confirmation.dup, Some(true));
        assert_eq!(confirmation.meta.source, "sess-B");
        assert_eq!(confirmation.meta.ingestion_time, Some(1_700_000_000_000));
        assert_eq!(confirmation.meta.user_id, None);
    }

    #[test]
    fn update_decodes_with_missing_optional_fields() {
        let raw = r#"{"doc":"6f2a7cbb-7b43-4e62-9d33-3c2b8f1d0a11","v":3,"op":[{"i":"X","p":0}],"meta":{"source":"c1"}}"#;
        let update: DocumentUpdate = serde_json::from_str(raw).expect("update should decode");
        assert_eq!(update.version, 3);
        assert!(!update.is_dup());
        assert_eq!(update.dup_if_source, None);
        assert_eq!(update.meta.source, "c1");
    }
}
