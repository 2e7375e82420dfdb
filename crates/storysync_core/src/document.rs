//! Destination documents and the merge-preserve write policy.
//!
//! A destination document mirrors a subset of an upstream [`Record`] plus
//! sync metadata. Some of its fields are owned by downstream consumers
//! (for example analysis text that people edit by hand). The
//! [`FieldOwnership`] table states, per property, who owns it, and
//! [`merge_preserve`] applies that table when an existing document is
//! overwritten.
//!
//! [`Record`]: crate::Record

use crate::record::ContentBlock;
use crate::types::{ExternalKey, FieldValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property holding the external key on the destination side.
pub const PROP_EXTERNAL_KEY: &str = "external_key";
/// Property holding the time of the last write by the sync engine.
pub const PROP_LAST_SYNCED_AT: &str = "last_synced_at";
/// Property holding the mapping format version of the last write.
pub const PROP_SYNC_VERSION: &str = "sync_version";

/// The materialized counterpart of an upstream record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationDocument {
    /// Identifier assigned by the destination store. `None` until created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    /// Idempotency key back to the upstream record.
    pub external_key: ExternalKey,
    /// Mapped properties, including sync metadata.
    #[serde(default)]
    pub properties: BTreeMap<String, FieldValue>,
    /// Page content.
    #[serde(default)]
    pub content_blocks: Vec<ContentBlock>,
}

impl DestinationDocument {
    /// Creates an empty, not-yet-created document for a key.
    pub fn new(external_key: ExternalKey) -> Self {
        Self {
            destination_id: None,
            external_key,
            properties: BTreeMap::new(),
            content_blocks: Vec::new(),
        }
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Sets the content blocks.
    #[must_use]
    pub fn with_blocks(mut self, blocks: Vec<ContentBlock>) -> Self {
        self.content_blocks = blocks;
        self
    }

    /// Returns the last-synced timestamp recorded on the document, if any.
    #[must_use]
    pub fn last_synced_at(&self) -> Option<crate::Timestamp> {
        match self.properties.get(PROP_LAST_SYNCED_AT) {
            Some(FieldValue::Date(d)) => Some(*d),
            _ => None,
        }
    }

    /// Returns the document's properties without sync metadata.
    ///
    /// Two writes of the same upstream state produce equal content views.
    #[must_use]
    pub fn content_view(&self) -> (BTreeMap<&str, &FieldValue>, &[ContentBlock]) {
        let props = self
            .properties
            .iter()
            .filter(|(k, _)| k.as_str() != PROP_LAST_SYNCED_AT && k.as_str() != PROP_SYNC_VERSION)
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        (props, &self.content_blocks)
    }
}

/// Owner of a destination property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOwner {
    /// Upstream is authoritative; always overwritten.
    Upstream,
    /// Downstream consumers own the value once written.
    Downstream,
}

/// Per-property ownership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOwnership {
    default_owner: FieldOwner,
    overrides: BTreeMap<String, FieldOwner>,
}

impl FieldOwnership {
    /// Creates a table where every property has the given owner.
    #[must_use]
    pub fn all(default_owner: FieldOwner) -> Self {
        Self {
            default_owner,
            overrides: BTreeMap::new(),
        }
    }

    /// Marks a property as downstream-owned.
    #[must_use]
    pub fn downstream(mut self, name: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), FieldOwner::Downstream);
        self
    }

    /// Marks a property as upstream-owned.
    #[must_use]
    pub fn upstream(mut self, name: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), FieldOwner::Upstream);
        self
    }

    /// Returns the owner of a property.
    ///
    /// Sync metadata and the external key always belong upstream.
    #[must_use]
    pub fn owner_of(&self, name: &str) -> FieldOwner {
        if matches!(
            name,
            PROP_EXTERNAL_KEY | PROP_LAST_SYNCED_AT | PROP_SYNC_VERSION
        ) {
            return FieldOwner::Upstream;
        }
        self.overrides
            .get(name)
            .copied()
            .unwrap_or(self.default_owner)
    }
}

impl Default for FieldOwnership {
    /// Upstream owns everything except the hand-curated analysis columns.
    fn default() -> Self {
        Self::all(FieldOwner::Upstream)
            .downstream("analysis")
            .downstream("feature_points")
            .downstream("review_notes")
    }
}

/// Merges a freshly mapped candidate onto an existing document.
///
/// - Upstream-owned properties take the candidate's value; if the candidate
///   no longer has one, the property is dropped.
/// - Downstream-owned properties keep the existing value. The candidate's
///   value is used only when the existing document lacks one or
///   `regenerate_derived` is set.
/// - Upstream content blocks always come from the candidate. Derived blocks
///   are kept from the existing document unless it has none or
///   `regenerate_derived` is set.
pub fn merge_preserve(
    existing: &DestinationDocument,
    candidate: DestinationDocument,
    ownership: &FieldOwnership,
    regenerate_derived: bool,
) -> DestinationDocument {
    let mut properties = BTreeMap::new();

    for (name, value) in &existing.properties {
        if ownership.owner_of(name) == FieldOwner::Downstream {
            properties.insert(name.clone(), value.clone());
        }
    }
    for (name, value) in candidate.properties {
        let keep_existing = ownership.owner_of(&name) == FieldOwner::Downstream
            && !regenerate_derived
            && properties.contains_key(&name);
        if !keep_existing {
            properties.insert(name, value);
        }
    }

    let existing_derived: Vec<ContentBlock> = existing
        .content_blocks
        .iter()
        .filter(|b| b.is_derived())
        .cloned()
        .collect();
    let (mut blocks, candidate_derived): (Vec<_>, Vec<_>) = candidate
        .content_blocks
        .into_iter()
        .partition(|b| !b.is_derived());
    if regenerate_derived || existing_derived.is_empty() {
        blocks.extend(candidate_derived);
    } else {
        blocks.extend(existing_derived);
    }

    DestinationDocument {
        destination_id: existing.destination_id.clone(),
        external_key: candidate.external_key,
        properties,
        content_blocks: blocks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BlockKind;

    fn existing() -> DestinationDocument {
        DestinationDocument {
            destination_id: Some("page-1".into()),
            ..DestinationDocument::new(ExternalKey::new("A"))
        }
        .with_property("title", FieldValue::text("old title"))
        .with_property("status", FieldValue::text("open"))
        .with_property("analysis", FieldValue::text("curated by hand"))
        .with_blocks(vec![
            ContentBlock::upstream(BlockKind::Paragraph, "old description"),
            ContentBlock::derived(BlockKind::Paragraph, "edited analysis"),
        ])
    }

    fn candidate() -> DestinationDocument {
        DestinationDocument::new(ExternalKey::new("A"))
            .with_property("title", FieldValue::text("new title"))
            .with_property("analysis", FieldValue::text("generated"))
            .with_blocks(vec![
                ContentBlock::upstream(BlockKind::Paragraph, "new description"),
                ContentBlock::derived(BlockKind::Paragraph, "generated analysis"),
            ])
    }

    #[test]
    fn ownership_defaults() {
        let table = FieldOwnership::default();
        assert_eq!(table.owner_of("title"), FieldOwner::Upstream);
        assert_eq!(table.owner_of("analysis"), FieldOwner::Downstream);
        assert_eq!(table.owner_of(PROP_LAST_SYNCED_AT), FieldOwner::Upstream);

        let all_down = FieldOwnership::all(FieldOwner::Downstream);
        assert_eq!(all_down.owner_of(PROP_EXTERNAL_KEY), FieldOwner::Upstream);
    }

    #[test]
    fn merge_keeps_downstream_fields() {
        let merged = merge_preserve(&existing(), candidate(), &FieldOwnership::default(), false);

        assert_eq!(merged.destination_id.as_deref(), Some("page-1"));
        assert_eq!(merged.properties["title"], FieldValue::text("new title"));
        assert_eq!(
            merged.properties["analysis"],
            FieldValue::text("curated by hand")
        );
        // Upstream dropped the status, so it goes away.
        assert!(!merged.properties.contains_key("status"));

        let texts: Vec<_> = merged.content_blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["new description", "edited analysis"]);
    }

    #[test]
    fn merge_regenerates_when_asked() {
        let merged = merge_preserve(&existing(), candidate(), &FieldOwnership::default(), true);

        assert_eq!(merged.properties["analysis"], FieldValue::text("generated"));
        let texts: Vec<_> = merged.content_blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["new description", "generated analysis"]);
    }

    #[test]
    fn merge_fills_missing_derived_content() {
        let mut bare = existing();
        bare.properties.remove("analysis");
        bare.content_blocks.retain(|b| !b.is_derived());

        let merged = merge_preserve(&bare, candidate(), &FieldOwnership::default(), false);
        assert_eq!(merged.properties["analysis"], FieldValue::text("generated"));
        assert!(merged.content_blocks.iter().any(|b| b.text == "generated analysis"));
    }

    #[test]
    fn content_view_ignores_sync_metadata() {
        let a = candidate().with_property(PROP_SYNC_VERSION, FieldValue::Number(1.0));
        let b = candidate().with_property(PROP_SYNC_VERSION, FieldValue::Number(2.0));
        assert_eq!(a.content_view(), b.content_view());
    }
}
