//! Upstream records and the content blocks derived from them.

use crate::error::{CoreError, CoreResult};
use crate::types::{CustomFields, ExternalKey, FieldValue, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind of a content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Section heading.
    Heading,
    /// Plain paragraph.
    Paragraph,
    /// Bulleted list item.
    BulletedItem,
    /// Quoted text.
    Quote,
}

/// Who owns a content block once it has been written downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOrigin {
    /// Mirrors upstream data; always overwritten on sync.
    Upstream,
    /// Produced by analysis; preserved downstream unless regenerated.
    Derived,
}

/// A single block of document content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    /// Block kind.
    pub kind: BlockKind,
    /// Plain text content.
    pub text: String,
    /// Ownership of the block.
    pub origin: BlockOrigin,
}

impl ContentBlock {
    /// Creates an upstream-owned block.
    pub fn upstream(kind: BlockKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            origin: BlockOrigin::Upstream,
        }
    }

    /// Creates a derived block.
    pub fn derived(kind: BlockKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            origin: BlockOrigin::Derived,
        }
    }

    /// Returns true if the block is derived content.
    #[must_use]
    pub fn is_derived(&self) -> bool {
        self.origin == BlockOrigin::Derived
    }
}

/// An upstream unit of work.
///
/// Records are immutable once fetched within a run; the enricher returns an
/// augmented copy rather than mutating in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable upstream identifier.
    pub external_key: ExternalKey,
    /// Record title.
    #[serde(default)]
    pub title: String,
    /// Free-form description (may contain light markup).
    #[serde(default)]
    pub description: String,
    /// Owner display names.
    #[serde(default)]
    pub owners: Vec<String>,
    /// Creator display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    /// Iteration identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<String>,
    /// Module name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Workflow status label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Upstream modification time.
    pub updated_at: Timestamp,
    /// Arbitrary upstream fields.
    #[serde(default, skip_serializing_if = "CustomFields::is_empty")]
    pub custom_fields: CustomFields,
    /// Content produced by the enricher.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_content: Vec<ContentBlock>,
}

impl Record {
    /// Creates a record with the required fields.
    pub fn new(
        external_key: impl Into<ExternalKey>,
        title: impl Into<String>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            external_key: external_key.into(),
            title: title.into(),
            description: String::new(),
            owners: Vec::new(),
            creator: None,
            iteration: None,
            module: None,
            status: None,
            updated_at,
            custom_fields: CustomFields::new(),
            derived_content: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds an owner.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owners.push(owner.into());
        self
    }

    /// Sets the creator.
    #[must_use]
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    /// Sets the iteration.
    #[must_use]
    pub fn with_iteration(mut self, iteration: impl Into<String>) -> Self {
        self.iteration = Some(iteration.into());
        self
    }

    /// Sets the module.
    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets a typed custom field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.custom_fields.insert(key, value);
        self
    }

    /// Title to display, falling back to a key-based placeholder.
    #[must_use]
    pub fn display_title(&self) -> String {
        let title = self.title.trim();
        if title.is_empty() {
            format!("Story {}", self.external_key)
        } else {
            title.to_string()
        }
    }

    /// Checks that the record can be reconciled.
    pub fn validate(&self) -> CoreResult<()> {
        if !self.external_key.is_valid() {
            return Err(CoreError::invalid_record(
                self.external_key.as_str(),
                "missing or placeholder external key",
            ));
        }
        Ok(())
    }
}
