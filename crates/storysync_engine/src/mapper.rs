//! Maps enriched records onto destination documents.

use storysync_core::{
    DestinationDocument, FieldValue, Record, Timestamp, PROP_EXTERNAL_KEY, PROP_LAST_SYNCED_AT,
    PROP_SYNC_VERSION,
};
use tracing::debug;

/// Version of the property layout written by [`map_record`].
///
/// Bump when property names or value shapes change so documents written by
/// older releases can be told apart.
pub const SYNC_VERSION: u32 = 2;

/// Property names written by the mapper itself.
pub const PROP_TITLE: &str = "title";
/// Workflow status label.
pub const PROP_STATUS: &str = "status";
/// Owner names.
pub const PROP_OWNERS: &str = "owners";
/// Creator name.
pub const PROP_CREATOR: &str = "creator";
/// Iteration id.
pub const PROP_ITERATION: &str = "iteration";
/// Module name.
pub const PROP_MODULE: &str = "module";
/// Upstream modification time.
pub const PROP_UPDATED_AT: &str = "updated_at";

const RESERVED: &[&str] = &[
    PROP_EXTERNAL_KEY,
    PROP_LAST_SYNCED_AT,
    PROP_SYNC_VERSION,
    PROP_TITLE,
    PROP_STATUS,
    PROP_OWNERS,
    PROP_CREATOR,
    PROP_ITERATION,
    PROP_MODULE,
    PROP_UPDATED_AT,
];

const STATUS_LABELS: &[(&str, &str)] = &[
    ("planning", "Planning"),
    ("status_8", "Ready for Development"),
    ("status_2", "In Development"),
    ("status_4", "In Integration"),
    ("status_5", "Integration Done"),
    ("status_12", "Submitted for Test"),
    ("status_6", "Testing"),
    ("status_7", "Test Done"),
    ("status_10", "Product Acceptance"),
    ("status_3", "Done"),
    ("status_11", "Closed"),
];

/// Translates a workflow status code into its label.
///
/// Accepts `status_7`, `status-7`, `Status 07` and bare `7`. Unknown codes
/// and labels pass through trimmed.
pub fn normalize_status(raw: &str) -> String {
    let text = raw.trim();
    let lower = text.to_lowercase();

    let code = if lower.chars().all(|c| c.is_ascii_digit()) && !lower.is_empty() {
        lower
            .parse::<u32>()
            .map(|n| format!("status_{n}"))
            .unwrap_or(lower)
    } else if let Some(tail) = ["status_", "status-", "status "]
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix))
    {
        let tail: String = tail
            .trim()
            .chars()
            .filter(|c| *c != ' ')
            .map(|c| if c == '-' { '_' } else { c })
            .collect();
        match tail.parse::<u32>() {
            Ok(n) => format!("status_{n}"),
            Err(_) => format!("status_{tail}"),
        }
    } else {
        lower
    };

    STATUS_LABELS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, label)| (*label).to_string())
        .unwrap_or_else(|| text.to_string())
}

/// Builds the document written for `record`, stamped with `synced_at`.
///
/// Typed custom fields are copied under their own names unless they collide
/// with a mapped property. Unknown custom values are written as their JSON
/// text.
pub fn map_record(record: &Record, synced_at: Timestamp) -> DestinationDocument {
    let mut doc = DestinationDocument::new(record.external_key.clone())
        .with_property(PROP_EXTERNAL_KEY, FieldValue::text(record.external_key.as_str()))
        .with_property(PROP_TITLE, FieldValue::text(record.display_title()))
        .with_property(PROP_UPDATED_AT, FieldValue::Date(record.updated_at))
        .with_property(PROP_LAST_SYNCED_AT, FieldValue::Date(synced_at))
        .with_property(PROP_SYNC_VERSION, FieldValue::Number(f64::from(SYNC_VERSION)));

    if let Some(status) = record.status.as_deref().map(normalize_status) {
        if !status.is_empty() {
            doc.properties
                .insert(PROP_STATUS.to_string(), FieldValue::Text(status));
        }
    }
    if !record.owners.is_empty() {
        doc.properties.insert(
            PROP_OWNERS.to_string(),
            FieldValue::list(record.owners.iter().cloned()),
        );
    }
    for (name, value) in [
        (PROP_CREATOR, &record.creator),
        (PROP_ITERATION, &record.iteration),
        (PROP_MODULE, &record.module),
    ] {
        if let Some(value) = value {
            doc.properties
                .insert(name.to_string(), FieldValue::text(value.as_str()));
        }
    }

    for (name, value) in &record.custom_fields.typed {
        if RESERVED.contains(&name.as_str()) {
            debug!(
                key = %record.external_key,
                field = %name,
                "custom field shadows a mapped property"
            );
            continue;
        }
        doc.properties.insert(name.clone(), value.clone());
    }
    for (name, value) in &record.custom_fields.unknown {
        if RESERVED.contains(&name.as_str()) || doc.properties.contains_key(name) {
            continue;
        }
        doc.properties
            .insert(name.clone(), FieldValue::Text(value.to_string()));
    }

    doc.content_blocks = record.derived_content.clone();
    doc
}
