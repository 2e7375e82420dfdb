//! Record enrichment.
//!
//! An [`Enricher`] turns a raw upstream record into the record that gets
//! reconciled. [`CompositeEnricher`] runs a list of [`Decorator`]s and an
//! optional [`ContentGenerator`] against a private copy of the record and
//! only hands the copy back when every step succeeded.

use crate::error::{SyncError, SyncResult};
use storysync_core::{BlockKind, ContentBlock, Record};
use tracing::debug;

/// Produces the record to reconcile.
pub trait Enricher: Send + Sync {
    /// Enriches one record.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Enrichment`] if any part of enrichment failed.
    fn enrich(&self, record: &Record) -> SyncResult<Record>;
}

/// Adds supplementary data to a record (labels, comments, attachments).
pub trait Decorator: Send + Sync {
    /// Short name used in failure messages.
    fn name(&self) -> &str;

    /// Mutates the working copy.
    fn decorate(&self, record: &mut Record) -> Result<(), String>;
}

/// Derives content blocks from a record.
pub trait ContentGenerator: Send + Sync {
    /// Generates the record's content blocks.
    fn generate(&self, record: &Record) -> Result<Vec<ContentBlock>, String>;
}

/// Adapts a closure into a [`Decorator`].
pub struct FnDecorator<F> {
    name: String,
    f: F,
}

impl<F> FnDecorator<F>
where
    F: Fn(&mut Record) -> Result<(), String> + Send + Sync,
{
    /// Wraps `f` under `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Decorator for FnDecorator<F>
where
    F: Fn(&mut Record) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn decorate(&self, record: &mut Record) -> Result<(), String> {
        (self.f)(record)
    }
}

/// Runs decorators, then the content generator, all-or-nothing.
#[derive(Default)]
pub struct CompositeEnricher {
    decorators: Vec<Box<dyn Decorator>>,
    generator: Option<Box<dyn ContentGenerator>>,
}

impl CompositeEnricher {
    /// Creates an enricher that returns records unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an enricher using the rule-based content generator.
    pub fn rule_based() -> Self {
        Self::new().with_generator(RuleBasedGenerator)
    }

    /// Appends a decorator.
    #[must_use]
    pub fn with_decorator(mut self, decorator: impl Decorator + 'static) -> Self {
        self.decorators.push(Box::new(decorator));
        self
    }

    /// Sets the content generator.
    #[must_use]
    pub fn with_generator(mut self, generator: impl ContentGenerator + 'static) -> Self {
        self.generator = Some(Box::new(generator));
        self
    }
}

impl Enricher for CompositeEnricher {
    fn enrich(&self, record: &Record) -> SyncResult<Record> {
        let key = &record.external_key;
        let mut working = record.clone();

        for decorator in &self.decorators {
            decorator.decorate(&mut working).map_err(|cause| {
                SyncError::enrichment(key, format!("{}: {cause}", decorator.name()))
            })?;
        }

        if let Some(generator) = &self.generator {
            working.derived_content = generator
                .generate(&working)
                .map_err(|cause| SyncError::enrichment(key, format!("content: {cause}")))?;
        }

        debug!(
            key = %key,
            decorators = self.decorators.len(),
            blocks = working.derived_content.len(),
            "record enriched"
        );
        Ok(working)
    }
}

const MAX_GOALS: usize = 5;
const MAX_ACCEPTANCE: usize = 10;
const MAX_FEATURE_POINTS: usize = 20;
const FEATURE_POINT_LIMIT: usize = 300;
const SUMMARY_CHARS: usize = 200;

/// Keyword-driven content generator.
///
/// Splits the description into points and sorts them into goal, acceptance
/// and feature sections. The description itself is emitted as upstream
/// content; every other section is derived.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedGenerator;

impl RuleBasedGenerator {
    /// Splits text on line breaks, `;`, `；` and `。`, trimming bullets.
    pub fn split_points(text: &str) -> Vec<String> {
        text.split(['\n', '\r', ';', '；', '。'])
            .map(|s| s.trim_matches(|c| matches!(c, ' ' | '-' | '•' | '*' | '\t')))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn is_goal(point: &str) -> bool {
        let lower = point.to_lowercase();
        ["目标", "目的", "期望", "so that"]
            .iter()
            .any(|k| lower.contains(k))
            || (lower.starts_with("as ") && lower.contains("i want"))
    }

    fn is_acceptance(point: &str) -> bool {
        let lower = point.to_lowercase();
        ["验收", "ac:", "acceptance", "criteria"]
            .iter()
            .any(|k| lower.contains(k))
    }

    fn summary(description: &str) -> String {
        let mut chars = description.chars();
        let head: String = chars.by_ref().take(SUMMARY_CHARS).collect();
        if chars.next().is_some() {
            format!("{head}...")
        } else {
            head
        }
    }
}

fn section(blocks: &mut Vec<ContentBlock>, title: &str, items: &[&String]) {
    if items.is_empty() {
        return;
    }
    blocks.push(ContentBlock::derived(BlockKind::Heading, title));
    blocks.extend(
        items
            .iter()
            .map(|item| ContentBlock::derived(BlockKind::BulletedItem, item.as_str())),
    );
}

impl ContentGenerator for RuleBasedGenerator {
    fn generate(&self, record: &Record) -> Result<Vec<ContentBlock>, String> {
        let points = Self::split_points(&record.description);
        let mut blocks = Vec::new();

        if !points.is_empty() {
            blocks.push(ContentBlock::upstream(BlockKind::Heading, "Description"));
            blocks.extend(
                points
                    .iter()
                    .map(|p| ContentBlock::upstream(BlockKind::Paragraph, p.as_str())),
            );
        }

        let goals: Vec<&String> = points
            .iter()
            .filter(|p| Self::is_goal(p))
            .take(MAX_GOALS)
            .collect();
        let acceptance: Vec<&String> = points
            .iter()
            .filter(|p| Self::is_acceptance(p))
            .take(MAX_ACCEPTANCE)
            .collect();
        let features: Vec<&String> = points
            .iter()
            .filter(|p| p.chars().count() < FEATURE_POINT_LIMIT)
            .take(MAX_FEATURE_POINTS)
            .collect();

        section(&mut blocks, "Goals", &goals);
        section(&mut blocks, "Acceptance Criteria", &acceptance);
        if !record.description.is_empty() {
            blocks.push(ContentBlock::derived(BlockKind::Heading, "Summary"));
            blocks.push(ContentBlock::derived(
                BlockKind::Quote,
                Self::summary(&record.description),
            ));
        }
        section(&mut blocks, "Feature Points", &features);

        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use storysync_core::BlockOrigin;

    fn record(description: &str) -> Record {
        Record::new("A", "Checkout", Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
            .with_description(description)
    }

    fn texts(blocks: &[ContentBlock]) -> Vec<&str> {
        blocks.iter().map(|b| b.text.as_str()).collect()
    }

    #[test]
    fn split_points_on_mixed_punctuation() {
        let points = RuleBasedGenerator::split_points("- first\n* second；third。 fourth;\n\n");
        assert_eq!(points, vec!["first", "second", "third", "fourth"]);
        assert!(RuleBasedGenerator::split_points("  \n ").is_empty());
    }

    #[test]
    fn generator_builds_sections() {
        let description = "As a buyer I want saved cards so that checkout is faster\n\
                           AC: card is remembered\n\
                           support three card brands";
        let blocks = RuleBasedGenerator.generate(&record(description)).unwrap();
        let text = texts(&blocks);

        assert_eq!(text[0], "Description");
        assert!(text.contains(&"Goals"));
        assert!(text.contains(&"Acceptance Criteria"));
        assert!(text.contains(&"Summary"));
        assert!(text.contains(&"Feature Points"));

        let upstream = blocks
            .iter()
            .filter(|b| b.origin == BlockOrigin::Upstream)
            .count();
        assert_eq!(upstream, 4);
    }

    #[test]
    fn summary_truncates_long_descriptions() {
        let long = "x".repeat(250);
        assert_eq!(RuleBasedGenerator::summary(&long).chars().count(), 203);
        assert!(RuleBasedGenerator::summary(&long).ends_with("..."));
        assert_eq!(RuleBasedGenerator::summary("short"), "short");
    }

    #[test]
    fn empty_description_generates_nothing() {
        assert!(RuleBasedGenerator.generate(&record("")).unwrap().is_empty());
    }

    #[test]
    fn feature_points_are_capped() {
        let description = (0..30).map(|i| format!("point {i}")).collect::<Vec<_>>().join("\n");
        let blocks = RuleBasedGenerator.generate(&record(&description)).unwrap();
        let heading = blocks.iter().position(|b| b.text == "Feature Points").unwrap();
        assert_eq!(blocks.len() - heading - 1, MAX_FEATURE_POINTS);
    }

    #[test]
    fn composite_applies_decorators_in_order() {
        let enricher = CompositeEnricher::new()
            .with_decorator(FnDecorator::new("labels", |r: &mut Record| {
                r.status = Some("labelled".into());
                Ok(())
            }))
            .with_decorator(FnDecorator::new("comments", |r: &mut Record| {
                r.status = r.status.take().map(|s| format!("{s}+commented"));
                Ok(())
            }));

        let enriched = enricher.enrich(&record("")).unwrap();
        assert_eq!(enriched.status.as_deref(), Some("labelled+commented"));
    }

    #[test]
    fn any_failure_fails_the_whole_enrichment() {
        let enricher = CompositeEnricher::rule_based()
            .with_decorator(FnDecorator::new("labels", |r: &mut Record| {
                r.status = Some("labelled".into());
                Ok(())
            }))
            .with_decorator(FnDecorator::new("attachments", |_: &mut Record| {
                Err("attachment service unavailable".to_string())
            }));

        let raw = record("goal: ship it");
        match enricher.enrich(&raw).unwrap_err() {
            SyncError::Enrichment { key, cause } => {
                assert_eq!(key.as_str(), "A");
                assert!(cause.starts_with("attachments:"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(raw.status.is_none());
    }
}
