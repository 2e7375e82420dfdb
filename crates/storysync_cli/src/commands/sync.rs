//! Sync command implementation.

use super::OutputFormat;
use crate::adapters::{load_snapshot, JsonFileDestination};
use clap::{Args, ValueEnum};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;
use storysync_core::{read_cursor_dir, ExternalKey};
use storysync_engine::{
    split_csv, BatchRunner, CompositeEnricher, CreationGuard, Filters, Invocation,
    IterationFilter, OperationClass, RetryConfig, RunRequest, RunStatus, RunSummary,
    SafetyGate, Scope, SyncConfig,
};

/// Invocation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// List everything and upsert
    Full,
    /// List changes since the watermark and upsert
    Incremental,
    /// Only create missing documents
    InsertOnly,
    /// Only update existing documents
    UpdateOnly,
    /// Archive the destination, then rebuild
    WipeRebuild,
}

/// Arguments of `storysync sync`.
#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Upstream snapshot file (JSON)
    #[arg(long, env = "STORYSYNC_SOURCE")]
    pub source: PathBuf,

    /// Destination store file (JSON)
    #[arg(long, env = "STORYSYNC_DESTINATION")]
    pub destination: PathBuf,

    /// Invocation mode
    #[arg(short, long, value_enum, default_value = "incremental")]
    pub mode: Mode,

    /// Comma-separated keys to sync directly; overrides --mode
    #[arg(long, conflicts_with = "retry_failed")]
    pub ids: Option<String>,

    /// Re-sync every key recorded as failed in the cursor
    #[arg(long)]
    pub retry_failed: bool,

    /// With update-only, create documents that do not exist yet
    #[arg(long)]
    pub create_missing: bool,

    /// Comma-separated owner names (substring match)
    #[arg(long, env = "STORYSYNC_OWNER")]
    pub owner: Option<String>,

    /// Creator name
    #[arg(long, env = "STORYSYNC_CREATOR")]
    pub creator: Option<String>,

    /// Iteration id, or "current"
    #[arg(long, env = "STORYSYNC_ITERATION")]
    pub iteration: Option<String>,

    /// Module name
    #[arg(long, env = "STORYSYNC_MODULE")]
    pub module: Option<String>,

    /// Worker threads
    #[arg(long, env = "STORYSYNC_CONCURRENCY", default_value_t = 2)]
    pub concurrency: usize,

    /// Attempts per call before giving up
    #[arg(long, env = "STORYSYNC_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// Cancel the run after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Perform writes (default is a dry run)
    #[arg(long)]
    pub execute: bool,

    /// Acknowledgment phrase for writes
    #[arg(long)]
    pub ack: Option<String>,

    /// Allow destructive operations over all records
    #[arg(long)]
    pub allow_unscoped: bool,

    /// Overwrite downstream-owned fields and derived content
    #[arg(long)]
    pub regenerate_derived: bool,

    /// Only create documents for these owners (comma-separated)
    #[arg(long, env = "STORYSYNC_GUARD_OWNER")]
    pub guard_owner: Option<String>,

    /// Only create documents in this iteration
    #[arg(long, env = "STORYSYNC_GUARD_ITERATION")]
    pub guard_iteration: Option<String>,

    /// Do not refresh tracked keys missing from the listing
    #[arg(long)]
    pub no_track_existing: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl SyncArgs {
    /// Builds the engine configuration.
    pub fn config(&self) -> SyncConfig {
        let mut guard = CreationGuard::none();
        if let Some(owners) = &self.guard_owner {
            guard = guard.with_owners(split_csv(owners));
        }
        if let Some(iteration) = &self.guard_iteration {
            guard = guard.with_iteration(iteration.as_str());
        }

        let mut config = SyncConfig::new()
            .with_concurrency(self.concurrency)
            .with_retry(RetryConfig::new(self.max_attempts))
            .with_track_existing(!self.no_track_existing)
            .with_regenerate_derived(self.regenerate_derived)
            .with_creation_guard(guard)
            .with_dry_run(!self.execute);
        if let Some(secs) = self.timeout_secs {
            config = config.with_run_timeout(Duration::from_secs(secs));
        }
        config
    }

    /// Builds the filters.
    pub fn filters(&self) -> Filters {
        let mut filters = Filters::new();
        if let Some(owners) = &self.owner {
            filters = filters.with_owners(owners);
        }
        if let Some(creator) = &self.creator {
            filters = filters.with_creator(creator.as_str());
        }
        if let Some(iteration) = self.iteration.as_deref().map(str::trim) {
            filters = filters.with_iteration(match iteration {
                "" => IterationFilter::Any,
                "current" => IterationFilter::Current,
                id => IterationFilter::Id(id.to_string()),
            });
        }
        if let Some(module) = &self.module {
            filters = filters.with_module(module.as_str());
        }
        filters
    }

    /// Chooses the invocation. `failed` supplies keys for `--retry-failed`.
    pub fn invocation<E>(
        &self,
        failed: impl FnOnce() -> Result<Vec<ExternalKey>, E>,
    ) -> Result<Invocation, E> {
        if let Some(ids) = &self.ids {
            let keys = split_csv(ids).into_iter().map(ExternalKey::new).collect();
            return Ok(Invocation::ExplicitIds(keys));
        }
        if self.retry_failed {
            return failed().map(Invocation::ExplicitIds);
        }
        Ok(match self.mode {
            Mode::Full => Invocation::FullRebuild,
            Mode::Incremental => Invocation::Incremental,
            Mode::InsertOnly => Invocation::InsertOnly,
            Mode::UpdateOnly => Invocation::UpdateOnly {
                create_missing: self.create_missing,
            },
            Mode::WipeRebuild => Invocation::WipeAndRebuild,
        })
    }

    /// The gate class of this invocation, known without reading any file.
    pub fn operation_class(&self) -> OperationClass {
        if !self.execute {
            return OperationClass::ReadOnly;
        }
        match self.invocation(|| Ok::<_, Infallible>(Vec::new())) {
            Ok(invocation) => invocation.plan().class,
            Err(never) => match never {},
        }
    }
}

/// Runs the sync command.
///
/// The safety gate is checked before the snapshot, the store or the cursor
/// is read. The runner checks it again with the final scope.
pub fn run(cursor_dir: &Path, args: &SyncArgs) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let gate = SafetyGate::new().allow_unscoped(args.allow_unscoped);
    gate.check(
        args.operation_class(),
        &Scope::from_filters(&args.filters()),
        args.ack.as_deref(),
    )
    .into_result()?;

    let invocation = args.invocation(|| {
        read_cursor_dir(cursor_dir).map(|cursor| cursor.failed_keys.into_keys().collect())
    })?;
    if matches!(&invocation, Invocation::ExplicitIds(ids) if ids.is_empty()) {
        println!("Nothing to sync: no ids selected");
        return Ok(RunStatus::Success);
    }

    let upstream = load_snapshot(&args.source)?;
    let destination = JsonFileDestination::open(&args.destination)?;
    let enricher = CompositeEnricher::rule_based();

    let mut request = RunRequest::new(invocation).with_filters(args.filters());
    request.ack = args.ack.clone();

    let config = args.config();
    if config.dry_run {
        println!("(dry run - pass --execute to write)");
    }
    let runner = BatchRunner::new(config, &upstream, &destination, &enricher).with_gate(gate);
    let summary = runner.run(cursor_dir, &request);

    print_summary(&summary, args.format)?;
    Ok(summary.status)
}

fn print_summary(
    summary: &RunSummary,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("Run {} ({})", summary.run_id, summary.mode);
    println!("  Status:      {:?}", summary.status);
    println!("  Created:     {}", summary.created);
    println!("  Updated:     {}", summary.updated);
    println!("  Skipped:     {}", summary.skipped);
    println!("  Filtered:    {}", summary.filtered);
    println!("  Failed:      {}", summary.failed);
    println!("  Unprocessed: {}", summary.unprocessed);
    println!("  Elapsed:     {} ms", summary.elapsed_ms);
    println!(
        "  Watermark:   {} -> {}",
        fmt_watermark(summary.watermark_before),
        fmt_watermark(summary.watermark_after)
    );
    if let Some(fatal) = &summary.fatal {
        println!("  Fatal:       {fatal}");
    }
    for failure in &summary.failures {
        let key = failure
            .key
            .as_ref()
            .map_or_else(|| "<unknown>".to_string(), ToString::to_string);
        println!("    {key} [{:?}] {}", failure.stage, failure.cause);
    }
    Ok(())
}

fn fmt_watermark(at: Option<storysync_core::Timestamp>) -> String {
    at.map_or_else(|| "none".to_string(), |t| t.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use storysync_core::CoreError;
    use storysync_engine::{SyncError, DESTRUCTIVE_ACK, WRITE_ACK};
    use tempfile::tempdir;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: SyncArgs,
    }

    fn parse(extra: &[&str]) -> SyncArgs {
        let mut argv = vec!["sync", "--source", "in.json", "--destination", "out.json"];
        argv.extend_from_slice(extra);
        Wrapper::try_parse_from(argv).unwrap().args
    }

    fn no_failed() -> Result<Vec<ExternalKey>, Infallible> {
        Ok(Vec::new())
    }

    #[test]
    fn defaults_to_incremental_dry_run() {
        let args = parse(&[]);
        assert_eq!(args.invocation(no_failed).unwrap(), Invocation::Incremental);
        let config = args.config();
        assert!(config.dry_run);
        assert_eq!(config.concurrency, 2);
        assert!(config.creation_guard.is_open());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let argv = [
            "sync",
            "--source",
            "in.json",
            "--destination",
            "out.json",
            "--format",
            "yaml",
        ];
        assert!(Wrapper::try_parse_from(argv).is_err());
        assert_eq!(parse(&["--format", "json"]).format, OutputFormat::Json);
    }

    #[test]
    fn ids_override_mode() {
        let args = parse(&["--mode", "full", "--ids", "7, 9,,"]);
        assert_eq!(
            args.invocation(no_failed).unwrap(),
            Invocation::ExplicitIds(vec![ExternalKey::new("7"), ExternalKey::new("9")])
        );
    }

    #[test]
    fn retry_failed_uses_cursor_keys() {
        let args = parse(&["--retry-failed"]);
        let invocation = args
            .invocation(|| Ok::<_, Infallible>(vec![ExternalKey::new("3")]))
            .unwrap();
        assert_eq!(invocation, Invocation::ExplicitIds(vec![ExternalKey::new("3")]));
    }

    #[test]
    fn filters_and_guard_from_flags() {
        let args = parse(&[
            "--owner",
            "alice, bob",
            "--iteration",
            "current",
            "--guard-owner",
            "alice",
            "--execute",
            "--timeout-secs",
            "30",
        ]);
        let filters = args.filters();
        assert_eq!(filters.owners, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(filters.iteration, IterationFilter::Current);

        let config = args.config();
        assert!(!config.dry_run);
        assert!(!config.creation_guard.is_open());
        assert_eq!(config.run_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn update_only_carries_create_missing() {
        let args = parse(&["--mode", "update-only", "--create-missing"]);
        assert_eq!(
            args.invocation(no_failed).unwrap(),
            Invocation::UpdateOnly {
                create_missing: true
            }
        );
    }

    #[test]
    fn end_to_end_against_files() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("snapshot.json");
        let store = temp.path().join("store.json");
        std::fs::write(
            &source,
            r#"[{"external_key":"1","title":"a","updated_at":"2024-05-01T10:00:00Z"},
                {"external_key":"2","title":"b","updated_at":"2024-05-01T10:05:00Z"}]"#,
        )
        .unwrap();

        let args = Wrapper::try_parse_from([
            "sync",
            "--source",
            source.to_str().unwrap(),
            "--destination",
            store.to_str().unwrap(),
            "--execute",
            "--ack",
            WRITE_ACK,
        ])
        .unwrap()
        .args;
        let cursor_dir = temp.path().join("cursor");

        assert_eq!(run(&cursor_dir, &args).unwrap(), RunStatus::Success);
        assert_eq!(JsonFileDestination::open(&store).unwrap().len(), 2);
        assert_eq!(
            read_cursor_dir(&cursor_dir).unwrap().tracked_keys.len(),
            2
        );
    }

    #[test]
    fn operation_class_follows_mode_and_execute() {
        assert_eq!(
            parse(&["--mode", "wipe-rebuild"]).operation_class(),
            OperationClass::ReadOnly
        );
        assert_eq!(
            parse(&["--mode", "wipe-rebuild", "--execute"]).operation_class(),
            OperationClass::Destructive
        );
        assert_eq!(
            parse(&["--retry-failed", "--execute"]).operation_class(),
            OperationClass::AdditiveWrite
        );
    }

    #[test]
    fn missing_ack_is_denied_before_reading_files() {
        let temp = tempdir().unwrap();
        let args = Wrapper::try_parse_from([
            "sync",
            "--source",
            temp.path().join("absent.json").to_str().unwrap(),
            "--destination",
            temp.path().join("store.json").to_str().unwrap(),
            "--execute",
        ])
        .unwrap()
        .args;

        let err = run(&temp.path().join("cursor"), &args).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::GateDenied(_))
        ));
        assert!(!temp.path().join("cursor").exists());
        assert!(!temp.path().join("store.json").exists());
    }

    #[test]
    fn unscoped_wipe_is_denied_even_with_ack() {
        let temp = tempdir().unwrap();
        let args = Wrapper::try_parse_from([
            "sync",
            "--source",
            temp.path().join("absent.json").to_str().unwrap(),
            "--destination",
            temp.path().join("store.json").to_str().unwrap(),
            "--mode",
            "wipe-rebuild",
            "--execute",
            "--ack",
            DESTRUCTIVE_ACK,
        ])
        .unwrap()
        .args;

        let err = run(&temp.path().join("cursor"), &args).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::GateDenied(_))
        ));
    }

    #[test]
    fn retry_failed_with_corrupt_cursor_is_an_error() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("snapshot.json");
        std::fs::write(&source, "[]").unwrap();
        let cursor_dir = temp.path().join("cursor");
        std::fs::create_dir_all(&cursor_dir).unwrap();
        std::fs::write(cursor_dir.join("cursor.json"), "{not json").unwrap();

        let args = Wrapper::try_parse_from([
            "sync",
            "--source",
            source.to_str().unwrap(),
            "--destination",
            temp.path().join("store.json").to_str().unwrap(),
            "--retry-failed",
        ])
        .unwrap()
        .args;

        let err = run(&cursor_dir, &args).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn retry_failed_without_cursor_has_nothing_to_do() {
        let temp = tempdir().unwrap();
        let args = parse(&["--retry-failed"]);
        let status = run(&temp.path().join("cursor"), &args).unwrap();
        assert_eq!(status, RunStatus::Success);
    }
}
