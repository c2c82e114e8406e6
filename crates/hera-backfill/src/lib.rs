//! Backfill orchestration: configuration, registry, the paging loop and run reports.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hera_adapters::{DocumentStore, MongoDocumentStore, PageQuery, WriteOptions};
use hera_core::{
    CursorRecord, Derivation, DerivationKind, FieldLayout, PagePlan, RunTotals, SourceDocument,
    WorkItem,
};
use hera_storage::{with_backoff, BackoffPolicy, CheckpointStore, FileCheckpointStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hera-backfill";

/// Knobs for a single run of the paging loop.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub page_size: usize,
    pub chunk_size: usize,
    pub delay: Duration,
    /// Pages this run may process before stopping early.
    pub max_rounds: Option<u64>,
    /// Overrides the persisted cursor key for this run only.
    pub start_after: Option<String>,
    pub max_runtime: Option<Duration>,
    pub dry_run: bool,
    pub backoff: BackoffPolicy,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            page_size: 500,
            chunk_size: 500,
            delay: Duration::from_millis(100),
            max_rounds: None,
            start_after: None,
            max_runtime: None,
            dry_run: false,
            backoff: BackoffPolicy::none(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub mongodb_uri: String,
    pub mongodb_database: String,
    pub registry_path: PathBuf,
    pub cursor_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub settings: RunSettings,
}

impl BackfillConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let defaults = RunSettings::default();

        Self {
            mongodb_uri: lookup("MONGODB_URI")
                .unwrap_or_else(|| "mongodb://localhost:27017".to_string()),
            mongodb_database: lookup("MONGODB_DATABASE").unwrap_or_else(|| "hera".to_string()),
            registry_path: lookup("HERA_BACKFILL_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./backfills.yaml")),
            cursor_dir: lookup("HERA_BACKFILL_CURSOR_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state")),
            reports_dir: lookup("HERA_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            settings: RunSettings {
                page_size: number("HERA_BACKFILL_PAGE_SIZE", defaults.page_size as u64).max(1)
                    as usize,
                chunk_size: number("HERA_BACKFILL_CHUNK_SIZE", defaults.chunk_size as u64).max(1)
                    as usize,
                delay: Duration::from_millis(number("HERA_BACKFILL_DELAY_MS", 100)),
                max_rounds: Some(number("HERA_BACKFILL_MAX_ROUNDS", 0)).filter(|n| *n > 0),
                start_after: lookup("HERA_BACKFILL_START_AFTER").filter(|v| !v.trim().is_empty()),
                max_runtime: Some(number("HERA_BACKFILL_MAX_RUNTIME_SECS", 0))
                    .filter(|n| *n > 0)
                    .map(Duration::from_secs),
                dry_run: false,
                backoff: BackoffPolicy::with_retries(number("HERA_BACKFILL_MAX_RETRIES", 0) as usize),
            },
        }
    }
}

/// Command-line overrides layered over [`BackfillConfig::settings`].
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub page_size: Option<usize>,
    pub chunk_size: Option<usize>,
    pub max_rounds: Option<u64>,
    pub start_after: Option<String>,
    pub dry_run: bool,
}

impl RunOverrides {
    pub fn apply(self, mut settings: RunSettings) -> RunSettings {
        if let Some(page_size) = self.page_size {
            settings.page_size = page_size.max(1);
        }
        if let Some(chunk_size) = self.chunk_size {
            settings.chunk_size = chunk_size.max(1);
        }
        if let Some(max_rounds) = self.max_rounds {
            settings.max_rounds = Some(max_rounds).filter(|n| *n > 0);
        }
        if self.start_after.is_some() {
            settings.start_after = self.start_after;
        }
        settings.dry_run |= self.dry_run;
        settings
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillRegistry {
    pub backfills: Vec<BackfillDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillDefinition {
    pub name: String,
    pub collection: String,
    pub id_field: String,
    pub source_field: String,
    pub target_field: String,
    pub derivation: DerivationKind,
    #[serde(default)]
    pub label_keys: Option<Vec<String>>,
    #[serde(default)]
    pub index_target: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl BackfillDefinition {
    pub fn layout(&self) -> FieldLayout {
        FieldLayout::new(&self.id_field, &self.source_field, &self.target_field)
    }

    pub fn derivation(&self) -> Derivation {
        let derivation = Derivation::new(self.derivation);
        match &self.label_keys {
            Some(keys) => derivation.with_label_keys(keys.clone()),
            None => derivation,
        }
    }
}

impl BackfillRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        let mut seen = BTreeSet::new();
        for definition in &registry.backfills {
            if !seen.insert(definition.name.as_str()) {
                bail!("backfill `{}` is declared twice", definition.name);
            }
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Result<&BackfillDefinition> {
        self.backfills
            .iter()
            .find(|b| b.name == name)
            .with_context(|| format!("no backfill named `{name}` in registry"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A query returned no pending documents; the cursor was removed.
    Completed,
    RoundLimit,
    MaxRuntime,
    Interrupted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Completed => "completed",
            Self::RoundLimit => "round limit reached",
            Self::MaxRuntime => "max runtime reached",
            Self::Interrupted => "interrupted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillReport {
    pub run_id: Uuid,
    pub backfill: String,
    pub store: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stop_reason: StopReason,
    pub dry_run: bool,
    pub resumed_from: Option<String>,
    pub totals: RunTotals,
    /// Cursor left behind for the next run; `None` once the scan completed.
    pub cursor: Option<CursorRecord>,
    pub index_created: bool,
    pub elapsed_ms: u64,
    pub docs_per_sec: f64,
}

pub struct BackfillEngine {
    definition: BackfillDefinition,
    settings: RunSettings,
    store: Arc<dyn DocumentStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    stop: Option<watch::Receiver<bool>>,
}

impl BackfillEngine {
    pub fn new(
        definition: BackfillDefinition,
        settings: RunSettings,
        store: Arc<dyn DocumentStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            definition,
            settings,
            store,
            checkpoints,
            stop: None,
        }
    }

    /// A `true` on this channel stops the run at the next page boundary.
    pub fn with_stop_signal(mut self, stop: Option<watch::Receiver<bool>>) -> Self {
        self.stop = stop;
        self
    }

    pub async fn run(&self) -> Result<BackfillReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("backfill", %run_id, backfill = %self.definition.name);
        self.run_pages(run_id).instrument(span).await
    }

    async fn run_pages(&self, run_id: Uuid) -> Result<BackfillReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let layout = self.definition.layout();
        let derivation = self.definition.derivation();
        let dry_run = self.settings.dry_run;
        let mut stop = self.stop.clone();

        let persisted = self
            .checkpoints
            .load()
            .await
            .context("loading backfill cursor")?;
        let (base_round, base_updated, base_skipped) = persisted
            .as_ref()
            .map(|c| (c.round, c.total_updated, c.total_skipped))
            .unwrap_or_default();
        let mut last_key = self
            .settings
            .start_after
            .clone()
            .or_else(|| persisted.as_ref().map(|c| c.last_key.clone()));
        let resumed_from = last_key.clone();
        let mut cursor = persisted;
        let mut totals = RunTotals::default();

        info!(
            store = %self.store.describe(),
            resumed_from = resumed_from.as_deref().unwrap_or("<start>"),
            page_size = self.settings.page_size,
            dry_run,
            "starting backfill"
        );

        let stop_reason = loop {
            let query = PageQuery {
                layout: layout.clone(),
                after: last_key.clone(),
                limit: self.settings.page_size,
            };
            let store = self.store.as_ref();
            let docs = with_backoff(&self.settings.backoff, "find_pending", || {
                store.find_pending(&query)
            })
            .await
            .with_context(|| {
                format!(
                    "querying pending documents after {}",
                    last_key.as_deref().unwrap_or("<start>")
                )
            })?;

            if docs.is_empty() {
                if !dry_run {
                    if let Err(err) = self.checkpoints.clear().await {
                        warn!(error = %err, "failed to remove completed cursor");
                    }
                    cursor = None;
                }
                break StopReason::Completed;
            }

            let page_max = check_page_order(last_key.as_deref(), &docs)?;
            let plan = PagePlan::build(&docs, &derivation);
            for (id, reason) in &plan.skips {
                debug!(%id, ?reason, "skipped");
            }
            let modified = if dry_run {
                plan.updates.len() as u64
            } else {
                self.write_updates(&layout, &plan.updates).await?
            };
            totals.record_page(docs.len(), &plan, modified);

            let record = CursorRecord {
                last_key: page_max.to_string(),
                round: base_round + totals.rounds,
                total_updated: base_updated + totals.updated,
                total_skipped: base_skipped + totals.skipped(),
                last_updated_at: Utc::now(),
            };
            if !dry_run {
                if let Err(err) = self.checkpoints.save(&record).await {
                    warn!(
                        error = %err,
                        last_key = %record.last_key,
                        "failed to persist cursor; continuing with in-memory position"
                    );
                }
            }
            info!(
                round = record.round,
                first_key = %docs[0].id,
                last_key = %record.last_key,
                fetched = docs.len(),
                pending = plan.updates.len(),
                modified,
                skipped_uncomputable = plan.skipped_uncomputable,
                skipped_unchanged = plan.skipped_unchanged,
                "page processed"
            );
            last_key = Some(record.last_key.clone());
            if !dry_run {
                cursor = Some(record);
            }

            if self
                .settings
                .max_rounds
                .is_some_and(|limit| totals.rounds >= limit)
            {
                break StopReason::RoundLimit;
            }
            if stop_requested(&stop) {
                break StopReason::Interrupted;
            }
            if self
                .settings
                .max_runtime
                .is_some_and(|max| clock.elapsed() >= max)
            {
                break StopReason::MaxRuntime;
            }
            if !self.settings.delay.is_zero() {
                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(self.settings.delay) => false,
                    _ = stop_signalled(&mut stop) => true,
                };
                if interrupted {
                    break StopReason::Interrupted;
                }
            }
        };

        let index_created = self.ensure_target_index(&layout).await;
        let elapsed = clock.elapsed();
        let docs_per_sec = totals.scanned as f64 / elapsed.as_secs_f64().max(0.001);

        info!(
            %stop_reason,
            rounds = totals.rounds,
            updated = totals.updated,
            skipped = totals.skipped(),
            elapsed_ms = elapsed.as_millis() as u64,
            docs_per_sec,
            "backfill finished"
        );

        Ok(BackfillReport {
            run_id,
            backfill: self.definition.name.clone(),
            store: self.store.describe(),
            started_at,
            finished_at: Utc::now(),
            stop_reason,
            dry_run,
            resumed_from,
            totals,
            cursor,
            index_created,
            elapsed_ms: elapsed.as_millis() as u64,
            docs_per_sec,
        })
    }

    /// Submit pending updates in fixed-size unordered chunks; returns the modified count.
    async fn write_updates(&self, layout: &FieldLayout, updates: &[WorkItem]) -> Result<u64> {
        let mut modified = 0;
        let store = self.store.as_ref();
        for chunk in updates.chunks(self.settings.chunk_size.max(1)) {
            let outcome = with_backoff(&self.settings.backoff, "bulk_update", || {
                store.bulk_update(layout, chunk, WriteOptions::relaxed())
            })
            .await
            .with_context(|| {
                format!(
                    "bulk updating {} documents starting at {}",
                    chunk.len(),
                    chunk[0].id
                )
            })?;
            modified += outcome.modified;
        }
        Ok(modified)
    }

    async fn ensure_target_index(&self, layout: &FieldLayout) -> bool {
        if !self.definition.index_target || self.settings.dry_run {
            return false;
        }
        match self.store.create_index(&layout.target_field).await {
            Ok(()) => true,
            Err(err) => {
                warn!(field = %layout.target_field, error = %err, "index creation failed");
                false
            }
        }
    }
}

/// Identifiers must rise strictly within the page and past the previous cursor.
fn check_page_order<'a>(after: Option<&str>, docs: &'a [SourceDocument]) -> Result<&'a str> {
    let (Some(first), Some(last)) = (docs.first(), docs.last()) else {
        bail!("page has no documents");
    };
    if let Some(after) = after {
        if first.id.as_str() <= after {
            bail!(
                "store returned `{}` after cursor `{after}`; identifiers must be strictly ascending",
                first.id
            );
        }
    }
    if let Some(pair) = docs.windows(2).find(|pair| pair[1].id <= pair[0].id) {
        bail!(
            "store returned `{}` after `{}`; identifiers must be strictly ascending",
            pair[1].id,
            pair[0].id
        );
    }
    Ok(last.id.as_str())
}

fn stop_requested(stop: &Option<watch::Receiver<bool>>) -> bool {
    stop.as_ref().is_some_and(|rx| *rx.borrow())
}

async fn stop_signalled(stop: &mut Option<watch::Receiver<bool>>) {
    match stop {
        Some(rx) => {
            if rx.wait_for(|requested| *requested).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Persist `backfill_report.json` + `brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_report(reports_root: &Path, report: &BackfillReport) -> Result<PathBuf> {
    let dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing backfill report")?;
    fs::write(dir.join("backfill_report.json"), json)
        .await
        .context("writing backfill_report.json")?;
    fs::write(dir.join("brief.md"), render_brief(report))
        .await
        .context("writing brief.md")?;
    Ok(dir)
}

/// Write the run artifacts without failing a run whose progress is already saved.
pub async fn record_report(reports_root: &Path, report: &BackfillReport) -> Option<PathBuf> {
    match write_report(reports_root, report).await {
        Ok(dir) => Some(dir),
        Err(err) => {
            warn!(run_id = %report.run_id, error = %err, "failed to write run report");
            None
        }
    }
}

pub fn render_brief(report: &BackfillReport) -> String {
    let cursor = match &report.cursor {
        Some(cursor) => format!("`{}` (round {})", cursor.last_key, cursor.round),
        None => "cleared".to_string(),
    };
    format!(
        "# Backfill `{}`\n\n- Run ID: `{}`\n- Store: {}\n- Started: {}\n- Finished: {}\n- Outcome: {}{}\n- Resumed from: {}\n- Rounds: {}\n- Updated: {}\n- Skipped (uncomputable): {}\n- Skipped (unchanged): {}\n- Throughput: {:.1} docs/sec\n- Cursor: {}\n",
        report.backfill,
        report.run_id,
        report.store,
        report.started_at,
        report.finished_at,
        report.stop_reason,
        if report.dry_run { " (dry run)" } else { "" },
        report.resumed_from.as_deref().unwrap_or("start"),
        report.totals.rounds,
        report.totals.updated,
        report.totals.skipped_uncomputable,
        report.totals.skipped_unchanged,
        report.docs_per_sec,
        cursor,
    )
}

pub fn recent_reports_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut reports = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path().join("backfill_report.json");
            let text = std::fs::read_to_string(&path).ok()?;
            serde_json::from_str::<BackfillReport>(&text).ok()
        })
        .collect::<Vec<_>>();
    reports.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Héra Backfill Runs".to_string(), String::new()];
    for report in reports.into_iter().take(runs.max(1)) {
        lines.push(format!("## `{}` run `{}`", report.backfill, report.run_id));
        lines.push(format!("- started: {}", report.started_at));
        lines.push(format!("- outcome: {}", report.stop_reason));
        lines.push(format!(
            "- updated: {} / skipped: {} over {} rounds",
            report.totals.updated,
            report.totals.skipped(),
            report.totals.rounds
        ));
        if report.dry_run {
            lines.push("- dry run".to_string());
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillStatus {
    pub backfill: String,
    pub cursor_path: PathBuf,
    pub cursor: Option<CursorRecord>,
    pub pending: Option<u64>,
}

fn load_definition(config: &BackfillConfig, name: &str) -> Result<BackfillDefinition> {
    let registry = BackfillRegistry::load(&config.registry_path)?;
    Ok(registry.get(name)?.clone())
}

async fn connect_store(
    config: &BackfillConfig,
    definition: &BackfillDefinition,
) -> Result<MongoDocumentStore> {
    MongoDocumentStore::connect(
        &config.mongodb_uri,
        &config.mongodb_database,
        &definition.collection,
    )
    .await
    .with_context(|| format!("connecting to {}", config.mongodb_database))
}

pub async fn run_backfill_from_env(
    name: &str,
    overrides: RunOverrides,
    stop: Option<watch::Receiver<bool>>,
) -> Result<BackfillReport> {
    let config = BackfillConfig::from_env();
    let definition = load_definition(&config, name)?;
    let settings = overrides.apply(config.settings.clone());
    let store = connect_store(&config, &definition).await?;
    let checkpoints = FileCheckpointStore::for_backfill(&config.cursor_dir, &definition.name);

    let engine = BackfillEngine::new(definition, settings, Arc::new(store), Arc::new(checkpoints))
        .with_stop_signal(stop);
    let report = engine.run().await?;
    record_report(&config.reports_dir, &report).await;
    Ok(report)
}

pub async fn backfill_status_from_env(name: &str, count_pending: bool) -> Result<BackfillStatus> {
    let config = BackfillConfig::from_env();
    let definition = load_definition(&config, name)?;
    let checkpoints = FileCheckpointStore::for_backfill(&config.cursor_dir, &definition.name);
    let cursor = checkpoints.load().await.context("loading backfill cursor")?;
    let pending = if count_pending {
        let store = connect_store(&config, &definition).await?;
        Some(
            store
                .count_pending(&definition.layout())
                .await
                .context("counting pending documents")?,
        )
    } else {
        None
    };
    Ok(BackfillStatus {
        backfill: definition.name,
        cursor_path: checkpoints.path().to_path_buf(),
        cursor,
        pending,
    })
}

pub async fn reset_cursor_from_env(name: &str) -> Result<PathBuf> {
    let config = BackfillConfig::from_env();
    let definition = load_definition(&config, name)?;
    let checkpoints = FileCheckpointStore::for_backfill(&config.cursor_dir, &definition.name);
    checkpoints.clear().await.context("clearing backfill cursor")?;
    Ok(checkpoints.path().to_path_buf())
}

pub fn list_backfills_from_env() -> Result<Vec<BackfillDefinition>> {
    let config = BackfillConfig::from_env();
    Ok(BackfillRegistry::load(&config.registry_path)?.backfills)
}
