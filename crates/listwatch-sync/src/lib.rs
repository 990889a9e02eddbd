//! Snapshot reconciliation, reporting and the daily sync pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use listwatch_adapters::{adapter_for_source, AdapterContext, ListingTarget};
use listwatch_core::{Change, Listing, PriceHistory, RawListing, Report, Scalar, Snapshot};
use listwatch_storage::{write_atomic, HttpClientConfig, HttpFetcher, ListingStore, PageArchive};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "listwatch-sync";

/// Daily at 07:00. The scheduler takes six fields, seconds first.
pub const DEFAULT_SYNC_CRON: &str = "0 0 7 * * *";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_max_pages() -> usize {
    1
}

pub fn parse_source_registry(text: &str) -> Result<SourceRegistry> {
    serde_yaml::from_str(text).context("parsing source registry")
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub sources_path: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("LISTWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            sources_path: std::env::var("LISTWATCH_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            scheduler_enabled: std::env::var("LISTWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("LISTWATCH_SYNC_CRON")
                .unwrap_or_else(|_| DEFAULT_SYNC_CRON.to_string()),
            user_agent: std::env::var("LISTWATCH_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("LISTWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}

/// Differences between two snapshots, judged against the ledger as it stood
/// before the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: Vec<Listing>,
    pub removed: Vec<Listing>,
    pub price_changed: Vec<Change>,
}

/// Compute added/removed/price-changed without touching the ledger.
///
/// Added is ledger-based: an id counts as new only if no run has ever recorded
/// it. Removed and price-changed compare the two snapshots only.
pub fn diff_snapshots(
    current: &Snapshot,
    previous: &Snapshot,
    ledger: &PriceHistory,
) -> Reconciliation {
    let added = current
        .iter()
        .filter(|listing| !ledger.has_seen(&listing.id))
        .cloned()
        .collect();

    let removed = previous
        .iter()
        .filter(|listing| !current.contains(&listing.id))
        .cloned()
        .collect();

    let price_changed = current
        .iter()
        .filter_map(|now| {
            let before = previous.get(&now.id)?;
            (now.price != before.price).then(|| Change {
                id: now.id.clone(),
                url: now.url.clone(),
                title: now.title.clone(),
                location: now.location.clone(),
                square_meters: now.square_meters.clone(),
                new_price: now.price.clone(),
                old_price: before.price.clone(),
            })
        })
        .collect();

    Reconciliation {
        added,
        removed,
        price_changed,
    }
}

/// Record today's price for every current listing.
pub fn record_observations(ledger: &mut PriceHistory, current: &Snapshot, today: NaiveDate) -> usize {
    let mut appended = 0;
    for listing in current.iter() {
        if ledger.record(&listing.id, listing.price.as_ref(), today) {
            appended += 1;
        }
    }
    appended
}

/// Reconcile today's batch against the previous one and the ledger.
///
/// Returns the run report together with the ledger updated by today's
/// observations. Persisting the ledger is left to the caller.
pub fn reconcile(
    current: &[RawListing],
    previous: &[RawListing],
    ledger: PriceHistory,
    today: NaiveDate,
) -> (Report, PriceHistory) {
    reconcile_snapshots(
        &Snapshot::from_raw(current),
        &Snapshot::from_raw(previous),
        ledger,
        today,
    )
}

/// [`reconcile`] over batches that are already indexed.
pub fn reconcile_snapshots(
    current: &Snapshot,
    previous: &Snapshot,
    mut ledger: PriceHistory,
    today: NaiveDate,
) -> (Report, PriceHistory) {
    let diff = diff_snapshots(current, previous, &ledger);
    let appended = record_observations(&mut ledger, current, today);

    info!(
        %today,
        current = current.len(),
        previous = previous.len(),
        added = diff.added.len(),
        removed = diff.removed.len(),
        price_changed = diff.price_changed.len(),
        ledger_appends = appended,
        "reconciled snapshots"
    );
    if current.malformed_count() > 0 {
        warn!(malformed = current.malformed_count(), "listings without usable id were skipped");
    }

    let report = ReportBuilder::for_snapshot(today, current).build(diff);
    (report, ledger)
}

/// Packages reconciliation output into a [`Report`] and owns its storage names.
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    run_date: NaiveDate,
    total_ads: usize,
    unique_ads: usize,
    malformed_records: usize,
    duplicate_ids: Vec<String>,
}

impl ReportBuilder {
    pub fn for_snapshot(run_date: NaiveDate, current: &Snapshot) -> Self {
        Self {
            run_date,
            total_ads: current.raw_count(),
            unique_ads: current.len(),
            malformed_records: current.malformed_count(),
            duplicate_ids: current.duplicate_ids().to_vec(),
        }
    }

    pub fn build(self, diff: Reconciliation) -> Report {
        Report {
            run_date: self.run_date,
            total_ads: self.total_ads,
            unique_ads: self.unique_ads,
            malformed_records: self.malformed_records,
            duplicate_ids: self.duplicate_ids,
            added: diff.added,
            removed: diff.removed,
            price_changed: diff.price_changed,
        }
    }

    pub fn report_key(run_date: NaiveDate) -> PathBuf {
        PathBuf::from("reports").join(format!("{}.json", run_date.format("%Y-%m-%d")))
    }

    pub fn brief_key(run_date: NaiveDate) -> PathBuf {
        PathBuf::from("reports").join(format!("{}.md", run_date.format("%Y-%m-%d")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceChangeView<'a> {
    pub current: &'a Listing,
    pub previous_price: Option<&'a Scalar>,
}

/// Price changes keyed by id, each paired with the full current listing.
pub fn price_change_views<'a>(
    report: &'a Report,
    current: &'a Snapshot,
) -> BTreeMap<&'a str, PriceChangeView<'a>> {
    report
        .price_changed
        .iter()
        .filter_map(|change| {
            let listing = current.get(&change.id)?;
            Some((
                change.id.as_str(),
                PriceChangeView {
                    current: listing,
                    previous_price: change.old_price.as_ref(),
                },
            ))
        })
        .collect()
}

fn price_label(price: Option<&Scalar>) -> String {
    price
        .map(ToString::to_string)
        .unwrap_or_else(|| "n/a".to_string())
}

fn sort_by_price<T>(items: &mut [T], price: impl Fn(&T) -> Option<&Scalar>) {
    items.sort_by_key(|item| {
        let key = price(item).and_then(Scalar::sort_key);
        (key.is_none(), key)
    });
}

fn listing_line(listing: &Listing) -> String {
    let mut parts = vec![listing.title.clone().unwrap_or_else(|| listing.id.clone())];
    if let Some(location) = &listing.location {
        parts.push(location.clone());
    }
    if let Some(area) = &listing.square_meters {
        parts.push(area.to_string());
    }
    parts.join(" · ")
}

/// Render the Markdown message for new listings and price changes.
pub fn render_notification(
    added: &[Listing],
    price_changes: &BTreeMap<&str, PriceChangeView<'_>>,
) -> String {
    if added.is_empty() && price_changes.is_empty() {
        return "No new listings or price changes.\n".to_string();
    }

    let mut lines = Vec::new();

    if !added.is_empty() {
        let mut added = added.iter().collect::<Vec<_>>();
        sort_by_price(&mut added, |l| l.price.as_ref());
        lines.push(format!("## New listings ({})", added.len()));
        lines.push(String::new());
        for listing in added {
            lines.push(format!(
                "- **{}** · {}",
                price_label(listing.price.as_ref()),
                listing_line(listing)
            ));
            if let Some(url) = &listing.url {
                lines.push(format!("  {url}"));
            }
        }
        lines.push(String::new());
    }

    if !price_changes.is_empty() {
        let mut changes = price_changes.values().collect::<Vec<_>>();
        sort_by_price(&mut changes, |v| v.current.price.as_ref());
        lines.push(format!("## Price changes ({})", changes.len()));
        lines.push(String::new());
        for view in changes {
            lines.push(format!(
                "- **{}** (was {}) · {}",
                price_label(view.current.price.as_ref()),
                price_label(view.previous_price),
                listing_line(view.current)
            ));
            if let Some(url) = &view.current.url {
                lines.push(format!("  {url}"));
            }
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: Report,
    pub previous_date: Option<NaiveDate>,
    pub snapshot_path: PathBuf,
    pub report_path: PathBuf,
    pub brief_path: PathBuf,
}

/// Store today's batch, reconcile it against the preceding snapshot and the
/// ledger, then persist the report, the notification brief and, last, the
/// ledger. A failed report write leaves the stored ledger as it was, so a
/// rerun still sees today's new listings as new.
pub async fn reconcile_and_persist(
    store: &ListingStore,
    today: NaiveDate,
    current: &[RawListing],
) -> Result<RunOutcome> {
    let snapshot_path = store.save_snapshot(today, current).await?;

    let previous_date = match store.previous_snapshot_date(today).await {
        Ok(date) => date,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "snapshot index unavailable; comparing against empty batch");
            None
        }
    };
    let previous = match previous_date {
        Some(date) => store.load_snapshot(date).await,
        None => Vec::new(),
    };
    let ledger = store.load_ledger().await;

    let current = Snapshot::from_raw(current);
    let previous = Snapshot::from_raw(&previous);
    let (report, ledger) = reconcile_snapshots(&current, &previous, ledger, today);

    let report_path = store
        .json()
        .write_json(ReportBuilder::report_key(today), &report)
        .await?;

    let brief = render_notification(&report.added, &price_change_views(&report, &current));
    let brief_path = store.json().path_for(ReportBuilder::brief_key(today));
    write_atomic(&brief_path, brief.as_bytes()).await?;

    store.save_ledger(&ledger).await?;

    Ok(RunOutcome {
        report,
        previous_date,
        snapshot_path,
        report_path,
        brief_path,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub fetched_pages: usize,
    pub archived_pages: usize,
    pub total_ads: usize,
    pub added: usize,
    pub removed: usize,
    pub price_changed: usize,
    pub previous_date: Option<NaiveDate>,
    pub report_path: String,
    pub brief_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: ListingStore,
    archive: PageArchive,
    http: HttpFetcher,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let store = ListingStore::new(config.data_dir.clone());
        let archive = PageArchive::new(config.data_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            archive,
            http,
        })
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_for_date(Local::now().date_naive()).await
    }

    /// Fetch every enabled source and reconcile the combined batch.
    ///
    /// A fetch failure aborts the run before anything is persisted.
    pub async fn run_for_date(&self, today: NaiveDate) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = load_source_registry(&self.config.sources_path).await?;
        let enabled_sources: Vec<_> = registry.sources.into_iter().filter(|s| s.enabled).collect();
        let ctx = AdapterContext {
            run_id,
            fetched_on: today,
        };

        let mut fetched_pages = 0usize;
        let mut archived_pages = 0usize;
        let mut current = Vec::new();

        for source in &enabled_sources {
            let adapter = adapter_for_source(&source.source_id)
                .with_context(|| format!("no adapter registered for {}", source.source_id))?;
            let targets = source
                .listing_urls
                .iter()
                .map(|url| ListingTarget {
                    url: url.clone(),
                    max_pages: source.max_pages,
                })
                .collect::<Vec<_>>();

            let pages = adapter
                .fetch_listing(&self.http, &ctx, &targets)
                .await
                .with_context(|| format!("fetching listings for {}", source.source_id))?;

            for listing_page in pages {
                let archived = self
                    .archive
                    .store_page(today, &source.source_id, &listing_page.page.body)
                    .await?;
                if archived.deduplicated {
                    debug!(
                        source_id = %source.source_id,
                        page_no = listing_page.page.page_no,
                        path = %archived.relative_path.display(),
                        "page already archived"
                    );
                } else {
                    archived_pages += 1;
                }
                fetched_pages += 1;
                current.extend(listing_page.records);
            }
        }

        let outcome = reconcile_and_persist(&self.store, today, &current).await?;
        let finished_at = Utc::now();
        info!(%run_id, fetched_pages, archived_pages, "sync run persisted");

        Ok(SyncRunSummary {
            run_id,
            run_date: today,
            started_at,
            finished_at,
            enabled_sources: enabled_sources.len(),
            fetched_pages,
            archived_pages,
            total_ads: outcome.report.total_ads,
            added: outcome.report.added.len(),
            removed: outcome.report.removed.len(),
            price_changed: outcome.report.price_changed.len(),
            previous_date: outcome.previous_date,
            report_path: outcome.report_path.display().to_string(),
            brief_path: outcome.brief_path.display().to_string(),
        })
    }
}

async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_source_registry(&text).with_context(|| format!("parsing {}", path.display()))
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    SyncPipeline::new(config)?.run_once().await
}

/// Scheduler running the sync pipeline on `sync_cron`, or `None` when disabled.
pub async fn maybe_build_scheduler(config: SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let config = Arc::new(config);
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let config = Arc::clone(&config);
        Box::pin(async move {
            match run_sync_once(config.as_ref().clone()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    added = summary.added,
                    removed = summary.removed,
                    price_changed = summary.price_changed,
                    "scheduled sync complete"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Read-only comparison of two stored snapshots.
#[derive(Debug, Clone)]
pub struct CompareSummary {
    pub current_date: NaiveDate,
    pub previous_date: NaiveDate,
    pub current_total: usize,
    pub previous_total: usize,
    pub current_unique: usize,
    pub previous_unique: usize,
    pub current_duplicates: Vec<String>,
    pub previous_duplicates: Vec<String>,
    pub report: Report,
}

/// Reconcile two stored snapshots against the persisted ledger without saving anything.
pub async fn compare_snapshots(
    store: &ListingStore,
    current_date: NaiveDate,
    previous_date: NaiveDate,
) -> CompareSummary {
    let current = store.load_snapshot(current_date).await;
    let previous = store.load_snapshot(previous_date).await;
    let ledger = store.load_ledger().await;

    let current_snapshot = Snapshot::from_raw(&current);
    let previous_snapshot = Snapshot::from_raw(&previous);
    let (report, _) = reconcile_snapshots(&current_snapshot, &previous_snapshot, ledger, current_date);

    CompareSummary {
        current_date,
        previous_date,
        current_total: current.len(),
        previous_total: previous.len(),
        current_unique: report.unique_ads,
        previous_unique: previous_snapshot.len(),
        current_duplicates: report.duplicate_ids.clone(),
        previous_duplicates: previous_snapshot.duplicate_ids().to_vec(),
        report,
    }
}

pub fn compare_markdown(summary: &CompareSummary) -> String {
    let mut lines = vec![
        format!(
            "# Compare {} vs {}",
            summary.current_date, summary.previous_date
        ),
        String::new(),
        format!(
            "- {}: {} listings ({} unique)",
            summary.previous_date, summary.previous_total, summary.previous_unique
        ),
        format!(
            "- {}: {} listings ({} unique)",
            summary.current_date, summary.current_total, summary.current_unique
        ),
        format!("- truly new: {}", summary.report.added.len()),
        format!("- removed: {}", summary.report.removed.len()),
        format!("- price changed: {}", summary.report.price_changed.len()),
    ];

    for (date, dups) in [
        (summary.previous_date, &summary.previous_duplicates),
        (summary.current_date, &summary.current_duplicates),
    ] {
        if dups.is_empty() {
            lines.push(format!("- no duplicates in {date}"));
        } else {
            lines.push(format!("- duplicates in {date}: {}", dups.join(", ")));
        }
    }

    if !summary.report.price_changed.is_empty() {
        lines.push(String::new());
        lines.push("## Price changes".to_string());
        for change in &summary.report.price_changed {
            lines.push(format!(
                "- {}: {} - {} → {}",
                change.id,
                change.title.as_deref().unwrap_or("untitled"),
                price_label(change.old_price.as_ref()),
                price_label(change.new_price.as_ref())
            ));
        }
    }

    lines.join("\n")
}
