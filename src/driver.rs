use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{info, warn};

use crate::accession::{Accession, RunFilters};
use crate::config::{Backend, Config, StorageConfig};
use crate::error::{PipelineError, Result};
use crate::finalize::{BatchFinalizer, FinalizeReport};
use crate::layout::{remove_file_if_exists, ScratchLayout};
use crate::storage::{file_md5, plain_md5_etag, ObjectInfo, ObjectStore};
use crate::tools::create_script;
use crate::worker::{run_batch, Sample, SampleOutcome, SampleWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    InvalidKey,
    Filtered,
    Skipped,
    Duplicate,
    DownloadFailed,
    Scripted,
    Completed,
    Failed,
}

/// One line of the run manifest.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestRow {
    pub accession: String,
    pub key: String,
    pub status: ObjectStatus,
    pub batch: Option<usize>,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub number: usize,
    pub accessions: Vec<Accession>,
    pub outcomes: Vec<SampleOutcome>,
    pub finalize: FinalizeReport,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub listed: usize,
    pub batches: Vec<BatchSummary>,
    pub rows: Vec<ManifestRow>,
}

impl RunSummary {
    pub fn count(&self, status: ObjectStatus) -> usize {
        self.rows.iter().filter(|r| r.status == status).count()
    }

    fn record(&mut self, accession: &str, key: &str, status: ObjectStatus, batch: Option<usize>, detail: impl Into<String>) {
        self.rows.push(ManifestRow {
            accession: accession.to_string(),
            key: key.to_string(),
            status,
            batch,
            detail: detail.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub only_scripts: bool,
    pub show_progress: bool,
}

// ============================
// Lister / completion / download
// ============================

/// Objects under `prefix`, directory markers dropped, at most `limit`.
/// An empty result is fatal.
pub async fn list_inputs(store: &dyn ObjectStore, prefix: &str, limit: usize) -> Result<Vec<ObjectInfo>> {
    let mut objects = store.list(prefix, limit).await?;
    objects.retain(|o| !o.key.ends_with('/'));
    objects.truncate(limit);
    if objects.is_empty() {
        return Err(PipelineError::EmptyListing {
            location: store.location(),
            prefix: prefix.to_string(),
        });
    }
    Ok(objects)
}

/// True when the accession's report already exists remotely. A failed
/// check counts as "not processed".
pub async fn is_processed(store: &dyn ObjectStore, reports_prefix: &str, accession: &Accession) -> bool {
    let key = accession.report_key(reports_prefix);
    match store.exists(&key).await {
        Ok(found) => found,
        Err(e) => {
            warn!("⚠️ [{}] Completion check failed, processing anyway: {}", accession, e);
            false
        }
    }
}

/// Fetches one object to `dest`. A partial file is removed on failure.
pub async fn download(store: &dyn ObjectStore, key: &str, dest: &Path) -> Result<u64> {
    let result = fetch_verified(store, key, dest).await;
    if result.is_err() {
        if let Err(e) = remove_file_if_exists(dest) {
            warn!("⚠️ Could not remove partial download {}: {}", dest.display(), e);
        }
    }
    result
}

async fn fetch_verified(store: &dyn ObjectStore, key: &str, dest: &Path) -> Result<u64> {
    let fetched = store.get(key, dest).await?;
    if let Some(expected) = fetched.etag.as_deref().and_then(plain_md5_etag) {
        let actual = file_md5(dest).await?;
        if actual != expected {
            return Err(PipelineError::Checksum {
                key: key.to_string(),
                expected,
                actual,
            });
        }
    }
    Ok(fetched.bytes)
}

/// Shell line that fetches `key` to `dest`, for script-only mode.
pub fn fetch_command(storage: &StorageConfig, key: &str, dest: &Path) -> String {
    match &storage.backend {
        Backend::S3 { bucket, endpoint, .. } => {
            let endpoint = endpoint
                .as_deref()
                .map(|e| format!(" --endpoint-url {}", e))
                .unwrap_or_default();
            format!("aws s3 cp{} s3://{}/{} '{}'", endpoint, bucket, key, dest.display())
        }
        Backend::Local { root } => format!("cp '{}' '{}'", root.join(key).display(), dest.display()),
    }
}

// ============================
// Batching driver
// ============================

pub struct Pipeline<'a> {
    config: &'a Config,
    store: &'a dyn ObjectStore,
    layout: ScratchLayout,
    worker: Arc<SampleWorker>,
    finalizer: BatchFinalizer,
    filters: RunFilters,
    options: RunOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, store: &'a dyn ObjectStore, filters: RunFilters, options: RunOptions) -> Self {
        let layout = ScratchLayout::from_settings(&config.setting);
        Self {
            worker: Arc::new(SampleWorker::new(config, layout.clone())),
            finalizer: BatchFinalizer::new(config, layout.clone()),
            layout,
            config,
            store,
            filters,
            options,
        }
    }

    pub fn worker(&self) -> &SampleWorker {
        &self.worker
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let storage = &self.config.storage;
        let parallelism = self.config.setting.parallelism;

        info!("🔍 Listing {} under {}", self.store.location(), storage.sra_prefix);
        let objects = list_inputs(self.store, &storage.sra_prefix, self.config.setting.max_files).await?;
        info!("📊 Total objects listed: {}", objects.len());

        self.layout.prepare()?;
        let mut summary = RunSummary {
            listed: objects.len(),
            ..Default::default()
        };

        let pb = self.progress_bar(objects.len() as u64);
        let mut batch: Vec<Sample> = Vec::with_capacity(parallelism);
        // accession -> key it was admitted from; scratch paths are keyed by accession
        let mut admitted: HashMap<Accession, String> = HashMap::new();

        for object in objects {
            pb.set_message(object.key.clone());
            self.admit(&object, &mut admitted, &mut batch, &mut summary).await;
            if batch.len() >= parallelism {
                self.flush(&mut batch, &mut summary).await;
            }
            pb.inc(1);
        }
        if !batch.is_empty() {
            self.flush(&mut batch, &mut summary).await;
        }
        pb.finish_and_clear();

        info!(
            "🎉 Run finished: {} listed, {} skipped, {} duplicates, {} completed, {} failed, {} download failures",
            summary.listed,
            summary.count(ObjectStatus::Skipped),
            summary.count(ObjectStatus::Duplicate),
            summary.count(ObjectStatus::Completed),
            summary.count(ObjectStatus::Failed),
            summary.count(ObjectStatus::DownloadFailed)
        );
        Ok(summary)
    }

    /// Filters, completion-checks and downloads one object, appending it to the batch.
    async fn admit(
        &self,
        object: &ObjectInfo,
        admitted: &mut HashMap<Accession, String>,
        batch: &mut Vec<Sample>,
        summary: &mut RunSummary,
    ) {
        let key = object.key.as_str();
        let accession = match Accession::from_key(key) {
            Ok(acc) => acc,
            Err(e) => {
                warn!("⚠️ Skipping {}: {}", key, e);
                summary.record("", key, ObjectStatus::InvalidKey, None, e.to_string());
                return;
            }
        };

        if !self.filters.should_include(&accession) {
            summary.record(accession.as_str(), key, ObjectStatus::Filtered, None, "");
            return;
        }

        if let Some(first) = admitted.get(&accession) {
            warn!("⚠️ [{}] Already taken from {}, skipping {}", accession, first, key);
            let detail = format!("accession already taken from {}", first);
            summary.record(accession.as_str(), key, ObjectStatus::Duplicate, None, detail);
            return;
        }

        if is_processed(self.store, &self.config.storage.reports_prefix, &accession).await {
            info!("⏩ [{}] Report exists, skipping.", accession);
            summary.record(accession.as_str(), key, ObjectStatus::Skipped, None, "report exists");
            return;
        }

        let paths = self.layout.sample(&accession, key);
        let sample = Sample {
            accession,
            key: key.to_string(),
            paths,
        };

        if self.options.only_scripts {
            admitted.insert(sample.accession.clone(), key.to_string());
            self.write_script(&sample, summary);
            return;
        }

        info!("📥 [{}] Downloading {} ({} bytes)", sample.accession, key, object.size);
        match download(self.store, key, &sample.paths.archive).await {
            Ok(bytes) => {
                info!("  ✓ [{}] {} bytes fetched", sample.accession, bytes);
                admitted.insert(sample.accession.clone(), key.to_string());
                batch.push(sample);
            }
            Err(e) => {
                warn!("⚠️ [{}] Download failed, skipping: {}", sample.accession, e);
                summary.record(sample.accession.as_str(), key, ObjectStatus::DownloadFailed, None, e.to_string());
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<Sample>, summary: &mut RunSummary) {
        let number = summary.batches.len() + 1;
        info!("🚀 [batch {}] Processing {} samples", number, batch.len());

        let outcomes = run_batch(self.worker.clone(), batch, self.config.setting.parallelism).await;

        let completed: Vec<Accession> = batch
            .iter()
            .zip(&outcomes)
            .filter(|(_, outcome)| outcome.is_completed())
            .map(|(sample, _)| sample.accession.clone())
            .collect();
        let finalize = self.finalizer.finalize(self.store, number, &completed).await;

        for (sample, outcome) in batch.iter().zip(&outcomes) {
            let (status, detail) = match outcome {
                SampleOutcome::Completed => (ObjectStatus::Completed, finalize.report_name.clone()),
                SampleOutcome::Failed { stage, reason } => (ObjectStatus::Failed, format!("{}: {}", stage, reason)),
            };
            summary.record(sample.accession.as_str(), &sample.key, status, Some(number), detail);
        }

        summary.batches.push(BatchSummary {
            number,
            accessions: batch.iter().map(|s| s.accession.clone()).collect(),
            outcomes,
            finalize,
        });
        batch.clear();
    }

    fn write_script(&self, sample: &Sample, summary: &mut RunSummary) {
        let mut commands = vec![fetch_command(&self.config.storage, &sample.key, &sample.paths.archive)];
        commands.extend(self.worker.script_commands(sample));
        match create_script(&self.layout.scripts_dir(), sample.accession.as_str(), self.layout.root(), &commands) {
            Ok(path) => {
                info!("📝 [{}] Script generated: {}", sample.accession, path.display());
                summary.record(sample.accession.as_str(), &sample.key, ObjectStatus::Scripted, None, path.display().to_string());
            }
            Err(e) => {
                warn!("⚠️ [{}] Script generation failed: {}", sample.accession, e);
                summary.record(sample.accession.as_str(), &sample.key, ObjectStatus::Failed, None, e.to_string());
            }
        }
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}") {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }
}

/// Writes the manifest as TSV.
pub fn write_manifest(path: &Path, rows: &[ManifestRow]) -> Result<PathBuf> {
    let to_io = |e: csv::Error| PipelineError::io(path, std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(to_io)?;
    for row in rows {
        writer.serialize(row).map_err(to_io)?;
    }
    writer.flush().map_err(|e| PipelineError::io(path, e))?;
    Ok(path.to_path_buf())
}
