use std::ffi::OsString;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::accession::Accession;
use crate::config::{Config, ReferencePaths};
use crate::error::{PipelineError, Result};
use crate::layout::{SamplePaths, ScratchLayout};
use crate::tools::ToolCommand;

/// A downloaded archive waiting for processing.
#[derive(Debug, Clone)]
pub struct Sample {
    pub accession: Accession,
    pub key: String,
    pub paths: SamplePaths,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Convert,
    Assemble,
    Scheduling,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::Convert => "fasterq-dump",
            Stage::Assemble => "trust4 phase 1-2",
            Stage::Scheduling => "scheduling",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleOutcome {
    Completed,
    Failed { stage: Stage, reason: String },
}

impl SampleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SampleOutcome::Completed)
    }
}

/// Conversion plus TRUST4 phase 1-2 for one accession.
#[derive(Debug, Clone)]
pub struct SampleWorker {
    layout: ScratchLayout,
    fasterq_dump: ToolCommand,
    trust4: ToolCommand,
    reference: ReferencePaths,
    convert_threads: usize,
    assembly_threads: usize,
    partial_stage_args: Vec<String>,
}

impl SampleWorker {
    pub fn new(config: &Config, layout: ScratchLayout) -> Self {
        Self {
            layout,
            fasterq_dump: config.software.fasterq_dump.clone(),
            trust4: config.software.trust4.clone(),
            reference: config.reference.clone(),
            convert_threads: config.setting.convert_threads,
            assembly_threads: config.setting.assembly_threads,
            partial_stage_args: config.setting.partial_stage_args.clone(),
        }
    }

    pub fn conversion_args(&self, paths: &SamplePaths) -> Vec<OsString> {
        vec![
            "--split-3".into(),
            "-e".into(),
            self.convert_threads.to_string().into(),
            "-O".into(),
            paths.fastq_dir.clone().into(),
            paths.archive.clone().into(),
        ]
    }

    pub fn assembly_args(&self, accession: &Accession, paths: &SamplePaths) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-f".into(),
            self.reference.bcrtcr.clone().into(),
            "--ref".into(),
            self.reference.imgt.clone().into(),
            "-1".into(),
            paths.mate_1.clone().into(),
            "-2".into(),
            paths.mate_2.clone().into(),
            "-t".into(),
            self.assembly_threads.to_string().into(),
            "--od".into(),
            self.layout.partial_dir().to_path_buf().into(),
            "-o".into(),
            accession.as_str().into(),
        ];
        args.extend(self.partial_stage_args.iter().map(OsString::from));
        args
    }

    /// The same steps as `run`, as shell lines for script-only mode.
    pub fn script_commands(&self, sample: &Sample) -> Vec<String> {
        let quote = |p: &std::path::Path| format!("'{}'", p.display().to_string().replace('\'', r"'\''"));
        vec![
            format!("mkdir -p {}", quote(&sample.paths.fastq_dir)),
            self.fasterq_dump.render(&self.conversion_args(&sample.paths)),
            self.trust4.render(&self.assembly_args(&sample.accession, &sample.paths)),
            format!(
                "rm -rf {} {}",
                quote(&sample.paths.fastq_dir),
                quote(&sample.paths.archive)
            ),
        ]
    }

    /// Runs one accession. Its archive and FASTQ directory are gone afterwards,
    /// whatever the outcome.
    pub async fn run(&self, sample: &Sample) -> SampleOutcome {
        let result = self.process(sample).await;

        if let Err(e) = sample.paths.cleanup() {
            warn!("⚠️ [{}] Scratch cleanup failed: {}", sample.accession, e);
        }

        match result {
            Ok(()) => {
                info!("✅ [{}] Partial assembly completed", sample.accession);
                SampleOutcome::Completed
            }
            Err((stage, err)) => {
                warn!("⚠️ [{}] {} failed: {}", sample.accession, stage, err);
                SampleOutcome::Failed {
                    stage,
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn process(&self, sample: &Sample) -> std::result::Result<(), (Stage, PipelineError)> {
        let accession = sample.accession.as_str();
        let paths = &sample.paths;

        tokio::fs::create_dir_all(&paths.fastq_dir)
            .await
            .map_err(|e| (Stage::Setup, PipelineError::io(&paths.fastq_dir, e)))?;

        info!("🔄 [{}] Converting (fasterq-dump)...", accession);
        self.fasterq_dump
            .run("fasterq-dump", accession, &self.conversion_args(paths))
            .await
            .map_err(|e| (Stage::Convert, e))?;
        for mate in [&paths.mate_1, &paths.mate_2] {
            if !mate.is_file() {
                return Err((
                    Stage::Convert,
                    PipelineError::MissingOutput {
                        accession: accession.to_string(),
                        path: mate.clone(),
                    },
                ));
            }
        }

        info!("🧬 [{}] Assembling (TRUST4 phase 1-2)...", accession);
        self.trust4
            .run("trust4", accession, &self.assembly_args(&sample.accession, paths))
            .await
            .map_err(|e| (Stage::Assemble, e))
    }
}

/// Runs every sample of a batch with at most `parallelism` in flight and
/// waits for all of them. Outcomes come back in input order.
pub async fn run_batch(
    worker: Arc<SampleWorker>,
    samples: &[Sample],
    parallelism: usize,
) -> Vec<SampleOutcome> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut set = JoinSet::new();

    for (idx, sample) in samples.iter().cloned().enumerate() {
        let sem = semaphore.clone();
        let worker = worker.clone();
        set.spawn(async move {
            let outcome = match sem.acquire_owned().await {
                Ok(_permit) => worker.run(&sample).await,
                Err(e) => SampleOutcome::Failed {
                    stage: Stage::Scheduling,
                    reason: e.to_string(),
                },
            };
            (idx, outcome)
        });
    }

    let mut outcomes: Vec<Option<SampleOutcome>> = vec![None; samples.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
            Err(e) => warn!("Task error: {}", e),
        }
    }

    outcomes
        .into_iter()
        .map(|o| {
            o.unwrap_or_else(|| SampleOutcome::Failed {
                stage: Stage::Scheduling,
                reason: "worker task aborted".to_string(),
            })
        })
        .collect()
}

pub(crate) fn ensure_tools(worker: &SampleWorker) -> Result<()> {
    let fasterq = worker.fasterq_dump.ensure_available()?;
    info!("  ✓ fasterq-dump: {}", fasterq.display());
    let trust4 = worker.trust4.ensure_available()?;
    info!("  ✓ TRUST4: {}", trust4.display());
    Ok(())
}
