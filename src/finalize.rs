use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::accession::Accession;
use crate::config::{Config, ReferencePaths};
use crate::error::{PipelineError, Result};
use crate::layout::ScratchLayout;
use crate::storage::ObjectStore;
use crate::tools::ToolCommand;

pub const ANNOTATION_SUFFIX: &str = "_annot.fa";
pub const REPORT_SUFFIX: &str = "_report.tsv";

/// What happened to one batch after its workers finished.
#[derive(Debug, Clone, Default)]
pub struct FinalizeReport {
    pub report_name: String,
    pub merged: Vec<PathBuf>,
    pub uploaded: Vec<String>,
    /// Failures of the merge, report, upload or purge steps. They never stop the run.
    pub problems: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BatchFinalizer {
    layout: ScratchLayout,
    trust4: ToolCommand,
    reference: ReferencePaths,
    assembly_threads: usize,
    final_stage_args: Vec<String>,
    merge_suffixes: Vec<String>,
    final_input_suffix: String,
    report_prefix: String,
    reports_prefix: String,
    annotations_prefix: String,
}

impl BatchFinalizer {
    pub fn new(config: &Config, layout: ScratchLayout) -> Self {
        Self {
            layout,
            trust4: config.software.trust4.clone(),
            reference: config.reference.clone(),
            assembly_threads: config.setting.assembly_threads,
            final_stage_args: config.setting.final_stage_args.clone(),
            merge_suffixes: config.setting.merge_suffixes.clone(),
            final_input_suffix: config.setting.final_input_suffix.clone(),
            report_prefix: config.setting.report_prefix.clone(),
            reports_prefix: config.storage.reports_prefix.clone(),
            annotations_prefix: config.storage.annotations_prefix.clone(),
        }
    }

    /// A batch with a single completed sample is reported under its accession.
    /// Larger batches get `{report_prefix}_{NNNN}` plus one marker copy per accession.
    pub fn report_name(&self, batch_no: usize, completed: &[Accession]) -> String {
        match completed {
            [only] => only.to_string(),
            _ => format!("{}_{:04}", self.report_prefix, batch_no),
        }
    }

    /// Remote key for an output file, or `None` if the file is not a result artifact.
    pub fn upload_key(&self, file_name: &str) -> Option<String> {
        if file_name.ends_with(ANNOTATION_SUFFIX) {
            Some(format!("{}{}", self.annotations_prefix, file_name))
        } else if file_name.ends_with(REPORT_SUFFIX) {
            Some(format!("{}{}", self.reports_prefix, file_name))
        } else {
            None
        }
    }

    pub async fn finalize(
        &self,
        store: &dyn ObjectStore,
        batch_no: usize,
        completed: &[Accession],
    ) -> FinalizeReport {
        let mut report = FinalizeReport {
            report_name: self.report_name(batch_no, completed),
            ..Default::default()
        };
        let name = report.report_name.clone();
        info!("📦 [batch {}] Finalizing as {} ({} completed samples)", batch_no, name, completed.len());

        match self.merge_partials(&name) {
            Ok(merged) => report.merged = merged,
            Err(e) => {
                warn!("⚠️ [batch {}] Merge failed: {}", batch_no, e);
                report.problems.push(e.to_string());
            }
        }

        let input = self.layout.merged_file(&name, &self.final_input_suffix);
        if input.is_file() {
            info!("📝 [batch {}] Running TRUST4 final report stage...", batch_no);
            match self.trust4.run("trust4 report", &name, &self.report_args(&name)).await {
                Ok(()) => {
                    if let Err(e) = self.write_markers(&name, completed) {
                        warn!("⚠️ [batch {}] Completion markers not written: {}", batch_no, e);
                        report.problems.push(e.to_string());
                    }
                }
                Err(e) => {
                    warn!("⚠️ [batch {}] Final report stage failed: {}", batch_no, e);
                    report.problems.push(e.to_string());
                }
            }
        } else {
            info!("⏩ [batch {}] No partial assemblies to report on", batch_no);
        }

        match self.upload_outputs(store).await {
            Ok((uploaded, problems)) => {
                report.uploaded = uploaded;
                report.problems.extend(problems);
            }
            Err(e) => {
                warn!("⚠️ [batch {}] Cannot scan output directory: {}", batch_no, e);
                report.problems.push(e.to_string());
            }
        }

        if let Err(e) = self.layout.purge_shared() {
            warn!("⚠️ [batch {}] Purge failed: {}", batch_no, e);
            report.problems.push(e.to_string());
        }

        info!(
            "✅ [batch {}] Merged {} files, uploaded {} files ({} problems)",
            batch_no,
            report.merged.len(),
            report.uploaded.len(),
            report.problems.len()
        );
        report
    }

    pub fn report_args(&self, name: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-f".into(),
            self.reference.bcrtcr.clone().into(),
            "--ref".into(),
            self.reference.imgt.clone().into(),
            "-u".into(),
            self.layout.merged_file(name, &self.final_input_suffix).into(),
            "-t".into(),
            self.assembly_threads.to_string().into(),
            "--od".into(),
            self.layout.output_dir().to_path_buf().into(),
            "-o".into(),
            name.into(),
        ];
        args.extend(self.final_stage_args.iter().map(OsString::from));
        args
    }

    /// Copies the batch report to `{output_dir}/{accession}_report.tsv` for every
    /// completed accession, so later runs see each of them as processed.
    fn write_markers(&self, name: &str, completed: &[Accession]) -> Result<usize> {
        let batch_report = self.layout.merged_file(name, REPORT_SUFFIX);
        let mut written = 0;
        for accession in completed.iter().filter(|a| a.as_str() != name) {
            let marker = self.layout.merged_file(accession.as_str(), REPORT_SUFFIX);
            fs::copy(&batch_report, &marker).map_err(|e| PipelineError::io(&batch_report, e))?;
            written += 1;
        }
        Ok(written)
    }

    /// Concatenates `{partial_dir}/*{suffix}` into `{output_dir}/{name}{suffix}`
    /// for every merge suffix with at least one partial file.
    fn merge_partials(&self, name: &str) -> Result<Vec<PathBuf>> {
        let partial_dir = self.layout.partial_dir();
        let mut entries: Vec<(String, PathBuf)> = fs::read_dir(partial_dir)
            .map_err(|e| PipelineError::io(partial_dir, e))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter_map(|path| {
                let file_name = path.file_name()?.to_str()?.to_string();
                Some((file_name, path))
            })
            .collect();
        entries.sort();

        let mut merged = Vec::new();
        for suffix in &self.merge_suffixes {
            let parts: Vec<&PathBuf> = entries
                .iter()
                .filter(|(file_name, _)| file_name.ends_with(suffix.as_str()))
                .map(|(_, path)| path)
                .collect();
            if parts.is_empty() {
                continue;
            }

            let target = self.layout.merged_file(name, suffix);
            let mut out = File::create(&target).map_err(|e| PipelineError::io(&target, e))?;
            for part in parts {
                let mut input = File::open(part).map_err(|e| PipelineError::io(part, e))?;
                io::copy(&mut input, &mut out).map_err(|e| PipelineError::io(&target, e))?;
            }
            merged.push(target);
        }
        Ok(merged)
    }

    async fn upload_outputs(&self, store: &dyn ObjectStore) -> Result<(Vec<String>, Vec<String>)> {
        let output_dir = self.layout.output_dir();
        let mut files: Vec<(String, PathBuf)> = fs::read_dir(output_dir)
            .map_err(|e| PipelineError::io(output_dir, e))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter_map(|path| Some((path.file_name()?.to_str()?.to_string(), path)))
            .collect();
        files.sort();

        let mut uploaded = Vec::new();
        let mut problems = Vec::new();
        for (file_name, path) in files {
            let Some(key) = self.upload_key(&file_name) else {
                continue;
            };
            info!("📤 Uploading {} -> {}", file_name, key);
            match store.put(&path, &key).await {
                Ok(()) => uploaded.push(key),
                Err(e) => {
                    warn!("⚠️ Upload of {} failed: {}", file_name, e);
                    problems.push(e.to_string());
                }
            }
        }
        Ok((uploaded, problems))
    }
}
