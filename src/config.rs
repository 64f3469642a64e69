use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::info;

use crate::error::PipelineError;
use crate::tools::ToolCommand;

// ============================
// YAML layout
// ============================

#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub storage: StorageSection,
    pub software: SoftwarePaths,
    pub reference: ReferencePaths,
    #[serde(default)]
    pub setting: SettingSection,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    S3,
    Local,
}

#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_sra_prefix")]
    pub sra_prefix: String,
    #[serde(default = "default_reports_prefix")]
    pub reports_prefix: String,
    #[serde(default = "default_annotations_prefix")]
    pub annotations_prefix: String,
}

/// A tool is either a bare program path or a full command prefix, e.g.
/// `[singularity, exec, trust4.sif, run-trust4]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolEntry {
    Path(PathBuf),
    Command(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct SoftwarePaths {
    #[serde(default = "default_fasterq_dump")]
    pub fasterq_dump: ToolEntry,
    #[serde(default = "default_trust4")]
    pub trust4: ToolEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferencePaths {
    pub bcrtcr: PathBuf,
    pub imgt: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SettingSection {
    pub scratch_root: PathBuf,
    pub partial_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub parallelism: usize,
    pub max_files: usize,
    pub convert_threads: usize,
    pub assembly_threads: usize,
    pub report_prefix: String,
    pub partial_stage_args: Vec<String>,
    pub final_stage_args: Vec<String>,
    pub merge_suffixes: Vec<String>,
    pub final_input_suffix: String,
}

impl Default for SettingSection {
    fn default() -> Self {
        Self {
            scratch_root: PathBuf::from("trust4_scratch"),
            partial_dir: None,
            output_dir: None,
            parallelism: 5,
            max_files: 100,
            convert_threads: 8,
            assembly_threads: 8,
            report_prefix: "batch".to_string(),
            partial_stage_args: ["--stage", "0", "--stop", "1"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            final_stage_args: vec!["--stage".to_string(), "3".to_string()],
            merge_suffixes: vec!["_cdr3.out".to_string(), "_assembled_reads.fa".to_string()],
            final_input_suffix: "_assembled_reads.fa".to_string(),
        }
    }
}

fn default_backend() -> BackendKind {
    BackendKind::S3
}

fn default_sra_prefix() -> String {
    "sra/".to_string()
}

fn default_reports_prefix() -> String {
    "reports/".to_string()
}

fn default_annotations_prefix() -> String {
    "annotations/".to_string()
}

fn default_fasterq_dump() -> ToolEntry {
    ToolEntry::Path(PathBuf::from("fasterq-dump"))
}

fn default_trust4() -> ToolEntry {
    ToolEntry::Path(PathBuf::from("run-trust4"))
}

// ============================
// Resolved configuration
// ============================

#[derive(Debug, Clone)]
pub enum Backend {
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
    },
    Local {
        root: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: Backend,
    pub sra_prefix: String,
    pub reports_prefix: String,
    pub annotations_prefix: String,
}

impl StorageConfig {
    /// Human readable location of the store, used in logs and errors.
    pub fn location(&self) -> String {
        match &self.backend {
            Backend::S3 { bucket, .. } => format!("s3://{}", bucket),
            Backend::Local { root } => root.display().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Software {
    pub fasterq_dump: ToolCommand,
    pub trust4: ToolCommand,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub scratch_root: PathBuf,
    pub partial_dir: PathBuf,
    pub output_dir: PathBuf,
    pub parallelism: usize,
    pub max_files: usize,
    pub convert_threads: usize,
    pub assembly_threads: usize,
    pub report_prefix: String,
    pub partial_stage_args: Vec<String>,
    pub final_stage_args: Vec<String>,
    pub merge_suffixes: Vec<String>,
    /// Merged file handed to the final reporting stage.
    pub final_input_suffix: String,
}

/// Immutable run configuration, handed to every component at construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub software: Software,
    pub reference: ReferencePaths,
    pub setting: Settings,
}

#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub parallelism: Option<usize>,
    pub max_files: Option<usize>,
    pub scratch_root: Option<PathBuf>,
}

pub fn load_config(yaml_path: &Path) -> Result<FileConfig> {
    if !yaml_path.exists() {
        return Err(anyhow!(
            "YAML configuration file not found: {}",
            yaml_path.display()
        ));
    }
    info!("⚙️  Loading configuration from: {}", yaml_path.display());
    let content = fs::read_to_string(yaml_path)?;
    let config: FileConfig = serde_yaml::from_str(&content)?;
    info!("✅ Configuration loaded successfully");
    Ok(config)
}

impl Config {
    pub fn resolve(file: FileConfig, overrides: &Overrides) -> Result<Self, PipelineError> {
        let storage = resolve_storage(file.storage)?;

        let setting = file.setting;
        let parallelism = overrides.parallelism.unwrap_or(setting.parallelism);
        let max_files = overrides.max_files.unwrap_or(setting.max_files);
        if parallelism == 0 {
            return Err(PipelineError::Config("parallelism must be at least 1".to_string()));
        }
        if max_files == 0 {
            return Err(PipelineError::Config("max_files must be at least 1".to_string()));
        }
        if setting.merge_suffixes.is_empty() {
            return Err(PipelineError::Config(
                "merge_suffixes must name at least one partial output".to_string(),
            ));
        }
        if !setting.merge_suffixes.contains(&setting.final_input_suffix) {
            return Err(PipelineError::Config(format!(
                "final_input_suffix {} is not one of merge_suffixes",
                setting.final_input_suffix
            )));
        }

        let scratch_root = overrides
            .scratch_root
            .clone()
            .unwrap_or(setting.scratch_root);
        let partial_dir = setting
            .partial_dir
            .unwrap_or_else(|| scratch_root.join("partial"));
        let output_dir = setting
            .output_dir
            .unwrap_or_else(|| scratch_root.join("output"));
        if partial_dir == output_dir {
            return Err(PipelineError::Config(
                "partial_dir and output_dir must be different directories".to_string(),
            ));
        }

        Ok(Self {
            storage,
            software: Software {
                fasterq_dump: tool_command(file.software.fasterq_dump, "fasterq_dump")?,
                trust4: tool_command(file.software.trust4, "trust4")?,
            },
            reference: file.reference,
            setting: Settings {
                scratch_root,
                partial_dir,
                output_dir,
                parallelism,
                max_files,
                convert_threads: setting.convert_threads.max(1),
                assembly_threads: setting.assembly_threads.max(1),
                report_prefix: setting.report_prefix,
                partial_stage_args: setting.partial_stage_args,
                final_stage_args: setting.final_stage_args,
                merge_suffixes: setting.merge_suffixes,
                final_input_suffix: setting.final_input_suffix,
            },
        })
    }
}

fn resolve_storage(section: StorageSection) -> Result<StorageConfig, PipelineError> {
    let backend = match section.backend {
        BackendKind::S3 => {
            let bucket = section
                .bucket
                .filter(|b| !b.trim().is_empty())
                .ok_or_else(|| PipelineError::Config("storage.bucket is required for s3".to_string()))?;
            Backend::S3 {
                bucket,
                region: section.region,
                endpoint: section.endpoint,
            }
        }
        BackendKind::Local => {
            let root = section.root.ok_or_else(|| {
                PipelineError::Config("storage.root is required for the local backend".to_string())
            })?;
            Backend::Local { root }
        }
    };

    Ok(StorageConfig {
        backend,
        sra_prefix: normalize_prefix(&section.sra_prefix),
        reports_prefix: normalize_prefix(&section.reports_prefix),
        annotations_prefix: normalize_prefix(&section.annotations_prefix),
    })
}

fn tool_command(entry: ToolEntry, name: &str) -> Result<ToolCommand, PipelineError> {
    match entry {
        ToolEntry::Path(path) => Ok(ToolCommand::new(path.display().to_string(), Vec::new())),
        ToolEntry::Command(mut parts) => {
            if parts.is_empty() {
                return Err(PipelineError::Config(format!("software.{} is empty", name)));
            }
            let program = parts.remove(0);
            Ok(ToolCommand::new(program, parts))
        }
    }
}

/// `"sra"` -> `"sra/"`, `"/reports//"` -> `"reports/"`, `""` stays empty (bucket root).
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}
