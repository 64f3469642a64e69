//! Local scratch paths owned by each stage.
//!
//! Every path the pipeline writes is derived here, so ownership is explicit:
//! a worker owns its archive and FASTQ directory, the finalizer owns the
//! shared partial and output directories.

use std::fs;
use std::path::{Path, PathBuf};

use crate::accession::{key_file_name, Accession};
use crate::config::Settings;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct ScratchLayout {
    root: PathBuf,
    partial_dir: PathBuf,
    output_dir: PathBuf,
}

/// Paths private to one accession.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePaths {
    pub archive: PathBuf,
    pub fastq_dir: PathBuf,
    pub mate_1: PathBuf,
    pub mate_2: PathBuf,
}

impl ScratchLayout {
    pub fn new(root: impl Into<PathBuf>, partial_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            partial_dir: partial_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.scratch_root.clone(),
            settings.partial_dir.clone(),
            settings.output_dir.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partial_dir(&self) -> &Path {
        &self.partial_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    /// Where a downloaded object lands.
    pub fn archive_path(&self, key: &str) -> PathBuf {
        self.root.join(key_file_name(key))
    }

    pub fn sample(&self, accession: &Accession, key: &str) -> SamplePaths {
        let fastq_dir = self.root.join("fastq").join(accession.as_str());
        SamplePaths {
            archive: self.archive_path(key),
            mate_1: fastq_dir.join(format!("{}_1.fastq", accession)),
            mate_2: fastq_dir.join(format!("{}_2.fastq", accession)),
            fastq_dir,
        }
    }

    /// Partial output of one accession for a given suffix, e.g. `SRR1_cdr3.out`.
    pub fn partial_file(&self, accession: &Accession, suffix: &str) -> PathBuf {
        self.partial_dir.join(format!("{}{}", accession, suffix))
    }

    pub fn merged_file(&self, report_name: &str, suffix: &str) -> PathBuf {
        self.output_dir.join(format!("{}{}", report_name, suffix))
    }

    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.root, &self.partial_dir, &self.output_dir] {
            fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
        }
        Ok(())
    }

    /// Empties the shared partial and output directories, leaving them in place.
    pub fn purge_shared(&self) -> Result<()> {
        let mut first_err = None;
        for dir in [&self.partial_dir, &self.output_dir] {
            if let Err(e) = purge_dir(dir) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl SamplePaths {
    /// Removes the archive and FASTQ directory. Missing paths are fine.
    pub fn cleanup(&self) -> Result<()> {
        remove_dir_if_exists(&self.fastq_dir)?;
        remove_file_if_exists(&self.archive)
    }
}

pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

fn purge_dir(dir: &Path) -> Result<()> {
    remove_dir_if_exists(dir)?;
    fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))
}
