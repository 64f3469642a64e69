use std::fmt;

use anyhow::{Context, Result};
use regex::Regex;

use crate::error::PipelineError;

/// Run accession derived from an object key, e.g. `sra/SRR1234567.sra` -> `SRR1234567`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Accession(String);

impl Accession {
    pub fn from_key(key: &str) -> Result<Self, PipelineError> {
        let file_name = key.rsplit('/').next().unwrap_or(key);
        let id = file_name.split('.').next().unwrap_or("");
        if id.is_empty() {
            return Err(PipelineError::InvalidKey(key.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Remote key of the report that marks this accession as done.
    pub fn report_key(&self, reports_prefix: &str) -> String {
        format!("{}{}_report.tsv", reports_prefix, self.0)
    }
}

impl fmt::Display for Accession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File name component of an object key.
pub fn key_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[derive(Debug, Default)]
pub struct RunFilters {
    include_run: Option<Regex>,
    exclude_run: Option<Regex>,
}

impl RunFilters {
    pub fn new(filter_run: Option<&str>, exclude_run: Option<&str>) -> Result<Self> {
        Ok(Self {
            include_run: filter_run
                .map(Regex::new)
                .transpose()
                .context("Invalid regex pattern for --filter-run")?,
            exclude_run: exclude_run
                .map(Regex::new)
                .transpose()
                .context("Invalid regex pattern for --exclude-run")?,
        })
    }

    pub fn should_include(&self, accession: &Accession) -> bool {
        if let Some(ref regex) = self.include_run {
            if !regex.is_match(accession.as_str()) {
                return false;
            }
        }
        if let Some(ref regex) = self.exclude_run {
            if regex.is_match(accession.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accession_is_text_before_first_dot() {
        let acc = Accession::from_key("sra/SRR1234567.sra").unwrap();
        assert_eq!(acc.as_str(), "SRR1234567");

        let acc = Accession::from_key("sra/batch2/ERR42.sralite.1").unwrap();
        assert_eq!(acc.as_str(), "ERR42");

        let acc = Accession::from_key("DRR9").unwrap();
        assert_eq!(acc.as_str(), "DRR9");
    }

    #[test]
    fn hidden_or_marker_keys_are_rejected() {
        assert!(matches!(
            Accession::from_key("sra/.sra"),
            Err(PipelineError::InvalidKey(_))
        ));
        assert!(Accession::from_key("sra/").is_err());
    }

    #[test]
    fn report_key_follows_naming_convention() {
        let acc = Accession::from_key("sra/SRR1.sra").unwrap();
        assert_eq!(acc.report_key("reports/"), "reports/SRR1_report.tsv");
    }

    #[test]
    fn filters_include_then_exclude() {
        let filters = RunFilters::new(Some("^SRR"), Some("SRR9")).unwrap();
        let keep = Accession::from_key("sra/SRR1.sra").unwrap();
        let excluded = Accession::from_key("sra/SRR9.sra").unwrap();
        let other = Accession::from_key("sra/ERR1.sra").unwrap();
        assert!(filters.should_include(&keep));
        assert!(!filters.should_include(&excluded));
        assert!(!filters.should_include(&other));

        assert!(RunFilters::default().should_include(&other));
    }

    #[test]
    fn invalid_filter_pattern_is_reported() {
        let err = RunFilters::new(Some("(unclosed"), None).unwrap_err();
        assert!(err.to_string().contains("--filter-run"));
    }
}
