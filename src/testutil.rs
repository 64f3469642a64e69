//! Fixtures shared by the unit tests: a local object store, a scratch
//! layout, and shell stand-ins for fasterq-dump and TRUST4.
//!
//! The fakes key their behaviour off the accession: `FAILCONV` makes
//! conversion exit non-zero, `NOMATES` makes it succeed without output,
//! `FAILASM` fails phase 1-2, and a report name containing `FAILFINAL`
//! fails the final stage.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::accession::Accession;
use crate::config::{Backend, Config, ReferencePaths, Settings, Software, StorageConfig};
use crate::error::Result;
use crate::layout::ScratchLayout;
use crate::storage::{Fetched, LocalStore, ObjectInfo, ObjectStore};
use crate::tools::ToolCommand;
use crate::worker::Sample;

const FAKE_FASTERQ_DUMP: &str = r##"
out=""; src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -O) out="$2"; shift ;;
    -e) shift ;;
    --*) ;;
    *) src="$1" ;;
  esac
  shift
done
name=$(basename "$src")
acc=${name%%.*}
case "$acc" in
  *FAILCONV*) echo "fasterq-dump: cannot read $src" >&2; exit 3 ;;
esac
[ -f "$src" ] || { echo "missing $src" >&2; exit 2; }
case "$acc" in
  *NOMATES*) exit 0 ;;
esac
printf '@%s.1\nACGT\n+\nIIII\n' "$acc" > "$out/${acc}_1.fastq"
printf '@%s.1\nTGCA\n+\nIIII\n' "$acc" > "$out/${acc}_2.fastq"
"##;

const FAKE_TRUST4: &str = r##"
name=""; od=""; input=""; mode="final"
while [ $# -gt 0 ]; do
  case "$1" in
    -o) name="$2"; shift ;;
    --od) od="$2"; shift ;;
    -u) input="$2"; shift ;;
    -1) mode="partial"; shift ;;
    -f|--ref|-2|-t|--stage|--stop) shift ;;
  esac
  shift
done
if [ "$mode" = "partial" ]; then
  case "$name" in
    *FAILASM*) echo "trust4: assembly failed" >&2; exit 5 ;;
  esac
  echo "$name	CASSL" > "$od/${name}_cdr3.out"
  printf '>%s_read\nACGT\n' "$name" > "$od/${name}_assembled_reads.fa"
else
  [ -f "$input" ] || { echo "no merged input $input" >&2; exit 6; }
  case "$name" in
    *FAILFINAL*) echo "trust4: report failed" >&2; exit 7 ;;
  esac
  cat "$input" > "$od/${name}_annot.fa"
  echo "#count	CDR3nt" > "$od/${name}_report.tsv"
  echo "log" > "$od/${name}_final.out"
fi
"##;

pub struct Fixture {
    pub temp: TempDir,
    pub store_root: PathBuf,
    pub layout: ScratchLayout,
    pub config: Config,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        let store_root = root.join("store");
        let bin = root.join("bin");
        fs::create_dir_all(&store_root).unwrap();
        fs::create_dir_all(&bin).unwrap();

        let fasterq = bin.join("fake-fasterq-dump.sh");
        let trust4 = bin.join("fake-run-trust4.sh");
        fs::write(&fasterq, FAKE_FASTERQ_DUMP).unwrap();
        fs::write(&trust4, FAKE_TRUST4).unwrap();
        let refs = root.join("refs");
        fs::create_dir_all(&refs).unwrap();
        fs::write(refs.join("bcrtcr.fa"), b">TRBV1\nACGT\n").unwrap();
        fs::write(refs.join("imgt.fa"), b">TRBV1*01\nACGT\n").unwrap();

        let scratch = root.join("scratch");
        let setting = Settings {
            partial_dir: scratch.join("partial"),
            output_dir: scratch.join("output"),
            scratch_root: scratch,
            parallelism: 5,
            max_files: 100,
            convert_threads: 2,
            assembly_threads: 2,
            report_prefix: "batch".to_string(),
            partial_stage_args: ["--stage", "0", "--stop", "1"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            final_stage_args: vec!["--stage".to_string(), "3".to_string()],
            merge_suffixes: vec!["_cdr3.out".to_string(), "_assembled_reads.fa".to_string()],
            final_input_suffix: "_assembled_reads.fa".to_string(),
        };
        let config = Config {
            storage: StorageConfig {
                backend: Backend::Local {
                    root: store_root.clone(),
                },
                sra_prefix: "sra/".to_string(),
                reports_prefix: "reports/".to_string(),
                annotations_prefix: "annotations/".to_string(),
            },
            software: Software {
                fasterq_dump: sh_tool(&fasterq),
                trust4: sh_tool(&trust4),
            },
            reference: ReferencePaths {
                bcrtcr: refs.join("bcrtcr.fa"),
                imgt: refs.join("imgt.fa"),
            },
            setting,
        };

        let layout = ScratchLayout::from_settings(&config.setting);
        layout.prepare().unwrap();

        Self {
            temp,
            store_root,
            layout,
            config,
        }
    }

    pub fn store(&self) -> LocalStore {
        LocalStore::new(&self.store_root)
    }

    /// Places `sra/{id}.sra` in the store for each id.
    pub fn seed_archives(&self, ids: &[&str]) {
        let dir = self.store_root.join("sra");
        fs::create_dir_all(&dir).unwrap();
        for id in ids {
            fs::write(dir.join(format!("{}.sra", id)), format!("SRA:{}", id)).unwrap();
        }
    }

    pub fn seed_report(&self, id: &str) {
        let dir = self.store_root.join("reports");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{}_report.tsv", id)), b"done\n").unwrap();
    }

    /// A sample whose archive is already in scratch, as after a download.
    pub fn stage_sample(&self, id: &str) -> Sample {
        let key = format!("sra/{}.sra", id);
        let accession = Accession::from_key(&key).unwrap();
        let paths = self.layout.sample(&accession, &key);
        fs::write(&paths.archive, format!("SRA:{}", id)).unwrap();
        Sample {
            accession,
            key,
            paths,
        }
    }
}

fn sh_tool(script: &Path) -> ToolCommand {
    ToolCommand::new("sh", vec![script.display().to_string()])
}

pub fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(true)
}

/// Wraps a store and records every call, so tests can assert what was
/// (not) requested.
pub struct RecordingStore<S> {
    inner: S,
    pub gets: Mutex<Vec<String>>,
    pub puts: Mutex<Vec<String>>,
    pub exists_calls: Mutex<Vec<String>>,
    pub fail_gets_for: Vec<String>,
    pub fail_exists: bool,
    /// Replaces the entity tag returned by `get`.
    pub fake_etag: Option<String>,
}

impl<S> RecordingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            gets: Mutex::new(Vec::new()),
            puts: Mutex::new(Vec::new()),
            exists_calls: Mutex::new(Vec::new()),
            fail_gets_for: Vec::new(),
            fail_exists: false,
            fake_etag: None,
        }
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    pub fn puts(&self) -> Vec<String> {
        let mut puts = self.puts.lock().unwrap().clone();
        puts.sort();
        puts
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for RecordingStore<S> {
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectInfo>> {
        self.inner.list(prefix, limit).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.exists_calls.lock().unwrap().push(key.to_string());
        if self.fail_exists {
            return Err(crate::error::PipelineError::Storage {
                key: key.to_string(),
                message: "head request timed out".to_string(),
            });
        }
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<Fetched> {
        self.gets.lock().unwrap().push(key.to_string());
        if self.fail_gets_for.iter().any(|k| k == key) {
            return Err(crate::error::PipelineError::Storage {
                key: key.to_string(),
                message: "connection reset".to_string(),
            });
        }
        let mut fetched = self.inner.get(key, dest).await?;
        if let Some(etag) = &self.fake_etag {
            fetched.etag = Some(etag.clone());
        }
        Ok(fetched)
    }

    async fn put(&self, src: &Path, key: &str) -> Result<()> {
        self.puts.lock().unwrap().push(key.to_string());
        self.inner.put(src, key).await
    }

    fn location(&self) -> String {
        self.inner.location()
    }
}

#[cfg(unix)]
mod tests {
    use super::*;

    #[test]
    fn fake_tools_keep_their_whole_script() {
        assert!(FAKE_FASTERQ_DUMP.trim_end().ends_with("\"$out/${acc}_2.fastq\""));
        assert!(FAKE_TRUST4.contains("echo \"#count\tCDR3nt\""));
        assert!(FAKE_TRUST4.trim_end().ends_with("fi"));
    }
}
