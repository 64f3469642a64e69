use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{error, info};
use which::which;

use crate::error::{PipelineError, Result};

/// An external program plus any fixed leading arguments (container wrappers etc.).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    leading_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn leading_args(&self) -> &[String] {
        &self.leading_args
    }

    /// Checks the program resolves on PATH (or as given).
    pub fn ensure_available(&self) -> Result<PathBuf> {
        which(self.program()).map_err(|_| PipelineError::MissingTool(self.program.clone()))
    }

    /// Shell-ready rendering of a full invocation, used for logs and scripts.
    pub fn render(&self, args: &[OsString]) -> String {
        std::iter::once(self.program.clone())
            .chain(self.leading_args().iter().cloned())
            .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
            .map(|part| shell_quote(&part))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs the tool to completion. stdout is discarded, stderr is logged on failure.
    pub async fn run(&self, tool: &str, accession: &str, args: &[OsString]) -> Result<()> {
        info!("   Step: {}", self.render(args));
        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| PipelineError::ToolSpawn {
                tool: tool.to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("❌ [{}] {} failed ({})\nError Output:\n{}", accession, tool, output.status, stderr.trim_end());
            Err(PipelineError::ToolFailed {
                tool: tool.to_string(),
                accession: accession.to_string(),
                status: output.status.to_string(),
            })
        }
    }
}

fn shell_quote(part: &str) -> String {
    let plain = !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=+:,@".contains(c));
    if plain {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}

/// Writes an executable bash script `{scripts_dir}/{name}.sh`.
pub fn create_script(scripts_dir: &Path, name: &str, workdir: &Path, commands: &[String]) -> Result<PathBuf> {
    fs::create_dir_all(scripts_dir).map_err(|e| PipelineError::io(scripts_dir, e))?;

    let script_path = scripts_dir.join(format!("{}.sh", name));
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&script_path)?;
        writeln!(file, "#!/usr/bin/env bash")?;
        writeln!(file, "set -euo pipefail")?;
        writeln!(file, "mkdir -p {}", shell_quote(&workdir.display().to_string()))?;
        writeln!(file, "cd {}", shell_quote(&workdir.display().to_string()))?;
        for command in commands {
            writeln!(file, "{}", command)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms)?;
        }
        Ok(())
    };
    write().map_err(|e| PipelineError::io(&script_path, e))?;

    Ok(script_path)
}
