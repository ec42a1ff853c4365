//! Script sandbox
//!
//! A sandbox takes bound variables and source text and runs them in an
//! isolated interpreter. [`ScriptSandbox`] drives an external interpreter
//! process (node by default): variables and evaluated sources accumulate into
//! one program, each evaluation is syntax-checked on the spot, and loading a
//! file appends it and runs the whole program inside the build workspace.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::SandboxError;

#[async_trait]
pub trait Sandbox: Send {
    /// Bind `name` to a structured value before any user code runs
    async fn bind_variable(&mut self, name: &str, value: Value) -> Result<(), SandboxError>;

    /// Evaluate source text
    async fn evaluate(&mut self, source: &str) -> Result<(), SandboxError>;

    /// Load and execute a script file
    async fn load_file(&mut self, path: &Path) -> Result<(), SandboxError>;
}

/// Creates one fresh sandbox per build
pub trait SandboxFactory: Send + Sync {
    fn create(&self, workdir: &Path) -> Box<dyn Sandbox>;
}

pub struct ScriptSandbox {
    interpreter: String,
    workdir: PathBuf,
    program: String,
}

impl ScriptSandbox {
    pub fn new(interpreter: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            workdir: workdir.into(),
            program: String::new(),
        }
    }

    /// Program text accumulated so far
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Writes `program` next to the workspace files, so relative
    /// `require()` calls resolve against the workspace.
    async fn stage(&self, program: &str) -> Result<tempfile::NamedTempFile, SandboxError> {
        let file = tempfile::Builder::new()
            .prefix(".pushbuild-")
            .suffix(".js")
            .tempfile_in(&self.workdir)?;
        tokio::fs::write(file.path(), program).await?;
        Ok(file)
    }

    async fn interpret(
        &self,
        args: &[&str],
        script: &Path,
    ) -> Result<(bool, Option<i32>, String), SandboxError> {
        let output = Command::new(&self.interpreter)
            .current_dir(&self.workdir)
            .args(args)
            .arg(script)
            .output()
            .await
            .map_err(|source| SandboxError::Spawn {
                interpreter: self.interpreter.clone(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.success(), output.status.code(), combined))
    }
}

#[async_trait]
impl Sandbox for ScriptSandbox {
    async fn bind_variable(&mut self, name: &str, value: Value) -> Result<(), SandboxError> {
        if !is_identifier(name) {
            return Err(SandboxError::InvalidName(name.to_string()));
        }
        // JSON text is a valid literal for the interpreter
        self.program.push_str(&format!("var {} = {};\n", name, value));
        Ok(())
    }

    async fn evaluate(&mut self, source: &str) -> Result<(), SandboxError> {
        let candidate = format!("{}{}\n", self.program, source);
        let staged = self.stage(&candidate).await?;
        let (ok, _, output) = self.interpret(&["--check"], staged.path()).await?;
        if !ok {
            return Err(SandboxError::Compile { output });
        }
        self.program = candidate;
        Ok(())
    }

    async fn load_file(&mut self, path: &Path) -> Result<(), SandboxError> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SandboxError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        self.program.push_str(&source);
        self.program.push('\n');

        let staged = self.stage(&self.program).await?;
        info!(
            "Running {} (cwd = '{}') with {}",
            path.display(),
            self.workdir.display(),
            self.interpreter
        );
        let (ok, code, output) = self.interpret(&[], staged.path()).await?;
        if !ok {
            return Err(SandboxError::Execution { code, output });
        }
        debug!("script output:\n{}", output);
        Ok(())
    }
}

/// Builds [`ScriptSandbox`]es for a configured interpreter
#[derive(Debug, Clone)]
pub struct ScriptSandboxFactory {
    interpreter: String,
}

impl ScriptSandboxFactory {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl SandboxFactory for ScriptSandboxFactory {
    fn create(&self, workdir: &Path) -> Box<dyn Sandbox> {
        Box::new(ScriptSandbox::new(self.interpreter.clone(), workdir))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
