//! A small builder around [`std::process::Command`] for the external tools.
//!
//! Arguments are passed to the child directly, never through a shell. The
//! [`Display`](fmt::Display) form renders a copy-pasteable command line for the
//! logs, with each argument quoted by [`quote_arg`] where needed.
use crate::error::ToolError;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use tracing::debug;

/// Backslash-escapes `"` and `\` in `arg`.
pub fn escape_shell_arg(arg: &str) -> String {
    let mut escaped = String::with_capacity(arg.len());
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Renders `arg` as a single shell word, double-quoting it when it contains
/// anything outside a conservative safe set.
pub fn quote_arg(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/-_.,:=+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("\"{}\"", escape_shell_arg(arg))
    }
}

/// An external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    stdin: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Cmd {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Feeds `input` to the child's standard input.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Runs the command to completion, failing on a non-zero exit status.
    pub fn run(&self) -> Result<Output, ToolError> {
        debug!("{self}");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (&self.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .map_err(|source| ToolError::Spawn {
                    program: self.program.clone(),
                    source,
                })?;
        }

        let output = child.wait_with_output().map_err(|source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                command: self.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Runs the command and returns stdout as text.
    pub fn read(&self) -> Result<String, ToolError> {
        let output = self.run()?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs the command and returns the first line of stdout, trimmed, or
    /// `None` if it printed nothing.
    pub fn query_line(&self) -> Result<Option<String>, ToolError> {
        let stdout = self.read()?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    /// Like [`Cmd::query_line`] but keeps only the first whitespace-separated
    /// token.
    pub fn query_token(&self) -> Result<Option<String>, ToolError> {
        Ok(self
            .query_line()?
            .and_then(|l| l.split_whitespace().next().map(str::to_string)))
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", quote_arg(&arg.to_string_lossy()))?;
        }
        Ok(())
    }
}
