//! Running external command-line tools.
//!
//! Every tool invocation goes through [`ToolRunner`], which polls the child
//! process and kills it as soon as the shared [`CancelToken`] is set.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared interrupt flag. Clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("Waiting on {tool} failed: {source}")]
    Wait {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}: {command}")]
    Failed {
        tool: String,
        status: ExitStatus,
        command: String,
    },

    #[error("{tool} reported success but did not write {path}")]
    MissingOutput { tool: String, path: PathBuf },

    #[error("{tool} was terminated by cancellation")]
    Cancelled { tool: String },
}

/// A single external executable.
#[derive(Clone, Debug)]
pub struct ToolRunner {
    program: PathBuf,
    echo_output: bool,
}

impl ToolRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            echo_output: false,
        }
    }

    /// Forward the tool's stdout/stderr to ours instead of discarding them.
    pub fn echo_output(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    fn render<I, S>(&self, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in args {
            line.push(' ');
            line.push_str(&arg.as_ref().to_string_lossy());
        }
        line
    }

    /// Run to completion, killing the child if `cancel` fires first.
    pub fn run<I, S>(&self, args: I, cancel: &CancelToken) -> Result<(), ToolError>
    where
        I: IntoIterator<Item = S> + Clone,
        S: AsRef<OsStr>,
    {
        let tool = self.name();
        let command = self.render(args.clone());
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled { tool });
        }
        debug!(%command, "launching");

        let stdio = || {
            if self.echo_output {
                Stdio::inherit()
            } else {
                Stdio::null()
            }
        };
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdio())
            .stderr(stdio())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        loop {
            if cancel.is_cancelled() {
                warn!(%tool, pid = child.id(), "terminating on cancellation");
                // The child may already have exited between polls
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::Cancelled { tool });
            }
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    return Err(ToolError::Failed {
                        tool,
                        status,
                        command,
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => return Err(ToolError::Wait { tool, source }),
            }
        }
    }

    /// Check the executable can be launched at all; its exit status is ignored.
    pub fn probe(&self) -> Result<(), ToolError> {
        Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|_| ())
            .map_err(|source| ToolError::Spawn {
                tool: self.name(),
                source,
            })
    }
}

/// Capability shared by every external collaborator the pipeline depends on.
pub trait ExternalTool: Send + Sync {
    /// Stable lookup key, e.g. `"registration"`.
    fn key(&self) -> &'static str;

    fn describe(&self) -> String;

    fn probe(&self) -> Result<(), ToolError>;
}

/// Statically populated table of external tools, keyed by [`ExternalTool::key`].
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Box<dyn ExternalTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn ExternalTool>) -> &mut Self {
        self.tools.insert(tool.key(), tool);
        self
    }

    pub fn get(&self, key: &str) -> Option<&dyn ExternalTool> {
        self.tools.get(key).map(|tool| tool.as_ref())
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tools.keys().copied()
    }

    /// Probe every registered tool, in key order.
    pub fn probe_all(&self) -> Vec<(&'static str, String, Result<(), ToolError>)> {
        self.tools
            .iter()
            .map(|(key, tool)| (*key, tool.describe(), tool.probe()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_reported_with_command_line() {
        let runner = ToolRunner::new("sh");
        let err = runner
            .run(["-c", "exit 3"], &CancelToken::new())
            .unwrap_err();
        match err {
            ToolError::Failed { status, command, .. } => {
                assert_eq!(status.code(), Some(3));
                assert!(command.contains("exit 3"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_running_child() {
        let runner = ToolRunner::new("sleep");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let err = runner.run(["30"], &cancel).unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, ToolError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let runner = ToolRunner::new("definitely-not-an-installed-tool");
        assert!(matches!(
            runner.run(["x"], &CancelToken::new()),
            Err(ToolError::Spawn { .. })
        ));
        assert!(runner.probe().is_err());
    }

    struct Fixed(&'static str, bool);

    impl ExternalTool for Fixed {
        fn key(&self) -> &'static str {
            self.0
        }

        fn describe(&self) -> String {
            format!("fixed {}", self.0)
        }

        fn probe(&self) -> Result<(), ToolError> {
            if self.1 {
                Ok(())
            } else {
                Err(ToolError::Cancelled {
                    tool: self.0.to_string(),
                })
            }
        }
    }

    #[test]
    fn registry_probes_in_key_order() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Box::new(Fixed("resample", false)))
            .register(Box::new(Fixed("register", true)));

        assert_eq!(registry.keys().collect::<Vec<_>>(), ["register", "resample"]);
        assert!(registry.get("register").is_some());
        assert!(registry.get("missing").is_none());

        let results = registry.probe_all();
        assert!(results[0].2.is_ok());
        assert!(results[1].2.is_err());
    }
}
