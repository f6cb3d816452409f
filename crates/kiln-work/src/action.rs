use std::{
    collections::BTreeMap,
    fmt, io,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use itertools::join;
use kiln_types::NodeId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often a running command is checked for exit and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} exited with {}", .code.map_or_else(|| "a signal".to_string(), |code| format!("code {code}")))]
    Exit { command: String, code: Option<i32> },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ActionError::Failed(message.into())
    }
}

/// What an action may know about the node it runs for.
pub struct ActionContext<'a> {
    pub(crate) id: &'a NodeId,
    pub(crate) working_dir: &'a Utf8Path,
    pub(crate) outputs: &'a BTreeMap<String, Vec<Utf8PathBuf>>,
    pub(crate) cancel: &'a CancellationToken,
}

impl<'a> ActionContext<'a> {
    pub fn id(&self) -> &NodeId {
        self.id
    }

    /// The node's root for tasks, the workspace output directory for
    /// transforms.
    pub fn working_dir(&self) -> &Utf8Path {
        self.working_dir
    }

    /// Resolved locations of an output property.
    pub fn output(&self, property: &str) -> Option<&[Utf8PathBuf]> {
        self.outputs.get(property).map(Vec::as_slice)
    }

    pub fn outputs(&self) -> &BTreeMap<String, Vec<Utf8PathBuf>> {
        self.outputs
    }

    /// Long running actions should check this and stop early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The work a node performs once it is known to be out of date.
pub trait WorkAction: Send + Sync {
    fn execute(&self, context: &ActionContext<'_>) -> Result<(), ActionError>;

    /// Identity of the implementation. Changing it invalidates history and
    /// cache entries.
    fn implementation(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// An action backed by a closure.
pub struct FnAction<F> {
    name: String,
    action: F,
}

impl<F> FnAction<F>
where
    F: Fn(&ActionContext<'_>) -> Result<(), ActionError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, action: F) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }
}

impl<F> WorkAction for FnAction<F>
where
    F: Fn(&ActionContext<'_>) -> Result<(), ActionError> + Send + Sync,
{
    fn execute(&self, context: &ActionContext<'_>) -> Result<(), ActionError> {
        (self.action)(context)
    }

    fn implementation(&self) -> String {
        self.name.clone()
    }
}

/// Runs an external program in the action's working directory.
///
/// The node id is exported as `KILN_NODE_ID`. The child is killed if the
/// build is cancelled while it runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandAction {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandAction {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl WorkAction for CommandAction {
    fn execute(&self, context: &ActionContext<'_>) -> Result<(), ActionError> {
        let command = self.to_string();
        debug!("running `{command}` in {}", context.working_dir());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .env("KILN_NODE_ID", context.id().as_str())
            .current_dir(context.working_dir())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ActionError::Spawn {
                command: command.clone(),
                source,
            })?;

        loop {
            if let Some(status) = child.try_wait()? {
                return if status.success() {
                    Ok(())
                } else {
                    Err(ActionError::Exit {
                        command,
                        code: status.code(),
                    })
                };
            }
            if context.is_cancelled() {
                debug!("killing `{command}`, the build was cancelled");
                // The child may have exited in the meantime.
                let _ = child.kill();
                let _ = child.wait();
                return Err(ActionError::Cancelled);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn implementation(&self) -> String {
        format!(
            "command:{}",
            join(
                std::iter::once(&self.program).chain(&self.args),
                "\u{1f}"
            )
        )
    }
}
