use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::ScriptError;

/// How the shutdown script ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptOutcome {
    Exited(i32),
    /// Killed by a signal or otherwise ended without an exit code.
    Abnormal,
}

/// Runs the final shutdown step. Blocks until the child exits.
pub trait ScriptRunner {
    fn run(&mut self, path: &Path) -> Result<ScriptOutcome, ScriptError>;
}

/// Spawns the script with no arguments and the inherited environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemScriptRunner;

impl ScriptRunner for SystemScriptRunner {
    fn run(&mut self, path: &Path) -> Result<ScriptOutcome, ScriptError> {
        let mut child = Command::new(path).spawn().map_err(|source| ScriptError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

        let status = child.wait().map_err(|source| ScriptError::Wait {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(match status.code() {
            Some(code) => ScriptOutcome::Exited(code),
            None => ScriptOutcome::Abnormal,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_reported() {
        let mut runner = SystemScriptRunner;
        assert_eq!(runner.run(Path::new("true")).unwrap(), ScriptOutcome::Exited(0));
        assert_eq!(runner.run(Path::new("false")).unwrap(), ScriptOutcome::Exited(1));
    }

    #[test]
    fn test_missing_script_is_a_spawn_error() {
        let mut runner = SystemScriptRunner;
        let err = runner
            .run(Path::new("/nonexistent/obswatch-shutdown-script"))
            .unwrap_err();
        assert!(matches!(err, ScriptError::Spawn { .. }));
    }
}
