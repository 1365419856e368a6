use std::{fmt, path::PathBuf, time::Duration};

use thiserror::Error;

/// The waits that are bounded by a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Ready,
  RootHmr,
  LeafHmr,
  Build,
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Phase::Ready => "ready signal",
      Phase::RootHmr => "root hmr marker",
      Phase::LeafHmr => "leaf hmr marker",
      Phase::Build => "build completion",
    };

    f.write_str(name)
  }
}

/// Failures that abort a benchmark run. They travel inside `anyhow::Error`, so
/// callers that care about the kind can `downcast_ref::<BenchError>()`.
#[derive(Debug, Error)]
pub enum BenchError {
  #[error("failed to spawn {command:?}: {source}")]
  ProcessSpawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  /// `code` is `None` when the process was killed by a signal.
  #[error("{command:?} exited with {} before {phase}", .code.map_or("no code".to_string(), |c| format!("code {c}")))]
  ProcessExit {
    command: String,
    code: Option<i32>,
    phase: Phase,
  },

  #[error("{url} did not load within {timeout:?}")]
  NavigationTimeout { url: String, timeout: Duration },

  #[error("no {phase} within {timeout:?}")]
  SignalTimeout { phase: Phase, timeout: Duration },

  #[error("failed to restore {path:?}: {source}")]
  FileRestore {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("browser: {0}")]
  Browser(String),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exit_message_names_code_and_phase() {
    let err = BenchError::ProcessExit {
      command: "npm run start".into(),
      code: Some(0),
      phase: Phase::Ready,
    };

    assert_eq!(err.to_string(), "\"npm run start\" exited with code 0 before ready signal");
  }

  #[test]
  fn kind_survives_anyhow_context() {
    let err = anyhow::Error::new(BenchError::SignalTimeout {
      phase: Phase::LeafHmr,
      timeout: Duration::from_secs(1),
    })
    .context("hmr");

    assert!(matches!(
      err.downcast_ref::<BenchError>(),
      Some(BenchError::SignalTimeout { phase: Phase::LeafHmr, .. })
    ));
  }
}
