use std::{
  io::{BufRead, BufReader, Read},
  path::{Path, PathBuf},
  process::{Child, Command, ExitStatus, Stdio},
  sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
  thread,
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{debug, info, trace, warn};
use wait_timeout::ChildExt as WaitExt;

use crate::{
  config::{Settings, Subject},
  error::{BenchError, Phase},
  ext::{ChildExt, CommandExt, ExitStatusExt},
  extract::TimingPattern,
};

const POLL: Duration = Duration::from_millis(50);
/// How long output is still read after the process itself has exited.
const DRAIN: Duration = Duration::from_millis(250);
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  Idle,
  Starting,
  Ready,
  Stopped,
  Building,
  BuildComplete,
}

/// What ended a wait on a child's output.
enum Signal {
  Matched(f64),
  Exited(ExitStatus),
}

/// Owns the lifecycle of one subject's external processes: the long-running
/// dev server and the one-shot production build. At most one of them is
/// alive at a time.
pub struct Controller {
  subject: Subject,
  dir: PathBuf,
  ready_timeout: Duration,
  build_timeout: Duration,
  state: State,
  server: Option<Child>,
}

impl Controller {
  pub fn new(subject: Subject, settings: &Settings) -> Self {
    Self {
      subject,
      dir: settings.project_dir.clone(),
      ready_timeout: settings.ready_timeout,
      build_timeout: settings.build_timeout,
      state: State::Idle,
      server: None,
    }
  }

  pub fn subject(&self) -> &Subject {
    &self.subject
  }

  pub fn state(&self) -> State {
    self.state
  }

  /// Spawns the dev server and blocks until its ready line, returning the
  /// startup duration the tool reported.
  pub fn start_server(&mut self) -> Result<f64> {
    self.stop_server().context("stop previous server")?;

    info!(subject = %self.subject.label(), command = %self.subject.dev.join(" "), "starting dev server");
    self.state = State::Starting;

    let (child, output) = spawn(&self.subject.dev, &self.dir)?;
    let child = self.server.insert(child);

    let signal = watch(child, &output, &self.subject.ready, self.ready_timeout, Phase::Ready);

    match signal? {
      Signal::Matched(ms) => {
        self.state = State::Ready;
        info!(subject = %self.subject.label(), port = self.subject.port, elapsed_ms = ms, "dev server ready");

        Ok(ms)
      }
      Signal::Exited(status) => {
        self.server = None;
        self.state = State::Stopped;

        Err(
          BenchError::ProcessExit {
            command: self.subject.dev.join(" "),
            code: status.code(),
            phase: Phase::Ready,
          }
          .into(),
        )
      }
    }
  }

  /// Kills the dev server and everything it spawned. Safe to call when no
  /// server is running.
  pub fn stop_server(&mut self) -> Result<()> {
    let Some(mut child) = self.server.take() else {
      return Ok(());
    };

    drop(child.stdin.take());
    let status = child.terminate_tree(KILL_GRACE).context("terminate dev server")?;
    self.state = State::Stopped;

    info!(subject = %self.subject.label(), ?status, "dev server stopped");

    Ok(())
  }

  /// Runs the production build. Returns the duration the tool reported, or
  /// `None` if the build finished successfully without printing one.
  pub fn build(&mut self) -> Result<Option<f64>> {
    if self.server.is_some() {
      anyhow::bail!("{}: build requested while the dev server is running", self.subject.name);
    }

    info!(subject = %self.subject.label(), command = %self.subject.build.join(" "), "running build");
    self.state = State::Building;

    let (mut child, output) = spawn(&self.subject.build, &self.dir)?;

    let signal = match watch(&mut child, &output, &self.subject.build_done, self.build_timeout, Phase::Build) {
      Ok(signal) => signal,
      Err(err) => {
        let _ = child.terminate_tree(KILL_GRACE);
        return Err(err);
      }
    };

    let duration = match signal {
      Signal::Matched(ms) => {
        // let the tool finish writing its output before the next step
        if child.wait_timeout(KILL_GRACE).context("wait build")?.is_none() {
          child.terminate_tree(KILL_GRACE).context("terminate build")?;
        }

        Some(ms)
      }
      Signal::Exited(status) => {
        if let Some(code) = status.failure_code() {
          return Err(
            BenchError::ProcessExit {
              command: self.subject.build.join(" "),
              code: Some(code),
              phase: Phase::Build,
            }
            .into(),
          );
        }

        warn!(subject = %self.subject.label(), "build exited without a duration line");
        None
      }
    };

    self.state = State::BuildComplete;

    Ok(duration)
  }
}

impl Drop for Controller {
  fn drop(&mut self) {
    if let Err(err) = self.stop_server() {
      warn!(subject = %self.subject.name, "{err:#}");
    }
  }
}

/// Spawns `argv` in `dir`, returning the child and a channel fed with its
/// stdout lines. Stderr is only logged.
fn spawn(argv: &[String], dir: &Path) -> Result<(Child, Receiver<String>)> {
  let mut child = Command::from_argv(argv)?
    .current_dir(dir)
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .map_err(|source| BenchError::ProcessSpawn {
      command: argv.join(" "),
      source,
    })?;

  let (tx, rx) = mpsc::channel();
  let stdout = child.stdout.take().context("stdout")?;
  let stderr = child.stderr.take().context("stderr")?;

  thread::spawn(move || forward_lines(stdout, "stdout", Some(tx)));
  thread::spawn(move || forward_lines(stderr, "stderr", None));

  Ok((child, rx))
}

/// Reads `stream` to the end. A long-running server must never block on a
/// full pipe, so reading continues after the receiver is gone. Bytes that are
/// not UTF-8 are replaced rather than ending the stream.
fn forward_lines<R: Read>(stream: R, name: &'static str, mut tx: Option<Sender<String>>) {
  let mut reader = BufReader::new(stream);
  let mut buf = Vec::new();

  loop {
    buf.clear();
    match reader.read_until(b'\n', &mut buf) {
      Ok(0) => break,
      Ok(_) => {}
      Err(err) => {
        debug!(stream = name, "read failed: {err}");
        break;
      }
    }

    let line = String::from_utf8_lossy(&buf).trim_end_matches(['\n', '\r']).to_string();
    trace!(stream = name, "{line}");

    if let Some(sender) = tx.take() {
      if sender.send(line).is_ok() {
        tx = Some(sender);
      }
    }
  }
}

/// Waits until a stdout line matches `pattern` or the child exits, whichever
/// comes first. Lines already written when the child exits are still
/// matched.
fn watch(
  child: &mut Child,
  output: &Receiver<String>,
  pattern: &TimingPattern,
  timeout: Duration,
  phase: Phase,
) -> Result<Signal> {
  let deadline = Instant::now() + timeout;
  let mut open = true;
  let mut exited: Option<(ExitStatus, Instant)> = None;

  loop {
    let now = Instant::now();
    if now >= deadline {
      return Err(BenchError::SignalTimeout { phase, timeout }.into());
    }

    if open {
      match output.recv_timeout(POLL.min(deadline - now)) {
        Ok(line) => {
          if let Some(ms) = pattern.extract(&line) {
            return Ok(Signal::Matched(ms));
          }
          continue;
        }
        Err(RecvTimeoutError::Timeout) => {}
        Err(RecvTimeoutError::Disconnected) => open = false,
      }
    } else {
      thread::sleep(POLL.min(deadline - now));
    }

    if exited.is_none() {
      if let Some(status) = child.try_wait().context("try_wait")? {
        exited = Some((status, Instant::now()));
      }
    }

    if let Some((status, at)) = exited {
      if !open || at.elapsed() >= DRAIN {
        return Ok(Signal::Exited(status));
      }
    }
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;

  fn subject(dev: &str, build: &str) -> Subject {
    Subject {
      name: "ToolX".into(),
      port: 4000,
      dev: vec!["sh".into(), "-c".into(), dev.into()],
      ready: TimingPattern::new(r"Ready\s*in\s*(.+?)\s*(ms|s)\b").unwrap(),
      build: vec!["sh".into(), "-c".into(), build.into()],
      build_done: TimingPattern::new(r"completed\s*in\s*(\d+)(m?ms)").unwrap(),
      launcher: None,
      skip_hmr: false,
      color: colored::Color::Blue,
    }
  }

  fn controller(dev: &str, build: &str) -> Controller {
    let settings = Settings {
      ready_timeout: Duration::from_secs(5),
      build_timeout: Duration::from_secs(5),
      ..Settings::default()
    };

    Controller::new(subject(dev, build), &settings)
  }

  fn kind(err: &anyhow::Error) -> &BenchError {
    err.downcast_ref::<BenchError>().unwrap()
  }

  #[test]
  fn server_reports_ready_time_and_stops() {
    let mut tool = controller("echo booting; printf '\\033[32mReady in 1.2s\\033[0m\\n'; sleep 30", "true");

    assert_eq!(tool.start_server().unwrap(), 1200.0);
    assert_eq!(tool.state(), State::Ready);

    tool.stop_server().unwrap();
    assert_eq!(tool.state(), State::Stopped);
    tool.stop_server().unwrap();
  }

  #[test]
  fn stop_before_start_is_harmless() {
    let mut tool = controller("sleep 30", "true");

    tool.stop_server().unwrap();
    assert_eq!(tool.state(), State::Idle);
  }

  #[test]
  fn server_failing_before_ready_is_rejected() {
    let mut tool = controller("echo oops; exit 2", "true");

    let err = tool.start_server().unwrap_err();

    assert!(matches!(
      kind(&err),
      BenchError::ProcessExit {
        code: Some(2),
        phase: Phase::Ready,
        ..
      }
    ));
    tool.stop_server().unwrap();
  }

  #[test]
  fn ready_line_printed_just_before_exit_still_counts() {
    let mut tool = controller("echo 'Ready in 80ms'; exit 1", "true");

    assert_eq!(tool.start_server().unwrap(), 80.0);
  }

  #[test]
  fn undecodable_output_before_ready_line() {
    let mut tool = controller("printf 'building \\377\\n'; sleep 0.2; echo 'Ready in 80ms'; sleep 30", "true");

    assert_eq!(tool.start_server().unwrap(), 80.0);
    tool.stop_server().unwrap();
  }

  #[test]
  fn silent_server_times_out() {
    let mut tool = controller("sleep 30", "true");
    tool.ready_timeout = Duration::from_millis(300);

    let err = tool.start_server().unwrap_err();

    assert!(matches!(kind(&err), BenchError::SignalTimeout { phase: Phase::Ready, .. }));
    tool.stop_server().unwrap();
    assert_eq!(tool.state(), State::Stopped);
  }

  #[test]
  fn build_reports_duration() {
    let mut tool = controller("true", "echo 'Build completed in 350ms'");

    assert_eq!(tool.build().unwrap(), Some(350.0));
    assert_eq!(tool.state(), State::BuildComplete);
  }

  #[test]
  fn build_without_duration_line() {
    let mut tool = controller("true", "echo done");

    assert_eq!(tool.build().unwrap(), None);
  }

  #[test]
  fn failed_build_is_rejected() {
    let mut tool = controller("true", "echo broken >&2; exit 1");

    let err = tool.build().unwrap_err();

    assert!(matches!(kind(&err), BenchError::ProcessExit { phase: Phase::Build, .. }));
  }

  #[test]
  fn missing_executable_is_a_spawn_error() {
    let mut tool = controller("true", "true");
    tool.subject.dev = vec!["/nonexistent/devserver-bench-tool".into()];

    let err = tool.start_server().unwrap_err();

    assert!(matches!(kind(&err), BenchError::ProcessSpawn { .. }));
  }
}
