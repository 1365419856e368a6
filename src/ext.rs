use std::{
  collections::HashMap,
  process::{Child, Command, ExitStatus},
  time::Duration,
};

use anyhow::{Context, Result};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use wait_timeout::ChildExt as WaitExt;

#[extend::ext]
pub impl ExitStatus {
  /// The exit code if the process failed with one. A process killed by a
  /// signal has no code and does not count as a failure.
  fn failure_code(&self) -> Option<i32> {
    match self.code() {
      Some(0) | None => None,
      Some(code) => Some(code),
    }
  }
}

#[extend::ext]
pub impl Child {
  /// Signals the child and all of its descendants, then reaps the child.
  /// Falls back to a hard kill if it is still alive after `grace`.
  fn terminate_tree(&mut self, grace: Duration) -> Result<Option<ExitStatus>> {
    if let Some(status) = self.try_wait().context("try_wait")? {
      return Ok(Some(status));
    }

    signal_tree(self.id(), Signal::Term);

    if let Some(status) = self.wait_timeout(grace).context("wait")? {
      return Ok(Some(status));
    }

    signal_tree(self.id(), Signal::Kill);
    let _ = self.kill();

    Ok(self.wait_timeout(grace).context("wait after kill")?)
  }
}

#[extend::ext]
pub impl Command {
  /// Builds a command from an argv list.
  fn from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv.split_first().context("empty command")?;
    let mut command = Command::new(program);
    command.args(args);

    Ok(command)
  }
}

/// Sends `signal` to `root` and every process below it, leaves first.
fn signal_tree(root: u32, signal: Signal) {
  let mut sys = System::new();
  sys.refresh_processes(ProcessesToUpdate::All, true);

  let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
  for (pid, process) in sys.processes() {
    if let Some(parent) = process.parent() {
      children.entry(parent).or_default().push(*pid);
    }
  }

  let mut tree = Vec::new();
  collect_tree(Pid::from_u32(root), &children, &mut tree);

  for pid in tree.into_iter().rev() {
    if let Some(process) = sys.process(pid) {
      if process.kill_with(signal) != Some(true) {
        process.kill();
      }
    }
  }
}

fn collect_tree(pid: Pid, children: &HashMap<Pid, Vec<Pid>>, out: &mut Vec<Pid>) {
  out.push(pid);
  for child in children.get(&pid).into_iter().flatten() {
    collect_tree(*child, children, out);
  }
}

#[cfg(all(test, unix))]
mod tests {
  use std::{process::Stdio, time::Instant};

  use super::*;

  #[test]
  fn from_argv_rejects_empty() {
    assert!(Command::from_argv(&[]).is_err());
  }

  #[test]
  fn failure_code_ignores_success() {
    let ok = Command::new("true").status().unwrap();
    let failed = Command::new("sh").args(["-c", "exit 3"]).status().unwrap();

    assert_eq!(ok.failure_code(), None);
    assert_eq!(failed.failure_code(), Some(3));
  }

  #[test]
  fn terminate_tree_kills_grandchildren() {
    let mut child = Command::new("sh")
      .args(["-c", "sleep 30 & sleep 30; wait"])
      .stdout(Stdio::null())
      .spawn()
      .unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    let status = child.terminate_tree(Duration::from_secs(5)).unwrap();

    assert!(status.is_some());
    assert!(started.elapsed() < Duration::from_secs(10));
    // a second call on a reaped child is harmless
    assert!(child.terminate_tree(Duration::from_millis(10)).is_ok());
  }
}
