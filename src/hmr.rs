use std::{
  fs::{self, OpenOptions},
  io::Write,
  path::{Path, PathBuf},
  sync::mpsc::{Receiver, RecvTimeoutError},
  thread,
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
  clock::{now_ms, Millis},
  error::{BenchError, Phase},
  probe::PageEvent,
};

pub const ROOT_MARKER: &str = "root hmr";
pub const LEAF_MARKER: &str = "leaf hmr";

const ROOT_LINE: &str = "\n      console.log('root hmr', Date.now());\n      ";
const LEAF_LINE: &str = "\n        console.log('leaf hmr', Date.now());\n        ";

static CLIENT_STAMP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)").unwrap());

/// Which instrumented file a console line reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
  /// Carries the browser's own `Date.now()` at the time the update ran.
  Root(Option<Millis>),
  Leaf,
}

pub fn classify(text: &str) -> Option<Marker> {
  if text.contains(ROOT_MARKER) {
    let stamp = CLIENT_STAMP.captures(text).and_then(|c| c[1].parse().ok());
    Some(Marker::Root(stamp))
  } else if text.contains(LEAF_MARKER) {
    Some(Marker::Leaf)
  } else {
    None
  }
}

/// A source file with an instrumentation line appended, remembering its
/// original content so it can be put back byte for byte.
#[derive(Debug)]
pub struct Mutation {
  path: PathBuf,
  original: Vec<u8>,
  /// When the append finished.
  pub at: Millis,
  restored: bool,
}

impl Mutation {
  pub fn apply(path: &Path, line: &str) -> Result<Self> {
    let original = fs::read(path).with_context(|| format!("read {path:?}"))?;

    OpenOptions::new()
      .append(true)
      .open(path)
      .and_then(|mut file| file.write_all(line.as_bytes()))
      .with_context(|| format!("append to {path:?}"))?;

    Ok(Self {
      path: path.to_path_buf(),
      original,
      at: now_ms(),
      restored: false,
    })
  }

  pub fn restore(&mut self) -> Result<()> {
    if self.restored {
      return Ok(());
    }

    fs::write(&self.path, &self.original).map_err(|source| BenchError::FileRestore {
      path: self.path.clone(),
      source,
    })?;
    self.restored = true;

    Ok(())
  }
}

impl Drop for Mutation {
  fn drop(&mut self) {
    if let Err(err) = self.restore() {
      warn!("{err:#}");
    }
  }
}

/// Update latencies for one subject, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HmrTimes {
  pub root: Millis,
  pub leaf: Millis,
}

/// Accumulates marker observations from a page's event stream.
#[derive(Debug, Default)]
struct Session {
  root_start: Option<Millis>,
  leaf_start: Option<Millis>,
  root: Option<Millis>,
  leaf: Option<Millis>,
}

impl Session {
  fn done(&self) -> Option<HmrTimes> {
    Some(HmrTimes {
      root: self.root?,
      leaf: self.leaf?,
    })
  }

  fn observe(&mut self, event: PageEvent) {
    let (text, at) = match event {
      PageEvent::Console { text, at } => (text, at),
      PageEvent::Loaded { .. } => {
        debug!("page reloaded during hmr");
        return;
      }
    };

    match classify(&text) {
      Some(Marker::Root(stamp)) => match (self.root_start, self.root, stamp) {
        (Some(start), None, Some(client)) => {
          let hmr = client - start;
          info!(elapsed_ms = hmr, "root hmr");
          self.root = Some(hmr);
        }
        (Some(_), None, None) => warn!("root hmr marker without a timestamp: {text:?}"),
        _ => debug!("ignoring root hmr marker {text:?}"),
      },
      Some(Marker::Leaf) => match (self.leaf_start, self.leaf) {
        (Some(start), None) => {
          let hmr = at - start;
          info!(elapsed_ms = hmr, "leaf hmr");
          self.leaf = Some(hmr);
        }
        _ => debug!("ignoring leaf hmr marker {text:?}"),
      },
      None => debug!("console: {text}"),
    }
  }

  /// Handles events until `deadline`, or until both markers have been seen
  /// when `until_done` is set.
  fn pump(&mut self, events: &Receiver<PageEvent>, deadline: Instant, until_done: bool) -> Result<()> {
    loop {
      if until_done && self.done().is_some() {
        return Ok(());
      }

      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return Ok(());
      }

      match events.recv_timeout(remaining) {
        Ok(event) => self.observe(event),
        Err(RecvTimeoutError::Timeout) => return Ok(()),
        Err(RecvTimeoutError::Disconnected) => {
          // nothing more can arrive, the settle delays still apply
          if until_done {
            return Err(BenchError::Browser("page event stream closed during hmr".into()).into());
          }
          thread::sleep(remaining);
          return Ok(());
        }
      }
    }
  }
}

/// Mutates a shallow and a deeply nested source file in turn and times how
/// long each change takes to reach the page.
pub struct HmrTrigger {
  root: PathBuf,
  leaf: PathBuf,
  delay: Duration,
  timeout: Duration,
  mutations: Vec<Mutation>,
}

impl HmrTrigger {
  pub fn new(root: PathBuf, leaf: PathBuf, delay: Duration, timeout: Duration) -> Self {
    Self {
      root,
      leaf,
      delay,
      timeout,
      mutations: Vec::with_capacity(2),
    }
  }

  /// Runs root mutation, root marker, leaf mutation, leaf marker in that
  /// order, each mutation preceded by the settle delay. Files stay mutated
  /// until [`HmrTrigger::restore`].
  pub fn measure(&mut self, events: &Receiver<PageEvent>) -> Result<HmrTimes> {
    let mut session = Session::default();

    session.pump(events, Instant::now() + self.delay, false)?;
    let root = Mutation::apply(&self.root, ROOT_LINE).context("mutate root file")?;
    session.root_start = Some(root.at);
    self.mutations.push(root);

    session.pump(events, Instant::now() + self.delay, false)?;
    let leaf = Mutation::apply(&self.leaf, LEAF_LINE).context("mutate leaf file")?;
    session.leaf_start = Some(leaf.at);
    self.mutations.push(leaf);

    session.pump(events, Instant::now() + self.timeout, true)?;

    session.done().ok_or_else(|| {
      let phase = if session.root.is_none() { Phase::RootHmr } else { Phase::LeafHmr };
      BenchError::SignalTimeout {
        phase,
        timeout: self.timeout,
      }
      .into()
    })
  }

  /// Puts every mutated file back. All files are attempted before the first
  /// failure is returned.
  pub fn restore(&mut self) -> Result<()> {
    let mut first_error = None;

    for mut mutation in self.mutations.drain(..) {
      if let Err(err) = mutation.restore() {
        if first_error.is_none() {
          first_error = Some(err);
        }
      }
    }

    match first_error {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::mpsc::{self, Sender};

  use super::*;

  const ROOT_SOURCE: &str = "export const Triangle = () => <div />;\n";
  const LEAF_SOURCE: &str = "export const Leaf = () => <span>\u{25b2}</span>;\r\n";

  fn project() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("triangle.jsx");
    let leaf = dir.path().join("triangle_1_1_2_1_2_2_1.jsx");
    fs::write(&root, ROOT_SOURCE).unwrap();
    fs::write(&leaf, LEAF_SOURCE).unwrap();

    (dir, root, leaf)
  }

  fn console(text: &str, at: Millis) -> PageEvent {
    PageEvent::Console { text: text.into(), at }
  }

  #[test]
  fn classifies_markers() {
    assert_eq!(classify("root hmr 1717000000050"), Some(Marker::Root(Some(1717000000050))));
    assert_eq!(classify("root hmr"), Some(Marker::Root(None)));
    assert_eq!(classify("leaf hmr 1717000000090"), Some(Marker::Leaf));
    assert_eq!(classify("[vite] hot updated: /src/comps/triangle.jsx"), None);
  }

  #[test]
  fn root_uses_client_clock_and_leaf_uses_arrival_time() {
    let mut session = Session {
      root_start: Some(1717000000000),
      leaf_start: Some(1717000002000),
      ..Session::default()
    };

    session.observe(console("root hmr 1717000000050", 1717000000900));
    session.observe(console("leaf hmr 1717000001000", 1717000002080));

    assert_eq!(session.done(), Some(HmrTimes { root: 50, leaf: 80 }));
  }

  #[test]
  fn markers_before_their_mutation_are_ignored() {
    let mut session = Session {
      root_start: Some(1000),
      ..Session::default()
    };

    session.observe(console("leaf hmr", 1500));
    session.observe(console("root hmr 1040", 1600));
    session.observe(console("root hmr 1999", 1700));

    assert_eq!(session.root, Some(40));
    assert_eq!(session.leaf, None);
  }

  #[test]
  fn mutation_round_trips_bytes() {
    let (_dir, root, _) = project();

    let mut mutation = Mutation::apply(&root, ROOT_LINE).unwrap();
    assert!(fs::read_to_string(&root).unwrap().contains("console.log('root hmr', Date.now());"));

    mutation.restore().unwrap();
    assert_eq!(fs::read(&root).unwrap(), ROOT_SOURCE.as_bytes());
  }

  #[test]
  fn dropped_mutation_restores_file() {
    let (_dir, _, leaf) = project();

    drop(Mutation::apply(&leaf, LEAF_LINE).unwrap());

    assert_eq!(fs::read(&leaf).unwrap(), LEAF_SOURCE.as_bytes());
  }

  /// Plays the browser: answers each file mutation with its console marker.
  fn answer_mutations(events: Sender<PageEvent>, root: PathBuf, leaf: PathBuf, answer_leaf: bool) {
    thread::spawn(move || {
      let deadline = Instant::now() + Duration::from_secs(5);
      let mut root_sent = false;

      while Instant::now() < deadline {
        if !root_sent && fs::read_to_string(&root).unwrap_or_default().contains(ROOT_MARKER) {
          let _ = events.send(console(&format!("root hmr {}", now_ms() + 60), now_ms()));
          root_sent = true;
        }
        if answer_leaf && fs::read_to_string(&leaf).unwrap_or_default().contains(LEAF_MARKER) {
          thread::sleep(Duration::from_millis(90));
          let _ = events.send(console("leaf hmr", now_ms()));
          return;
        }
        thread::sleep(Duration::from_millis(5));
      }
    });
  }

  #[test]
  fn measures_both_updates_then_restores() {
    let (_dir, root, leaf) = project();
    let (tx, rx) = mpsc::channel();
    answer_mutations(tx, root.clone(), leaf.clone(), true);

    let mut trigger = HmrTrigger::new(root.clone(), leaf.clone(), Duration::from_millis(50), Duration::from_secs(5));
    let times = trigger.measure(&rx).unwrap();
    trigger.restore().unwrap();

    assert!((50..1000).contains(&times.root), "root {}", times.root);
    assert!((80..1000).contains(&times.leaf), "leaf {}", times.leaf);
    assert_eq!(fs::read(&root).unwrap(), ROOT_SOURCE.as_bytes());
    assert_eq!(fs::read(&leaf).unwrap(), LEAF_SOURCE.as_bytes());
  }

  #[test]
  fn missing_leaf_marker_times_out_and_files_are_restored() {
    let (_dir, root, leaf) = project();
    let (tx, rx) = mpsc::channel();
    answer_mutations(tx, root.clone(), leaf.clone(), false);

    let mut trigger = HmrTrigger::new(root.clone(), leaf.clone(), Duration::from_millis(20), Duration::from_millis(300));
    let err = trigger.measure(&rx).unwrap_err();
    trigger.restore().unwrap();

    assert!(matches!(
      err.downcast_ref::<BenchError>(),
      Some(BenchError::SignalTimeout { phase: Phase::LeafHmr, .. })
    ));
    assert_eq!(fs::read(&root).unwrap(), ROOT_SOURCE.as_bytes());
    assert_eq!(fs::read(&leaf).unwrap(), LEAF_SOURCE.as_bytes());
  }
}
