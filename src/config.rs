use std::{
  fs,
  path::{Path, PathBuf},
  str::FromStr,
  time::Duration,
};

use anyhow::{Context, Result};
use colored::{Color, ColoredString, Colorize};
use serde::Deserialize;

use crate::extract::TimingPattern;

/// One benchmarked tool configuration.
#[derive(Debug, Clone)]
pub struct Subject {
  /// Display name, including version and an optional "(Hot)" suffix.
  pub name: String,
  /// Fixed local port the dev server listens on, reused every trial.
  pub port: u16,
  /// argv of the dev-server command.
  pub dev: Vec<String>,
  pub ready: TimingPattern,
  /// argv of the production build command.
  pub build: Vec<String>,
  pub build_done: TimingPattern,
  /// Launcher script (relative to `node_modules`) that gets a start-time line.
  pub launcher: Option<PathBuf>,
  pub skip_hmr: bool,
  pub color: Color,
}

impl Subject {
  /// The subject name painted in its brand color, for logs and tables.
  pub fn label(&self) -> ColoredString {
    self.name.color(self.color)
  }

  pub fn url(&self) -> String {
    format!("http://localhost:{}", self.port)
  }
}

/// On-disk representation of a subject, see [`load_subjects`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubjectEntry {
  name: String,
  port: u16,
  dev: Vec<String>,
  ready_pattern: String,
  build: Vec<String>,
  build_pattern: String,
  #[serde(default)]
  launcher: Option<PathBuf>,
  #[serde(default)]
  skip_hmr: bool,
  #[serde(default)]
  color: Option<String>,
}

impl TryFrom<SubjectEntry> for Subject {
  type Error = anyhow::Error;

  fn try_from(entry: SubjectEntry) -> Result<Self> {
    if entry.dev.is_empty() || entry.build.is_empty() {
      anyhow::bail!("{}: `dev` and `build` must not be empty", entry.name);
    }

    let color = match entry.color.as_deref() {
      Some(color) => Color::from_str(color).map_err(|_| anyhow::anyhow!("{}: unknown color {color:?}", entry.name))?,
      None => Color::White,
    };

    Ok(Subject {
      ready: TimingPattern::new(&entry.ready_pattern).with_context(|| format!("{} ready_pattern", entry.name))?,
      build_done: TimingPattern::new(&entry.build_pattern).with_context(|| format!("{} build_pattern", entry.name))?,
      name: entry.name,
      port: entry.port,
      dev: entry.dev,
      build: entry.build,
      launcher: entry.launcher,
      skip_hmr: entry.skip_hmr,
      color,
    })
  }
}

/// Reads a JSON array of subjects.
pub fn load_subjects(path: &Path) -> Result<Vec<Subject>> {
  let text = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;
  let entries: Vec<SubjectEntry> = serde_json::from_str(&text).with_context(|| format!("parse {path:?}"))?;

  entries.into_iter().map(Subject::try_from).collect()
}

fn npm() -> &'static str {
  if cfg!(windows) {
    "npm.cmd"
  } else {
    "npm"
  }
}

fn npm_run(script: &str) -> Vec<String> {
  vec![npm().to_string(), "run".to_string(), script.to_string()]
}

struct Tool {
  name: &'static str,
  port: u16,
  dev_script: &'static str,
  ready: &'static str,
  build_script: &'static str,
  build_done: &'static str,
  launcher: &'static str,
  color: Color,
}

const TOOLS: &[Tool] = &[
  Tool {
    name: "Farm 1.1.7",
    port: 9000,
    dev_script: "start",
    ready: r"Ready\s*in\s*(.+?)\s*(ms|s)\b",
    build_script: "build",
    build_done: r"completed\s*in\s*(\d+)(m?ms)",
    launcher: "@farmfe/cli/bin/farm.mjs",
    color: Color::Magenta,
  },
  Tool {
    name: "Rspack 0.6.5",
    port: 8080,
    dev_script: "start:rspack",
    ready: r"in\s+(.+) (s|ms)",
    build_script: "build:rspack",
    build_done: r"in\s+(.+) (s|ms)",
    launcher: "@rspack/cli/bin/rspack",
    color: Color::Green,
  },
  Tool {
    name: "Vite 6.0.0-alpha",
    port: 5173,
    dev_script: "start:vite",
    ready: r"ready\s*in\s*(.+?)\s*(ms|s)\b",
    build_script: "build:vite",
    build_done: r"built\s*in\s*(\d*\.\d*)\s*(s|ms)",
    launcher: "vite/bin/vite.js",
    color: Color::Yellow,
  },
  Tool {
    name: "Webpack(babel) 5.91.0",
    port: 8081,
    dev_script: "start:webpack",
    ready: r"compiled\s+.+\sin\s+(\d+)\s+ms",
    build_script: "build:webpack",
    build_done: r"in\s+(\d+)\s+(ms|s)",
    launcher: "webpack-cli/bin/cli.js",
    color: Color::Cyan,
  },
];

/// The built-in subject table: every tool once cold and once as a "(Hot)"
/// re-run on a warm cache. Both go through the full HMR measurement.
pub fn default_subjects() -> Result<Vec<Subject>> {
  let mut subjects = Vec::with_capacity(TOOLS.len() * 2);

  for tool in TOOLS {
    for hot in [false, true] {
      subjects.push(Subject {
        name: if hot { format!("{} (Hot)", tool.name) } else { tool.name.to_string() },
        port: tool.port,
        dev: npm_run(tool.dev_script),
        ready: TimingPattern::new(tool.ready)?,
        build: npm_run(tool.build_script),
        build_done: TimingPattern::new(tool.build_done)?,
        launcher: Some(PathBuf::from(tool.launcher)),
        skip_hmr: false,
        color: tool.color,
      });
    }
  }

  Ok(subjects)
}

/// Knobs for a benchmark run. Delays are fixed settle times between phases,
/// timeouts bound every wait on an external signal.
#[derive(Debug, Clone)]
pub struct Settings {
  pub trials: usize,
  pub project_dir: PathBuf,
  pub root_file: PathBuf,
  pub leaf_file: PathBuf,
  pub cache_dirs: Vec<PathBuf>,
  pub mutation_delay: Duration,
  pub teardown_delay: Duration,
  pub build_settle_delay: Duration,
  pub ready_timeout: Duration,
  pub navigation_timeout: Duration,
  pub hmr_timeout: Duration,
  pub build_timeout: Duration,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      trials: 3,
      project_dir: PathBuf::from("."),
      root_file: PathBuf::from("src/comps/triangle.jsx"),
      leaf_file: PathBuf::from("src/comps/triangle_1_1_2_1_2_2_1.jsx"),
      cache_dirs: vec![
        PathBuf::from("node_modules/.farm"),
        PathBuf::from("node_modules/.cache"),
        PathBuf::from("node_modules/.vite"),
      ],
      mutation_delay: Duration::from_secs(1),
      teardown_delay: Duration::from_millis(500),
      build_settle_delay: Duration::from_millis(500),
      ready_timeout: Duration::from_secs(120),
      navigation_timeout: Duration::from_secs(60),
      hmr_timeout: Duration::from_secs(30),
      build_timeout: Duration::from_secs(300),
    }
  }
}

impl Settings {
  pub fn root_path(&self) -> PathBuf {
    self.project_dir.join(&self.root_file)
  }

  pub fn leaf_path(&self) -> PathBuf {
    self.project_dir.join(&self.leaf_file)
  }
}
