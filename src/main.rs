mod cache;
mod clock;
mod config;
mod error;
mod ext;
mod extract;
mod format;
mod hmr;
mod launcher;
mod probe;
mod process;
mod runner;
mod stats;

use std::{
  fs,
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use self::{
  config::{Settings, Subject},
  extract::TimingPattern,
  probe::ChromeBrowser,
  runner::TrialRunner,
};

#[derive(Parser)]
#[command(version, about = "Compares dev-server startup, HMR and build times of web build tools")]
struct Args {
  /// Log debug output, including the tools' own output with `RUST_LOG=trace`.
  #[arg(short, long, global = true)]
  verbose: bool,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Benchmark every subject.
  Run(RunArgs),
  /// List the configured subjects.
  Subjects {
    /// JSON file with the subject list, instead of the built-in table.
    #[arg(long)]
    config: Option<PathBuf>,
  },
  /// Apply a timing pattern to a line of output.
  Extract {
    #[arg(long)]
    pattern: String,
    text: String,
  },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
  /// Number of trials to average over.
  #[arg(short = 'n', long, default_value_t = 3)]
  trials: usize,
  /// JSON file with the subject list, instead of the built-in table.
  #[arg(long)]
  config: Option<PathBuf>,
  /// Project the tools are run in.
  #[arg(long, default_value = ".")]
  project_dir: PathBuf,
  /// Shallow component mutated for the root HMR measurement.
  #[arg(long, default_value = "src/comps/triangle.jsx")]
  root_file: PathBuf,
  /// Deeply nested component mutated for the leaf HMR measurement.
  #[arg(long, default_value = "src/comps/triangle_1_1_2_1_2_2_1.jsx")]
  leaf_file: PathBuf,
  /// Only run subjects whose name contains one of these.
  #[arg(long)]
  only: Vec<String>,
  /// Cache directory removed before each trial, relative to the project.
  #[arg(long = "cache-dir")]
  cache_dirs: Vec<PathBuf>,
  #[arg(long, default_value_t = 60)]
  navigation_timeout_secs: u64,
  #[arg(long, default_value_t = 30)]
  hmr_timeout_secs: u64,
  #[arg(long, default_value_t = 120)]
  ready_timeout_secs: u64,
  #[arg(long, default_value_t = 300)]
  build_timeout_secs: u64,
  /// Chrome/Chromium binary, auto-detected if omitted.
  #[arg(long)]
  chrome: Option<PathBuf>,
  /// Write the averaged numbers as JSON chart data.
  #[arg(long)]
  json: Option<PathBuf>,
  /// Do not add the start-time line to the tools' launchers.
  #[arg(long)]
  no_patch_launchers: bool,
}

impl RunArgs {
  fn settings(&self) -> Settings {
    let defaults = Settings::default();

    Settings {
      trials: self.trials,
      project_dir: self.project_dir.clone(),
      root_file: self.root_file.clone(),
      leaf_file: self.leaf_file.clone(),
      cache_dirs: if self.cache_dirs.is_empty() {
        defaults.cache_dirs
      } else {
        self.cache_dirs.clone()
      },
      navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
      hmr_timeout: Duration::from_secs(self.hmr_timeout_secs),
      ready_timeout: Duration::from_secs(self.ready_timeout_secs),
      build_timeout: Duration::from_secs(self.build_timeout_secs),
      ..defaults
    }
  }
}

fn init_tracing(verbose: bool) {
  let level = if verbose { "devserver_bench=debug" } else { "devserver_bench=info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

fn subjects(config: Option<&Path>) -> Result<Vec<Subject>> {
  match config {
    Some(path) => config::load_subjects(path).context("load subjects"),
    None => config::default_subjects().context("default subjects"),
  }
}

fn patch_launchers(subjects: &[Subject], project_dir: &Path) -> Result<()> {
  for subject in subjects {
    let Some(bin) = &subject.launcher else {
      continue;
    };

    let path = project_dir.join("node_modules").join(bin);
    if launcher::patch(&path).with_context(|| format!("patch launcher of {}", subject.name))? {
      info!(subject = %subject.label(), path = %path.display(), "patched launcher");
    }
  }

  Ok(())
}

fn run(args: RunArgs) -> Result<()> {
  if args.trials == 0 {
    anyhow::bail!("at least one trial is required");
  }
  if !args.project_dir.exists() {
    anyhow::bail!("{:?} does not exist", args.project_dir);
  }

  let mut subjects = subjects(args.config.as_deref())?;
  if !args.only.is_empty() {
    subjects.retain(|s| args.only.iter().any(|only| s.name.contains(only.as_str())));
  }
  if subjects.is_empty() {
    anyhow::bail!("no subjects selected");
  }

  if !args.no_patch_launchers {
    patch_launchers(&subjects, &args.project_dir)?;
  }

  let settings = args.settings();
  let browser = ChromeBrowser::launch(args.chrome.clone())?;

  info!(trials = settings.trials, "running benchmark, please wait...");

  let mut results = Vec::with_capacity(settings.trials);
  TrialRunner::new(subjects, &browser, settings).run(&mut results)?;

  let aggregate = stats::aggregate(&results);
  info!(runs = aggregate.trials, "averaged results");

  if let Some(path) = &args.json {
    let chart = serde_json::to_vec_pretty(&aggregate.chart()).context("serialize chart data")?;
    fs::write(path, chart).with_context(|| format!("write {path:?}"))?;
  }

  println!("{}", format::format(&aggregate).context("format")?);

  Ok(())
}

fn main() -> Result<()> {
  let args = Args::parse();
  init_tracing(args.verbose);

  match args.command {
    Command::Run(run_args) => run(run_args)?,
    Command::Subjects { config } => {
      for subject in subjects(config.as_deref())? {
        println!(
          "{:<32} :{:<5}  dev: {:<24} build: {:<24}{}",
          subject.label(),
          subject.port,
          subject.dev.join(" "),
          subject.build.join(" "),
          if subject.skip_hmr { "  (no hmr)" } else { "" },
        );
      }
    }
    Command::Extract { pattern, text } => {
      let pattern = TimingPattern::new(&pattern)?;
      match extract::extract(&pattern, &text) {
        Some(ms) => println!("{ms}ms"),
        None => println!("no match for {:?}", pattern.as_str()),
      }
    }
  }

  Ok(())
}
