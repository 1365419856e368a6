use std::{collections::BTreeMap, fmt};

use serde::Serialize;

/// A named measurement taken for every subject in every trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
  Startup,
  ServerStartTime,
  OnLoadTime,
  RootHmr,
  LeafHmr,
  BuildTime,
}

impl Metric {
  pub const ALL: [Metric; 6] = [
    Metric::Startup,
    Metric::ServerStartTime,
    Metric::OnLoadTime,
    Metric::RootHmr,
    Metric::LeafHmr,
    Metric::BuildTime,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Metric::Startup => "startup(serverStartTime + onLoadTime)",
      Metric::ServerStartTime => "serverStartTime",
      Metric::OnLoadTime => "onLoadTime",
      Metric::RootHmr => "rootHmr",
      Metric::LeafHmr => "leafHmr",
      Metric::BuildTime => "buildTime",
    }
  }

  pub fn is_hmr(self) -> bool {
    matches!(self, Metric::RootHmr | Metric::LeafHmr)
  }
}

impl fmt::Display for Metric {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Measurements for a single subject in a single trial, in milliseconds. A
/// metric whose signal never matched is simply absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
  pub metrics: BTreeMap<Metric, f64>,
  pub skip_hmr: bool,
}

impl Record {
  pub fn set(&mut self, metric: Metric, value: f64) {
    self.metrics.insert(metric, value);
  }

  pub fn get(&self, metric: Metric) -> Option<f64> {
    self.metrics.get(&metric).copied()
  }
}

/// All subject records of one trial, in the order the subjects ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialResult {
  records: Vec<(String, Record)>,
}

impl TrialResult {
  /// Adds a finished subject. Records are never changed once pushed.
  pub fn push(&mut self, name: String, record: Record) {
    self.records.push((name, record));
  }

  pub fn get(&self, name: &str) -> Option<&Record> {
    self.records.iter().find(|(n, _)| n == name).map(|(_, r)| r)
  }

  pub fn records(&self) -> impl Iterator<Item = (&str, &Record)> {
    self.records.iter().map(|(n, r)| (n.as_str(), r))
  }
}

/// One cell of the aggregate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
  /// Floored arithmetic mean in milliseconds.
  Mean(i64),
  /// The metric was missing from at least one trial.
  Error,
  /// HMR is not measured for this subject.
  Skipped,
}

impl fmt::Display for Cell {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Cell::Mean(ms) => write!(f, "{ms}ms"),
      Cell::Error => f.write_str("Calculation error"),
      Cell::Skipped => f.write_str("-"),
    }
  }
}

/// Per-subject, per-metric means over every trial of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
  pub trials: usize,
  pub rows: Vec<(String, BTreeMap<Metric, Cell>)>,
}

impl Aggregate {
  pub fn get(&self, name: &str, metric: Metric) -> Option<Cell> {
    let (_, cells) = self.rows.iter().find(|(n, _)| n == name)?;
    cells.get(&metric).copied()
  }

  /// The numeric means only, keyed by subject and metric name, as consumed by
  /// chart renderers.
  pub fn chart(&self) -> ChartData {
    let subjects = self
      .rows
      .iter()
      .map(|(name, cells)| {
        let means = cells
          .iter()
          .filter_map(|(metric, cell)| match cell {
            Cell::Mean(ms) => Some((metric.name(), *ms)),
            Cell::Error | Cell::Skipped => None,
          })
          .collect();

        (name.clone(), means)
      })
      .collect();

    ChartData { subjects }
  }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct ChartData {
  subjects: BTreeMap<String, BTreeMap<&'static str, i64>>,
}

/// Averages `trials` into one table. Subjects keep the order they were first
/// seen in. A metric is only averaged if every trial recorded it.
pub fn aggregate(trials: &[TrialResult]) -> Aggregate {
  let mut names: Vec<&str> = Vec::new();
  for trial in trials {
    for (name, _) in trial.records() {
      if !names.contains(&name) {
        names.push(name);
      }
    }
  }

  let rows = names
    .into_iter()
    .map(|name| {
      let records: Vec<Option<&Record>> = trials.iter().map(|t| t.get(name)).collect();
      let skip_hmr = records.iter().flatten().any(|r| r.skip_hmr);

      let cells = Metric::ALL
        .into_iter()
        .map(|metric| {
          let cell = if skip_hmr && metric.is_hmr() {
            Cell::Skipped
          } else {
            mean(records.iter().map(|r| r.and_then(|r| r.get(metric))))
          };

          (metric, cell)
        })
        .collect();

      (name.to_string(), cells)
    })
    .collect();

  Aggregate {
    trials: trials.len(),
    rows,
  }
}

fn mean<I: Iterator<Item = Option<f64>>>(values: I) -> Cell {
  let mut sum = 0.0;
  let mut count = 0usize;

  for value in values {
    let Some(value) = value else {
      return Cell::Error;
    };
    sum += value;
    count += 1;
  }

  if count == 0 {
    return Cell::Error;
  }

  Cell::Mean((sum / count as f64).floor() as i64)
}
