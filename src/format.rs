use std::fmt::Write;

use anyhow::Result;

use crate::stats::{Aggregate, Metric};

const COLUMN_PADDING: &str = "  ";
const SUBJECT_HEADER: &str = "subject";

fn widths(aggregate: &Aggregate) -> Vec<usize> {
  let subject = aggregate
    .rows
    .iter()
    .map(|(name, _)| name.chars().count())
    .chain([SUBJECT_HEADER.len()])
    .max()
    .unwrap_or_default();

  let metrics = Metric::ALL.into_iter().map(|metric| {
    aggregate
      .rows
      .iter()
      .filter_map(|(_, cells)| cells.get(&metric))
      .map(|cell| cell.to_string().len())
      .chain([metric.name().len()])
      .max()
      .unwrap_or_default()
  });

  [subject].into_iter().chain(metrics).collect()
}

fn format_header(widths: &[usize]) -> String {
  let header = [SUBJECT_HEADER]
    .into_iter()
    .chain(Metric::ALL.into_iter().map(Metric::name))
    .zip(widths.iter().copied())
    .map(|(col, width)| format!("{col:<width$}"))
    .collect::<Vec<_>>()
    .join(COLUMN_PADDING);

  format!("{header}\n{}", "=".repeat(header.len()))
}

fn format_rows(aggregate: &Aggregate, widths: &[usize]) -> Result<String> {
  let mut rows = String::new();

  for (name, _) in &aggregate.rows {
    let row = [format!("{name:<width$}", width = widths[0])]
      .into_iter()
      .chain(Metric::ALL.into_iter().zip(widths[1..].iter().copied()).map(|(metric, width)| {
        let cell = aggregate.get(name, metric).map(|cell| cell.to_string()).unwrap_or_default();
        format!("{cell:>width$}")
      }))
      .collect::<Vec<_>>()
      .join(COLUMN_PADDING);

    writeln!(rows, "{row}")?;
  }

  Ok(rows)
}

/// Renders the aggregate as a plain-text table, one row per subject.
pub fn format(aggregate: &Aggregate) -> Result<String> {
  let widths = widths(aggregate);
  let mut table = String::new();

  writeln!(table, "average results of {} runs", aggregate.trials)?;
  writeln!(table)?;
  writeln!(table, "{}", format_header(&widths))?;
  write!(table, "{}", format_rows(aggregate, &widths)?)?;

  Ok(table)
}
