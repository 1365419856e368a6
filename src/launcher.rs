use std::{fs, path::Path};

use anyhow::{Context, Result};

/// Printed by a patched launcher as soon as it starts executing.
pub const START_LINE: &str = "console.log('Start Time', Date.now());";

/// Makes the launcher at `path` print a start timestamp by inserting
/// [`START_LINE`] as its second line. Returns `true` if the file was changed.
///
/// This is setup, run once per subject when the configuration is loaded, and
/// is a no-op on an already patched file.
pub fn patch(path: &Path) -> Result<bool> {
  let content = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;

  if content.contains(START_LINE) {
    return Ok(false);
  }

  let mut lines: Vec<&str> = content.split('\n').collect();
  lines.insert(1.min(lines.len()), START_LINE);

  fs::write(path, lines.join("\n")).with_context(|| format!("write {path:?}"))?;

  Ok(true)
}
