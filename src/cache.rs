use std::{fs, path::Path};

use anyhow::{Context, Result};
use tracing::debug;

/// Removes the tools' persistent caches so every trial starts cold.
/// Directories that do not exist are skipped.
pub fn clean<P: AsRef<Path>>(project_dir: &Path, dirs: &[P]) -> Result<()> {
  for dir in dirs {
    let path = project_dir.join(dir);
    if !path.exists() {
      continue;
    }

    debug!(path = %path.display(), "removing cache");
    fs::remove_dir_all(&path).with_context(|| format!("remove cache {path:?}"))?;
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn removes_present_caches_and_skips_missing_ones() {
    let project = tempfile::tempdir().unwrap();
    let farm = project.path().join("node_modules/.farm");
    fs::create_dir_all(farm.join("cache")).unwrap();
    fs::write(farm.join("cache/meta.json"), "{}").unwrap();

    clean(project.path(), &["node_modules/.farm", "node_modules/.vite"]).unwrap();

    assert!(!farm.exists());
    assert!(project.path().join("node_modules").exists());
  }
}
