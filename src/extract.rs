use std::fmt;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1B\[[0-9;?]*[A-Za-z]").unwrap());

/// Removes terminal color/cursor escape sequences and normalizes CRLF.
pub fn normalize(text: &str) -> String {
  ANSI_ESCAPE.replace_all(text, "").replace("\r\n", "\n")
}

/// A tool-specific pattern that locates a duration in a line of output.
///
/// Group 1 holds the magnitude, optionally with a unit glued on (`1.2s`).
/// Group 2, when present, holds the unit (`s` or `ms`).
#[derive(Clone)]
pub struct TimingPattern {
  regex: Regex,
}

impl TimingPattern {
  pub fn new(pattern: &str) -> Result<Self> {
    let regex = Regex::new(pattern).with_context(|| format!("invalid timing pattern {pattern:?}"))?;

    if regex.captures_len() < 2 {
      anyhow::bail!("timing pattern {pattern:?} has no capture group");
    }

    Ok(Self { regex })
  }

  pub fn as_str(&self) -> &str {
    self.regex.as_str()
  }

  /// Returns the duration in milliseconds, or `None` if the line does not
  /// match. A miss means "keep listening", never zero.
  pub fn extract(&self, text: &str) -> Option<f64> {
    let text = normalize(text);
    let captures = self.regex.captures(&text)?;
    let magnitude = captures.get(1)?.as_str();

    let value = match magnitude.trim().parse::<f64>() {
      Ok(value) => value,
      Err(_) => numeric_part(magnitude).parse::<f64>().ok()?,
    };

    let unit = match captures.get(2) {
      Some(unit) => unit.as_str().trim().to_string(),
      None => unit_suffix(magnitude),
    };

    // round to whole microseconds so `1.2s` is exactly 1200
    if unit == "s" {
      Some((value * 1_000_000.0).round() / 1000.0)
    } else {
      Some(value)
    }
  }
}

impl fmt::Debug for TimingPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("TimingPattern").field(&self.regex.as_str()).finish()
  }
}

fn numeric_part(magnitude: &str) -> String {
  magnitude
    .chars()
    .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
    .collect()
}

fn unit_suffix(magnitude: &str) -> String {
  magnitude
    .trim()
    .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == '-')
    .trim()
    .to_string()
}

/// Convenience wrapper matching the `extract(pattern, text)` shape.
pub fn extract(pattern: &TimingPattern, text: &str) -> Option<f64> {
  pattern.extract(text)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pattern(re: &str) -> TimingPattern {
    TimingPattern::new(re).unwrap()
  }

  #[test]
  fn seconds_are_scaled() {
    let farm = pattern(r"Ready\s*in\s*(.+?)\s*(ms|s)\b");
    assert_eq!(farm.extract("Ready in 1.2s"), Some(1200.0));
  }

  #[test]
  fn milliseconds_pass_through() {
    let farm = pattern(r"Ready\s*in\s*(.+?)\s*(ms|s)\b");
    assert_eq!(farm.extract("Ready in 350ms"), Some(350.0));

    let build = pattern(r"completed\s*in\s*(\d+)(m?ms)");
    assert_eq!(build.extract("completed in 350ms"), Some(350.0));
  }

  #[test]
  fn single_group_defaults_to_milliseconds() {
    let webpack = pattern(r"compiled\s+.+\sin\s+(\d+)\s+ms");
    assert_eq!(webpack.extract("webpack 5.91.0 compiled successfully in 812 ms"), Some(812.0));
  }

  #[test]
  fn unit_glued_to_magnitude_without_unit_group() {
    let p = pattern(r"done in (\S+)");
    assert_eq!(p.extract("done in 2.5s"), Some(2500.0));
    assert_eq!(p.extract("done in 40ms"), Some(40.0));
  }

  #[test]
  fn color_escapes_do_not_change_the_result() {
    let vite = pattern(r"ready\s*in\s*(.+?)\s*(ms|s)\b");
    let clean = vite.extract("  VITE v6.0.0  ready in 312 ms");
    let colored = vite.extract("  \x1b[32mVITE\x1b[39m v6.0.0  \x1b[2mready in \x1b[0m\x1b[1m312\x1b[22m ms\x1b[0m");

    assert_eq!(clean, Some(312.0));
    assert_eq!(colored, clean);
  }

  #[test]
  fn rspack_spaced_units() {
    let rspack = pattern(r"in\s+(.+) (s|ms)");
    assert_eq!(rspack.extract("Rspack compiled successfully in 1.05 s"), Some(1050.0));
  }

  #[test]
  fn non_matching_line_yields_nothing() {
    let farm = pattern(r"Ready\s*in\s*(.+?)\s*(ms|s)\b");
    assert_eq!(extract(&farm, "Building modules..."), None);
    assert_eq!(extract(&farm, ""), None);
  }

  #[test]
  fn unparseable_magnitude_yields_nothing() {
    let p = pattern(r"took (\w+)");
    assert_eq!(p.extract("took forever"), None);
  }

  #[test]
  fn pattern_without_group_is_rejected() {
    assert!(TimingPattern::new(r"Ready in \d+ms").is_err());
    assert!(TimingPattern::new(r"(unclosed").is_err());
  }

  #[test]
  fn crlf_is_normalized() {
    assert_eq!(normalize("a\r\nb\x1b[0K"), "a\nb");
  }

  #[test]
  fn spinner_cursor_sequences_are_stripped() {
    let line = "\x1b[?25l\x1b[1A\x1b[2KReady in 80ms\x1b[?25h";

    assert_eq!(normalize(line), "Ready in 80ms");
    assert_eq!(extract(&TimingPattern::new(r"^Ready in (\d+)(ms|s)$").unwrap(), line), Some(80.0));
  }
}
