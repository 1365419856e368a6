use std::{
  path::PathBuf,
  sync::{
    mpsc::{self, Receiver, RecvTimeoutError, Sender},
    Arc,
  },
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use headless_chrome::{protocol::cdp::types::Event, Browser as Chrome, LaunchOptions, Tab};
use serde_json::Value;
use tracing::debug;

use crate::{
  clock::{now_ms, Millis},
  error::BenchError,
};

/// Something observed on an open page, stamped with the wall-clock instant
/// the harness received it.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
  Loaded { at: Millis },
  Console { text: String, at: Millis },
}

/// Opens pages and forwards their load and console events into a channel.
pub trait Browser {
  /// Opens a blank page and subscribes `events` to it for the page's whole
  /// lifetime.
  fn open(&self, events: Sender<PageEvent>) -> Result<Box<dyn Page>>;
}

pub trait Page {
  /// Starts navigating to `url` without waiting for the load.
  fn navigate(&self, url: &str) -> Result<()>;

  fn close(self: Box<Self>) -> Result<()>;
}

/// A page under measurement together with its event stream.
pub struct Probe {
  page: Box<dyn Page>,
  events: Receiver<PageEvent>,
}

impl Probe {
  /// Opens `url` and waits for its load event. Returns the probe and the load
  /// time in milliseconds, measured from just before navigation started.
  pub fn open(browser: &dyn Browser, url: &str, timeout: Duration) -> Result<(Self, Millis)> {
    let (tx, events) = mpsc::channel();
    let page = browser.open(tx).with_context(|| format!("open page for {url}"))?;

    let start = now_ms();
    let deadline = Instant::now() + timeout;
    if let Err(err) = page.navigate(url) {
      let _ = page.close();
      return Err(err);
    }

    loop {
      let remaining = deadline.saturating_duration_since(Instant::now());
      match events.recv_timeout(remaining) {
        Ok(PageEvent::Loaded { at }) => return Ok((Self { page, events }, at - start)),
        Ok(PageEvent::Console { text, .. }) => debug!(%url, "console before load: {text}"),
        Err(RecvTimeoutError::Timeout) => {
          let _ = page.close();
          return Err(
            BenchError::NavigationTimeout {
              url: url.to_string(),
              timeout,
            }
            .into(),
          );
        }
        Err(RecvTimeoutError::Disconnected) => {
          let _ = page.close();
          return Err(BenchError::Browser(format!("event stream for {url} closed before load")).into());
        }
      }
    }
  }

  pub fn events(&self) -> &Receiver<PageEvent> {
    &self.events
  }

  pub fn close(self) -> Result<()> {
    self.page.close().context("close page")
  }
}

/// A headless Chromium shared by every subject for the whole run.
pub struct ChromeBrowser {
  chrome: Chrome,
}

impl ChromeBrowser {
  pub fn launch(path: Option<PathBuf>) -> Result<Self> {
    let options = LaunchOptions::default_builder()
      .headless(true)
      .sandbox(false)
      .path(path)
      // builds in between page visits can take minutes
      .idle_browser_timeout(Duration::from_secs(60 * 60))
      .build()
      .context("unable to construct headless Chromium launch options")?;

    let chrome = Chrome::new(options).context("failed to launch Chromium/Chrome")?;

    Ok(Self { chrome })
  }
}

impl Browser for ChromeBrowser {
  fn open(&self, events: Sender<PageEvent>) -> Result<Box<dyn Page>> {
    let tab = self.chrome.new_tab().context("failed to open tab")?;
    // the blank page's own load event must not be mistaken for ours
    tab.wait_until_navigated().context("settle blank tab")?;
    tab.enable_runtime().context("enable runtime events")?;

    tab
      .add_event_listener(Arc::new(move |event: &Event| {
        let forwarded = match event {
          Event::PageLoadEventFired(_) => PageEvent::Loaded { at: now_ms() },
          Event::RuntimeConsoleAPICalled(call) => PageEvent::Console {
            text: console_text(call.params.args.iter().map(|arg| (arg.value.as_ref(), arg.description.as_deref()))),
            at: now_ms(),
          },
          _ => return,
        };
        // the receiver is gone once the subject moved on
        let _ = events.send(forwarded);
      }))
      .context("subscribe to page events")?;

    Ok(Box::new(ChromePage { tab }))
  }
}

struct ChromePage {
  tab: Arc<Tab>,
}

impl Page for ChromePage {
  fn navigate(&self, url: &str) -> Result<()> {
    self.tab.navigate_to(url).with_context(|| format!("failed to navigate to {url}"))?;

    Ok(())
  }

  fn close(self: Box<Self>) -> Result<()> {
    self.tab.close(false).context("close tab")?;

    Ok(())
  }
}

/// Joins console arguments the way the devtools console prints them.
fn console_text<'a, I>(args: I) -> String
where
  I: Iterator<Item = (Option<&'a Value>, Option<&'a str>)>,
{
  args
    .map(|(value, description)| match value {
      Some(Value::String(s)) => s.clone(),
      Some(value) => value.to_string(),
      None => description.unwrap_or_default().to_string(),
    })
    .collect::<Vec<_>>()
    .join(" ")
}
