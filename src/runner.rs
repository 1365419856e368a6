use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::{
  cache,
  config::{Settings, Subject},
  hmr::HmrTrigger,
  probe::{Browser, Probe},
  process::Controller,
  stats::{Metric, Record, TrialResult},
};

/// Drives every subject through server startup, page load, HMR and build,
/// strictly one subject at a time.
pub struct TrialRunner<'a> {
  controllers: Vec<Controller>,
  browser: &'a dyn Browser,
  settings: Settings,
}

impl<'a> TrialRunner<'a> {
  pub fn new(subjects: Vec<Subject>, browser: &'a dyn Browser, settings: Settings) -> Self {
    let controllers = subjects.into_iter().map(|s| Controller::new(s, &settings)).collect();

    Self {
      controllers,
      browser,
      settings,
    }
  }

  /// Runs all configured trials, appending one [`TrialResult`] per trial to
  /// `results`. Caches are cleared before each trial.
  pub fn run(&mut self, results: &mut Vec<TrialResult>) -> Result<()> {
    let trials = self.settings.trials;

    for trial in 1..=trials {
      info!(trial, trials, "starting trial");

      cache::clean(&self.settings.project_dir, &self.settings.cache_dirs).context("clean caches")?;
      let result = self.run_trial().with_context(|| format!("trial {trial}"))?;

      results.push(result);
    }

    Ok(())
  }

  pub fn run_trial(&mut self) -> Result<TrialResult> {
    let mut trial = TrialResult::default();

    for controller in &mut self.controllers {
      let name = controller.subject().name.clone();
      let record = run_subject(controller, self.browser, &self.settings).with_context(|| format!("subject {name:?}"))?;

      trial.push(name, record);
    }

    Ok(trial)
  }
}

fn run_subject(controller: &mut Controller, browser: &dyn Browser, settings: &Settings) -> Result<Record> {
  let mut record = Record {
    skip_hmr: controller.subject().skip_hmr,
    ..Record::default()
  };

  let served = serve(controller, browser, settings, &mut record);
  let stopped = controller.stop_server();
  served?;
  stopped?;

  thread::sleep(settings.teardown_delay);

  let label = controller.subject().label();
  info!(subject = %label, "closed server, preparing build");

  if let Some(ms) = controller.build()? {
    info!(subject = %label, elapsed_ms = ms, "build time");
    record.set(Metric::BuildTime, ms);
  }

  thread::sleep(settings.build_settle_delay);
  debug!(subject = %label, state = ?controller.state(), "subject finished");

  Ok(record)
}

/// Everything that happens while the dev server is up. The caller stops the
/// server afterwards, whatever the outcome.
fn serve(controller: &mut Controller, browser: &dyn Browser, settings: &Settings, record: &mut Record) -> Result<()> {
  let server_ms = controller.start_server()?;

  let subject = controller.subject();
  let url = subject.url();
  info!(subject = %subject.label(), %url, "navigating");

  let (probe, load_ms) = Probe::open(browser, &url, settings.navigation_timeout)?;
  let load_ms = load_ms as f64;

  info!(subject = %subject.label(), elapsed_ms = server_ms + load_ms, "startup time");
  record.set(Metric::ServerStartTime, server_ms);
  record.set(Metric::OnLoadTime, load_ms);
  record.set(Metric::Startup, server_ms + load_ms);

  if subject.skip_hmr {
    info!(subject = %subject.label(), "skipping hmr");
    return probe.close();
  }

  let mut trigger = HmrTrigger::new(
    settings.root_path(),
    settings.leaf_path(),
    settings.mutation_delay,
    settings.hmr_timeout,
  );

  let measured = trigger.measure(probe.events());
  let closed = probe.close();
  trigger.restore()?;
  closed?;

  let times = measured?;
  record.set(Metric::RootHmr, times.root as f64);
  record.set(Metric::LeafHmr, times.leaf as f64);

  Ok(())
}
