//! [`HealthProber`] – run every probe and fold the results.

use std::panic::{AssertUnwindSafe, catch_unwind};

use kiosk_types::{CheckName, HealthCheckResult, Severity};
use tracing::{debug, error};

use crate::checks::Probe;

/// Results of one battery plus the worst severity seen.
///
/// `overall` is only ever raised by [`HealthReport::record`].
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    results: Vec<HealthCheckResult>,
    overall: Severity,
}

impl HealthReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: HealthCheckResult) {
        self.overall = self.overall.max(result.status);
        self.results.push(result);
    }

    pub fn overall(&self) -> Severity {
        self.overall
    }

    pub fn results(&self) -> &[HealthCheckResult] {
        &self.results
    }

    pub fn result_for(&self, check: CheckName) -> Option<&HealthCheckResult> {
        self.results.iter().find(|r| r.check == check)
    }

    pub fn failing(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.results.iter().filter(|r| r.is_failing())
    }
}

impl FromIterator<HealthCheckResult> for HealthReport {
    fn from_iter<I: IntoIterator<Item = HealthCheckResult>>(iter: I) -> Self {
        let mut report = HealthReport::new();
        for result in iter {
            report.record(result);
        }
        report
    }
}

pub struct HealthProber<'a> {
    probes: Vec<Box<dyn Probe + 'a>>,
}

impl<'a> HealthProber<'a> {
    pub fn new(probes: Vec<Box<dyn Probe + 'a>>) -> Self {
        Self { probes }
    }

    /// Run each probe in isolation. A panicking probe is CRITICAL.
    pub fn run(&self) -> HealthReport {
        let mut report = HealthReport::new();
        for probe in &self.probes {
            let check = probe.name();
            let result = catch_unwind(AssertUnwindSafe(|| probe.run())).unwrap_or_else(|_| {
                error!(check = %check, "probe panicked");
                HealthCheckResult::critical(check, "probe panicked")
            });
            debug!(check = %check, status = %result.status, detail = %result.detail, "probe finished");
            report.record(result);
        }
        report
    }
}
