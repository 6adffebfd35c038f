//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Progress heuristics over package manager output."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use once_cell::sync::Lazy;
use regex_lite::Regex;
use sphere_updates_common::ProgressConfig;

/// Ceiling for the install estimate; only a successful run reaches 100.
pub const INSTALL_CEILING: f64 = 99.0;

const MILESTONE_POINTS: f64 = 5.0;
const MILESTONES: [&str; 4] = [
    "Reading package lists",
    "Building dependency tree",
    "Reading state information",
    "Need to get",
];

static SUMMARY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+) upgraded, (\d+) newly installed, (\d+) to remove")
        .expect("static summary pattern is valid")
});

/// Maps the output lines of one stage to an absolute run percentage.
///
/// Implementations never return a value lower than a previous one.
pub trait ProgressEstimator: Send {
    /// Account for one output line and return the current estimate.
    fn observe(&mut self, line: &str) -> f64;

    /// Current estimate without consuming a line.
    fn current(&self) -> f64;
}

/// Estimates `apt-get update` by counting lines against an expected total.
#[derive(Debug, Clone)]
pub struct CacheRefreshEstimator {
    expected_lines: f64,
    start: f64,
    budget: f64,
    lines_seen: u64,
}

impl CacheRefreshEstimator {
    pub fn new(expected_lines: f64, start: f64, budget: f64) -> Self {
        Self {
            expected_lines: expected_lines.max(1.0),
            start,
            budget: budget.max(0.0),
            lines_seen: 0,
        }
    }

    pub fn from_config(progress: &ProgressConfig) -> Self {
        Self::new(
            progress.cache_expected_lines,
            progress.cache_start,
            progress.cache_budget,
        )
    }

    pub fn lines_seen(&self) -> u64 {
        self.lines_seen
    }
}

impl ProgressEstimator for CacheRefreshEstimator {
    fn observe(&mut self, _line: &str) -> f64 {
        self.lines_seen += 1;
        self.current()
    }

    fn current(&self) -> f64 {
        let share = self.lines_seen as f64 / self.expected_lines * self.budget;
        self.start + share.min(self.budget)
    }
}

/// Estimates `apt-get install` from milestones and per-package actions.
#[derive(Debug, Clone)]
pub struct InstallEstimator {
    budget: f64,
    points_per_package: f64,
    percent: f64,
}

impl InstallEstimator {
    /// `package_count` seeds the per-package share until the package
    /// manager prints its own summary line.
    pub fn new(baseline: f64, budget: f64, package_count: usize) -> Self {
        let budget = budget.max(0.0);
        Self {
            budget,
            points_per_package: budget / package_count.max(1) as f64,
            percent: baseline,
        }
    }

    pub fn from_config(progress: &ProgressConfig, package_count: usize) -> Self {
        Self::new(progress.install_baseline, progress.install_budget, package_count)
    }

    pub fn points_per_package(&self) -> f64 {
        self.points_per_package
    }

    fn recalibrate(&mut self, line: &str) -> bool {
        let Some(captures) = SUMMARY_LINE.captures(line) else {
            return false;
        };
        let total: u64 = (1..=3)
            .filter_map(|idx| captures.get(idx))
            .filter_map(|m| m.as_str().parse::<u64>().ok())
            .sum();
        if total > 0 {
            self.points_per_package = self.budget / total as f64;
        }
        true
    }

    fn increment(&self, line: &str) -> f64 {
        if MILESTONES.iter().any(|prefix| line.starts_with(prefix)) {
            MILESTONE_POINTS
        } else if line.starts_with("Get:") || line.starts_with("Unpacking") {
            2.0 * self.points_per_package
        } else if line.starts_with("Setting up") {
            self.points_per_package
        } else {
            0.0
        }
    }
}

impl ProgressEstimator for InstallEstimator {
    fn observe(&mut self, line: &str) -> f64 {
        if !self.recalibrate(line) {
            self.percent += self.increment(line);
        }
        self.current()
    }

    fn current(&self) -> f64 {
        self.percent.min(INSTALL_CEILING)
    }
}
