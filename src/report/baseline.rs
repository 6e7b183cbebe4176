//! Comparing a batch against a baseline report.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::ReportError;
use super::{config_lines, BatchReport, JobSummary};
use crate::models::JobStatus;

/// Acceptance rule for one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PassRequirement {
    /// Value must equal the baseline exactly.
    Equal,
    /// `current / baseline` must fall within `[min, max]`.
    Range { min: f64, max: f64 },
    /// Like `Range`, but an absolute difference below `abs` also passes.
    RangeAbs { min: f64, max: f64, abs: f64 },
}

impl PassRequirement {
    /// Check `current` against `baseline`, explaining any failure.
    pub fn check(&self, baseline: f64, current: f64) -> Result<(), String> {
        match *self {
            Self::Equal => {
                if current == baseline {
                    Ok(())
                } else {
                    Err(format!("{} does not equal baseline {}", current, baseline))
                }
            }
            Self::Range { min, max } => {
                let ratio = ratio(baseline, current);
                if current == baseline || (min <= ratio && ratio <= max) {
                    Ok(())
                } else {
                    Err(format!(
                        "relative value {} outside of range [{}, {}]",
                        ratio, min, max
                    ))
                }
            }
            Self::RangeAbs { min, max, abs } => {
                let ratio = ratio(baseline, current);
                if current == baseline
                    || (min <= ratio && ratio <= max)
                    || (current - baseline).abs() < abs
                {
                    Ok(())
                } else {
                    Err(format!(
                        "relative value {} outside of range [{}, {}] and above absolute threshold {}",
                        ratio, min, max, abs
                    ))
                }
            }
        }
    }

    fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        let (func, rest) = expr
            .split_once('(')
            .ok_or_else(|| format!("expected 'Func(args)', got '{}'", expr))?;
        let args_str = rest
            .strip_suffix(')')
            .ok_or_else(|| format!("missing ')' in '{}'", expr))?;
        let args = if args_str.trim().is_empty() {
            Vec::new()
        } else {
            args_str
                .split(',')
                .map(|a| {
                    a.trim()
                        .parse::<f64>()
                        .map_err(|_| format!("'{}' is not a number", a.trim()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let range_check = |min: f64, max: f64| {
            if max < min {
                Err(format!("invalid range [{}, {}]: max is below min", min, max))
            } else {
                Ok(())
            }
        };

        match (func.trim(), args.as_slice()) {
            ("Equal", []) => Ok(Self::Equal),
            ("Equal", _) => Err("Equal() takes no arguments".to_string()),
            ("Range", [min, max]) => {
                range_check(*min, *max)?;
                Ok(Self::Range {
                    min: *min,
                    max: *max,
                })
            }
            ("Range", _) => Err("Range() takes two arguments".to_string()),
            ("RangeAbs", [min, max, abs]) => {
                range_check(*min, *max)?;
                Ok(Self::RangeAbs {
                    min: *min,
                    max: *max,
                    abs: *abs,
                })
            }
            ("RangeAbs", _) => Err("RangeAbs() takes three arguments".to_string()),
            (other, _) => Err(format!("unknown pass requirement '{}'", other)),
        }
    }
}

/// `current / baseline`, infinite when the baseline is zero and the values differ.
fn ratio(baseline: f64, current: f64) -> f64 {
    if baseline == 0.0 {
        if current == 0.0 {
            1.0
        } else {
            f64::INFINITY
        }
    } else {
        current / baseline
    }
}

/// Metric name to requirement, loaded from `metric;Func(args)` lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassRequirements {
    rules: BTreeMap<String, PassRequirement>,
}

impl PassRequirements {
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let text = std::fs::read_to_string(path).map_err(|e| ReportError::io(path, e))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self, ReportError> {
        let mut rules = BTreeMap::new();
        for (line_no, line) in config_lines(text) {
            let (metric, expr) = line.split_once(';').ok_or_else(|| {
                ReportError::malformed(
                    origin,
                    line_no,
                    format!("expected 'metric;Func(args)', got '{}'", line),
                )
            })?;
            let metric = metric.trim();
            if rules.contains_key(metric) {
                return Err(ReportError::malformed(
                    origin,
                    line_no,
                    format!("duplicate pass requirement for '{}'", metric),
                ));
            }
            let rule = PassRequirement::parse(expr)
                .map_err(|msg| ReportError::malformed(origin, line_no, format!("{}: {}", metric, msg)))?;
            rules.insert(metric.to_string(), rule);
        }
        Ok(Self { rules })
    }

    pub fn get(&self, metric: &str) -> Option<&PassRequirement> {
        self.rules.get(metric)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PassRequirement)> {
        self.rules.iter()
    }
}

/// A difference from the baseline that needs attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Regression {
    /// The job succeeded in the baseline and no longer does.
    Status {
        job: String,
        baseline: JobStatus,
        current: JobStatus,
    },
    /// A metric moved outside its tolerance or pass requirement.
    Metric {
        job: String,
        metric: String,
        baseline: f64,
        current: Option<f64>,
        reason: String,
    },
    /// The baseline has a job this batch doesn't.
    MissingJob { job: String },
}

impl Regression {
    pub fn job(&self) -> &str {
        match self {
            Self::Status { job, .. } | Self::Metric { job, .. } | Self::MissingJob { job } => job,
        }
    }
}

impl fmt::Display for Regression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status {
                job,
                baseline,
                current,
            } => write!(f, "{}: status {} -> {}", job, baseline, current),
            Self::Metric {
                job,
                metric,
                baseline,
                current: Some(current),
                reason,
            } => write!(
                f,
                "{}: {} {} -> {} ({})",
                job, metric, baseline, current, reason
            ),
            Self::Metric {
                job,
                metric,
                baseline,
                current: None,
                reason,
            } => write!(f, "{}: {} {} -> missing ({})", job, metric, baseline, reason),
            Self::MissingJob { job } => write!(f, "{}: missing from this batch", job),
        }
    }
}

/// Compares job summaries against a baseline report.
///
/// Metrics with a pass requirement are checked against it; all others
/// against a relative tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionChecker {
    tolerance: f64,
    requirements: PassRequirements,
}

impl Default for RegressionChecker {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl RegressionChecker {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            requirements: PassRequirements::default(),
        }
    }

    pub fn with_requirements(mut self, requirements: PassRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn compare(
        &self,
        jobs: &BTreeMap<String, JobSummary>,
        baseline: &BatchReport,
    ) -> Vec<Regression> {
        let mut regressions = Vec::new();

        for (key, base) in &baseline.jobs {
            let Some(current) = jobs.get(key) else {
                regressions.push(Regression::MissingJob { job: key.clone() });
                continue;
            };

            if base.status == JobStatus::Success && current.status != JobStatus::Success {
                regressions.push(Regression::Status {
                    job: key.clone(),
                    baseline: base.status,
                    current: current.status,
                });
            }

            for (metric, &base_value) in &base.metrics {
                let current_value = current.metrics.get(metric).copied();
                if let Some(reason) = self.check_metric(metric, base_value, current_value) {
                    regressions.push(Regression::Metric {
                        job: key.clone(),
                        metric: metric.clone(),
                        baseline: base_value,
                        current: current_value,
                        reason,
                    });
                }
            }
        }

        regressions
    }

    fn check_metric(&self, metric: &str, baseline: f64, current: Option<f64>) -> Option<String> {
        let Some(current) = current else {
            if self.requirements.get(metric).is_some() || self.requirements.is_empty() {
                return Some("metric missing".to_string());
            }
            warn!("Metric '{}' missing but has no pass requirement", metric);
            return None;
        };

        if let Some(rule) = self.requirements.get(metric) {
            return rule.check(baseline, current).err();
        }
        if !self.requirements.is_empty() {
            // Only metrics named in the pass requirements are checked.
            return None;
        }

        if baseline == 0.0 {
            if current == 0.0 {
                return None;
            }
            return Some("baseline is 0".to_string());
        }

        let delta = (current - baseline).abs() / baseline.abs();
        if delta > self.tolerance {
            Some(format!(
                "changed by {:.2}%, tolerance {:.2}%",
                delta * 100.0,
                self.tolerance * 100.0
            ))
        } else {
            None
        }
    }
}
