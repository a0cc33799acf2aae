//! The anomaly classifier.
//!
//! A pure predicate over a submitted log. It runs both at API ingress, so
//! outcome events carry the final status, and again at worker validation, so
//! direct bus producers cannot bypass it. Its output only labels a log; it is
//! never grounds for rejection.

use crate::log::NewLog;

/// Reasoning shorter than this (after trimming) is flagged.
const MIN_REASONING_LEN: usize = 10;

/// An additional classification rule.
///
/// The built-in rules cover structural signals; frequency and
/// historical-deviation rules plug in through this trait.
pub trait AnomalyRule: Send + Sync {
    /// Returns true when the rule flags the log.
    fn flags(&self, log: &NewLog) -> bool;
}

impl<F> AnomalyRule for F
where
    F: Fn(&NewLog) -> bool + Send + Sync,
{
    fn flags(&self, log: &NewLog) -> bool {
        self(log)
    }
}

/// Runs the built-in rules. Deterministic: identical input, identical output.
///
/// Rules, in order, any hit flags anomaly:
/// 1. negative `step_id`
/// 2. trimmed reasoning shorter than 10 characters
/// 3. lowercased reasoning containing the substring `error`
pub fn classify(log: &NewLog) -> bool {
    if log.step_id < 0 {
        return true;
    }
    if log.reasoning.trim().len() < MIN_REASONING_LEN {
        return true;
    }
    if log.reasoning.to_lowercase().contains("error") {
        return true;
    }
    false
}

/// Runs the built-in rules, then any extra rules.
pub fn classify_with(log: &NewLog, rules: &[Box<dyn AnomalyRule>]) -> bool {
    classify(log) || rules.iter().any(|rule| rule.flags(log))
}
