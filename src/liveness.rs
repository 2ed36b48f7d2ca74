/// Progress tracking for the worker's loops and its measurement pipeline.
///
/// Both trackers follow the same rule: a value that changes pushes its
/// deadline forward; a value that sits still past `deadline + relax` is
/// reported once and the deadline is pushed forward again, so a stuck loop
/// produces one warning per window rather than one per check.
use crate::clock::unix_ts;
use crate::report::Reporter;
use crate::sample::{LoopSnapshot, WorkerStatus};
use crate::schedule::loop_deadline;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};

/// Loops whose name ends with this drive measurement collection. Without
/// any of them running there is no pipeline progress to expect.
pub const MODULE_LOOP_SUFFIX: &str = "_module_loop";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LoopStats {
    pub counter: Option<u64>,
    pub counter_at: Option<DateTime<Utc>>,
    pub change_deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct LoopTracker {
    stats: HashMap<String, LoopStats>,
}

impl LoopTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn stats(&self, name: &str) -> Option<&LoopStats> {
        self.stats.get(name)
    }

    /// Returns `true` if any loop was found stale.
    pub fn resolve(
        &mut self,
        loops: &BTreeMap<String, LoopSnapshot>,
        relax: Duration,
        now: DateTime<Utc>,
        reporter: &mut Reporter,
    ) -> bool {
        let mut stale = false;

        for (name, snapshot) in loops {
            let stats = self.stats.entry(name.clone()).or_default();

            if snapshot.counter == stats.counter {
                // A relaxed deadline past the representable range never arrives
                let Some(relaxed) = stats
                    .change_deadline
                    .and_then(|deadline| deadline.checked_add_signed(relax))
                else {
                    continue;
                };
                if now >= relaxed {
                    stale = true;
                    reporter.warning(
                        &format!(
                            "{name} counter is stale on {} at {} (change expected before {})",
                            fmt_counter(stats.counter),
                            fmt_ts(stats.counter_at),
                            unix_ts(relaxed),
                        ),
                        now,
                    );
                    stats.change_deadline = loop_deadline(snapshot, now);
                }
            } else {
                tracing::debug!(
                    name = %name,
                    from = %fmt_counter(stats.counter),
                    to = %fmt_counter(snapshot.counter),
                    at = %unix_ts(now),
                    "loop counter updated"
                );
                stats.counter = snapshot.counter;
                stats.counter_at = Some(now);
                stats.change_deadline = loop_deadline(snapshot, now);
            }
        }

        stale
    }
}

/// One pipeline stage counter (collected, submitted or purged).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StageTracker {
    pub value: Option<u64>,
    pub changed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct WorkflowTracker {
    pub collected: StageTracker,
    pub submitted: StageTracker,
    pub purged: StageTracker,
}

impl WorkflowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when no measurement loop is running (nothing to expect),
    /// otherwise whether any pipeline stage is stale.
    pub fn resolve(
        &mut self,
        status: &WorkerStatus,
        relax: Duration,
        purge_period: Duration,
        now: DateTime<Utc>,
        reporter: &mut Reporter,
    ) -> Option<bool> {
        let measurement_loops: Vec<&LoopSnapshot> = status
            .loops
            .iter()
            .filter(|(name, _)| name.ends_with(MODULE_LOOP_SUFFIX))
            .map(|(_, snapshot)| snapshot)
            .collect();
        if measurement_loops.is_empty() {
            tracing::debug!("no active measurement loops found");
            return None;
        }

        let deadline = measurement_loops
            .iter()
            .filter_map(|snapshot| loop_deadline(snapshot, now))
            .min();
        tracing::debug!(deadline = %fmt_ts(deadline), "workflow deadline calculated");

        let mut stale = false;
        stale |= check_deadline_stage(
            &mut self.collected,
            status.collected_counter,
            deadline,
            relax,
            now,
            "collection",
            reporter,
        );
        stale |= check_deadline_stage(
            &mut self.submitted,
            status.submitted_counter,
            deadline,
            relax,
            now,
            "submission",
            reporter,
        );

        let purged = &mut self.purged;
        if status.purged_records == purged.value {
            if let Some(changed_at) = purged.changed_at {
                let due = changed_at
                    .checked_add_signed(purge_period)
                    .and_then(|at| at.checked_add_signed(relax));
                if due.is_some_and(|due| now >= due) {
                    stale = true;
                    reporter.warning(
                        &format!(
                            "Measurement purging is stale on {} at {}",
                            fmt_counter(purged.value),
                            unix_ts(changed_at)
                        ),
                        now,
                    );
                }
            }
        } else {
            purged.value = status.purged_records;
            purged.changed_at = Some(now);
        }

        Some(stale)
    }
}

fn check_deadline_stage(
    stage: &mut StageTracker,
    observed: Option<u64>,
    workflow_deadline: Option<DateTime<Utc>>,
    relax: Duration,
    now: DateTime<Utc>,
    label: &str,
    reporter: &mut Reporter,
) -> bool {
    if observed != stage.value {
        stage.value = observed;
        stage.changed_at = Some(now);
        stage.deadline = workflow_deadline;
        return false;
    }

    tracing::debug!(stage = label, value = %fmt_counter(stage.value), "counter did not change");
    match stage.deadline {
        Some(deadline) if deadline.checked_add_signed(relax).is_some_and(|due| now >= due) => {
            reporter.warning(
                &format!(
                    "Measurement {label} is stale on {} at {}",
                    fmt_counter(stage.value),
                    fmt_ts(stage.changed_at)
                ),
                now,
            );
            stage.deadline = workflow_deadline;
            true
        }
        _ => false,
    }
}

fn fmt_counter(counter: Option<u64>) -> String {
    counter.map_or_else(|| "none".to_string(), |c| c.to_string())
}

fn fmt_ts(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "none".to_string(), unix_ts)
}
