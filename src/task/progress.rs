//! Aggregated progress for a task queue.

/// UI collaborator that displays a queue's aggregated progress.
pub trait ProgressSink: Send + Sync {
    /// `percent` is monotonic within one batch and reaches 100 at drain.
    fn update(&self, label: &str, percent: u32);

    /// Called exactly once per batch, when the queue drains or is cancelled.
    fn done(&self);

    /// `true` once the user dismissed/cancelled the indicator.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Spreads a fixed progress budget over tasks that finish unevenly.
///
/// Each completion is worth `(budget - shown) / outstanding`, so unused
/// budget is redistributed over whatever is still running and the last
/// completion always tops the bar up to the full budget.
#[derive(Debug, Clone)]
pub struct ProgressBudget {
    budget: u32,
    shown: u32,
}

impl ProgressBudget {
    pub fn new(budget: u32) -> Self {
        Self { budget, shown: 0 }
    }

    /// Account one finished task; `outstanding` counts the unfinished tasks
    /// including this one.  Returns the increment.
    pub fn complete_one(&mut self, outstanding: usize) -> u32 {
        let remaining = self.budget - self.shown;
        let increment = if outstanding <= 1 {
            remaining
        } else {
            remaining / outstanding as u32
        };
        self.shown += increment;
        increment
    }

    pub fn shown(&self) -> u32 {
        self.shown
    }
}

/// `"<name> (<done> of <total>): <current task name>"`
pub(crate) fn progress_label(name: &str, done: usize, total: usize, current: Option<&str>) -> String {
    match current {
        Some(current) => format!("{name} ({done} of {total}): {current}"),
        None => format!("{name} ({done} of {total})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_reaches_full_at_last_completion() {
        let mut budget = ProgressBudget::new(100);
        // three tasks outstanding, finishing one by one
        assert_eq!(budget.complete_one(3), 33);
        assert_eq!(budget.complete_one(2), 33);
        assert_eq!(budget.complete_one(1), 34);
        assert_eq!(budget.shown(), 100);
    }

    #[test]
    fn budget_absorbs_work_added_mid_batch() {
        let mut budget = ProgressBudget::new(100);
        let mut last = 0;
        // 2 tasks, then 8 more arrive after the first completes
        let outstanding = [2, 9, 8, 7, 6, 5, 4, 3, 2, 1];
        for n in outstanding {
            budget.complete_one(n);
            assert!(budget.shown() >= last, "progress must be monotonic");
            last = budget.shown();
        }
        assert_eq!(budget.shown(), 100);
    }

    #[test]
    fn label_format() {
        assert_eq!(
            progress_label("Updating Feeds", 2, 5, Some("BBC News")),
            "Updating Feeds (2 of 5): BBC News"
        );
        assert_eq!(progress_label("Saving", 0, 1, None), "Saving (0 of 1)");
    }
}
