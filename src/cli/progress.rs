use std::time::{Duration, Instant};

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::events::Event;
use crate::pipeline::{FailureStatus, TaskStatus};

/// Spinner fed by engine events for one failure's run.
pub struct RunProgress {
    failure_id: String,
    bar: ProgressBar,
    quiet: bool,
    steps_done: usize,
    start_time: Instant,
}

impl RunProgress {
    pub fn new(failure_id: &str, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!("Queued {}", failure_id));
        bar.enable_steady_tick(Duration::from_millis(120));

        Self {
            failure_id: failure_id.to_string(),
            bar,
            quiet,
            steps_done: 0,
            start_time: Instant::now(),
        }
    }

    /// Render one event. Returns the terminal status once the run is over.
    pub fn handle_event(&mut self, event: &Event) -> Option<FailureStatus> {
        match event {
            Event::TaskUpdate { task } if task.failure_id == self.failure_id => match task.status {
                TaskStatus::Assigned => {
                    let agent = task.assigned_agent_id.as_deref().unwrap_or("?");
                    self.bar.set_message(format!("{} → {}", task.label, agent));
                }
                TaskStatus::Running => {
                    self.bar
                        .set_message(format!("{} ({})", task.label, self.elapsed()));
                }
                TaskStatus::Completed => {
                    self.steps_done += 1;
                    self.println(format!("  {} {}", style("✔").green(), task.label));
                }
                TaskStatus::Failed => {
                    self.println(format!(
                        "  {} {}: {}",
                        style("✘").red(),
                        task.label,
                        task.error.as_deref().unwrap_or("failed")
                    ));
                }
                _ => {}
            },
            Event::FailureUpdate { failure } if failure.id == self.failure_id => {
                match failure.status {
                    FailureStatus::Completed | FailureStatus::Failed => {
                        self.finish(failure.status);
                        return Some(failure.status);
                    }
                    FailureStatus::Running => self.bar.set_message("Starting workflow"),
                    _ => {}
                }
            }
            Event::AgentRemoved { instance_id } => {
                self.println(format!("  {} agent {} left", style("⚠").yellow(), instance_id));
            }
            _ => {}
        }
        None
    }

    fn finish(&self, status: FailureStatus) {
        let summary = format!(
            "Run {}: {} steps in {}",
            status,
            self.steps_done,
            self.elapsed()
        );
        if status == FailureStatus::Completed {
            self.bar.finish_with_message(summary);
        } else {
            self.bar.abandon_with_message(summary);
        }
    }

    pub fn abandon(&self, msg: &str) {
        self.bar.abandon_with_message(msg.to_string());
    }

    fn println(&self, msg: String) {
        if !self.quiet {
            self.bar.println(msg);
        }
    }

    fn elapsed(&self) -> String {
        format_elapsed(self.start_time.elapsed())
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let mins = secs / 60;
    if mins > 0 {
        format!("{}m{}s", mins, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Failure, FailureInput, TaskExecution};
    use crate::workflow::{NodeKind, WorkflowNode};

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(7)), "7s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m5s");
    }

    #[test]
    fn test_terminal_status_only_for_own_failure() {
        let mut failure = Failure::new(FailureInput::default());
        let mut progress = RunProgress::new(&failure.id, true);

        let mut other = Failure::new(FailureInput::default());
        other.status = FailureStatus::Failed;
        assert_eq!(progress.handle_event(&Event::FailureUpdate { failure: other }), None);

        let node = WorkflowNode::new("p1", NodeKind::Start);
        let mut task = TaskExecution::new(&failure.id, &node);
        task.status = TaskStatus::Completed;
        assert_eq!(progress.handle_event(&Event::TaskUpdate { task }), None);
        assert_eq!(progress.steps_done, 1);

        failure.status = FailureStatus::Completed;
        assert_eq!(
            progress.handle_event(&Event::FailureUpdate { failure }),
            Some(FailureStatus::Completed)
        );
    }
}
