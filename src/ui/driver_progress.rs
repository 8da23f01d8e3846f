//! Renders the driver's event stream as a spinner + running log, the
//! interactive-terminal half of the structured-logging/ui split.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;

use super::icons::{CHECK, CROSS, SPARKLE};
use crate::events::{Event, EventSink};

pub struct DriverProgress {
    bar: ProgressBar,
    verbose: bool,
}

impl DriverProgress {
    pub fn new(verbose: bool) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap(),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(100));
        DriverProgress { bar, verbose }
    }

    /// Spawns a background task that drains `sink` until the channel closes
    /// (i.e. the driver and every other sender have been dropped), rendering
    /// each event as it arrives. The returned handle should be awaited after
    /// the driver run completes so trailing events are not lost.
    pub fn spawn(self, sink: &EventSink) -> tokio::task::JoinHandle<()> {
        let mut rx = sink.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => self.render(&event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            self.bar.finish_and_clear();
        })
    }

    fn render(&self, event: &Event) {
        match event {
            Event::PlanFrozen { plan_id, stage_count, quality_score } => {
                self.bar.set_message(format!(
                    "{} plan '{}' frozen: {} stage(s), quality {}",
                    SPARKLE, plan_id, stage_count, quality_score
                ));
            }
            Event::StageStarted { stage_id, task_count, .. } => {
                self.bar
                    .set_message(format!("stage {} running ({} task(s))", style(stage_id).yellow(), task_count));
            }
            Event::StageTaskDispatched { stage_id, task_id, attempt, .. } => {
                if self.verbose {
                    self.bar.println(format!(
                        "  -> dispatched {}/{} (attempt {})",
                        stage_id, task_id, attempt
                    ));
                }
            }
            Event::StageTaskFinished { stage_id, task_id, status, .. } => {
                if self.verbose {
                    self.bar.println(format!("  {} {}/{}: {}", CHECK, stage_id, task_id, status));
                }
            }
            Event::StageFinished { stage_id, all_success, success_count, fail_count } => {
                let icon = if *all_success { CHECK } else { CROSS };
                self.bar.println(format!(
                    "{} stage {} finished: {} ok, {} failed",
                    icon, stage_id, success_count, fail_count
                ));
            }
            Event::PhaseChanged { from, to } => {
                self.bar.set_message(format!("{} -> {}", style(from).dim(), style(to).bold()));
            }
            Event::RecoveryEntered { stage_id, recovery_count } => {
                self.bar.println(format!(
                    "{} recovering stage {} (attempt {})",
                    style("!").yellow(),
                    stage_id,
                    recovery_count
                ));
            }
            Event::GateChecked { gate, verdict, reason } => {
                self.bar.println(format!("  gate {}: {} ({})", gate, verdict, reason));
            }
            Event::Alert { kind, message } => {
                self.bar.println(format!("{} [{}] {}", CROSS, kind, message));
            }
        }
    }
}
