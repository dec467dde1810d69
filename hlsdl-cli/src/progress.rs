use std::collections::HashMap;
use std::time::Duration;

use hlsdl_engine::{JobEvent, JobId, JobManager, JobStatus, SegmentOutcome};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BAR_TEMPLATE: &str =
    "{spinner:.blue} {prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} segments {msg}";

/// One progress bar per job, driven by the manager's event stream.
pub struct ProgressReporter {
    multi: MultiProgress,
    bars: HashMap<JobId, ProgressBar>,
    style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new(hidden: bool) -> Self {
        let target = if hidden {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stderr()
        };
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: HashMap::new(),
            style,
        }
    }

    fn bar(&mut self, id: JobId, title: &str) -> &ProgressBar {
        let multi = &self.multi;
        let style = &self.style;
        self.bars.entry(id).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(0));
            bar.set_style(style.clone());
            bar.set_prefix(title.to_string());
            bar.set_message(JobStatus::Pending.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        })
    }

    fn handle(&mut self, manager: &JobManager, event: JobEvent) {
        let id = event.job_id();
        if let JobEvent::Added { title, .. } = &event {
            self.bar(id, title);
            return;
        }
        if !self.bars.contains_key(&id) {
            let Ok(snapshot) = manager.snapshot(id) else {
                return;
            };
            self.bar(id, &snapshot.title);
        }
        let Some(bar) = self.bars.get(&id) else {
            return;
        };

        match event {
            JobEvent::StatusChanged { to, .. } => bar.set_message(to.to_string()),
            JobEvent::TrackPlanned { total_segments, .. } => bar.inc_length(total_segments as u64),
            JobEvent::SegmentFinished { outcome, .. } => {
                bar.inc(1);
                if let SegmentOutcome::Failed { reason } = outcome {
                    debug!(job = %id, %reason, "Segment failed");
                }
            }
            JobEvent::Warning { message, .. } => bar.println(format!("warning: {message}")),
            JobEvent::Completed { outputs, .. } => {
                bar.finish_with_message(format!("completed ({} files)", outputs.len()));
            }
            JobEvent::Failed { error, .. } => bar.abandon_with_message(format!("failed: {error}")),
            JobEvent::Removed { .. } => bar.finish_and_clear(),
            JobEvent::Added { .. } => {}
        }
    }

    /// Bring every bar in line with the registry after missed events.
    fn resync(&mut self, manager: &JobManager) {
        for snapshot in manager.snapshots() {
            let bar = self.bar(snapshot.id, &snapshot.title);
            bar.set_length(snapshot.segments_total as u64);
            bar.set_position(
                snapshot
                    .tracks
                    .iter()
                    .map(|t| t.progress.completed() as u64)
                    .sum(),
            );
            bar.set_message(snapshot.status.to_string());
        }
    }

    fn finish(&mut self, manager: &JobManager) {
        for (id, bar) in &self.bars {
            if bar.is_finished() {
                continue;
            }
            match manager.snapshot(*id) {
                Ok(snapshot) if snapshot.status == JobStatus::Stopped => {
                    bar.abandon_with_message("stopped")
                }
                Ok(snapshot) => bar.abandon_with_message(snapshot.status.to_string()),
                Err(_) => bar.finish_and_clear(),
            }
        }
    }

    /// Render events until `done` fires, then drain what is left and close the bars.
    pub async fn run(
        mut self,
        manager: JobManager,
        mut events: broadcast::Receiver<JobEvent>,
        done: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle(&manager, event),
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "Progress fell behind, resyncing");
                        self.resync(&manager);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        while let Ok(event) = events.try_recv() {
            self.handle(&manager, event);
        }
        self.finish(&manager);
    }
}
