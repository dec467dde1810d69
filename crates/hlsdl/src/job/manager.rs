//! Job controller: owns every job's state machine, runs jobs on the tokio runtime and
//! publishes progress on a broadcast channel.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::events::JobEvent;
use super::import::{ImportEntry, fallback_name, parse_import};
use super::state::{Job, JobId, JobSnapshot, JobStatus, TrackProgress};
use crate::assembler::{AssemblyOptions, TrackAssembler, TrackObserver};
use crate::config::EngineConfig;
use crate::error::DownloadError;
use crate::fetcher::{Fetcher, HttpTransport, ReqwestTransport};
use crate::hls::{SegmentOutcome, TrackId};
use crate::layout::{OutputLayout, sanitize_filename};
use crate::remux::{FfmpegRemuxer, Remuxer};

const EVENT_CAPACITY: usize = 256;

/// Result of adding entries to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: Vec<JobId>,
    /// One message per entry that did not become a job.
    pub skipped: Vec<String>,
}

struct JobEntry {
    job: Job,
    token: CancellationToken,
    /// Bumped on requeue; updates from an older run are ignored.
    generation: u64,
    /// A run task exists and is waiting for (or holding) a slot.
    queued: bool,
    status_tx: watch::Sender<JobStatus>,
}

struct Inner {
    config: EngineConfig,
    fetcher: Fetcher,
    remuxer: Arc<dyn Remuxer>,
    jobs: DashMap<JobId, JobEntry>,
    /// Titles held by run tasks, keyed by job and generation. A removed job keeps its title
    /// here until its run exits, so no new job reuses the directory meanwhile.
    claimed_titles: DashMap<(JobId, u64), String>,
    next_id: AtomicU64,
    unnamed: AtomicU64,
    slots: Arc<Semaphore>,
    events: broadcast::Sender<JobEvent>,
    /// Serializes `add` so title and URL checks see every registered job.
    add_lock: Mutex<()>,
}

/// Registry of download jobs. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Manager backed by reqwest and the ffmpeg executable from `config`.
    pub fn new(config: EngineConfig) -> Result<Self, DownloadError> {
        let transport = Arc::new(ReqwestTransport::new(&config.http)?);
        let remuxer = Arc::new(FfmpegRemuxer::new(config.ffmpeg_path.clone()));
        Self::with_components(config, transport, remuxer)
    }

    pub fn with_components(
        config: EngineConfig,
        transport: Arc<dyn HttpTransport>,
        remuxer: Arc<dyn Remuxer>,
    ) -> Result<Self, DownloadError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let fetcher = Fetcher::new(transport, config.http.retry_policy());
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                remuxer,
                jobs: DashMap::new(),
                claimed_titles: DashMap::new(),
                next_id: AtomicU64::new(1),
                unnamed: AtomicU64::new(1),
                slots,
                events,
                add_lock: Mutex::new(()),
            }),
        })
    }

    /// Subscribe to job events. Slow receivers observe `Lagged` and skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Parse pasted text and register one pending job per new URL.
    pub fn import(&self, text: &str) -> Result<ImportSummary, DownloadError> {
        let report = parse_import(text)?;
        let mut summary = self.add(report.entries);
        let mut skipped = report.skipped;
        skipped.append(&mut summary.skipped);
        summary.skipped = skipped;
        Ok(summary)
    }

    /// Register entries as pending jobs. URLs already in the registry are skipped; titles
    /// that collide with a registered job get a ` (n)` suffix.
    pub fn add(&self, entries: Vec<ImportEntry>) -> ImportSummary {
        let inner = &self.inner;
        let _guard = inner.add_lock.lock();

        let mut urls: HashSet<Url> = HashSet::new();
        let mut titles: HashSet<String> = HashSet::new();
        for entry in inner.jobs.iter() {
            urls.insert(entry.job.url.clone());
            titles.insert(entry.job.title.clone());
        }
        titles.extend(inner.claimed_titles.iter().map(|claim| claim.value().clone()));

        let mut summary = ImportSummary::default();
        for entry in entries {
            if !urls.insert(entry.url.clone()) {
                debug!(url = %entry.url, "URL already queued");
                summary
                    .skipped
                    .push(format!("{}: already in the queue", entry.url));
                continue;
            }

            let name = entry
                .name
                .or_else(|| fallback_name(&entry.url))
                .unwrap_or_else(|| format!("DL_{}", inner.unnamed.fetch_add(1, Ordering::Relaxed)));
            let title = unique_title(&sanitize_filename(&name), &titles);
            titles.insert(title.clone());

            let id = JobId(inner.next_id.fetch_add(1, Ordering::Relaxed));
            let output_dir = inner.config.output_root.join(&title);
            let url = entry.url.to_string();
            let (status_tx, _) = watch::channel(JobStatus::Pending);
            inner.jobs.insert(
                id,
                JobEntry {
                    job: Job::new(id, entry.url, title.clone(), output_dir),
                    token: CancellationToken::new(),
                    generation: 0,
                    queued: false,
                    status_tx,
                },
            );

            info!(job = %id, %title, %url, "Job added");
            inner.emit(JobEvent::Added { id, title, url });
            summary.added.push(id);
        }
        summary
    }

    /// Queue a pending job. It moves to `Resolving` once a job slot is free. Starting a job
    /// that is already queued does nothing.
    pub fn start(&self, id: JobId) -> Result<(), DownloadError> {
        let (generation, token) = {
            let mut entry = self
                .inner
                .jobs
                .get_mut(&id)
                .ok_or(DownloadError::JobNotFound(id))?;
            if entry.job.status != JobStatus::Pending {
                return Err(DownloadError::InvalidStateTransition {
                    from: entry.job.status,
                    to: JobStatus::Resolving,
                });
            }
            if entry.queued {
                return Ok(());
            }
            entry.queued = true;
            (entry.generation, entry.token.clone())
        };

        let inner = self.inner.clone();
        tokio::spawn(inner.run(id, generation, token));
        Ok(())
    }

    /// Queue every pending job, oldest first. Returns the queued ids.
    pub fn start_all_pending(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .inner
            .jobs
            .iter()
            .filter(|entry| entry.job.status == JobStatus::Pending && !entry.queued)
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids.retain(|id| self.start(*id).is_ok());
        ids
    }

    /// Request a stop. A pending job stops immediately; a running job stops at its next
    /// checkpoint. A job that has reached `Merging` runs to completion.
    pub fn stop(&self, id: JobId) -> Result<(), DownloadError> {
        let from = {
            let mut entry = self
                .inner
                .jobs
                .get_mut(&id)
                .ok_or(DownloadError::JobNotFound(id))?;
            let status = entry.job.status;
            if status.is_terminal() {
                return Err(DownloadError::InvalidStateTransition {
                    from: status,
                    to: JobStatus::Stopped,
                });
            }
            entry.token.cancel();
            if status != JobStatus::Pending {
                debug!(job = %id, %status, "Stop requested");
                return Ok(());
            }
            entry.job.transition(JobStatus::Stopped)?;
            entry.queued = false;
            entry.status_tx.send_replace(JobStatus::Stopped);
            status
        };

        info!(job = %id, "Pending job stopped");
        self.inner.emit(JobEvent::StatusChanged {
            id,
            from,
            to: JobStatus::Stopped,
        });
        Ok(())
    }

    /// Stop every job that is not yet terminal. Returns the ids a stop was issued for.
    pub fn stop_all(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .inner
            .jobs
            .iter()
            .filter(|entry| !entry.job.status.is_terminal())
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids.retain(|id| self.stop(*id).is_ok());
        ids
    }

    /// Put a terminal job back to `Pending` with its progress, error and warnings cleared.
    pub fn requeue(&self, id: JobId) -> Result<(), DownloadError> {
        let from = {
            let mut entry = self
                .inner
                .jobs
                .get_mut(&id)
                .ok_or(DownloadError::JobNotFound(id))?;
            let from = entry.job.requeue()?;
            entry.generation += 1;
            entry.token = CancellationToken::new();
            entry.queued = false;
            entry.status_tx.send_replace(JobStatus::Pending);
            from
        };

        self.inner.emit(JobEvent::StatusChanged {
            id,
            from,
            to: JobStatus::Pending,
        });
        Ok(())
    }

    /// Cancel the job and drop it from the registry.
    pub fn remove(&self, id: JobId) -> Result<(), DownloadError> {
        let (_, entry) = self
            .inner
            .jobs
            .remove(&id)
            .ok_or(DownloadError::JobNotFound(id))?;
        entry.token.cancel();
        info!(job = %id, status = %entry.job.status, "Job removed");
        self.inner.emit(JobEvent::Removed { id });
        Ok(())
    }

    pub fn snapshot(&self, id: JobId) -> Result<JobSnapshot, DownloadError> {
        self.inner
            .jobs
            .get(&id)
            .map(|entry| entry.job.snapshot())
            .ok_or(DownloadError::JobNotFound(id))
    }

    /// Snapshots of every registered job ordered by id.
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.job.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Resolves once the job is terminal. A job that is never started never resolves;
    /// a removed job yields `JobNotFound`.
    pub async fn wait(&self, id: JobId) -> Result<JobSnapshot, DownloadError> {
        let mut rx = self
            .inner
            .jobs
            .get(&id)
            .ok_or(DownloadError::JobNotFound(id))?
            .status_tx
            .subscribe();
        rx.wait_for(JobStatus::is_terminal)
            .await
            .map_err(|_| DownloadError::JobNotFound(id))?;
        self.snapshot(id)
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("jobs", &self.inner.jobs.len())
            .field("max_concurrent_jobs", &self.inner.config.max_concurrent_jobs)
            .finish()
    }
}

fn unique_title(title: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(title) {
        return title.to_string();
    }
    (2..)
        .map(|n| format!("{title} ({n})"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| title.to_string())
}

impl Inner {
    fn emit(&self, event: JobEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn assembly_options(&self) -> AssemblyOptions {
        AssemblyOptions {
            preference: self.config.preference,
            download_subtitles: self.config.download_subtitles,
            require_primary_audio: self.config.require_primary_audio,
            concurrency: self.config.concurrency,
        }
    }

    /// Apply `f` to the job unless it was removed or requeued since `generation` started.
    fn update<R>(&self, id: JobId, generation: u64, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut entry = self.jobs.get_mut(&id)?;
        if entry.generation != generation {
            return None;
        }
        Some(f(&mut entry.job))
    }

    /// A superseded run gets `Cancelled` so it unwinds without touching the job.
    fn transition(&self, id: JobId, generation: u64, to: JobStatus) -> Result<(), DownloadError> {
        let from = {
            let mut entry = self.jobs.get_mut(&id).ok_or(DownloadError::Cancelled)?;
            if entry.generation != generation {
                return Err(DownloadError::Cancelled);
            }
            let from = entry.job.transition(to)?;
            if to.is_terminal() {
                entry.queued = false;
            }
            entry.status_tx.send_replace(to);
            from
        };
        debug!(job = %id, %from, %to, "Status changed");
        self.emit(JobEvent::StatusChanged { id, from, to });
        Ok(())
    }

    #[instrument(skip(self, token), fields(job = %id))]
    async fn run(self: Arc<Self>, id: JobId, generation: u64, token: CancellationToken) {
        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Stopped while waiting for a slot");
                return;
            }
            permit = self.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        // Claimed under the registry entry lock so a concurrent remove cannot slip between.
        let Some((url, title)) = self.update(id, generation, |job| {
            self.claimed_titles
                .insert((id, generation), job.title.clone());
            (job.url.clone(), job.title.clone())
        }) else {
            return;
        };
        let _claim = TitleClaim {
            inner: self.as_ref(),
            key: (id, generation),
        };
        if let Err(e) = self.transition(id, generation, JobStatus::Resolving) {
            debug!(error = %e, "Job no longer startable");
            return;
        }
        info!(%url, %title, "Job started");

        let layout = OutputLayout::new(&self.config.output_root, &title);
        let mut assembler = TrackAssembler::new(
            self.fetcher.clone(),
            self.remuxer.clone(),
            self.assembly_options(),
            layout,
            &format!(".part-{id}-{generation}"),
        );
        let observer = JobObserver {
            inner: self.as_ref(),
            id,
            generation,
        };

        let result = self
            .execute(&mut assembler, &observer, &url, &token, id, generation)
            .await;
        assembler.cleanup().await;
        self.finish(id, generation, result);
    }

    async fn execute(
        &self,
        assembler: &mut TrackAssembler,
        observer: &JobObserver<'_>,
        url: &Url,
        token: &CancellationToken,
        id: JobId,
        generation: u64,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        let resolved = assembler.resolve(url, token).await?;
        self.update(id, generation, |job| job.plan = Some(resolved.plan.clone()));
        self.transition(id, generation, JobStatus::Downloading)?;

        let fetched = assembler.fetch_tracks(resolved, token, observer).await?;
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        self.transition(id, generation, JobStatus::Merging)?;
        assembler.finalize(fetched, observer).await
    }

    fn finish(&self, id: JobId, generation: u64, result: Result<Vec<PathBuf>, DownloadError>) {
        match result {
            Ok(outputs) => {
                self.update(id, generation, |job| job.outputs = outputs.clone());
                if self.transition(id, generation, JobStatus::Completed).is_ok() {
                    info!(outputs = outputs.len(), "Job completed");
                    self.emit(JobEvent::Completed { id, outputs });
                }
            }
            Err(e) if e.is_cancelled() => {
                if self.transition(id, generation, JobStatus::Stopped).is_ok() {
                    info!("Job stopped");
                }
            }
            Err(e) => {
                let error = e.to_string();
                self.update(id, generation, |job| job.error = Some(error.clone()));
                if self.transition(id, generation, JobStatus::Failed).is_ok() {
                    warn!(%error, "Job failed");
                    self.emit(JobEvent::Failed { id, error });
                }
            }
        }
    }
}

/// Releases a run's title claim when the run task exits.
struct TitleClaim<'a> {
    inner: &'a Inner,
    key: (JobId, u64),
}

impl Drop for TitleClaim<'_> {
    fn drop(&mut self) {
        self.inner.claimed_titles.remove(&self.key);
    }
}

/// Forwards assembler progress into the job record and the event channel.
struct JobObserver<'a> {
    inner: &'a Inner,
    id: JobId,
    generation: u64,
}

impl JobObserver<'_> {
    fn add_warning(&self, message: String) {
        let recorded = self
            .inner
            .update(self.id, self.generation, |job| job.warnings.push(message.clone()));
        if recorded.is_some() {
            self.inner.emit(JobEvent::Warning {
                id: self.id,
                message,
            });
        }
    }
}

impl TrackObserver for JobObserver<'_> {
    fn track_planned(&self, track: TrackId, label: &str, total_segments: usize) {
        let recorded = self.inner.update(self.id, self.generation, |job| {
            job.tracks.insert(
                track,
                TrackProgress {
                    label: label.to_string(),
                    total: total_segments,
                    ..Default::default()
                },
            );
        });
        if recorded.is_some() {
            self.inner.emit(JobEvent::TrackPlanned {
                id: self.id,
                track,
                label: label.to_string(),
                total_segments,
            });
        }
    }

    fn segment_finished(&self, track: TrackId, index: usize, outcome: &SegmentOutcome) {
        let recorded = self.inner.update(self.id, self.generation, |job| {
            if let Some(progress) = job.tracks.get_mut(&track) {
                progress.record(outcome);
            }
        });
        if recorded.is_some() {
            self.inner.emit(JobEvent::SegmentFinished {
                id: self.id,
                track,
                index,
                outcome: outcome.clone(),
            });
        }
    }

    fn track_dropped(&self, track: TrackId, label: &str, reason: &str) {
        self.inner.update(self.id, self.generation, |job| {
            job.tracks
                .entry(track)
                .or_insert_with(|| TrackProgress {
                    label: label.to_string(),
                    ..Default::default()
                })
                .dropped = true;
        });
        self.add_warning(format!("{track} track `{label}` dropped: {reason}"));
    }

    fn warning(&self, message: String) {
        self.add_warning(message);
    }
}
