//! Throttled execution of the dump task list.
//!
//! A bounded worker pool drains the ordered task queue: per task, one bulk
//! stream per output format, spaced by a minimum inter-dispatch interval.
//! `run` returns only when every dispatched stream has finished, so callers
//! may tear down shared state (notably the bearer token) right after it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::client::ApiClient;
use crate::query::{Format, Query};
use crate::report::{Outcome, Reporter, STATUS_OK};

/// The formats each task is dumped in.
pub const OUTPUT_FORMATS: [Format; 2] = [Format::Xml, Format::Json];

/// The unit of work: one query, one file per output format.
#[derive(Debug, Clone)]
pub struct Task {
    pub directory: PathBuf,
    pub name: String,
    pub query: Query,
}

impl Task {
    pub fn key(&self) -> String {
        if self.directory.as_os_str().is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.directory.display(), self.name)
        }
    }
}

pub struct Scheduler {
    tasks: Vec<Task>,
    output_dir: PathBuf,
    max_open: usize,
    time_between: Duration,
}

impl Scheduler {
    pub fn new(tasks: Vec<Task>, output_dir: PathBuf, max_open: usize, time_between: Duration) -> Self {
        Self {
            tasks,
            output_dir,
            max_open,
            time_between,
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Drain the task list. Work-complete on return: every stream has either
    /// finished or failed, and its outcome sits in the reporter.
    pub async fn run(&self, client: &ApiClient, reporter: &mut Reporter) {
        // the effective ceiling is one below max_open: one slot of the
        // connection budget stays free for the token renewal call
        let permits = self.max_open.saturating_sub(1).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let open = Arc::new(AtomicUsize::new(0));

        let mut pacing = tokio::time::interval(self.time_between.max(Duration::from_millis(1)));
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let total = self.tasks.len() * OUTPUT_FORMATS.len();
        info!(
            "dispatching {} tasks ({} fetches), at most {} open, {}ms apart",
            self.tasks.len(),
            total,
            permits,
            self.time_between.as_millis()
        );
        let progress = ProgressBar::new(total as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut fetches: JoinSet<Outcome> = JoinSet::new();
        for task in &self.tasks {
            for format in OUTPUT_FORMATS {
                pacing.tick().await;
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    // the semaphore is never closed
                    break;
                };

                let query = task.query.clone().bulk().as_format(format);
                let task_key = task.key();
                let path = self
                    .output_dir
                    .join(&task.directory)
                    .join(format!("{}.{}", task.name, format.extension()));
                let client = client.clone();
                let open = open.clone();
                debug!("dispatching {task_key} as {format}");
                fetches.spawn(async move {
                    let outcome = fetch_one(&client, query, &task_key, format, &path, &open).await;
                    drop(permit);
                    outcome
                });
            }
        }

        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(outcome) => {
                    progress.inc(1);
                    if !outcome.is_ok() {
                        progress.set_message(format!("failed: {}", outcome.task_key));
                    }
                    reporter.record(outcome);
                }
                Err(e) => error!("fetch worker failed: {e}"),
            }
        }
        progress.finish_with_message("dump complete");
    }
}

/// One bulk stream: resolve, write to file, settle the outcome.
async fn fetch_one(
    client: &ApiClient,
    query: Query,
    task_key: &str,
    format: Format,
    path: &Path,
    open: &AtomicUsize,
) -> Outcome {
    let started_at = Local::now();
    let started = Instant::now();
    let open_at_start = open.fetch_add(1, Ordering::SeqCst);

    let resolved_uri = client
        .masked(&query)
        .unwrap_or_else(|_| "-".to_string());
    let filter_summary = query.filter_summary();

    let result = async {
        let uri = client.resolve(&query)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        client.stream_to_file(&uri, path).await
    }
    .await;

    open.fetch_sub(1, Ordering::SeqCst);
    let open_at_end = open.load(Ordering::SeqCst);
    let finished_at = Local::now();
    let duration_ms = started.elapsed().as_millis() as u64;

    let (status, byte_size) = match result {
        Ok(_) => {
            // the service sends no reliable content-length; re-stat the artifact
            let size = tokio::fs::metadata(path)
                .await
                .map(|meta| meta.len() as i64)
                .unwrap_or(-1);
            (STATUS_OK.to_string(), size)
        }
        Err(e) => {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!("removed partial artifact {}", path.display()),
                Err(rm) if rm.kind() == std::io::ErrorKind::NotFound => {}
                Err(rm) => warn!("cannot remove partial artifact {}: {rm}", path.display()),
            }
            error!("{task_key} ({format}) failed: {e}");
            (e.to_string(), -1)
        }
    };

    Outcome {
        task_key: task_key.to_string(),
        format,
        started_at,
        finished_at,
        duration_ms,
        open_at_start,
        open_at_end,
        byte_size,
        mime_type: format.mime_type(),
        status,
        resolved_uri,
        filter_summary,
    }
}
