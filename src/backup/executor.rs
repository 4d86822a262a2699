//! Parallel copy executor.
//!
//! A fixed pool of worker threads performs the file copies. Workers
//! never touch the manifest; intended mutations travel back to the
//! coordinator as typed messages over per-worker channels and are
//! applied only after all workers have been joined. A missing source
//! file is not an error (the database removed it during the backup), it
//! reduces to a manifest edit.

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{info, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::BackupOptions;
use crate::error::BackupError;
use crate::fs::{CopyOptions, Filesystem};

use super::manifest::{file_section, Manifest};
use super::plan::{CopyJob, JobKind};

/// Hard ceiling on copy parallelism; bounds database side I/O.
pub const MAX_WORKERS: usize = 32;

/// Files larger than this go into the large bin of the partitioner.
const SMALL_FILE_LIMIT: u64 = 65536;

/// Small backups stay single worker: one worker per ten files at most.
const JOBS_PER_WORKER: usize = 10;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

enum WorkerMessage {
    /// The source vanished during the backup; drop the manifest entry.
    Remove { level: String, path: String },
    /// Checksum of the written (or kept) destination file.
    Checksum { level: String, path: String, digest: String },
}

#[derive(Debug, Default)]
pub struct CopyStats {
    pub copied: u64,
    pub copied_bytes: u64,
    pub checksummed: u64,
    pub removed: u64,
}

impl CopyStats {
    fn merge(&mut self, other: &CopyStats) {
        self.copied += other.copied;
        self.copied_bytes += other.copied_bytes;
        self.checksummed += other.checksummed;
    }
}

/// Number of workers for `total_jobs` files.
pub fn worker_count(requested: usize, total_jobs: usize) -> usize {
    let cap = (total_jobs + JOBS_PER_WORKER - 1) / JOBS_PER_WORKER;
    requested.min(MAX_WORKERS).min(cap).max(1)
}

/// Deal jobs out to `workers` buckets.
///
/// Large files are dealt in order, advancing to the next worker once the
/// current worker's accumulated bytes cross an equal share; small files
/// the same way by count. This keeps one multi-gigabyte file from
/// pinning a worker while the rest drain quickly, without a global size
/// sort (which would break the deterministic order resume relies on).
pub fn partition(jobs: Vec<CopyJob>, workers: usize) -> Vec<Vec<CopyJob>> {
    let mut large = Vec::new();
    let mut small = Vec::new();
    for job in jobs {
        if job.size > SMALL_FILE_LIMIT {
            large.push(job);
        } else {
            small.push(job);
        }
    }

    let total_large: u64 = large.iter().map(|job| job.size).sum();
    let total_small = small.len();

    let mut buckets: Vec<Vec<CopyJob>> = (0..workers).map(|_| Vec::new()).collect();

    let large_share = total_large / workers as u64;
    let mut worker = 0;
    let mut accumulated = 0u64;
    for job in large {
        accumulated += job.size;
        buckets[worker].push(job);
        if accumulated >= large_share && worker + 1 < workers {
            worker += 1;
            accumulated = 0;
        }
    }

    let small_share = total_small / workers;
    let mut worker = 0;
    let mut count = 0;
    for job in small {
        count += 1;
        buckets[worker].push(job);
        if count >= small_share && worker + 1 < workers {
            worker += 1;
            count = 0;
        }
    }

    buckets
}

/// Run all copy jobs and apply the resulting manifest edits.
pub fn execute<F>(
    fs: &F,
    manifest: &mut Manifest,
    jobs: Vec<CopyJob>,
    options: &BackupOptions,
) -> Result<CopyStats, Error>
where
    F: Filesystem + Clone + 'static,
{
    let mut stats = CopyStats::default();

    if jobs.is_empty() {
        return Ok(stats);
    }

    let workers = worker_count(options.process_max, jobs.len());
    info!("copying {} file(s) with {} worker(s)", jobs.len(), workers);

    let abort = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    let mut receivers: Vec<Receiver<WorkerMessage>> = Vec::new();

    for (idx, bucket) in partition(jobs, workers).into_iter().enumerate() {
        let (sender, receiver) = unbounded();
        receivers.push(receiver);

        let fs = fs.clone();
        let abort = Arc::clone(&abort);
        let compress = options.compress;
        let checksum = options.checksum;

        let handle = thread::Builder::new()
            .name(format!("copy-worker-{}", idx))
            .spawn(move || worker_run(fs, bucket, sender, abort, compress, checksum))
            .map_err(|err| format_err!("unable to spawn copy worker - {}", err))?;
        handles.push(handle);
    }

    // the coordinator blocks on worker completion with 1 second
    // granularity, watching the per backup timeout; a worker that fails
    // raises the abort flag itself so the survivors stop early
    let deadline = options.copy_timeout.map(|timeout| Instant::now() + timeout);
    let mut timed_out = false;
    loop {
        if handles.iter().all(|handle| handle.is_finished()) {
            break;
        }
        if let Some(deadline) = deadline {
            if !timed_out && Instant::now() >= deadline {
                warn!("backup copy timeout reached, stopping workers");
                abort.store(true, Ordering::SeqCst);
                timed_out = true;
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    let mut worker_error: Option<Error> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(worker_stats)) => stats.merge(&worker_stats),
            Ok(Err(err)) => {
                if worker_error.is_none() {
                    worker_error = Some(err);
                }
            }
            Err(_) => worker_error = Some(format_err!("copy worker panicked")),
        }
    }

    if timed_out {
        return Err(BackupError::Protocol("backup copy timed out".to_string()).into());
    }
    if let Some(err) = worker_error {
        return Err(BackupError::Checksum(format!("backup copy failed - {:#}", err)).into());
    }

    // only the coordinator mutates the manifest, after all workers are
    // done; message order within one channel is emission order, across
    // channels no order is needed (each message names its entry)
    for receiver in receivers {
        for message in receiver.try_iter() {
            match message {
                WorkerMessage::Remove { level, path } => {
                    info!("{} vanished during backup, dropped from manifest", path);
                    manifest.remove_key(&file_section(&level), &path);
                    stats.removed += 1;
                }
                WorkerMessage::Checksum { level, path, digest } => {
                    manifest.set_attr(&file_section(&level), &path, "checksum", digest.as_str());
                }
            }
        }
    }

    Ok(stats)
}

fn worker_run<F: Filesystem>(
    fs: F,
    jobs: Vec<CopyJob>,
    sender: Sender<WorkerMessage>,
    abort: Arc<AtomicBool>,
    compress: bool,
    checksum: bool,
) -> Result<CopyStats, Error> {

    let mut stats = CopyStats::default();

    for job in &jobs {
        if abort.load(Ordering::SeqCst) {
            bail!("copy worker aborted");
        }

        if let Err(err) = run_job(&fs, job, &sender, &mut stats, compress, checksum) {
            abort.store(true, Ordering::SeqCst);
            return Err(err.context(format!("copying '{}' failed", job.path)));
        }
    }

    Ok(stats)
}

fn run_job<F: Filesystem>(
    fs: &F,
    job: &CopyJob,
    sender: &Sender<WorkerMessage>,
    stats: &mut CopyStats,
    compress: bool,
    checksum: bool,
) -> Result<(), Error> {

    let send_checksum = |digest: String| {
        sender
            .send(WorkerMessage::Checksum {
                level: job.level.clone(),
                path: job.path.clone(),
                digest,
            })
            .map_err(|_| format_err!("coordinator channel closed"))
    };

    match job.kind {
        JobKind::ChecksumOnly => {
            let digest = fs.hash(&job.destination, compress)?;
            stats.checksummed += 1;
            send_checksum(digest)?;
        }
        JobKind::Copy { exists } => {
            if exists && fs.exists(&job.destination)? {
                if checksum {
                    let digest = fs.hash(&job.destination, compress)?;
                    stats.checksummed += 1;
                    send_checksum(digest)?;
                }
                return Ok(());
            }

            let copy_options = CopyOptions {
                source_compressed: false,
                compress,
                ignore_missing: true,
                mode: job.mode,
                modification_time: job.modification_time,
                create_dirs: true,
            };

            match fs.copy(&job.source, &job.destination, &copy_options)? {
                None => {
                    sender
                        .send(WorkerMessage::Remove {
                            level: job.level.clone(),
                            path: job.path.clone(),
                        })
                        .map_err(|_| format_err!("coordinator channel closed"))?;
                }
                Some(written) => {
                    stats.copied += 1;
                    stats.copied_bytes += written;
                    if checksum {
                        let digest = fs.hash(&job.destination, compress)?;
                        stats.checksummed += 1;
                        send_checksum(digest)?;
                    }
                }
            }
        }
    }

    Ok(())
}
