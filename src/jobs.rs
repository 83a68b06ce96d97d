//! Job-file execution pool.
//!
//! A fixed set of workers drains one shared directory iterator. Only the
//! iterator advance runs under its mutex; opening, reading and writing the
//! job files happens outside it, so workers execute whole files in parallel.

use std::fs::{self, File, ReadDir};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::{error, warn};
use parking_lot::Mutex;

use crate::backup::BackupScheduler;
use crate::ops::Kvs;
use crate::parser::{self, Command};
use crate::signal;

const HELP_TEXT: &[u8] = b"Available commands:\n  WRITE [(key,value)(key2,value2),...]\n  READ [key,key2,...]\n  DELETE [key,key2,...]\n  SHOW\n  WAIT <delay_ms>\n  BACKUP\n  HELP\n";

/// Executes every `.job` file in `dir` across `max_jobs` worker threads,
/// returning once all of them have been processed. Each job file `F`
/// produces `F.out` next to it; `BACKUP` commands inside `F` produce
/// `F-1.bck`, `F-2.bck`, …
///
/// # Errors
/// Fails when the directory cannot be read or a worker thread cannot be
/// spawned. Errors inside individual job files are logged and skipped.
pub fn run_jobs(
    kvs: &Arc<Kvs>,
    scheduler: &Arc<BackupScheduler>,
    dir: &Path,
    max_jobs: usize,
) -> io::Result<()> {
    let iter = Arc::new(Mutex::new(fs::read_dir(dir)?));
    let mut workers = Vec::new();
    for worker_id in 0..max_jobs.max(1) {
        let iter = Arc::clone(&iter);
        let kvs = Arc::clone(kvs);
        let scheduler = Arc::clone(scheduler);
        workers.push(
            thread::Builder::new()
                .name(format!("job-worker-{worker_id}"))
                .spawn(move || worker_main(&kvs, &scheduler, &iter))?,
        );
    }
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

fn worker_main(kvs: &Kvs, scheduler: &Arc<BackupScheduler>, iter: &Mutex<ReadDir>) {
    signal::block_in_worker();
    loop {
        let entry = { iter.lock().next() };
        let entry = match entry {
            Some(Ok(entry)) => entry,
            Some(Err(err)) => {
                warn!("failed to read a jobs directory entry: {err}");
                continue;
            }
            None => break,
        };
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("job") {
            continue;
        }
        if let Err(err) = run_job_file(kvs, scheduler, &path) {
            error!("job {} failed: {}", path.display(), err);
        }
    }
}

fn run_job_file(kvs: &Kvs, scheduler: &Arc<BackupScheduler>, input: &Path) -> io::Result<()> {
    let reader = BufReader::new(File::open(input)?);
    let mut out = BufWriter::new(File::create(input.with_extension("out"))?);
    let mut backup_seq = 0u32;

    for line in reader.lines() {
        let line = line?;
        // A failed command is logged and the job moves on to the next line.
        let outcome = match parser::parse_line(&line) {
            Command::Write(pairs) => {
                kvs.write(&pairs);
                Ok(())
            }
            Command::Read(keys) => kvs.read(&keys, &mut out),
            Command::Delete(keys) => kvs.delete(&keys, &mut out),
            Command::Show => kvs.show(&mut out),
            Command::Wait(delay_ms) => {
                if delay_ms > 0 {
                    let written = out.write_all(b"Waiting..\n").and_then(|()| out.flush());
                    kvs.wait(delay_ms);
                    written
                } else {
                    Ok(())
                }
            }
            Command::Backup => {
                backup_seq += 1;
                scheduler.schedule(backup_path(input, backup_seq), || kvs.backup_snapshot());
                Ok(())
            }
            Command::Help => out.write_all(HELP_TEXT),
            Command::Empty => Ok(()),
            Command::Invalid => {
                warn!("{}: invalid command, see HELP for usage", input.display());
                Ok(())
            }
        };
        if let Err(err) = outcome {
            error!("{}: command failed: {}", input.display(), err);
        }
    }
    out.flush()
}

/// `<dir>/<stem>-<seq>.bck`, numbered from 1 within each job file.
fn backup_path(job: &Path, seq: u32) -> PathBuf {
    let stem = job
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("job");
    job.with_file_name(format!("{stem}-{seq}.bck"))
}
