//! Bounded scheduling of backup snapshots.
//!
//! A `BACKUP` command first waits for an admission slot, then copies the
//! table under read locks, and finally hands the copy to a detached writer
//! thread. The job worker is only blocked for the admission wait and the
//! copy; writing the file never holds any store lock.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::error;
use parking_lot::{Condvar, Mutex};

/// Caps the number of snapshot writers in flight.
#[derive(Debug)]
pub struct BackupScheduler {
    limit: usize,
    active: Mutex<usize>,
    changed: Condvar,
}

impl BackupScheduler {
    /// Creates a scheduler admitting at most `limit` concurrent snapshots.
    /// A limit of zero would never admit anything, so it is raised to one.
    pub fn new(limit: usize) -> Arc<BackupScheduler> {
        Arc::new(BackupScheduler {
            limit: limit.max(1),
            active: Mutex::new(0),
            changed: Condvar::new(),
        })
    }

    /// Takes a snapshot with `snapshot` and writes it to `path` on a detached
    /// thread. Blocks the caller while `limit` snapshots are already in
    /// flight; the snapshot itself is only taken once admitted.
    pub fn schedule<F>(self: &Arc<Self>, path: PathBuf, snapshot: F)
    where
        F: FnOnce() -> Vec<(String, String)>,
    {
        self.admit();
        let pairs = snapshot();
        let scheduler = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("backup-writer".to_string())
            .spawn(move || {
                if let Err(err) = write_snapshot(&path, &pairs) {
                    error!("backup {} failed: {}", path.display(), err);
                }
                scheduler.complete();
            });
        if let Err(err) = spawned {
            error!("failed to spawn backup writer: {err}");
            self.complete();
        }
    }

    /// Blocks until every outstanding snapshot has completed.
    pub fn drain(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.changed.wait(&mut active);
        }
    }

    fn admit(&self) {
        let mut active = self.active.lock();
        while *active == self.limit {
            self.changed.wait(&mut active);
        }
        *active += 1;
    }

    fn complete(&self) {
        let mut active = self.active.lock();
        *active -= 1;
        self.changed.notify_all();
    }
}

fn write_snapshot(path: &Path, pairs: &[(String, String)]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for (key, value) in pairs {
        writeln!(out, "({key}, {value})")?;
    }
    out.flush()
}
