//! The pipekvs server.
//!
//! Executes every `.job` file in the jobs directory against the store while
//! serving client sessions on the intake pipe. `SIGUSR1` clears all
//! subscriptions and closes active client pipes; `SIGINT`/`SIGTERM` shut the
//! server down once in-flight work drains.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use log::error;

use pipekvs::{BackupScheduler, Kvs, SessionServer, Store, run_jobs, signal};

#[derive(Debug, Parser)]
#[command(name = "pipekvs-server", version, about = "Key/value store server over named pipes")]
struct Args {
    /// Directory containing the .job files to execute
    jobs_dir: PathBuf,
    /// Maximum number of concurrent backup snapshots
    max_backups: usize,
    /// Number of job worker threads
    max_jobs: usize,
    /// Path of the intake FIFO clients connect through
    intake_path: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("pipekvs-server: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> io::Result<()> {
    signal::ignore_sigpipe();
    signal::install_server_handlers()?;

    let store = Arc::new(Store::new());
    let kvs = Arc::new(Kvs::new(store));
    let scheduler = BackupScheduler::new(args.max_backups);
    let server = SessionServer::bind(Arc::clone(&kvs), &args.intake_path)?;

    // Job files run on their own pool while the acceptor owns this thread.
    let jobs = {
        let kvs = Arc::clone(&kvs);
        let scheduler = Arc::clone(&scheduler);
        let jobs_dir = args.jobs_dir.clone();
        let max_jobs = args.max_jobs;
        thread::Builder::new()
            .name("job-pool".to_string())
            .spawn(move || run_jobs(&kvs, &scheduler, &jobs_dir, max_jobs))?
    };

    let accept_result = server.run();

    match jobs.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("job pool failed: {err}"),
        Err(_) => error!("job pool panicked"),
    }
    scheduler.drain();
    accept_result
}
