//! End-to-end job-file execution tests.

use std::fs;
use std::sync::Arc;

use pipekvs::{BackupScheduler, Kvs, Store, run_jobs};

fn kvs() -> Arc<Kvs> {
    Arc::new(Kvs::new(Arc::new(Store::new())))
}

#[test]
fn job_file_produces_out_and_bck_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("batch.job"),
        "WRITE [(apple,red)(banana,yellow)]\n\
         READ [apple,banana,grape]\n\
         DELETE [grape]\n\
         BACKUP\n\
         SHOW\n",
    )
    .unwrap();

    let kvs = kvs();
    let scheduler = BackupScheduler::new(2);
    run_jobs(&kvs, &scheduler, dir.path(), 2).unwrap();
    scheduler.drain();

    let out = fs::read_to_string(dir.path().join("batch.out")).unwrap();
    assert_eq!(
        out,
        "[(apple,red)(banana,yellow)(grape,KVSERROR)]\n\
         [(grape,KVSMISSING)]\n\
         (apple, red)\n(banana, yellow)\n"
    );

    let backup = fs::read_to_string(dir.path().join("batch-1.bck")).unwrap();
    assert_eq!(backup, "(apple, red)\n(banana, yellow)\n");
}

#[test]
fn each_backup_in_a_job_gets_its_own_number() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("snaps.job"),
        "WRITE [(k,v1)]\nBACKUP\nWRITE [(k,v2)]\nBACKUP\n",
    )
    .unwrap();

    let kvs = kvs();
    let scheduler = BackupScheduler::new(1);
    run_jobs(&kvs, &scheduler, dir.path(), 1).unwrap();
    scheduler.drain();

    assert_eq!(
        fs::read_to_string(dir.path().join("snaps-1.bck")).unwrap(),
        "(k, v1)\n"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("snaps-2.bck")).unwrap(),
        "(k, v2)\n"
    );
}

#[test]
fn workers_split_the_directory_between_them() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..6 {
        fs::write(
            dir.path().join(format!("job{i}.job")),
            format!("WRITE [(key{i},value{i})]\nREAD [key{i}]\n"),
        )
        .unwrap();
    }

    let kvs = kvs();
    let scheduler = BackupScheduler::new(1);
    run_jobs(&kvs, &scheduler, dir.path(), 3).unwrap();

    for i in 0..6 {
        let out = fs::read_to_string(dir.path().join(format!("job{i}.out"))).unwrap();
        assert_eq!(out, format!("[(key{i},value{i})]\n"));
        assert_eq!(
            kvs.store().get(&format!("key{i}")).as_deref(),
            Some(format!("value{i}").as_str())
        );
    }
}

#[test]
fn invalid_lines_and_help_do_not_stop_a_job() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("messy.job"),
        "NONSENSE\n\nWRITE [(apple,red)]\nHELP\nREAD [apple]\n",
    )
    .unwrap();

    let kvs = kvs();
    let scheduler = BackupScheduler::new(1);
    run_jobs(&kvs, &scheduler, dir.path(), 1).unwrap();

    let out = fs::read_to_string(dir.path().join("messy.out")).unwrap();
    assert!(out.starts_with("Available commands:\n"));
    assert!(out.ends_with("[(apple,red)]\n"));
}

#[test]
fn non_job_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), "WRITE [(a,b)]\n").unwrap();
    fs::write(dir.path().join("real.job"), "WRITE [(a,b)]\n").unwrap();

    let kvs = kvs();
    let scheduler = BackupScheduler::new(1);
    run_jobs(&kvs, &scheduler, dir.path(), 2).unwrap();

    assert!(dir.path().join("real.out").exists());
    assert!(!dir.path().join("notes.out").exists());
    assert_eq!(kvs.store().get("a").as_deref(), Some("b"));
}
