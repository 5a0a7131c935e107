
use std::sync::Arc;

use tokio::sync::mpsc;

use jobrig::proto::LogEntry;
use jobrig::tasks::{FileTransfer, RunProgram, TaskSpec};
use test_harness::{fast_config, session_pair, spawn_slave_service, write_script};

async fn drain_log(mut rx: mpsc::Receiver<LogEntry>) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    while let Some(entry) = rx.recv().await {
        entries.push(entry);
    }
    entries
}

#[tokio::test]
async fn transfers_a_file_both_ways() {
    let config = fast_config();
    let (master, slave) = session_pair(&config).await;
    let dir = tempfile::tempdir().unwrap();
    spawn_slave_service(Arc::new(slave), dir.path().to_path_buf());

    let source = dir.path().join("source_file");
    tokio::fs::write(&source, b"hello world").await.unwrap();

    let job = master.start_job().await.unwrap();

    let upload = TaskSpec::FileTransfer(FileTransfer {
        to_slave: true,
        master_path: source.to_string_lossy().into_owned(),
        slave_path: "dest_file".into(),
    });
    job.run(&upload, None).await.unwrap();

    let returned = dir.path().join("returned_file");
    let download = TaskSpec::FileTransfer(FileTransfer {
        to_slave: false,
        master_path: returned.to_string_lossy().into_owned(),
        slave_path: "dest_file".into(),
    });
    job.run(&download, None).await.unwrap();
    job.close().await;

    let slave_copy = dir.path().join("job1").join("dest_file");
    assert_eq!(tokio::fs::read(&slave_copy).await.unwrap(), b"hello world");
    assert_eq!(tokio::fs::read(&returned).await.unwrap(), b"hello world");
    master.close().await;
}

#[tokio::test]
async fn transfer_logs_name_both_halves() {
    let config = fast_config();
    let (master, slave) = session_pair(&config).await;
    let dir = tempfile::tempdir().unwrap();
    spawn_slave_service(Arc::new(slave), dir.path().to_path_buf());

    let source = dir.path().join("payload");
    tokio::fs::write(&source, b"hello world").await.unwrap();

    let job = master.start_job().await.unwrap();
    let (log_tx, log_rx) = mpsc::channel(64);
    let upload = TaskSpec::FileTransfer(FileTransfer {
        to_slave: true,
        master_path: source.to_string_lossy().into_owned(),
        slave_path: "b".into(),
    });
    job.run(&upload, Some(log_tx)).await.unwrap();
    job.close().await;

    let entries = drain_log(log_rx).await;
    let sending: Vec<_> = entries
        .iter()
        .filter(|e| e.message.contains("sending file of length 11"))
        .collect();
    let receiving: Vec<_> = entries
        .iter()
        .filter(|e| e.message.contains("receiving file of length 11"))
        .collect();
    assert_eq!(sending.len(), 1);
    assert!(sending[0].from_master);
    assert_eq!(receiving.len(), 1);
    assert!(!receiving[0].from_master);
    master.close().await;
}

#[tokio::test]
async fn failed_upload_leaves_no_debris_on_the_slave() {
    let config = fast_config();
    let (master, slave) = session_pair(&config).await;
    let dir = tempfile::tempdir().unwrap();
    spawn_slave_service(Arc::new(slave), dir.path().to_path_buf());

    let job = master.start_job().await.unwrap();
    let upload = TaskSpec::FileTransfer(FileTransfer {
        to_slave: true,
        master_path: dir.path().join("does_not_exist").to_string_lossy().into_owned(),
        slave_path: "dest".into(),
    });
    assert!(job.run(&upload, None).await.is_err());
    job.close().await;

    // The slave's receiver must have removed its temp file.
    let mut entries = tokio::fs::read_dir(dir.path().join("job1")).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
    master.close().await;
}

#[tokio::test]
async fn download_of_a_missing_slave_file_fails() {
    let config = fast_config();
    let (master, slave) = session_pair(&config).await;
    let dir = tempfile::tempdir().unwrap();
    spawn_slave_service(Arc::new(slave), dir.path().to_path_buf());

    let job = master.start_job().await.unwrap();
    let dest = dir.path().join("never_written");
    let download = TaskSpec::FileTransfer(FileTransfer {
        to_slave: false,
        master_path: dest.to_string_lossy().into_owned(),
        slave_path: "missing".into(),
    });
    assert!(job.run(&download, None).await.is_err());
    job.close().await;

    assert!(!dest.exists());
    master.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn runs_a_shipped_program_and_captures_its_output() {
    let config = fast_config();
    let (master, slave) = session_pair(&config).await;
    let dir = tempfile::tempdir().unwrap();
    spawn_slave_service(Arc::new(slave), dir.path().to_path_buf());

    let script = dir.path().join("hello.sh");
    write_script(&script, "echo hello there; echo oops >&2").await;

    let job = master.start_job().await.unwrap();
    let (log_tx, log_rx) = mpsc::channel(64);
    let run = TaskSpec::RunProgram(RunProgram {
        source: script.to_string_lossy().into_owned(),
        args: vec![],
    });
    job.run(&run, Some(log_tx)).await.unwrap();
    job.close().await;

    let entries = drain_log(log_rx).await;
    assert!(entries
        .iter()
        .any(|e| !e.from_master && e.message == "hello there"));
    assert!(entries.iter().any(|e| !e.from_master && e.message == "oops"));

    // The shipped executable is cleaned up after the run.
    let mut files = tokio::fs::read_dir(dir.path().join("job1")).await.unwrap();
    assert!(files.next_entry().await.unwrap().is_none());
    master.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn program_arguments_reach_the_slave() {
    let config = fast_config();
    let (master, slave) = session_pair(&config).await;
    let dir = tempfile::tempdir().unwrap();
    spawn_slave_service(Arc::new(slave), dir.path().to_path_buf());

    let script = dir.path().join("args.sh");
    write_script(&script, "echo \"$1-$2\"").await;

    let job = master.start_job().await.unwrap();
    let (log_tx, log_rx) = mpsc::channel(64);
    let run = TaskSpec::RunProgram(RunProgram {
        source: script.to_string_lossy().into_owned(),
        args: vec!["left".into(), "right".into()],
    });
    job.run(&run, Some(log_tx)).await.unwrap();
    job.close().await;

    let entries = drain_log(log_rx).await;
    assert!(entries.iter().any(|e| e.message == "left-right"));
    master.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn failing_program_fails_the_task() {
    let config = fast_config();
    let (master, slave) = session_pair(&config).await;
    let dir = tempfile::tempdir().unwrap();
    spawn_slave_service(Arc::new(slave), dir.path().to_path_buf());

    let script = dir.path().join("fail.sh");
    write_script(&script, "exit 3").await;

    let job = master.start_job().await.unwrap();
    let run = TaskSpec::RunProgram(RunProgram {
        source: script.to_string_lossy().into_owned(),
        args: vec![],
    });
    let err = job.run(&run, None).await.unwrap_err();
    assert!(err.to_string().contains("exited"));
    job.close().await;
    master.close().await;
}

#[tokio::test]
async fn tasks_in_one_job_may_run_concurrently() {
    let config = fast_config();
    let (master, slave) = session_pair(&config).await;
    let dir = tempfile::tempdir().unwrap();
    spawn_slave_service(Arc::new(slave), dir.path().to_path_buf());

    let first = dir.path().join("first");
    let second = dir.path().join("second");
    tokio::fs::write(&first, b"one").await.unwrap();
    tokio::fs::write(&second, b"two").await.unwrap();

    let job = Arc::new(master.start_job().await.unwrap());
    let job_a = job.clone();
    let upload_a = TaskSpec::FileTransfer(FileTransfer {
        to_slave: true,
        master_path: first.to_string_lossy().into_owned(),
        slave_path: "a".into(),
    });
    let upload_b = TaskSpec::FileTransfer(FileTransfer {
        to_slave: true,
        master_path: second.to_string_lossy().into_owned(),
        slave_path: "b".into(),
    });
    let (a, b) = tokio::join!(
        async move { job_a.run(&upload_a, None).await },
        job.run(&upload_b, None),
    );
    a.unwrap();
    b.unwrap();
    job.close().await;

    assert_eq!(
        tokio::fs::read(dir.path().join("job1").join("a")).await.unwrap(),
        b"one"
    );
    assert_eq!(
        tokio::fs::read(dir.path().join("job1").join("b")).await.unwrap(),
        b"two"
    );
    master.close().await;
}
