//! Integration tests: resumable, validated and sliced downloads through the executor.

mod common;

use std::sync::Arc;

use common::FakeApi;
use sluice_core::config::TransferConfig;
use sluice_core::download::FileDownloadTask;
use sluice_core::executor::TaskGraphExecutor;
use sluice_core::progress::{ProgressCounter, ProgressSink};
use sluice_core::resource::FileObjectResource;
use sluice_core::storage;
use sluice_core::task::Task;
use tempfile::tempdir;

fn transfer(sliced_threshold: u64, component_size: u64) -> TransferConfig {
    TransferConfig {
        sliced_object_download_threshold: sliced_threshold,
        sliced_object_download_component_size: component_size,
        sliced_object_download_max_components: 4,
        resumable_threshold: 100,
        ..TransferConfig::default()
    }
}

/// Downloads `name` to `dest` in a fresh executor run; returns the exit code.
fn run_download(
    api: &Arc<FakeApi>,
    name: &str,
    dest: &std::path::Path,
    tracker_dir: &std::path::Path,
    transfer: TransferConfig,
    progress: Arc<dyn ProgressSink>,
) -> i32 {
    let ctx = common::download_context(api.clone(), tracker_dir, transfer);
    let task: Box<dyn Task> = Box::new(FileDownloadTask::new(
        ctx,
        api.object(name),
        FileObjectResource::new(dest),
    ));
    TaskGraphExecutor::new(vec![Ok(task)], common::executor_config(2, 2, 4), progress)
        .run()
        .unwrap()
}

#[test]
fn interrupted_resumable_download_continues_where_it_stopped() {
    let dir = tempdir().unwrap();
    let trackers = dir.path().join("trackers");
    let dest = dir.path().join("obj.bin");
    let data = common::nonzero_data(1000);
    let api = FakeApi::new();
    api.put("obj.bin", data.clone());

    api.fail_next_download_after(400);
    let first = Arc::new(ProgressCounter::new());
    let code = run_download(&api, "obj.bin", &dest, &trackers, transfer(u64::MAX, 1000), first.clone());
    assert_eq!(code, 1);
    assert!(!dest.exists());
    assert_eq!(first.files_done(), 0);
    let partial = std::fs::read(storage::temp_path(&dest)).unwrap();
    assert_eq!(&partial[..400], &data[..400]);

    let second = Arc::new(ProgressCounter::new());
    let code = run_download(&api, "obj.bin", &dest, &trackers, transfer(u64::MAX, 1000), second.clone());
    assert_eq!(code, 0);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!storage::temp_path(&dest).exists());
    // Only the missing 600 bytes were fetched again.
    assert_eq!(api.bytes_served(), 1000);
    assert_eq!(second.bytes_done(), 600);
    assert_eq!(second.files_done(), 1);
    assert_eq!(std::fs::read_dir(&trackers).unwrap().count(), 0);
}

#[test]
fn corrupt_download_is_deleted_and_fails_the_run() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("obj.bin");
    let data = common::nonzero_data(500);
    let mut corrupt = data.clone();
    corrupt[321] ^= 0x55;
    let api = FakeApi::new();
    api.put_corrupt("obj.bin", data, corrupt);

    let code = run_download(
        &api,
        "obj.bin",
        &dest,
        &dir.path().join("trackers"),
        transfer(u64::MAX, 1000),
        Arc::new(ProgressCounter::new()),
    );
    assert_eq!(code, 1);
    assert!(!dest.exists());
    assert!(!storage::temp_path(&dest).exists());
}

#[test]
fn sliced_download_combines_component_checksums() {
    let dir = tempdir().unwrap();
    let trackers = dir.path().join("trackers");
    let dest = dir.path().join("big.bin");
    let data = common::nonzero_data(300);
    let api = FakeApi::new();
    api.put("big.bin", data.clone());

    let progress = Arc::new(ProgressCounter::new());
    let code = run_download(&api, "big.bin", &dest, &trackers, transfer(300, 100), progress.clone());
    assert_eq!(code, 0);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!storage::temp_path(&dest).exists());
    assert_eq!(progress.files_done(), 1);
    assert_eq!(progress.bytes_done(), 300);
    assert_eq!(std::fs::read_dir(&trackers).unwrap().count(), 0);
}

#[test]
fn sliced_download_with_corrupt_component_is_rejected() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("big.bin");
    let data = common::nonzero_data(300);
    let mut corrupt = data.clone();
    corrupt[150] ^= 0x01;
    let api = FakeApi::new();
    api.put_corrupt("big.bin", data, corrupt);

    let code = run_download(
        &api,
        "big.bin",
        &dest,
        &dir.path().join("trackers"),
        transfer(300, 100),
        Arc::new(ProgressCounter::new()),
    );
    assert_eq!(code, 1);
    assert!(!dest.exists());
    assert!(!storage::temp_path(&dest).exists());
}

#[test]
fn failed_component_keeps_partial_file_for_resume() {
    let dir = tempdir().unwrap();
    let trackers = dir.path().join("trackers");
    let dest = dir.path().join("big.bin");
    let data = common::nonzero_data(300);
    let api = FakeApi::new();
    api.put("big.bin", data.clone());

    api.fail_next_download_after(30);
    let code = run_download(&api, "big.bin", &dest, &trackers, transfer(300, 100), Arc::new(ProgressCounter::new()));
    assert_eq!(code, 1);
    assert!(!dest.exists());
    assert!(storage::temp_path(&dest).exists());

    let code = run_download(&api, "big.bin", &dest, &trackers, transfer(300, 100), Arc::new(ProgressCounter::new()));
    assert_eq!(code, 0);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    // 230 bytes in the first run, the 70 missing bytes of one component in the second.
    assert_eq!(api.bytes_served(), 300);
}
