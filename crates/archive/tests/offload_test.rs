//! Integration tests for historic file offload during rollover preparation.

use alopex_archive::store::{
    InMemoryCoordinationStore, InMemoryMetadataStore, InMemoryStateStore, MetadataRecord,
};
use alopex_archive::{
    ArchiveConfig, ArchiveEvent, ArchiveFile, OffloadLocation, PointRecord, Quality, TimeTag,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn point(seconds: i64) -> PointRecord {
    PointRecord::new(
        1,
        TimeTag::from_millis(seconds * 1000).unwrap(),
        seconds as f32,
        Quality::Good,
    )
}

/// Eight blocks per file; every new block starts rollover preparation.
fn eager_config(dir: &TempDir) -> ArchiveConfig {
    ArchiveConfig::new(dir.path().join("plant.d"))
        .with_blocks(8, 100)
        .with_compression(false)
        .with_rollover_preparation_threshold(10.0)
}

fn open_archive(config: ArchiveConfig) -> ArchiveFile {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let archive = ArchiveFile::new(
        config,
        Arc::new(InMemoryMetadataStore::with_records([MetadataRecord::new(1, "flow")])),
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryCoordinationStore::new()),
    )
    .unwrap();
    archive.open().unwrap();
    archive.wait_for_historic_index();
    archive
}

/// Writes a sample that binds a new block, then waits for the preparation
/// it starts to finish.
fn write_and_prepare(archive: &ArchiveFile, seconds: i64) {
    let events = archive.events();
    archive.write(point(seconds)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(ArchiveEvent::RolloverPreparationCompleted { .. }) =
            events.recv_timeout(Duration::from_millis(50))
        {
            return;
        }
    }
    panic!("rollover preparation did not complete");
}

#[test]
fn test_surplus_historic_files_are_deleted() {
    let dir = TempDir::new().unwrap();
    let archive = open_archive(eager_config(&dir).with_max_historic_files(1));

    write_and_prepare(&archive, 1);
    archive.write(point(2)).unwrap();
    let first = archive.rollover().unwrap();

    write_and_prepare(&archive, 3);
    archive.write(point(4)).unwrap();
    let second = archive.rollover().unwrap();
    assert_eq!(archive.historic_files().len(), 2);

    // The next preparation trims the index to one file.
    write_and_prepare(&archive, 5);
    assert!(!first.exists());
    assert!(second.exists());
    let files = archive.historic_files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, second);
}

#[test]
fn test_expired_files_move_to_offload_directory() {
    let dir = TempDir::new().unwrap();
    let offload = dir.path().join("offload");
    let config = eager_config(&dir)
        .with_offload(OffloadLocation::Directory(offload.clone()), 5, 100.0)
        .with_offload_max_age(Duration::from_secs(24 * 3600));
    let archive = open_archive(config);

    write_and_prepare(&archive, 1);
    archive.write(point(2)).unwrap();
    let historic = archive.rollover().unwrap();

    write_and_prepare(&archive, 3);
    let moved = offload.join(historic.file_name().unwrap());
    assert!(!historic.exists());
    assert!(moved.exists());
    let files = archive.historic_files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, moved);

    // Offloaded files stay readable.
    archive.write(point(4)).unwrap();
    let times: Vec<i64> = archive
        .read_all(1)
        .unwrap()
        .map(|p| p.time.as_millis() / 1000)
        .collect();
    assert_eq!(times, vec![1, 2, 3]);
}

#[test]
fn test_offload_location_parsing() {
    assert_eq!(OffloadLocation::parse(""), OffloadLocation::None);
    assert_eq!(OffloadLocation::parse("*DELETE*"), OffloadLocation::Delete);
    assert_eq!(
        OffloadLocation::parse("/mnt/archive"),
        OffloadLocation::Directory("/mnt/archive".into())
    );
}
