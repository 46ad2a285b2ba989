//! End-to-end tests driving the catalog through the filesystem: a tempdir
//! catalog is populated the way the backup pipeline would, then enumerated,
//! chain-checked and run through timeline reconstruction and WAL retention.

use camino_tempfile::Utf8TempDir;

use backup_catalog::backup::{BackupMode, BackupRecord, BackupStatus};
use backup_catalog::chain::{
    find_parent_full_backup, last_data_backup, scan_parent_chain, ChainHealth,
};
use backup_catalog::control_file::write_backup;
use backup_catalog::timelines::collect_timelines;
use backup_catalog::{list_backups, BackupCatalog, BackupId, InstanceConfig};
use walmeta::xlog::XLogFileName;
use walmeta::Lsn;

const SEG_SZ: u64 = 16 * 1024 * 1024;
const INSTANCE: &str = "node1";

fn test_catalog(dir: &Utf8TempDir) -> BackupCatalog {
    let catalog = BackupCatalog::new(dir.path().to_owned());
    std::fs::create_dir_all(catalog.instance_backups_dir(INSTANCE)).unwrap();
    std::fs::create_dir_all(catalog.wal_archive_dir(INSTANCE)).unwrap();
    catalog
}

fn instance_conf(wal_depth: i32) -> InstanceConfig {
    let mut conf = InstanceConfig::new(INSTANCE);
    conf.wal_depth = wal_depth;
    conf
}

fn record(id: u64, mode: BackupMode, parent: u64, tli: u32) -> BackupRecord {
    BackupRecord {
        id: BackupId(id),
        mode,
        status: BackupStatus::Ok,
        tli,
        parent_id: BackupId(parent),
        ..Default::default()
    }
}

fn persist(catalog: &BackupCatalog, backup: &BackupRecord) {
    let dir = catalog.backup_dir(INSTANCE, backup.id);
    std::fs::create_dir_all(&dir).unwrap();
    write_backup(&dir, backup).unwrap();
}

fn touch_segment(catalog: &BackupCatalog, tli: u32, segno: u64) {
    let name = XLogFileName(tli, segno, SEG_SZ);
    std::fs::write(catalog.wal_archive_dir(INSTANCE).join(name), b"wal").unwrap();
}

/// FULL + two DELTA, everything OK: the whole chain resolves and the
/// newest delta is the parent candidate for the next incremental.
#[test]
fn intact_chain_end_to_end() {
    let dir = camino_tempfile::tempdir().unwrap();
    let catalog = test_catalog(&dir);

    persist(&catalog, &record(100, BackupMode::Full, 0, 1));
    persist(&catalog, &record(200, BackupMode::Delta, 100, 1));
    persist(&catalog, &record(300, BackupMode::Delta, 200, 1));

    let list = list_backups(&catalog, INSTANCE, None).unwrap();
    let ids: Vec<u64> = list.iter().map(|b| b.id.0).collect();
    assert_eq!(ids, vec![300, 200, 100]);

    let (health, witness) = scan_parent_chain(&list, 0);
    assert_eq!(health, ChainHealth::Intact);
    assert_eq!(list.get(witness).id, BackupId(100));

    let full = find_parent_full_backup(&list, 0).unwrap();
    assert_eq!(list.get(full).id, BackupId(100));

    let parent = last_data_backup(&list, 1, BackupId::INVALID).unwrap();
    assert_eq!(list.get(parent).id, BackupId(300));
}

/// A delta whose parent was never taken: the chain is broken and the FULL
/// falls back to being the parent candidate.
#[test]
fn broken_chain_end_to_end() {
    let dir = camino_tempfile::tempdir().unwrap();
    let catalog = test_catalog(&dir);

    persist(&catalog, &record(100, BackupMode::Full, 0, 1));
    persist(&catalog, &record(300, BackupMode::Delta, 250, 1));

    let list = list_backups(&catalog, INSTANCE, None).unwrap();
    let ids: Vec<u64> = list.iter().map(|b| b.id.0).collect();
    assert_eq!(ids, vec![300, 100]);
    assert_eq!(list.get(0).parent_link, None);

    let (health, witness) = scan_parent_chain(&list, 0);
    assert_eq!(health, ChainHealth::Broken);
    assert_eq!(list.get(witness).id, BackupId(300));

    let parent = last_data_backup(&list, 1, BackupId::INVALID).unwrap();
    assert_eq!(list.get(parent).id, BackupId(100));
}

/// A hole in the archived segment sequence shows up as a lost interval.
#[test]
fn lost_wal_segment() {
    let dir = camino_tempfile::tempdir().unwrap();
    let catalog = test_catalog(&dir);

    touch_segment(&catalog, 1, 1);
    touch_segment(&catalog, 1, 3);

    let forest = collect_timelines(&catalog, &instance_conf(0)).unwrap();
    assert_eq!(forest.timelines.len(), 1);

    let t = forest.timeline_by_tli(1).unwrap();
    assert_eq!(t.begin_segno, 1);
    assert_eq!(t.end_segno, 3);
    assert_eq!(t.lost_segments.len(), 1);
    assert_eq!(t.lost_segments[0].begin_segno, 2);
    assert_eq!(t.lost_segments[0].end_segno, 2);
}

/// With retention disabled nothing is anchored and nothing is marked.
#[test]
fn wal_depth_zero_keeps_nothing() {
    let dir = camino_tempfile::tempdir().unwrap();
    let catalog = test_catalog(&dir);

    let mut b = record(100, BackupMode::Full, 0, 1);
    b.start_lsn = Lsn(2 * SEG_SZ + 0x28);
    b.stop_lsn = Lsn(2 * SEG_SZ + 0x138);
    persist(&catalog, &b);
    for segno in 1..=4 {
        touch_segment(&catalog, 1, segno);
    }

    let forest = collect_timelines(&catalog, &instance_conf(0)).unwrap();
    let t = forest.timeline_by_tli(1).unwrap();
    assert!(!t.anchor_lsn.is_valid());
    assert!(t.xlog_filelist.iter().all(|f| !f.keep));
}

/// Retention with `wal_depth = 2` on one timeline: the anchor lands on the
/// second-newest valid backup, WAL from the anchor onward is kept, and the
/// oldest ARCHIVE backup keeps its own segment range.
#[test]
fn retention_anchor_and_archive_intervals() {
    let dir = camino_tempfile::tempdir().unwrap();
    let catalog = test_catalog(&dir);

    let starts = [(100u64, 2u64), (200, 4), (300, 6)];
    for (id, segno) in starts {
        let mut b = record(id, BackupMode::Full, 0, 1);
        b.start_lsn = Lsn(segno * SEG_SZ + 0x28);
        b.stop_lsn = Lsn(segno * SEG_SZ + 0x138);
        persist(&catalog, &b);
    }
    for segno in 1..=8 {
        touch_segment(&catalog, 1, segno);
    }

    let forest = collect_timelines(&catalog, &instance_conf(2)).unwrap();
    let t = forest.timeline_by_tli(1).unwrap();

    assert_eq!(t.anchor_lsn, Lsn(4 * SEG_SZ + 0x28));
    assert_eq!(t.anchor_tli, 1);

    let kept: Vec<u64> = t
        .xlog_filelist
        .iter()
        .filter(|f| f.keep)
        .map(|f| f.segno)
        .collect();
    // [2,2] for the old ARCHIVE backup, plus everything from the anchor
    assert_eq!(kept, vec![2, 4, 5, 6, 7, 8]);
}

/// A branched timeline with no backups of its own stays recoverable via
/// its parent: the closest backup below the switchpoint anchors it, and
/// the parent timeline keeps the connecting segment range.
#[test]
fn branching_with_fallback_to_parent() {
    let dir = camino_tempfile::tempdir().unwrap();
    let catalog = test_catalog(&dir);

    // valid backup on timeline 1 stopping in segment 3
    let mut b = record(100, BackupMode::Full, 0, 1);
    b.start_lsn = Lsn(3 * SEG_SZ + 0x28);
    b.stop_lsn = Lsn(3 * SEG_SZ + 0x138);
    persist(&catalog, &b);

    // timeline 1 holds segments 1..=6, timeline 2 forks in segment 6
    for segno in 1..=6 {
        touch_segment(&catalog, 1, segno);
    }
    let switchpoint = Lsn(6 * SEG_SZ + 0x50);
    std::fs::write(
        catalog.wal_archive_dir(INSTANCE).join("00000002.history"),
        format!("1\t{switchpoint}\tno recovery target specified\n"),
    )
    .unwrap();
    for segno in 6..=8 {
        touch_segment(&catalog, 2, segno);
    }

    let forest = collect_timelines(&catalog, &instance_conf(1)).unwrap();

    let t2 = forest.timeline_by_tli(2).unwrap();
    assert_eq!(t2.parent_tli, 1);
    assert_eq!(t2.switchpoint, switchpoint);
    let closest = t2.closest_backup.expect("closest backup on timeline 1");
    assert_eq!(forest.backups.get(closest).id, BackupId(100));

    // anchored on the ancestor's backup, not marked segment by segment
    assert_eq!(t2.anchor_lsn, Lsn(3 * SEG_SZ + 0x28));
    assert_eq!(t2.anchor_tli, 1);
    assert!(t2.xlog_filelist.iter().all(|f| !f.keep));

    // the parent keeps the range from the backup to the switchpoint
    let t1 = forest.timeline_by_tli(1).unwrap();
    assert_eq!(t1.keep_segments.len(), 1);
    assert_eq!(t1.keep_segments[0].begin_segno, 3);
    assert_eq!(t1.keep_segments[0].end_segno, 6);
    let kept: Vec<u64> = t1
        .xlog_filelist
        .iter()
        .filter(|f| f.keep)
        .map(|f| f.segno)
        .collect();
    assert_eq!(kept, vec![3, 4, 5, 6]);
}

/// A backup with two valid children is prolific; with one, it is not.
#[test]
fn prolific_detection() {
    let dir = camino_tempfile::tempdir().unwrap();
    let catalog = test_catalog(&dir);

    persist(&catalog, &record(100, BackupMode::Full, 0, 1));
    persist(&catalog, &record(200, BackupMode::Delta, 100, 1));
    persist(&catalog, &record(300, BackupMode::Delta, 100, 1));

    let list = list_backups(&catalog, INSTANCE, None).unwrap();
    let full = list.find_by_id(BackupId(100)).unwrap();
    assert!(backup_catalog::chain::is_prolific(&list, full));

    std::fs::remove_dir_all(catalog.backup_dir(INSTANCE, BackupId(300))).unwrap();
    let list = list_backups(&catalog, INSTANCE, None).unwrap();
    let full = list.find_by_id(BackupId(100)).unwrap();
    assert!(!backup_catalog::chain::is_prolific(&list, full));
}
