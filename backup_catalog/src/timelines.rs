//! Reconstruction of the timeline forest from the WAL archive directory.
//!
//! The archive listing, sorted by name, is grouped into timelines; gaps in
//! the segment sequence are recorded, `.history` files supply the parent
//! links and switchpoints, and the instance's backups are attached to the
//! timelines they were taken on.

use anyhow::Context;
use tracing::{trace, warn};

use walmeta::xlog::{
    IsBackupHistoryFileName, IsCompressedXLogFileName, IsPartialXLogFileName, IsTLHistoryFileName,
    IsXLogFileName, XLogFromFileName, XLOG_FNAME_LEN,
};
use walmeta::{Lsn, TimeLineID, XLogSegNo};

use crate::config::InstanceConfig;
use crate::history::{immediate_parent, read_timeline_history};
use crate::list::{list_backups, BackupList};
use crate::paths::BackupCatalog;
use crate::retention::plan_wal_retention;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlogFileType {
    /// Full segment, plain or compressed.
    Segment,
    /// An unfinished segment (`.partial`).
    Partial,
    /// A `.backup` history marker left by the backup pipeline. Attached
    /// for completeness, never examined.
    BackupHistory,
}

/// One file of the WAL archive.
#[derive(Debug, Clone)]
pub struct XlogFile {
    pub name: String,
    pub segno: XLogSegNo,
    pub file_type: XlogFileType,
    pub size: u64,
    /// Set by the retention planner: this file must survive a WAL purge.
    pub keep: bool,
}

/// Inclusive range of segment numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegInterval {
    pub begin_segno: XLogSegNo,
    pub end_segno: XLogSegNo,
}

impl SegInterval {
    pub fn contains(&self, segno: XLogSegNo) -> bool {
        segno >= self.begin_segno && segno <= self.end_segno
    }
}

/// Everything known about one timeline of the archive.
#[derive(Debug)]
pub struct TimelineInfo {
    pub tli: TimeLineID,
    /// Parent timeline id from the history file; `0` for a root timeline.
    pub parent_tli: TimeLineID,
    /// Index of the parent within the forest, when its files were seen.
    pub parent_link: Option<usize>,
    /// Position at which this timeline forked off its parent.
    pub switchpoint: Lsn,

    pub begin_segno: XLogSegNo,
    pub end_segno: XLogSegNo,
    /// Number of full segments; partial and `.backup` files don't count.
    pub n_xlog_files: u64,
    /// Cumulative size of the full segments.
    pub size: u64,
    /// Holes in the segment sequence.
    pub lost_segments: Vec<SegInterval>,
    pub xlog_filelist: Vec<XlogFile>,

    /// Backups taken on this timeline, as indices into the forest's
    /// backup list, descending by id.
    pub backups: Vec<usize>,
    /// Backup with the smallest valid start LSN on this timeline.
    pub oldest_backup: Option<usize>,
    /// Valid backup on an ancestor timeline closest below the switchpoint.
    pub closest_backup: Option<usize>,

    /// WAL at or above this position must be retained.
    pub anchor_lsn: Lsn,
    /// Timeline the anchor backup belongs to; differs from `tli` when an
    /// ancestor protects this timeline entirely.
    pub anchor_tli: TimeLineID,
    /// Extra segment ranges retention must preserve.
    pub keep_segments: Vec<SegInterval>,
}

impl TimelineInfo {
    pub fn new(tli: TimeLineID) -> Self {
        TimelineInfo {
            tli,
            parent_tli: 0,
            parent_link: None,
            switchpoint: Lsn::INVALID,
            begin_segno: 0,
            end_segno: 0,
            n_xlog_files: 0,
            size: 0,
            lost_segments: Vec::new(),
            xlog_filelist: Vec::new(),
            backups: Vec::new(),
            oldest_backup: None,
            closest_backup: None,
            anchor_lsn: Lsn::INVALID,
            anchor_tli: 0,
            keep_segments: Vec::new(),
        }
    }
}

/// The reconstructed timelines of one instance, together with the backup
/// list the timelines reference by index.
#[derive(Debug)]
pub struct TimelineForest {
    pub timelines: Vec<TimelineInfo>,
    pub backups: BackupList,
}

impl TimelineForest {
    pub fn timeline_by_tli(&self, tli: TimeLineID) -> Option<&TimelineInfo> {
        self.timelines.iter().find(|t| t.tli == tli)
    }
}

/// Group a sorted-by-name archive listing into timelines. `history`
/// resolves a timeline's history file into its immediate parent and
/// switchpoint.
fn scan_archive_entries(
    entries: &[(String, u64)],
    xlog_seg_size: u64,
    mut history: impl FnMut(TimeLineID) -> anyhow::Result<Option<(TimeLineID, Lsn)>>,
) -> anyhow::Result<Vec<TimelineInfo>> {
    let mut timelines: Vec<TimelineInfo> = Vec::new();
    let mut cur: Option<usize> = None;

    for (name, file_size) in entries {
        let file_type = if IsXLogFileName(name) || IsCompressedXLogFileName(name) {
            XlogFileType::Segment
        } else if IsPartialXLogFileName(name) {
            trace!("partial WAL file \"{}\"", name);
            XlogFileType::Partial
        } else if IsBackupHistoryFileName(name) {
            trace!("backup history file \"{}\"", name);
            XlogFileType::BackupHistory
        } else if IsTLHistoryFileName(name) {
            let tli = u32::from_str_radix(&name[0..8], 16)
                .with_context(|| format!("unexpected WAL file name \"{name}\""))?;

            if cur.map_or(true, |i| timelines[i].tli != tli) {
                let mut tlinfo = TimelineInfo::new(tli);
                if let Some((parent_tli, switchpoint)) = history(tli)? {
                    tlinfo.switchpoint = switchpoint;
                    tlinfo.parent_tli = parent_tli;
                    // link with the parent timeline, if its files came first
                    tlinfo.parent_link = timelines.iter().position(|t| t.tli == parent_tli);
                }
                timelines.push(tlinfo);
                cur = Some(timelines.len() - 1);
            }
            continue;
        } else {
            warn!("unexpected WAL file name \"{}\"", name);
            continue;
        };

        let (segno, tli) = XLogFromFileName(&name[..XLOG_FNAME_LEN], xlog_seg_size);

        // a new tli starts a new timeline
        let i = match cur {
            Some(i) if timelines[i].tli == tli => i,
            _ => {
                timelines.push(TimelineInfo::new(tli));
                timelines.len() - 1
            }
        };
        cur = Some(i);
        let tlinfo = &mut timelines[i];

        if file_type == XlogFileType::Segment {
            // As it is impossible to detect if segments before begin_segno
            // are lost, or just never existed, they are not reported.
            if tlinfo.n_xlog_files != 0 {
                let expected_segno = tlinfo.end_segno + 1;

                // Segment numbers normally form an increasing sequence,
                // though two files may share a segno when the archive holds
                // both a compressed and a plain version of the segment.
                if segno != expected_segno && segno != tlinfo.end_segno {
                    tlinfo.lost_segments.push(SegInterval {
                        begin_segno: expected_segno,
                        end_segno: segno - 1,
                    });
                }
            }

            if tlinfo.begin_segno == 0 {
                tlinfo.begin_segno = segno;
            }
            // this file is the last for this timeline so far
            tlinfo.end_segno = segno;
            tlinfo.n_xlog_files += 1;
            tlinfo.size += file_size;
        }

        tlinfo.xlog_filelist.push(XlogFile {
            name: name.clone(),
            segno,
            file_type,
            size: *file_size,
            keep: false,
        });
    }

    Ok(timelines)
}

fn find_oldest_backup(tlinfo: &TimelineInfo, backups: &BackupList) -> Option<usize> {
    let mut oldest: Option<usize> = None;
    for &j in &tlinfo.backups {
        let backup = backups.get(j);
        // backups with an invalid start LSN can be safely skipped
        if !backup.start_lsn.is_valid() {
            continue;
        }
        // the backup that started earlier needs more WAL
        if oldest.map_or(true, |o| backup.start_lsn < backups.get(o).start_lsn) {
            oldest = Some(j);
        }
    }
    oldest
}

/// Iterate over parent timelines and look for the valid backup closest to
/// the given timeline's switchpoint. `None` means the timeline is not
/// reachable from any backup.
fn find_closest_backup(
    timelines: &[TimelineInfo],
    backups: &BackupList,
    start: usize,
) -> Option<usize> {
    let mut closest: Option<usize> = None;
    let mut cur = start;

    while let Some(parent) = timelines[cur].parent_link {
        if closest.is_some() {
            break;
        }
        let switchpoint = timelines[cur].switchpoint;

        for &j in &timelines[parent].backups {
            let backup = backups.get(j);

            // only valid backups made before the switchpoint qualify
            if backup.stop_lsn.is_valid()
                && backup.stop_lsn <= switchpoint
                && backup.status.is_valid()
                && closest.map_or(true, |c| backup.stop_lsn > backups.get(c).stop_lsn)
            {
                closest = Some(j);
            }
        }

        cur = parent;
    }

    closest
}

/// Build the timeline forest of an instance: scan the WAL archive, attach
/// the instance's backups, and run WAL retention planning.
pub fn collect_timelines(
    catalog: &BackupCatalog,
    instance: &InstanceConfig,
) -> anyhow::Result<TimelineForest> {
    let archive_dir = catalog.wal_archive_dir(&instance.name);

    let mut entries: Vec<(String, u64)> = Vec::new();
    match std::fs::read_dir(&archive_dir) {
        Ok(dir) => {
            for entry in dir {
                let entry =
                    entry.with_context(|| format!("Cannot read directory \"{archive_dir}\""))?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                entries.push((name, entry.metadata()?.len()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("WAL archive directory \"{}\" does not exist", archive_dir);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Cannot open directory \"{archive_dir}\""))
        }
    }
    entries.sort();

    let mut timelines = scan_archive_entries(&entries, instance.xlog_seg_size, |tli| {
        let entries = read_timeline_history(&archive_dir, tli)?;
        Ok(immediate_parent(&entries))
    })?;

    // save information about backups belonging to each timeline
    let backups = list_backups(catalog, &instance.name, None)?;
    for tlinfo in &mut timelines {
        for (j, backup) in backups.iter().enumerate() {
            if backup.tli == tlinfo.tli {
                tlinfo.backups.push(j);
            }
        }
    }

    // determine the oldest and closest backup for every timeline
    let oldest: Vec<Option<usize>> = timelines
        .iter()
        .map(|tlinfo| find_oldest_backup(tlinfo, &backups))
        .collect();
    let closest: Vec<Option<usize>> = (0..timelines.len())
        .map(|i| find_closest_backup(&timelines, &backups, i))
        .collect();
    for (tlinfo, (oldest, closest)) in timelines.iter_mut().zip(oldest.into_iter().zip(closest)) {
        tlinfo.oldest_backup = oldest;
        tlinfo.closest_backup = closest;
    }

    let mut forest = TimelineForest { timelines, backups };
    plan_wal_retention(&mut forest, instance);
    Ok(forest)
}
