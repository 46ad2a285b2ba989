//! WAL retention planning.
//!
//! `wal_depth` tells how many recent valid backups of every timeline must
//! keep their ability to do point-in-time recovery. For each timeline the
//! planner picks an anchor backup whose start LSN becomes the floor below
//! which WAL may be purged; timelines without enough backups fall back to
//! the closest backup on an ancestor timeline, protecting the ancestor's
//! segment range up to the switchpoint. Older ARCHIVE backups keep their
//! `[start_lsn, stop_lsn]` segment ranges. The result is the `keep` flag
//! on every archive file; nothing is deleted here.

use tracing::trace;

use walmeta::xlog::GetXLogSegNo;

use crate::config::InstanceConfig;
use crate::timelines::{SegInterval, TimelineForest};

/// Determine which WAL segments must be kept for the configured
/// `wal_depth`. Does nothing when the depth is zero or negative.
pub fn plan_wal_retention(forest: &mut TimelineForest, instance: &InstanceConfig) {
    if instance.wal_depth <= 0 {
        return;
    }
    let seg_size = instance.xlog_seg_size;

    let TimelineForest { timelines, backups } = forest;

    // determine anchor_lsn and keep_segments for every timeline
    for i in 0..timelines.len() {
        // Iterate the timeline's backups, newest first, to find the
        // anchor backup. The backup list is ordered by id, which grows
        // with start_lsn, so this walks start_lsn descending.
        let mut count = 0;
        let mut anchor_pos: Option<usize> = None;
        for (pos, &j) in timelines[i].backups.iter().enumerate() {
            let backup = backups.get(j);

            if !backup.status.is_valid() {
                continue;
            }
            // sanity
            if !backup.start_lsn.is_valid() || backup.tli == 0 {
                continue;
            }

            trace!("Timeline {}: backup {}", timelines[i].tli, backup.id);

            count += 1;
            if count == instance.wal_depth {
                trace!(
                    "Timeline {}: ANCHOR {}, TLI {}",
                    timelines[i].tli,
                    backup.id,
                    backup.tli
                );
                anchor_pos = Some(pos);
                break;
            }
        }
        if let Some(pos) = anchor_pos {
            let anchor = backups.get(timelines[i].backups[pos]);
            timelines[i].anchor_lsn = anchor.start_lsn;
            timelines[i].anchor_tli = anchor.tli;
        }

        if !timelines[i].anchor_lsn.is_valid() {
            // This timeline does not have wal_depth valid backups of its
            // own, but it must stay reachable through its ancestors if it
            // can be: anchor on the closest backup of the parent chain and
            // protect the ancestor segments leading here.
            let Some(closest) = timelines[i].closest_backup else {
                // No closest backup either; WAL retention cannot be
                // applied, regular purge rules take over.
                continue;
            };
            let closest_backup = backups.get(closest);
            // sanity for the closest backup
            if !closest_backup.start_lsn.is_valid() || closest_backup.tli == 0 {
                continue;
            }

            timelines[i].anchor_lsn = closest_backup.start_lsn;
            timelines[i].anchor_tli = closest_backup.tli;

            let closest_tli = closest_backup.tli;
            let closest_start_segno = GetXLogSegNo(closest_backup.start_lsn, seg_size);

            // Walk up the parent chain, reserving each ancestor's segments
            // from the relevant starting point to the switchpoint. On the
            // timeline the closest backup lives on, the range starts at
            // the backup itself and the walk ends.
            let mut cur = i;
            while let Some(parent) = timelines[cur].parent_link {
                let switch_segno = GetXLogSegNo(timelines[cur].switchpoint, seg_size);
                cur = parent;

                if timelines[cur].tli != closest_tli {
                    let interval = SegInterval {
                        begin_segno: timelines[cur].begin_segno,
                        end_segno: switch_segno,
                    };
                    timelines[cur].keep_segments.push(interval);
                } else {
                    timelines[cur].keep_segments.push(SegInterval {
                        begin_segno: closest_start_segno,
                        end_segno: switch_segno,
                    });
                    break;
                }
            }
            // this timeline is covered wholesale by its ancestors
            continue;
        }

        // The anchor protects everything from itself onward; ARCHIVE
        // backups older than the anchor need their [start_lsn, stop_lsn]
        // ranges kept for consistency.
        let Some(anchor_pos) = anchor_pos else {
            continue;
        };
        let anchor_lsn = timelines[i].anchor_lsn;
        for pos in anchor_pos + 1..timelines[i].backups.len() {
            let backup = backups.get(timelines[i].backups[pos]);

            // STREAM backups carry their own WAL
            if backup.stream {
                continue;
            }
            if !backup.status.is_valid() {
                continue;
            }
            // sanity
            if !backup.start_lsn.is_valid() || backup.tli == 0 {
                continue;
            }
            // already protected by the anchor
            if backup.start_lsn >= anchor_lsn {
                continue;
            }

            let begin_segno = GetXLogSegNo(backup.start_lsn, seg_size);
            let stop_segno = GetXLogSegNo(backup.stop_lsn, seg_size);
            // On a replica the stop LSN may point into a continuation
            // record, so reserve the next segment after it as well.
            let end_segno = if backup.from_replica {
                stop_segno + 1
            } else {
                stop_segno
            };

            timelines[i].keep_segments.push(SegInterval {
                begin_segno,
                end_segno,
            });
        }
    }

    // Protect WAL segments from deletion by setting the keep flag: all
    // segments from the anchor onward, plus the reserved intervals.
    for tlinfo in timelines.iter_mut() {
        // an invalid anchor here means the timeline is left to the
        // regular purge rules
        if !tlinfo.anchor_lsn.is_valid() {
            continue;
        }

        // an anchor on another timeline protects this timeline entirely;
        // the ancestor's keep intervals carry the burden
        if tlinfo.anchor_tli > 0 && tlinfo.anchor_tli != tlinfo.tli {
            continue;
        }

        let anchor_segno = GetXLogSegNo(tlinfo.anchor_lsn, seg_size);

        for wal_file in &mut tlinfo.xlog_filelist {
            if wal_file.segno >= anchor_segno {
                wal_file.keep = true;
                continue;
            }

            if tlinfo
                .keep_segments
                .iter()
                .any(|interval| interval.contains(wal_file.segno))
            {
                wal_file.keep = true;
            }
        }
    }
}
