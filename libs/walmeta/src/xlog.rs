//! Naming conventions of files in a WAL archive directory.
//!
//! Many of these functions have been copied from PostgreSQL, and rewritten
//! in Rust. That's why they don't follow the usual Rust naming conventions,
//! they have been named the same as the corresponding PostgreSQL functions
//! instead.

use crate::lsn::Lsn;

pub type XLogSegNo = u64;
pub type TimeLineID = u32;

pub const XLOG_FNAME_LEN: usize = 24;

/// How many segments fit into one xlog "logical log" (the middle 8 hex
/// digits of a segment name). Derived from the instance's segment size.
#[allow(non_snake_case)]
pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: u64) -> XLogSegNo {
    0x100000000u64 / wal_segsz_bytes
}

#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, seg_no: XLogSegNo, wal_segsz_bytes: u64) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        seg_no / XLogSegmentsPerXLogId(wal_segsz_bytes),
        seg_no % XLogSegmentsPerXLogId(wal_segsz_bytes)
    )
}

/// Split a 24-character segment file name into `(segno, tli)`.
///
/// The caller must have validated the name with one of the `Is*FileName`
/// predicates; only the first [`XLOG_FNAME_LEN`] characters are looked at.
#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, wal_seg_size: u64) -> (XLogSegNo, TimeLineID) {
    let tli = u32::from_str_radix(&fname[0..8], 16).unwrap();
    let log = u32::from_str_radix(&fname[8..16], 16).unwrap() as XLogSegNo;
    let seg = u32::from_str_radix(&fname[16..24], 16).unwrap() as XLogSegNo;
    (log * XLogSegmentsPerXLogId(wal_seg_size) + seg, tli)
}

/// Segment number containing `lsn`, same as PostgreSQL's `XLByteToSeg`.
#[allow(non_snake_case)]
pub fn GetXLogSegNo(lsn: Lsn, wal_seg_size: u64) -> XLogSegNo {
    lsn.segment_number(wal_seg_size)
}

#[allow(non_snake_case)]
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN && fname.chars().all(|c| c.is_ascii_hexdigit())
}

#[allow(non_snake_case)]
pub fn IsPartialXLogFileName(fname: &str) -> bool {
    fname.ends_with(".partial") && IsXLogFileName(&fname[0..fname.len() - 8])
}

/// Segment compressed by the archiver. It stands in for the plain segment
/// and may coexist with it.
#[allow(non_snake_case)]
pub fn IsCompressedXLogFileName(fname: &str) -> bool {
    fname.ends_with(".gz") && IsXLogFileName(&fname[0..fname.len() - 3])
}

#[allow(non_snake_case)]
pub fn IsBackupHistoryFileName(fname: &str) -> bool {
    fname.ends_with(".backup") && IsXLogFileName(&fname[0..fname.len() - 7])
}

#[allow(non_snake_case)]
pub fn IsTLHistoryFileName(fname: &str) -> bool {
    fname.len() == 8 + ".history".len()
        && fname.ends_with(".history")
        && fname[0..8].chars().all(|c| c.is_ascii_hexdigit())
}
