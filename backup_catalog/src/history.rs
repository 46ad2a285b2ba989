//! Parsing of timeline history (`.history`) files.
//!
//! A history file lists the ancestry of a timeline, one line per ancestor:
//! `parentTLI<TAB>switchpoint<TAB>reason`. Comment lines start with `#`.

use std::str::FromStr;

use anyhow::Context;
use camino::Utf8Path;

use walmeta::{Lsn, TimeLineID};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum HistoryParseError {
    #[error("syntax error in history file: line {0}")]
    Syntax(usize),
    #[error("invalid data in history file: line {0}")]
    InvalidData(usize),
    #[error("timeline {tli} of history file is not a child of timeline {parent}")]
    OutOfOrder { tli: TimeLineID, parent: TimeLineID },
}

/// One row of a timeline's ancestry: the ancestor held the WAL position
/// range `[begin, end)`; `end` is the switchpoint where its child forked.
/// For the newest entry (the timeline itself) `end` is the invalid LSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineID,
    pub begin: Lsn,
    pub end: Lsn,
}

/// Parse the content of `{target_tli:08X}.history`.
///
/// The result is ordered newest first: index 0 is `target_tli` itself and
/// index 1, when present, is its immediate parent.
pub fn parse_history_content(
    target_tli: TimeLineID,
    content: &str,
) -> Result<Vec<TimelineHistoryEntry>, HistoryParseError> {
    let mut entries: Vec<TimelineHistoryEntry> = Vec::new();
    let mut last_tli: TimeLineID = 0;
    let mut last_end = Lsn::INVALID;

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let lineno = idx + 1;

        let mut fields = line.split_whitespace();
        let (Some(tli_field), Some(lsn_field)) = (fields.next(), fields.next()) else {
            return Err(HistoryParseError::Syntax(lineno));
        };

        let tli: TimeLineID = tli_field
            .parse()
            .map_err(|_| HistoryParseError::Syntax(lineno))?;
        let switchpoint =
            Lsn::from_str(lsn_field).map_err(|_| HistoryParseError::Syntax(lineno))?;

        // ancestors must appear in increasing timeline order
        if tli <= last_tli {
            return Err(HistoryParseError::InvalidData(lineno));
        }

        entries.insert(
            0,
            TimelineHistoryEntry {
                tli,
                begin: last_end,
                end: switchpoint,
            },
        );
        last_tli = tli;
        last_end = switchpoint;
    }

    if target_tli <= last_tli {
        return Err(HistoryParseError::OutOfOrder {
            tli: target_tli,
            parent: last_tli,
        });
    }

    // the timeline the file belongs to heads the list
    entries.insert(
        0,
        TimelineHistoryEntry {
            tli: target_tli,
            begin: last_end,
            end: Lsn::INVALID,
        },
    );
    Ok(entries)
}

/// The immediate parent of the timeline the history belongs to, with the
/// switchpoint at which the child forked off. `None` for a history with no
/// ancestors at all (a degenerate file).
pub fn immediate_parent(entries: &[TimelineHistoryEntry]) -> Option<(TimeLineID, Lsn)> {
    entries.get(1).map(|entry| (entry.tli, entry.end))
}

/// Read and parse the history file of `tli` from the WAL archive directory.
pub fn read_timeline_history(
    archive_dir: &Utf8Path,
    tli: TimeLineID,
) -> anyhow::Result<Vec<TimelineHistoryEntry>> {
    let path = archive_dir.join(format!("{tli:08X}.history"));
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Cannot read history file \"{path}\""))?;
    parse_history_content(tli, &content)
        .with_context(|| format!("Cannot parse history file \"{path}\""))
}
