// Line grammars over the extraction tool's console output.
//
// Two related grammars live here: the format-listing table produced by
// `-F`, and the per-line download progress produced with `--newline
// --progress`. Both are regex inference over free text the tool prints for
// humans, so unmatched lines are skipped rather than treated as errors:
// upstream output drifts between releases and parsing must survive that.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{DownloadEvent, FormatRecord};

lazy_static! {
    // Example: 137  mp4  1920x1080  1080p 4417k , avc1.640028, 30fps  10.5MiB
    static ref FORMAT_ROW_RE: Regex = Regex::new(
        r"^\s*(?P<id>\S+)\s+(?P<ext>\S+)\s+(?P<res>\d+x\d+|\d+p|\d+k|audio only)\s+(?P<desc>.*?)\s+(?P<size>\S+)\s*$"
    )
    .unwrap();
    // Example: [download]  45.2% of 10.50MiB at  1.2MiB/s ETA 00:30
    static ref PERCENT_RE: Regex = Regex::new(r"\[download\]\s+(\d+\.?\d*)%").unwrap();
    static ref ETA_RE: Regex = Regex::new(r"ETA\s+(\S+)").unwrap();
    static ref SPEED_RE: Regex = Regex::new(r"at\s+(\S+/s)").unwrap();
    static ref MERGE_RE: Regex = Regex::new(r"\[Merger?\]|Merging formats").unwrap();
    static ref EMBED_RE: Regex = Regex::new(r"\[EmbedSubtitle\]|Embedding subtitles").unwrap();
}

/// Fallback shown when a progress line carries no ETA or speed fragment.
/// Partial lines are normal, not an error.
pub const MISSING_FIELD: &str = "--";

/// Parse one download-phase output line into an event.
///
/// Merge/embed markers win over any percentage also present on the line:
/// once the muxer runs, the download percentages no longer describe overall
/// completion, so the phase is pinned at 99.
pub fn parse_progress_line(line: &str) -> Option<DownloadEvent> {
    if MERGE_RE.is_match(line) || EMBED_RE.is_match(line) {
        return Some(DownloadEvent::encoding());
    }

    let caps = PERCENT_RE.captures(line)?;
    let progress: f32 = caps.get(1)?.as_str().parse().ok()?;

    let eta = ETA_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| MISSING_FIELD.to_string());
    let speed = SPEED_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| MISSING_FIELD.to_string());

    Some(DownloadEvent::Downloading {
        progress,
        eta,
        speed,
    })
}

/// Parse the `-F` listing into format rows.
///
/// Everything before the header line (the one containing both "ID" and
/// "RESOLUTION") is noise; everything after is a candidate row. Rows that
/// don't fit the column pattern are dropped silently.
pub fn parse_format_table(output: &str) -> Vec<FormatRecord> {
    let mut records = Vec::new();
    let mut header_seen = false;

    for line in output.lines() {
        if !header_seen {
            if line.contains("ID") && line.contains("RESOLUTION") {
                header_seen = true;
            }
            continue;
        }

        if let Some(caps) = FORMAT_ROW_RE.captures(line) {
            records.push(FormatRecord {
                format_id: caps["id"].to_string(),
                ext: caps["ext"].to_string(),
                resolution: caps["res"].to_string(),
                description: caps["desc"].trim().to_string(),
                size: caps["size"].to_string(),
            });
        }
    }

    records
}
