// Common data models shared by the catalog, session and facade

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One row of the extraction tool's format listing, as scraped from its
/// tabular console output. Recreated on every catalog fetch, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRecord {
    pub format_id: String,
    /// Container extension, e.g. "mp4" or "m4a"
    pub ext: String,
    /// Resolution label: "1920x1080", "1080p", "8k" or "audio only"
    pub resolution: String,
    /// Free-text middle columns (codec, bitrate, notes)
    pub description: String,
    /// Approximate size as printed by the tool, e.g. "10.5MiB"
    pub size: String,
}

impl FormatRecord {
    /// Numeric height extracted from the resolution label, used for ranking.
    /// "audio only" and labels without digits yield `None`.
    pub fn resolution_height(&self) -> Option<u32> {
        let label = self.resolution.trim();
        if let Some((_, height)) = label.split_once('x') {
            return height.parse().ok();
        }
        if let Some(n) = label.strip_suffix('p') {
            return n.parse().ok();
        }
        if let Some(n) = label.strip_suffix('k') {
            return n.parse::<u32>().ok().map(|n| n * 1000);
        }
        None
    }

    pub fn is_audio_only(&self) -> bool {
        self.resolution.trim() == "audio only"
    }
}

/// Usable format candidates for one URL, split into the streams the UI
/// lets the user pick from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatCatalogResult {
    /// Video candidates, strictly descending by resolution height
    pub video_formats: Vec<FormatRecord>,
    /// Audio-only candidates
    pub audio_formats: Vec<FormatRecord>,
}

/// Subtitle handling for a download request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionOptions {
    /// Requested subtitle languages ("en", "de", ...). Both manual and
    /// automatic tracks are requested for each language.
    pub languages: BTreeSet<String>,
    /// Embed subtitles into the container instead of writing sidecar files
    pub embed: bool,
}

/// Everything needed to start one download. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub source_url: String,
    pub destination: PathBuf,
    pub video_format_id: String,
    /// Audio streams to download and mux alongside the video, in order.
    /// Must contain at least one entry.
    pub audio_format_ids: Vec<String>,
    pub captions: Option<CaptionOptions>,
}

impl DownloadRequest {
    /// Joined format-selector expression handed to the extraction tool,
    /// e.g. "137+140+141".
    pub fn format_selector(&self) -> String {
        let mut selector = self.video_format_id.clone();
        for audio in &self.audio_format_ids {
            selector.push('+');
            selector.push_str(audio);
        }
        selector
    }
}

/// Events emitted on a download's channel, in emission order.
///
/// Progress percents are non-decreasing per request, except the forced jump
/// to 99 while the muxer merges or embeds, and the final snap to 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadEvent {
    Downloading {
        progress: f32,
        eta: String,
        speed: String,
    },
    /// Merge/embed phase; progress is pinned at 99
    Encoding { progress: f32 },
    /// Terminal success event, always 100 / "0s" / "0B/s"
    Completed {
        progress: f32,
        eta: String,
        speed: String,
    },
    /// Terminal failure event
    Failed { message: String },
    /// One stderr line from the tool, informational
    Diagnostic { line: String },
}

impl DownloadEvent {
    pub fn encoding() -> Self {
        DownloadEvent::Encoding { progress: 99.0 }
    }

    pub fn completed() -> Self {
        DownloadEvent::Completed {
            progress: 100.0,
            eta: "0s".to_string(),
            speed: "0B/s".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Completed { .. } | DownloadEvent::Failed { .. }
        )
    }
}
