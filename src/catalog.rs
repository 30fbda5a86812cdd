// Format negotiation: run the extractor in list mode and turn its table
// into ranked video/audio candidates.

use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::ExtractionError;
use crate::models::{FormatCatalogResult, FormatRecord};
use crate::progress::parse_format_table;
use crate::provision::{BinaryProvisioner, ToolKind};
use crate::runner::ProcessRunner;

/// Container the extractor is asked to mux into; video candidates must
/// already sit in it so no re-encode is needed.
const TARGET_VIDEO_CONTAINER: &str = "mp4";
/// Codec family the mux container requires of video streams.
const REQUIRED_VIDEO_CODEC: &str = "avc1";
/// Container carrying the AAC audio streams we pair with the video.
const TARGET_AUDIO_CONTAINER: &str = "m4a";

pub struct FormatCatalog {
    provisioner: Arc<BinaryProvisioner>,
    runner: Arc<dyn ProcessRunner>,
}

impl FormatCatalog {
    pub fn new(provisioner: Arc<BinaryProvisioner>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            provisioner,
            runner,
        }
    }

    /// List the usable stream variants for a URL.
    ///
    /// The extractor runs to completion with its output captured whole;
    /// listing is quick and has no progress worth streaming.
    pub async fn list_formats(&self, url: &str) -> Result<FormatCatalogResult, ExtractionError> {
        let extractor = self.provisioner.ensure(ToolKind::Extractor).await?;

        let args = vec!["-F".to_string(), url.to_string()];
        debug!(url, "listing formats");
        let output = self
            .runner
            .run_capture(&extractor, &args)
            .await
            .map_err(ExtractionError::Spawn)?;

        if !output.success() {
            return Err(ExtractionError::ToolFailed {
                stderr: output.stderr,
            });
        }

        let records = parse_format_table(&output.stdout);
        let result = filter_and_rank(records);
        info!(
            url,
            video = result.video_formats.len(),
            audio = result.audio_formats.len(),
            "format catalog built"
        );
        Ok(result)
    }
}

/// Apply the selection policy and rank video candidates best-first.
///
/// Video rows without a parseable height cannot be ranked and are dropped;
/// that is a boundary case of the listing grammar, not an error.
fn filter_and_rank(records: Vec<FormatRecord>) -> FormatCatalogResult {
    let mut video_formats = Vec::new();
    let mut audio_formats = Vec::new();

    for record in records {
        if record.is_audio_only() {
            if record.ext == TARGET_AUDIO_CONTAINER {
                audio_formats.push(record);
            }
        } else if record.ext == TARGET_VIDEO_CONTAINER
            && record.description.contains(REQUIRED_VIDEO_CODEC)
            && record.resolution_height().is_some()
        {
            video_formats.push(record);
        }
    }

    video_formats.sort_by(|a, b| b.resolution_height().cmp(&a.resolution_height()));

    FormatCatalogResult {
        video_formats,
        audio_formats,
    }
}
