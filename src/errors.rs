// Error types for the orchestration core

use std::path::PathBuf;

/// Failures while locating or installing one of the external tools.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Network error while fetching {tool}: {source}")]
    Network {
        tool: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to fetch {tool}: server answered {status}")]
    BadStatus { tool: &'static str, status: u16 },

    #[error("Invalid content type for {tool}: {content_type}")]
    ContentType {
        tool: &'static str,
        content_type: String,
    },

    #[error("Downloaded {tool} payload is too small to be a valid binary ({size} bytes)")]
    UndersizedPayload { tool: &'static str, size: usize },

    #[error("Failed to extract {tool} archive: {reason}")]
    Archive { tool: &'static str, reason: String },

    #[error("No {tool} build is published for {os}/{arch}")]
    UnsupportedPlatform {
        tool: &'static str,
        os: String,
        arch: String,
    },

    #[error("Filesystem error while installing {tool}: {source}")]
    Io {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while listing formats for a URL.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Failed to run the extraction tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Format listing failed: {stderr}")]
    ToolFailed { stderr: String },
}

/// Failures while starting a download. Runtime failures of a running
/// download are reported on its event stream, not through this type.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Failed to start the download process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("A download to {} is already active", .0.display())]
    DestinationBusy(PathBuf),

    #[error("Download request must select at least one audio format")]
    EmptyAudioSelection,
}
