// Download orchestration core for the Ripit desktop app.
//
// Drives two external command-line tools, an extraction tool (yt-dlp)
// and a muxer (ffmpeg), to list formats for a media URL and download
// selected streams, surfacing progress and errors as typed events. The UI
// shell, save dialogs and settings live elsewhere; this crate is only the
// engineered middle: binary provisioning, format negotiation, subprocess
// lifecycle and the progress/event model.

pub mod catalog;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod provision;
pub mod runner;
pub mod session;

pub use catalog::FormatCatalog;
pub use errors::{DownloadError, ExtractionError, ProvisionError};
pub use models::{
    CaptionOptions, DownloadEvent, DownloadRequest, FormatCatalogResult, FormatRecord,
};
pub use orchestrator::Orchestrator;
pub use provision::{BinaryFetcher, BinaryProvisioner, HttpFetcher, ToolKind};
pub use runner::{CapturedOutput, ProcessRunner, SpawnedProcess, TokioProcessRunner};
pub use session::{ActiveDownload, DownloadSession};
