// Binary provisioning: locate-or-fetch the two external tools.
//
// Each tool lives at one fixed path in the OS temp directory. A cached file
// is trusted as-is (no version or content check; see DESIGN.md); a missing
// one is fetched from a static per-platform release URL and installed with
// a write-temp-then-rename so concurrent provisioners cannot corrupt it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::errors::ProvisionError;

/// Maximum redirect hops followed while fetching a release asset.
pub const REDIRECT_LIMIT: usize = 5;

/// Payloads smaller than this are treated as corrupt (an HTML error page,
/// a truncated transfer), never as a valid binary.
const MIN_BINARY_SIZE: usize = 1_000_000;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolKind {
    /// Inspects a media URL, lists streams, downloads and muxes them
    Extractor,
    /// Combines separate audio/video streams; driven by the extractor
    Muxer,
}

impl ToolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Extractor => "yt-dlp",
            ToolKind::Muxer => "ffmpeg",
        }
    }

    fn binary_name(&self, os: &str) -> &'static str {
        match (self, os) {
            (ToolKind::Extractor, "windows") => "yt-dlp.exe",
            (ToolKind::Extractor, _) => "yt-dlp",
            (ToolKind::Muxer, "windows") => "ffmpeg.exe",
            (ToolKind::Muxer, _) => "ffmpeg",
        }
    }
}

/// Release asset URL for a tool on a given platform.
fn download_url(kind: ToolKind, os: &str, arch: &str) -> Result<&'static str, ProvisionError> {
    let url = match (kind, os, arch) {
        (ToolKind::Extractor, "windows", "x86_64") => {
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp.exe"
        }
        (ToolKind::Extractor, "windows", "x86") => {
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_win_x86.exe"
        }
        (ToolKind::Extractor, "windows", "aarch64") => {
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_win_arm64.exe"
        }
        (ToolKind::Extractor, "macos", "aarch64") => {
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_macos_arm64"
        }
        (ToolKind::Extractor, "macos", _) => {
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_macos"
        }
        (ToolKind::Extractor, "linux", "x86_64") => {
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp"
        }
        (ToolKind::Extractor, "linux", "aarch64") => {
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_linux_aarch64"
        }
        (ToolKind::Extractor, "linux", "arm") => {
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_linux_armv7l"
        }
        (ToolKind::Muxer, "windows", "aarch64") => {
            "https://github.com/BtbN/FFmpeg-Builds/releases/latest/download/ffmpeg-master-latest-winarm64-gpl.zip"
        }
        (ToolKind::Muxer, "windows", _) => {
            "https://github.com/BtbN/FFmpeg-Builds/releases/latest/download/ffmpeg-master-latest-win64-gpl.zip"
        }
        (ToolKind::Muxer, "macos", _) => "https://evermeet.cx/ffmpeg/ffmpeg",
        (ToolKind::Muxer, "linux", "x86_64") => {
            "https://github.com/eugeneware/ffmpeg-static/releases/latest/download/ffmpeg-linux-x64"
        }
        (ToolKind::Muxer, "linux", "aarch64") => {
            "https://github.com/eugeneware/ffmpeg-static/releases/latest/download/ffmpeg-linux-arm64"
        }
        _ => {
            return Err(ProvisionError::UnsupportedPlatform {
                tool: kind.name(),
                os: os.to_string(),
                arch: arch.to_string(),
            })
        }
    };
    Ok(url)
}

/// The Windows muxer ships as a zip holding the ffmpeg/ffprobe pair;
/// everywhere else the payload is the raw executable.
fn muxer_payload_is_archive(os: &str) -> bool {
    os == "windows"
}

/// Body and content type of a fetched release asset.
#[derive(Debug)]
pub struct FetchedPayload {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Injected HTTP capability so provisioning is testable without a network.
#[async_trait]
pub trait BinaryFetcher: Send + Sync {
    async fn fetch(&self, tool: &'static str, url: &str)
        -> Result<FetchedPayload, ProvisionError>;
}

/// Production fetcher: redirect-following HTTPS GET with a bounded hop
/// count, so a misbehaving redirect chain errors out instead of looping.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(REDIRECT_LIMIT))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BinaryFetcher for HttpFetcher {
    async fn fetch(
        &self,
        tool: &'static str,
        url: &str,
    ) -> Result<FetchedPayload, ProvisionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ProvisionError::Network { tool, source })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ProvisionError::BadStatus {
                tool,
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let body = response
            .bytes()
            .await
            .map_err(|source| ProvisionError::Network { tool, source })?
            .to_vec();

        Ok(FetchedPayload { content_type, body })
    }
}

/// Resolves local paths to the external tools, downloading them on first use.
pub struct BinaryProvisioner {
    fetcher: Arc<dyn BinaryFetcher>,
    cache_dir: PathBuf,
    os: &'static str,
    arch: &'static str,
}

impl BinaryProvisioner {
    pub fn new(fetcher: Arc<dyn BinaryFetcher>) -> Self {
        Self {
            fetcher,
            cache_dir: std::env::temp_dir(),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    /// Provisioner with the default HTTP fetcher.
    pub fn with_http() -> Self {
        Self::new(Arc::new(HttpFetcher::new()))
    }

    /// Override the cache directory (tests, portable installs).
    pub fn with_cache_dir(mut self, cache_dir: PathBuf) -> Self {
        self.cache_dir = cache_dir;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_platform(mut self, os: &'static str, arch: &'static str) -> Self {
        self.os = os;
        self.arch = arch;
        self
    }

    /// Path the tool lives at once provisioned.
    pub fn tool_path(&self, kind: ToolKind) -> PathBuf {
        self.cache_dir.join(kind.binary_name(self.os))
    }

    /// Return a verified, executable path to the tool, fetching and
    /// installing it first if the cache is empty. Idempotent: a cached
    /// binary short-circuits without any network or write activity.
    pub async fn ensure(&self, kind: ToolKind) -> Result<PathBuf, ProvisionError> {
        let target = self.tool_path(kind);

        if target.exists() {
            debug!(tool = kind.name(), path = %target.display(), "using cached binary");
            self.mark_executable(&target);
            return Ok(target);
        }

        let url = download_url(kind, self.os, self.arch)?;
        info!(tool = kind.name(), url, "downloading binary");
        let payload = self.fetcher.fetch(kind.name(), url).await?;

        // yt-dlp release assets are served as octet-stream; anything else
        // (typically an HTML error page) is rejected before touching disk.
        if kind == ToolKind::Extractor {
            let content_type = payload.content_type.as_deref().unwrap_or("");
            if !content_type.contains(OCTET_STREAM) {
                return Err(ProvisionError::ContentType {
                    tool: kind.name(),
                    content_type: content_type.to_string(),
                });
            }
        }

        if payload.body.len() < MIN_BINARY_SIZE {
            return Err(ProvisionError::UndersizedPayload {
                tool: kind.name(),
                size: payload.body.len(),
            });
        }

        if kind == ToolKind::Muxer && muxer_payload_is_archive(self.os) {
            self.install_muxer_archive(&payload.body, &target)?;
        } else {
            self.install_raw(kind, &payload.body, &target)?;
        }

        info!(tool = kind.name(), path = %target.display(), "binary installed");
        Ok(target)
    }

    /// Full-file write through a uniquely named temp file plus rename.
    /// Concurrent callers racing on first provisioning each write their own
    /// temp file, so the rename is the only shared step: last writer wins,
    /// never a half-written binary.
    fn install_raw(
        &self,
        kind: ToolKind,
        body: &[u8],
        target: &Path,
    ) -> Result<(), ProvisionError> {
        let tool = kind.name();
        let mut staged = tempfile::NamedTempFile::new_in(&self.cache_dir)
            .map_err(|source| ProvisionError::Io { tool, source })?;
        staged
            .write_all(body)
            .map_err(|source| ProvisionError::Io { tool, source })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o755))
                .map_err(|source| ProvisionError::Io { tool, source })?;
        }

        staged.persist(target).map_err(|error| ProvisionError::Io {
            tool,
            source: error.error,
        })?;
        Ok(())
    }

    /// Unzip the muxer package: the ffmpeg/ffprobe pair sits under the
    /// build's bin/ directory. The archive lands in a temp file that is
    /// removed whether or not extraction succeeds.
    fn install_muxer_archive(&self, body: &[u8], target: &Path) -> Result<(), ProvisionError> {
        let tool = ToolKind::Muxer.name();
        let mut archive = tempfile::NamedTempFile::new_in(&self.cache_dir)
            .map_err(|source| ProvisionError::Io { tool, source })?;
        archive
            .write_all(body)
            .map_err(|source| ProvisionError::Io { tool, source })?;

        let probe_target = self.cache_dir.join("ffprobe.exe");
        extract_muxer_pair(archive.path(), target, &probe_target)
    }

    /// Re-assert the executable bit on an already-cached unix binary; a
    /// failure here is logged, not fatal, matching a cache the user may
    /// have touched.
    fn mark_executable(&self, path: &Path) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(0o755)) {
                warn!(path = %path.display(), %error, "failed to set executable permission");
            }
        }
        #[cfg(not(unix))]
        let _ = path;
    }
}

fn extract_muxer_pair(
    archive_path: &Path,
    ffmpeg_target: &Path,
    ffprobe_target: &Path,
) -> Result<(), ProvisionError> {
    let tool = ToolKind::Muxer.name();
    let file = fs::File::open(archive_path).map_err(|source| ProvisionError::Io { tool, source })?;
    let mut archive = ZipArchive::new(file).map_err(|error| ProvisionError::Archive {
        tool,
        reason: error.to_string(),
    })?;

    let stage_dir = ffmpeg_target.parent().unwrap_or_else(|| Path::new("."));

    // Stage both binaries as uniquely named temp files first; nothing lands
    // at its final path unless the archive held the complete pair, and a
    // failed extraction leaves no staged files behind.
    let mut ffmpeg_stage: Option<tempfile::NamedTempFile> = None;
    let mut ffprobe_stage: Option<tempfile::NamedTempFile> = None;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|error| ProvisionError::Archive {
                tool,
                reason: error.to_string(),
            })?;
        if !entry.is_file() {
            continue;
        }

        let normalized = entry.name().replace('\\', "/").to_lowercase();
        let slot = if normalized.ends_with("/bin/ffmpeg.exe") {
            &mut ffmpeg_stage
        } else if normalized.ends_with("/bin/ffprobe.exe") {
            &mut ffprobe_stage
        } else {
            continue;
        };

        let mut staged = tempfile::NamedTempFile::new_in(stage_dir)
            .map_err(|source| ProvisionError::Io { tool, source })?;
        std::io::copy(&mut entry, &mut staged)
            .map_err(|source| ProvisionError::Io { tool, source })?;
        *slot = Some(staged);
    }

    let (ffmpeg_stage, ffprobe_stage) = match (ffmpeg_stage, ffprobe_stage) {
        (Some(ffmpeg), Some(ffprobe)) => (ffmpeg, ffprobe),
        _ => {
            return Err(ProvisionError::Archive {
                tool,
                reason: "archive did not contain bin/ffmpeg.exe and bin/ffprobe.exe".to_string(),
            })
        }
    };

    ffmpeg_stage
        .persist(ffmpeg_target)
        .map_err(|error| ProvisionError::Io {
            tool,
            source: error.error,
        })?;
    if let Err(error) = ffprobe_stage.persist(ffprobe_target) {
        let _ = fs::remove_file(ffmpeg_target);
        return Err(ProvisionError::Io {
            tool,
            source: error.error,
        });
    }

    Ok(())
}
