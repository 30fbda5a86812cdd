// Download lifecycle: spawn the extractor with the composed selector,
// scrape its progress output into events, snap to a terminal event on exit.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::DownloadError;
use crate::models::{DownloadEvent, DownloadRequest};
use crate::progress::parse_progress_line;
use crate::provision::{BinaryProvisioner, ToolKind};
use crate::runner::ProcessRunner;

/// A running download: its event stream plus the handles the facade keeps.
///
/// `events` closes after the terminal event (or silently on cancellation);
/// `done` resolves once the supervising task has fully wound down.
#[derive(Debug)]
pub struct ActiveDownload {
    pub events: mpsc::UnboundedReceiver<DownloadEvent>,
    pub cancel: oneshot::Sender<()>,
    pub done: oneshot::Receiver<()>,
}

pub struct DownloadSession {
    provisioner: Arc<BinaryProvisioner>,
    runner: Arc<dyn ProcessRunner>,
}

impl DownloadSession {
    pub fn new(provisioner: Arc<BinaryProvisioner>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            provisioner,
            runner,
        }
    }

    /// Provision both tools, spawn the extractor and stream its output as
    /// events. Failures after the spawn arrive on the event channel; the
    /// session never retries and never cleans up partial output files.
    pub async fn start(&self, request: DownloadRequest) -> Result<ActiveDownload, DownloadError> {
        if request.audio_format_ids.is_empty() {
            return Err(DownloadError::EmptyAudioSelection);
        }

        let extractor = self.provisioner.ensure(ToolKind::Extractor).await?;
        let muxer = self.provisioner.ensure(ToolKind::Muxer).await?;

        // The extractor invokes the muxer itself; it only needs to know
        // the directory the muxer pair lives in.
        let muxer_dir = muxer
            .parent()
            .map(|dir| dir.to_path_buf())
            .unwrap_or_else(|| muxer.clone());

        let mut args = vec![
            "-f".to_string(),
            request.format_selector(),
            "--audio-multistream".to_string(),
            "--ffmpeg-location".to_string(),
            muxer_dir.to_string_lossy().into_owned(),
        ];

        if let Some(captions) = &request.captions {
            if !captions.languages.is_empty() {
                let languages: Vec<&str> =
                    captions.languages.iter().map(String::as_str).collect();
                args.push("--write-subs".to_string());
                args.push("--write-auto-subs".to_string());
                args.push("--sub-langs".to_string());
                args.push(languages.join(","));
                if captions.embed {
                    args.push("--embed-subs".to_string());
                }
            }
        }

        args.push("--newline".to_string());
        args.push("--progress".to_string());
        args.push("-o".to_string());
        args.push(request.destination.to_string_lossy().into_owned());
        args.push(request.source_url.clone());

        info!(
            url = request.source_url,
            destination = %request.destination.display(),
            selector = request.format_selector(),
            "starting download"
        );

        let process = self
            .runner
            .spawn_streaming(&extractor, &args)
            .await
            .map_err(DownloadError::Spawn)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(pump_events(process, event_tx, cancel_rx, done_tx));

        Ok(ActiveDownload {
            events: event_rx,
            cancel: cancel_tx,
            done: done_rx,
        })
    }
}

/// Forward process output as events until the process exits or the caller
/// cancels. Cancellation kills the process and closes the channel without
/// a terminal event; further output is suppressed.
async fn pump_events(
    mut process: crate::runner::SpawnedProcess,
    events: mpsc::UnboundedSender<DownloadEvent>,
    mut cancel: oneshot::Receiver<()>,
    done: oneshot::Sender<()>,
) {
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut cancel_open = true;
    let mut cancelled = false;

    while stdout_open || stderr_open {
        tokio::select! {
            line = process.stdout.recv(), if stdout_open => match line {
                Some(line) => {
                    if let Some(event) = parse_progress_line(&line) {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }
                None => stdout_open = false,
            },
            line = process.stderr.recv(), if stderr_open => match line {
                Some(line) => {
                    debug!(line, "tool stderr");
                    let _ = events.send(DownloadEvent::Diagnostic { line });
                }
                None => stderr_open = false,
            },
            result = &mut cancel, if cancel_open => match result {
                Ok(()) => {
                    info!("download cancelled, killing process");
                    let _ = process.stop.send(());
                    cancelled = true;
                    break;
                }
                // Cancel handle dropped without firing; keep streaming
                Err(_) => cancel_open = false,
            },
        }
    }

    if !cancelled {
        let exit_code = process.exit.await.unwrap_or(None);
        let terminal = match exit_code {
            Some(0) => DownloadEvent::completed(),
            code => {
                warn!(?code, "download process failed");
                DownloadEvent::Failed {
                    message: "Download failed".to_string(),
                }
            }
        };
        let _ = events.send(terminal);
    }

    let _ = done.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CaptionOptions;
    use crate::runner::mock::ScriptedRunner;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use test_log::test;

    /// Cache dir with both tool stubs already in place.
    fn provisioned() -> (Arc<BinaryProvisioner>, tempfile::TempDir) {
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join("yt-dlp"), b"stub").unwrap();
        std::fs::write(cache.path().join("ffmpeg"), b"stub").unwrap();
        let provisioner = BinaryProvisioner::with_http()
            .with_cache_dir(cache.path().to_path_buf())
            .with_platform("linux", "x86_64");
        (Arc::new(provisioner), cache)
    }

    fn request() -> DownloadRequest {
        DownloadRequest {
            source_url: "https://example.com/watch?v=abc".to_string(),
            destination: PathBuf::from("/tmp/video.mp4"),
            video_format_id: "137".to_string(),
            audio_format_ids: vec!["140".to_string()],
            captions: None,
        }
    }

    async fn collect_events(
        receiver: &mut mpsc::UnboundedReceiver<DownloadEvent>,
    ) -> Vec<DownloadEvent> {
        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }
        events
    }

    #[test(tokio::test)]
    async fn test_progress_stream_and_snap_to_done() {
        let runner = Arc::new(ScriptedRunner::streaming(
            &[
                "[youtube] abc: Downloading webpage",
                "[download]  45.2% of 10.50MiB at  1.2MiB/s ETA 00:30",
                "[download]  97.0% of 10.50MiB at  1.0MiB/s ETA 00:01",
                "[Merger] Merging formats into \"/tmp/video.mp4\"",
            ],
            &[],
            Some(0),
        ));
        let (provisioner, _cache) = provisioned();
        let session = DownloadSession::new(provisioner, runner);

        let mut active = session.start(request()).await.unwrap();
        let events = collect_events(&mut active.events).await;

        assert_eq!(
            events,
            vec![
                DownloadEvent::Downloading {
                    progress: 45.2,
                    eta: "00:30".to_string(),
                    speed: "1.2MiB/s".to_string(),
                },
                DownloadEvent::Downloading {
                    progress: 97.0,
                    eta: "00:01".to_string(),
                    speed: "1.0MiB/s".to_string(),
                },
                DownloadEvent::encoding(),
                // Exit 0 snaps to done even though 100% was never printed
                DownloadEvent::completed(),
            ]
        );
    }

    #[test(tokio::test)]
    async fn test_nonzero_exit_yields_failed() {
        let runner = Arc::new(ScriptedRunner::streaming(
            &["[download]  10.0% of 10.50MiB at  1.2MiB/s ETA 01:30"],
            &["ERROR: unable to download video data"],
            Some(1),
        ));
        let (provisioner, _cache) = provisioned();
        let session = DownloadSession::new(provisioner, runner);

        let mut active = session.start(request()).await.unwrap();
        let events = collect_events(&mut active.events).await;

        assert!(events.contains(&DownloadEvent::Diagnostic {
            line: "ERROR: unable to download video data".to_string()
        }));
        assert_eq!(
            events.last(),
            Some(&DownloadEvent::Failed {
                message: "Download failed".to_string()
            })
        );
    }

    #[test(tokio::test)]
    async fn test_argument_vector_shape() {
        let runner = Arc::new(ScriptedRunner::streaming(&[], &[], Some(0)));
        let (provisioner, cache) = provisioned();
        let session = DownloadSession::new(provisioner, runner.clone());

        let mut req = request();
        req.audio_format_ids = vec!["140".to_string(), "141".to_string()];
        let mut active = session.start(req).await.unwrap();
        collect_events(&mut active.events).await;

        let args = runner.recorded_args();
        let muxer_dir = cache.path().to_string_lossy().into_owned();
        assert_eq!(
            args,
            vec![
                "-f",
                "137+140+141",
                "--audio-multistream",
                "--ffmpeg-location",
                muxer_dir.as_str(),
                "--newline",
                "--progress",
                "-o",
                "/tmp/video.mp4",
                "https://example.com/watch?v=abc",
            ]
        );
    }

    #[test(tokio::test)]
    async fn test_caption_flags_with_embedding() {
        let runner = Arc::new(ScriptedRunner::streaming(&[], &[], Some(0)));
        let (provisioner, _cache) = provisioned();
        let session = DownloadSession::new(provisioner, runner.clone());

        let mut req = request();
        req.captions = Some(CaptionOptions {
            languages: BTreeSet::from(["en".to_string(), "de".to_string()]),
            embed: true,
        });
        let mut active = session.start(req).await.unwrap();
        collect_events(&mut active.events).await;

        let args = runner.recorded_args();
        let subs_at = args.iter().position(|a| a == "--write-subs").unwrap();
        assert_eq!(args[subs_at + 1], "--write-auto-subs");
        assert_eq!(args[subs_at + 2], "--sub-langs");
        // BTreeSet keeps the language list deterministic
        assert_eq!(args[subs_at + 3], "de,en");
        assert_eq!(args[subs_at + 4], "--embed-subs");
    }

    #[test(tokio::test)]
    async fn test_caption_options_without_languages_add_no_flags() {
        let runner = Arc::new(ScriptedRunner::streaming(&[], &[], Some(0)));
        let (provisioner, _cache) = provisioned();
        let session = DownloadSession::new(provisioner, runner.clone());

        let mut req = request();
        req.captions = Some(CaptionOptions {
            languages: BTreeSet::new(),
            embed: true,
        });
        let mut active = session.start(req).await.unwrap();
        collect_events(&mut active.events).await;

        assert!(!runner.recorded_args().iter().any(|a| a == "--write-subs"));
    }

    #[test(tokio::test)]
    async fn test_empty_audio_selection_rejected() {
        let runner = Arc::new(ScriptedRunner::streaming(&[], &[], Some(0)));
        let (provisioner, _cache) = provisioned();
        let session = DownloadSession::new(provisioner, runner);

        let mut req = request();
        req.audio_format_ids.clear();
        let error = session.start(req).await.unwrap_err();
        assert!(matches!(error, DownloadError::EmptyAudioSelection));
    }

    #[test(tokio::test)]
    async fn test_cancellation_closes_stream_without_terminal_event() {
        let runner = Arc::new(ScriptedRunner::hanging());
        let (provisioner, _cache) = provisioned();
        let session = DownloadSession::new(provisioner, runner);

        let mut active = session.start(request()).await.unwrap();
        active.cancel.send(()).unwrap();
        active.done.await.unwrap();

        let events = collect_events(&mut active.events).await;
        assert!(events.is_empty());
    }
}
