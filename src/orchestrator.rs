// Facade tying provisioning, the catalog and sessions together.
//
// This is the only entry point a UI shell needs: list formats, start a
// download, cancel one. It owns no logic of its own beyond guaranteeing a
// single active session per destination path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::catalog::FormatCatalog;
use crate::errors::{DownloadError, ExtractionError};
use crate::models::{DownloadEvent, DownloadRequest, FormatCatalogResult};
use crate::provision::BinaryProvisioner;
use crate::runner::{ProcessRunner, TokioProcessRunner};
use crate::session::DownloadSession;

/// A registry slot: the cancel handle of the session holding a destination,
/// tagged with a generation so a stale cleanup cannot evict a successor
/// session that reused the same path.
struct ActiveSlot {
    generation: u64,
    cancel: oneshot::Sender<()>,
}

pub struct Orchestrator {
    catalog: FormatCatalog,
    session: DownloadSession,
    active: Arc<Mutex<HashMap<PathBuf, ActiveSlot>>>,
    generations: AtomicU64,
}

impl Orchestrator {
    pub fn new(provisioner: Arc<BinaryProvisioner>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            catalog: FormatCatalog::new(provisioner.clone(), runner.clone()),
            session: DownloadSession::new(provisioner, runner),
            active: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// Orchestrator wired to the real network and real subprocesses.
    pub fn with_defaults() -> Self {
        Self::new(
            Arc::new(BinaryProvisioner::with_http()),
            Arc::new(TokioProcessRunner),
        )
    }

    /// Usable video/audio candidates for a URL.
    pub async fn fetch_formats(&self, url: &str) -> Result<FormatCatalogResult, ExtractionError> {
        self.catalog.list_formats(url).await
    }

    /// Start a download and hand back its event stream.
    ///
    /// A second request for a destination that already has a running
    /// session is a caller error, reported as `DestinationBusy` rather
    /// than silently ignored.
    pub async fn download(
        &self,
        request: DownloadRequest,
    ) -> Result<mpsc::UnboundedReceiver<DownloadEvent>, DownloadError> {
        let destination = request.destination.clone();

        // Reserve the slot first, then start the session with the lock
        // released: first-time provisioning can take a while and must not
        // stall cancels or downloads to other destinations.
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (reserved_tx, mut reserved_rx) = oneshot::channel();
        {
            let mut active = self.active.lock().await;
            if active.contains_key(&destination) {
                return Err(DownloadError::DestinationBusy(destination));
            }
            active.insert(
                destination.clone(),
                ActiveSlot {
                    generation,
                    cancel: reserved_tx,
                },
            );
        }

        let started = match self.session.start(request).await {
            Ok(started) => started,
            Err(error) => {
                self.active.lock().await.remove(&destination);
                return Err(error);
            }
        };

        // A cancel that raced the startup fired the reservation handle and
        // removed the slot; honor it by killing the just-spawned process.
        {
            let mut active = self.active.lock().await;
            if reserved_rx.try_recv().is_err() && active.contains_key(&destination) {
                active.insert(
                    destination.clone(),
                    ActiveSlot {
                        generation,
                        cancel: started.cancel,
                    },
                );
            } else {
                drop(active);
                let _ = started.cancel.send(());
            }
        }

        // Free the destination once the session winds down, however it
        // ends. The generation check keeps a stale cleanup from evicting a
        // successor session that reused the destination in the meantime.
        let registry = self.active.clone();
        let done = started.done;
        tokio::spawn(async move {
            let _ = done.await;
            let mut active = registry.lock().await;
            if active
                .get(&destination)
                .map(|slot| slot.generation == generation)
                .unwrap_or(false)
            {
                active.remove(&destination);
                debug!(destination = %destination.display(), "download slot released");
            }
        });

        Ok(started.events)
    }

    /// Cancel the active download for a destination, if any. Kills the
    /// external process and closes its event stream; returns whether a
    /// session was actually cancelled.
    pub async fn cancel(&self, destination: &Path) -> bool {
        let slot = self.active.lock().await.remove(destination);
        match slot {
            Some(slot) => slot.cancel.send(()).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mock::ScriptedRunner;
    use std::path::PathBuf;
    use test_log::test;

    fn orchestrator_with(runner: Arc<ScriptedRunner>) -> (Orchestrator, tempfile::TempDir) {
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join("yt-dlp"), b"stub").unwrap();
        std::fs::write(cache.path().join("ffmpeg"), b"stub").unwrap();
        let provisioner = BinaryProvisioner::with_http()
            .with_cache_dir(cache.path().to_path_buf())
            .with_platform("linux", "x86_64");
        (Orchestrator::new(Arc::new(provisioner), runner), cache)
    }

    fn request(destination: &str) -> DownloadRequest {
        DownloadRequest {
            source_url: "https://example.com/watch?v=abc".to_string(),
            destination: PathBuf::from(destination),
            video_format_id: "137".to_string(),
            audio_format_ids: vec!["140".to_string()],
            captions: None,
        }
    }

    #[test(tokio::test)]
    async fn test_second_download_to_same_destination_is_rejected() {
        let runner = Arc::new(ScriptedRunner::hanging());
        let (orchestrator, _cache) = orchestrator_with(runner);

        let _events = orchestrator.download(request("/tmp/video.mp4")).await.unwrap();
        let error = orchestrator
            .download(request("/tmp/video.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(error, DownloadError::DestinationBusy(_)));

        // A different destination is fine
        orchestrator.download(request("/tmp/other.mp4")).await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_cancel_frees_the_destination() {
        let runner = Arc::new(ScriptedRunner::hanging());
        let (orchestrator, _cache) = orchestrator_with(runner);

        let mut events = orchestrator.download(request("/tmp/video.mp4")).await.unwrap();
        assert!(orchestrator.cancel(Path::new("/tmp/video.mp4")).await);

        // Stream closes without a terminal event
        assert_eq!(events.recv().await, None);

        // Destination can be reused right away
        orchestrator.download(request("/tmp/video.mp4")).await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_stale_cleanup_does_not_evict_a_successor_session() {
        let runner = Arc::new(ScriptedRunner::hanging());
        let (orchestrator, _cache) = orchestrator_with(runner);

        let mut events = orchestrator.download(request("/tmp/video.mp4")).await.unwrap();
        assert!(orchestrator.cancel(Path::new("/tmp/video.mp4")).await);
        assert_eq!(events.recv().await, None);

        // Reuse the destination right away; the first session's deferred
        // slot release runs afterwards and must not free the new slot
        let _events = orchestrator.download(request("/tmp/video.mp4")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let error = orchestrator
            .download(request("/tmp/video.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(error, DownloadError::DestinationBusy(_)));
    }

    #[test(tokio::test)]
    async fn test_cancel_without_active_session_reports_false() {
        let runner = Arc::new(ScriptedRunner::hanging());
        let (orchestrator, _cache) = orchestrator_with(runner);
        assert!(!orchestrator.cancel(Path::new("/tmp/nothing.mp4")).await);
    }

    #[test(tokio::test)]
    async fn test_failed_start_releases_the_reservation() {
        let runner = Arc::new(ScriptedRunner::hanging());
        let (orchestrator, _cache) = orchestrator_with(runner);

        let mut bad = request("/tmp/video.mp4");
        bad.audio_format_ids.clear();
        assert!(orchestrator.download(bad).await.is_err());

        // The destination is free again for a valid request
        orchestrator.download(request("/tmp/video.mp4")).await.unwrap();
    }

    /// Fetcher slow enough that a cancel can arrive while the session is
    /// still provisioning.
    struct SlowFetcher;

    #[async_trait::async_trait]
    impl crate::provision::BinaryFetcher for SlowFetcher {
        async fn fetch(
            &self,
            _tool: &'static str,
            _url: &str,
        ) -> Result<crate::provision::FetchedPayload, crate::errors::ProvisionError> {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Ok(crate::provision::FetchedPayload {
                content_type: Some("application/octet-stream".to_string()),
                body: vec![0u8; 1_000_000],
            })
        }
    }

    #[test(tokio::test)]
    async fn test_cancel_during_startup_kills_the_session() {
        let cache = tempfile::tempdir().unwrap();
        let provisioner = BinaryProvisioner::new(Arc::new(SlowFetcher))
            .with_cache_dir(cache.path().to_path_buf())
            .with_platform("linux", "x86_64");
        let runner = Arc::new(ScriptedRunner::hanging());
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(provisioner), runner));

        let starting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.download(request("/tmp/video.mp4")).await })
        };

        // The reservation is registered before provisioning finishes, so
        // the cancel lands while the session is still starting
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(orchestrator.cancel(Path::new("/tmp/video.mp4")).await);

        let mut events = starting.await.unwrap().unwrap();
        // The just-spawned process was killed; the stream closes silently
        assert_eq!(events.recv().await, None);
    }

    #[test(tokio::test)]
    async fn test_completed_download_frees_the_destination() {
        let runner = Arc::new(ScriptedRunner::streaming(&[], &[], Some(0)));
        let (orchestrator, _cache) = orchestrator_with(runner);

        let mut events = orchestrator.download(request("/tmp/video.mp4")).await.unwrap();
        // Drain to the terminal event; the cleanup task then runs
        while events.recv().await.is_some() {}

        // Slot release is asynchronous; poll briefly
        for _ in 0..50 {
            if orchestrator.download(request("/tmp/video.mp4")).await.is_ok() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("destination was never released after completion");
    }
}
