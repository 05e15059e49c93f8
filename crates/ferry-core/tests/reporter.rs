mod common;

use common::*;
use ferry_core::{
    DownloadRequest, JobNotification, JobState, MemoryNotifier, NotificationPort, NotificationStatus, NotifyError,
    StatusReporter,
};
use parking_lot::Mutex;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Holds the first notification until the test lets it go
struct GatedNotifier {
    inner: MemoryNotifier,
    entered: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<Option<std_mpsc::Receiver<()>>>,
}

impl NotificationPort for GatedNotifier {
    fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        self.inner.notify(notification)?;
        let gate = (self.entered.lock().take(), self.release.lock().take());
        if let (Some(entered), Some(release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        Ok(())
    }
}

#[tokio::test]
async fn stopped_state_is_notified_once() {
    let f = fixture();
    f.primary.respond(200, &[("content-length", "10")], vec![Ok(pattern(0..10))]);
    let notifier = Arc::new(MemoryNotifier::new());
    let reporter = StatusReporter::new(f.registry.clone(), notifier.clone(), &config());

    let id = f
        .registry
        .start(DownloadRequest::new("http://example.com/a.bin", f.dir.path()))
        .await
        .unwrap();
    wait_for_state(&f.registry, id, JobState::Completed).await;

    reporter.tick();
    reporter.tick();
    reporter.tick();

    let seen = notifier.notifications();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, NotificationStatus::Completed { size: 10 });
    assert_eq!(seen[0].file_name, "a.bin");
    assert!(f.registry.get(id).unwrap().notified_stopped);
}

#[tokio::test]
async fn downloading_jobs_report_progress_then_stop() {
    let f = fixture();
    let feed = f.primary.respond_streaming(200, &[("content-length", "1000")]);
    let notifier = Arc::new(MemoryNotifier::new());
    let reporter = StatusReporter::new(f.registry.clone(), notifier.clone(), &config());

    let id = f
        .registry
        .start(DownloadRequest::new("http://example.com/a.bin", f.dir.path()))
        .await
        .unwrap();
    feed.send(Ok(pattern(0..250))).await.unwrap();
    wait_for_bytes(&f.registry, id, 250).await;

    reporter.tick();
    let job = f.registry.pause(id).await.unwrap();
    reporter.tick();

    let statuses: Vec<NotificationStatus> = notifier.notifications().into_iter().map(|n| n.status).collect();
    assert_eq!(statuses.len(), 2, "{:?}", statuses);
    assert!(matches!(
        statuses[0],
        NotificationStatus::Progress { bytes_copied: 250, content_length: Some(1000), .. }
    ));
    assert_eq!(statuses[1], NotificationStatus::Paused { bytes_copied: job.bytes_copied });

    // Resuming clears the notified flag so the next stop is reported again
    f.primary.respond(206, &[("content-range", "bytes 250-999/1000")], vec![Ok(pattern(250..1000))]);
    f.registry.resume(id).await.unwrap();
    wait_for_state(&f.registry, id, JobState::Completed).await;
    reporter.tick();

    let last = notifier.notifications().pop().unwrap();
    assert_eq!(last.status, NotificationStatus::Completed { size: 1000 });
}

#[tokio::test]
async fn removed_jobs_stop_being_reported() {
    let f = fixture();
    f.primary.respond(500, &[], vec![]);
    let notifier = Arc::new(MemoryNotifier::new());
    let reporter = StatusReporter::new(f.registry.clone(), notifier.clone(), &config());

    let id = f
        .registry
        .start(DownloadRequest::new("http://example.com/a.bin", f.dir.path()))
        .await
        .unwrap();
    wait_for_state(&f.registry, id, JobState::Failed).await;
    f.registry.remove(id).await.unwrap();

    reporter.tick();
    assert!(notifier.notifications().is_empty());
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let f = fixture();
    f.primary.respond(200, &[("content-length", "10")], vec![Ok(pattern(0..10))]);
    let notifier = Arc::new(MemoryNotifier::new());
    let shutdown = CancellationToken::new();
    let handle = StatusReporter::new(f.registry.clone(), notifier.clone(), &config()).spawn(shutdown.clone());

    let id = f
        .registry
        .start(DownloadRequest::new("http://example.com/a.bin", f.dir.path()))
        .await
        .unwrap();
    wait_for_state(&f.registry, id, JobState::Completed).await;

    shutdown.cancel();
    handle.await.unwrap();

    let completed = notifier
        .notifications()
        .into_iter()
        .filter(|n| matches!(n.status, NotificationStatus::Completed { .. }))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_during_stopped_notification_keeps_next_stop_reported() {
    let f = fixture();
    let feed = f.primary.respond_streaming(200, &[("content-length", "1000")]);
    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let notifier = Arc::new(GatedNotifier {
        inner: MemoryNotifier::new(),
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(Some(release_rx)),
    });
    let reporter = Arc::new(StatusReporter::new(f.registry.clone(), notifier.clone(), &config()));

    let id = f
        .registry
        .start(DownloadRequest::new("http://example.com/a.bin", f.dir.path()))
        .await
        .unwrap();
    feed.send(Ok(pattern(0..100))).await.unwrap();
    wait_for_bytes(&f.registry, id, 100).await;
    f.registry.pause(id).await.unwrap();

    // The paused status is being delivered while the job resumes
    let ticking = {
        let reporter = Arc::clone(&reporter);
        tokio::task::spawn_blocking(move || reporter.tick())
    };
    entered_rx.await.unwrap();
    let resumed_feed = f.primary.respond_streaming(206, &[("content-range", "bytes 100-999/1000")]);
    f.registry.resume(id).await.unwrap();
    release_tx.send(()).unwrap();
    ticking.await.unwrap();

    let job = f.registry.get(id).unwrap();
    assert_eq!(job.state, JobState::Downloading);
    assert!(!job.notified_stopped);

    resumed_feed.send(Ok(pattern(100..200))).await.unwrap();
    wait_for_bytes(&f.registry, id, 200).await;
    f.registry.pause(id).await.unwrap();
    reporter.tick();
    reporter.tick();

    let paused: Vec<NotificationStatus> = notifier
        .inner
        .notifications()
        .into_iter()
        .map(|n| n.status)
        .filter(|status| matches!(status, NotificationStatus::Paused { .. }))
        .collect();
    assert_eq!(
        paused,
        vec![
            NotificationStatus::Paused { bytes_copied: 100 },
            NotificationStatus::Paused { bytes_copied: 200 },
        ]
    );
}
