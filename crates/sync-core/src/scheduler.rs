//! Debounced scheduling for sync cycles and reindex requests.
//!
//! `SyncScheduler` owns a background task. Triggers reset a quiet-period
//! timer; when it expires one cycle runs. At most one cycle is in flight, and
//! any number of triggers arriving during a cycle queue exactly one more.
//!
//! `ReindexScheduler` keeps an independent timer per file path. `Scheduler`
//! bundles both for one vault session.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::events::{EventBus, SyncEvent};

/// Something that can run one sync cycle. Errors are the runner's concern.
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    async fn run_cycle(&self);
}

enum Command {
    Trigger,
    Cancel,
    Shutdown,
}

pub struct SyncScheduler {
    tx: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start the scheduler task on the current runtime.
    pub fn spawn<C>(runner: Arc<C>, debounce: Duration) -> Self
    where
        C: CycleRunner + ?Sized,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_loop(runner, debounce, rx));
        Self { tx, handle }
    }

    /// Request a cycle after the quiet period.
    pub fn trigger(&self) {
        if self.tx.send(Command::Trigger).is_err() {
            debug!("Sync trigger after scheduler stopped");
        }
    }

    /// Drop a trigger whose quiet period has not yet expired.
    pub fn cancel_pending(&self) {
        let _ = self.tx.send(Command::Cancel);
    }

    /// Stop scheduling. A pending debounce is dropped; a running cycle finishes.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Err(e) = self.handle.await {
            warn!("Sync scheduler task ended abnormally: {}", e);
        }
    }
}

async fn run_loop<C>(runner: Arc<C>, debounce: Duration, mut rx: mpsc::UnboundedReceiver<Command>)
where
    C: CycleRunner + ?Sized,
{
    let mut pending = false;

    loop {
        if !pending {
            match rx.recv().await {
                Some(Command::Trigger) => {}
                Some(Command::Cancel) => continue,
                Some(Command::Shutdown) | None => return,
            }
        }
        pending = false;

        // Trailing edge: restart the window on every trigger.
        let mut cancelled = false;
        loop {
            match timeout(debounce, rx.recv()).await {
                Ok(Some(Command::Trigger)) => continue,
                Ok(Some(Command::Cancel)) => {
                    cancelled = true;
                    break;
                }
                Ok(Some(Command::Shutdown)) | Ok(None) => return,
                Err(_) => break,
            }
        }
        if cancelled {
            debug!("Pending sync cancelled");
            continue;
        }

        let mut stopping = false;
        let cycle = runner.run_cycle();
        tokio::pin!(cycle);
        loop {
            tokio::select! {
                _ = &mut cycle => break,
                cmd = rx.recv(), if !stopping => match cmd {
                    Some(Command::Trigger) => pending = true,
                    Some(Command::Cancel) => pending = false,
                    Some(Command::Shutdown) | None => stopping = true,
                },
            }
        }

        if stopping {
            return;
        }
        if pending {
            debug!("Changes arrived during sync; queueing another cycle");
        }
    }
}

/// Receives debounced reindex requests.
#[async_trait]
pub trait ReindexSink: Send + Sync + 'static {
    async fn reindex(&self, path: &str);
}

/// Whether a path is text the semantic index accepts.
pub fn is_indexable(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            matches!(ext.to_ascii_lowercase().as_str(), "md" | "markdown" | "txt")
        }
        _ => false,
    }
}

type Timers = Arc<Mutex<HashMap<String, (u64, JoinHandle<()>)>>>;

pub struct ReindexScheduler<S: ?Sized> {
    sink: Arc<S>,
    events: Arc<EventBus>,
    delay: Duration,
    max_bytes: u64,
    timers: Timers,
    generation: AtomicU64,
}

impl<S: ReindexSink + ?Sized> ReindexScheduler<S> {
    pub fn new(sink: Arc<S>, events: Arc<EventBus>, delay: Duration, max_bytes: u64) -> Self {
        Self {
            sink,
            events,
            delay,
            max_bytes,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Reset the timer for `path`. Returns false if the file is not eligible.
    pub fn schedule(&self, path: &str, size: u64) -> bool {
        if !is_indexable(path) {
            return false;
        }
        if size > self.max_bytes {
            warn!(
                "Skipping reindex of {}: {} bytes exceeds limit of {}",
                path, size, self.max_bytes
            );
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = timers.remove(path) {
            previous.abort();
        }

        let handle = tokio::spawn(fire(
            path.to_string(),
            generation,
            self.delay,
            Arc::clone(&self.sink),
            Arc::clone(&self.events),
            Arc::clone(&self.timers),
        ));
        timers.insert(path.to_string(), (generation, handle));
        true
    }

    /// Drop a pending request, e.g. because the file was deleted.
    pub fn cancel(&self, path: &str) -> bool {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        match timers.remove(path) {
            Some((_, handle)) => {
                handle.abort();
                debug!("Cancelled reindex of {}", path);
                true
            }
            None => false,
        }
    }
}

impl<S: ?Sized> ReindexScheduler<S> {
    pub fn pending(&self) -> usize {
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, (_, handle)) in timers.drain() {
            handle.abort();
        }
    }
}

impl<S: ?Sized> Drop for ReindexScheduler<S> {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Per-session scheduling: one sync debouncer and the reindex timers.
pub struct Scheduler<S: ?Sized> {
    sync: SyncScheduler,
    reindex: ReindexScheduler<S>,
}

impl<S: ReindexSink + ?Sized> Scheduler<S> {
    pub fn spawn<C>(runner: Arc<C>, sink: Arc<S>, events: Arc<EventBus>, config: &SyncConfig) -> Self
    where
        C: CycleRunner + ?Sized,
    {
        Self {
            sync: SyncScheduler::spawn(runner, config.sync_debounce),
            reindex: ReindexScheduler::new(
                sink,
                events,
                config.reindex_debounce,
                config.max_reindex_bytes,
            ),
        }
    }

    pub fn trigger_sync(&self) {
        self.sync.trigger();
    }

    pub fn cancel_pending(&self) {
        self.sync.cancel_pending();
    }

    pub fn schedule_reindex(&self, path: &str, size: u64) -> bool {
        self.reindex.schedule(path, size)
    }

    pub fn cancel_reindex(&self, path: &str) -> bool {
        self.reindex.cancel(path)
    }

    pub fn pending_reindex(&self) -> usize {
        self.reindex.pending()
    }

    /// Stop the sync task and drop every pending reindex timer.
    pub async fn shutdown(self) {
        self.reindex.cancel_all();
        self.sync.shutdown().await;
    }
}

async fn fire<S: ReindexSink + ?Sized>(
    path: String,
    generation: u64,
    delay: Duration,
    sink: Arc<S>,
    events: Arc<EventBus>,
    timers: Timers,
) {
    sleep(delay).await;

    {
        let mut timers = timers.lock().unwrap_or_else(|e| e.into_inner());
        // A newer request for the same path replaced this one.
        match timers.get(&path) {
            Some((current, _)) if *current == generation => {
                timers.remove(&path);
            }
            _ => return,
        }
    }

    info!("Reindexing {}", path);
    events.emit(SyncEvent::ReindexRequested {
        path: path.clone(),
        timestamp: Utc::now(),
    });
    sink.reindex(&path).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingRunner {
        cycles: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        work: Duration,
    }

    #[async_trait]
    impl CycleRunner for CountingRunner {
        async fn run_cycle(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            sleep(self.work).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.cycles.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReindexSink for RecordingSink {
        async fn reindex(&self, path: &str) {
            self.paths.lock().unwrap().push(path.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_cycle() {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = SyncScheduler::spawn(Arc::clone(&runner), Duration::from_millis(200));

        for _ in 0..10 {
            scheduler.trigger();
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(150)).await;
        assert_eq!(runner.cycles.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(runner.cycles.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_during_cycle_queue_one_more() {
        let runner = Arc::new(CountingRunner {
            work: Duration::from_millis(100),
            ..CountingRunner::default()
        });
        let scheduler = SyncScheduler::spawn(Arc::clone(&runner), Duration::from_millis(200));

        scheduler.trigger();
        // Cycle runs from 200ms to 300ms.
        sleep(Duration::from_millis(250)).await;
        assert_eq!(runner.in_flight.load(Ordering::SeqCst), 1);
        for _ in 0..3 {
            scheduler.trigger();
        }

        sleep(Duration::from_secs(2)).await;
        assert_eq!(runner.cycles.load(Ordering::SeqCst), 2);
        assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_debounce() {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = SyncScheduler::spawn(Arc::clone(&runner), Duration::from_millis(200));

        scheduler.trigger();
        scheduler.shutdown().await;
        sleep(Duration::from_secs(1)).await;
        assert_eq!(runner.cycles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_drops_debounced_trigger() {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = SyncScheduler::spawn(Arc::clone(&runner), Duration::from_millis(200));

        scheduler.trigger();
        sleep(Duration::from_millis(100)).await;
        scheduler.cancel_pending();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(runner.cycles.load(Ordering::SeqCst), 0);

        scheduler.trigger();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(runner.cycles.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_scheduler_shutdown_clears_reindex() {
        let runner = Arc::new(CountingRunner::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::spawn(
            Arc::clone(&runner),
            Arc::clone(&sink),
            Arc::new(EventBus::new()),
            &SyncConfig::default(),
        );

        scheduler.trigger_sync();
        assert!(scheduler.schedule_reindex("a.md", 10));
        sleep(Duration::from_millis(500)).await;
        assert_eq!(runner.cycles.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_reindex(), 1);

        scheduler.shutdown().await;
        sleep(Duration::from_secs(5)).await;
        assert!(sink.paths.lock().unwrap().is_empty());
    }

    #[test]
    fn test_indexable_extensions() {
        assert!(is_indexable("notes/a.md"));
        assert!(is_indexable("b.Markdown"));
        assert!(is_indexable("c.TXT"));
        assert!(!is_indexable("img.png"));
        assert!(!is_indexable("notes/.md"));
        assert!(!is_indexable("Makefile"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reindex_debounced_per_path() {
        let sink = Arc::new(RecordingSink::default());
        let events = Arc::new(EventBus::new());
        let requested = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requested);
        let _sub = events.subscribe(move |event| {
            if matches!(event, SyncEvent::ReindexRequested { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let reindex = ReindexScheduler::new(Arc::clone(&sink), events, Duration::from_secs(2), 1024);

        for _ in 0..5 {
            assert!(reindex.schedule("a.md", 10));
            sleep(Duration::from_millis(500)).await;
        }
        assert!(reindex.schedule("b.md", 10));
        assert!(sink.paths.lock().unwrap().is_empty());

        sleep(Duration::from_secs(3)).await;
        let mut paths = sink.paths.lock().unwrap().clone();
        paths.sort();
        assert_eq!(paths, vec!["a.md".to_string(), "b.md".to_string()]);
        assert_eq!(requested.load(Ordering::SeqCst), 2);
        assert_eq!(reindex.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reindex_cancel_and_filters() {
        let sink = Arc::new(RecordingSink::default());
        let reindex = ReindexScheduler::new(
            Arc::clone(&sink),
            Arc::new(EventBus::new()),
            Duration::from_secs(2),
            1024,
        );

        assert!(!reindex.schedule("photo.jpg", 10));
        assert!(!reindex.schedule("huge.md", 4096));
        assert!(reindex.schedule("gone.md", 10));
        assert!(reindex.cancel("gone.md"));
        assert!(!reindex.cancel("gone.md"));

        sleep(Duration::from_secs(5)).await;
        assert!(sink.paths.lock().unwrap().is_empty());
    }
}
