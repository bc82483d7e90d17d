//! Engine worker pool.
//!
//! Owns N long-lived UCI engine processes and dispatches submitted tasks
//! to them over one shared FIFO queue. Each worker drives exactly one
//! engine; a task gets exclusive use of that engine for its duration.
//! Hung engines are killed and respawned, dead engines are replaced on the
//! next dispatch, and shutdown is sentinel-based so every worker observes
//! a stop signal exactly once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{default_concurrency, PoolSettings};
use crate::error::{Error, Result};

use super::process::EngineProcess;

#[derive(Debug, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    TimedOut,
}

type QueuedTask = Box<
    dyn for<'a> FnOnce(
            std::result::Result<&'a mut EngineProcess, Error>,
            Option<Duration>,
        ) -> BoxFuture<'a, TaskOutcome>
        + Send,
>;

enum QueueItem {
    Task(QueuedTask),
    Sentinel,
}

/// Counter of enqueued-but-unfinished items, with a wakeup for `drain`.
struct PendingWork {
    count: AtomicUsize,
    drained: Notify,
}

impl PendingWork {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn add_one(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn task_done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Handle to an in-flight pool task. Resolved exactly once.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task's result.
    ///
    /// Yields `Error::TaskAbandoned` if the pool dropped the task without
    /// resolving it (e.g. a worker cancelled mid-shutdown).
    pub async fn join(self) -> Result<T> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::TaskAbandoned))
    }
}

/// Identity helper that pins down the higher-ranked closure type expected
/// by [`EnginePool::submit`].
pub fn engine_task<T, F>(task: F) -> F
where
    T: Send + 'static,
    F: for<'a> FnOnce(&'a mut EngineProcess) -> BoxFuture<'a, Result<T>> + Send + 'static,
{
    task
}

/// Pool of N engine processes with a shared FIFO work queue.
pub struct EnginePool {
    engine_path: PathBuf,
    settings: PoolSettings,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<QueueItem>>>,
    workers: Vec<JoinHandle<()>>,
    shutting_down: Arc<AtomicBool>,
    alive_engines: Arc<AtomicUsize>,
    pending: Arc<PendingWork>,
}

impl EnginePool {
    pub fn new(engine_path: impl Into<PathBuf>, settings: PoolSettings) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            engine_path: engine_path.into(),
            settings,
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            workers: Vec::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            alive_engines: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new(PendingWork::new()),
        }
    }

    /// Number of live engine processes.
    pub fn alive_engines(&self) -> usize {
        self.alive_engines.load(Ordering::SeqCst)
    }

    /// Spawn all engines and launch one worker driver per engine.
    ///
    /// Fails fast if any engine cannot be spawned; engines already started
    /// are quit again.
    pub async fn start(&mut self) -> Result<()> {
        let mut engines = Vec::with_capacity(self.settings.size);
        for _ in 0..self.settings.size {
            match Self::spawn_engine(&self.engine_path, &self.settings, &self.alive_engines).await
            {
                Ok(engine) => engines.push(engine),
                Err(e) => {
                    for mut engine in engines {
                        let _ = engine.quit().await;
                        self.alive_engines.fetch_sub(1, Ordering::SeqCst);
                    }
                    return Err(e);
                }
            }
        }

        for engine in engines {
            let queue_rx = Arc::clone(&self.queue_rx);
            let shutting_down = Arc::clone(&self.shutting_down);
            let alive = Arc::clone(&self.alive_engines);
            let pending = Arc::clone(&self.pending);
            let path = self.engine_path.clone();
            let settings = self.settings.clone();
            self.workers.push(tokio::spawn(Self::worker(
                engine,
                queue_rx,
                shutting_down,
                alive,
                pending,
                path,
                settings,
            )));
        }

        info!("engine pool started with {} workers", self.settings.size);
        Ok(())
    }

    /// Enqueue a task. Non-blocking; the queue is unbounded.
    ///
    /// The task runs on exactly one engine, with exclusive access for its
    /// duration, wrapped in the pool's per-task timeout if one is set.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut EngineProcess) -> BoxFuture<'a, Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued: QueuedTask = Box::new(move |engine, task_timeout| {
            Box::pin(async move {
                let engine = match engine {
                    Ok(engine) => engine,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return TaskOutcome::Completed;
                    }
                };
                match task_timeout {
                    Some(budget) => match timeout(budget, task(engine)).await {
                        Ok(result) => {
                            let _ = tx.send(result);
                            TaskOutcome::Completed
                        }
                        Err(_) => {
                            let _ = tx.send(Err(Error::TaskTimeout(budget)));
                            TaskOutcome::TimedOut
                        }
                    },
                    None => {
                        let _ = tx.send(task(engine).await);
                        TaskOutcome::Completed
                    }
                }
            })
        });

        self.pending.add_one();
        if self.queue_tx.send(QueueItem::Task(queued)).is_err() {
            // Receiver only disappears once the pool itself is gone; the
            // caller's handle will then report the task as abandoned.
            self.pending.task_done();
        }
        TaskHandle { rx }
    }

    /// Wait until the queue is empty and all in-flight tasks are done.
    pub async fn drain(&self) {
        loop {
            let notified = self.pending.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting respawns, send one sentinel per worker, join them
    /// all. Each worker quits its own engine on the way out.
    pub async fn shutdown(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        for _ in 0..self.workers.len() {
            self.pending.add_one();
            if self.queue_tx.send(QueueItem::Sentinel).is_err() {
                self.pending.task_done();
            }
        }

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!("engine worker ended abnormally: {}", e);
            }
        }
        info!("engine pool shut down");
    }

    async fn spawn_engine(
        path: &Path,
        settings: &PoolSettings,
        alive: &AtomicUsize,
    ) -> Result<EngineProcess> {
        let mut engine = EngineProcess::new(path).await?;
        engine
            .configure(&[
                ("Threads", settings.threads_per_engine.to_string()),
                ("Hash", settings.hash_mb.to_string()),
            ])
            .await?;
        alive.fetch_add(1, Ordering::SeqCst);
        Ok(engine)
    }

    async fn worker(
        engine: EngineProcess,
        queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<QueueItem>>>,
        shutting_down: Arc<AtomicBool>,
        alive: Arc<AtomicUsize>,
        pending: Arc<PendingWork>,
        path: PathBuf,
        settings: PoolSettings,
    ) {
        let mut engine = Some(engine);

        loop {
            // Only one worker holds the receiver at a time, so dequeue
            // order stays FIFO across the pool.
            let item = {
                let mut rx = queue_rx.lock().await;
                rx.recv().await
            };
            let Some(item) = item else { break };

            let task = match item {
                QueueItem::Sentinel => {
                    pending.task_done();
                    break;
                }
                QueueItem::Task(task) => task,
            };

            // Replace a dead engine before dispatch, unless shutting down.
            if engine.as_mut().map_or(false, |e| !e.is_alive()) {
                warn!("dead engine detected, spawning replacement");
                alive.fetch_sub(1, Ordering::SeqCst);
                engine = None;
            }
            if engine.is_none() && !shutting_down.load(Ordering::SeqCst) {
                match Self::spawn_engine(&path, &settings, &alive).await {
                    Ok(fresh) => engine = Some(fresh),
                    Err(e) => error!("failed to spawn replacement engine: {}", e),
                }
            }

            let outcome = match engine.as_mut() {
                Some(engine) => task(Ok(engine), settings.task_timeout).await,
                None => {
                    let err = if shutting_down.load(Ordering::SeqCst) {
                        Error::PoolShutdown
                    } else {
                        Error::EngineTerminated
                    };
                    task(Err(err), settings.task_timeout).await
                }
            };

            if outcome == TaskOutcome::TimedOut {
                error!(
                    "engine task timed out after {:?}, killing engine",
                    settings.task_timeout
                );
                if let Some(mut hung) = engine.take() {
                    let _ = hung.kill().await;
                    alive.fetch_sub(1, Ordering::SeqCst);
                }
                if !shutting_down.load(Ordering::SeqCst) {
                    match Self::spawn_engine(&path, &settings, &alive).await {
                        Ok(fresh) => engine = Some(fresh),
                        Err(e) => error!("failed to respawn engine after timeout: {}", e),
                    }
                }
            }

            pending.task_done();
        }

        if let Some(mut engine) = engine.take() {
            if engine.is_alive() {
                let _ = engine.quit().await;
            }
            alive.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Engine pool sized for bulk analysis: bounded by the configured default
/// concurrency and the machine's CPU count.
pub struct WorkCoordinator {
    pool: EnginePool,
}

impl WorkCoordinator {
    pub fn new(engine_path: impl Into<PathBuf>, pool_size: Option<usize>) -> Self {
        let size = pool_size.unwrap_or_else(default_concurrency);
        Self {
            pool: EnginePool::new(engine_path, PoolSettings::new(size)),
        }
    }

    pub fn with_settings(engine_path: impl Into<PathBuf>, settings: PoolSettings) -> Self {
        Self {
            pool: EnginePool::new(engine_path, settings),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.pool.start().await?;
        info!("work coordinator started");
        Ok(())
    }

    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut EngineProcess) -> BoxFuture<'a, Result<T>> + Send + 'static,
    {
        self.pool.submit(task)
    }

    pub async fn drain(&self) {
        self.pool.drain().await;
    }

    pub async fn shutdown(&mut self) {
        self.pool.shutdown().await;
        info!("work coordinator shut down");
    }

    pub fn alive_engines(&self) -> usize {
        self.pool.alive_engines()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use shakmaty::{Chess, Color};

    use crate::config::SearchLimit;
    use crate::testing::fake_engine::{fake_engine, HUNG_GO, RESPONSIVE_GO};

    fn quick_settings(size: usize) -> PoolSettings {
        PoolSettings::new(size).task_timeout(Some(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn start_spawns_and_shutdown_reaps_engines() {
        let (_dir, path) = fake_engine(RESPONSIVE_GO);
        let mut pool = EnginePool::new(&path, quick_settings(2));
        pool.start().await.unwrap();
        assert_eq!(pool.alive_engines(), 2);

        pool.shutdown().await;
        assert_eq!(pool.alive_engines(), 0);
    }

    #[tokio::test]
    async fn submitted_task_returns_engine_result() {
        let (_dir, path) = fake_engine(RESPONSIVE_GO);
        let mut pool = EnginePool::new(&path, quick_settings(1));
        pool.start().await.unwrap();

        let handle = pool.submit(engine_task(|engine: &mut EngineProcess| {
            Box::pin(async move { engine.analyse(&Chess::default(), SearchLimit::Depth(5)).await })
        }));
        let eval = handle.join().await.unwrap();
        assert_eq!(eval.eval.cp(Color::White), 23);
        assert_eq!(eval.pv, vec!["e2e4".to_string(), "e7e5".to_string()]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn task_error_propagates_to_handle() {
        let (_dir, path) = fake_engine(RESPONSIVE_GO);
        let mut pool = EnginePool::new(&path, quick_settings(1));
        pool.start().await.unwrap();

        let handle = pool.submit(engine_task(|_engine: &mut EngineProcess| {
            Box::pin(async move { Err::<(), _>(Error::InvalidPgn("boom".to_string())) })
        }));
        assert!(matches!(handle.join().await, Err(Error::InvalidPgn(_))));

        pool.drain().await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn drain_waits_for_all_tasks() {
        let (_dir, path) = fake_engine(RESPONSIVE_GO);
        let mut pool = EnginePool::new(&path, quick_settings(2));
        pool.start().await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let _handle = pool.submit(engine_task(move |_engine: &mut EngineProcess| {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }));
        }
        pool.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_kills_engine_and_resolves_future() {
        let (_dir, path) = fake_engine(HUNG_GO);
        let settings = PoolSettings::new(1).task_timeout(Some(Duration::from_millis(100)));
        let mut pool = EnginePool::new(&path, settings);
        pool.start().await.unwrap();

        let handle = pool.submit(engine_task(|engine: &mut EngineProcess| {
            Box::pin(async move { engine.analyse(&Chess::default(), SearchLimit::Depth(5)).await })
        }));
        assert!(matches!(handle.join().await, Err(Error::TaskTimeout(_))));

        // A replacement engine took the dead one's place and the worker
        // keeps serving tasks.
        let handle = pool.submit(engine_task(|_engine: &mut EngineProcess| {
            Box::pin(async move { Ok(42) })
        }));
        assert_eq!(handle.join().await.unwrap(), 42);
        assert_eq!(pool.alive_engines(), 1);

        pool.shutdown().await;
        assert_eq!(pool.alive_engines(), 0);
    }

    #[tokio::test]
    async fn dead_engine_is_replaced_on_next_dispatch() {
        let (_dir, path) = fake_engine(RESPONSIVE_GO);
        let mut pool = EnginePool::new(&path, quick_settings(1));
        pool.start().await.unwrap();

        // First task kills its engine from the inside.
        let handle = pool.submit(engine_task(|engine: &mut EngineProcess| {
            Box::pin(async move {
                engine.kill().await?;
                Ok(())
            })
        }));
        handle.join().await.unwrap();

        // Second task must run on a freshly spawned engine.
        let handle = pool.submit(engine_task(|engine: &mut EngineProcess| {
            Box::pin(async move { engine.analyse(&Chess::default(), SearchLimit::Depth(5)).await })
        }));
        let eval = handle.join().await.unwrap();
        assert_eq!(eval.eval.cp(Color::White), 23);
        assert_eq!(pool.alive_engines(), 1);

        pool.shutdown().await;
        assert_eq!(pool.alive_engines(), 0);
    }

    #[tokio::test]
    async fn coordinator_round_trip() {
        let (_dir, path) = fake_engine(RESPONSIVE_GO);
        let mut coordinator = WorkCoordinator::with_settings(&path, quick_settings(2));
        coordinator.start().await.unwrap();
        assert_eq!(coordinator.alive_engines(), 2);

        let handle = coordinator.submit(engine_task(|_engine: &mut EngineProcess| {
            Box::pin(async move { Ok("done") })
        }));
        assert_eq!(handle.join().await.unwrap(), "done");

        coordinator.drain().await;
        coordinator.shutdown().await;
        assert_eq!(coordinator.alive_engines(), 0);
    }
}
