//! Single-slot background execution.
//!
//! An [`ExecutionSlot`] runs one request at a time on a dedicated worker
//! thread so the caller's poll loop never blocks on the network. The caller
//! launches work, keeps polling, and receives the completion callback on its
//! own thread from inside [`poll`](ExecutionSlot::poll), exactly once.
//!
//! ```text
//! Idle ──launch──▶ Running ──┬──▶ Completed
//!                            ├──▶ Cancelled
//!                            └──▶ Error
//! ```
//!
//! Cancellation is cooperative: [`cancel`](ExecutionSlot::cancel) sets a
//! [`CancelFlag`] that the running work checks at its own pace (once per
//! transport chunk, after each backoff sleep). Work that finishes before it
//! notices the flag is recorded as `Cancelled` when the flag was set by then,
//! and as `Completed` otherwise. Callers must accept either outcome after a
//! cancel request.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::config::SlotConfig;
use crate::{ErrorKind, ExecutionResult};

/// Fragment callback handed to streaming work.
pub type StreamCallback = Box<dyn FnMut(&str, bool) + Send>;

type CompletionCallback = Box<dyn FnOnce(&ExecutionResult) + Send>;

// ── Cancellation ───────────────────────────────────────────────────

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ── Run state ──────────────────────────────────────────────────────

/// Lifecycle of the slot's current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl AsyncStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AsyncStatus::Completed | AsyncStatus::Cancelled | AsyncStatus::Error
        )
    }
}

impl std::fmt::Display for AsyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsyncStatus::Idle => write!(f, "idle"),
            AsyncStatus::Running => write!(f, "running"),
            AsyncStatus::Completed => write!(f, "completed"),
            AsyncStatus::Cancelled => write!(f, "cancelled"),
            AsyncStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Default)]
struct AsyncRun {
    status: AsyncStatus,
    result: ExecutionResult,
    callback_invoked: bool,
    on_complete: Option<CompletionCallback>,
}

#[derive(Debug, Clone, Copy)]
enum RunKind {
    Request,
    Stream,
}

impl RunKind {
    fn cancelled(self) -> ExecutionResult {
        match self {
            RunKind::Request => ExecutionResult::fail(ErrorKind::NetworkError, "Request cancelled"),
            RunKind::Stream => ExecutionResult::fail(ErrorKind::NetworkError, "Stream cancelled"),
        }
    }

    fn failure_kind(self) -> ErrorKind {
        match self {
            RunKind::Request => ErrorKind::NetworkError,
            RunKind::Stream => ErrorKind::StreamingError,
        }
    }
}

fn lock(run: &Mutex<AsyncRun>) -> MutexGuard<'_, AsyncRun> {
    run.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Slot ───────────────────────────────────────────────────────────

/// Runs at most one request at a time on a background worker.
pub struct ExecutionSlot {
    run: Arc<Mutex<AsyncRun>>,
    cancel: CancelFlag,
    worker: Option<JoinHandle<()>>,
    config: SlotConfig,
}

impl Default for ExecutionSlot {
    fn default() -> Self {
        Self::new(SlotConfig::default())
    }
}

impl std::fmt::Debug for ExecutionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSlot")
            .field("status", &self.status())
            .field("cancel_requested", &self.cancel.is_cancelled())
            .field("config", &self.config)
            .finish()
    }
}

impl ExecutionSlot {
    pub fn new(config: SlotConfig) -> Self {
        Self {
            run: Arc::new(Mutex::new(AsyncRun::default())),
            cancel: CancelFlag::new(),
            worker: None,
            config,
        }
    }

    /// Start `work` on the background worker.
    ///
    /// Returns `false` without touching the in-flight run if the slot is
    /// busy. Also returns `false` if the worker could not be created; the run
    /// is then in `Error` with [`ErrorKind::OutOfMemory`] and `on_complete`
    /// still fires from the next [`poll`](Self::poll).
    pub fn launch<W, Fut>(
        &mut self,
        work: W,
        on_complete: impl FnOnce(&ExecutionResult) + Send + 'static,
    ) -> bool
    where
        W: FnOnce(CancelFlag) -> Fut + Send + 'static,
        Fut: Future<Output = ExecutionResult>,
    {
        self.start(work, Box::new(on_complete), RunKind::Request)
    }

    /// Start streaming work. `stream_work` receives a fragment callback that
    /// forwards to `on_fragment` until cancellation is requested, and drops
    /// fragments from then on.
    pub fn launch_stream<W, Fut>(
        &mut self,
        stream_work: W,
        mut on_fragment: impl FnMut(&str, bool) + Send + 'static,
        on_done: impl FnOnce(&ExecutionResult) + Send + 'static,
    ) -> bool
    where
        W: FnOnce(StreamCallback, CancelFlag) -> Fut + Send + 'static,
        Fut: Future<Output = ExecutionResult>,
    {
        let work = move |cancel: CancelFlag| {
            let gate = cancel.clone();
            let forward: StreamCallback = Box::new(move |text, done| {
                if !gate.is_cancelled() {
                    on_fragment(text, done);
                }
            });
            stream_work(forward, cancel)
        };
        self.start(work, Box::new(on_done), RunKind::Stream)
    }

    /// Deliver the completion callback once the run is terminal.
    ///
    /// Returns `false` while idle or running. Once terminal, the first call
    /// invokes the callback and every call returns `true`.
    pub fn poll(&self) -> bool {
        let pending = {
            let mut run = lock(&self.run);
            if !run.status.is_terminal() {
                return false;
            }
            if run.callback_invoked {
                return true;
            }
            run.callback_invoked = true;
            run.on_complete.take().map(|cb| (cb, run.result.clone()))
        };

        if let Some((callback, result)) = pending {
            callback(&result);
        }
        true
    }

    /// Request cooperative cancellation of the current run.
    pub fn cancel(&self) {
        debug!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_busy(&self) -> bool {
        self.status() == AsyncStatus::Running
    }

    pub fn is_complete(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn status(&self) -> AsyncStatus {
        lock(&self.run).status
    }

    /// Result of the last run. Default (unsuccessful, no error) until one
    /// reaches a terminal state.
    pub fn result(&self) -> ExecutionResult {
        lock(&self.run).result.clone()
    }

    fn start<W, Fut>(&mut self, work: W, on_complete: CompletionCallback, kind: RunKind) -> bool
    where
        W: FnOnce(CancelFlag) -> Fut + Send + 'static,
        Fut: Future<Output = ExecutionResult>,
    {
        if self.is_busy() {
            debug!("Slot busy, launch rejected");
            return false;
        }

        // The previous worker has already recorded its terminal state; wait
        // for the thread itself to exit before reusing the slot.
        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            warn!("Previous worker thread panicked");
        }

        self.cancel = CancelFlag::new();
        *lock(&self.run) = AsyncRun {
            status: AsyncStatus::Running,
            result: ExecutionResult::default(),
            callback_invoked: false,
            on_complete: Some(on_complete),
        };

        let run = Arc::clone(&self.run);
        let cancel = self.cancel.clone();
        let mut builder = std::thread::Builder::new().name(self.config.thread_name.clone());
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }

        let spawned = builder.spawn(move || {
            let result = run_to_completion(work, cancel.clone(), kind);
            finish(&run, &cancel, result, kind);
        });

        match spawned {
            Ok(handle) => {
                debug!(?kind, thread = %self.config.thread_name, "Worker launched");
                self.worker = Some(handle);
                true
            }
            Err(e) => {
                warn!("Failed to create worker thread: {e}");
                let mut run = lock(&self.run);
                run.status = AsyncStatus::Error;
                run.result = ExecutionResult::fail(
                    ErrorKind::OutOfMemory,
                    format!("Failed to create async task: {e}"),
                );
                false
            }
        }
    }
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.cancel.cancel();
            if handle.join().is_err() {
                warn!("Worker thread panicked during teardown");
            }
        }
    }
}

/// Drive `work` to completion on a current-thread runtime owned by the worker.
fn run_to_completion<W, Fut>(work: W, cancel: CancelFlag, kind: RunKind) -> ExecutionResult
where
    W: FnOnce(CancelFlag) -> Fut,
    Fut: Future<Output = ExecutionResult>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            return ExecutionResult::fail(
                ErrorKind::OutOfMemory,
                format!("Failed to start worker runtime: {e}"),
            );
        }
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(work(cancel)))) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!("Worker panicked: {detail}");
            ExecutionResult::fail(kind.failure_kind(), format!("Worker panicked: {detail}"))
        }
    }
}

fn finish(run: &Mutex<AsyncRun>, cancel: &CancelFlag, result: ExecutionResult, kind: RunKind) {
    let mut run = lock(run);
    if cancel.is_cancelled() {
        run.status = AsyncStatus::Cancelled;
        run.result = kind.cancelled();
    } else if result.success {
        run.status = AsyncStatus::Completed;
        run.result = result;
    } else {
        run.status = AsyncStatus::Error;
        run.result = if result.error.is_some() {
            result
        } else {
            ExecutionResult::fail(kind.failure_kind(), "Stream failed")
        };
    }
    debug!(status = %run.status, "Worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn wait_until_complete(slot: &ExecutionSlot) {
        for _ in 0..500 {
            if slot.is_complete() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("slot did not reach a terminal state");
    }

    async fn wait_for(flag: Arc<AtomicBool>) {
        while !flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(&ExecutionResult) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        (count, move |_: &ExecutionResult| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn idle_slot_does_not_poll() {
        let slot = ExecutionSlot::default();
        assert_eq!(slot.status(), AsyncStatus::Idle);
        assert!(!slot.is_busy());
        assert!(!slot.poll());
    }

    #[test]
    fn callback_fires_exactly_once() {
        let mut slot = ExecutionSlot::default();
        let release = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&release);
        let (count, on_complete) = counter();

        assert!(slot.launch(
            move |_| async move {
                wait_for(gate).await;
                ExecutionResult::ok("first")
            },
            on_complete,
        ));
        assert!(slot.is_busy());
        assert!(!slot.poll());

        release.store(true, Ordering::SeqCst);
        wait_until_complete(&slot);

        assert!(slot.poll());
        assert!(slot.poll());
        assert!(slot.poll());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(slot.status(), AsyncStatus::Completed);
        assert_eq!(slot.result().content, "first");
    }

    #[test]
    fn launch_while_running_is_rejected() {
        let mut slot = ExecutionSlot::default();
        let release = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&release);
        let (first_count, first_done) = counter();
        let (second_count, second_done) = counter();

        assert!(slot.launch(
            move |_| async move {
                wait_for(gate).await;
                ExecutionResult::ok("first")
            },
            first_done,
        ));
        assert!(!slot.launch(|_| async { ExecutionResult::ok("second") }, second_done));
        assert!(slot.is_busy());

        release.store(true, Ordering::SeqCst);
        wait_until_complete(&slot);
        slot.poll();

        assert_eq!(slot.result().content, "first");
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn slot_is_reusable_after_completion() {
        let mut slot = ExecutionSlot::default();
        assert!(slot.launch(|_| async { ExecutionResult::ok("one") }, |_| {}));
        wait_until_complete(&slot);

        let (count, on_complete) = counter();
        assert!(slot.launch(|_| async { ExecutionResult::ok("two") }, on_complete));
        wait_until_complete(&slot);
        assert!(slot.poll());
        assert_eq!(slot.result().content, "two");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_work_ends_in_error() {
        let mut slot = ExecutionSlot::default();
        slot.launch(
            |_| async { ExecutionResult::fail(ErrorKind::AuthError, "bad key") },
            |_| {},
        );
        wait_until_complete(&slot);
        assert_eq!(slot.status(), AsyncStatus::Error);
        assert_eq!(slot.result().error, Some(ErrorKind::AuthError));
    }

    #[test]
    fn cooperative_cancel_records_cancelled() {
        let mut slot = ExecutionSlot::default();
        slot.launch(
            |cancel| async move {
                while !cancel.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                ExecutionResult::ok("ignored")
            },
            |_| {},
        );
        slot.cancel();
        wait_until_complete(&slot);

        assert_eq!(slot.status(), AsyncStatus::Cancelled);
        let result = slot.result();
        assert_eq!(result.error, Some(ErrorKind::NetworkError));
        assert_eq!(result.error_message, "Request cancelled");
    }

    #[test]
    fn cancel_racing_completion_is_terminal_either_way() {
        let mut slot = ExecutionSlot::default();
        slot.launch(|_| async { ExecutionResult::ok("fast") }, |_| {});
        slot.cancel();
        wait_until_complete(&slot);
        assert!(matches!(
            slot.status(),
            AsyncStatus::Completed | AsyncStatus::Cancelled
        ));
        assert!(slot.poll());
    }

    #[test]
    fn stream_fragments_reach_caller() {
        let mut slot = ExecutionSlot::default();
        let fragments = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fragments);

        slot.launch_stream(
            |mut on_fragment, _| async move {
                on_fragment("Hi", false);
                on_fragment(" there", false);
                on_fragment("", true);
                ExecutionResult::ok("")
            },
            move |text, done| sink.lock().unwrap().push((text.to_string(), done)),
            |_| {},
        );
        wait_until_complete(&slot);

        assert_eq!(slot.status(), AsyncStatus::Completed);
        assert_eq!(
            *fragments.lock().unwrap(),
            vec![
                ("Hi".to_string(), false),
                (" there".to_string(), false),
                (String::new(), true),
            ]
        );
    }

    #[test]
    fn stream_fragments_suppressed_after_cancel() {
        let mut slot = ExecutionSlot::default();
        let fragments = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&fragments);
        let release = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&release);

        slot.launch_stream(
            move |mut on_fragment, _cancel| async move {
                on_fragment("early", false);
                wait_for(gate).await;
                // The work never checks the flag itself.
                on_fragment("late", false);
                ExecutionResult::ok("")
            },
            move |text, _| sink.lock().unwrap().push(text.to_string()),
            |_| {},
        );

        for _ in 0..500 {
            if !fragments.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        slot.cancel();
        release.store(true, Ordering::SeqCst);
        wait_until_complete(&slot);

        assert_eq!(*fragments.lock().unwrap(), vec!["early".to_string()]);
        assert_eq!(slot.status(), AsyncStatus::Cancelled);
        assert_eq!(slot.result().error_message, "Stream cancelled");
    }

    #[test]
    fn failed_stream_without_detail_is_streaming_error() {
        let mut slot = ExecutionSlot::default();
        slot.launch_stream(|_, _| async { ExecutionResult::default() }, |_, _| {}, |_| {});
        wait_until_complete(&slot);
        let result = slot.result();
        assert_eq!(result.error, Some(ErrorKind::StreamingError));
        assert_eq!(result.error_message, "Stream failed");
    }

    #[test]
    fn panicking_work_is_recorded_as_error() {
        let mut slot = ExecutionSlot::default();
        fn explode() -> ExecutionResult {
            panic!("boom")
        }
        slot.launch(|_| async { explode() }, |_| {});
        wait_until_complete(&slot);
        assert_eq!(slot.status(), AsyncStatus::Error);
        assert!(slot.result().error_message.contains("boom"));

        // The slot stays usable once the panicked worker has been joined.
        assert!(slot.launch(|_| async { ExecutionResult::ok("again") }, |_| {}));
        wait_until_complete(&slot);
        assert_eq!(slot.status(), AsyncStatus::Completed);
        assert_eq!(slot.result().content, "again");
    }

    #[test]
    fn drop_cancels_and_waits_for_worker() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        {
            let mut slot = ExecutionSlot::default();
            slot.launch(
                move |cancel| async move {
                    while !cancel.is_cancelled() {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    flag.store(true, Ordering::SeqCst);
                    ExecutionResult::ok("")
                },
                |_| {},
            );
        }
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn worker_uses_configured_thread_name() {
        let mut slot = ExecutionSlot::new(SlotConfig {
            thread_name: "chat-worker-test".into(),
            stack_size: Some(256 * 1024),
        });
        slot.launch(
            |_| async {
                let name = std::thread::current().name().unwrap_or_default().to_string();
                ExecutionResult::ok(name)
            },
            |_| {},
        );
        wait_until_complete(&slot);
        assert_eq!(slot.result().content, "chat-worker-test");
    }
}
