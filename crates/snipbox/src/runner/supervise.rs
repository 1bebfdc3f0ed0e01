//! Execution supervision
//!
//! The loader runs on a dedicated OS thread with its own current-thread
//! runtime, so a snippet that never yields cannot stall the caller's
//! executor. The supervisor waits on a oneshot channel for at most the
//! deadline and then destroys the context, whichever way the run ended.
//! Destroying the context is what stops a runaway program; the worker then
//! finds its program gone, reports into a closed channel and exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, instrument, warn};

use crate::runner::load::{RunOutcome, load_and_run};
use crate::sandbox::IsolationContext;
use crate::types::CompiledArtifact;

/// Lifecycle of one supervised run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Completed,
    TimedOut,
    Faulted,
}

/// How a supervised run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Supervised {
    /// The worker reported before the deadline
    Completed(RunOutcome),
    /// The deadline elapsed first
    TimedOut,
    /// The worker could not be started or died without reporting
    Faulted(String),
}

impl Supervised {
    pub fn state(&self) -> SupervisorState {
        match self {
            Supervised::Completed(_) => SupervisorState::Completed,
            Supervised::TimedOut => SupervisorState::TimedOut,
            Supervised::Faulted(_) => SupervisorState::Faulted,
        }
    }
}

/// What the worker sends back: the run's outcome, or why it could not run
type Report = Result<RunOutcome, String>;

/// Runs artifacts under a wall-clock deadline
#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    deadline: Duration,
}

impl Supervisor {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run `artifact` inside `context` and tear the context down afterwards
    ///
    /// The context is destroyed before this returns on every path.
    #[instrument(skip_all, fields(deadline = ?self.deadline))]
    pub async fn run<C: IsolationContext>(
        &self,
        context: C,
        artifact: CompiledArtifact,
    ) -> Supervised {
        let context = Arc::new(context);
        let (tx, rx) = oneshot::channel::<Report>();

        transition(SupervisorState::Idle, SupervisorState::Running);
        let supervised = match spawn_worker(Arc::clone(&context), artifact, tx) {
            Err(e) => Supervised::Faulted(format!("failed to start worker: {e}")),
            Ok(()) => match tokio::time::timeout(self.deadline, rx).await {
                Ok(Ok(Ok(outcome))) => Supervised::Completed(outcome),
                Ok(Ok(Err(message))) => Supervised::Faulted(message),
                Ok(Err(_)) => Supervised::Faulted("worker exited without reporting".to_string()),
                // Dropping the receiver here discards whatever the worker sends later
                Err(_) => Supervised::TimedOut,
            },
        };
        transition(SupervisorState::Running, supervised.state());

        teardown(context.as_ref()).await;
        supervised
    }
}

fn transition(from: SupervisorState, to: SupervisorState) {
    debug!(?from, ?to, "supervisor state");
}

fn spawn_worker<C: IsolationContext>(
    context: Arc<C>,
    artifact: CompiledArtifact,
    tx: oneshot::Sender<Report>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("snipbox-worker".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = tx.send(Err(format!("failed to start worker runtime: {e}")));
                    return;
                }
            };

            let outcome = runtime.block_on(load_and_run(context.as_ref(), artifact));
            if tx.send(Ok(outcome)).is_err() {
                debug!("supervisor stopped waiting, discarding late outcome");
            }
        })
        .map(|_| ())
}

/// Destroy the context, retrying once; a second failure is logged and swallowed
async fn teardown<C: IsolationContext>(context: &C) {
    let Err(first) = context.destroy().await else {
        return;
    };
    warn!(error = %first, "context teardown failed, retrying");

    if let Err(second) = context.destroy().await {
        error!(error = %second, "context teardown failed again, giving up");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::sandbox::{ExitKind, Invocation, LiveContexts, LiveToken, SandboxError};

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Answer,
        Hang,
        Panic,
    }

    #[derive(Debug, Default)]
    struct Tracker {
        destroy_calls: AtomicUsize,
        destroyed: AtomicBool,
    }

    /// In-memory context whose program answers, hangs until destroyed or panics
    struct Fake {
        behavior: Behavior,
        /// Number of destroy calls that fail before one succeeds
        failing_destroys: usize,
        tracker: Arc<Tracker>,
        live: std::sync::Mutex<Option<LiveToken>>,
    }

    impl Fake {
        fn new(behavior: Behavior, failing_destroys: usize, live: &LiveContexts) -> (Self, Arc<Tracker>) {
            let tracker = Arc::new(Tracker::default());
            let fake = Fake {
                behavior,
                failing_destroys,
                tracker: Arc::clone(&tracker),
                live: std::sync::Mutex::new(Some(live.track())),
            };
            (fake, tracker)
        }
    }

    impl IsolationContext for Fake {
        async fn load(&self, _artifact: CompiledArtifact) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn invoke(&self) -> Result<Invocation, SandboxError> {
            match self.behavior {
                Behavior::Answer => Ok(Invocation {
                    exit: ExitKind::Code(0),
                    result: Some(b"2".to_vec()),
                    stderr: Vec::new(),
                }),
                Behavior::Hang => loop {
                    if self.tracker.destroyed.load(Ordering::SeqCst) {
                        return Err(SandboxError::Destroyed);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                },
                Behavior::Panic => panic!("worker blew up"),
            }
        }

        async fn destroy(&self) -> Result<(), SandboxError> {
            let call = self.tracker.destroy_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failing_destroys {
                return Err(SandboxError::TeardownFailed("busy".to_string()));
            }
            self.tracker.destroyed.store(true, Ordering::SeqCst);
            self.live.lock().unwrap().take();
            Ok(())
        }

        fn is_destroyed(&self) -> bool {
            self.tracker.destroyed.load(Ordering::SeqCst)
        }
    }

    fn artifact() -> CompiledArtifact {
        CompiledArtifact::new(b"program".to_vec())
    }

    #[tokio::test]
    async fn completed_run_is_torn_down() {
        let live = LiveContexts::new();
        let (fake, tracker) = Fake::new(Behavior::Answer, 0, &live);

        let supervised = Supervisor::new(Duration::from_secs(5))
            .run(fake, artifact())
            .await;

        assert_eq!(
            supervised,
            Supervised::Completed(RunOutcome::Value(Some("2".to_string())))
        );
        assert_eq!(supervised.state(), SupervisorState::Completed);
        assert!(tracker.destroyed.load(Ordering::SeqCst));
        assert_eq!(tracker.destroy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(live.count(), 0);
    }

    #[tokio::test]
    async fn hanging_run_times_out_near_deadline() {
        let live = LiveContexts::new();
        let (fake, tracker) = Fake::new(Behavior::Hang, 0, &live);
        let deadline = Duration::from_millis(200);

        let started = Instant::now();
        let supervised = Supervisor::new(deadline).run(fake, artifact()).await;
        let elapsed = started.elapsed();

        assert_eq!(supervised, Supervised::TimedOut);
        assert!(elapsed >= deadline);
        assert!(elapsed < deadline + Duration::from_secs(1));
        assert!(tracker.destroyed.load(Ordering::SeqCst));
        assert_eq!(live.count(), 0);
    }

    #[tokio::test]
    async fn panicking_worker_is_faulted() {
        let live = LiveContexts::new();
        let (fake, tracker) = Fake::new(Behavior::Panic, 0, &live);

        let supervised = Supervisor::new(Duration::from_secs(5))
            .run(fake, artifact())
            .await;

        assert_eq!(
            supervised,
            Supervised::Faulted("worker exited without reporting".to_string())
        );
        assert!(tracker.destroyed.load(Ordering::SeqCst));
        assert_eq!(live.count(), 0);
    }

    #[tokio::test]
    async fn failed_teardown_is_retried_once() {
        let live = LiveContexts::new();
        let (fake, tracker) = Fake::new(Behavior::Answer, 1, &live);

        let supervised = Supervisor::new(Duration::from_secs(5))
            .run(fake, artifact())
            .await;

        assert_eq!(supervised.state(), SupervisorState::Completed);
        assert_eq!(tracker.destroy_calls.load(Ordering::SeqCst), 2);
        assert!(tracker.destroyed.load(Ordering::SeqCst));
        assert_eq!(live.count(), 0);
    }

    #[tokio::test]
    async fn second_teardown_failure_is_swallowed() {
        let live = LiveContexts::new();
        let (fake, tracker) = Fake::new(Behavior::Answer, 2, &live);

        let supervised = Supervisor::new(Duration::from_secs(5))
            .run(fake, artifact())
            .await;

        // The outcome survives; only two attempts are made
        assert_eq!(supervised.state(), SupervisorState::Completed);
        assert_eq!(tracker.destroy_calls.load(Ordering::SeqCst), 2);
        assert!(!tracker.destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn supervisor_is_reusable_after_timeout() {
        let live = LiveContexts::new();
        let supervisor = Supervisor::new(Duration::from_millis(100));

        let (hanging, _) = Fake::new(Behavior::Hang, 0, &live);
        assert_eq!(
            supervisor.run(hanging, artifact()).await,
            Supervised::TimedOut
        );

        let (answering, _) = Fake::new(Behavior::Answer, 0, &live);
        assert_eq!(
            supervisor.run(answering, artifact()).await.state(),
            SupervisorState::Completed
        );
        assert_eq!(live.count(), 0);
    }
}
