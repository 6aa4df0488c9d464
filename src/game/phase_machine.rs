//! Replicated match phase machine
//!
//! Owns the single phase value of a session. Every peer feeds the same ordered
//! stream of [`PhaseRequest`]s through [`MatchPhaseMachine::apply`] and ends up
//! with the same phase and the same entry effects. Deferred work (the running
//! check and the game over transition) is spawned as tokio tasks that capture
//! the phase generation they were created under; a task whose generation is no
//! longer current never acts, and every transition aborts the previous tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::phase::{transition, GamePhase, PhaseRequest, PhaseTransition};

/// Start-once actions triggered by phase entry
pub trait PhaseEffects: Send + Sync + 'static {
    /// Entering Starting
    fn start_countdown(&self);
    /// Entering Running
    fn start_match_timer(&self);
    /// Fired once after the game over delay if the phase never changed
    fn present_game_over(&self);
}

/// Result of an end-of-match evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchVerdict {
    Continue,
    End,
}

/// End-of-match policy supplied by the integrating system
pub trait EndOfMatchRule: Send + Sync + 'static {
    fn evaluate(&self) -> MatchVerdict;
}

/// Rule that never ends the match on its own
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverEnds;

impl EndOfMatchRule for NeverEnds {
    fn evaluate(&self) -> MatchVerdict {
        MatchVerdict::Continue
    }
}

/// Phase request raised by a deferred task, stamped with the generation
/// it was raised under so a late delivery can be recognised as stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRequest {
    pub generation: u64,
    pub request: PhaseRequest,
}

/// Intervals for deferred phase work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTiming {
    /// How often the running check re-evaluates the end-of-match rule
    pub check_interval: Duration,
    /// Delay between entering GameOver and the presentation transition
    pub game_over_delay: Duration,
}

impl Default for PhaseTiming {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            game_over_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
struct PhaseCell {
    phase: GamePhase,
    generation: u64,
}

impl PhaseCell {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

/// Read-only view of a session's phase, cheap to clone
#[derive(Clone)]
pub struct PhaseReader {
    cell: Arc<Mutex<PhaseCell>>,
}

impl PhaseReader {
    pub fn phase(&self) -> GamePhase {
        self.cell.lock().phase
    }

    pub fn generation(&self) -> u64 {
        self.cell.lock().generation
    }
}

/// Keeps the live task count accurate whether a task finishes or is aborted
struct TaskGuard(Arc<AtomicUsize>);

impl TaskGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The authoritative match phase state machine
pub struct MatchPhaseMachine {
    cell: Arc<Mutex<PhaseCell>>,
    effects: Arc<dyn PhaseEffects>,
    rule: Arc<dyn EndOfMatchRule>,
    /// Where the running check sends its GameOver request
    requests: mpsc::UnboundedSender<ScheduledRequest>,
    timing: PhaseTiming,
    scheduled: Vec<JoinHandle<()>>,
    live_tasks: Arc<AtomicUsize>,
}

impl MatchPhaseMachine {
    pub fn new(
        effects: Arc<dyn PhaseEffects>,
        rule: Arc<dyn EndOfMatchRule>,
        timing: PhaseTiming,
        requests: mpsc::UnboundedSender<ScheduledRequest>,
    ) -> Self {
        Self {
            cell: Arc::new(Mutex::new(PhaseCell {
                phase: GamePhase::Waiting,
                generation: 0,
            })),
            effects,
            rule,
            requests,
            timing,
            scheduled: Vec::new(),
            live_tasks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn phase(&self) -> GamePhase {
        self.cell.lock().phase
    }

    /// Bumped on every distinct phase entry
    pub fn generation(&self) -> u64 {
        self.cell.lock().generation
    }

    pub fn reader(&self) -> PhaseReader {
        PhaseReader {
            cell: self.cell.clone(),
        }
    }

    /// Number of deferred phase tasks that have not yet finished or been dropped
    pub fn live_tasks(&self) -> usize {
        self.live_tasks.load(Ordering::SeqCst)
    }

    /// Apply a replicated phase request.
    ///
    /// Requesting the current phase is a silent no-op so duplicated or retried
    /// deliveries never repeat entry effects. Must be called from within a
    /// tokio runtime since Running and GameOver spawn deferred tasks.
    pub fn apply(&mut self, request: PhaseRequest) -> PhaseTransition {
        let (outcome, generation) = {
            let mut cell = self.cell.lock();
            let outcome = transition(cell.phase, request);
            if let PhaseTransition::Entered { to, .. } = outcome {
                cell.phase = to;
                cell.generation += 1;
            }
            (outcome, cell.generation)
        };

        match outcome {
            PhaseTransition::Unchanged => {
                debug!(phase = %request.target_phase, "Duplicate phase request dropped");
            }
            PhaseTransition::Entered { from, to } => {
                self.cancel_scheduled();
                info!(from = %from, phase = %to, generation, "Match phase entered");
                self.run_entry_effects(to, generation);
            }
        }

        outcome
    }

    /// Apply a request raised by one of this machine's own tasks. Dropped
    /// when the phase has moved on since the request was raised.
    pub fn apply_scheduled(&mut self, scheduled: ScheduledRequest) -> PhaseTransition {
        if self.generation() != scheduled.generation {
            debug!(
                generation = scheduled.generation,
                phase = %scheduled.request.target_phase,
                "Stale scheduled phase request dropped"
            );
            return PhaseTransition::Unchanged;
        }
        self.apply(scheduled.request)
    }

    fn run_entry_effects(&mut self, phase: GamePhase, generation: u64) {
        match phase {
            GamePhase::Waiting => {}
            GamePhase::Starting => {
                self.effects.start_countdown();
            }
            GamePhase::Running => {
                self.effects.start_match_timer();
                self.spawn_running_check(generation);
            }
            GamePhase::GameOver => {
                self.spawn_game_over(generation);
            }
        }
    }

    /// Re-evaluates the end-of-match rule immediately and then every
    /// `check_interval` for as long as `generation` stays current.
    fn spawn_running_check(&mut self, generation: u64) {
        let cell = self.cell.clone();
        let rule = self.rule.clone();
        let requests = self.requests.clone();
        let period = self.timing.check_interval;
        let guard = TaskGuard::new(&self.live_tasks);

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if !cell.lock().is_current(generation) {
                    debug!(generation, "Running check cancelled");
                    break;
                }

                if rule.evaluate() == MatchVerdict::End {
                    info!(generation, "End of match detected");
                    let scheduled = ScheduledRequest {
                        generation,
                        request: PhaseRequest::new(GamePhase::GameOver),
                    };
                    if requests.send(scheduled).is_err() {
                        warn!(generation, "Phase request queue closed");
                    }
                    break;
                }
            }
        });

        self.scheduled.push(handle);
    }

    fn spawn_game_over(&mut self, generation: u64) {
        let cell = self.cell.clone();
        let effects = self.effects.clone();
        let delay = self.timing.game_over_delay;
        let guard = TaskGuard::new(&self.live_tasks);

        let handle = tokio::spawn(async move {
            let _guard = guard;
            sleep(delay).await;

            // Phase cannot change while the lock is held
            let cell = cell.lock();
            if !cell.is_current(generation) {
                debug!(generation, "Game over transition cancelled");
                return;
            }

            info!(generation, "Presenting game over");
            effects.present_game_over();
        });

        self.scheduled.push(handle);
    }

    fn cancel_scheduled(&mut self) {
        for handle in self.scheduled.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for MatchPhaseMachine {
    fn drop(&mut self) {
        self.cancel_scheduled();
    }
}
