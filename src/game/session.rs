//! Match sessions and the authoritative tick loop

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::util::time::{tick_delta, SIMULATION_TPS, SNAPSHOT_TPS, TICK_DURATION_MICROS};
use crate::ws::protocol::{ClientMsg, ServerMsg};

use super::fighter::{BindingError, Fighter, FlatGround, KinematicBody, TraceAnimation};
use super::motion::{InputSample, MotionConfig};
use super::phase::{GamePhase, PhaseError, PhaseRequest, PhaseTransition};
use super::phase_machine::{
    EndOfMatchRule, MatchPhaseMachine, NeverEnds, PhaseEffects, PhaseReader, PhaseTiming,
    ScheduledRequest,
};
use super::snapshot::SnapshotBuilder;
use super::PeerInput;

/// Per-session tuning, copied from the server config
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub motion: MotionConfig,
    pub ground_friction: f32,
    pub timing: PhaseTiming,
    pub max_peers: usize,
    /// Lifetime of a session nobody plays in or listens to
    pub idle_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            motion: MotionConfig::default(),
            ground_friction: 0.0,
            timing: PhaseTiming::default(),
            max_peers: 2,
            idle_grace: Duration::from_secs(10),
        }
    }
}

/// Session errors that end the session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Phase(#[from] PhaseError),
}

/// Phase effects that tell every connected peer to start the action
pub struct BroadcastEffects {
    session_id: Uuid,
    events_tx: broadcast::Sender<ServerMsg>,
}

impl BroadcastEffects {
    pub fn new(session_id: Uuid, events_tx: broadcast::Sender<ServerMsg>) -> Self {
        Self {
            session_id,
            events_tx,
        }
    }
}

impl PhaseEffects for BroadcastEffects {
    fn start_countdown(&self) {
        info!(session_id = %self.session_id, "Starting countdown");
        let _ = self.events_tx.send(ServerMsg::CountdownStarted);
    }

    fn start_match_timer(&self) {
        info!(session_id = %self.session_id, "Starting match timer");
        let _ = self.events_tx.send(ServerMsg::MatchTimerStarted);
    }

    fn present_game_over(&self) {
        info!(session_id = %self.session_id, "Returning to main menu");
        let _ = self.events_tx.send(ServerMsg::ReturnToMenu);
    }
}

/// Scoped handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<PeerInput>,
    pub events_tx: broadcast::Sender<ServerMsg>,
    pub peer_count: Arc<AtomicUsize>,
    pub phase: PhaseReader,
}

impl SessionHandle {
    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    /// Keep only what a connected peer needs. Dropping the rest of the
    /// handle lets the event channel close once the session ends.
    pub fn into_peer_channels(self) -> (mpsc::Sender<PeerInput>, broadcast::Receiver<ServerMsg>) {
        let events_rx = self.events_tx.subscribe();
        (self.input_tx, events_rx)
    }
}

/// Registry of all active sessions
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionHandle>,
    settings: SessionSettings,
}

impl SessionRegistry {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            sessions: DashMap::new(),
            settings,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionHandle> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Return the session, spawning its tick loop if it does not exist yet.
    /// The entry is removed once the loop ends.
    pub fn get_or_create(self: &Arc<Self>, id: Uuid) -> SessionHandle {
        self.sessions
            .entry(id)
            .or_insert_with(|| {
                let (session, handle) = MatchSession::new(id, self.settings, Arc::new(NeverEnds));
                let registry = Arc::clone(self);
                tokio::spawn(async move {
                    match session.run().await {
                        Ok(()) => info!(session_id = %id, "Session closed"),
                        Err(e) => error!(session_id = %id, error = %e, "Session aborted"),
                    }
                    registry.remove(&id);
                });
                info!(session_id = %id, "Session created");
                handle
            })
            .value()
            .clone()
    }

    pub fn remove(&self, id: &Uuid) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, h)| h)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_peers(&self) -> usize {
        self.sessions
            .iter()
            .map(|s| s.value().peer_count())
            .sum()
    }
}

/// The authoritative match session
pub struct MatchSession {
    id: Uuid,
    tick: u64,
    settings: SessionSettings,
    machine: MatchPhaseMachine,
    /// Ordered by peer id so every tick steps fighters in the same order
    fighters: BTreeMap<Uuid, Fighter>,
    ever_joined: bool,
    idle_since: Option<Instant>,
    input_rx: mpsc::Receiver<PeerInput>,
    /// Requests raised by the session itself (end-of-match checks)
    phase_rx: mpsc::UnboundedReceiver<ScheduledRequest>,
    events_tx: broadcast::Sender<ServerMsg>,
    snapshot_builder: SnapshotBuilder,
    peer_count: Arc<AtomicUsize>,
}

impl MatchSession {
    /// Create a new session
    pub fn new(
        id: Uuid,
        settings: SessionSettings,
        rule: Arc<dyn EndOfMatchRule>,
    ) -> (Self, SessionHandle) {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(64);
        let (phase_tx, phase_rx) = mpsc::unbounded_channel();
        let peer_count = Arc::new(AtomicUsize::new(0));

        let effects = Arc::new(BroadcastEffects::new(id, events_tx.clone()));
        let machine = MatchPhaseMachine::new(effects, rule, settings.timing, phase_tx);

        let handle = SessionHandle {
            id,
            input_tx,
            events_tx: events_tx.clone(),
            peer_count: peer_count.clone(),
            phase: machine.reader(),
        };

        let session = Self {
            id,
            tick: 0,
            settings,
            machine,
            fighters: BTreeMap::new(),
            ever_joined: false,
            idle_since: None,
            input_rx,
            phase_rx,
            events_tx,
            snapshot_builder: SnapshotBuilder::new(SIMULATION_TPS / SNAPSHOT_TPS),
            peer_count,
        };

        (session, handle)
    }

    pub fn phase(&self) -> GamePhase {
        self.machine.phase()
    }

    /// Run the authoritative tick loop until every peer has left, or until
    /// the session sat idle for the grace period.
    /// An unknown phase code ends the session with an error.
    pub async fn run(mut self) -> Result<(), SessionError> {
        info!(session_id = %self.id, "Session loop started");

        let mut tick_interval = interval(Duration::from_micros(TICK_DURATION_MICROS));
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;

            // Drain inbound queues
            self.process_inputs()?;

            // Run simulation tick
            self.run_tick();

            if self.snapshot_builder.should_send() {
                let snapshot =
                    self.snapshot_builder
                        .build(self.tick, self.machine.phase(), &self.fighters);
                let _ = self.events_tx.send(snapshot);
            }

            if self.should_close(Instant::now()) {
                break;
            }
        }

        Ok(())
    }

    fn should_close(&mut self, now: Instant) -> bool {
        if !self.fighters.is_empty() {
            self.idle_since = None;
            return false;
        }

        if self.ever_joined {
            info!(session_id = %self.id, "All peers left, closing session");
            return true;
        }

        // Connected but not yet joined
        if self.events_tx.receiver_count() > 0 {
            self.idle_since = None;
            return false;
        }

        let idle_since = *self.idle_since.get_or_insert(now);
        if now.duration_since(idle_since) >= self.settings.idle_grace {
            info!(session_id = %self.id, "Session idle with no peers, closing");
            return true;
        }
        false
    }

    /// Process all pending phase requests and peer messages
    fn process_inputs(&mut self) -> Result<(), SessionError> {
        while let Ok(scheduled) = self.phase_rx.try_recv() {
            let outcome = self.machine.apply_scheduled(scheduled);
            self.announce(outcome);
        }

        while let Ok(input) = self.input_rx.try_recv() {
            match input.msg {
                ClientMsg::Join => {
                    self.handle_join(input.peer_id);
                }
                ClientMsg::InputTick { seq, horizontal } => {
                    self.handle_input(input.peer_id, seq, horizontal);
                }
                ClientMsg::RequestPhase { phase } => {
                    self.handle_phase_request(input.peer_id, phase)?;
                }
                ClientMsg::Ping { t } => {
                    let _ = self.events_tx.send(ServerMsg::Pong { t });
                }
                ClientMsg::Leave => {
                    self.handle_leave(input.peer_id);
                }
            }
        }

        Ok(())
    }

    fn handle_phase_request(&mut self, peer_id: Uuid, code: u8) -> Result<(), SessionError> {
        let request = match PhaseRequest::from_code(code) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    session_id = %self.id,
                    peer_id = %peer_id,
                    code,
                    "Peer sent unknown phase; replicas can no longer agree"
                );
                let _ = self.events_tx.send(ServerMsg::Error {
                    code: "unknown_phase".to_string(),
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        self.apply_phase(request);
        Ok(())
    }

    fn apply_phase(&mut self, request: PhaseRequest) {
        let outcome = self.machine.apply(request);
        self.announce(outcome);
    }

    /// Broadcast a phase entry to every peer
    fn announce(&mut self, outcome: PhaseTransition) {
        if let PhaseTransition::Entered { to, .. } = outcome {
            let _ = self.events_tx.send(ServerMsg::PhaseChanged {
                phase: to,
                generation: self.machine.generation(),
                tick: self.tick,
            });
            self.snapshot_builder.force_next();
        }
    }

    /// Handle peer join request
    fn handle_join(&mut self, peer_id: Uuid) {
        if self.fighters.contains_key(&peer_id) {
            warn!(peer_id = %peer_id, "Peer already in session");
            return;
        }

        if self.fighters.len() >= self.settings.max_peers {
            let _ = self.events_tx.send(ServerMsg::Error {
                code: "session_full".to_string(),
                message: "Session is full".to_string(),
            });
            return;
        }

        let fighter = match self.spawn_fighter(peer_id) {
            Ok(fighter) => fighter,
            Err(e) => {
                error!(session_id = %self.id, peer_id = %peer_id, error = %e, "Fighter binding failed");
                let _ = self.events_tx.send(ServerMsg::Error {
                    code: "binding_failed".to_string(),
                    message: e.to_string(),
                });
                return;
            }
        };

        self.fighters.insert(peer_id, fighter);
        self.ever_joined = true;
        self.peer_count.store(self.fighters.len(), Ordering::Relaxed);

        let _ = self.events_tx.send(ServerMsg::PeerJoined { peer_id });
        let _ = self.events_tx.send(ServerMsg::Joined {
            session_id: self.id,
            phase: self.machine.phase(),
            peers: self.fighters.keys().copied().collect(),
        });

        info!(
            session_id = %self.id,
            peer_id = %peer_id,
            peer_count = self.fighters.len(),
            "Peer joined session"
        );
    }

    fn spawn_fighter(&self, peer_id: Uuid) -> Result<Fighter, BindingError> {
        Fighter::builder(peer_id)
            .config(self.settings.motion)
            .ground(FlatGround::new(self.settings.ground_friction))
            .body(KinematicBody::new())
            .animation(TraceAnimation::new(peer_id))
            .build()
    }

    /// Buffer a peer's input for the next tick
    fn handle_input(&mut self, peer_id: Uuid, seq: u32, horizontal: f32) {
        if let Some(fighter) = self.fighters.get_mut(&peer_id) {
            fighter.buffer_input(seq, InputSample::new(horizontal));
        }
    }

    /// Handle peer leave
    fn handle_leave(&mut self, peer_id: Uuid) {
        if self.fighters.remove(&peer_id).is_some() {
            self.peer_count.store(self.fighters.len(), Ordering::Relaxed);

            let _ = self.events_tx.send(ServerMsg::PeerLeft {
                peer_id,
                reason: "disconnected".to_string(),
            });

            info!(session_id = %self.id, peer_id = %peer_id, "Peer left session");
        }
    }

    /// Run a single simulation tick
    fn run_tick(&mut self) {
        self.tick += 1;
        let dt = tick_delta();

        for fighter in self.fighters.values_mut() {
            fighter.tick(dt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::phase_machine::MatchVerdict;
    use tokio::time::{sleep, timeout};

    struct EndsImmediately;

    impl EndOfMatchRule for EndsImmediately {
        fn evaluate(&self) -> MatchVerdict {
            MatchVerdict::End
        }
    }

    fn input(peer_id: Uuid, msg: ClientMsg) -> PeerInput {
        PeerInput { peer_id, msg }
    }

    fn drain(rx: &mut broadcast::Receiver<ServerMsg>) -> Vec<ServerMsg> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn phase_changes(events: &[ServerMsg]) -> Vec<GamePhase> {
        events
            .iter()
            .filter_map(|m| match m {
                ServerMsg::PhaseChanged { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_phase_requests_broadcast_once() {
        let (mut session, handle) =
            MatchSession::new(Uuid::new_v4(), SessionSettings::default(), Arc::new(NeverEnds));
        let mut events = handle.events_tx.subscribe();
        let peer = Uuid::new_v4();

        for code in [1u8, 1, 1, 2, 2] {
            handle
                .input_tx
                .send(input(peer, ClientMsg::RequestPhase { phase: code }))
                .await
                .unwrap();
        }
        session.process_inputs().unwrap();

        let events = drain(&mut events);
        assert_eq!(
            phase_changes(&events),
            vec![GamePhase::Starting, GamePhase::Running]
        );
        let countdowns = events
            .iter()
            .filter(|m| matches!(m, ServerMsg::CountdownStarted))
            .count();
        let timers = events
            .iter()
            .filter(|m| matches!(m, ServerMsg::MatchTimerStarted))
            .count();
        assert_eq!(countdowns, 1);
        assert_eq!(timers, 1);
        assert_eq!(handle.phase.phase(), GamePhase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_phase_is_fatal() {
        let (mut session, handle) =
            MatchSession::new(Uuid::new_v4(), SessionSettings::default(), Arc::new(NeverEnds));
        let mut events = handle.events_tx.subscribe();

        handle
            .input_tx
            .send(input(Uuid::new_v4(), ClientMsg::RequestPhase { phase: 9 }))
            .await
            .unwrap();

        let result = session.process_inputs();
        assert!(matches!(
            result,
            Err(SessionError::Phase(PhaseError::UnknownPhase(9)))
        ));
        assert!(drain(&mut events)
            .iter()
            .any(|m| matches!(m, ServerMsg::Error { code, .. } if code == "unknown_phase")));
        assert_eq!(session.phase(), GamePhase::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn input_drives_fighter_motion() {
        let (mut session, handle) =
            MatchSession::new(Uuid::new_v4(), SessionSettings::default(), Arc::new(NeverEnds));
        let peer = Uuid::new_v4();

        handle.input_tx.send(input(peer, ClientMsg::Join)).await.unwrap();
        handle
            .input_tx
            .send(input(
                peer,
                ClientMsg::InputTick {
                    seq: 1,
                    horizontal: 1.0,
                },
            ))
            .await
            .unwrap();
        session.process_inputs().unwrap();
        session.run_tick();

        assert_eq!(handle.peer_count(), 1);
        let snapshot = session.fighters[&peer].snapshot();
        assert!((snapshot.vel_x - 0.7).abs() < 1e-5);
        assert!(snapshot.facing_right);

        // No new sample: direction holds and velocity keeps converging
        session.run_tick();
        let snapshot = session.fighters[&peer].snapshot();
        assert!((snapshot.vel_x - 1.4).abs() < 1e-5);
    }

    #[tokio::test(start_paused = true)]
    async fn full_session_rejects_join() {
        let settings = SessionSettings {
            max_peers: 1,
            ..SessionSettings::default()
        };
        let (mut session, handle) = MatchSession::new(Uuid::new_v4(), settings, Arc::new(NeverEnds));
        let mut events = handle.events_tx.subscribe();

        handle.input_tx.send(input(Uuid::new_v4(), ClientMsg::Join)).await.unwrap();
        handle.input_tx.send(input(Uuid::new_v4(), ClientMsg::Join)).await.unwrap();
        session.process_inputs().unwrap();

        assert_eq!(handle.peer_count(), 1);
        assert!(drain(&mut events)
            .iter()
            .any(|m| matches!(m, ServerMsg::Error { code, .. } if code == "session_full")));
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_match_rule_leads_to_menu() {
        let (mut session, handle) = MatchSession::new(
            Uuid::new_v4(),
            SessionSettings::default(),
            Arc::new(EndsImmediately),
        );
        let mut events = handle.events_tx.subscribe();

        handle
            .input_tx
            .send(input(Uuid::new_v4(), ClientMsg::RequestPhase { phase: 2 }))
            .await
            .unwrap();
        session.process_inputs().unwrap();

        // Let the running check evaluate once
        sleep(Duration::from_millis(10)).await;
        session.process_inputs().unwrap();
        assert_eq!(session.phase(), GamePhase::GameOver);

        sleep(Duration::from_millis(3100)).await;
        let events = drain(&mut events);
        assert_eq!(
            phase_changes(&events),
            vec![GamePhase::Running, GamePhase::GameOver]
        );
        assert_eq!(
            events
                .iter()
                .filter(|m| matches!(m, ServerMsg::ReturnToMenu))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_ends_when_all_peers_leave() {
        let (session, handle) =
            MatchSession::new(Uuid::new_v4(), SessionSettings::default(), Arc::new(NeverEnds));
        let peer = Uuid::new_v4();
        let task = tokio::spawn(session.run());

        handle.input_tx.send(input(peer, ClientMsg::Join)).await.unwrap();
        handle.input_tx.send(input(peer, ClientMsg::Leave)).await.unwrap();

        let result = timeout(Duration::from_secs(1), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
        assert_eq!(handle.peer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_phase_ends_run_with_error() {
        let (session, handle) =
            MatchSession::new(Uuid::new_v4(), SessionSettings::default(), Arc::new(NeverEnds));
        let task = tokio::spawn(session.run());

        handle
            .input_tx
            .send(input(Uuid::new_v4(), ClientMsg::RequestPhase { phase: 9 }))
            .await
            .unwrap();

        let result = timeout(Duration::from_secs(1), task).await;
        assert!(matches!(
            result,
            Ok(Ok(Err(SessionError::Phase(PhaseError::UnknownPhase(9)))))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_session_closes_peer_channels() {
        let registry = Arc::new(SessionRegistry::new(SessionSettings::default()));
        let id = Uuid::new_v4();
        let (input_tx, mut events_rx) = registry.get_or_create(id).into_peer_channels();

        input_tx
            .send(input(Uuid::new_v4(), ClientMsg::RequestPhase { phase: 9 }))
            .await
            .unwrap();

        let closed = timeout(Duration::from_secs(1), async {
            loop {
                match events_rx.recv().await {
                    Err(broadcast::error::RecvError::Closed) => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "peers stayed attached to an aborted session");
        assert!(registry.get(&id).is_none());
        assert!(input_tx
            .send(input(Uuid::new_v4(), ClientMsg::Join))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unjoined_session_closes_after_idle_grace() {
        let settings = SessionSettings::default();
        let registry = Arc::new(SessionRegistry::new(settings));
        let id = Uuid::new_v4();

        let handle = registry.get_or_create(id);
        handle
            .input_tx
            .send(input(Uuid::new_v4(), ClientMsg::Leave))
            .await
            .unwrap();
        drop(handle);

        sleep(settings.idle_grace / 2).await;
        assert_eq!(registry.active_sessions(), 1);

        sleep(settings.idle_grace).await;
        assert_eq!(registry.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_peer_keeps_unjoined_session_open() {
        let settings = SessionSettings::default();
        let registry = Arc::new(SessionRegistry::new(settings));
        let id = Uuid::new_v4();

        let (_input_tx, events_rx) = registry.get_or_create(id).into_peer_channels();
        sleep(settings.idle_grace * 3).await;
        assert_eq!(registry.active_sessions(), 1);

        drop(events_rx);
        sleep(settings.idle_grace + Duration::from_secs(1)).await;
        assert_eq!(registry.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_reuses_and_removes_sessions() {
        let registry = Arc::new(SessionRegistry::new(SessionSettings::default()));
        let id = Uuid::new_v4();

        let first = registry.get_or_create(id);
        let second = registry.get_or_create(id);
        assert_eq!(registry.active_sessions(), 1);
        assert!(first.input_tx.same_channel(&second.input_tx));

        let peer = Uuid::new_v4();
        first.input_tx.send(input(peer, ClientMsg::Join)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.total_peers(), 1);

        first.input_tx.send(input(peer, ClientMsg::Leave)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.active_sessions(), 0);
        assert!(registry.get(&id).is_none());
    }
}
