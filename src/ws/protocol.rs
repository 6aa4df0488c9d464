//! WebSocket protocol message definitions
//! These are the wire types for peer-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::phase::GamePhase;

/// Messages sent from a peer to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Spawn a fighter for this peer
    Join,

    /// Directional input for one tick
    InputTick {
        /// Sequence number; older or repeated values are ignored
        seq: u32,
        /// Horizontal axis (-1.0 = full left, 1.0 = full right)
        horizontal: f32,
    },

    /// Ask every replica to move to a phase.
    /// Carries the raw phase code so unknown values reach the session.
    RequestPhase {
        phase: u8,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Leave the session
    Leave,
}

/// Messages sent from the server to peers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        peer_id: Uuid,
        server_time: u64,
    },

    /// Confirmation of session join
    Joined {
        session_id: Uuid,
        phase: GamePhase,
        /// All peers with a fighter at join time
        peers: Vec<Uuid>,
    },

    /// Peer joined the session
    PeerJoined {
        peer_id: Uuid,
    },

    /// Peer left the session
    PeerLeft {
        peer_id: Uuid,
        reason: String,
    },

    /// The replicated phase changed
    PhaseChanged {
        phase: GamePhase,
        generation: u64,
        tick: u64,
    },

    /// Starting countdown should begin
    CountdownStarted,

    /// Match timer should begin
    MatchTimerStarted,

    /// Game over presentation finished; peers return to the main menu
    ReturnToMenu,

    /// Fighter state snapshot (sent at regular intervals)
    Snapshot {
        /// Server tick number
        tick: u64,
        phase: GamePhase,
        fighters: Vec<FighterSnapshot>,
    },

    /// Error message
    Error {
        code: String,
        message: String,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

/// Fighter state in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FighterSnapshot {
    pub peer_id: Uuid,
    /// Current velocity X
    pub vel_x: f32,
    /// Current velocity Y
    pub vel_y: f32,
    pub facing_right: bool,
    /// Body yaw in degrees
    pub yaw: f32,
    pub animation_speed: f32,
    /// Last processed input sequence
    pub last_input_seq: u32,
}
