//! Match simulation modules

pub mod fighter;
pub mod motion;
pub mod phase;
pub mod phase_machine;
pub mod session;
pub mod snapshot;

pub use phase::GamePhase;
pub use session::SessionRegistry;

use crate::ws::protocol::ClientMsg;
use uuid::Uuid;

/// Peer message received from WebSocket
#[derive(Debug, Clone)]
pub struct PeerInput {
    pub peer_id: Uuid,
    pub msg: ClientMsg,
}
