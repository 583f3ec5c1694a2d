//! Victron CAN-bus BMS profile: PGN encoders and the scheduling/resilience
//! orchestrator that drives them onto the wire.

pub mod orchestrator;
pub mod pgn;

pub use orchestrator::{CanFrame, Orchestrator};
