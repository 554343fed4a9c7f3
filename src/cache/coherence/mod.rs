//! The coherence engine: state machine, dispatch, dirty reads and node-event
//! sweeps.

pub mod dirty_reads;
pub mod engine;
mod msg_handlers;
mod node_events;
mod op_handlers;
mod state;

#[cfg(test)]
mod tests;

pub use engine::{CoherenceEngine, mark_comm_thread};
