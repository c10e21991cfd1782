//! Pylon — host-side orchestrator node for the Estelle agent-orchestration
//! fabric. See `README`/spec for the wire protocol; this crate implements
//! one Pylon process: workspace/conversation state, assistant session
//! lifecycle, and the relay + loopback services that expose both to clients
//! and tool subprocesses.

pub mod adapters;
pub mod beacon;
pub mod claude_manager;
pub mod config;
pub mod errors;
pub mod identity;
pub mod logging;
pub mod mcp_bridge;
pub mod message_store;
pub mod persistence;
pub mod router;
pub mod share;
pub mod workspace_store;
