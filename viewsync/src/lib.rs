//! Live view synchronization.
//!
//! One authoritative [`ViewState`] describing a UI canvas, changed by
//! conversational turns with a language model and by connected clients, and
//! fanned out to every connected client over WebSocket.
//!
//! - [`state`]: the view, its mutators and anchor placement
//! - [`directive`]: pulling a JSON change request out of a model reply
//! - [`hub`]: client registry, broadcast and liveness
//! - [`bridge`]: the turn state machine tying the above together
//! - [`server`]: axum socket and HTTP front with start/stop lifecycle

pub mod bridge;
pub mod config;
pub mod directive;
pub mod hub;
pub mod llm;
pub mod server;
pub mod state;

pub use bridge::{BridgeConfig, BridgeError, ChatBridge, Origin, TurnOutcome, TurnPhase};
pub use config::{ConfigError, ServerConfig, ViewSyncConfig};
pub use directive::{DirectiveError, Extraction};
pub use hub::{ClientConnection, Envelope, EnvelopeType, HubConfig, SessionHub, SessionId};
pub use llm::{backend_from_config, BackendError, EchoBackend, LlmConfig, ModelBackend};
pub use server::{ServerError, ViewSyncServer};
pub use state::{
    Mutation, MutationOutcome, PlacementConfig, PlacementPlanner, StateChange, StateError,
    StateModel, ViewState,
};
