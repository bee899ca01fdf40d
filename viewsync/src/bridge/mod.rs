//! Chat Bridge
//!
//! Ties one conversational turn to at most one state mutation and its
//! broadcast. A turn walks `Idle -> AwaitingModelReply -> ApplyingDirective
//! -> Broadcasting -> Idle`, skipping straight back to `Idle` when the reply
//! carries no usable directive. Backend failures end the turn with a
//! recoverable [`BridgeError`] and never touch the view.

pub mod prompt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directive::{self, DirectiveError, MULTIPLE_DIRECTIVES_NOTE};
use crate::hub::{ClientConnection, Envelope, SessionHub, SessionId};
use crate::llm::{BackendError, ModelBackend};
use crate::state::{Mutation, MutationOutcome, StateError, StateModel, ViewState};

pub use prompt::{build_prompt, ConversationLog, ConversationTurn, Role};

/// Reply for an empty user message; the backend is not consulted.
pub const EMPTY_MESSAGE_REPLY: &str = "Please type a message.";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("language model unavailable: {0}")]
    Backend(#[from] BackendError),

    #[error("state rejected the change: {0}")]
    State(#[from] StateError),

    #[error("invalid view update: {0}")]
    InvalidUpdate(#[from] DirectiveError),
}

impl BridgeError {
    /// The originating surface may retry; nothing in the engine is broken.
    /// Only a shutdown-cancelled model call is final.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Backend(BackendError::Cancelled))
    }

    /// Short text suitable for a chat reply.
    pub fn user_message(&self) -> String {
        match self {
            Self::Backend(BackendError::Timeout(_)) => {
                "The assistant took too long to answer. Please try again.".to_string()
            }
            Self::Backend(BackendError::Cancelled) => "The server is shutting down.".to_string(),
            Self::Backend(_) => {
                "The assistant is unavailable right now. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub model_timeout_secs: u64,
    /// Most recent conversation turns included in each prompt.
    pub history_limit: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            model_timeout_secs: 30,
            history_limit: 50,
        }
    }
}

impl BridgeConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    AwaitingModelReply,
    ApplyingDirective,
    Broadcasting,
}

/// Surface a turn came from; the reply goes back there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Terminal,
    Http,
    Client(SessionId),
}

/// The mutation a turn applied, as it went out in the `live_update`.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    /// `None` when the change went out as a `state_replace`.
    pub action: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Human-readable reply for the originating surface.
    pub text: String,
    pub applied: Option<AppliedUpdate>,
    /// Why a directive present in the reply was discarded.
    pub rejected: Option<String>,
    /// Component id a directive targeted but which does not exist.
    pub not_found: Option<String>,
    pub multiple_directives: bool,
    /// Every phase the turn passed through, ending in `Idle`.
    pub phases: Vec<TurnPhase>,
}

impl TurnOutcome {
    fn text_only(text: String) -> Self {
        Self {
            text,
            applied: None,
            rejected: None,
            not_found: None,
            multiple_directives: false,
            phases: Vec::new(),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let applied = self.applied.as_ref().and_then(|update| {
            update
                .action
                .as_deref()
                .map(|action| (action, &update.data))
        });
        Envelope::chat_response(self.text.clone(), applied)
    }
}

struct Turn {
    id: u64,
    phases: Vec<TurnPhase>,
}

impl Turn {
    fn start(id: u64) -> Self {
        Self {
            id,
            phases: vec![TurnPhase::Idle],
        }
    }

    fn enter(&mut self, phase: TurnPhase) {
        if let Some(previous) = self.phases.last() {
            debug!("[Bridge] Turn {}: {:?} -> {:?}", self.id, previous, phase);
        }
        self.phases.push(phase);
    }

    fn finish(mut self) -> Vec<TurnPhase> {
        self.enter(TurnPhase::Idle);
        self.phases
    }
}

pub struct ChatBridge {
    state: Arc<StateModel>,
    hub: Arc<SessionHub>,
    backend: Arc<dyn ModelBackend>,
    config: BridgeConfig,
    history: Mutex<ConversationLog>,
    shutdown: CancellationToken,
    turn_counter: AtomicU64,
}

impl ChatBridge {
    pub fn new(
        state: Arc<StateModel>,
        hub: Arc<SessionHub>,
        backend: Arc<dyn ModelBackend>,
        config: BridgeConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            hub,
            backend,
            config,
            history: Mutex::new(ConversationLog::default()),
            shutdown,
            turn_counter: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> &Arc<StateModel> {
        &self.state
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn history(&self) -> MutexGuard<'_, ConversationLog> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn conversation(&self) -> Vec<ConversationTurn> {
        self.history().turns().to_vec()
    }

    /// Register a new client with a `state_replace` of the view as it is
    /// right now. The snapshot is taken under the state lock, so no change
    /// can slip between the snapshot and the client joining the broadcast
    /// set.
    pub fn attach_client(&self) -> ClientConnection {
        self.state
            .with_snapshot(|view| self.hub.register(&Envelope::state_replace(view)))
    }

    /// Run one conversational turn.
    pub async fn handle_turn(
        &self,
        origin: Origin,
        user_text: &str,
    ) -> Result<TurnOutcome, BridgeError> {
        let user_text = user_text.trim();
        if user_text.is_empty() {
            let mut outcome = TurnOutcome::text_only(EMPTY_MESSAGE_REPLY.to_string());
            outcome.phases = vec![TurnPhase::Idle];
            return Ok(outcome);
        }

        let mut turn = Turn::start(self.turn_counter.fetch_add(1, Ordering::Relaxed) + 1);
        info!("[Bridge] Turn {} from {:?}", turn.id, origin);

        let prompt = self.state.with_snapshot(|view| {
            let history = self.history();
            build_prompt(view, history.recent(self.config.history_limit), user_text)
        });

        turn.enter(TurnPhase::AwaitingModelReply);
        let reply = match self.call_backend(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("[Bridge] Turn {} failed: {}", turn.id, e);
                turn.finish();
                return Err(e.into());
            }
        };

        let extraction = directive::extract(&reply);
        let mut outcome = TurnOutcome::text_only(extraction.human_text.clone());
        outcome.multiple_directives = extraction.has_multiple();

        if let Some(raw) = &extraction.directive {
            match directive::validate(raw) {
                Ok(directive) => {
                    turn.enter(TurnPhase::ApplyingDirective);
                    self.apply_directive(Mutation::from(directive), &mut turn, &mut outcome);
                }
                Err(e) => {
                    debug!("[Bridge] Turn {}: discarding directive: {}", turn.id, e);
                    outcome.rejected = Some(e.to_string());
                }
            }
        }

        if let Some(id) = &outcome.not_found {
            outcome.text = format!("{}\n\n{}", outcome.text, not_found_note(id));
        }
        if outcome.multiple_directives {
            outcome.text = format!("{}\n\n{}", outcome.text, MULTIPLE_DIRECTIVES_NOTE);
        }

        {
            let mut history = self.history();
            history.push(ConversationTurn::new(Role::User, user_text));
            history.push(ConversationTurn::new(Role::Assistant, outcome.text.clone()));
        }

        outcome.phases = turn.finish();
        Ok(outcome)
    }

    /// Run a turn for a connected client and send the reply to it alone.
    pub async fn handle_client_message(&self, id: &SessionId, text: &str) {
        let reply = match self.handle_turn(Origin::Client(id.clone()), text).await {
            Ok(outcome) => outcome.to_envelope(),
            Err(e) => Envelope::chat_error(e.user_message()),
        };
        if !self.hub.send_to(id, &reply) {
            debug!("[Bridge] Client {} left before its reply was ready", id);
        }
    }

    /// Apply a client-originated `view_update`.
    pub fn apply_view_update(
        &self,
        action: &str,
        data: &Value,
    ) -> Result<MutationOutcome, BridgeError> {
        let directive = directive::validate_view_update(action, data)?;
        self.apply_mutation(Mutation::from(directive))
    }

    /// Apply a client `view_update`; rejections and unknown ids are reported
    /// to that client alone.
    pub fn handle_client_view_update(&self, id: &SessionId, action: &str, data: &Value) {
        let reply = match self.apply_view_update(action, data) {
            Ok(MutationOutcome::NotFound { id: missing }) => {
                Some(Envelope::chat_error(not_found_note(&missing)))
            }
            Ok(_) => None,
            Err(e) => {
                debug!("[Bridge] Rejected view_update from {}: {}", id, e);
                Some(Envelope::chat_error(e.to_string()))
            }
        };
        if let Some(reply) = reply {
            self.hub.send_to(id, &reply);
        }
    }

    /// Replace the whole view and broadcast it as a `state_replace`.
    pub fn replace_state(&self, view: ViewState) -> Result<MutationOutcome, BridgeError> {
        self.apply_mutation(Mutation::ReplaceAll(view))
    }

    /// The single path by which the view changes: apply under the state
    /// lock and broadcast before the lock is released.
    pub fn apply_mutation(&self, mutation: Mutation) -> Result<MutationOutcome, BridgeError> {
        let outcome = self.state.apply(mutation, |change| {
            let delivered = self.hub.broadcast(&Envelope::from_change(change));
            debug!("[Bridge] Broadcast {:?} to {} client(s)", change.action(), delivered);
        })?;
        Ok(outcome)
    }

    fn apply_directive(&self, mutation: Mutation, turn: &mut Turn, outcome: &mut TurnOutcome) {
        let result = self.state.apply(mutation, |change| {
            turn.enter(TurnPhase::Broadcasting);
            let delivered = self.hub.broadcast(&Envelope::from_change(change));
            info!(
                "[Bridge] Turn {}: applied {} and broadcast to {} client(s)",
                turn.id,
                change.action().unwrap_or("state_replace"),
                delivered
            );
            outcome.applied = Some(AppliedUpdate {
                action: change.action().map(str::to_string),
                data: change.data(),
            });
        });

        match result {
            Ok(MutationOutcome::Applied(_)) | Ok(MutationOutcome::Unchanged) => {}
            Ok(MutationOutcome::NotFound { id }) => outcome.not_found = Some(id),
            Err(e) => {
                debug!("[Bridge] Turn {}: state rejected directive: {}", turn.id, e);
                outcome.rejected = Some(e.to_string());
            }
        }
    }

    async fn call_backend(&self, prompt: &str) -> Result<String, BackendError> {
        let timeout = self.config.model_timeout();
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(BackendError::Cancelled),
            result = tokio::time::timeout(timeout, self.backend.complete(prompt)) => {
                match result {
                    Ok(reply) => reply,
                    Err(_) => Err(BackendError::Timeout(timeout)),
                }
            }
        }
    }
}

impl std::fmt::Debug for ChatBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatBridge")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

fn not_found_note(id: &str) -> String {
    format!("Note: no component with id `{}` exists, so nothing was changed.", id)
}
