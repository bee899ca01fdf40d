use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use viewsync::bridge::{BridgeConfig, ChatBridge, Origin, TurnPhase};
use viewsync::directive::MULTIPLE_DIRECTIVES_NOTE;
use viewsync::hub::{ClientConnection, Envelope, EnvelopeType, HubConfig, Outbound, SessionHub};
use viewsync::llm::{BackendError, ModelBackend};
use viewsync::state::StateModel;
use viewsync::BridgeError;

/// Replies with queued answers in order and records every prompt.
#[derive(Default)]
struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, BackendError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(replies: Vec<Result<String, BackendError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> Result<String, BackendError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("No more replies.".to_string()))
    }
}

/// Never answers.
struct SilentBackend;

#[async_trait]
impl ModelBackend for SilentBackend {
    fn name(&self) -> &str {
        "silent"
    }

    async fn complete(&self, _prompt: &str) -> Result<String, BackendError> {
        std::future::pending::<()>().await;
        Ok(String::new())
    }
}

fn bridge(backend: Arc<dyn ModelBackend>, config: BridgeConfig) -> (ChatBridge, CancellationToken) {
    let shutdown = CancellationToken::new();
    let hub = Arc::new(SessionHub::new(HubConfig::default(), shutdown.clone()));
    let bridge = ChatBridge::new(
        Arc::new(StateModel::default()),
        hub,
        backend,
        config,
        shutdown.clone(),
    );
    (bridge, shutdown)
}

fn drain(client: &mut ClientConnection) -> Vec<Envelope> {
    let mut envelopes = Vec::new();
    while let Some(outbound) = client.try_next_outbound() {
        if let Outbound::Frame(frame) = outbound {
            envelopes.push(Envelope::from_json(&frame).expect("valid frame"));
        }
    }
    envelopes
}

const ADD_BUTTON: &str = r#"Here you go! {"action":"add_component","data":{"type":"button","category":"atomic","properties":{"label":"Go"},"size":{"w":100,"h":40}}}"#;

#[tokio::test]
async fn directive_is_applied_and_broadcast() {
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(ADD_BUTTON.to_string())]));
    let (bridge, _shutdown) = bridge(backend.clone(), BridgeConfig::default());
    let mut client = bridge.attach_client();
    let initial = drain(&mut client);
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].kind(), EnvelopeType::StateReplace);

    let outcome = bridge
        .handle_turn(Origin::Terminal, "add a button")
        .await
        .expect("turn succeeds");

    assert_eq!(outcome.text, "Here you go!");
    assert_eq!(
        outcome.phases,
        vec![
            TurnPhase::Idle,
            TurnPhase::AwaitingModelReply,
            TurnPhase::ApplyingDirective,
            TurnPhase::Broadcasting,
            TurnPhase::Idle
        ]
    );

    let view = bridge.state().snapshot();
    assert_eq!(view.components.len(), 1);
    let component = &view.components[0];
    assert_eq!(component.kind, "button");
    assert_eq!(component.position.x, 40);
    assert_eq!(component.position.y, 40);

    let updates = drain(&mut client);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].kind(), EnvelopeType::LiveUpdate);
    assert_eq!(updates[0].action(), Some("add_component"));
    assert_eq!(updates[0].data()["id"], json!(component.id));

    let reply = outcome.to_envelope();
    assert_eq!(reply.kind(), EnvelopeType::ChatResponse);
    assert_eq!(reply.action(), Some("add_component"));
    assert_eq!(reply.data()["response"], "Here you go!");

    let prompts = backend.prompts();
    assert!(prompts[0].ends_with("User: add a button"));
}

#[tokio::test]
async fn plain_reply_is_delivered_without_broadcast() {
    let backend = Arc::new(ScriptedBackend::new(vec![Ok("Looks good as is.".to_string())]));
    let (bridge, _shutdown) = bridge(backend, BridgeConfig::default());
    let mut client = bridge.attach_client();
    drain(&mut client);

    let outcome = bridge
        .handle_turn(Origin::Terminal, "what do you think?")
        .await
        .expect("turn");

    assert_eq!(outcome.text, "Looks good as is.");
    assert!(outcome.applied.is_none());
    assert!(drain(&mut client).is_empty());
    assert!(!outcome.phases.contains(&TurnPhase::Broadcasting));
}

#[tokio::test]
async fn invalid_directive_is_discarded_but_text_delivered() {
    let reply = r#"Sure. {"action":"add_component","data":{"type":"button","category":"atomic","properties":{},"size":{"w":0,"h":40}}}"#;
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(reply.to_string())]));
    let (bridge, _shutdown) = bridge(backend, BridgeConfig::default());
    let mut client = bridge.attach_client();
    drain(&mut client);

    let outcome = bridge
        .handle_turn(Origin::Http, "add a zero-width button")
        .await
        .expect("turn");

    assert_eq!(outcome.text, "Sure.");
    assert!(outcome.rejected.is_some());
    assert!(outcome.applied.is_none());
    assert_eq!(bridge.state().component_count(), 0);
    assert!(drain(&mut client).is_empty());
}

#[tokio::test]
async fn backend_failure_is_recoverable_and_leaves_state_alone() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Err(BackendError::Transport("connection reset".to_string())),
        Ok(ADD_BUTTON.to_string()),
    ]));
    let (bridge, _shutdown) = bridge(backend, BridgeConfig::default());
    let before = bridge.state().snapshot();

    let err = bridge
        .handle_turn(Origin::Terminal, "add a button")
        .await
        .expect_err("backend fails");
    assert!(matches!(err, BridgeError::Backend(BackendError::Transport(_))));
    assert!(err.is_recoverable());
    assert_eq!(bridge.state().snapshot(), before);
    assert!(bridge.conversation().is_empty());

    // The retry goes through normally.
    let outcome = bridge
        .handle_turn(Origin::Terminal, "add a button")
        .await
        .expect("retry");
    assert!(outcome.applied.is_some());
}

#[tokio::test(start_paused = true)]
async fn slow_backend_times_out() {
    let config = BridgeConfig {
        model_timeout_secs: 2,
        ..BridgeConfig::default()
    };
    let (bridge, _shutdown) = bridge(Arc::new(SilentBackend), config);

    let err = bridge
        .handle_turn(Origin::Terminal, "hello?")
        .await
        .expect_err("times out");
    assert!(matches!(err, BridgeError::Backend(BackendError::Timeout(_))));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn shutdown_cancels_in_flight_model_call() {
    let (bridge, shutdown) = bridge(Arc::new(SilentBackend), BridgeConfig::default());
    let bridge = Arc::new(bridge);

    let turn = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.handle_turn(Origin::Terminal, "hello?").await })
    };
    tokio::task::yield_now().await;
    shutdown.cancel();

    let result = turn.await.expect("turn task joins");
    assert!(matches!(
        result,
        Err(BridgeError::Backend(BackendError::Cancelled))
    ));
}

#[tokio::test]
async fn multiple_directives_apply_first_and_add_note() {
    let reply = r#"Done twice. {"action":"update_layout","data":{"columns":6}} {"action":"update_layout","data":{"columns":4}}"#;
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(reply.to_string())]));
    let (bridge, _shutdown) = bridge(backend, BridgeConfig::default());

    let outcome = bridge
        .handle_turn(Origin::Terminal, "change columns")
        .await
        .expect("turn");

    assert!(outcome.multiple_directives);
    assert!(outcome.text.starts_with("Done twice."));
    assert!(outcome.text.ends_with(MULTIPLE_DIRECTIVES_NOTE));
    assert_eq!(bridge.state().snapshot().layout.columns, 6);
}

#[tokio::test]
async fn update_of_unknown_component_reports_not_found() {
    let reply = r#"Updated. {"action":"update_component","data":{"id":"component-missing","properties":{"label":"x"}}}"#;
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(reply.to_string())]));
    let (bridge, _shutdown) = bridge(backend, BridgeConfig::default());
    let mut client = bridge.attach_client();
    drain(&mut client);
    let before = bridge.state().snapshot();

    let outcome = bridge
        .handle_turn(Origin::Terminal, "rename it")
        .await
        .expect("turn");

    assert_eq!(outcome.not_found.as_deref(), Some("component-missing"));
    assert!(outcome.text.contains("component-missing"));
    assert!(outcome.applied.is_none());
    assert_eq!(bridge.state().snapshot(), before);
    assert!(drain(&mut client).is_empty());
}

#[tokio::test]
async fn history_feeds_later_prompts_within_limit() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok("first answer".to_string()),
        Ok("second answer".to_string()),
        Ok("third answer".to_string()),
    ]));
    let config = BridgeConfig {
        history_limit: 2,
        ..BridgeConfig::default()
    };
    let (bridge, _shutdown) = bridge(backend.clone(), config);

    for message in ["one", "two", "three"] {
        bridge
            .handle_turn(Origin::Terminal, message)
            .await
            .expect("turn");
    }

    let prompts = backend.prompts();
    assert!(prompts[1].contains("User: one"));
    assert!(prompts[1].contains("Assistant: first answer"));
    // Only the last two turns (the "two" exchange) make it into the third prompt.
    assert!(!prompts[2].contains("User: one"));
    assert!(prompts[2].contains("User: two"));
    assert!(prompts[2].contains("Assistant: second answer"));
    assert_eq!(bridge.conversation().len(), 6);
}

#[tokio::test]
async fn client_message_reply_goes_only_to_origin() {
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(
        r#"Six it is. {"action":"update_layout","data":{"columns":6}}"#.to_string(),
    )]));
    let (bridge, _shutdown) = bridge(backend, BridgeConfig::default());
    let mut asking = bridge.attach_client();
    let mut watching = bridge.attach_client();
    drain(&mut asking);
    drain(&mut watching);

    bridge
        .handle_client_message(asking.id(), "six columns please")
        .await;

    let to_asking = drain(&mut asking);
    let kinds: Vec<EnvelopeType> = to_asking.iter().map(Envelope::kind).collect();
    assert_eq!(kinds, vec![EnvelopeType::LiveUpdate, EnvelopeType::ChatResponse]);
    assert_eq!(to_asking[1].data()["data"]["columns"], 6);

    let to_watching = drain(&mut watching);
    assert_eq!(to_watching.len(), 1);
    assert_eq!(to_watching[0].kind(), EnvelopeType::LiveUpdate);
}

#[tokio::test]
async fn client_view_update_is_validated_and_broadcast() {
    let (bridge, _shutdown) = bridge(Arc::new(ScriptedBackend::default()), BridgeConfig::default());
    let mut client = bridge.attach_client();
    drain(&mut client);

    bridge
        .apply_view_update("set_viewport", &json!({"viewport": "mobile"}))
        .expect("valid update");
    let updates = drain(&mut client);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].action(), Some("update_canvas"));
    assert_eq!(updates[0].data()["viewport"], "mobile");

    let err = bridge
        .apply_view_update("teleport", &json!({}))
        .expect_err("unknown action");
    assert!(matches!(err, BridgeError::InvalidUpdate(_)));
    assert!(drain(&mut client).is_empty());
}

#[tokio::test]
async fn replace_state_round_trips_and_broadcasts_full_state() {
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(ADD_BUTTON.to_string())]));
    let (bridge, _shutdown) = bridge(backend, BridgeConfig::default());
    bridge
        .handle_turn(Origin::Terminal, "add a button")
        .await
        .expect("turn");
    let snapshot = bridge.state().snapshot();
    let encoded = serde_json::to_value(&snapshot).expect("encode");

    let mut client = bridge.attach_client();
    drain(&mut client);

    let decoded = serde_json::from_value(encoded).expect("decode");
    bridge.replace_state(decoded).expect("replace");
    assert_eq!(bridge.state().snapshot(), snapshot);

    let frames = drain(&mut client);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind(), EnvelopeType::StateReplace);
    assert_eq!(frames[0].data()["components"][0]["id"], json!(snapshot.components[0].id));
}

#[tokio::test]
async fn client_view_update_on_unknown_id_is_reported_to_sender_only() {
    let (bridge, _shutdown) = bridge(Arc::new(ScriptedBackend::default()), BridgeConfig::default());
    let mut sender = bridge.attach_client();
    let mut watcher = bridge.attach_client();
    drain(&mut sender);
    drain(&mut watcher);
    let before = bridge.state().snapshot();

    bridge.handle_client_view_update(
        sender.id(),
        "remove_component",
        &json!({"id": "component-gone"}),
    );

    let replies = drain(&mut sender);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind(), EnvelopeType::ChatResponse);
    assert_eq!(replies[0].data()["error"], true);
    assert!(replies[0].data()["response"]
        .as_str()
        .expect("response text")
        .contains("component-gone"));
    assert!(drain(&mut watcher).is_empty());
    assert_eq!(bridge.state().snapshot(), before);
}

#[tokio::test]
async fn client_view_update_success_sends_no_error() {
    let (bridge, _shutdown) = bridge(Arc::new(ScriptedBackend::default()), BridgeConfig::default());
    let mut sender = bridge.attach_client();
    drain(&mut sender);

    bridge.handle_client_view_update(sender.id(), "update_layout", &json!({"columns": 3}));

    let frames = drain(&mut sender);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind(), EnvelopeType::LiveUpdate);
}
