use async_trait::async_trait;
use convo_agent::Agent;
use convo_config::AgentConfig;
use convo_conversation::{FileStorage, MemoryStorage, SessionStorage};
use convo_core::{
    ChunkStream, ConvoError, Item, ModelClient, ModelRequest, Result, StreamChunk, TokenUsage,
};
use convo_tools::{Tool, ToolContext, ToolRegistry};
use convo_turn::TurnEvent;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

enum Reply {
    Text(&'static str),
    Call(&'static str, Value),
    Hang(&'static str),
    Fail(&'static str),
}

/// Plays back one reply per request and keeps every request it saw.
struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn done(prompt_tokens: u64) -> Result<StreamChunk> {
    Ok(StreamChunk::Done {
        finish_reason: "end_turn".into(),
        usage: Some(TokenUsage {
            prompt_tokens,
            completion_tokens: 5,
            total_tokens: prompt_tokens + 5,
        }),
    })
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn stream(&self, request: ModelRequest, _cancel: CancellationToken) -> Result<ChunkStream> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ConvoError::ModelError("no scripted reply left".into()))?;

        let chunks = match reply {
            Reply::Text(text) => stream::iter(vec![
                Ok(StreamChunk::Content { delta: text.into() }),
                done(100),
            ])
            .boxed(),
            Reply::Call(id, params) => stream::iter(vec![
                Ok(StreamChunk::FunctionCall {
                    id: id.into(),
                    name: "add".into(),
                    params,
                }),
                done(50),
            ])
            .boxed(),
            Reply::Hang(text) => stream::iter(vec![Ok(StreamChunk::Content { delta: text.into() })])
                .chain(stream::pending())
                .boxed(),
            Reply::Fail(message) => stream::iter(vec![Err(ConvoError::ModelError(message.into()))]).boxed(),
        };
        Ok(chunks)
    }
}

struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Adds two integers"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
            "required": ["a", "b"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let a = args["a"].as_i64().unwrap_or_default();
        let b = args["b"].as_i64().unwrap_or_default();
        Ok(json!({ "sum": a + b }))
    }
}

fn tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(AddTool);
    registry
}

fn agent_with(config: AgentConfig, model: Arc<ScriptedModel>, storage: Arc<dyn SessionStorage>) -> Agent {
    Agent::new(config, model, storage, tools())
}

fn agent(model: Arc<ScriptedModel>) -> (Agent, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    (agent_with(AgentConfig::default(), model, storage.clone()), storage)
}

#[tokio::test]
async fn test_plain_reply_is_saved_with_metrics() {
    let model = ScriptedModel::new(vec![Reply::Text("Hi there!")]);
    let (agent, storage) = agent(model.clone());

    let mut events = Vec::new();
    let outcome = agent
        .chat(None, "hello", |event| events.push(event.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.reply, "Hi there!");
    assert_eq!(outcome.rounds, 1);
    assert!(!outcome.hit_round_limit);
    assert_eq!(events.first(), Some(&TurnEvent::LlmStreamStart));
    assert_eq!(
        events.last(),
        Some(&TurnEvent::TurnComplete {
            should_continue: false
        })
    );

    let stored = storage.load(&outcome.session_id).await.unwrap().unwrap();
    assert_eq!(stored.items(), &[Item::user("hello"), Item::assistant("Hi there!")]);
    assert_eq!(stored.metrics().execution_count, 1);
    assert_eq!(stored.metrics().total_prompt_tokens, 100);
    assert_eq!(stored.metrics().total_tokens_used, 105);

    let request = &model.requests()[0];
    assert_eq!(request.tools.len(), 1);
    assert!(request.system_prompt.is_some());
}

#[tokio::test]
async fn test_tool_round_feeds_result_back() {
    let model = ScriptedModel::new(vec![
        Reply::Call("call-1", json!({"a": 2, "b": 3})),
        Reply::Text("The sum is 5."),
    ]);
    let (agent, storage) = agent(model.clone());

    let outcome = agent.chat(None, "what is 2 + 3?", |_| {}).await.unwrap();
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.reply, "The sum is 5.");
    assert_eq!(outcome.usage.prompt_tokens, 150);

    let stored = storage.load(&outcome.session_id).await.unwrap().unwrap();
    assert_eq!(
        stored.items(),
        &[
            Item::user("what is 2 + 3?"),
            Item::tool_call("call-1", "add", json!({"a": 2, "b": 3})),
            Item::tool_result("call-1", "add", json!({"sum": 5})),
            Item::assistant("The sum is 5."),
        ]
    );
    assert_eq!(stored.metrics().execution_count, 2);

    let second_request = &model.requests()[1];
    assert_eq!(
        second_request.items.last(),
        Some(&Item::tool_result("call-1", "add", json!({"sum": 5})))
    );
}

#[tokio::test]
async fn test_round_limit_stops_tool_loop() {
    let model = ScriptedModel::new(vec![
        Reply::Call("c1", json!({"a": 1, "b": 1})),
        Reply::Call("c2", json!({"a": 2, "b": 2})),
        Reply::Call("c3", json!({"a": 3, "b": 3})),
    ]);
    let mut config = AgentConfig::default();
    config.agent.max_tool_rounds = 2;
    let storage = Arc::new(MemoryStorage::new());
    let agent = agent_with(config, model.clone(), storage.clone());

    let outcome = agent.chat(None, "keep adding", |_| {}).await.unwrap();
    assert!(outcome.hit_round_limit);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(model.requests().len(), 2);

    let stored = storage.load(&outcome.session_id).await.unwrap().unwrap();
    assert_eq!(stored.item_count(), 5);
}

#[tokio::test]
async fn test_model_failure_still_saves_prompt() {
    let model = ScriptedModel::new(vec![Reply::Fail("throttled")]);
    let (agent, _storage) = agent(model);

    let err = agent.chat(None, "hello?", |_| {}).await.unwrap_err();
    assert!(matches!(err, ConvoError::ModelError(_)));

    let mut manager = agent.manager().await;
    let sessions = manager.list_sessions(Default::default()).await.unwrap();
    assert_eq!(sessions.len(), 1);
    let session = manager.get_session(&sessions[0].id).await.unwrap().unwrap();
    assert_eq!(session.items(), &[Item::user("hello?")]);
}

#[tokio::test]
async fn test_cancel_handle_stops_running_turn() {
    let model = ScriptedModel::new(vec![Reply::Hang("Thinking about")]);
    let (agent, _storage) = agent(model);
    let handle = agent.cancel_handle();

    let err = agent
        .chat(None, "long question", |event| {
            if matches!(event, TurnEvent::ContentDelta { .. }) {
                handle.cancel();
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ConvoError::TurnCancelled(_)));
    assert!(agent.cancel_handle().is_cancelled());
}

#[tokio::test]
async fn test_resumed_session_is_compressed_on_save() {
    let model = ScriptedModel::new(vec![
        Reply::Text("first answer"),
        Reply::Text("second answer"),
        Reply::Text("User asked two questions."),
        Reply::Text("third answer"),
    ]);
    let mut config = AgentConfig::default();
    config.compression.summarize_after_items = 3;
    config.compression.keep_recent_items = 2;
    config.compression.protect_recent_messages = None;
    let storage = Arc::new(MemoryStorage::new());
    let agent = agent_with(config, model.clone(), storage.clone());

    let first = agent.chat(None, "first question", |_| {}).await.unwrap();
    let second = agent
        .chat(Some(&first.session_id), "second question", |_| {})
        .await
        .unwrap();
    assert_eq!(second.session_id, first.session_id);

    let stored = storage.load(&first.session_id).await.unwrap().unwrap();
    assert_eq!(
        stored.items(),
        &[Item::user("second question"), Item::assistant("second answer")]
    );
    assert_eq!(
        stored.metadata().last_summary.as_deref(),
        Some("User asked two questions.")
    );

    agent
        .chat(Some(&first.session_id), "third question", |_| {})
        .await
        .unwrap();
    let third_request = &model.requests()[3];
    assert_eq!(
        third_request.items[0],
        Item::system("Summary of the earlier conversation:\nUser asked two questions.")
    );
}

#[tokio::test]
async fn test_default_compression_keeps_tool_pairs_together() {
    let model = ScriptedModel::new(vec![Reply::Text("Earlier small talk.")]);
    let (agent, storage) = agent(model.clone());

    let mut items: Vec<Item> = (0..12)
        .map(|i| {
            if i % 2 == 0 {
                Item::user(format!("question {i}"))
            } else {
                Item::assistant(format!("answer {i}"))
            }
        })
        .collect();
    items.push(Item::assistant("Let me add those."));
    items.push(Item::tool_call("c1", "add", json!({"a": 1, "b": 2})));
    items.push(Item::tool_result("c1", "add", json!({"sum": 3})));
    for i in 15..21 {
        items.push(if i % 2 == 1 {
            Item::user(format!("question {i}"))
        } else {
            Item::assistant(format!("answer {i}"))
        });
    }
    assert_eq!(items.len(), 21);

    let mut manager = agent.manager().await;
    let mut session = manager.create_session(None).await.unwrap();
    session.add_items(items.clone());
    manager.save_session(&mut session).await.unwrap();
    drop(manager);

    let stored = storage.load(session.id()).await.unwrap().unwrap();
    assert_eq!(stored.items(), &items[12..]);
    assert_eq!(stored.metadata().last_summary.as_deref(), Some("Earlier small talk."));
    assert_eq!(model.requests().len(), 1);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let model = ScriptedModel::new(vec![]);
    let (agent, _storage) = agent(model);

    let err = agent.chat(Some("nope"), "hi", |_| {}).await.unwrap_err();
    assert!(matches!(err, ConvoError::NotFound(id) if id == "nope"));
}

#[tokio::test]
async fn test_file_backed_sessions_survive_a_new_agent() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let storage: Arc<dyn SessionStorage> = Arc::new(FileStorage::with_workspace_dir(temp_dir.path()));

    let model = ScriptedModel::new(vec![Reply::Text("noted"), Reply::Text("you said remember")]);
    let first_agent = agent_with(AgentConfig::default(), model.clone(), storage.clone());
    let outcome = first_agent.chat(None, "remember this", |_| {}).await.unwrap();

    let second_agent = agent_with(AgentConfig::default(), model, storage);
    let resumed = second_agent
        .chat(Some(&outcome.session_id), "what did I say?", |_| {})
        .await
        .unwrap();
    assert_eq!(resumed.reply, "you said remember");

    let session = second_agent
        .manager()
        .await
        .get_session(&outcome.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.item_count(), 4);
}
