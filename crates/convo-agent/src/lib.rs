use convo_client::BedrockClient;
use convo_config::{AgentConfig, StorageBackend};
use convo_conversation::{
    ConversationCompressor, ConversationManager, FileStorage, MemoryStorage, MetricsDelta, Session,
    SessionStorage,
};
use convo_core::{ConvoError, Item, ModelClient, Result, TokenUsage};
use convo_tools::ToolRegistry;
use convo_turn::{Turn, TurnEvent};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

/// Result of one [`Agent::chat`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub session_id: String,
    /// Assistant text of the final turn.
    pub reply: String,
    pub rounds: usize,
    pub usage: TokenUsage,
    /// True when the model still wanted tools after `max_tool_rounds` turns.
    pub hit_round_limit: bool,
}

#[derive(Default)]
struct CancelState {
    requested: AtomicBool,
    current: Mutex<Option<Turn>>,
}

/// Cancels the chat in progress, including its running turn.
#[derive(Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.state.requested.store(true, Ordering::SeqCst);
        if let Some(turn) = self.current().as_ref() {
            turn.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    fn current(&self) -> MutexGuard<'_, Option<Turn>> {
        self.state.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset(&self) {
        self.state.requested.store(false, Ordering::SeqCst);
    }

    fn begin(&self, turn: &Turn) {
        *self.current() = Some(turn.clone());
        if self.is_cancelled() {
            turn.cancel();
        }
    }

    fn end(&self) {
        *self.current() = None;
    }
}

pub struct Agent {
    config: Arc<AgentConfig>,
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    manager: tokio::sync::Mutex<ConversationManager>,
    cancel: CancelHandle,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        model: Arc<dyn ModelClient>,
        storage: Arc<dyn SessionStorage>,
        tools: ToolRegistry,
    ) -> Self {
        let compressor = ConversationCompressor::new(config.compression.clone(), Arc::clone(&model));
        let manager = ConversationManager::new(storage).with_compressor(compressor);

        Self {
            config: Arc::new(config),
            model,
            tools: Arc::new(tools),
            manager: tokio::sync::Mutex::new(manager),
            cancel: CancelHandle::default(),
        }
    }

    /// Agent talking to Bedrock, with storage chosen by the config.
    pub async fn from_config(config: AgentConfig, tools: ToolRegistry) -> Result<Self> {
        let model: Arc<dyn ModelClient> = Arc::new(BedrockClient::new(&config).await?);
        let storage = Self::storage_for(&config)?;
        info!(
            "Agent '{}' using model {} in {}",
            config.agent.name, config.agent.model, config.aws.region
        );
        Ok(Self::new(config, model, storage, tools))
    }

    pub fn storage_for(config: &AgentConfig) -> Result<Arc<dyn SessionStorage>> {
        let storage: Arc<dyn SessionStorage> = match config.storage.backend {
            StorageBackend::File => Arc::new(FileStorage::new(&config.storage.home_dir)?),
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        };
        Ok(storage)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn get_tool_registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.tools)
    }

    /// Direct access to the session manager for listing, forking and the like.
    pub async fn manager(&self) -> tokio::sync::MutexGuard<'_, ConversationManager> {
        self.manager.lock().await
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Sends `prompt` in the given session (a new one when `None`) and runs
    /// turns until the model stops calling tools or `max_tool_rounds` is
    /// reached. Every event is passed to `on_event`.
    ///
    /// The session is saved even when a turn fails or is cancelled; only
    /// completed tool-call/result pairs are appended.
    #[instrument(skip(self, prompt, on_event))]
    pub async fn chat<F>(&self, session_id: Option<&str>, prompt: &str, mut on_event: F) -> Result<ChatOutcome>
    where
        F: FnMut(&TurnEvent) + Send,
    {
        self.cancel.reset();
        let mut session = self.open_session(session_id).await?;
        session.add_items([Item::user(prompt)]);

        let max_rounds = self.config.agent.max_tool_rounds.max(1);
        let system_prompt = self.config.agent.get_system_prompt();
        let mut usage = TokenUsage::default();
        let mut reply = String::new();
        let mut rounds = 0;
        let mut hit_round_limit = false;

        loop {
            rounds += 1;
            let turn = Turn::new(
                session.id(),
                session.context_items(),
                Arc::clone(&self.model),
                Arc::clone(&self.tools),
            )
            .with_system_prompt(system_prompt.clone());
            debug!("Round {} of session {} runs turn {}", rounds, session.id(), turn.id());

            self.cancel.begin(&turn);
            let mut should_continue = false;
            let mut failure = None;
            {
                let mut events = turn.execute();
                while let Some(event) = events.next().await {
                    match event {
                        Ok(event) => {
                            if let TurnEvent::TurnComplete { should_continue: more } = event {
                                should_continue = more;
                            }
                            on_event(&event);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
            self.cancel.end();

            session.add_items(turn.output_items());
            if let Some(turn_usage) = turn.usage() {
                session.add_metrics(MetricsDelta::from(&turn_usage));
                usage.prompt_tokens += turn_usage.prompt_tokens;
                usage.completion_tokens += turn_usage.completion_tokens;
                usage.total_tokens += turn_usage.total_tokens;
            }

            if let Some(e) = failure {
                warn!("Turn {} ended with error: {}", turn.id(), e);
                self.manager.lock().await.save_session(&mut session).await?;
                return Err(e);
            }

            let content = turn.content();
            if !content.is_empty() {
                reply = content;
            }

            if !should_continue {
                break;
            }
            if rounds >= max_rounds {
                warn!("Maximum tool rounds ({}) reached", max_rounds);
                hit_round_limit = true;
                break;
            }
            if self.cancel.is_cancelled() {
                self.manager.lock().await.save_session(&mut session).await?;
                return Err(ConvoError::TurnCancelled(turn.id().to_string()));
            }
        }

        self.manager.lock().await.save_session(&mut session).await?;
        info!(
            "Chat in session {} finished after {} rounds ({} tokens)",
            session.id(),
            rounds,
            usage.total_tokens
        );

        Ok(ChatOutcome {
            session_id: session.id().to_string(),
            reply,
            rounds,
            usage,
            hit_round_limit,
        })
    }

    async fn open_session(&self, session_id: Option<&str>) -> Result<Session> {
        let mut manager = self.manager.lock().await;
        match session_id {
            Some(id) => manager
                .get_session(id)
                .await?
                .ok_or_else(|| ConvoError::NotFound(id.to_string())),
            None => manager.create_session(None).await,
        }
    }
}
