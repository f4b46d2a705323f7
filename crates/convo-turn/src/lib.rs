use async_stream::stream;
use convo_core::{ConvoError, Item, ModelClient, ModelRequest, Result, StreamChunk, TokenUsage};
use convo_tools::{ToolContext, ToolRegistry};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream};
use futures::StreamExt;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Init,
    LlmCalling,
    ToolExecuting,
    Completed,
    Failed,
    Cancelled,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Completed | TurnState::Failed | TurnState::Cancelled)
    }
}

/// Lifecycle events yielded by [`Turn::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    LlmStreamStart,
    ContentDelta {
        delta: String,
    },
    ThinkingDelta {
        delta: String,
    },
    ToolCallPending {
        call_id: String,
        name: String,
        params: Value,
    },
    ToolCallStart {
        call_id: String,
        name: String,
    },
    ToolCallComplete {
        call_id: String,
        name: String,
        result: Value,
        duration: Duration,
    },
    ToolCallError {
        call_id: String,
        name: String,
        error: String,
    },
    LlmStreamEnd {
        usage: Option<TokenUsage>,
        finish_reason: String,
    },
    TurnComplete {
        should_continue: bool,
    },
}

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone)]
struct PendingCall {
    call_id: String,
    name: String,
    params: Value,
}

struct TurnInner {
    id: String,
    session_id: String,
    request: ModelRequest,
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    cancel: CancellationToken,
    started: AtomicBool,
    should_continue: AtomicBool,
    state: Mutex<TurnState>,
    cleanups: Mutex<Vec<CleanupFn>>,
    content: Mutex<String>,
    tool_items: Mutex<Vec<Item>>,
    usage: Mutex<Option<TokenUsage>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TurnInner {
    fn state(&self) -> TurnState {
        *lock(&self.state)
    }

    fn set_state(&self, state: TurnState) {
        debug!("Turn {} -> {:?}", self.id, state);
        *lock(&self.state) = state;
    }

    fn cancelled_error(&self) -> ConvoError {
        ConvoError::TurnCancelled(self.id.clone())
    }

    fn record_tool(&self, call: PendingCall, output: Value) {
        let mut items = lock(&self.tool_items);
        items.push(Item::tool_call(call.call_id.clone(), call.name.clone(), call.params));
        items.push(Item::tool_result(call.call_id, call.name, output));
    }

    /// Moves to a terminal state and drains the cleanup callbacks.
    async fn finish(&self, state: TurnState) {
        self.set_state(state);
        let callbacks = std::mem::take(&mut *lock(&self.cleanups));
        for callback in callbacks {
            callback().await;
        }
    }
}

/// One model stream plus the tool calls it requests.
///
/// A turn is executed at most once. It never loops on its own: when tools
/// ran, the final `TurnComplete` carries `should_continue: true` and the host
/// starts a follow-up turn with the tool results appended.
#[derive(Clone)]
pub struct Turn {
    inner: Arc<TurnInner>,
}

impl Turn {
    pub fn new(
        session_id: impl Into<String>,
        items: Vec<Item>,
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let request = ModelRequest::new(items).with_tools(tools.get_all_declarations());
        Self::from_request(session_id, request, model, tools)
    }

    /// Turn over a prepared request; its tool declarations are used as-is.
    pub fn from_request(
        session_id: impl Into<String>,
        request: ModelRequest,
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(TurnInner {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.into(),
                request,
                model,
                tools,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                should_continue: AtomicBool::new(false),
                state: Mutex::new(TurnState::Init),
                cleanups: Mutex::new(Vec::new()),
                content: Mutex::new(String::new()),
                tool_items: Mutex::new(Vec::new()),
                usage: Mutex::new(None),
            }),
        }
    }

    /// Must be called before `execute`.
    pub fn with_system_prompt(self, system_prompt: impl Into<String>) -> Self {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => {
                warn!("System prompt ignored for shared turn {}", shared.id);
                return Self { inner: shared };
            }
        };
        inner.request.system_prompt = Some(system_prompt.into());
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn request(&self) -> &ModelRequest {
        &self.inner.request
    }

    pub fn get_state(&self) -> TurnState {
        self.inner.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Assistant text streamed so far.
    pub fn content(&self) -> String {
        lock(&self.inner.content).clone()
    }

    /// Usage reported by the model's final chunk, if any.
    pub fn usage(&self) -> Option<TokenUsage> {
        *lock(&self.inner.usage)
    }

    /// Items this turn adds to the log: the assistant text followed by each
    /// executed call and its result. Failed calls carry `{"error": ...}`.
    pub fn output_items(&self) -> Vec<Item> {
        let mut items = Vec::new();
        let content = self.content();
        if !content.is_empty() {
            items.push(Item::assistant(content));
        }
        items.extend(lock(&self.inner.tool_items).iter().cloned());
        items
    }

    /// Requests cancellation. Has no effect once the turn is terminal.
    pub fn cancel(&self) {
        let state = self.get_state();
        if state.is_terminal() {
            debug!("Ignoring cancel for turn {} in state {:?}", self.inner.id, state);
            return;
        }
        info!("Cancelling turn {}", self.inner.id);
        self.inner.cancel.cancel();
    }

    /// Runs `callback` once the turn reaches a terminal state, or right away
    /// if it already has.
    pub fn on_cleanup<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut cleanups = lock(&self.inner.cleanups);
        if self.get_state().is_terminal() {
            drop(cleanups);
            callback();
            return;
        }
        cleanups.push(Box::new(move || {
            callback();
            Box::pin(async {})
        }));
    }

    /// Async variant of [`Turn::on_cleanup`]. When the turn is already
    /// terminal the future is spawned on the current runtime.
    pub fn on_cleanup_async<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut cleanups = lock(&self.inner.cleanups);
        if self.get_state().is_terminal() {
            drop(cleanups);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(callback());
                }
                Err(_) => warn!(
                    "No runtime to run cleanup for finished turn {}",
                    self.inner.id
                ),
            }
            return;
        }
        cleanups.push(Box::new(move || Box::pin(callback())));
    }

    /// Lazily runs the turn. The returned stream ends after `TurnComplete`
    /// or after the first error; cleanup callbacks have run by the time
    /// either is yielded. A second call yields a single
    /// `TurnAlreadyExecuted` error.
    pub fn execute(&self) -> BoxStream<'static, Result<TurnEvent>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            let id = self.inner.id.clone();
            return stream::once(async move { Err(ConvoError::TurnAlreadyExecuted(id)) }).boxed();
        }

        let inner = Arc::clone(&self.inner);
        info!(
            "Executing turn {} for session {} with {} items and {} tools",
            inner.id,
            inner.session_id,
            inner.request.items.len(),
            inner.request.tools.len()
        );

        Box::pin(stream! {
            let mut events = Box::pin(turn_events(Arc::clone(&inner)));
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        yield Ok(event);
                    }
                    Err(err) => {
                        let state = if matches!(err, ConvoError::TurnCancelled(_)) {
                            info!("Turn {} cancelled", inner.id);
                            TurnState::Cancelled
                        } else {
                            error!("Turn {} failed: {}", inner.id, err);
                            TurnState::Failed
                        };
                        inner.finish(state).await;
                        yield Err(err);
                        return;
                    }
                }
            }

            inner.finish(TurnState::Completed).await;
            let should_continue = inner.should_continue.load(Ordering::SeqCst);
            debug!("Turn {} completed, should_continue={}", inner.id, should_continue);
            yield Ok(TurnEvent::TurnComplete { should_continue });
        })
    }
}

/// Everything up to and including `LlmStreamEnd`. The first error ends the
/// stream; the caller owns the terminal transition.
fn turn_events(inner: Arc<TurnInner>) -> impl Stream<Item = Result<TurnEvent>> {
    stream! {
        if inner.cancel.is_cancelled() {
            yield Err(inner.cancelled_error());
            return;
        }

        inner.set_state(TurnState::LlmCalling);
        yield Ok(TurnEvent::LlmStreamStart);

        let opened = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => None,
            opened = inner.model.stream(inner.request.clone(), inner.cancel.clone()) => Some(opened),
        };
        let mut chunks = match opened {
            None => {
                yield Err(inner.cancelled_error());
                return;
            }
            Some(Err(err)) => {
                yield Err(err);
                return;
            }
            Some(Ok(chunks)) => chunks,
        };

        let mut pending: Vec<PendingCall> = Vec::new();
        let mut usage = None;
        let mut finish_reason = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => None,
                next = chunks.next() => Some(next),
            };
            let chunk = match next {
                None => {
                    yield Err(inner.cancelled_error());
                    return;
                }
                Some(None) => break,
                Some(Some(Err(err))) => {
                    yield Err(err);
                    return;
                }
                Some(Some(Ok(chunk))) => chunk,
            };

            match chunk {
                StreamChunk::Content { delta } => {
                    lock(&inner.content).push_str(&delta);
                    yield Ok(TurnEvent::ContentDelta { delta });
                }
                StreamChunk::Thinking { delta } => {
                    yield Ok(TurnEvent::ThinkingDelta { delta });
                }
                StreamChunk::FunctionCall { id, name, params } => {
                    debug!("Turn {} received tool call {} ({})", inner.id, name, id);
                    pending.push(PendingCall {
                        call_id: id.clone(),
                        name: name.clone(),
                        params: params.clone(),
                    });
                    yield Ok(TurnEvent::ToolCallPending { call_id: id, name, params });
                }
                StreamChunk::Done { finish_reason: reason, usage: reported } => {
                    finish_reason = reason;
                    usage = reported;
                }
            }
        }
        drop(chunks);
        *lock(&inner.usage) = usage;

        let should_continue = !pending.is_empty();
        if should_continue {
            inner.set_state(TurnState::ToolExecuting);
        }

        for call in pending {
            if inner.cancel.is_cancelled() {
                yield Err(inner.cancelled_error());
                return;
            }

            yield Ok(TurnEvent::ToolCallStart {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
            });

            let ctx = ToolContext {
                call_id: call.call_id.clone(),
                turn_id: inner.id.clone(),
                session_id: inner.session_id.clone(),
                cancel: inner.cancel.clone(),
            };
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => None,
                result = inner.tools.execute(&call.name, call.params.clone(), &ctx) => Some(result),
            };
            let duration = started.elapsed();

            match outcome {
                None => {
                    yield Err(inner.cancelled_error());
                    return;
                }
                Some(Ok(result)) => {
                    debug!("Tool {} finished in {:?}", call.name, duration);
                    let event = TurnEvent::ToolCallComplete {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                        result: result.clone(),
                        duration,
                    };
                    inner.record_tool(call, result);
                    yield Ok(event);
                }
                Some(Err(err)) => {
                    warn!("Tool {} failed: {}", call.name, err);
                    let error = err.to_string();
                    let event = TurnEvent::ToolCallError {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                        error: error.clone(),
                    };
                    inner.record_tool(call, json!({ "error": error }));
                    yield Ok(event);
                }
            }
        }

        inner.should_continue.store(should_continue, Ordering::SeqCst);
        yield Ok(TurnEvent::LlmStreamEnd { usage, finish_reason });
    }
}
