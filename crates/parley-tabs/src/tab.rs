//! A single chat tab
//!
//! Each tab owns its session, its provider client and at most one in-flight
//! request. Tabs share nothing with each other except the provider factory.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use parley_providers::{
    ChatRequest, ChunkStream, LlmProvider, Message, ProviderError, ProviderFactory, StreamChunk,
    TokenUsage, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};
use parley_session::Session;

use crate::error::TabError;
use crate::info::{TabInfo, TabSnapshot};
use crate::state::StreamState;
use crate::Result;

/// Request settings applied to newly created tabs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TabDefaults {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for TabDefaults {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

#[derive(Debug, Clone)]
struct TabFields {
    label: String,
    provider_id: String,
    model_id: String,
    max_tokens: u32,
    temperature: f32,
    order: usize,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    key_alias: Option<String>,
    /// Mirrors of the session counters
    message_count: usize,
    total_tokens: u64,
}

#[derive(Debug, Default)]
struct InFlight {
    state: StreamState,
    handle: Option<CancellationToken>,
    /// Bumped for every request; cleanup only applies to the current one
    generation: u64,
}

impl InFlight {
    fn transition_to(&mut self, tab_id: &str, new_state: StreamState) {
        debug_assert!(
            self.state.can_transition_to(new_state),
            "invalid stream transition {} -> {}",
            self.state,
            new_state
        );

        tracing::debug!(
            tab_id = %tab_id,
            from = %self.state,
            to = %new_state,
            "Stream state transition"
        );
        self.state = new_state;
    }
}

pub struct Tab {
    id: String,
    factory: Arc<ProviderFactory>,
    fields: RwLock<TabFields>,
    session: Session,
    provider: RwLock<Option<Arc<dyn LlmProvider>>>,
    inflight: Mutex<InFlight>,
}

impl Tab {
    /// Create a tab on the provider's default model. The client is acquired
    /// separately by [`Tab::initialize`].
    pub fn new(
        factory: Arc<ProviderFactory>,
        provider_id: &str,
        label: Option<&str>,
        defaults: &TabDefaults,
    ) -> Result<Self> {
        if provider_id.trim().is_empty() {
            return Err(TabError::InvalidArgument("provider id is empty".to_string()));
        }

        let info = factory
            .provider_info(provider_id)
            .ok_or_else(|| TabError::InvalidArgument(format!("unknown provider '{provider_id}'")))?;
        let model_id = info
            .default_model()
            .map(|m| m.model_id.clone())
            .ok_or_else(|| {
                TabError::InvalidArgument(format!("provider '{provider_id}' has no models"))
            })?;

        let now = Utc::now();
        let fields = TabFields {
            label: label
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} - New", info.display_name)),
            provider_id: info.provider_id,
            model_id,
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            order: 0,
            created_at: now,
            last_active_at: now,
            key_alias: None,
            message_count: 0,
            total_tokens: 0,
        };

        Ok(Self::assemble(
            Uuid::new_v4().to_string(),
            factory,
            fields,
            Session::new(),
        ))
    }

    /// Rebuild a persisted tab. It still needs [`Tab::initialize`].
    pub fn from_snapshot(
        factory: Arc<ProviderFactory>,
        snapshot: TabSnapshot,
        defaults: &TabDefaults,
    ) -> Self {
        let session = Session::with_id(snapshot.session.session_id.clone());
        session.import(snapshot.session);
        session.set_context_enabled(snapshot.context_enabled);

        let fields = TabFields {
            label: snapshot.label,
            provider_id: snapshot.provider_id,
            model_id: snapshot.model_id,
            max_tokens: snapshot.max_tokens,
            temperature: defaults.temperature,
            order: snapshot.order,
            created_at: snapshot.created_at,
            last_active_at: snapshot.last_active_at,
            key_alias: snapshot.key_alias,
            message_count: session.message_count(),
            total_tokens: session.total_tokens(),
        };

        Self::assemble(snapshot.tab_id, factory, fields, session)
    }

    fn assemble(
        id: String,
        factory: Arc<ProviderFactory>,
        fields: TabFields,
        session: Session,
    ) -> Self {
        Self {
            id,
            factory,
            fields: RwLock::new(fields),
            session,
            provider: RwLock::new(None),
            inflight: Mutex::new(InFlight::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> String {
        self.fields.read().label.clone()
    }

    pub fn provider_id(&self) -> String {
        self.fields.read().provider_id.clone()
    }

    pub fn model_id(&self) -> String {
        self.fields.read().model_id.clone()
    }

    pub fn order(&self) -> usize {
        self.fields.read().order
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stream_state(&self) -> StreamState {
        self.inflight.lock().state
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_state().is_streaming()
    }

    pub fn is_initialized(&self) -> bool {
        self.provider.read().is_some()
    }

    pub fn provider(&self) -> Option<Arc<dyn LlmProvider>> {
        self.provider.read().clone()
    }

    /// Acquire a provider client from the factory.
    ///
    /// A model the new client does not offer is replaced by its default.
    pub async fn initialize(&self, key_alias: Option<&str>) -> Result<()> {
        let provider_id = self.fields.read().provider_id.clone();
        let provider = self.factory.create(&provider_id, key_alias).await?;

        {
            let mut fields = self.fields.write();
            if provider.model(&fields.model_id).is_none() {
                if let Some(default) = provider.default_model() {
                    tracing::warn!(
                        tab_id = %self.id,
                        model = %fields.model_id,
                        fallback = %default.model_id,
                        "Model not offered by provider, using default"
                    );
                    fields.model_id = default.model_id.clone();
                }
            }
            fields.key_alias = key_alias.map(str::to_string);
        }

        *self.provider.write() = Some(provider);
        tracing::debug!(tab_id = %self.id, provider = %provider_id, "Tab initialized");
        Ok(())
    }

    /// Send a user message and relay the response.
    ///
    /// Any request still in flight is cancelled first. The returned stream
    /// yields text chunks and then the final chunk, after which the turn is
    /// recorded in the session. Cancellation through `cancel`, a later send
    /// or [`Tab::cancel_current`] ends the stream with
    /// [`ProviderError::Cancelled`] and records no reply.
    pub async fn send(
        self: &Arc<Self>,
        text: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<ChunkStream> {
        if text.trim().is_empty() {
            return Err(TabError::InvalidArgument("message text is empty".to_string()));
        }
        let provider = self
            .provider()
            .ok_or_else(|| TabError::NotInitialized(self.id.clone()))?;

        let (model_id, max_tokens, temperature) = {
            let fields = self.fields.read();
            (fields.model_id.clone(), fields.max_tokens, fields.temperature)
        };

        let user_message = Message::user(text, provider.estimate_tokens(text));
        let request = ChatRequest::with_context(
            model_id.clone(),
            self.session.context(),
            user_message.clone(),
        )
        .max_tokens(max_tokens)
        .temperature(temperature);

        let estimated_input = provider.estimate_request_tokens(&request);
        if let Some(model) = provider.model(&model_id) {
            if estimated_input > model.context_window {
                return Err(ProviderError::ContextTooLong {
                    model: model_id,
                    tokens: estimated_input,
                    max: model.context_window,
                }
                .into());
            }
        }

        let (token, generation) = self.begin_request(cancel);
        let guard = RequestGuard {
            tab: Arc::clone(self),
            generation,
        };

        self.session.append(user_message);
        self.sync_counters();

        tracing::info!(
            tab_id = %self.id,
            model = %model_id,
            estimated_input,
            "Sending message"
        );

        let inner = provider.stream(&request, token.clone()).await?;

        Ok(relay(Relay {
            inner,
            token,
            guard: Some(guard),
            provider,
            model_id,
            estimated_input,
            text: String::new(),
        }))
    }

    /// Claim the in-flight slot, superseding whatever held it
    fn begin_request(&self, caller: Option<&CancellationToken>) -> (CancellationToken, u64) {
        let mut inflight = self.inflight.lock();

        if let Some(previous) = inflight.handle.take() {
            previous.cancel();
            if inflight.state.is_streaming() {
                inflight.transition_to(&self.id, StreamState::Cancelled);
            }
            tracing::debug!(tab_id = %self.id, "Superseding in-flight request");
            inflight.transition_to(&self.id, StreamState::Idle);
        }

        let token = caller.map(CancellationToken::child_token).unwrap_or_default();
        inflight.generation += 1;
        inflight.handle = Some(token.clone());
        inflight.transition_to(&self.id, StreamState::Streaming);

        (token, inflight.generation)
    }

    /// Release the in-flight slot if `generation` still owns it
    fn finish_request(&self, generation: u64) {
        let mut inflight = self.inflight.lock();
        if inflight.generation != generation {
            return;
        }

        inflight.handle = None;
        if inflight.state.is_busy() {
            inflight.transition_to(&self.id, StreamState::Idle);
        }
    }

    /// Record the reply of request `generation`.
    ///
    /// Returns false, recording nothing, once the request was cancelled or
    /// superseded. The in-flight lock is held while the session is updated
    /// so a concurrent cancel, clear or send cannot interleave.
    fn complete_turn(
        &self,
        generation: u64,
        relay: &mut Relay,
        reported: Option<TokenUsage>,
    ) -> bool {
        let inflight = self.inflight.lock();
        if inflight.generation != generation
            || !inflight.state.is_streaming()
            || relay.token.is_cancelled()
        {
            tracing::debug!(tab_id = %self.id, "Reply arrived after cancellation, discarded");
            return false;
        }

        let text = std::mem::take(&mut relay.text);
        let usage = reported.unwrap_or_else(|| {
            TokenUsage::new(relay.estimated_input, relay.provider.estimate_tokens(&text))
        });

        self.session.append(Message::assistant(
            text,
            Some(relay.model_id.clone()),
            usage.output_tokens,
        ));
        self.session
            .reconcile_last_turn(usage.input_tokens, usage.output_tokens);

        self.sync_counters();
        self.fields.write().last_active_at = Utc::now();
        drop(inflight);

        tracing::info!(
            tab_id = %self.id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            estimated = reported.is_none(),
            "Turn completed"
        );
        true
    }

    /// Cancel the request in flight. Returns whether one was running.
    pub fn cancel_current(&self) -> bool {
        let mut inflight = self.inflight.lock();
        if !inflight.state.is_streaming() {
            return false;
        }

        if let Some(handle) = &inflight.handle {
            handle.cancel();
        }
        inflight.transition_to(&self.id, StreamState::Cancelled);
        tracing::info!(tab_id = %self.id, "Cancelled current request");
        true
    }

    pub fn change_model(&self, model_id: &str) -> Result<()> {
        let known = match self.provider() {
            Some(provider) => provider.model(model_id).is_some(),
            None => self
                .factory
                .provider_info(&self.provider_id())
                .is_some_and(|info| info.model(model_id).is_some()),
        };
        if !known {
            return Err(TabError::InvalidArgument(format!(
                "unknown model '{model_id}'"
            )));
        }

        self.fields.write().model_id = model_id.to_string();
        tracing::info!(tab_id = %self.id, model = %model_id, "Changed model");
        Ok(())
    }

    /// Switch backends. History is cleared since it belongs to the old one.
    pub async fn change_provider(&self, provider_id: &str, key_alias: Option<&str>) -> Result<()> {
        if provider_id.trim().is_empty() {
            return Err(TabError::InvalidArgument("provider id is empty".to_string()));
        }
        let info = self
            .factory
            .provider_info(provider_id)
            .ok_or_else(|| TabError::InvalidArgument(format!("unknown provider '{provider_id}'")))?;
        let model_id = info
            .default_model()
            .map(|m| m.model_id.clone())
            .ok_or_else(|| {
                TabError::InvalidArgument(format!("provider '{provider_id}' has no models"))
            })?;

        self.cancel_current();
        self.provider.write().take();
        self.session.clear();

        {
            let mut fields = self.fields.write();
            fields.provider_id = info.provider_id.clone();
            fields.model_id = model_id;
            fields.key_alias = key_alias.map(str::to_string);
            fields.message_count = 0;
            fields.total_tokens = 0;
        }

        let provider = self.factory.create(&info.provider_id, key_alias).await?;
        *self.provider.write() = Some(provider);

        tracing::info!(tab_id = %self.id, provider = %info.provider_id, "Changed provider");
        Ok(())
    }

    pub fn set_context_enabled(&self, enabled: bool) {
        self.session.set_context_enabled(enabled);
    }

    pub fn set_max_tokens(&self, max_tokens: u32) -> Result<()> {
        if max_tokens == 0 {
            return Err(TabError::InvalidArgument(
                "max tokens must be positive".to_string(),
            ));
        }
        self.fields.write().max_tokens = max_tokens;
        Ok(())
    }

    /// Drop the conversation. A reply still streaming is cancelled so it
    /// cannot land in the emptied session.
    pub fn clear_history(&self) {
        self.cancel_current();
        self.session.clear();
        self.sync_counters();
        tracing::info!(tab_id = %self.id, "Cleared history");
    }

    pub fn info(&self) -> TabInfo {
        let stream_state = self.stream_state();
        let fields = self.fields.read();
        TabInfo {
            id: self.id.clone(),
            label: fields.label.clone(),
            provider_id: fields.provider_id.clone(),
            model_id: fields.model_id.clone(),
            context_enabled: self.session.context_enabled(),
            max_tokens: fields.max_tokens,
            order: fields.order,
            created_at: fields.created_at,
            last_active_at: fields.last_active_at,
            stream_state,
            is_streaming: stream_state.is_streaming(),
            message_count: fields.message_count,
            total_tokens: fields.total_tokens,
        }
    }

    pub fn export_state(&self) -> TabSnapshot {
        let fields = self.fields.read();
        TabSnapshot {
            tab_id: self.id.clone(),
            label: fields.label.clone(),
            provider_id: fields.provider_id.clone(),
            model_id: fields.model_id.clone(),
            context_enabled: self.session.context_enabled(),
            max_tokens: fields.max_tokens,
            order: fields.order,
            created_at: fields.created_at,
            last_active_at: fields.last_active_at,
            key_alias: fields.key_alias.clone(),
            session: self.session.export(),
        }
    }

    /// Apply persisted settings and history. Identity and provider stay.
    pub fn import_state(&self, snapshot: TabSnapshot) {
        self.cancel_current();
        self.session.import(snapshot.session);
        self.session.set_context_enabled(snapshot.context_enabled);

        {
            let mut fields = self.fields.write();
            fields.label = snapshot.label;
            fields.model_id = snapshot.model_id;
            fields.max_tokens = snapshot.max_tokens;
            fields.order = snapshot.order;
        }
        self.sync_counters();
    }

    /// Cancel any request and drop the provider client
    pub fn release(&self) {
        self.cancel_current();
        self.provider.write().take();
        tracing::debug!(tab_id = %self.id, "Released tab resources");
    }

    pub(crate) fn set_order(&self, order: usize) {
        self.fields.write().order = order;
    }

    pub(crate) fn set_label(&self, label: String) {
        self.fields.write().label = label;
    }

    pub(crate) fn touch(&self) {
        self.fields.write().last_active_at = Utc::now();
    }

    fn sync_counters(&self) {
        let message_count = self.session.message_count();
        let total_tokens = self.session.total_tokens();
        let mut fields = self.fields.write();
        fields.message_count = message_count;
        fields.total_tokens = total_tokens;
    }
}

impl std::fmt::Debug for Tab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stream_state = self.stream_state();
        f.debug_struct("Tab")
            .field("id", &self.id)
            .field("fields", &*self.fields.read())
            .field("stream_state", &stream_state)
            .finish_non_exhaustive()
    }
}

/// Returns the in-flight slot when the request ends, however it ends
struct RequestGuard {
    tab: Arc<Tab>,
    generation: u64,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tab.finish_request(self.generation);
    }
}

struct Relay {
    inner: ChunkStream,
    token: CancellationToken,
    /// Dropped as soon as the request reaches a terminal item
    guard: Option<RequestGuard>,
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    estimated_input: u32,
    text: String,
}

fn relay(state: Relay) -> ChunkStream {
    Box::pin(stream::unfold(state, |mut st| async move {
        let (tab, generation) = {
            let guard = st.guard.as_ref()?;
            (Arc::clone(&guard.tab), guard.generation)
        };

        let next = tokio::select! {
            biased;
            _ = st.token.cancelled() => Some(Err(ProviderError::Cancelled)),
            next = st.inner.next() => next,
        };

        match next {
            Some(Ok(chunk)) if chunk.is_final => {
                let recorded = tab.complete_turn(generation, &mut st, chunk.usage);
                st.guard = None;
                if recorded {
                    Some((Ok(chunk), st))
                } else {
                    Some((Err(ProviderError::Cancelled), st))
                }
            }
            Some(Ok(chunk)) => {
                st.text.push_str(&chunk.text);
                Some((Ok(chunk), st))
            }
            Some(Err(e)) => {
                if e.is_cancelled() {
                    tracing::debug!(tab_id = %tab.id, "Stream cancelled");
                } else {
                    tracing::warn!(tab_id = %tab.id, error = %e, "Stream failed");
                }
                st.guard = None;
                Some((Err(e), st))
            }
            None => {
                st.guard = None;
                let e = ProviderError::InvalidResponse {
                    provider: st.provider.provider_id().to_string(),
                    status: None,
                    details: "stream ended without a final chunk".to_string(),
                };
                tracing::warn!(tab_id = %tab.id, error = %e, "Stream failed");
                Some((Err(e), st))
            }
        }
    }))
}
