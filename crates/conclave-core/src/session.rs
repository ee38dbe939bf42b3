//! Session: the agents, mailboxes and conversation state of one user session
//!
//! A session owns one runtime per created agent, one post office, and the
//! per-agent conversation slots used when switching the active agent. A
//! background control task serializes mail-triggered switches, folds
//! finished tasks into conversation history and forwards events to the
//! observer.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{
    AgentHandle, AgentRegistry, AgentRuntime, AgentSnapshot, HandoffAdvisor, TaskResult, TaskStatus,
    TurnRunner,
};
use crate::config::SessionConfig;
use crate::error::{ConclaveError, Result};
use crate::events::{EventSink, RuntimeEvent};
use crate::mailbox::{Delivery, Envelope, MailCheck, MailQuery, PostOffice};
use crate::provider::CompletionProvider;
use crate::tools::mail::mail_tools;
use crate::tools::{AgentToolExecutor, ToolExecutor};
use crate::types::{ConversationEntry, Role};

enum Control {
    Delivered(Delivery),
    Event(RuntimeEvent),
}

/// Runtime events flow into the session's control task
struct ControlSink(mpsc::UnboundedSender<Control>);

impl EventSink for ControlSink {
    fn publish(&self, event: RuntimeEvent) {
        let _ = self.0.send(Control::Event(event));
    }
}

#[derive(Default)]
struct Conversations {
    active: Option<String>,
    /// History of the active agent
    working: Vec<ConversationEntry>,
    /// Histories of inactive agents, verbatim
    slots: HashMap<String, Vec<ConversationEntry>>,
}

struct SessionInner {
    id: String,
    created_at: DateTime<Utc>,
    config: SessionConfig,
    registry: Arc<dyn AgentRegistry>,
    provider: Arc<dyn CompletionProvider>,
    tools: Option<Arc<dyn ToolExecutor>>,
    advisor: Option<Arc<dyn HandoffAdvisor>>,
    post_office: PostOffice,
    agents: RwLock<HashMap<String, AgentHandle>>,
    conversations: Mutex<Conversations>,
    control_tx: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    id: Option<String>,
    registry: Arc<dyn AgentRegistry>,
    provider: Arc<dyn CompletionProvider>,
    tools: Option<Arc<dyn ToolExecutor>>,
    advisor: Option<Arc<dyn HandoffAdvisor>>,
    observer: Option<Arc<dyn EventSink>>,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new(registry: Arc<dyn AgentRegistry>, provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            id: None,
            registry,
            provider,
            tools: None,
            advisor: None,
            observer: None,
            config: SessionConfig::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Tools shared by every agent, filtered per agent profile
    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn HandoffAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// Receives every runtime and session event
    pub fn with_observer(mut self, observer: Arc<dyn EventSink>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the session. Must run inside a tokio runtime.
    pub async fn build(self) -> Result<Session> {
        if let Some(default_agent) = &self.config.default_agent
            && !self.registry.contains(default_agent)
        {
            return Err(ConclaveError::UnknownAgent(default_agent.clone()));
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let hook_tx = control_tx.clone();
        let post_office = PostOffice::with_delivery_hook(Arc::new(move |delivery| {
            let _ = hook_tx.send(Control::Delivered(delivery));
        }));

        let cancel = CancellationToken::new();
        let inner = Arc::new(SessionInner {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            created_at: Utc::now(),
            config: self.config,
            registry: self.registry,
            provider: self.provider,
            tools: self.tools,
            advisor: self.advisor,
            post_office,
            agents: RwLock::new(HashMap::new()),
            conversations: Mutex::new(Conversations::default()),
            control_tx,
            cancel: cancel.clone(),
        });

        tokio::spawn(control_loop(Arc::downgrade(&inner), control_rx, self.observer, cancel));

        let session = Session { inner };
        info!("Session {} opened", session.id());
        if let Some(default_agent) = session.inner.config.default_agent.clone() {
            session.switch_agent(&default_agent).await;
        }
        Ok(session)
    }
}

/// Handle to one session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("active_agent", &self.active_agent())
            .finish()
    }
}

impl Session {
    pub fn builder(registry: Arc<dyn AgentRegistry>, provider: Arc<dyn CompletionProvider>) -> SessionBuilder {
        SessionBuilder::new(registry, provider)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn post_office(&self) -> &PostOffice {
        &self.inner.post_office
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn conversations(&self) -> MutexGuard<'_, Conversations> {
        self.inner
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: RuntimeEvent) {
        let _ = self.inner.control_tx.send(Control::Event(event));
    }

    /// Handle for a created agent; distinguishes unknown from not-yet-created
    async fn handle(&self, agent_id: &str) -> Result<AgentHandle> {
        if let Some(handle) = self.inner.agents.read().await.get(agent_id) {
            return Ok(handle.clone());
        }
        if self.inner.registry.contains(agent_id) {
            Err(ConclaveError::AgentNotCreated(agent_id.to_string()))
        } else {
            Err(ConclaveError::UnknownAgent(agent_id.to_string()))
        }
    }

    /// Spawn a runtime for `agent_id`. Idempotent while the agent is running;
    /// a stopped agent is replaced by a fresh runtime.
    pub async fn create_agent(&self, agent_id: &str, auto_start: bool) -> Result<AgentSnapshot> {
        if self.is_closed() {
            return Err(ConclaveError::UnknownSession(self.inner.id.clone()));
        }
        let profile = self
            .inner
            .registry
            .get(agent_id)
            .ok_or_else(|| ConclaveError::UnknownAgent(agent_id.to_string()))?;

        let mut agents = self.inner.agents.write().await;
        if let Some(existing) = agents.get(agent_id)
            && !existing.is_stopped()
        {
            debug!("Session {}: agent {} already running", self.inner.id, agent_id);
            if auto_start {
                existing.start()?;
            }
            return Ok(existing.snapshot());
        }

        let runtime_config = &self.inner.config.runtime;
        let builtin = mail_tools(agent_id, &self.inner.post_office);
        let tools = AgentToolExecutor::new(profile.clone(), builtin, self.inner.tools.clone());
        let sink: Arc<dyn EventSink> = Arc::new(ControlSink(self.inner.control_tx.clone()));

        let runner = TurnRunner::new(
            agent_id,
            profile.effective_system_prompt(),
            self.inner.provider.clone(),
            Arc::new(tools),
            runtime_config.engine(),
        )
        .with_max_tool_output(runtime_config.max_tool_output)
        .with_stream_partials(runtime_config.stream_partials)
        .with_events(Some(sink.clone()));

        let handle = AgentRuntime::new(agent_id, runner, runtime_config.clone())
            .auto_start(auto_start)
            .with_events(Some(sink))
            .with_parent_cancel(&self.inner.cancel)
            .spawn();

        self.inner.post_office.open(agent_id);
        agents.insert(agent_id.to_string(), handle.clone());
        drop(agents);

        {
            let mut conversations = self.conversations();
            if conversations.active.as_deref() != Some(agent_id) {
                conversations.slots.entry(agent_id.to_string()).or_default();
            }
        }

        info!("Session {}: created agent {} (auto_start={})", self.inner.id, agent_id, auto_start);
        Ok(handle.snapshot())
    }

    /// Queue a task. Without explicit context the agent's own conversation is used.
    pub async fn send_task(
        &self,
        agent_id: &str,
        prompt: &str,
        context: Option<Vec<ConversationEntry>>,
    ) -> Result<String> {
        if prompt.trim().is_empty() {
            return Err(ConclaveError::validation("prompt must not be empty"));
        }
        let handle = self.handle(agent_id).await?;
        let context = context.unwrap_or_else(|| self.history(agent_id));
        let task_id = handle.send_task(prompt, context)?;
        debug!("Session {}: task {} sent to {}", self.inner.id, task_id, agent_id);
        Ok(task_id)
    }

    /// Snapshot of every created agent, keyed by id
    pub async fn agent_states(&self) -> BTreeMap<String, AgentSnapshot> {
        self.inner
            .agents
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.snapshot()))
            .collect()
    }

    pub async fn sleep_agent(&self, agent_id: &str, duration: Duration, wake_events: Vec<String>) -> Result<()> {
        self.handle(agent_id).await?.sleep(duration, wake_events)
    }

    pub async fn wake_agent(&self, agent_id: &str, reason: &str) -> Result<()> {
        self.handle(agent_id).await?.wake(reason)
    }

    /// Stop the agent's runtime and close its mailbox
    pub async fn stop_agent(&self, agent_id: &str) -> Result<()> {
        let handle = self.handle(agent_id).await?;
        self.inner.post_office.close(agent_id);
        handle.stop().await?;
        info!("Session {}: stopped agent {}", self.inner.id, agent_id);
        Ok(())
    }

    /// Deliver `event` to every sleeping agent subscribed to it. Returns how
    /// many agents it woke; agents not sleeping at delivery time miss it.
    pub async fn broadcast_event(&self, event: &str, data: Value) -> Result<usize> {
        if event.trim().is_empty() {
            return Err(ConclaveError::validation("event name must not be empty"));
        }
        let handles: Vec<AgentHandle> = self.inner.agents.read().await.values().cloned().collect();
        let deliveries = handles
            .iter()
            .filter(|h| !h.is_stopped())
            .map(|h| h.deliver_event(event, data.clone()));
        let woken = join_all(deliveries)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        debug!("Session {}: event {} woke {} agent(s)", self.inner.id, event, woken);
        Ok(woken)
    }

    /// Make `agent_id` the active agent, spawning its runtime if it has none
    /// or it was stopped. Returns false for agents the registry does not
    /// know. The outgoing agent's history is parked in its slot and the
    /// incoming agent's history is restored unchanged.
    pub async fn switch_agent(&self, agent_id: &str) -> bool {
        if !self.inner.registry.contains(agent_id) {
            warn!("Session {}: cannot switch to unknown agent {}", self.inner.id, agent_id);
            return false;
        }
        let runnable = self.handle(agent_id).await.is_ok_and(|h| !h.is_stopped());
        if !runnable && let Err(e) = self.create_agent(agent_id, true).await {
            warn!("Session {}: switch to {} failed: {}", self.inner.id, agent_id, e);
            return false;
        }

        let previous = {
            let mut conversations = self.conversations();
            if conversations.active.as_deref() == Some(agent_id) {
                return true;
            }
            let incoming = conversations.slots.remove(agent_id).unwrap_or_default();
            let outgoing = std::mem::replace(&mut conversations.working, incoming);
            let previous = conversations.active.replace(agent_id.to_string());
            if let Some(prev) = &previous {
                conversations.slots.insert(prev.clone(), outgoing);
            }
            previous
        };

        info!(
            "Session {}: switched {} → {}",
            self.inner.id,
            previous.as_deref().unwrap_or("(none)"),
            agent_id
        );
        self.publish(RuntimeEvent::AgentSwitched {
            from: previous,
            to: agent_id.to_string(),
        });
        true
    }

    pub fn active_agent(&self) -> Option<String> {
        self.conversations().active.clone()
    }

    /// Append to the active agent's conversation
    pub fn append_message(&self, role: Role, content: impl Into<String>) -> Result<()> {
        let mut conversations = self.conversations();
        if conversations.active.is_none() {
            return Err(ConclaveError::NoActiveAgent);
        }
        conversations.working.push(ConversationEntry::new(role, content));
        Ok(())
    }

    /// Copy of an agent's conversation history
    pub fn history(&self, agent_id: &str) -> Vec<ConversationEntry> {
        let conversations = self.conversations();
        if conversations.active.as_deref() == Some(agent_id) {
            conversations.working.clone()
        } else {
            conversations.slots.get(agent_id).cloned().unwrap_or_default()
        }
    }

    pub fn send_mail(&self, envelope: Envelope) -> Result<String> {
        self.validate_envelope(&envelope)?;
        self.inner.post_office.send(envelope)
    }

    /// Send mail, then switch to the recipient before returning
    pub async fn send_mail_with_switch(&self, envelope: Envelope) -> Result<(String, bool)> {
        self.validate_envelope(&envelope)?;
        let to = envelope.to.clone();
        let message_id = self.inner.post_office.send(envelope)?;
        let switched = self.switch_agent(&to).await;
        Ok((message_id, switched))
    }

    pub fn check_mail(&self, agent_id: &str, query: &MailQuery) -> Result<MailCheck> {
        self.inner.post_office.check_mail(agent_id, query)
    }

    pub fn acknowledge_mail(&self, agent_id: &str, message_ids: &[String]) -> Result<usize> {
        self.inner.post_office.acknowledge(agent_id, message_ids)
    }

    fn validate_envelope(&self, envelope: &Envelope) -> Result<()> {
        if envelope.from.trim().is_empty() || envelope.to.trim().is_empty() {
            return Err(ConclaveError::validation("mail needs both 'from' and 'to'"));
        }
        if envelope.body.is_empty() && envelope.subject.is_empty() {
            return Err(ConclaveError::validation("mail needs a subject or body"));
        }
        Ok(())
    }

    /// Ask the handoff advisor for a better agent for the active conversation
    pub fn suggest_handoff(&self) -> Option<String> {
        let advisor = self.inner.advisor.as_ref()?;
        let (active, working) = {
            let conversations = self.conversations();
            (conversations.active.clone(), conversations.working.clone())
        };
        advisor
            .can_handoff(&working)
            .filter(|target| Some(target) != active.as_ref())
    }

    /// Switch to the advised agent, if any. Returns the new active agent.
    pub async fn apply_handoff(&self) -> Option<String> {
        let target = self.suggest_handoff()?;
        if self.switch_agent(&target).await {
            Some(target)
        } else {
            None
        }
    }

    pub async fn task_results(&self, agent_id: &str) -> Result<Vec<TaskResult>> {
        Ok(self.handle(agent_id).await?.recent_results())
    }

    /// Stop every runtime, close every mailbox and end the control task
    pub async fn shutdown(&self) {
        let handles: Vec<AgentHandle> = self.inner.agents.read().await.values().cloned().collect();
        self.inner.post_office.close_all();
        join_all(handles.iter().map(|h| h.stop())).await;
        self.inner.cancel.cancel();
        info!("Session {} closed ({} agent(s) stopped)", self.inner.id, handles.len());
    }

    /// Fold a finished task into the owning agent's conversation
    fn record_exchange(&self, result: &TaskResult) {
        if result.status != TaskStatus::Completed {
            return;
        }
        let mut conversations = self.conversations();
        let history = if conversations.active.as_deref() == Some(result.agent_id.as_str()) {
            &mut conversations.working
        } else {
            conversations.slots.entry(result.agent_id.clone()).or_default()
        };
        history.push(ConversationEntry::user(result.prompt.clone()));
        if !result.output.is_empty() {
            history.push(ConversationEntry::assistant(result.output.clone()));
        }
    }
}

async fn control_loop(
    inner: Weak<SessionInner>,
    mut rx: mpsc::UnboundedReceiver<Control>,
    observer: Option<Arc<dyn EventSink>>,
    cancel: CancellationToken,
) {
    loop {
        let control = tokio::select! {
            _ = cancel.cancelled() => break,
            control = rx.recv() => match control {
                Some(control) => control,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let session = Session { inner };

        match control {
            Control::Delivered(delivery) => {
                if let Some(observer) = &observer {
                    observer.publish(RuntimeEvent::MailDelivered {
                        from: delivery.from.clone(),
                        to: delivery.to.clone(),
                        message_id: delivery.message_id.clone(),
                    });
                }
                if delivery.switch_requested && !session.switch_agent(&delivery.to).await {
                    warn!(
                        "Session {}: mail {} requested switch to {} which failed",
                        session.id(),
                        delivery.message_id,
                        delivery.to
                    );
                }
            }
            Control::Event(event) => {
                if let RuntimeEvent::TaskFinished { result, .. } = &event {
                    session.record_exchange(result);
                }
                if let Some(observer) = &observer {
                    observer.publish(event);
                }
            }
        }
    }

    // Forward whatever is still queued so observers see the final transitions
    if let Some(observer) = &observer {
        while let Ok(Control::Event(event)) = rx.try_recv() {
            observer.publish(event);
        }
    }
    debug!("Session control task exited");
}
