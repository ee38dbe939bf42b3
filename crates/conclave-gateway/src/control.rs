//! Control plane: dispatch gateway requests onto sessions

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use conclave_core::{
    AgentRegistry, CompletionProvider, ConclaveError, ConversationEntry, Envelope, HandoffAdvisor,
    MailPriority, MailQuery, Role, Session, SessionConfig, ToolExecutor,
};

use crate::events::EventBus;
use crate::protocol::{
    self, ERR_INVALID_METHOD, ERR_INVALID_PARAMS, GatewayEvent, GatewayRequest, GatewayResponse, methods,
};

type Reply = std::result::Result<Value, GatewayResponse>;

// ── Request params ──

#[derive(Debug, Deserialize)]
struct SessionCreateParams {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    default_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct AgentParams {
    session_id: String,
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateAgentParams {
    session_id: String,
    agent_id: String,
    #[serde(default = "default_true")]
    auto_start: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct SendTaskParams {
    session_id: String,
    agent_id: String,
    prompt: String,
    #[serde(default)]
    context: Option<Vec<ContextEntry>>,
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    session_id: String,
    agent_id: String,
    duration_seconds: f64,
    #[serde(default)]
    wake_events: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WakeParams {
    session_id: String,
    agent_id: String,
    #[serde(default = "default_wake_reason")]
    reason: String,
}

fn default_wake_reason() -> String {
    "manual".to_string()
}

#[derive(Debug, Deserialize)]
struct BroadcastParams {
    session_id: String,
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct MailSendParams {
    session_id: String,
    from: String,
    to: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MailCheckParams {
    session_id: String,
    agent_id: String,
    #[serde(flatten)]
    query: MailQuery,
}

#[derive(Debug, Deserialize)]
struct MailAckParams {
    session_id: String,
    agent_id: String,
    message_ids: Vec<String>,
}

fn parse<T: DeserializeOwned>(id: &Option<String>, params: &Value) -> std::result::Result<T, GatewayResponse> {
    // Absent params behave like an empty object
    let params = if params.is_null() { json!({}) } else { params.clone() };
    serde_json::from_value(params)
        .map_err(|e| GatewayResponse::err(id.clone(), ERR_INVALID_PARAMS, format!("Invalid params: {}", e)))
}

impl MailSendParams {
    fn envelope(&self) -> conclave_core::Result<Envelope> {
        let priority = match &self.priority {
            Some(p) => MailPriority::from_string(p)
                .ok_or_else(|| ConclaveError::validation(format!("invalid priority '{}'", p)))?,
            None => MailPriority::Normal,
        };
        Ok(Envelope::new(&self.from, &self.to, &self.subject, &self.body).with_priority(priority))
    }
}

/// Owns every open session and answers gateway requests against them
pub struct ControlPlane {
    registry: Arc<dyn AgentRegistry>,
    provider: Arc<dyn CompletionProvider>,
    tools: Option<Arc<dyn ToolExecutor>>,
    advisor: Option<Arc<dyn HandoffAdvisor>>,
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Session>>,
    events: EventBus,
    start_time: Instant,
}

impl ControlPlane {
    pub fn new(registry: Arc<dyn AgentRegistry>, provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            registry,
            provider,
            tools: None,
            advisor: None,
            config: SessionConfig::default(),
            sessions: RwLock::new(HashMap::new()),
            events: EventBus::new(256),
            start_time: Instant::now(),
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn HandoffAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = EventBus::new(capacity);
        self
    }

    /// Get a reference to the event bus (for subscribing observers)
    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub async fn session(&self, session_id: &str) -> conclave_core::Result<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ConclaveError::UnknownSession(session_id.to_string()))
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Open a session. Reusing an open session id is a validation error.
    pub async fn create_session(
        &self,
        session_id: Option<String>,
        default_agent: Option<String>,
    ) -> conclave_core::Result<Session> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if session_id.trim().is_empty() {
            return Err(ConclaveError::validation("session_id must not be empty"));
        }
        if self.sessions.read().await.contains_key(&session_id) {
            return Err(ConclaveError::validation(format!("session '{}' already exists", session_id)));
        }

        let mut config = self.config.clone();
        if default_agent.is_some() {
            config.default_agent = default_agent;
        }

        let mut builder = Session::builder(self.registry.clone(), self.provider.clone())
            .with_id(session_id.clone())
            .with_config(config)
            .with_observer(self.events.session_sink(session_id.clone()));
        if let Some(tools) = &self.tools {
            builder = builder.with_tools(tools.clone());
        }
        if let Some(advisor) = &self.advisor {
            builder = builder.with_advisor(advisor.clone());
        }
        let session = builder.build().await?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            drop(sessions);
            session.shutdown().await;
            return Err(ConclaveError::validation(format!("session '{}' already exists", session_id)));
        }
        sessions.insert(session_id.clone(), session.clone());
        drop(sessions);

        info!("Created session {}", session_id);
        self.events.broadcast(
            GatewayEvent::new(protocol::events::SESSION_CREATED, json!({"session_id": session_id}))
                .for_session(session_id.clone()),
        );
        Ok(session)
    }

    /// Stop every agent in the session, then forget it
    pub async fn close_session(&self, session_id: &str) -> conclave_core::Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| ConclaveError::UnknownSession(session_id.to_string()))?;
        session.shutdown().await;
        self.events.broadcast(
            GatewayEvent::new(protocol::events::SESSION_CLOSED, json!({"session_id": session_id}))
                .for_session(session_id),
        );
        Ok(())
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.shutdown().await;
        }
        info!("Control plane shut down ({} session(s) closed)", sessions.len());
    }

    /// Parse and answer one raw JSON request
    pub async fn handle_request(&self, raw: &str) -> GatewayResponse {
        let req: GatewayRequest = match serde_json::from_str(raw) {
            Ok(r) => r,
            Err(e) => {
                return GatewayResponse::err(None, ERR_INVALID_PARAMS, format!("Invalid JSON: {}", e));
            }
        };
        self.dispatch(req).await
    }

    pub async fn dispatch(&self, req: GatewayRequest) -> GatewayResponse {
        let id = req.id.clone();
        debug!("Gateway request {} (id={:?})", req.method, id);
        match self.route(&req).await {
            Ok(result) => GatewayResponse::ok(id, result),
            Err(response) => {
                if let Some(error) = &response.error {
                    warn!("Gateway request {} failed ({}): {}", req.method, error.code, error.message);
                }
                response
            }
        }
    }

    async fn route(&self, req: &GatewayRequest) -> Reply {
        let id = &req.id;
        let params = &req.params;
        let fail = |e: ConclaveError| GatewayResponse::from_error(id.clone(), &e);

        match req.method.as_str() {
            methods::STATUS_GET => Ok(json!({
                "status": "ok",
                "sessions": self.session_count().await,
                "subscribers": self.events.subscriber_count(),
                "uptime_secs": self.start_time.elapsed().as_secs(),
            })),

            methods::SESSION_CREATE => {
                let p: SessionCreateParams = parse(id, params)?;
                let session = self.create_session(p.session_id, p.default_agent).await.map_err(fail)?;
                Ok(json!({
                    "session_id": session.id(),
                    "created_at": session.created_at(),
                    "current_agent": session.active_agent(),
                }))
            }

            methods::SESSION_CLOSE => {
                let p: SessionParams = parse(id, params)?;
                self.close_session(&p.session_id).await.map_err(fail)?;
                Ok(json!({"ok": true}))
            }

            methods::SESSION_LIST => {
                let sessions = self.sessions.read().await;
                let mut list: Vec<Value> = sessions
                    .values()
                    .map(|s| {
                        json!({
                            "session_id": s.id(),
                            "created_at": s.created_at(),
                            "current_agent": s.active_agent(),
                        })
                    })
                    .collect();
                list.sort_by(|a, b| a["session_id"].as_str().cmp(&b["session_id"].as_str()));
                Ok(json!({"sessions": list}))
            }

            methods::AGENT_CREATE => {
                let p: CreateAgentParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                let snapshot = session.create_agent(&p.agent_id, p.auto_start).await.map_err(fail)?;
                Ok(json!({"ok": true, "agent": snapshot}))
            }

            methods::AGENT_SEND_TASK => {
                let p: SendTaskParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                let context = match p.context {
                    Some(entries) => Some(
                        entries
                            .into_iter()
                            .map(|e| {
                                Role::from_string(&e.role)
                                    .map(|role| ConversationEntry::new(role, e.content))
                                    .ok_or_else(|| ConclaveError::validation(format!("unknown role '{}'", e.role)))
                            })
                            .collect::<conclave_core::Result<Vec<_>>>()
                            .map_err(fail)?,
                    ),
                    None => None,
                };
                let task_id = session
                    .send_task(&p.agent_id, &p.prompt, context)
                    .await
                    .map_err(fail)?;
                Ok(json!({"ok": true, "task_id": task_id}))
            }

            methods::AGENT_STATES => {
                let p: SessionParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                Ok(json!({
                    "agents": session.agent_states().await,
                    "current_agent": session.active_agent(),
                }))
            }

            methods::AGENT_SLEEP => {
                let p: SleepParams = parse(id, params)?;
                let duration = Duration::try_from_secs_f64(p.duration_seconds)
                    .ok()
                    .filter(|d| !d.is_zero())
                    .ok_or_else(|| {
                        GatewayResponse::err(
                            id.clone(),
                            ERR_INVALID_PARAMS,
                            "duration_seconds must be a positive number",
                        )
                    })?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                session
                    .sleep_agent(&p.agent_id, duration, p.wake_events)
                    .await
                    .map_err(fail)?;
                Ok(json!({"ok": true}))
            }

            methods::AGENT_WAKE => {
                let p: WakeParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                session.wake_agent(&p.agent_id, &p.reason).await.map_err(fail)?;
                Ok(json!({"ok": true}))
            }

            methods::AGENT_STOP => {
                let p: AgentParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                session.stop_agent(&p.agent_id).await.map_err(fail)?;
                Ok(json!({"ok": true}))
            }

            methods::AGENT_SWITCH => {
                let p: AgentParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                let success = session.switch_agent(&p.agent_id).await;
                Ok(json!({"success": success, "current_agent": session.active_agent()}))
            }

            methods::AGENT_RESULTS => {
                let p: AgentParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                let results = session.task_results(&p.agent_id).await.map_err(fail)?;
                Ok(json!({"results": results}))
            }

            methods::AGENT_HISTORY => {
                let p: AgentParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                if !self.registry.contains(&p.agent_id) {
                    return Err(fail(ConclaveError::UnknownAgent(p.agent_id)));
                }
                Ok(json!({"history": session.history(&p.agent_id)}))
            }

            methods::EVENT_BROADCAST => {
                let p: BroadcastParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                let woken = session.broadcast_event(&p.event, p.data).await.map_err(fail)?;
                Ok(json!({"ok": true, "woken": woken}))
            }

            methods::MAIL_SEND => {
                let p: MailSendParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                let message_id = session.send_mail(p.envelope().map_err(fail)?).map_err(fail)?;
                Ok(json!({"ok": true, "message_id": message_id}))
            }

            methods::MAIL_SEND_WITH_SWITCH => {
                let p: MailSendParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                let (message_id, switched) = session
                    .send_mail_with_switch(p.envelope().map_err(fail)?)
                    .await
                    .map_err(fail)?;
                Ok(json!({
                    "ok": true,
                    "message_id": message_id,
                    "switched": switched,
                    "current_agent": session.active_agent(),
                }))
            }

            methods::MAIL_CHECK => {
                let p: MailCheckParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                let check = session.check_mail(&p.agent_id, &p.query).map_err(fail)?;
                serde_json::to_value(check)
                    .map_err(|e| GatewayResponse::err(id.clone(), protocol::ERR_INTERNAL, e.to_string()))
            }

            methods::MAIL_ACK => {
                let p: MailAckParams = parse(id, params)?;
                let session = self.session(&p.session_id).await.map_err(fail)?;
                let acknowledged = session
                    .acknowledge_mail(&p.agent_id, &p.message_ids)
                    .map_err(fail)?;
                Ok(json!({"ok": true, "acknowledged": acknowledged}))
            }

            _ => Err(GatewayResponse::err(
                id.clone(),
                ERR_INVALID_METHOD,
                format!("Unknown method: {}", req.method),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ERR_INTERNAL, ERR_MAILBOX_UNAVAILABLE};
    use async_trait::async_trait;
    use conclave_core::provider::stream_from_chunks;
    use conclave_core::{AgentProfile, CompletionChunk, CompletionStream, FinishReason, StaticRegistry, ToolDefinition};

    /// Answers every prompt with a fixed line
    struct EchoProvider;

    #[async_trait]
    impl CompletionProvider for EchoProvider {
        fn provider_name(&self) -> &str {
            "echo"
        }

        async fn complete(
            &self,
            history: &[ConversationEntry],
            _tools: &[ToolDefinition],
        ) -> anyhow::Result<CompletionStream> {
            let last = history.last().map(|e| e.content.clone()).unwrap_or_default();
            Ok(stream_from_chunks(vec![
                CompletionChunk::Text(format!("echo: {}", last)),
                CompletionChunk::Finish(FinishReason::Stop),
            ]))
        }
    }

    fn control() -> ControlPlane {
        let registry = StaticRegistry::from_profiles([
            AgentProfile::new("a", "Alpha"),
            AgentProfile::new("b", "Beta"),
            AgentProfile::new("d", "Delta"),
        ]);
        ControlPlane::new(Arc::new(registry), Arc::new(EchoProvider))
    }

    async fn call(control: &ControlPlane, method: &str, params: Value) -> GatewayResponse {
        control
            .dispatch(GatewayRequest {
                method: method.to_string(),
                params,
                id: Some("req".to_string()),
            })
            .await
    }

    async fn ok(control: &ControlPlane, method: &str, params: Value) -> Value {
        let resp = call(control, method, params).await;
        assert!(resp.is_ok(), "{} failed: {:?}", method, resp.error);
        resp.result.unwrap()
    }

    fn code(resp: &GatewayResponse) -> i32 {
        resp.error.as_ref().map(|e| e.code).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let control = control();
        let mut events = control.event_bus().subscribe();

        let created = ok(&control, methods::SESSION_CREATE, json!({"session_id": "s1"})).await;
        assert_eq!(created["session_id"], "s1");
        assert_eq!(events.recv().await.unwrap().event, protocol::events::SESSION_CREATED);

        let dup = call(&control, methods::SESSION_CREATE, json!({"session_id": "s1"})).await;
        assert_eq!(code(&dup), ERR_INVALID_PARAMS);

        let listed = ok(&control, methods::SESSION_LIST, json!({})).await;
        assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);

        ok(&control, methods::SESSION_CLOSE, json!({"session_id": "s1"})).await;
        assert_eq!(control.session_count().await, 0);

        let gone = call(&control, methods::AGENT_STATES, json!({"session_id": "s1"})).await;
        assert_eq!(code(&gone), ERR_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_create_send_and_read_states() {
        let control = control();
        ok(&control, methods::SESSION_CREATE, json!({"session_id": "s"})).await;
        ok(
            &control,
            methods::AGENT_CREATE,
            json!({"session_id": "s", "agent_id": "d", "auto_start": true}),
        )
        .await;

        let sent = ok(
            &control,
            methods::AGENT_SEND_TASK,
            json!({"session_id": "s", "agent_id": "d", "prompt": "2+2?"}),
        )
        .await;
        assert!(sent["task_id"].is_string());

        let session = control.session("s").await.unwrap();
        for _ in 0..200 {
            if !session.task_results("d").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let states = ok(&control, methods::AGENT_STATES, json!({"session_id": "s"})).await;
        let d = &states["agents"]["d"];
        assert_eq!(d["queue_depth"], 0);
        assert!(d["current_task"].is_null());
        assert!(d["last_active"].is_string());

        let results = ok(&control, methods::AGENT_RESULTS, json!({"session_id": "s", "agent_id": "d"})).await;
        assert_eq!(results["results"][0]["output"], "echo: 2+2?");
    }

    #[tokio::test]
    async fn test_send_task_with_explicit_context() {
        let control = control();
        ok(&control, methods::SESSION_CREATE, json!({"session_id": "s"})).await;
        ok(&control, methods::AGENT_CREATE, json!({"session_id": "s", "agent_id": "a"})).await;

        let bad_role = call(
            &control,
            methods::AGENT_SEND_TASK,
            json!({"session_id": "s", "agent_id": "a", "prompt": "hi",
                   "context": [{"role": "narrator", "content": "x"}]}),
        )
        .await;
        assert_eq!(code(&bad_role), ERR_INVALID_PARAMS);

        ok(
            &control,
            methods::AGENT_SEND_TASK,
            json!({"session_id": "s", "agent_id": "a", "prompt": "hi",
                   "context": [{"role": "user", "content": "earlier"}]}),
        )
        .await;
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let control = control();
        ok(&control, methods::SESSION_CREATE, json!({"session_id": "s"})).await;

        let unknown = call(&control, methods::AGENT_CREATE, json!({"session_id": "s", "agent_id": "ghost"})).await;
        assert_eq!(code(&unknown), ERR_INVALID_PARAMS);

        let missing = call(&control, methods::AGENT_CREATE, json!({"session_id": "s"})).await;
        assert_eq!(code(&missing), ERR_INVALID_PARAMS);

        let bad_sleep = call(
            &control,
            methods::AGENT_SLEEP,
            json!({"session_id": "s", "agent_id": "a", "duration_seconds": -1.0}),
        )
        .await;
        assert_eq!(code(&bad_sleep), ERR_INVALID_PARAMS);

        let not_created = call(
            &control,
            methods::AGENT_SEND_TASK,
            json!({"session_id": "s", "agent_id": "a", "prompt": "hi"}),
        )
        .await;
        assert_eq!(code(&not_created), ERR_INVALID_PARAMS);

        let method = call(&control, "agent.dance", json!({})).await;
        assert_eq!(code(&method), ERR_INVALID_METHOD);

        let raw = control.handle_request("not json").await;
        assert_eq!(code(&raw), ERR_INVALID_PARAMS);
        assert_ne!(code(&raw), ERR_INTERNAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_and_broadcast() {
        let control = control();
        ok(&control, methods::SESSION_CREATE, json!({"session_id": "s"})).await;
        ok(&control, methods::AGENT_CREATE, json!({"session_id": "s", "agent_id": "a"})).await;
        ok(
            &control,
            methods::AGENT_SLEEP,
            json!({"session_id": "s", "agent_id": "a", "duration_seconds": 10, "wake_events": ["x"]}),
        )
        .await;

        let session = control.session("s").await.unwrap();
        for _ in 0..100 {
            if session.agent_states().await["a"].state == conclave_core::AgentState::Sleeping {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let woke = ok(
            &control,
            methods::EVENT_BROADCAST,
            json!({"session_id": "s", "event": "x", "data": {"n": 1}}),
        )
        .await;
        assert_eq!(woke["woken"], 1);
    }

    #[tokio::test]
    async fn test_mail_flow_and_switch() {
        let control = control();
        ok(&control, methods::SESSION_CREATE, json!({"session_id": "s", "default_agent": "a"})).await;
        ok(&control, methods::AGENT_CREATE, json!({"session_id": "s", "agent_id": "b"})).await;

        let unavailable = call(
            &control,
            methods::MAIL_SEND,
            json!({"session_id": "s", "from": "a", "to": "d", "subject": "S", "body": "B"}),
        )
        .await;
        assert_eq!(code(&unavailable), ERR_MAILBOX_UNAVAILABLE);

        let sent = ok(
            &control,
            methods::MAIL_SEND,
            json!({"session_id": "s", "from": "a", "to": "b", "subject": "S", "body": "B"}),
        )
        .await;
        let message_id = sent["message_id"].as_str().unwrap().to_string();

        let check = ok(
            &control,
            methods::MAIL_CHECK,
            json!({"session_id": "s", "agent_id": "b", "unread_only": true}),
        )
        .await;
        assert_eq!(check["count"], 1);
        assert_eq!(check["messages"][0]["status"], "unread");

        let acked = ok(
            &control,
            methods::MAIL_ACK,
            json!({"session_id": "s", "agent_id": "b", "message_ids": [message_id]}),
        )
        .await;
        assert_eq!(acked["acknowledged"], 1);

        let switched = ok(
            &control,
            methods::MAIL_SEND_WITH_SWITCH,
            json!({"session_id": "s", "from": "a", "to": "b", "body": "over to you", "priority": "high"}),
        )
        .await;
        assert_eq!(switched["switched"], true);
        assert_eq!(switched["current_agent"], "b");

        let back = ok(&control, methods::AGENT_SWITCH, json!({"session_id": "s", "agent_id": "a"})).await;
        assert_eq!(back["success"], true);
        assert_eq!(back["current_agent"], "a");

        let nowhere = ok(&control, methods::AGENT_SWITCH, json!({"session_id": "s", "agent_id": "ghost"})).await;
        assert_eq!(nowhere["success"], false);
        assert_eq!(nowhere["current_agent"], "a");
    }

    #[tokio::test]
    async fn test_stop_agent() {
        let control = control();
        ok(&control, methods::SESSION_CREATE, json!({"session_id": "s"})).await;
        ok(&control, methods::AGENT_CREATE, json!({"session_id": "s", "agent_id": "a"})).await;
        ok(&control, methods::AGENT_STOP, json!({"session_id": "s", "agent_id": "a"})).await;

        let states = ok(&control, methods::AGENT_STATES, json!({"session_id": "s"})).await;
        assert_eq!(states["agents"]["a"]["state"], "stopped");

        let wake = call(
            &control,
            methods::AGENT_WAKE,
            json!({"session_id": "s", "agent_id": "a"}),
        )
        .await;
        assert!(wake.error.is_some());
    }

    #[tokio::test]
    async fn test_runtime_events_reach_bus() {
        let control = control();
        let mut events = control.event_bus().subscribe();
        ok(&control, methods::SESSION_CREATE, json!({"session_id": "s"})).await;
        ok(&control, methods::AGENT_SWITCH, json!({"session_id": "s", "agent_id": "a"})).await;

        loop {
            let event = events.recv().await.unwrap();
            if event.event == "agent_switched" {
                assert_eq!(event.session_id.as_deref(), Some("s"));
                assert_eq!(event.data["to"], "a");
                break;
            }
        }
    }
}
