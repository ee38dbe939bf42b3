//! Agent runtime: one tokio task per agent owning its state machine
//!
//! ```text
//!   Idle ──start/wake──▶ Active ◀──────── task done ───────┐
//!                          │  ▲                             │
//!                   sleep  │  │ wake / timer / event   Processing
//!                          ▼  │                             ▲
//!                        Sleeping                 task dequeued
//!
//!   any state ──stop──▶ Stopped
//! ```
//!
//! The actor is the only writer of its state, queue and current task.
//! Everyone else talks to it through [`AgentHandle`] and reads state from a
//! `watch` snapshot.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::turn::{TurnOutcome, TurnRunner};
use crate::config::RuntimeConfig;
use crate::error::{ConclaveError, Result};
use crate::events::{EventSink, RuntimeEvent, emit};
use crate::types::{ChannelMessage, ConversationEntry};

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Active,
    Processing,
    Sleeping,
    Stopped,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Processing => write!(f, "processing"),
            Self::Sleeping => write!(f, "sleeping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A unit of work for one agent: one user turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub prompt: String,
    #[serde(default)]
    pub context: Vec<ConversationEntry>,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    pub fn new(prompt: impl Into<String>, context: Vec<ConversationEntry>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            context,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
    /// Cut short by `stop()`
    Abandoned,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// How a task ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChannelMessage>,
    pub iterations: u32,
    pub stop_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The task an agent is executing right now
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentTask {
    pub task_id: String,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
}

/// Eventually-consistent view of one agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub state: AgentState,
    pub queue_depth: usize,
    pub current_task: Option<CurrentTask>,
    pub last_active: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wake_events: Vec<String>,
}

enum Command {
    Submit(Task),
    Start,
    Sleep {
        duration: Duration,
        wake_events: Vec<String>,
    },
    Wake {
        reason: String,
    },
    Event {
        name: String,
        data: Value,
        delivered: oneshot::Sender<bool>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// Control handle for a spawned agent. Cheap to clone.
#[derive(Clone)]
pub struct AgentHandle {
    agent_id: String,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<AgentSnapshot>,
    results: Arc<Mutex<VecDeque<TaskResult>>>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("agent_id", &self.agent_id)
            .field("state", &self.snapshot.borrow().state)
            .finish()
    }
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ConclaveError::AgentStopped(self.agent_id.clone()))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(ConclaveError::AgentStopped(self.agent_id.clone()));
        }
        Ok(())
    }

    /// Enqueue a task, returning its id
    pub fn send_task(&self, prompt: impl Into<String>, context: Vec<ConversationEntry>) -> Result<String> {
        self.ensure_running()?;
        let task = Task::new(prompt, context);
        let task_id = task.task_id.clone();
        self.send(Command::Submit(task))?;
        Ok(task_id)
    }

    /// Idle → Active
    pub fn start(&self) -> Result<()> {
        self.ensure_running()?;
        self.send(Command::Start)
    }

    /// Suspend until `duration` elapses or one of `wake_events` arrives
    pub fn sleep(&self, duration: Duration, wake_events: Vec<String>) -> Result<()> {
        self.ensure_running()?;
        self.send(Command::Sleep { duration, wake_events })
    }

    pub fn wake(&self, reason: impl Into<String>) -> Result<()> {
        self.ensure_running()?;
        self.send(Command::Wake { reason: reason.into() })
    }

    /// Offer a named event; true if it woke the agent
    pub async fn deliver_event(&self, name: &str, data: Value) -> Result<bool> {
        self.ensure_running()?;
        let (delivered, rx) = oneshot::channel();
        self.send(Command::Event {
            name: name.to_string(),
            data,
            delivered,
        })?;
        Ok(rx.await.unwrap_or(false))
    }

    /// Stop the agent and wait for it to wind down. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Stop { ack }).is_err() {
            return Ok(());
        }
        // A dropped ack means the actor already exited
        let _ = done.await;
        Ok(())
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> AgentState {
        self.snapshot.borrow().state
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == AgentState::Stopped
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_until(&self, mut predicate: impl FnMut(&AgentSnapshot) -> bool) -> AgentSnapshot {
        let mut rx = self.snapshot.clone();
        if let Ok(snapshot) = rx.wait_for(|s| predicate(s)).await {
            return snapshot.clone();
        }
        // Actor gone; its last snapshot is final
        rx.borrow().clone()
    }

    /// Most recent finished tasks, oldest first
    pub fn recent_results(&self) -> Vec<TaskResult> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Builder for one agent's runtime task
pub struct AgentRuntime {
    agent_id: String,
    runner: TurnRunner,
    config: RuntimeConfig,
    auto_start: bool,
    events: Option<Arc<dyn EventSink>>,
    cancel: CancellationToken,
}

impl AgentRuntime {
    pub fn new(agent_id: impl Into<String>, runner: TurnRunner, config: RuntimeConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            runner,
            config,
            auto_start: true,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_events(mut self, events: Option<Arc<dyn EventSink>>) -> Self {
        self.events = events;
        self
    }

    /// Stop when `parent` is cancelled
    pub fn with_parent_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Spawn the actor onto the current tokio runtime
    pub fn spawn(self) -> AgentHandle {
        let state = if self.auto_start {
            AgentState::Active
        } else {
            AgentState::Idle
        };
        let now = Utc::now();
        let initial = AgentSnapshot {
            agent_id: self.agent_id.clone(),
            state,
            queue_depth: 0,
            current_task: None,
            last_active: now,
            sleep_until: None,
            wake_events: Vec::new(),
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let results = Arc::new(Mutex::new(VecDeque::new()));

        let actor = AgentActor {
            agent_id: self.agent_id.clone(),
            runner: Some(Arc::new(self.runner)),
            config: self.config,
            state,
            queue: VecDeque::new(),
            running: None,
            sleep: None,
            sleep_generation: 0,
            last_active: now,
            snapshot_tx,
            results: results.clone(),
            events: self.events,
            cancel: self.cancel,
        };

        info!("Agent {} spawned ({})", self.agent_id, state);
        tokio::spawn(actor.run(commands_rx));

        AgentHandle {
            agent_id: self.agent_id,
            commands: commands_tx,
            snapshot: snapshot_rx,
            results,
        }
    }
}

/// Upper bound for a sleep deadline
const MAX_SLEEP: Duration = Duration::from_secs(60 * 60 * 24 * 365);

type TurnJoin = std::result::Result<Option<anyhow::Result<TurnOutcome>>, JoinError>;

struct RunningTask {
    task: Task,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<Option<anyhow::Result<TurnOutcome>>>,
}

struct SleepState {
    until: Instant,
    until_utc: DateTime<Utc>,
    wake_events: Vec<String>,
    generation: u64,
}

struct AgentActor {
    agent_id: String,
    runner: Option<Arc<TurnRunner>>,
    config: RuntimeConfig,
    state: AgentState,
    queue: VecDeque<Task>,
    running: Option<RunningTask>,
    sleep: Option<SleepState>,
    sleep_generation: u64,
    last_active: DateTime<Utc>,
    snapshot_tx: watch::Sender<AgentSnapshot>,
    results: Arc<Mutex<VecDeque<TaskResult>>>,
    events: Option<Arc<dyn EventSink>>,
    cancel: CancellationToken,
}

async fn join_running(running: &mut Option<RunningTask>) -> TurnJoin {
    match running {
        Some(task) => (&mut task.handle).await,
        None => std::future::pending().await,
    }
}

async fn sleep_deadline(deadline: Option<(Instant, u64)>) -> u64 {
    match deadline {
        Some((at, generation)) => {
            tokio::time::sleep_until(at).await;
            generation
        }
        None => std::future::pending().await,
    }
}

impl AgentActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let cancel = self.cancel.clone();
        loop {
            self.maybe_start_next();
            self.publish_snapshot();

            let deadline = self.sleep.as_ref().map(|s| (s.until, s.generation));
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Agent {} cancelled", self.agent_id);
                    self.shutdown().await;
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(ack) = self.handle_command(command) {
                            self.shutdown().await;
                            let _ = ack.send(());
                            break;
                        }
                    }
                    None => {
                        debug!("Agent {} handles dropped", self.agent_id);
                        self.shutdown().await;
                        break;
                    }
                },
                joined = join_running(&mut self.running) => {
                    if let Some(running) = self.running.take() {
                        self.finish_task(running, joined);
                    }
                }
                generation = sleep_deadline(deadline) => self.on_timer(generation),
            }
        }
        info!("Agent {} runtime exited", self.agent_id);
    }

    /// Apply one command; `Break` carries the stop acknowledgement
    fn handle_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Submit(task) => {
                debug!("Agent {} queued task {}", self.agent_id, task.task_id);
                let task_id = task.task_id.clone();
                self.queue.push_back(task);
                emit(
                    &self.events,
                    RuntimeEvent::TaskQueued {
                        agent_id: self.agent_id.clone(),
                        task_id,
                        queue_depth: self.queue.len(),
                    },
                );
            }
            Command::Start => {
                if self.state == AgentState::Idle {
                    self.transition(AgentState::Active, "started");
                }
            }
            Command::Sleep { duration, wake_events } => self.enter_sleep(duration, wake_events),
            Command::Wake { reason } => match self.state {
                AgentState::Sleeping => self.wake_now(&reason),
                AgentState::Idle => self.transition(AgentState::Active, &reason),
                _ => debug!("Agent {} wake ignored in state {}", self.agent_id, self.state),
            },
            Command::Event { name, data, delivered } => {
                let subscribed = self
                    .sleep
                    .as_ref()
                    .is_some_and(|s| s.wake_events.iter().any(|e| e == &name));
                if self.state == AgentState::Sleeping && subscribed {
                    debug!("Agent {} woken by event {} ({})", self.agent_id, name, data);
                    self.wake_now(&format!("event:{}", name));
                    let _ = delivered.send(true);
                } else {
                    debug!("Agent {} missed event {} in state {}", self.agent_id, name, self.state);
                    let _ = delivered.send(false);
                }
            }
            Command::Stop { ack } => return ControlFlow::Break(ack),
        }
        ControlFlow::Continue(())
    }

    fn enter_sleep(&mut self, duration: Duration, wake_events: Vec<String>) {
        if !matches!(
            self.state,
            AgentState::Active | AgentState::Processing | AgentState::Sleeping
        ) {
            debug!("Agent {} cannot sleep from state {}", self.agent_id, self.state);
            return;
        }

        self.sleep_generation += 1;
        let now = Instant::now();
        let until = now.checked_add(duration).unwrap_or(now + MAX_SLEEP);
        let until_utc = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.sleep = Some(SleepState {
            until,
            until_utc,
            wake_events,
            generation: self.sleep_generation,
        });
        if self.state == AgentState::Sleeping {
            debug!("Agent {} sleep extended to {}", self.agent_id, until_utc);
        } else {
            self.transition(AgentState::Sleeping, &format!("sleep for {:?}", duration));
        }
    }

    fn on_timer(&mut self, generation: u64) {
        let current = self.sleep.as_ref().map(|s| s.generation);
        if self.state == AgentState::Sleeping && current == Some(generation) {
            self.wake_now("timer");
        } else {
            debug!("Agent {} stale sleep timer ignored", self.agent_id);
        }
    }

    /// Sleeping → Active (or back to Processing if a task is still in flight)
    fn wake_now(&mut self, reason: &str) {
        if self.state != AgentState::Sleeping {
            return;
        }
        self.sleep = None;
        self.sleep_generation += 1;
        self.last_active = Utc::now();
        let next = if self.running.is_some() {
            AgentState::Processing
        } else {
            AgentState::Active
        };
        self.transition(next, reason);
    }

    fn maybe_start_next(&mut self) {
        if self.state != AgentState::Active || self.running.is_some() {
            return;
        }
        let Some(runner) = self.runner.clone() else {
            return;
        };
        let Some(task) = self.queue.pop_front() else {
            return;
        };

        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let prompt = task.prompt.clone();
        let context = task.context.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => None,
                outcome = runner.run(&prompt, &context) => Some(outcome),
            }
        });

        info!("Agent {} started task {}", self.agent_id, task.task_id);
        emit(
            &self.events,
            RuntimeEvent::TaskStarted {
                agent_id: self.agent_id.clone(),
                task_id: task.task_id.clone(),
            },
        );
        self.last_active = Utc::now();
        self.running = Some(RunningTask {
            task,
            started_at: Utc::now(),
            cancel,
            handle,
        });
        self.transition(AgentState::Processing, "task started");
    }

    fn finish_task(&mut self, running: RunningTask, joined: TurnJoin) {
        self.complete_task(running, joined);
        if self.state == AgentState::Processing {
            self.transition(AgentState::Active, "task finished");
        }
    }

    fn complete_task(&mut self, running: RunningTask, joined: TurnJoin) {
        let result = self.build_result(running, joined);
        match result.status {
            TaskStatus::Completed => info!(
                "Agent {} completed task {} in {} iteration(s)",
                self.agent_id, result.task_id, result.iterations
            ),
            TaskStatus::Failed => warn!(
                "Agent {} task {} failed: {}",
                self.agent_id,
                result.task_id,
                result.error.as_deref().unwrap_or("unknown error")
            ),
            TaskStatus::Abandoned => info!("Agent {} abandoned task {}", self.agent_id, result.task_id),
        }
        self.last_active = Utc::now();
        self.record(result);
    }

    fn build_result(&self, running: RunningTask, joined: TurnJoin) -> TaskResult {
        let RunningTask { task, started_at, .. } = running;
        let mut result = TaskResult {
            task_id: task.task_id,
            agent_id: self.agent_id.clone(),
            prompt: task.prompt,
            status: TaskStatus::Completed,
            output: String::new(),
            messages: Vec::new(),
            iterations: 0,
            stop_reason: String::new(),
            error: None,
            started_at,
            finished_at: Utc::now(),
        };
        match joined {
            Ok(Some(Ok(outcome))) => {
                result.output = outcome.output;
                result.messages = outcome.messages;
                result.iterations = outcome.iterations;
                result.stop_reason = outcome.stop_reason;
            }
            Ok(Some(Err(e))) => {
                result.status = TaskStatus::Failed;
                result.stop_reason = "error".to_string();
                result.error = Some(format!("{:#}", e));
            }
            Ok(None) => {
                result.status = TaskStatus::Abandoned;
                result.stop_reason = "stopped".to_string();
            }
            Err(e) if e.is_cancelled() => {
                result.status = TaskStatus::Abandoned;
                result.stop_reason = "aborted".to_string();
            }
            Err(e) => {
                error!("Agent {} task panicked: {}", self.agent_id, e);
                result.status = TaskStatus::Failed;
                result.stop_reason = "panic".to_string();
                result.error = Some(e.to_string());
            }
        }
        result
    }

    fn record(&self, result: TaskResult) {
        {
            let mut results = self
                .results
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            results.push_back(result.clone());
            while results.len() > self.config.result_history.max(1) {
                results.pop_front();
            }
        }
        emit(
            &self.events,
            RuntimeEvent::TaskFinished {
                agent_id: self.agent_id.clone(),
                result,
            },
        );
    }

    async fn shutdown(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.cancel.cancel();
            match tokio::time::timeout(self.config.stop_grace, &mut running.handle).await {
                Ok(joined) => self.complete_task(running, joined),
                Err(_) => {
                    warn!(
                        "Agent {} task {} did not stop within {:?}; aborting",
                        self.agent_id, running.task.task_id, self.config.stop_grace
                    );
                    running.handle.abort();
                    self.complete_task(running, Ok(None));
                }
            }
        }

        let dropped = self.queue.len();
        self.queue.clear();
        if dropped > 0 {
            info!("Agent {} discarded {} queued task(s)", self.agent_id, dropped);
        }
        self.sleep = None;
        if self.runner.take().is_some() {
            debug!("Agent {} released its provider", self.agent_id);
        }
        self.transition(AgentState::Stopped, "stopped");
        self.publish_snapshot();
    }

    fn transition(&mut self, to: AgentState, reason: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!("Agent {} {} → {} ({})", self.agent_id, from, to, reason);
        emit(
            &self.events,
            RuntimeEvent::StateChanged {
                agent_id: self.agent_id.clone(),
                from,
                to,
                reason: reason.to_string(),
            },
        );
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent_id.clone(),
            state: self.state,
            queue_depth: self.queue.len(),
            current_task: self.running.as_ref().map(|r| CurrentTask {
                task_id: r.task.task_id.clone(),
                prompt: r.task.prompt.clone(),
                started_at: r.started_at,
            }),
            last_active: self.last_active,
            sleep_until: self.sleep.as_ref().map(|s| s.until_utc),
            wake_events: self
                .sleep
                .as_ref()
                .map(|s| s.wake_events.clone())
                .unwrap_or_default(),
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
