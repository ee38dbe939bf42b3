//! Per-agent mailboxes and the post office that routes mail between them

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConclaveError, Result};

/// Mail priority, informational only; delivery order is arrival order
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MailPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl MailPriority {
    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for MailPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailStatus {
    Unread,
    Read,
}

/// A message between two agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mail {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub priority: MailPriority,
    pub status: MailStatus,
    pub timestamp: DateTime<Utc>,
}

/// Fields supplied by a sender
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: MailPriority,
}

impl Envelope {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            priority: MailPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: MailPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Options for [`PostOffice::check_mail`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailQuery {
    #[serde(default = "default_unread_only")]
    pub unread_only: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Mark returned messages read in the same call
    #[serde(default)]
    pub mark_read: bool,
}

fn default_unread_only() -> bool {
    true
}

impl Default for MailQuery {
    fn default() -> Self {
        Self {
            unread_only: true,
            limit: None,
            mark_read: false,
        }
    }
}

/// Result of a mailbox read
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailCheck {
    pub messages: Vec<Mail>,
    pub count: usize,
    pub total_count: usize,
    pub truncated: bool,
}

/// Handed to the delivery hook once mail is enqueued
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub from: String,
    pub to: String,
    pub message_id: String,
    /// Sender asked for the recipient to become the active agent
    pub switch_requested: bool,
}

pub type DeliveryHook = Arc<dyn Fn(Delivery) + Send + Sync>;

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One agent's inbox. Appends hold the write lock only for the push.
#[derive(Debug)]
pub struct Mailbox {
    owner: String,
    messages: RwLock<Vec<Mail>>,
    closed: AtomicBool,
}

impl Mailbox {
    fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            messages: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn push(&self, mail: Mail) -> Result<()> {
        let mut messages = write_lock(&self.messages);
        // Re-checked under the lock so a concurrent close wins cleanly
        if self.is_closed() {
            return Err(ConclaveError::MailboxUnavailable(self.owner.clone()));
        }
        messages.push(mail);
        Ok(())
    }

    fn check(&self, query: &MailQuery) -> MailCheck {
        let matching: Vec<Mail> = {
            let messages = read_lock(&self.messages);
            messages
                .iter()
                .filter(|m| !query.unread_only || m.status == MailStatus::Unread)
                .cloned()
                .collect()
        };

        let total_count = matching.len();
        let limit = query.limit.unwrap_or(usize::MAX);
        let messages: Vec<Mail> = matching.into_iter().take(limit).collect();
        let count = messages.len();

        if query.mark_read && count > 0 {
            let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
            self.acknowledge(&ids);
        }

        MailCheck {
            messages,
            count,
            total_count,
            truncated: total_count > count,
        }
    }

    fn acknowledge(&self, ids: &[&str]) -> usize {
        let mut messages = write_lock(&self.messages);
        let mut marked = 0;
        for mail in messages.iter_mut() {
            if mail.status == MailStatus::Unread && ids.contains(&mail.message_id.as_str()) {
                mail.status = MailStatus::Read;
                marked += 1;
            }
        }
        marked
    }

    pub fn len(&self) -> usize {
        read_lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unread_count(&self) -> usize {
        read_lock(&self.messages)
            .iter()
            .filter(|m| m.status == MailStatus::Unread)
            .count()
    }
}

struct PostOfficeInner {
    boxes: RwLock<HashMap<String, Arc<Mailbox>>>,
    on_delivery: Option<DeliveryHook>,
}

/// Routes mail between the agents of one session. Cheap to clone.
#[derive(Clone)]
pub struct PostOffice {
    inner: Arc<PostOfficeInner>,
}

impl std::fmt::Debug for PostOffice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostOffice")
            .field("mailboxes", &read_lock(&self.inner.boxes).len())
            .field("has_delivery_hook", &self.inner.on_delivery.is_some())
            .finish()
    }
}

impl Default for PostOffice {
    fn default() -> Self {
        Self::new()
    }
}

impl PostOffice {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PostOfficeInner {
                boxes: RwLock::new(HashMap::new()),
                on_delivery: None,
            }),
        }
    }

    /// Post office that reports every enqueued message to `hook`
    pub fn with_delivery_hook(hook: DeliveryHook) -> Self {
        Self {
            inner: Arc::new(PostOfficeInner {
                boxes: RwLock::new(HashMap::new()),
                on_delivery: Some(hook),
            }),
        }
    }

    /// Open (or reopen) the mailbox for `agent_id`. Existing mail is kept.
    pub fn open(&self, agent_id: &str) -> Arc<Mailbox> {
        let mut boxes = write_lock(&self.inner.boxes);
        let mailbox = boxes
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mailbox::new(agent_id)))
            .clone();
        if mailbox.is_closed() {
            debug!("Reopening mailbox for {}", agent_id);
            mailbox.reopen();
        }
        mailbox
    }

    /// Close the mailbox; later sends fail with `MailboxUnavailable`
    pub fn close(&self, agent_id: &str) -> bool {
        match read_lock(&self.inner.boxes).get(agent_id) {
            Some(mailbox) => {
                mailbox.close();
                debug!("Closed mailbox for {}", agent_id);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        for mailbox in read_lock(&self.inner.boxes).values() {
            mailbox.close();
        }
    }

    pub fn mailbox(&self, agent_id: &str) -> Option<Arc<Mailbox>> {
        read_lock(&self.inner.boxes).get(agent_id).cloned()
    }

    pub fn is_open(&self, agent_id: &str) -> bool {
        self.mailbox(agent_id).is_some_and(|m| !m.is_closed())
    }

    /// Enqueue mail for `envelope.to`, returning the new message id
    pub fn send(&self, envelope: Envelope) -> Result<String> {
        self.deliver(envelope, false)
    }

    /// Send, then ask the owning session to make the recipient active.
    /// The switch request travels through the delivery hook.
    pub fn send_with_switch(&self, envelope: Envelope) -> Result<String> {
        self.deliver(envelope, true)
    }

    fn deliver(&self, envelope: Envelope, switch_requested: bool) -> Result<String> {
        let mailbox = self
            .mailbox(&envelope.to)
            .ok_or_else(|| ConclaveError::MailboxUnavailable(envelope.to.clone()))?;

        let mail = Mail {
            message_id: uuid::Uuid::new_v4().to_string(),
            from: envelope.from,
            to: envelope.to,
            subject: envelope.subject,
            body: envelope.body,
            priority: envelope.priority,
            status: MailStatus::Unread,
            timestamp: Utc::now(),
        };
        let delivery = Delivery {
            from: mail.from.clone(),
            to: mail.to.clone(),
            message_id: mail.message_id.clone(),
            switch_requested,
        };
        debug!(
            "Mail {} from {} to {} ({})",
            delivery.message_id, delivery.from, delivery.to, mail.priority
        );
        mailbox.push(mail)?;

        match &self.inner.on_delivery {
            Some(hook) => {
                if switch_requested {
                    info!(
                        "Mail {} requests switch from {} to {}",
                        delivery.message_id, delivery.from, delivery.to
                    );
                }
                let message_id = delivery.message_id.clone();
                hook(delivery);
                Ok(message_id)
            }
            None => {
                if switch_requested {
                    debug!("No delivery hook registered; mail {} sent without switch", delivery.message_id);
                }
                Ok(delivery.message_id)
            }
        }
    }

    /// Read mail in arrival order. A closed mailbox can still be read.
    pub fn check_mail(&self, agent_id: &str, query: &MailQuery) -> Result<MailCheck> {
        let mailbox = self
            .mailbox(agent_id)
            .ok_or_else(|| ConclaveError::MailboxUnavailable(agent_id.to_string()))?;
        Ok(mailbox.check(query))
    }

    /// Mark the given messages read, returning how many changed state
    pub fn acknowledge(&self, agent_id: &str, message_ids: &[String]) -> Result<usize> {
        let mailbox = self
            .mailbox(agent_id)
            .ok_or_else(|| ConclaveError::MailboxUnavailable(agent_id.to_string()))?;
        let ids: Vec<&str> = message_ids.iter().map(String::as_str).collect();
        Ok(mailbox.acknowledge(&ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn office_with(agents: &[&str]) -> PostOffice {
        let office = PostOffice::new();
        for agent in agents {
            office.open(agent);
        }
        office
    }

    #[test]
    fn test_send_and_check_in_arrival_order() {
        let office = office_with(&["a", "b"]);
        office.send(Envelope::new("a", "b", "s1", "first")).unwrap();
        office.send(Envelope::new("a", "b", "s2", "second")).unwrap();

        let check = office.check_mail("b", &MailQuery::default()).unwrap();
        assert_eq!(check.count, 2);
        assert_eq!(check.total_count, 2);
        assert!(!check.truncated);
        assert_eq!(check.messages[0].body, "first");
        assert_eq!(check.messages[1].body, "second");
        assert_eq!(check.messages[0].status, MailStatus::Unread);
    }

    #[test]
    fn test_peek_then_mark_read() {
        let office = office_with(&["a", "b"]);
        office.send(Envelope::new("a", "b", "s", "hello")).unwrap();

        let peek = office.check_mail("b", &MailQuery::default()).unwrap();
        assert_eq!(peek.count, 1);
        let again = office.check_mail("b", &MailQuery::default()).unwrap();
        assert_eq!(again.count, 1, "peek must not consume mail");

        let query = MailQuery {
            mark_read: true,
            ..MailQuery::default()
        };
        let read = office.check_mail("b", &query).unwrap();
        assert_eq!(read.count, 1);
        let after = office.check_mail("b", &MailQuery::default()).unwrap();
        assert_eq!(after.count, 0);

        let all = office
            .check_mail(
                "b",
                &MailQuery {
                    unread_only: false,
                    ..MailQuery::default()
                },
            )
            .unwrap();
        assert_eq!(all.count, 1);
        assert_eq!(all.messages[0].status, MailStatus::Read);
    }

    #[test]
    fn test_limit_truncates() {
        let office = office_with(&["a", "b"]);
        for i in 0..5 {
            office.send(Envelope::new("a", "b", "s", format!("m{}", i))).unwrap();
        }
        let query = MailQuery {
            limit: Some(2),
            ..MailQuery::default()
        };
        let check = office.check_mail("b", &query).unwrap();
        assert_eq!(check.count, 2);
        assert_eq!(check.total_count, 5);
        assert!(check.truncated);
        assert_eq!(check.messages[0].body, "m0");
    }

    #[test]
    fn test_acknowledge_counts_only_unread() {
        let office = office_with(&["a", "b"]);
        let id1 = office.send(Envelope::new("a", "b", "s", "1")).unwrap();
        let id2 = office.send(Envelope::new("a", "b", "s", "2")).unwrap();

        let marked = office.acknowledge("b", &[id1.clone(), "missing".to_string()]).unwrap();
        assert_eq!(marked, 1);
        let marked = office.acknowledge("b", &[id1, id2]).unwrap();
        assert_eq!(marked, 1);
        assert_eq!(office.mailbox("b").unwrap().unread_count(), 0);
    }

    #[test]
    fn test_send_to_unknown_or_closed_mailbox_fails() {
        let office = office_with(&["a", "b"]);
        let err = office.send(Envelope::new("a", "ghost", "s", "x")).unwrap_err();
        assert!(matches!(err, ConclaveError::MailboxUnavailable(ref to) if to == "ghost"));

        office.send(Envelope::new("a", "b", "s", "kept")).unwrap();
        assert!(office.close("b"));
        assert!(!office.is_open("b"));
        let err = office.send(Envelope::new("a", "b", "s", "x")).unwrap_err();
        assert!(matches!(err, ConclaveError::MailboxUnavailable(_)));

        // Closed mailbox stays readable and nothing was enqueued
        let check = office.check_mail("b", &MailQuery::default()).unwrap();
        assert_eq!(check.count, 1);

        office.open("b");
        assert!(office.is_open("b"));
        office.send(Envelope::new("a", "b", "s", "again")).unwrap();
        assert_eq!(office.mailbox("b").unwrap().len(), 2);
    }

    #[test]
    fn test_delivery_hook_runs_after_enqueue() {
        let seen: Arc<Mutex<Vec<(Delivery, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let office_slot: Arc<Mutex<Option<PostOffice>>> = Arc::new(Mutex::new(None));

        let seen_hook = seen.clone();
        let slot_hook = office_slot.clone();
        let office = PostOffice::with_delivery_hook(Arc::new(move |delivery: Delivery| {
            let queued = slot_hook
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|o| o.mailbox(&delivery.to))
                .map(|m| m.len())
                .unwrap_or(0);
            seen_hook.lock().unwrap().push((delivery, queued));
        }));
        *office_slot.lock().unwrap() = Some(office.clone());
        office.open("a");
        office.open("b");

        office.send(Envelope::new("a", "b", "fyi", "plain")).unwrap();
        let id = office
            .send_with_switch(Envelope::new("a", "b", "handoff", "your turn").with_priority(MailPriority::High))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].0.switch_requested);
        assert!(seen[1].0.switch_requested);
        assert_eq!(seen[1].0.to, "b");
        assert_eq!(seen[1].0.message_id, id);
        assert_eq!(seen[1].1, 2, "mail must be enqueued before the hook fires");
    }

    #[test]
    fn test_failed_send_does_not_notify() {
        let calls = Arc::new(Mutex::new(0));
        let calls_hook = calls.clone();
        let office = PostOffice::with_delivery_hook(Arc::new(move |_| {
            *calls_hook.lock().unwrap() += 1;
        }));
        office.open("a");
        assert!(office.send_with_switch(Envelope::new("a", "ghost", "s", "x")).is_err());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_senders_serialize() {
        let office = office_with(&["sink"]);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let office = office.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        office
                            .send(Envelope::new(format!("s{}", t), "sink", "load", format!("{}", i)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let check = office
            .check_mail(
                "sink",
                &MailQuery {
                    unread_only: false,
                    ..MailQuery::default()
                },
            )
            .unwrap();
        assert_eq!(check.total_count, 400);

        // Per-sender order is preserved
        let from_s3: Vec<String> = check
            .messages
            .iter()
            .filter(|m| m.from == "s3")
            .map(|m| m.body.clone())
            .collect();
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(from_s3, expected);
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!(MailPriority::from_string("URGENT"), Some(MailPriority::Urgent));
        assert_eq!(MailPriority::from_string("meh"), None);
        assert_eq!(MailPriority::default(), MailPriority::Normal);
        let query: MailQuery = serde_json::from_str("{}").unwrap();
        assert!(query.unread_only);
        assert!(!query.mark_read);
    }
}
