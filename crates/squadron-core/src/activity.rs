//! In-memory Activity Log: a bounded-history, broadcast fan-out channel
//! keyed by owner (`agent_id` or `pipeline_run_id`), plus a per-agent
//! `Mailbox` for reactive wake-up messages.
//!
//! Generalizes the per-task stream manager into an owner-keyed one: the
//! orchestrator has many more kinds of "thing with a live log" than a
//! single task id (agents, pipeline runs, gate checks), so the key is now
//! a plain string rather than an integer task id.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

const MAX_HISTORY_EVENTS: usize = 10_000;
const CHANNEL_CAPACITY: usize = 512;

struct OwnerLog {
    history: Vec<String>,
    tx: broadcast::Sender<String>,
}

/// Fan-out log of JSON-encoded activity events, keyed by owner id.
pub struct ActivityLog {
    owners: Mutex<HashMap<String, OwnerLog>>,
    ring_size: usize,
}

impl ActivityLog {
    pub fn new(ring_size: usize) -> Self {
        Self {
            owners: Mutex::new(HashMap::new()),
            ring_size: ring_size.max(1),
        }
    }

    pub fn push(&self, owner: &str, line: String) {
        let mut owners = self.owners.lock().unwrap();
        let entry = owners.entry(owner.to_string()).or_insert_with(|| OwnerLog {
            history: Vec::new(),
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        });
        entry.history.push(line.clone());
        if entry.history.len() > self.ring_size.min(MAX_HISTORY_EVENTS) {
            let overflow = entry.history.len() - self.ring_size.min(MAX_HISTORY_EVENTS);
            entry.history.drain(0..overflow);
        }
        // a slow subscriber simply misses lines once the channel's bounded
        // capacity is exceeded; that's an accepted tradeoff for a live tail
        let _ = entry.tx.send(line);
    }

    /// Returns replayable history plus a live receiver, or `None` if
    /// nothing has ever been logged for `owner`.
    pub fn subscribe(&self, owner: &str) -> (Vec<String>, Option<broadcast::Receiver<String>>) {
        let owners = self.owners.lock().unwrap();
        match owners.get(owner) {
            Some(entry) => (entry.history.clone(), Some(entry.tx.subscribe())),
            None => (Vec::new(), None),
        }
    }

    pub fn history(&self, owner: &str, limit: usize) -> Vec<String> {
        let owners = self.owners.lock().unwrap();
        match owners.get(owner) {
            Some(entry) => {
                let start = entry.history.len().saturating_sub(limit);
                entry.history[start..].to_vec()
            }
            None => Vec::new(),
        }
    }
}

/// FIFO mailbox of pending reactive messages per agent, backed by the
/// registry for durability across restarts. Enqueue is idempotent by
/// message id so a redelivered event does not double-wake an agent.
pub struct Mailbox<'a> {
    db: &'a crate::db::Db,
}

impl<'a> Mailbox<'a> {
    pub fn new(db: &'a crate::db::Db) -> Self {
        Self { db }
    }

    pub fn enqueue(&self, agent_id: &str, role: &str, content: String) -> anyhow::Result<()> {
        self.db.append_mail(&crate::types::MailMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            content,
            created_at: chrono::Utc::now(),
        })
    }

    pub fn drain(&self, agent_id: &str) -> anyhow::Result<Vec<crate::types::MailMessage>> {
        self.db.drain_mail(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_capped_at_ring_size() {
        let log = ActivityLog::new(3);
        for i in 0..10 {
            log.push("agent-1", format!("line {i}"));
        }
        let (history, _) = log.subscribe("agent-1");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0], "line 7");
    }

    #[test]
    fn unknown_owner_has_no_history() {
        let log = ActivityLog::new(10);
        let (history, rx) = log.subscribe("nobody");
        assert!(history.is_empty());
        assert!(rx.is_none());
    }

    #[tokio::test]
    async fn live_subscriber_receives_pushed_lines() {
        let log = ActivityLog::new(10);
        log.push("agent-1", "first".to_string());
        let (_, rx) = log.subscribe("agent-1");
        let mut rx = rx.unwrap();
        log.push("agent-1", "second".to_string());
        let received = rx.recv().await.unwrap();
        assert_eq!(received, "second");
    }

    #[test]
    fn mailbox_drains_through_db() {
        let db = crate::db::Db::open_in_memory().unwrap();
        let mailbox = Mailbox::new(&db);
        mailbox.enqueue("agent-1", "user", "hello".to_string()).unwrap();
        let drained = mailbox.drain("agent-1").unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].content, "hello");
    }
}
