//! In-process store.
//!
//! Same semantics as the Redis scripts, with a single `parking_lot` mutex
//! standing in for script atomicity. Useful for tests and for embedding a
//! queue inside one process; nothing survives a restart.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

use super::{millis, score, QueueStats, QueueStore, Take};
use crate::error::Result;
use crate::keys::QueueKeys;
use crate::message::Message;

#[derive(Debug, Default)]
struct Space {
    ready: VecDeque<String>,
    pending_by_id: HashMap<String, i64>,
    pending_by_score: BTreeSet<(i64, String)>,
    data: HashMap<String, Vec<u8>>,
}

impl Space {
    fn arm(&mut self, id: &str, due: i64) {
        self.disarm(id);
        self.pending_by_id.insert(id.to_string(), due);
        self.pending_by_score.insert((due, id.to_string()));
    }

    fn disarm(&mut self, id: &str) -> bool {
        match self.pending_by_id.remove(id) {
            Some(old) => {
                self.pending_by_score.remove(&(old, id.to_string()));
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    spaces: Mutex<HashMap<String, Space>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw row for `id`, if stored.
    pub fn row(&self, keys: &QueueKeys, id: &str) -> Option<Vec<u8>> {
        self.spaces
            .lock()
            .get(&keys.data)
            .and_then(|s| s.data.get(id).cloned())
    }

    /// Pending-set score for `id`, if armed.
    pub fn pending_score(&self, keys: &QueueKeys, id: &str) -> Option<i64> {
        self.spaces
            .lock()
            .get(&keys.data)
            .and_then(|s| s.pending_by_id.get(id).copied())
    }

    /// Whether `id` sits in the ready list.
    pub fn is_ready(&self, keys: &QueueKeys, id: &str) -> bool {
        self.spaces
            .lock()
            .get(&keys.data)
            .is_some_and(|s| s.ready.iter().any(|r| r == id))
    }

    /// Overwrite a row verbatim, bypassing encoding.
    pub fn put_raw(&self, keys: &QueueKeys, id: &str, raw: Vec<u8>) {
        let mut spaces = self.spaces.lock();
        let space = spaces.entry(keys.data.clone()).or_default();
        space.data.insert(id.to_string(), raw);
    }
}

impl QueueStore for InMemoryQueueStore {
    async fn produce(&self, keys: &QueueKeys, message: &Message, now: DateTime<Utc>) -> Result<()> {
        let row = message.encode()?;
        let mut spaces = self.spaces.lock();
        let space = spaces.entry(keys.data.clone()).or_default();

        space.data.insert(message.id.clone(), row);
        match message.deliver_at {
            Some(at) if !message.is_immediate(now) => space.arm(&message.id, score(at)),
            _ => space.ready.push_back(message.id.clone()),
        }
        Ok(())
    }

    async fn take_one(
        &self,
        keys: &QueueKeys,
        retry_interval: Duration,
        max_deliveries: u64,
        now: DateTime<Utc>,
    ) -> Result<Take> {
        let mut spaces = self.spaces.lock();
        let Some(space) = spaces.get_mut(&keys.data) else {
            return Ok(Take::Empty);
        };
        let Some(id) = space.ready.pop_front() else {
            return Ok(Take::Empty);
        };
        let Some(raw) = space.data.get(&id).cloned() else {
            debug!(message_id = %id, "ready id without a row, dropping");
            space.disarm(&id);
            return Ok(Take::Empty);
        };

        let next_due = score(now).saturating_add(millis(retry_interval));
        let row = match Message::decode(&raw) {
            Ok(mut msg) => {
                if msg.deliver_cnt >= max_deliveries {
                    space.data.remove(&id);
                    space.disarm(&id);
                    return Ok(Take::Exhausted {
                        id,
                        deliver_cnt: msg.deliver_cnt,
                    });
                }
                msg.deliver_cnt += 1;
                msg.re_deliver_at = Some(now);
                let row = msg.encode()?;
                space.data.insert(id.clone(), row.clone());
                row
            }
            // undecodable rows still get armed; the worker reports the failure
            Err(_) => raw,
        };
        space.arm(&id, next_due);
        Ok(Take::Taken(row))
    }

    async fn commit(&self, keys: &QueueKeys, id: &str) -> Result<bool> {
        let mut spaces = self.spaces.lock();
        let Some(space) = spaces.get_mut(&keys.data) else {
            return Ok(false);
        };
        space.disarm(id);
        Ok(space.data.remove(id).is_some())
    }

    async fn reschedule(&self, keys: &QueueKeys, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut spaces = self.spaces.lock();
        let Some(space) = spaces.get_mut(&keys.data) else {
            return Ok(false);
        };
        let Some(raw) = space.data.get(id).cloned() else {
            return Ok(false);
        };

        if let Ok(mut msg) = Message::decode(&raw) {
            msg.deliver_at = Some(at);
            space.data.insert(id.to_string(), msg.encode()?);
        }
        space.ready.retain(|r| r != id);
        space.arm(id, score(at));
        Ok(true)
    }

    async fn promote_due(&self, keys: &QueueKeys, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let mut spaces = self.spaces.lock();
        let Some(space) = spaces.get_mut(&keys.data) else {
            return Ok(0);
        };

        let cutoff = score(now);
        let due: Vec<(i64, String)> = space
            .pending_by_score
            .iter()
            .take_while(|(s, _)| *s <= cutoff)
            .take(limit)
            .cloned()
            .collect();

        for (s, id) in &due {
            space.pending_by_score.remove(&(*s, id.clone()));
            space.pending_by_id.remove(id);
            space.ready.push_back(id.clone());
        }
        Ok(due.len())
    }

    async fn stats(&self, keys: &QueueKeys) -> Result<QueueStats> {
        let spaces = self.spaces.lock();
        Ok(spaces
            .get(&keys.data)
            .map(|s| QueueStats {
                ready: s.ready.len() as u64,
                pending: s.pending_by_id.len() as u64,
                stored: s.data.len() as u64,
            })
            .unwrap_or_default())
    }

    async fn purge(&self, keys: &QueueKeys) -> Result<()> {
        self.spaces.lock().remove(&keys.data);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
