//! Key layout for one logical queue.
//!
//! `dq:{name}:ready`, `dq:{name}:retry`, `dq:{name}:data`. The braces are a
//! cluster hash tag so all three keys share a slot and the scripts touching
//! them stay single-slot.

const PREFIX: &str = "dq";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// FIFO list of ids ready to be taken.
    pub ready: String,
    /// Sorted set of ids keyed by next-due epoch millis.
    pub retry: String,
    /// Hash of id to serialized message row.
    pub data: String,
}

impl QueueKeys {
    pub fn new(name: &str) -> Self {
        Self {
            ready: format!("{PREFIX}:{{{name}}}:ready"),
            retry: format!("{PREFIX}:{{{name}}}:retry"),
            data: format!("{PREFIX}:{{{name}}}:data"),
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.ready, &self.retry, &self.data]
    }
}
