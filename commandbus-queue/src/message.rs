//! Wire-level message types returned by the queue adapter.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A message read from a PGMQ queue, still holding its visibility lease.
///
/// Mirrors the shape `spec.md` §4.1 requires of `read`: `msg_id`, `read_ct`,
/// `enqueued_at`, `vt`, and the raw JSON `payload`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub vt: DateTime<Utc>,
    pub payload: Value,
}

/// Queue naming conventions from `spec.md` §4.1/§6.
///
/// `<domain>__commands` carries inbound commands; `<domain>__process_replies`
/// is the dedicated reply queue a process manager listens on. Application
/// reply queues (`reply_to`) are opaque strings chosen by the caller.
#[derive(Debug, Clone, Copy)]
pub struct QueueNames;

impl QueueNames {
    pub fn commands(domain: &str) -> String {
        format!("{domain}__commands")
    }

    pub fn process_replies(domain: &str) -> String {
        format!("{domain}__process_replies")
    }

    /// NOTIFY channel signaling "new messages may be available" for a domain.
    pub fn notify_channel(domain: &str) -> String {
        format!("commandbus.{domain}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_follow_domain_convention() {
        assert_eq!(QueueNames::commands("payments"), "payments__commands");
        assert_eq!(
            QueueNames::process_replies("reporting"),
            "reporting__process_replies"
        );
        assert_eq!(QueueNames::notify_channel("payments"), "commandbus.payments");
    }
}
