//! Message classification: category, priority, and throttle eligibility.
//!
//! Every outbound message is matched against a configurable table of prefix
//! rules keyed on its wire label (the same labels the legacy text protocol
//! uses). The longest matching prefix wins; unmatched messages fall into the
//! Misc category at Normal priority.

use crate::queue::SendPriority;
use serde::{Deserialize, Serialize};

/// Bandwidth-shaping category a message is billed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageCategory {
    /// Connection control; always admitted by the shaper.
    Critical,
    /// Game actions (commands, world state, teleports).
    Gameplay,
    /// Movement traffic.
    Position,
    /// Chat, whispers, announcements.
    Chat,
    /// Metrics and reporting.
    Telemetry,
    /// Everything else.
    Misc,
}

impl MessageCategory {
    /// Every category, in a stable order.
    pub const ALL: [MessageCategory; 6] = [
        MessageCategory::Critical,
        MessageCategory::Gameplay,
        MessageCategory::Position,
        MessageCategory::Chat,
        MessageCategory::Telemetry,
        MessageCategory::Misc,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            MessageCategory::Critical => 0,
            MessageCategory::Gameplay => 1,
            MessageCategory::Position => 2,
            MessageCategory::Chat => 3,
            MessageCategory::Telemetry => 4,
            MessageCategory::Misc => 5,
        }
    }
}

/// One classification rule: messages whose label starts with `prefix` get
/// this category, priority, and throttle treatment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRule {
    /// Label prefix the rule matches on.
    pub prefix: String,
    /// Shaping category.
    pub category: MessageCategory,
    /// Outbound-queue priority.
    pub priority: SendPriority,
    /// Whether the message bypasses bandwidth shaping entirely.
    pub throttle_exempt: bool,
}

impl MessageRule {
    fn new(
        prefix: &str,
        category: MessageCategory,
        priority: SendPriority,
        throttle_exempt: bool,
    ) -> Self {
        Self {
            prefix: prefix.to_string(),
            category,
            priority,
            throttle_exempt,
        }
    }
}

/// The outcome of classifying one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    /// Shaping category.
    pub category: MessageCategory,
    /// Outbound-queue priority.
    pub priority: SendPriority,
    /// Whether shaping is bypassed.
    pub throttle_exempt: bool,
}

/// Longest-prefix classification table.
#[derive(Debug, Clone)]
pub struct MessageTable {
    rules: Vec<MessageRule>,
}

impl MessageTable {
    /// Table with the built-in rules: auth/heartbeat/disconnect traffic is
    /// Critical, chat-like traffic is High, movement is Normal, and
    /// everything else defaults to Normal priority in the Misc category.
    pub fn with_defaults() -> Self {
        use MessageCategory as C;
        use SendPriority as P;
        Self {
            rules: vec![
                MessageRule::new("PING", C::Critical, P::Critical, true),
                MessageRule::new("DISCONNECT", C::Critical, P::Critical, true),
                MessageRule::new("AUTH", C::Critical, P::Critical, true),
                MessageRule::new("AUTH_RESULT", C::Critical, P::Critical, true),
                MessageRule::new("REGISTER", C::Critical, P::Critical, true),
                MessageRule::new("CHAT", C::Chat, P::High, false),
                MessageRule::new("SYSTEM", C::Chat, P::High, false),
                MessageRule::new("WHISPER", C::Chat, P::High, false),
                MessageRule::new("POSITION", C::Position, P::Normal, false),
                MessageRule::new("MOVE_DELTA", C::Position, P::Normal, false),
                MessageRule::new("TELEPORT", C::Gameplay, P::Normal, false),
                MessageRule::new("COMMAND", C::Gameplay, P::Normal, false),
                MessageRule::new("WORLD_STATE", C::Gameplay, P::Normal, false),
            ],
        }
    }

    /// Install or replace the rule for `rule.prefix`.
    pub fn set_rule(&mut self, rule: MessageRule) {
        match self.rules.iter_mut().find(|r| r.prefix == rule.prefix) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    /// Number of installed rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classify a message by its wire label. Longest matching prefix wins.
    pub fn classify(&self, label: &str) -> Classified {
        let mut best: Option<&MessageRule> = None;
        for rule in &self.rules {
            if label.starts_with(rule.prefix.as_str()) {
                match best {
                    Some(current) if current.prefix.len() >= rule.prefix.len() => {}
                    _ => best = Some(rule),
                }
            }
        }
        match best {
            Some(rule) => Classified {
                category: rule.category,
                priority: rule.priority,
                throttle_exempt: rule.throttle_exempt,
            },
            None => Classified {
                category: MessageCategory::Misc,
                priority: SendPriority::Normal,
                throttle_exempt: false,
            },
        }
    }
}
