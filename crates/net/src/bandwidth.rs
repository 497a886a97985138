//! Token-bucket bandwidth shaping.
//!
//! One global bucket plus one per message category. Buckets start empty and
//! refill lazily on each consumption attempt, proportional to elapsed time
//! and capped at capacity. Admission for non-critical traffic must succeed
//! against both the category bucket and the global bucket; the category
//! bucket is checked first so a saturated category cannot drain the global
//! pool for everyone else.

use crate::classify::MessageCategory;
use crate::config::{BandwidthConfig, RateBurst};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// Rate limiter accumulating capacity over time.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// New bucket, starting empty.
    pub fn new(rate: f64, capacity: f64, now: Instant) -> Self {
        Self {
            rate,
            capacity,
            tokens: 0.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Tokens available at `now`. Never exceeds the capacity regardless of
    /// how long the bucket sat idle.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Whether `amount` tokens could be consumed at `now`, without
    /// consuming them.
    pub fn can_consume(&mut self, amount: f64, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= amount
    }

    /// Deduct `amount` tokens. Callers check [`Self::can_consume`] first.
    pub fn commit(&mut self, amount: f64) {
        self.tokens = (self.tokens - amount).max(0.0);
    }

    /// Consume `amount` tokens if available.
    pub fn try_consume(&mut self, amount: f64, now: Instant) -> bool {
        if self.can_consume(amount, now) {
            self.commit(amount);
            true
        } else {
            false
        }
    }

    /// Change rate and capacity in place, keeping accumulated tokens (capped
    /// at the new capacity).
    pub fn reconfigure(&mut self, rate: f64, capacity: f64, now: Instant) {
        self.refill(now);
        self.rate = rate;
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity);
    }
}

/// Bandwidth-allocation profile re-weighting the category buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityMode {
    /// Balanced split.
    Normal,
    /// Bias toward gameplay and movement traffic.
    Combat,
    /// Bias toward gameplay and chat traffic.
    Crafting,
}

/// Category shares of the configured global limit, indexed per
/// [`MessageCategory::ALL`]: Critical, Gameplay, Position, Chat, Telemetry,
/// Misc.
const NORMAL_SHARES: [f64; 6] = [0.20, 0.30, 0.25, 0.10, 0.05, 0.10];
const COMBAT_SHARES: [f64; 6] = [0.15, 0.45, 0.30, 0.04, 0.02, 0.04];
const CRAFTING_SHARES: [f64; 6] = [0.15, 0.40, 0.15, 0.20, 0.04, 0.06];

fn mode_shares(mode: PriorityMode) -> &'static [f64; 6] {
    match mode {
        PriorityMode::Normal => &NORMAL_SHARES,
        PriorityMode::Combat => &COMBAT_SHARES,
        PriorityMode::Crafting => &CRAFTING_SHARES,
    }
}

/// Server-requested throttle: level 0 is nominal, level 5 scales the
/// effective global rate to 10%.
fn throttle_scale(level: u8) -> f64 {
    1.0 - 0.18 * f64::from(level.min(5))
}

/// Global plus per-category token buckets with mode re-partitioning and
/// server-requested throttling.
#[derive(Debug)]
pub struct BandwidthShaper {
    nominal: RateBurst,
    overrides: HashMap<MessageCategory, RateBurst>,
    mode: PriorityMode,
    throttle_level: u8,
    global: TokenBucket,
    categories: [TokenBucket; 6],
    admitted: u64,
    denied: u64,
}

impl BandwidthShaper {
    /// Build from configuration; starts in Normal mode at throttle level 0.
    pub fn new(cfg: &BandwidthConfig, now: Instant) -> Self {
        let nominal = RateBurst {
            rate: cfg.global_rate,
            burst: cfg.global_burst,
        };
        let mut shaper = Self {
            nominal,
            overrides: cfg.categories.clone(),
            mode: PriorityMode::Normal,
            throttle_level: 0,
            global: TokenBucket::new(nominal.rate, nominal.burst, now),
            categories: std::array::from_fn(|_| TokenBucket::new(0.0, 0.0, now)),
            admitted: 0,
            denied: 0,
        };
        shaper.rebuild(now);
        shaper
    }

    /// The per-category rate/burst under the current mode.
    fn category_limit(&self, category: MessageCategory) -> RateBurst {
        if self.mode == PriorityMode::Normal {
            if let Some(limit) = self.overrides.get(&category) {
                return *limit;
            }
        }
        let share = mode_shares(self.mode)[category.index()];
        RateBurst {
            rate: self.nominal.rate * share,
            burst: self.nominal.burst * share,
        }
    }

    fn rebuild(&mut self, now: Instant) {
        let scale = throttle_scale(self.throttle_level);
        self.global
            .reconfigure(self.nominal.rate * scale, self.nominal.burst * scale, now);
        for category in MessageCategory::ALL {
            let limit = self.category_limit(category);
            self.categories[category.index()].reconfigure(limit.rate, limit.burst, now);
        }
    }

    /// Switch allocation profile; buckets are re-partitioned in place.
    pub fn set_mode(&mut self, mode: PriorityMode, now: Instant) {
        if self.mode != mode {
            debug!("bandwidth mode -> {mode:?}");
            self.mode = mode;
            self.rebuild(now);
        }
    }

    /// Apply a server-requested throttle level (clamped to 0..=5).
    pub fn set_throttle_level(&mut self, level: u8, now: Instant) {
        let level = level.min(5);
        if self.throttle_level != level {
            debug!("bandwidth throttle level -> {level}");
            self.throttle_level = level;
            self.rebuild(now);
        }
    }

    /// Current allocation profile.
    pub fn mode(&self) -> PriorityMode {
        self.mode
    }

    /// Current throttle level.
    pub fn throttle_level(&self) -> u8 {
        self.throttle_level
    }

    /// Admit or deny a message of `size` units.
    ///
    /// Critical-category and throttle-exempt traffic always passes without
    /// consuming tokens. Everything else must atomically succeed against
    /// both its category bucket and the global bucket; if the category
    /// bucket fails the global bucket is not consumed.
    pub fn try_admit(
        &mut self,
        category: MessageCategory,
        size: f64,
        throttle_exempt: bool,
        now: Instant,
    ) -> bool {
        if throttle_exempt || category == MessageCategory::Critical {
            self.admitted += 1;
            return true;
        }

        if !self.categories[category.index()].can_consume(size, now) {
            self.denied += 1;
            return false;
        }
        if !self.global.can_consume(size, now) {
            self.denied += 1;
            return false;
        }
        self.categories[category.index()].commit(size);
        self.global.commit(size);
        self.admitted += 1;
        true
    }

    /// Messages admitted so far.
    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    /// Messages denied so far.
    pub fn denied(&self) -> u64 {
        self.denied
    }
}
