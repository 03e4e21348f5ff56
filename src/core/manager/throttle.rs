//! Keyed rate limiting for quality-warning logs.
//!
//! A one-token bucket per `(source, symbol)` key: the first call passes,
//! further calls are suppressed until the cooldown refills the token.

use std::collections::HashMap;

use parking_lot::Mutex;

pub struct LogThrottle {
    last_emit: Mutex<HashMap<(String, String), i64>>,
    cooldown_ms: i64,
}

impl LogThrottle {
    #[must_use]
    pub fn new(cooldown_ms: i64) -> Self {
        Self { last_emit: Mutex::new(HashMap::new()), cooldown_ms }
    }

    /// Whether a warning for this key may be emitted now.
    pub fn allow(&self, source: &str, symbol: &str, now_ms: i64) -> bool {
        let mut last_emit = self.last_emit.lock();
        let key = (source.to_string(), symbol.to_string());
        match last_emit.get(&key) {
            Some(last) if now_ms - last < self.cooldown_ms => false,
            _ => {
                last_emit.insert(key, now_ms);
                // Drop long-idle keys so the map stays small.
                if last_emit.len() > 4_096 {
                    let horizon = now_ms - 2 * self.cooldown_ms;
                    last_emit.retain(|_, t| *t >= horizon);
                }
                true
            }
        }
    }
}
