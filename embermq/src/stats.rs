use serde_json::json;

use embermq_utils::Counter;

/// Broker-wide gauges with max watermarks. Shared by the stores and the
/// worker runtime; cheap enough to bump on every hot-path event.
pub struct Stats {
    pub connections: Counter,
    pub sessions: Counter,
    pub subscriptions: Counter,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[inline]
    pub fn new() -> Stats {
        Stats { connections: Counter::new(), sessions: Counter::new(), subscriptions: Counter::new() }
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "connections": self.connections.to_json(),
            "sessions": self.sessions.to_json(),
            "subscriptions": self.subscriptions.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Stats;

    #[test]
    fn json_shape() {
        let stats = Stats::new();
        stats.sessions.inc();
        stats.sessions.inc();
        stats.sessions.dec();
        let v = stats.to_json();
        assert_eq!(v["sessions"]["count"], 1);
        assert_eq!(v["sessions"]["max"], 2);
        assert_eq!(v["connections"]["count"], 0);
    }
}
