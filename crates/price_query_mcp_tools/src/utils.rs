use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use futures::lock::Mutex;

/// Sliding-window request limiter keyed by client.
pub struct RateLimiter {
    calls: Mutex<HashMap<String, Vec<Instant>>>,
    window: Duration,
    max_requests: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            window,
            max_requests,
        }
    }

    /// Admits and records the call unless the client already made
    /// `max_requests` calls within the window. Clients with no call left in
    /// the window are forgotten.
    pub async fn check(&self, client: &str) -> bool {
        let mut calls = self.calls.lock().await;
        let now = Instant::now();

        calls.retain(|_, recent| {
            recent.retain(|call| now.duration_since(*call) < self.window);
            !recent.is_empty()
        });

        let recent = calls.entry(client.to_string()).or_default();

        if recent.len() >= self.max_requests {
            log::warn!("rate limit exceeded for client {}", client);
            return false;
        }

        recent.push(now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 100)
    }
}
