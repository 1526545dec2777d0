use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

pub const DEFAULT_CORRELATION_CAPACITY: usize = 10_000;
pub const DEFAULT_CORRELATION_MAX_AGE: Duration = Duration::from_secs(300);

/// Where the reply to a forwarded request must go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResponse {
    pub topic: String,
    pub is_external: bool,
}

#[derive(Debug)]
struct PendingEntry {
    response: PendingResponse,
    inserted_at: Instant,
}

/// Single-consume map from RequestID to the pending response destination.
///
/// Bounded by capacity and entry age: an entry older than `max_age` reads as
/// absent, expired entries are purged on insert and a full registry evicts its
/// oldest entry. All access goes through one lock.
#[derive(Debug)]
pub struct CorrelationRegistry {
    entries: Mutex<HashMap<String, PendingEntry>>,
    capacity: usize,
    max_age: Duration,
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CORRELATION_CAPACITY, DEFAULT_CORRELATION_MAX_AGE)
    }
}

impl CorrelationRegistry {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            max_age,
        }
    }

    /// Insert or overwrite the destination for `request_id`
    pub fn set_response_topic(&self, request_id: &str, topic: &str, is_external: bool) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        entries.retain(|_, entry| now.duration_since(entry.inserted_at) < self.max_age);

        if entries.len() >= self.capacity && !entries.contains_key(request_id) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                warn!(request_id = %oldest, "correlation registry full, evicting oldest entry");
                entries.remove(&oldest);
            }
        }

        entries.insert(
            request_id.to_string(),
            PendingEntry {
                response: PendingResponse {
                    topic: topic.to_string(),
                    is_external,
                },
                inserted_at: now,
            },
        );
    }

    /// Remove and return the destination for `request_id`
    pub fn response_topic(&self, request_id: &str) -> Option<PendingResponse> {
        let entry = self.entries.lock().remove(request_id)?;
        if entry.inserted_at.elapsed() >= self.max_age {
            return None;
        }
        Some(entry.response)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
