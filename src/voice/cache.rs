//! Bounded FIFO cache of synthesized audio
//!
//! Keys are exact (already normalized) segment texts. Eviction is strictly by
//! insertion order: lookups never refresh an entry.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::AudioBuffer;

/// Default number of cached segments
pub const DEFAULT_CACHE_CAPACITY: usize = 20;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, AudioBuffer>,
    /// Keys from oldest to newest insertion
    order: VecDeque<String>,
}

/// Text → audio cache with FIFO eviction
#[derive(Debug)]
pub struct SynthesisCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Default for SynthesisCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl SynthesisCache {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Look up audio for an exact, case-sensitive key
    #[must_use]
    pub fn get(&self, text: &str) -> Option<AudioBuffer> {
        let inner = self.inner.lock().ok()?;
        inner.entries.get(text).cloned()
    }

    /// Insert audio, evicting the oldest inserted entry when full
    ///
    /// Replacing an existing key keeps its original insertion position.
    pub fn put(&self, text: &str, audio: AudioBuffer) {
        let Ok(mut inner) = self.inner.lock() else {
            tracing::warn!("synthesis cache lock poisoned, skipping insert");
            return;
        };

        if let Some(entry) = inner.entries.get_mut(text) {
            *entry = audio;
            return;
        }

        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            tracing::trace!(key = %oldest, "evicted cached segment");
        }

        inner.order.push_back(text.to_string());
        inner.entries.insert(text.to_string(), audio);
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
