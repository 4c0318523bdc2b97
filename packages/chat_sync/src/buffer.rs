//! Content buffer for streamed fragments.
//!
//! Fragments accumulate per message (and per section) and are released as
//! [`BufferedFlush`] batches, so the store is touched a bounded number of
//! times no matter how finely the server slices its output. A batch is
//! released when it reaches the size threshold, when its deadline passes, or
//! when the caller forces it because the stream ended.
//!
//! Each batch gets exactly one deadline, set by its first fragment. Later
//! fragments never push it back, so a steady trickle of tiny fragments cannot
//! starve the flush.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::BufferConfig;
use crate::types::{MessageId, Section, UpdateMode};

/// One batch of accumulated content, ready to apply to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferedFlush {
    pub message_id: MessageId,
    pub section: Option<Section>,
    pub content: String,
    pub mode: UpdateMode,
}

type BufferKey = (MessageId, Option<Section>);

struct Batch {
    text: String,
    chars: usize,
    mode: UpdateMode,
    deadline: Instant,
}

impl Batch {
    fn is_empty(&self) -> bool {
        // An empty Replace still carries meaning: it clears the content.
        self.text.is_empty() && self.mode == UpdateMode::Append
    }
}

pub struct ContentBuffer {
    batches: BTreeMap<BufferKey, Batch>,
    threshold_chars: usize,
    delay: Duration,
}

impl ContentBuffer {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            batches: BTreeMap::new(),
            threshold_chars: config.flush_threshold_chars.max(1),
            delay: config.flush_delay,
        }
    }

    /// Add a fragment. Returns a flush when the batch reached the size threshold.
    pub fn add_fragment(
        &mut self,
        message_id: &MessageId,
        section: Option<Section>,
        text: &str,
        mode: UpdateMode,
        now: Instant,
    ) -> Option<BufferedFlush> {
        let key = (message_id.clone(), section);
        if text.is_empty() && mode == UpdateMode::Append {
            return None;
        }

        let delay = self.delay;
        let batch = self.batches.entry(key.clone()).or_insert_with(|| Batch {
            text: String::new(),
            chars: 0,
            mode: UpdateMode::Append,
            deadline: now + delay,
        });

        match mode {
            UpdateMode::Append => {
                batch.text.push_str(text);
                batch.chars += text.chars().count();
            }
            UpdateMode::Replace => {
                batch.text.clear();
                batch.text.push_str(text);
                batch.chars = text.chars().count();
                batch.mode = UpdateMode::Replace;
            }
        }

        if batch.chars >= self.threshold_chars {
            return self.take(&key);
        }
        None
    }

    /// Release everything buffered for one message, all sections.
    pub fn flush(&mut self, message_id: &MessageId) -> Vec<BufferedFlush> {
        let keys: Vec<BufferKey> = self
            .batches
            .keys()
            .filter(|(id, _)| id == message_id)
            .cloned()
            .collect();
        keys.iter().filter_map(|key| self.take(key)).collect()
    }

    /// Release every batch whose deadline has passed.
    pub fn flush_due(&mut self, now: Instant) -> Vec<BufferedFlush> {
        let due: Vec<BufferKey> = self
            .batches
            .iter()
            .filter(|(_, batch)| batch.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        due.iter().filter_map(|key| self.take(key)).collect()
    }

    /// Earliest pending deadline, if anything is buffered.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.batches.values().map(|b| b.deadline).min()
    }

    /// Drop a message's pending content without releasing it.
    pub fn discard(&mut self, message_id: &MessageId) {
        self.batches.retain(|(id, _), _| id != message_id);
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn has_pending(&self, message_id: &MessageId) -> bool {
        self.batches.keys().any(|(id, _)| id == message_id)
    }

    /// Release everything and cancel all deadlines.
    pub fn dispose(&mut self) -> Vec<BufferedFlush> {
        let batches = std::mem::take(&mut self.batches);
        batches
            .into_iter()
            .filter(|(_, batch)| !batch.is_empty())
            .map(|((message_id, section), batch)| BufferedFlush {
                message_id,
                section,
                content: batch.text,
                mode: batch.mode,
            })
            .collect()
    }

    fn take(&mut self, key: &BufferKey) -> Option<BufferedFlush> {
        let batch = self.batches.remove(key)?;
        if batch.is_empty() {
            return None;
        }
        Some(BufferedFlush {
            message_id: key.0.clone(),
            section: key.1,
            content: batch.text,
            mode: batch.mode,
        })
    }
}
