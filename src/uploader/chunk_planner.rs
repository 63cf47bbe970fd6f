use crate::config::DeliveryConfig;

use super::image_groups::{ImageGroup, ImageRecord};

/// Hard ceiling on attachments per message imposed by the endpoint
pub const MAX_ITEMS_PER_MESSAGE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub max_items_per_message: usize,
    pub byte_budget_per_message: u64,
}

impl ChunkLimits {
    pub fn new(max_items_per_message: usize, byte_budget_per_message: u64) -> Self {
        Self {
            max_items_per_message: max_items_per_message.clamp(1, MAX_ITEMS_PER_MESSAGE),
            byte_budget_per_message,
        }
    }

    pub fn from_delivery(delivery: &DeliveryConfig) -> Self {
        Self::new(
            delivery.max_items_per_message as usize,
            delivery.byte_budget_per_message,
        )
    }
}

/// Ordered slice of one group, delivered as a single message
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub group_index: usize,
    pub sequence: usize,
    pub records: Vec<ImageRecord>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.byte_size).sum()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.records.iter().map(|r| r.file_path.clone()).collect()
    }

    /// Halve an oversized chunk; both halves keep the sequence number
    pub fn split_in_half(self) -> (Chunk, Chunk) {
        let (first, second) = split_in_half(self.records);
        (
            Chunk {
                group_index: self.group_index,
                sequence: self.sequence,
                records: first,
            },
            Chunk {
                group_index: self.group_index,
                sequence: self.sequence,
                records: second,
            },
        )
    }
}

/// Greedy packing in group order. A record larger than the budget on its
/// own becomes a singleton chunk and is left to the compression stage.
pub fn plan_chunks(group_index: usize, group: &ImageGroup, limits: ChunkLimits) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<ImageRecord> = Vec::new();
    let mut current_bytes: u64 = 0;

    for record in &group.records {
        let would_overflow = !current.is_empty()
            && (current.len() >= limits.max_items_per_message
                || current_bytes + record.byte_size > limits.byte_budget_per_message);

        if would_overflow {
            chunks.push(Chunk {
                group_index,
                sequence: chunks.len(),
                records: std::mem::take(&mut current),
            });
            current_bytes = 0;
        }

        current_bytes += record.byte_size;
        current.push(record.clone());
    }

    if !current.is_empty() {
        chunks.push(Chunk {
            group_index,
            sequence: chunks.len(),
            records: current,
        });
    }

    log::debug!(
        "Planned {} chunk(s) for group {} ({} images)",
        chunks.len(),
        group_index,
        group.len()
    );
    chunks
}

/// Split into `(ceil(n/2), floor(n/2))`, preserving order
pub fn split_in_half<T>(mut items: Vec<T>) -> (Vec<T>, Vec<T>) {
    let mid = items.len().div_ceil(2);
    let second = items.split_off(mid);
    (items, second)
}
