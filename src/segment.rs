// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A partition of the aggregate identifier space.
///
/// An event belongs to a segment when the hash of its aggregate identifier,
/// masked with the segment's mask, equals the segment id. Masks are always of
/// the form `2^k - 1`, so the segments obtained by repeatedly
/// [splitting](Segment::split) the [root](Segment::ROOT) partition the
/// identifier space without overlap.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Segment {
    segment_id: u32,
    mask: u32,
}

impl Segment {
    /// The segment matching every event.
    pub const ROOT: Segment = Segment {
        segment_id: 0,
        mask: 0,
    };

    pub fn new(segment_id: u32, mask: u32) -> Self {
        Self { segment_id, mask }
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Whether events of the given aggregate belong to this segment.
    pub fn matches(&self, aggregate_identifier: &str) -> bool {
        stable_hash(aggregate_identifier) & self.mask == self.segment_id
    }

    /// Splits this segment into two children that partition its matched set.
    /// The lower child keeps this segment's id.
    pub fn split(self) -> (Segment, Segment) {
        let child_mask = (self.mask << 1) | 1;
        let lower = Segment::new(self.segment_id, child_mask);
        let upper = Segment::new(self.segment_id + self.mask + 1, child_mask);
        (lower, upper)
    }

    /// Reconstructs the full segment set from the ids persisted in a token
    /// store. Starting from the root, a segment is split as long as the id of
    /// its upper half is present; ids therefore uniquely determine the masks.
    pub fn compute_segments(segment_ids: &[u32]) -> Vec<Segment> {
        let ids: BTreeSet<u32> = segment_ids.iter().copied().collect();
        let mut segments = Vec::with_capacity(ids.len());
        if ids.contains(&Segment::ROOT.segment_id) {
            resolve_segment(Segment::ROOT, &ids, &mut segments);
        }
        segments.sort();
        segments
    }
}

fn resolve_segment(segment: Segment, ids: &BTreeSet<u32>, out: &mut Vec<Segment>) {
    let (lower, upper) = segment.split();
    if ids.contains(&upper.segment_id) {
        resolve_segment(lower, ids, out);
        resolve_segment(upper, ids, out);
    } else {
        out.push(segment);
    }
}

/// 32-bit FNV-1a over the identifier bytes. Segment routing must agree across
/// every node of a cluster, which rules out `DefaultHasher` (its keys are
/// randomized per process).
fn stable_hash(value: &str) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    value
        .bytes()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME))
}
