// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use prometheus::{IntGaugeVec, Registry, register_int_gauge_vec_with_registry};

#[derive(Clone)]
pub struct TrackingMetrics {
    /// Last committed stream position, per processor and segment.
    pub tracked_token_position: IntGaugeVec,
    /// Segments currently processed by this node, per processor.
    pub active_segments: IntGaugeVec,
}

impl TrackingMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            tracked_token_position: register_int_gauge_vec_with_registry!(
                "tracked_token_position",
                "Last committed tracking token position.",
                &["processor", "segment"],
                registry,
            )
            .unwrap(),
            active_segments: register_int_gauge_vec_with_registry!(
                "active_segments",
                "Number of segments processed by this node.",
                &["processor"],
                registry,
            )
            .unwrap(),
        }
    }
}
