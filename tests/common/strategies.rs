//! Proptest strategies for circuit and job inputs.

use proptest::prelude::*;
use serde_json::{json, Value};

/// Strictly increasing failure offsets in seconds, within one simulated hour
pub fn failure_offsets_strategy() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..120, 1..25).prop_map(|gaps| {
        gaps.into_iter()
            .scan(0u64, |offset, gap| {
                *offset += gap;
                Some(*offset)
            })
            .collect()
    })
}

/// (failure_threshold, window_seconds)
pub fn window_policy_strategy() -> impl Strategy<Value = (u32, u64)> {
    (1u32..8, 10u64..300)
}

/// Tenant identifiers in the shape the platform issues
pub fn tenant_id_strategy() -> impl Strategy<Value = String> {
    "tenant-[a-z0-9]{1,12}"
}

/// Identifying parameters for an insight job
pub fn insight_params_strategy() -> impl Strategy<Value = Value> {
    ("s-[0-9]{1,6}", "20[0-9]{2}-T[1-3]")
        .prop_map(|(student_id, term)| json!({"student_id": student_id, "term": term}))
}
