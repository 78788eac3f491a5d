//! Pure placement scoring over server snapshots.

use super::types::{SelectionConstraints, ServerDescriptor};
use std::cmp::Ordering;

pub const LOAD_WEIGHT: f64 = 40.0;
pub const RESPONSE_WEIGHT: f64 = 30.0;
pub const SUCCESS_WEIGHT: f64 = 20.0;
pub const SPACE_WEIGHT: f64 = 10.0;
pub const REGION_BONUS: f64 = 5.0;

const RESPONSE_TARGET_MS: f64 = 100.0;
const SPACE_TARGET_BYTES: f64 = 100.0 * 1024.0 * 1024.0 * 1024.0;

/// Whether `server` may receive a chunk of `chunk_size` bytes at all.
pub fn is_eligible(
    server: &ServerDescriptor,
    chunk_size: u64,
    constraints: &SelectionConstraints,
) -> bool {
    server.active
        && server.has_free_slot()
        && server.capabilities.max_chunk_size >= chunk_size
        && server.capabilities.free_space >= constraints.min_free_space
        && !constraints.excluded.contains(&server.id)
}

pub fn score(server: &ServerDescriptor, constraints: &SelectionConstraints) -> f64 {
    let load = if server.max_load == 0 {
        0.0
    } else {
        1.0 - (server.current_load as f64 / server.max_load as f64)
    };

    let response = if server.response_time_ms == 0 {
        1.0
    } else {
        (RESPONSE_TARGET_MS / server.response_time_ms as f64).min(1.0)
    };

    let success = (server.success_rate as f64).clamp(0.0, 1.0);
    let space = (server.capabilities.free_space as f64 / SPACE_TARGET_BYTES).min(1.0);

    let region = match (&constraints.preferred_region, &server.region) {
        (Some(wanted), Some(actual)) if wanted == actual => REGION_BONUS,
        _ => 0.0,
    };

    LOAD_WEIGHT * load.max(0.0)
        + RESPONSE_WEIGHT * response
        + SUCCESS_WEIGHT * success
        + SPACE_WEIGHT * space
        + region
}

/// Eligible servers, best first. Ties go to the lower current load, then to
/// the lexicographically lower id.
pub fn rank<'a>(
    servers: impl IntoIterator<Item = &'a ServerDescriptor>,
    chunk_size: u64,
    constraints: &SelectionConstraints,
) -> Vec<(f64, &'a ServerDescriptor)> {
    let mut ranked: Vec<_> = servers
        .into_iter()
        .filter(|s| is_eligible(s, chunk_size, constraints))
        .map(|s| (score(s, constraints), s))
        .collect();

    ranked.sort_by(|(score_a, a), (score_b, b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(Ordering::Equal)
            .then(a.current_load.cmp(&b.current_load))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

pub fn select<'a>(
    servers: impl IntoIterator<Item = &'a ServerDescriptor>,
    chunk_size: u64,
    constraints: &SelectionConstraints,
) -> Option<&'a ServerDescriptor> {
    rank(servers, chunk_size, constraints)
        .into_iter()
        .next()
        .map(|(_, s)| s)
}
