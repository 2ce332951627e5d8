//! Instance selection for a routing key.

use crate::naming::Service;
use std::sync::Arc;
use wire::Header;

/// Picks one candidate for a packet. Implementations must be pure: same
/// header and same ordered candidates, same answer.
pub trait Selector: Send + Sync {
    fn lookup(&self, header: &Header, candidates: &[Arc<dyn Service>]) -> Option<String>;
}

/// Hashes the header's channel id and takes it modulo the candidate count,
/// so one conversation keeps landing on the same instance while membership
/// is stable.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashSelector;

impl Selector for HashSelector {
    fn lookup(&self, header: &Header, candidates: &[Arc<dyn Service>]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let idx = (fnv1a(header.channel_id.as_bytes()) % candidates.len() as u64) as usize;
        Some(candidates[idx].service_id().to_string())
    }
}

/// 64-bit FNV-1a. Stable across processes and builds, unlike `DefaultHasher`.
pub fn fnv1a(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    data.iter()
        .fold(OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(PRIME))
}
