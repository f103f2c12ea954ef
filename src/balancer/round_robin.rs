/// Smooth weighted round-robin selection
use super::{LoadBalancingAlgorithm, Members};
use crate::core::NodeAttribute;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Upper bound on the precomputed rotation length
const MAX_SEQUENCE: u64 = 1024;

/// Precomputed rotation for one member snapshot
#[derive(Debug)]
struct Rotation {
    members: Members,
    weights: Vec<u32>,
    sequence: Vec<usize>,
}

impl Rotation {
    fn build(members: &Members) -> Self {
        let weights: Vec<u32> = members.iter().map(|m| m.weight()).collect();
        let sequence = smooth_sequence(&weights);
        Self {
            members: Arc::clone(members),
            weights,
            sequence,
        }
    }

    fn matches(&self, members: &Members) -> bool {
        Arc::ptr_eq(&self.members, members)
            && self
                .weights
                .iter()
                .zip(members.iter())
                .all(|(weight, member)| *weight == member.weight())
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Interleaved rotation in which member `i` appears `weights[i] / gcd` times.
///
/// Long rotations are scaled down to `MAX_SEQUENCE` entries; a positive
/// weight always keeps at least one slot.
fn smooth_sequence(weights: &[u32]) -> Vec<usize> {
    let divisor = weights.iter().copied().filter(|w| *w > 0).fold(0, gcd);
    if divisor == 0 {
        return Vec::new();
    }

    let mut reduced: Vec<u64> = weights.iter().map(|w| (*w / divisor) as u64).collect();
    let total: u64 = reduced.iter().sum();
    if total > MAX_SEQUENCE {
        for weight in reduced.iter_mut().filter(|w| **w > 0) {
            *weight = (*weight * MAX_SEQUENCE / total).max(1);
        }
    }
    let total: u64 = reduced.iter().sum();

    let mut current = vec![0i64; reduced.len()];
    let mut sequence = Vec::with_capacity(total as usize);
    for _ in 0..total {
        let mut best: Option<usize> = None;
        for (index, weight) in reduced.iter().enumerate() {
            if *weight == 0 {
                continue;
            }
            current[index] += *weight as i64;
            if best.map_or(true, |b| current[index] > current[b]) {
                best = Some(index);
            }
        }
        if let Some(best) = best {
            current[best] -= total as i64;
            sequence.push(best);
        }
    }
    sequence
}

/// Weighted round-robin over a cached rotation and a shared cursor.
///
/// The rotation is rebuilt when the member snapshot or any weight changes.
#[derive(Debug, Default)]
pub struct WeightRoundRobin {
    cursor: AtomicUsize,
    rotation: ArcSwapOption<Rotation>,
}

impl WeightRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn rotation_for(&self, members: &Members) -> Arc<Rotation> {
        if let Some(rotation) = self.rotation.load_full() {
            if rotation.matches(members) {
                return rotation;
            }
        }
        let rotation = Arc::new(Rotation::build(members));
        self.rotation.store(Some(Arc::clone(&rotation)));
        rotation
    }
}

impl Clone for WeightRoundRobin {
    fn clone(&self) -> Self {
        Self {
            cursor: AtomicUsize::new(self.cursor.load(Ordering::Relaxed)),
            rotation: ArcSwapOption::new(self.rotation.load_full()),
        }
    }
}

impl LoadBalancingAlgorithm for WeightRoundRobin {
    fn select(&self, members: &Members) -> Option<Arc<NodeAttribute>> {
        if members.is_empty() {
            return None;
        }

        let rotation = self.rotation_for(members);
        let position = self.cursor.fetch_add(1, Ordering::Relaxed);

        let sequence = &rotation.sequence;
        for step in 0..sequence.len() {
            let member = &rotation.members[sequence[(position + step) % sequence.len()]];
            if member.is_available() {
                return Some(Arc::clone(member));
            }
        }

        // Zero weights everywhere, or every weighted member is down
        (0..members.len())
            .map(|step| &members[(position + step) % members.len()])
            .find(|member| member.is_available())
            .cloned()
    }
}
