//! Lookahead eviction cost model
//!
//! The slot pool is described as maximal runs of equal occupancy
//! ([`Segment`]s). Each segment is priced by what evicting it would lose:
//! nothing for free space, almost nothing for data that is never used
//! again, and more the sooner the occupying group is needed next. The group
//! whose sample is currently playing is priced at [`EvictionCost::INFINITE`].

use crate::reference::GroupId;
use std::iter::Sum;
use std::ops::Add;

/// Saturating eviction cost with an explicit infinite sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EvictionCost(u64);

impl EvictionCost {
    /// Free slots
    pub const FREE: Self = EvictionCost(0);
    /// Data with no remaining reference
    pub const SPENT: Self = EvictionCost(1);
    /// Data that must not be evicted
    pub const INFINITE: Self = EvictionCost(u64::MAX);

    /// Cost of evicting data next needed `distance` samples from now
    pub fn until_next_use(distance: u32) -> Self {
        EvictionCost(2 + u64::from(u32::MAX - distance))
    }

    /// Whether the cost is the infinite sentinel
    pub fn is_infinite(self) -> bool {
        self == Self::INFINITE
    }

    /// Raw value
    pub fn value(self) -> u64 {
        self.0
    }
}

impl Add for EvictionCost {
    type Output = EvictionCost;

    fn add(self, rhs: EvictionCost) -> EvictionCost {
        EvictionCost(self.0.saturating_add(rhs.0))
    }
}

impl Sum for EvictionCost {
    fn sum<I: Iterator<Item = EvictionCost>>(iter: I) -> Self {
        iter.fold(EvictionCost::FREE, Add::add)
    }
}

/// Maximal run of slots with the same occupant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First slot
    pub start: u8,
    /// Number of slots
    pub len: u16,
    /// Group resident in the run, `None` when free
    pub occupant: Option<GroupId>,
    /// Price of evicting the run
    pub cost: EvictionCost,
}

/// Contiguous run of segments selected for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Index of the first segment
    pub first: usize,
    /// Index of the last segment (inclusive)
    pub last: usize,
    /// First slot of the run
    pub start: u8,
    /// Total slots in the run
    pub size: u16,
    /// Total cost of the run
    pub cost: EvictionCost,
}

/// Split a slot map into segments priced by `cost_of`
///
/// `slots[i]` describes slot `first_slot + i`.
pub fn build_segments(
    slots: &[Option<GroupId>],
    first_slot: u8,
    mut cost_of: impl FnMut(GroupId) -> EvictionCost,
) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    for (i, &occupant) in slots.iter().enumerate() {
        if let Some(segment) = segments.last_mut() {
            if segment.occupant == occupant {
                segment.len += 1;
                continue;
            }
        }
        segments.push(Segment {
            start: first_slot + i as u8,
            len: 1,
            occupant,
            cost: occupant.map_or(EvictionCost::FREE, &mut cost_of),
        });
    }
    segments
}

/// Cheapest contiguous run of segments holding at least `needed` slots
///
/// Every start segment is extended until the run is large enough; the run
/// with the lowest total cost wins, ties going to the smaller run and then
/// the lower slot. Returns `None` when no run is large enough or every
/// sufficient run contains data that must not be evicted.
pub fn select_candidate(segments: &[Segment], needed: u16) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;

    for first in 0..segments.len() {
        let mut size = 0u16;
        let mut cost = EvictionCost::FREE;
        let mut last = None;
        for (i, segment) in segments.iter().enumerate().skip(first) {
            size += segment.len;
            cost = cost + segment.cost;
            if size >= needed {
                last = Some(i);
                break;
            }
        }
        // Runs starting further right only get shorter
        let Some(last) = last else { break };

        let candidate = Candidate {
            first,
            last,
            start: segments[first].start,
            size,
            cost,
        };
        let better = match &best {
            None => true,
            Some(current) => (cost, size) < (current.cost, current.size),
        };
        if better {
            best = Some(candidate);
        }
    }

    best.filter(|candidate| !candidate.cost.is_infinite())
}
