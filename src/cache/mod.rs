//! Bank Cache
//!
//! Maps the bank slots of the sample window to resident block groups.
//! Before playback the pool is filled greedily in order of first use;
//! during playback a miss evicts the cheapest contiguous run of segments
//! according to the lookahead cost model in [`cost`].

pub mod cost;

pub use cost::{build_segments, select_candidate, Candidate, EvictionCost, Segment};

use crate::config::PlayerConfig;
use crate::hardware::HardwareSink;
use crate::loader::Loader;
use crate::reference::{GroupId, GroupKey, ReferenceTrace};
use crate::{PlayerError, Result};
use std::ops::RangeInclusive;
use tracing::{debug, info, warn};

/// Outcome of [`BankCache::ensure_resident`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Residency {
    /// The group already held this slot range
    Resident {
        /// First slot of the group
        slot: u8,
    },
    /// A slot range was claimed; its bytes still have to be transferred
    Claimed {
        /// First slot of the claimed range
        slot: u8,
        /// Groups evicted to make room
        evicted: Vec<GroupId>,
    },
}

impl Residency {
    /// First slot of the group
    pub fn slot(&self) -> u8 {
        match self {
            Residency::Resident { slot } | Residency::Claimed { slot, .. } => *slot,
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Groups loaded by preloading
    pub preloaded: usize,
    /// Requests satisfied without a transfer
    pub hits: usize,
    /// Requests that claimed a new range
    pub misses: usize,
    /// Groups evicted
    pub evictions: usize,
    /// Requests that found no evictable range
    pub failures: usize,
}

/// Fixed pool of bank slots
#[derive(Debug, Clone)]
pub struct BankCache {
    first: u8,
    slots: Vec<Option<GroupId>>,
    stats: CacheStats,
}

impl BankCache {
    /// Create an empty cache over a slot window
    pub fn new(slots: RangeInclusive<u8>) -> Self {
        let (first, last) = (*slots.start(), *slots.end());
        let count = usize::from(last.saturating_sub(first)) + usize::from(last >= first);
        BankCache {
            first,
            slots: vec![None; count],
            stats: CacheStats::default(),
        }
    }

    /// Create an empty cache over the configured slot window
    pub fn from_config(config: &PlayerConfig) -> Self {
        Self::new(config.slots())
    }

    /// Number of slots in the pool
    pub fn slot_count(&self) -> u16 {
        self.slots.len() as u16
    }

    /// First slot of the pool
    pub fn first_slot(&self) -> u8 {
        self.first
    }

    /// Group resident at `slot`
    pub fn occupant(&self, slot: u8) -> Option<GroupId> {
        let index = usize::from(slot.checked_sub(self.first)?);
        self.slots.get(index).copied().flatten()
    }

    /// Number of unoccupied slots
    pub fn free_slots(&self) -> u16 {
        self.slots.iter().filter(|s| s.is_none()).count() as u16
    }

    /// Counters since the last reset
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Resident groups with their slot ranges, in slot order
    pub fn resident_ranges(&self) -> Vec<(GroupId, RangeInclusive<u8>)> {
        self.segments(|_| EvictionCost::FREE)
            .into_iter()
            .filter_map(|segment| {
                let id = segment.occupant?;
                let last = segment.start + (segment.len - 1) as u8;
                Some((id, segment.start..=last))
            })
            .collect()
    }

    /// Drop every assignment
    pub fn reset(&mut self, trace: &mut ReferenceTrace) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        trace.clear_residency();
        self.stats = CacheStats::default();
    }

    /// Fill the pool in order of first use
    ///
    /// Walks the pending references and loads every group not yet resident
    /// into the lowest free run that holds it, until one does not fit.
    /// Returns the number of groups loaded.
    pub fn preload<S: HardwareSink + ?Sized>(
        &mut self,
        trace: &mut ReferenceTrace,
        loader: &Loader,
        sink: &mut S,
    ) -> Result<usize> {
        let order: Vec<GroupId> = trace.pending().iter().map(|r| r.group).collect();
        let mut loaded = 0;

        for id in order {
            if trace.group(id).is_resident() {
                continue;
            }
            let Some(slot) = self.free_run(trace.group(id).block_size()) else {
                info!("No more space for preloading");
                break;
            };

            loader.load_all(sink, trace.group(id), slot)?;
            self.assign(trace, id, slot);
            loaded += 1;
        }

        self.stats.preloaded += loaded;
        Ok(loaded)
    }

    /// Reinstate groups whose bytes are known to be in the bank already
    ///
    /// `placements` pairs a group key with the slot it occupied under a
    /// previous scan of the same trace. Groups with no remaining reference,
    /// or whose range is no longer free, are skipped. Returns the number of
    /// groups reinstated.
    pub fn adopt(&mut self, trace: &mut ReferenceTrace, placements: &[(GroupKey, u8)]) -> usize {
        let mut adopted = 0;
        for &(key, slot) in placements {
            let Some(id) = trace.find(key) else { continue };
            let group = trace.group(id);
            if group.is_resident() || group.remaining_references() == 0 {
                continue;
            }
            let Some(start) = slot.checked_sub(self.first).map(usize::from) else {
                continue;
            };
            let end = start + usize::from(group.block_size());
            let free = self
                .slots
                .get(start..end)
                .is_some_and(|range| range.iter().all(Option::is_none));
            if free {
                self.assign(trace, id, slot);
                adopted += 1;
            }
        }
        debug!("Reinstated {} resident group(s)", adopted);
        adopted
    }

    /// Make room for `group`, evicting the cheapest run if it is not resident
    ///
    /// `active` is the group whose sample is playing right now; its slots are
    /// never reclaimed. `now` is the current trace time, from which next-use
    /// distances are measured. The claimed range is assigned immediately;
    /// transferring the bytes is left to the caller.
    ///
    /// # Errors
    /// Returns [`PlayerError::CacheExhausted`] when no finite-cost run is
    /// large enough. The pool is left untouched in that case.
    pub fn ensure_resident(
        &mut self,
        trace: &mut ReferenceTrace,
        group: GroupId,
        active: Option<GroupId>,
        now: u32,
    ) -> Result<Residency> {
        if let Some(slot) = trace.group(group).slot() {
            self.stats.hits += 1;
            return Ok(Residency::Resident { slot });
        }

        let needed = trace.group(group).block_size();
        let segments = self.segments(|id| {
            if Some(id) == active {
                return EvictionCost::INFINITE;
            }
            match trace.next_use(id) {
                Some(time) => EvictionCost::until_next_use(time.saturating_sub(now)),
                None => EvictionCost::SPENT,
            }
        });

        let Some(candidate) = select_candidate(&segments, needed) else {
            self.stats.failures += 1;
            warn!("Nothing to evict for a {} block group", needed);
            return Err(PlayerError::CacheExhausted { blocks: needed });
        };

        let mut evicted = Vec::new();
        for segment in &segments[candidate.first..=candidate.last] {
            if let Some(victim) = segment.occupant {
                self.evict(trace, victim);
                evicted.push(victim);
            }
        }

        self.assign(trace, group, candidate.start);
        self.stats.misses += 1;
        self.stats.evictions += evicted.len();
        debug!(
            "Claimed [{}..+{}] at cost {} evicting {} group(s)",
            candidate.start,
            needed,
            candidate.cost.value(),
            evicted.len()
        );
        Ok(Residency::Claimed {
            slot: candidate.start,
            evicted,
        })
    }

    /// Check that the slot map and the groups agree
    pub fn check_invariants(&self, trace: &ReferenceTrace) -> Result<()> {
        for (index, occupant) in self.slots.iter().enumerate() {
            let Some(id) = *occupant else { continue };
            let slot = self.first + index as u8;
            let group = trace.group(id);
            let start = group.slot().ok_or_else(|| {
                PlayerError::Invariant(format!("slot {} held by non-resident group {:?}", slot, id))
            })?;
            let end = u16::from(start) + group.block_size();
            if u16::from(slot) < u16::from(start) || u16::from(slot) >= end {
                return Err(PlayerError::Invariant(format!(
                    "slot {} outside the range of group {:?} at {}",
                    slot, id, start
                )));
            }
        }

        for (id, group) in trace.groups() {
            let Some(start) = group.slot() else { continue };
            for offset in 0..group.block_size() {
                let slot = u16::from(start) + offset;
                let held = u8::try_from(slot).ok().and_then(|slot| self.occupant(slot));
                if held != Some(id) {
                    return Err(PlayerError::Invariant(format!(
                        "group {:?} claims slot {} held by {:?}",
                        id, slot, held
                    )));
                }
            }
        }
        Ok(())
    }

    /// First slot of the lowest free run of at least `size` slots
    fn free_run(&self, size: u16) -> Option<u8> {
        self.segments(|_| EvictionCost::INFINITE)
            .into_iter()
            .find(|segment| segment.occupant.is_none() && segment.len >= size)
            .map(|segment| segment.start)
    }

    fn segments(&self, cost_of: impl FnMut(GroupId) -> EvictionCost) -> Vec<Segment> {
        build_segments(&self.slots, self.first, cost_of)
    }

    fn assign(&mut self, trace: &mut ReferenceTrace, id: GroupId, slot: u8) {
        let start = usize::from(slot - self.first);
        let size = usize::from(trace.group(id).block_size());
        for entry in &mut self.slots[start..start + size] {
            *entry = Some(id);
        }
        trace.group_mut(id).set_slot(Some(slot));
    }

    fn evict(&mut self, trace: &mut ReferenceTrace, id: GroupId) {
        for entry in self.slots.iter_mut().filter(|entry| **entry == Some(id)) {
            *entry = None;
        }
        trace.group_mut(id).set_slot(None);
        if trace.retire_if_spent(id) {
            debug!("Retired block group {:?}", trace.group(id).key());
        }
    }
}
