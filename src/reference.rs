//! Block Groups and the Reference Trace
//!
//! Block groups live in an arena addressed by [`GroupId`]; a hash map from
//! [`GroupKey`] gives constant-time deduplication while scanning. References
//! form one ordered sequence consumed through a cursor, and every group keeps
//! the indices of its own references plus a cursor of its own, so the next
//! use of any group is a constant-time lookup.

use crate::constants::{block_address, blocks_for_len};
use crate::sample_store::SampleStore;
use crate::{PlayerError, Result};
use std::collections::HashMap;
use tracing::info;

/// Stable handle of a block group inside a [`ReferenceTrace`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(usize);

impl GroupId {
    #[cfg(test)]
    pub(crate) fn from_index(index: usize) -> Self {
        GroupId(index)
    }

    /// Arena index of this group
    pub fn index(self) -> usize {
        self.0
    }
}

/// Identity of a block group: the DPCM block and the time its bytes were last written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    /// First block referenced (DPCM address register value)
    pub block: u16,
    /// Sample store stamp for the referenced span when the group was created
    pub written_at: u32,
}

/// A deduplicated run of sample bytes that is cached as one unit
#[derive(Debug, Clone)]
pub struct BlockGroup {
    key: GroupKey,
    data: Vec<u8>,
    byte_len: usize,
    slot: Option<u8>,
    refs: Vec<usize>,
    next_ref: usize,
}

impl BlockGroup {
    fn new(key: GroupKey) -> Self {
        BlockGroup {
            key,
            data: Vec::new(),
            byte_len: 0,
            slot: None,
            refs: Vec::new(),
            next_ref: 0,
        }
    }

    /// Group key
    pub fn key(&self) -> GroupKey {
        self.key
    }

    /// Largest byte length ever requested against this group
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Number of 64-byte slots the group occupies when resident
    pub fn block_size(&self) -> u16 {
        blocks_for_len(self.byte_len)
    }

    /// Sample bytes; empty once the group has been retired
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// First bank slot claimed by the group, if resident
    pub fn slot(&self) -> Option<u8> {
        self.slot
    }

    /// Whether the group currently claims a slot range
    pub fn is_resident(&self) -> bool {
        self.slot.is_some()
    }

    /// Total number of references ever made to the group
    pub fn reference_count(&self) -> usize {
        self.refs.len()
    }

    /// References not yet consumed
    pub fn remaining_references(&self) -> usize {
        self.refs.len() - self.next_ref
    }

    /// Whether the sample bytes have been released
    pub fn is_retired(&self) -> bool {
        self.data.is_empty() && self.byte_len > 0
    }

    pub(crate) fn set_slot(&mut self, slot: Option<u8>) {
        self.slot = slot;
    }
}

/// A scheduled use of a block group at a given trace time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// Trace time (samples since start) of the use
    pub time: u32,
    /// Group holding the bytes
    pub group: GroupId,
    /// Bytes needed by this use
    pub byte_len: usize,
}

/// Ordered, deduplicated sample usage of one track
#[derive(Debug, Default, Clone)]
pub struct ReferenceTrace {
    groups: Vec<BlockGroup>,
    index: HashMap<GroupKey, GroupId>,
    refs: Vec<Reference>,
    cursor: usize,
}

impl ReferenceTrace {
    /// Create an empty trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a use of `byte_len` bytes at `block` happening at `time`
    ///
    /// The group is looked up by the block and the store's last-write time
    /// for the span; a new group is created when none matches. A group
    /// grows to the longest length requested against it.
    ///
    /// # Errors
    /// Fails when the span is outside the sample region or references would
    /// go backwards in time.
    pub fn add_reference(
        &mut self,
        store: &SampleStore,
        time: u32,
        block: u16,
        byte_len: usize,
    ) -> Result<GroupId> {
        if let Some(last) = self.refs.last() {
            if time < last.time {
                return Err(PlayerError::Invariant(format!(
                    "reference at t={} precedes previous reference at t={}",
                    time, last.time
                )));
            }
        }

        let written_at = store.last_write_time(block, byte_len)?;
        let key = GroupKey { block, written_at };
        let id = match self.index.get(&key) {
            Some(&id) => id,
            None => {
                let id = GroupId(self.groups.len());
                self.groups.push(BlockGroup::new(key));
                self.index.insert(key, id);
                id
            }
        };

        let group = &mut self.groups[id.0];
        if group.byte_len < byte_len {
            let mut data = vec![0u8; byte_len];
            store.read(block, byte_len, &mut data)?;
            group.data = data;
            group.byte_len = byte_len;
        }

        let ref_index = self.refs.len();
        group.refs.push(ref_index);
        self.refs.push(Reference {
            time,
            group: id,
            byte_len,
        });
        Ok(id)
    }

    /// Whether any reference was recorded
    pub fn has_references(&self) -> bool {
        !self.refs.is_empty()
    }

    /// All references in trace order, consumed or not
    pub fn references(&self) -> &[Reference] {
        &self.refs
    }

    /// References not yet consumed
    pub fn pending(&self) -> &[Reference] {
        &self.refs[self.cursor..]
    }

    /// Number of distinct block groups
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Iterate over all groups with their handles
    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &BlockGroup)> {
        self.groups
            .iter()
            .enumerate()
            .map(|(i, group)| (GroupId(i), group))
    }

    /// Look up a group by handle
    pub fn group(&self, id: GroupId) -> &BlockGroup {
        &self.groups[id.0]
    }

    pub(crate) fn group_mut(&mut self, id: GroupId) -> &mut BlockGroup {
        &mut self.groups[id.0]
    }

    /// Look up a group by key
    pub fn find(&self, key: GroupKey) -> Option<GroupId> {
        self.index.get(&key).copied()
    }

    /// Next reference to be consumed
    pub fn peek_next(&self) -> Option<Reference> {
        self.refs.get(self.cursor).copied()
    }

    /// Consume the next reference
    ///
    /// # Errors
    /// Returns [`PlayerError::Invariant`] when the owning group's own cursor
    /// does not point at the consumed reference.
    pub fn take_next(&mut self) -> Result<Option<Reference>> {
        let Some(reference) = self.refs.get(self.cursor).copied() else {
            return Ok(None);
        };
        let ref_index = self.cursor;
        self.cursor += 1;

        let group = &mut self.groups[reference.group.0];
        if group.refs.get(group.next_ref) != Some(&ref_index) {
            return Err(PlayerError::Invariant(format!(
                "block group {} is not headed by reference #{}",
                reference.group.0, ref_index
            )));
        }
        group.next_ref += 1;
        Ok(Some(reference))
    }

    /// Consume every reference scheduled before `time`
    pub fn skip_until(&mut self, time: u64) -> Result<usize> {
        let mut skipped = 0;
        while let Some(reference) = self.peek_next() {
            if u64::from(reference.time) >= time {
                break;
            }
            self.take_next()?;
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Trace time of the group's next unconsumed reference
    pub fn next_use(&self, id: GroupId) -> Option<u32> {
        let group = &self.groups[id.0];
        group.refs.get(group.next_ref).map(|&i| self.refs[i].time)
    }

    /// Release the bytes of a group that can never be loaded again
    ///
    /// Applies only to groups with no remaining references that no longer
    /// claim a slot range. Returns whether the bytes were released.
    pub fn retire_if_spent(&mut self, id: GroupId) -> bool {
        let group = &mut self.groups[id.0];
        if group.remaining_references() == 0 && group.slot.is_none() && !group.data.is_empty() {
            group.data = Vec::new();
            true
        } else {
            false
        }
    }

    /// Clear every slot assignment, leaving references untouched
    pub fn clear_residency(&mut self) {
        for group in &mut self.groups {
            group.slot = None;
        }
    }

    /// Log one line per block group
    pub fn log_block_groups(&self) {
        for group in &self.groups {
            info!(
                "Block Group: [t={}, ${:04X}~{:03}] refs={}, blocks={}, bytes={}",
                group.key.written_at,
                block_address(group.key.block),
                group.key.block,
                group.refs.len(),
                group.block_size(),
                group.byte_len
            );
        }
    }
}
