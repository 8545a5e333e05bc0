//! Display slot allocation and compaction
//!
//! The output grid has [`MAX_CLIENTS`] cells. Slots are always handed out
//! lowest index first, and after clients leave the remaining ones are
//! packed back toward slot 0 so the grid has no holes in front.

use std::collections::BTreeSet;

use tracing::debug;

use super::compositor::{Compositor, GridPoint};
use super::identity::{EndpointIndex, SlotIndex, MAX_CLIENTS};
use crate::error::{RelayError, Result};

/// Two-column grid geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrid {
    pub tile_width: u32,
    pub tile_height: u32,
}

impl SlotGrid {
    pub fn new(tile_width: u32, tile_height: u32) -> Self {
        Self {
            tile_width,
            tile_height,
        }
    }

    /// Top-left corner of `slot`: left to right, then top to bottom
    pub fn point(&self, slot: SlotIndex) -> GridPoint {
        let column = (slot.0 % 2) as u32;
        let row = (slot.0 / 2) as u32;
        GridPoint::new(column * self.tile_width, row * self.tile_height)
    }
}

impl Default for SlotGrid {
    fn default() -> Self {
        Self::new(320, 240)
    }
}

/// Free set of display slots plus the compositor calls tied to them
#[derive(Debug)]
pub struct SlotAllocator {
    free: BTreeSet<SlotIndex>,
    grid: SlotGrid,
}

impl SlotAllocator {
    pub fn new(grid: SlotGrid) -> Self {
        Self {
            free: (0..MAX_CLIENTS).map(SlotIndex).collect(),
            grid,
        }
    }

    pub fn lowest_free(&self) -> Option<SlotIndex> {
        self.free.first().copied()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn is_free(&self, slot: SlotIndex) -> bool {
        self.free.contains(&slot)
    }

    /// Take the smallest free slot and show `input` there
    pub fn acquire(
        &mut self,
        input: EndpointIndex,
        compositor: &mut dyn Compositor,
    ) -> Option<SlotIndex> {
        let slot = self.free.pop_first()?;
        self.show(input, slot, compositor);
        Some(slot)
    }

    /// Hide `input` and return `slot` to the free set
    pub fn release(
        &mut self,
        slot: SlotIndex,
        input: EndpointIndex,
        compositor: &mut dyn Compositor,
    ) -> Result<()> {
        if slot.0 >= MAX_CLIENTS || self.free.contains(&slot) {
            return Err(RelayError::SlotAlreadyFree(slot.0));
        }
        compositor.set_alpha(input, 0.0);
        compositor.set_position(input, GridPoint::ORIGIN);
        self.free.insert(slot);
        Ok(())
    }

    /// Move occupied slots down into lower free ones
    ///
    /// `assignments` yields each active session's endpoint and a mutable
    /// reference to its slot. While some session sits above the lowest
    /// free slot, the highest such session moves into it. Afterwards the
    /// occupied slots are exactly `0..n`. Returns the number of moves.
    pub fn compact<'a, I>(&mut self, assignments: I, compositor: &mut dyn Compositor) -> usize
    where
        I: IntoIterator<Item = (EndpointIndex, &'a mut SlotIndex)>,
    {
        let mut entries: Vec<(EndpointIndex, &'a mut SlotIndex)> =
            assignments.into_iter().collect();

        let mut moved = 0;
        while let Some(lowest) = self.lowest_free() {
            let Some(entry) = entries.iter_mut().max_by_key(|entry| *entry.1) else {
                break;
            };
            let input = entry.0;
            let vacated = *entry.1;
            if vacated <= lowest {
                break;
            }

            self.free.remove(&lowest);
            self.show(input, lowest, compositor);
            *entry.1 = lowest;
            self.free.insert(vacated);
            moved += 1;
            debug!("Compacted {} from {} to {}", input, vacated, lowest);
        }
        moved
    }

    fn show(&self, input: EndpointIndex, slot: SlotIndex, compositor: &mut dyn Compositor) {
        compositor.set_position(input, self.grid.point(slot));
        compositor.set_alpha(input, 1.0);
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new(SlotGrid::default())
    }
}
