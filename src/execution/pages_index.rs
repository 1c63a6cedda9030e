/// PagesIndex: in-memory column store with positional sort
///
/// Appended pages contribute their blocks to per-channel block lists; logical
/// rows are addressed through a packed position list `(page << 32) | offset`.
/// Sorting reorders only the position list, so a stable sort costs one swap
/// per exchange and never copies column data, and partition iteration is a
/// two-pointer scan over integers.
use arrow::array::{Array, ArrayRef};
use arrow::compute::interleave;
use arrow::datatypes::DataType;
use tracing::debug;

use crate::error::EngineResult;
use crate::page::Page;

use super::ordering::WindowOrdering;

const POSITION_BYTES: usize = std::mem::size_of::<u64>();

pub fn encode_position(page: usize, offset: usize) -> u64 {
    ((page as u64) << 32) | (offset as u64)
}

pub fn decode_position(position: u64) -> (usize, usize) {
    ((position >> 32) as usize, (position & 0xFFFF_FFFF) as usize)
}

pub struct PagesIndex {
    types: Vec<DataType>,
    /// channels[channel][page] -> block
    channels: Vec<Vec<ArrayRef>>,
    positions: Vec<u64>,
    estimated_bytes: usize,
}

impl PagesIndex {
    pub fn with_capacity(types: Vec<DataType>, expected_positions: usize) -> Self {
        let channels = types.iter().map(|_| Vec::new()).collect();
        Self {
            types,
            channels,
            positions: Vec::with_capacity(expected_positions),
            estimated_bytes: 0,
        }
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub fn channels(&self) -> &[Vec<ArrayRef>] {
        &self.channels
    }

    /// Logical position `i` in stored (possibly sorted) order.
    pub fn position(&self, i: usize) -> u64 {
        self.positions[i]
    }

    pub fn last_position(&self) -> Option<u64> {
        self.positions.last().copied()
    }

    /// Resolve a packed position to its backing block and row offset.
    pub fn array_at(&self, channel: usize, position: u64) -> (&dyn Array, usize) {
        let (page, offset) = decode_position(position);
        (self.channels[channel][page].as_ref(), offset)
    }

    /// Append every row of `page`, extending the position list contiguously.
    /// Returns the estimated bytes retained by the append; the caller reflects
    /// them in its memory reservation before committing more input.
    pub fn append_page(&mut self, page: &Page) -> usize {
        let page_slot = self.channels[0].len();
        for (channel, column) in page.columns().iter().enumerate() {
            self.channels[channel].push(column.clone());
        }
        let rows = page.position_count();
        self.positions
            .extend((0..rows).map(|offset| encode_position(page_slot, offset)));
        let added = page.estimated_bytes() + rows * POSITION_BYTES;
        self.estimated_bytes += added;
        added
    }

    /// Stable sort of positions `[begin, end)` by the full order comparator.
    pub fn sort_range(&mut self, ordering: &WindowOrdering, begin: usize, end: usize) {
        let mut positions = std::mem::take(&mut self.positions);
        {
            let this = &*self;
            // channel types are validated at operator construction, so the
            // comparator cannot fail here
            positions[begin..end].sort_by(|&a, &b| {
                ordering
                    .order_compare(this, a, b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        self.positions = positions;
        debug!(begin, end, "sorted position range");
    }

    /// Stable sort of positions `[begin, end)` by the sort channels past the
    /// pre-sorted prefix.
    pub fn sort_range_suffix(&mut self, ordering: &WindowOrdering, begin: usize, end: usize) {
        let mut positions = std::mem::take(&mut self.positions);
        {
            let this = &*self;
            positions[begin..end].sort_by(|&a, &b| {
                ordering
                    .suffix_compare(this, a, b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        self.positions = positions;
    }

    /// Copy rows `[begin, end)` of the stored order into fresh pages of at
    /// most `rows_per_page` rows each. Used to materialize sorted runs for
    /// spilling and to rebuild a retained tail after a spill.
    pub fn materialize_pages(
        &self,
        begin: usize,
        end: usize,
        rows_per_page: usize,
    ) -> EngineResult<Vec<Page>> {
        let mut pages = Vec::new();
        let mut chunk_start = begin;
        while chunk_start < end {
            let chunk_end = (chunk_start + rows_per_page).min(end);
            let addresses: Vec<(usize, usize)> = self.positions[chunk_start..chunk_end]
                .iter()
                .map(|&p| decode_position(p))
                .collect();
            let mut columns = Vec::with_capacity(self.channels.len());
            for channel in &self.channels {
                let blocks: Vec<&dyn Array> = channel.iter().map(|b| b.as_ref()).collect();
                columns.push(interleave(&blocks, &addresses)?);
            }
            pages.push(Page::new(columns)?);
            chunk_start = chunk_end;
        }
        Ok(pages)
    }
}
