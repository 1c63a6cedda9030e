/// Partition iteration over a sorted pages index
///
/// A partition is a maximal run of logical rows whose partition-key tuples
/// compare equal (null == null). The iterator is a two-pointer sweep; views
/// never outlive the index they borrow.
use crate::error::EngineResult;
use crate::page::cell::{self, Cell};

use super::ordering::WindowOrdering;
use super::pages_index::{decode_position, PagesIndex};

/// Read-only view of rows `[begin, end)` of a sorted index that share equal
/// partition keys.
pub struct PartitionView<'a> {
    index: &'a PagesIndex,
    ordering: &'a WindowOrdering,
    begin: usize,
    end: usize,
}

impl<'a> PartitionView<'a> {
    pub fn new(
        index: &'a PagesIndex,
        ordering: &'a WindowOrdering,
        begin: usize,
        end: usize,
    ) -> Self {
        Self {
            index,
            ordering,
            begin,
            end,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Backing `(page, offset)` address of a partition-relative row; feeds
    /// passthrough gathering.
    pub fn address(&self, row: usize) -> (usize, usize) {
        decode_position(self.index.position(self.begin + row))
    }

    /// Value of `channel` at a partition-relative row.
    pub fn cell(&self, channel: usize, row: usize) -> EngineResult<Cell> {
        let (block, offset) = self
            .index
            .array_at(channel, self.index.position(self.begin + row));
        cell::read_cell(block, offset)
    }

    /// Whether `row` belongs to the same peer group (equal sort keys) as the
    /// row before it. Row 0 starts the first peer group.
    pub fn peer_with_previous(&self, row: usize) -> EngineResult<bool> {
        if row == 0 {
            return Ok(false);
        }
        self.ordering.peer_equal(
            self.index,
            self.index.position(self.begin + row - 1),
            self.index.position(self.begin + row),
        )
    }
}

/// Two-pointer sweep yielding maximal equal-key runs as `(begin, end)` pairs.
/// Empty ranges are never yielded.
pub struct PartitionIterator<'a> {
    index: &'a PagesIndex,
    ordering: &'a WindowOrdering,
    current: usize,
    end: usize,
}

impl<'a> PartitionIterator<'a> {
    pub fn new(index: &'a PagesIndex, ordering: &'a WindowOrdering, begin: usize, end: usize) -> Self {
        Self {
            index,
            ordering,
            current: begin,
            end,
        }
    }

    /// End of the partition that starts at `begin`.
    pub fn partition_end(
        index: &PagesIndex,
        ordering: &WindowOrdering,
        begin: usize,
        end: usize,
    ) -> EngineResult<usize> {
        let anchor = index.position(begin);
        let mut cursor = begin + 1;
        while cursor < end {
            if !ordering.partition_equal(index, anchor, index.position(cursor))? {
                break;
            }
            cursor += 1;
        }
        Ok(cursor)
    }

    pub fn next_partition(&mut self) -> EngineResult<Option<(usize, usize)>> {
        if self.current >= self.end {
            return Ok(None);
        }
        let begin = self.current;
        let end = Self::partition_end(self.index, self.ordering, begin, self.end)?;
        self.current = end;
        Ok(Some((begin, end)))
    }
}
