/// Comparator kit for window processing
///
/// Built once per operator from the configured channels, it provides
/// partition equality, pre-grouped equality (usable across containers),
/// the order comparator used for group sorting and spill merging, and peer
/// equality over the sort channels.
///
/// The order comparator covers the non-pre-grouped partition channels
/// (ascending, nulls last) followed by the configured sort channels; sorting
/// a group with it makes partitions contiguous even when partitioning is
/// only partially pre-grouped.
use std::cmp::Ordering;

use arrow::array::ArrayRef;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::page::cell::{self, Cell};
use crate::page::Page;

use super::pages_index::PagesIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    AscNullsFirst,
    AscNullsLast,
    DescNullsFirst,
    DescNullsLast,
}

impl SortOrder {
    pub fn ascending(self) -> bool {
        matches!(self, SortOrder::AscNullsFirst | SortOrder::AscNullsLast)
    }

    pub fn nulls_first(self) -> bool {
        matches!(self, SortOrder::AscNullsFirst | SortOrder::DescNullsFirst)
    }

    /// Order two cells under this sort order, including null placement.
    pub fn compare_cells(self, left: &Cell, right: &Cell) -> Ordering {
        match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if self.nulls_first() {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, true) => {
                if self.nulls_first() {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, false) => {
                let natural = cell::compare_cells(left, right);
                if self.ascending() {
                    natural
                } else {
                    natural.reverse()
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct WindowOrdering {
    partition_channels: Vec<usize>,
    /// number of leading partition channels guaranteed grouped upstream
    pre_grouped: usize,
    sort_channels: Vec<usize>,
    sort_orders: Vec<SortOrder>,
    /// ungrouped partition channels ++ sort channels
    order_channels: Vec<usize>,
    order_orders: Vec<SortOrder>,
    /// leading sort channels guaranteed sorted on input
    pre_sorted: usize,
}

impl WindowOrdering {
    /// Arguments are validated by the operator factory.
    pub fn new(
        partition_channels: Vec<usize>,
        pre_grouped: usize,
        sort_channels: Vec<usize>,
        sort_orders: Vec<SortOrder>,
        pre_sorted: usize,
    ) -> Self {
        let ungrouped: Vec<usize> = partition_channels[pre_grouped..].to_vec();
        let mut order_channels = ungrouped.clone();
        order_channels.extend_from_slice(&sort_channels);
        let mut order_orders = vec![SortOrder::AscNullsLast; ungrouped.len()];
        order_orders.extend_from_slice(&sort_orders);
        Self {
            partition_channels,
            pre_grouped,
            sort_channels,
            sort_orders,
            order_channels,
            order_orders,
            pre_sorted,
        }
    }

    pub fn partition_channels(&self) -> &[usize] {
        &self.partition_channels
    }

    pub fn pre_grouped_channels(&self) -> &[usize] {
        &self.partition_channels[..self.pre_grouped]
    }

    pub fn has_pre_grouping(&self) -> bool {
        self.pre_grouped > 0
    }

    pub fn fully_pre_grouped(&self) -> bool {
        self.pre_grouped == self.partition_channels.len()
    }

    pub fn sort_channels(&self) -> &[usize] {
        &self.sort_channels
    }

    pub fn pre_sorted_prefix(&self) -> usize {
        self.pre_sorted
    }

    pub fn order_channels(&self) -> &[usize] {
        &self.order_channels
    }

    /// Whether a closed group requires any sorting at all.
    pub fn needs_sort(&self) -> bool {
        if self.fully_pre_grouped() {
            self.pre_sorted < self.sort_channels.len()
        } else {
            !self.order_channels.is_empty()
        }
    }

    /// Equality of two logical positions on all partition channels.
    pub fn partition_equal(&self, index: &PagesIndex, a: u64, b: u64) -> EngineResult<bool> {
        self.positions_equal(index, a, b, &self.partition_channels)
    }

    /// Equality of two logical positions on the sort channels (peer rows).
    pub fn peer_equal(&self, index: &PagesIndex, a: u64, b: u64) -> EngineResult<bool> {
        self.positions_equal(index, a, b, &self.sort_channels)
    }

    /// Equality on the pre-sorted prefix of the sort channels.
    pub fn pre_sorted_equal(&self, index: &PagesIndex, a: u64, b: u64) -> EngineResult<bool> {
        self.positions_equal(index, a, b, &self.sort_channels[..self.pre_sorted])
    }

    /// Full order comparison used for group sorting and spill merging.
    pub fn order_compare(&self, index: &PagesIndex, a: u64, b: u64) -> EngineResult<Ordering> {
        self.compare_channels(index, a, b, &self.order_channels, &self.order_orders)
    }

    /// Order comparison restricted to the sort channels past the pre-sorted
    /// prefix; used when only sub-ranges of a group need sorting.
    pub fn suffix_compare(&self, index: &PagesIndex, a: u64, b: u64) -> EngineResult<Ordering> {
        self.compare_channels(
            index,
            a,
            b,
            &self.sort_channels[self.pre_sorted..],
            &self.sort_orders[self.pre_sorted..],
        )
    }

    /// Pre-grouped equality between a buffered position and a page row.
    pub fn pre_grouped_equal_index_page(
        &self,
        index: &PagesIndex,
        position: u64,
        page: &Page,
        row: usize,
    ) -> EngineResult<bool> {
        for &channel in self.pre_grouped_channels() {
            let (block, offset) = index.array_at(channel, position);
            if !cell::values_equal(block, offset, page.column(channel).as_ref(), row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Pre-grouped equality between two rows of the same page.
    pub fn pre_grouped_equal_rows(&self, page: &Page, a: usize, b: usize) -> EngineResult<bool> {
        for &channel in self.pre_grouped_channels() {
            let block = page.column(channel).as_ref();
            if !cell::values_equal(block, a, block, b)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Owned order key of one page row; feeds the spill merge heap.
    pub fn order_key(&self, columns: &[ArrayRef], row: usize) -> EngineResult<Vec<Cell>> {
        self.key_cells(columns, row, &self.order_channels)
    }

    /// Owned partition key of one page row; used to cut merged partitions.
    pub fn partition_key(&self, columns: &[ArrayRef], row: usize) -> EngineResult<Vec<Cell>> {
        self.key_cells(columns, row, &self.partition_channels)
    }

    pub fn compare_order_keys(&self, left: &[Cell], right: &[Cell]) -> Ordering {
        for ((l, r), order) in left.iter().zip(right).zip(&self.order_orders) {
            let ordering = order.compare_cells(l, r);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn keys_equal(&self, left: &[Cell], right: &[Cell]) -> bool {
        left.len() == right.len()
            && left.iter().zip(right).all(|(l, r)| cell::cells_equal(l, r))
    }

    fn key_cells(
        &self,
        columns: &[ArrayRef],
        row: usize,
        channels: &[usize],
    ) -> EngineResult<Vec<Cell>> {
        channels
            .iter()
            .map(|&channel| cell::read_cell(columns[channel].as_ref(), row))
            .collect()
    }

    fn positions_equal(
        &self,
        index: &PagesIndex,
        a: u64,
        b: u64,
        channels: &[usize],
    ) -> EngineResult<bool> {
        for &channel in channels {
            let (left, left_row) = index.array_at(channel, a);
            let (right, right_row) = index.array_at(channel, b);
            if !cell::values_equal(left, left_row, right, right_row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn compare_channels(
        &self,
        index: &PagesIndex,
        a: u64,
        b: u64,
        channels: &[usize],
        orders: &[SortOrder],
    ) -> EngineResult<Ordering> {
        for (&channel, order) in channels.iter().zip(orders) {
            let (left, left_row) = index.array_at(channel, a);
            let (right, right_row) = index.array_at(channel, b);
            let l = cell::read_cell(left, left_row)?;
            let r = cell::read_cell(right, right_row)?;
            let ordering = order.compare_cells(&l, &r);
            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }
        Ok(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_order_null_placement() {
        let null = Cell::Null;
        let one = Cell::Int64(1);
        assert_eq!(
            SortOrder::AscNullsFirst.compare_cells(&null, &one),
            Ordering::Less
        );
        assert_eq!(
            SortOrder::AscNullsLast.compare_cells(&null, &one),
            Ordering::Greater
        );
        assert_eq!(
            SortOrder::DescNullsFirst.compare_cells(&one, &null),
            Ordering::Greater
        );
    }

    #[test]
    fn descending_reverses_values_not_nulls() {
        let one = Cell::Int64(1);
        let two = Cell::Int64(2);
        assert_eq!(
            SortOrder::DescNullsLast.compare_cells(&one, &two),
            Ordering::Greater
        );
        assert_eq!(
            SortOrder::DescNullsLast.compare_cells(&Cell::Null, &two),
            Ordering::Greater
        );
    }

    #[test]
    fn order_channels_cover_ungrouped_partition_prefix() {
        let ordering = WindowOrdering::new(vec![0, 1], 1, vec![3], vec![SortOrder::AscNullsLast], 0);
        assert_eq!(ordering.order_channels(), &[1, 3]);
        assert_eq!(ordering.pre_grouped_channels(), &[0]);
        assert!(!ordering.fully_pre_grouped());
        assert!(ordering.needs_sort());
    }

    #[test]
    fn fully_pre_sorted_needs_no_sort() {
        let ordering = WindowOrdering::new(vec![0], 1, vec![1], vec![SortOrder::AscNullsLast], 1);
        assert!(!ordering.needs_sort());
    }
}
