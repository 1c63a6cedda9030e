/// K-way merge over sorted runs
///
/// Each run yields pages in sorted order; a binary heap over the runs' head
/// rows produces the merged order. Comparator ties break on run index, and
/// runs are created in input-time order, so within-partition input order
/// survives the merge. The reader surfaces rows one partition at a time,
/// bounding transient memory to a single partition.
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use arrow::datatypes::DataType;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::execution::ordering::WindowOrdering;
use crate::page::cell::{self, Cell, CellBuilder};
use crate::page::Page;

use super::PageStream;

struct RunCursor {
    stream: PageStream,
    page: Option<Page>,
    row: usize,
}

impl RunCursor {
    fn load_first(&mut self) -> EngineResult<()> {
        self.page = match self.stream.next() {
            Some(result) => Some(result?),
            None => None,
        };
        self.row = 0;
        Ok(())
    }

    fn current(&self) -> Option<(&Page, usize)> {
        self.page.as_ref().map(|page| (page, self.row))
    }

    fn advance(&mut self) -> EngineResult<()> {
        self.row += 1;
        while let Some(page) = &self.page {
            if self.row < page.position_count() {
                return Ok(());
            }
            self.page = match self.stream.next() {
                Some(result) => Some(result?),
                None => None,
            };
            self.row = 0;
        }
        Ok(())
    }
}

struct HeapEntry {
    key: Vec<Cell>,
    run: usize,
    ordering: Arc<WindowOrdering>,
}

impl HeapEntry {
    fn compare(&self, other: &Self) -> Ordering {
        self.ordering
            .compare_order_keys(&self.key, &other.key)
            .then_with(|| self.run.cmp(&other.run))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for ascending merge order
        self.compare(other).reverse()
    }
}

/// Merges sorted run streams and yields the pages of exactly one partition
/// per call.
pub struct PartitionedMergeReader {
    cursors: Vec<RunCursor>,
    heap: BinaryHeap<HeapEntry>,
    ordering: Arc<WindowOrdering>,
    /// materialized output types (dictionaries decode to their value type)
    output_types: Vec<DataType>,
    rows_per_page: usize,
    initialized: bool,
}

impl PartitionedMergeReader {
    pub fn new(
        streams: Vec<PageStream>,
        ordering: Arc<WindowOrdering>,
        source_types: &[DataType],
        rows_per_page: usize,
    ) -> Self {
        let output_types = source_types.iter().map(cell::cell_output_type).collect();
        Self {
            cursors: streams
                .into_iter()
                .map(|stream| RunCursor {
                    stream,
                    page: None,
                    row: 0,
                })
                .collect(),
            heap: BinaryHeap::new(),
            ordering,
            output_types,
            rows_per_page,
            initialized: false,
        }
    }

    fn initialize(&mut self) -> EngineResult<()> {
        for run in 0..self.cursors.len() {
            self.cursors[run].load_first()?;
            let key = match self.cursors[run].current() {
                Some((page, row)) => self.ordering.order_key(page.columns(), row)?,
                None => continue,
            };
            self.heap.push(HeapEntry {
                key,
                run,
                ordering: self.ordering.clone(),
            });
        }
        self.initialized = true;
        debug!(runs = self.cursors.len(), "merge initialized");
        Ok(())
    }

    /// Pages of the next partition in merged order, or `None` when all runs
    /// are exhausted.
    pub fn next_partition(&mut self) -> EngineResult<Option<Vec<Page>>> {
        if !self.initialized {
            self.initialize()?;
        }
        let first_run = match self.heap.peek() {
            Some(entry) => entry.run,
            None => return Ok(None),
        };
        let partition_key = {
            let (page, row) = self.cursors[first_run]
                .current()
                .ok_or_else(|| EngineError::invariant("merge cursor drained under heap entry"))?;
            self.ordering.partition_key(page.columns(), row)?
        };

        let mut builders = self
            .output_types
            .iter()
            .map(CellBuilder::for_type)
            .collect::<EngineResult<Vec<_>>>()?;
        let mut pages = Vec::new();
        let mut rows_in_chunk = 0usize;

        while let Some(run) = self.heap.peek().map(|entry| entry.run) {
            let row_key = {
                let (page, row) = self.cursors[run]
                    .current()
                    .ok_or_else(|| EngineError::invariant("merge cursor drained under heap entry"))?;
                self.ordering.partition_key(page.columns(), row)?
            };
            if !self.ordering.keys_equal(&row_key, &partition_key) {
                break;
            }
            let _ = self.heap.pop();

            {
                let (page, row) = self.cursors[run]
                    .current()
                    .ok_or_else(|| EngineError::invariant("merge cursor drained under heap entry"))?;
                for (channel, builder) in builders.iter_mut().enumerate() {
                    builder.append(cell::read_cell(page.column(channel).as_ref(), row)?)?;
                }
            }
            rows_in_chunk += 1;
            if rows_in_chunk == self.rows_per_page {
                pages.push(finish_page(&mut builders)?);
                rows_in_chunk = 0;
            }

            self.cursors[run].advance()?;
            if let Some((page, row)) = self.cursors[run].current() {
                let key = self.ordering.order_key(page.columns(), row)?;
                self.heap.push(HeapEntry {
                    key,
                    run,
                    ordering: self.ordering.clone(),
                });
            }
        }

        if rows_in_chunk > 0 {
            pages.push(finish_page(&mut builders)?);
        }
        Ok(Some(pages))
    }
}

fn finish_page(builders: &mut [CellBuilder]) -> EngineResult<Page> {
    let columns = builders.iter_mut().map(|b| b.finish()).collect();
    Page::new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ordering::SortOrder;
    use arrow::array::{Array, ArrayRef, Int64Array};

    fn page(partition: Vec<i64>, order: Vec<i64>) -> Page {
        Page::new(vec![
            Arc::new(Int64Array::from(partition)) as ArrayRef,
            Arc::new(Int64Array::from(order)) as ArrayRef,
        ])
        .unwrap()
    }

    fn stream(pages: Vec<Page>) -> PageStream {
        Box::new(pages.into_iter().map(Ok))
    }

    fn values(page: &Page, channel: usize) -> Vec<i64> {
        let array = page
            .column(channel)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        (0..array.len()).map(|i| array.value(i)).collect()
    }

    #[test]
    fn merges_partitions_across_runs() {
        // partition channel 0, order channel 1; both runs sorted
        let run_a = stream(vec![page(vec![1, 1, 2], vec![1, 3, 1])]);
        let run_b = stream(vec![page(vec![1, 2], vec![2, 2])]);
        let ordering = Arc::new(WindowOrdering::new(
            vec![0],
            0,
            vec![1],
            vec![SortOrder::AscNullsLast],
            0,
        ));
        let mut reader = PartitionedMergeReader::new(
            vec![run_a, run_b],
            ordering,
            &[DataType::Int64, DataType::Int64],
            100,
        );

        let first = reader.next_partition().unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(values(&first[0], 0), vec![1, 1, 1]);
        assert_eq!(values(&first[0], 1), vec![1, 2, 3]);

        let second = reader.next_partition().unwrap().unwrap();
        assert_eq!(values(&second[0], 0), vec![2, 2]);
        assert_eq!(values(&second[0], 1), vec![1, 2]);

        assert!(reader.next_partition().unwrap().is_none());
    }

    #[test]
    fn ties_prefer_earlier_runs() {
        let run_a = stream(vec![page(vec![1], vec![5])]);
        let run_b = stream(vec![page(vec![1], vec![5])]);
        let ordering = Arc::new(WindowOrdering::new(
            vec![0],
            0,
            vec![1],
            vec![SortOrder::AscNullsLast],
            0,
        ));
        let mut reader = PartitionedMergeReader::new(
            vec![run_a, run_b],
            ordering,
            &[DataType::Int64, DataType::Int64],
            1,
        );
        let pages = reader.next_partition().unwrap().unwrap();
        assert_eq!(pages.len(), 2);
        // chunk boundary at rows_per_page = 1
        assert_eq!(pages[0].position_count(), 1);
    }

    #[test]
    fn chunk_boundaries_respect_rows_per_page() {
        let run = stream(vec![page(vec![1, 1, 1], vec![1, 2, 3])]);
        let ordering = Arc::new(WindowOrdering::new(
            vec![0],
            0,
            vec![1],
            vec![SortOrder::AscNullsLast],
            0,
        ));
        let mut reader =
            PartitionedMergeReader::new(vec![run], ordering, &[DataType::Int64, DataType::Int64], 2);
        let pages = reader.next_partition().unwrap().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].position_count(), 2);
        assert_eq!(pages[1].position_count(), 1);
    }
}
