/// PageBuilder: assembles one output page
///
/// Passthrough columns are gathered positionally from the owning column store
/// with arrow's `interleave` kernel, so no per-type copy code exists here;
/// window-function columns accumulate through `CellBuilder`s.
use arrow::array::{Array, ArrayRef};
use arrow::compute::interleave;
use arrow::datatypes::DataType;

use crate::error::{EngineError, EngineResult};
use crate::page::cell::{Cell, CellBuilder};
use crate::page::Page;

pub struct PageBuilder {
    output_channels: Vec<usize>,
    function_types: Vec<DataType>,
    function_builders: Vec<CellBuilder>,
    /// (page, offset) addresses into the source column store, one per row
    positions: Vec<(usize, usize)>,
    rows_per_page: usize,
}

impl PageBuilder {
    pub fn new(
        output_channels: Vec<usize>,
        function_types: Vec<DataType>,
        rows_per_page: usize,
    ) -> EngineResult<Self> {
        let function_builders = function_types
            .iter()
            .map(CellBuilder::for_type)
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self {
            output_channels,
            function_types,
            function_builders,
            positions: Vec::new(),
            rows_per_page,
        })
    }

    pub fn row_count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.positions.len() >= self.rows_per_page
    }

    /// Append one output row: the passthrough address plus one cell per
    /// window function.
    pub fn append_row(&mut self, position: (usize, usize), cells: Vec<Cell>) -> EngineResult<()> {
        if cells.len() != self.function_builders.len() {
            return Err(EngineError::invariant(format!(
                "expected {} function cells, got {}",
                self.function_builders.len(),
                cells.len()
            )));
        }
        for (builder, cell) in self.function_builders.iter_mut().zip(cells) {
            builder.append(cell)?;
        }
        self.positions.push(position);
        Ok(())
    }

    /// Build the pending page against `channels`, the per-channel block lists
    /// of the source column store. Returns `None` when no rows are buffered.
    /// Resets the builder for the next chunk.
    pub fn flush(&mut self, channels: &[Vec<ArrayRef>]) -> EngineResult<Option<Page>> {
        if self.positions.is_empty() {
            return Ok(None);
        }
        let mut columns = Vec::with_capacity(self.output_channels.len() + self.function_builders.len());
        for &channel in &self.output_channels {
            let blocks: Vec<&dyn Array> = channels[channel].iter().map(|b| b.as_ref()).collect();
            columns.push(interleave(&blocks, &self.positions)?);
        }
        for builder in &mut self.function_builders {
            columns.push(builder.finish());
        }
        self.positions.clear();
        // finished cell builders restart empty; recreate to keep types honest
        self.function_builders = self
            .function_types
            .iter()
            .map(CellBuilder::for_type)
            .collect::<EngineResult<Vec<_>>>()?;
        Page::new(columns).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use std::sync::Arc;

    #[test]
    fn gathers_passthrough_by_position() {
        let block_a = Arc::new(Int64Array::from(vec![10, 11])) as ArrayRef;
        let block_b = Arc::new(Int64Array::from(vec![20, 21])) as ArrayRef;
        let channels = vec![vec![block_a, block_b]];

        let mut builder = PageBuilder::new(vec![0], vec![DataType::Int64], 100).unwrap();
        builder.append_row((1, 0), vec![Cell::Int64(1)]).unwrap();
        builder.append_row((0, 1), vec![Cell::Int64(2)]).unwrap();

        let page = builder.flush(&channels).unwrap().unwrap();
        let passthrough = page
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(passthrough.value(0), 20);
        assert_eq!(passthrough.value(1), 11);
        assert!(builder.is_empty());
    }
}
