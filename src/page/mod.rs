/// Page: immutable columnar row batch
///
/// Pages are the sole unit of data movement between operators. Each page is a
/// set of equally-long arrow arrays plus a position count; columns are
/// addressed by channel (positional index), never by name.
pub mod builder;
pub mod cell;

pub use builder::PageBuilder;
pub use cell::{Cell, CellBuilder};

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::DataType;

use crate::error::{EngineError, EngineResult};

#[derive(Clone, Debug)]
pub struct Page {
    columns: Vec<ArrayRef>,
    position_count: usize,
}

impl Page {
    /// Create a page from arrow arrays. All columns must have the same length.
    pub fn new(columns: Vec<ArrayRef>) -> EngineResult<Self> {
        let first = columns
            .first()
            .ok_or_else(|| EngineError::invariant("page must have at least one column"))?;
        let position_count = first.len();
        for (channel, column) in columns.iter().enumerate() {
            if column.len() != position_count {
                return Err(EngineError::invariant(format!(
                    "column {} has {} positions, expected {}",
                    channel,
                    column.len(),
                    position_count
                )));
            }
        }
        Ok(Self {
            columns,
            position_count,
        })
    }

    pub fn position_count(&self) -> usize {
        self.position_count
    }

    pub fn channel_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, channel: usize) -> &ArrayRef {
        &self.columns[channel]
    }

    pub fn columns(&self) -> &[ArrayRef] {
        &self.columns
    }

    pub fn data_types(&self) -> Vec<DataType> {
        self.columns.iter().map(|c| c.data_type().clone()).collect()
    }

    /// Zero-copy slice of `length` positions starting at `offset`.
    pub fn slice(&self, offset: usize, length: usize) -> EngineResult<Self> {
        if offset + length > self.position_count {
            return Err(EngineError::invariant(format!(
                "slice out of bounds: offset {} + length {} > position count {}",
                offset, length, self.position_count
            )));
        }
        let columns = self
            .columns
            .iter()
            .map(|c| c.slice(offset, length))
            .collect();
        Ok(Self {
            columns,
            position_count: length,
        })
    }

    /// Retained heap size, used for memory reservations.
    pub fn estimated_bytes(&self) -> usize {
        self.columns.iter().map(|c| c.get_array_memory_size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use std::sync::Arc;

    #[test]
    fn rejects_ragged_columns() {
        let a = Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef;
        let b = Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef;
        assert!(Page::new(vec![a, b]).is_err());
    }

    #[test]
    fn slice_is_bounded() {
        let a = Arc::new(Int64Array::from(vec![1, 2, 3, 4])) as ArrayRef;
        let page = Page::new(vec![a]).unwrap();
        let head = page.slice(0, 2).unwrap();
        assert_eq!(head.position_count(), 2);
        assert!(page.slice(3, 2).is_err());
    }
}
