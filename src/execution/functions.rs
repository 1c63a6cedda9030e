/// Window function runtime
///
/// A window function is reset at each partition start, then asked for one
/// cell per partition row in order. The built-in set covers the ranking and
/// offset functions; richer functions plug in behind the same trait.
use arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::page::cell::{cell_output_type, supported_type, Cell};

use super::partition::PartitionView;

pub trait WindowFunction: Send {
    fn output_type(&self) -> DataType;

    /// Invoked once before the first row of every partition.
    fn reset(&mut self);

    /// Cell value for `row` (0-based within the partition). Rows are visited
    /// strictly in order.
    fn process_row(&mut self, partition: &PartitionView<'_>, row: usize) -> EngineResult<Cell>;
}

/// Planner-facing descriptor of one window function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WindowFunctionSpec {
    RowNumber,
    Rank,
    DenseRank,
    Lag {
        value_channel: usize,
        offset: usize,
        default: Option<Cell>,
    },
    Lead {
        value_channel: usize,
        offset: usize,
        default: Option<Cell>,
    },
}

impl WindowFunctionSpec {
    pub fn output_type(&self, source_types: &[DataType]) -> EngineResult<DataType> {
        match self {
            WindowFunctionSpec::RowNumber
            | WindowFunctionSpec::Rank
            | WindowFunctionSpec::DenseRank => Ok(DataType::Int64),
            WindowFunctionSpec::Lag { value_channel, .. }
            | WindowFunctionSpec::Lead { value_channel, .. } => {
                let source = source_types.get(*value_channel).ok_or_else(|| {
                    EngineError::invariant(format!(
                        "window function value channel {} out of range",
                        value_channel
                    ))
                })?;
                if !supported_type(source) {
                    return Err(EngineError::type_mismatch_at(
                        format!("unsupported value channel type {:?}", source),
                        *value_channel,
                    ));
                }
                Ok(cell_output_type(source))
            }
        }
    }

    pub fn instantiate(&self, source_types: &[DataType]) -> EngineResult<Box<dyn WindowFunction>> {
        let output = self.output_type(source_types)?;
        Ok(match self {
            WindowFunctionSpec::RowNumber => Box::new(RowNumber { row_number: 0 }),
            WindowFunctionSpec::Rank => Box::new(Rank { rank: 0 }),
            WindowFunctionSpec::DenseRank => Box::new(DenseRank { rank: 0 }),
            WindowFunctionSpec::Lag {
                value_channel,
                offset,
                default,
            } => Box::new(Lag {
                value_channel: *value_channel,
                offset: *offset,
                default: default.clone().unwrap_or(Cell::Null),
                output,
            }),
            WindowFunctionSpec::Lead {
                value_channel,
                offset,
                default,
            } => Box::new(Lead {
                value_channel: *value_channel,
                offset: *offset,
                default: default.clone().unwrap_or(Cell::Null),
                output,
            }),
        })
    }
}

struct RowNumber {
    row_number: i64,
}

impl WindowFunction for RowNumber {
    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn reset(&mut self) {
        self.row_number = 0;
    }

    fn process_row(&mut self, _partition: &PartitionView<'_>, _row: usize) -> EngineResult<Cell> {
        self.row_number += 1;
        Ok(Cell::Int64(self.row_number))
    }
}

struct Rank {
    rank: i64,
}

impl WindowFunction for Rank {
    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn reset(&mut self) {
        self.rank = 0;
    }

    fn process_row(&mut self, partition: &PartitionView<'_>, row: usize) -> EngineResult<Cell> {
        if !partition.peer_with_previous(row)? {
            self.rank = row as i64 + 1;
        }
        Ok(Cell::Int64(self.rank))
    }
}

struct DenseRank {
    rank: i64,
}

impl WindowFunction for DenseRank {
    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn reset(&mut self) {
        self.rank = 0;
    }

    fn process_row(&mut self, partition: &PartitionView<'_>, row: usize) -> EngineResult<Cell> {
        if !partition.peer_with_previous(row)? {
            self.rank += 1;
        }
        Ok(Cell::Int64(self.rank))
    }
}

struct Lag {
    value_channel: usize,
    offset: usize,
    default: Cell,
    output: DataType,
}

impl WindowFunction for Lag {
    fn output_type(&self) -> DataType {
        self.output.clone()
    }

    fn reset(&mut self) {}

    fn process_row(&mut self, partition: &PartitionView<'_>, row: usize) -> EngineResult<Cell> {
        match row.checked_sub(self.offset) {
            Some(source_row) => partition.cell(self.value_channel, source_row),
            None => Ok(self.default.clone()),
        }
    }
}

struct Lead {
    value_channel: usize,
    offset: usize,
    default: Cell,
    output: DataType,
}

impl WindowFunction for Lead {
    fn output_type(&self) -> DataType {
        self.output.clone()
    }

    fn reset(&mut self) {}

    fn process_row(&mut self, partition: &PartitionView<'_>, row: usize) -> EngineResult<Cell> {
        let source_row = row + self.offset;
        if source_row < partition.len() {
            partition.cell(self.value_channel, source_row)
        } else {
            Ok(self.default.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ordering::{SortOrder, WindowOrdering};
    use crate::execution::pages_index::PagesIndex;
    use crate::page::Page;
    use arrow::array::{ArrayRef, Int64Array};
    use std::sync::Arc;

    fn sorted_index(keys: Vec<i64>) -> (PagesIndex, WindowOrdering) {
        let mut index = PagesIndex::with_capacity(vec![DataType::Int64], 16);
        let page = Page::new(vec![Arc::new(Int64Array::from(keys)) as ArrayRef]).unwrap();
        index.append_page(&page);
        let ordering = WindowOrdering::new(vec![], 0, vec![0], vec![SortOrder::AscNullsLast], 0);
        index.sort_range(&ordering, 0, index.position_count());
        (index, ordering)
    }

    fn run(
        function: &mut dyn WindowFunction,
        index: &PagesIndex,
        ordering: &WindowOrdering,
    ) -> Vec<Cell> {
        let view = PartitionView::new(index, ordering, 0, index.position_count());
        function.reset();
        (0..view.len())
            .map(|row| function.process_row(&view, row).unwrap())
            .collect()
    }

    fn as_i64(cells: &[Cell]) -> Vec<i64> {
        cells
            .iter()
            .map(|c| match c {
                Cell::Int64(v) => *v,
                other => panic!("unexpected cell {:?}", other),
            })
            .collect()
    }

    #[test]
    fn rank_skips_over_peer_groups() {
        let (index, ordering) = sorted_index(vec![10, 10, 20, 20, 30]);
        let mut rank = WindowFunctionSpec::Rank.instantiate(&[DataType::Int64]).unwrap();
        assert_eq!(as_i64(&run(rank.as_mut(), &index, &ordering)), vec![1, 1, 3, 3, 5]);
    }

    #[test]
    fn dense_rank_is_gapless() {
        let (index, ordering) = sorted_index(vec![10, 10, 20, 20, 30]);
        let mut dense = WindowFunctionSpec::DenseRank
            .instantiate(&[DataType::Int64])
            .unwrap();
        assert_eq!(as_i64(&run(dense.as_mut(), &index, &ordering)), vec![1, 1, 2, 2, 3]);
    }

    #[test]
    fn lag_and_lead_hit_partition_edges() {
        let (index, ordering) = sorted_index(vec![1, 2, 3]);
        let spec = WindowFunctionSpec::Lag {
            value_channel: 0,
            offset: 1,
            default: Some(Cell::Int64(-1)),
        };
        let mut lag = spec.instantiate(&[DataType::Int64]).unwrap();
        assert_eq!(as_i64(&run(lag.as_mut(), &index, &ordering)), vec![-1, 1, 2]);

        let spec = WindowFunctionSpec::Lead {
            value_channel: 0,
            offset: 2,
            default: None,
        };
        let mut lead = spec.instantiate(&[DataType::Int64]).unwrap();
        let cells = run(lead.as_mut(), &index, &ordering);
        assert!(matches!(cells[0], Cell::Int64(3)));
        assert!(cells[1].is_null());
        assert!(cells[2].is_null());
    }

    #[test]
    fn lead_output_type_follows_value_channel() {
        let spec = WindowFunctionSpec::Lead {
            value_channel: 0,
            offset: 1,
            default: None,
        };
        assert_eq!(spec.output_type(&[DataType::Utf8]).unwrap(), DataType::Utf8);
        assert!(spec.output_type(&[]).is_err());
    }
}
