/// Cell values: the scalar seam between columnar blocks and window functions
///
/// A `Cell` is an owned scalar read out of an arrow array at one position.
/// Window functions produce cells; `CellBuilder` accumulates them back into
/// an output column. The supported block kinds form a closed set: fixed-width
/// integers and floats, booleans, UTF-8 strings, and `Int32 -> Utf8`
/// dictionaries.
use std::cmp::Ordering;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, DictionaryArray, Float64Array, Float64Builder,
    Int64Array, Int64Builder, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, Int32Type};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Null,
    Int64(i64),
    Float64(f64),
    Boolean(bool),
    Utf8(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

/// Whether `data_type` belongs to the closed set of supported block kinds.
pub fn supported_type(data_type: &DataType) -> bool {
    match data_type {
        DataType::Int64 | DataType::Float64 | DataType::Boolean | DataType::Utf8 => true,
        DataType::Dictionary(key, value) => {
            matches!(key.as_ref(), DataType::Int32) && matches!(value.as_ref(), DataType::Utf8)
        }
        _ => false,
    }
}

/// The type a cell of `data_type` materializes as (dictionaries decode to
/// their value type).
pub fn cell_output_type(data_type: &DataType) -> DataType {
    match data_type {
        DataType::Dictionary(_, value) => value.as_ref().clone(),
        other => other.clone(),
    }
}

fn downcast_error(expected: &str, actual: &DataType) -> EngineError {
    EngineError::type_mismatch(format!("expected {} block, found {:?}", expected, actual))
}

fn dictionary_value(array: &dyn Array, row: usize) -> EngineResult<Cell> {
    let dict = array
        .as_any()
        .downcast_ref::<DictionaryArray<Int32Type>>()
        .ok_or_else(|| downcast_error("dictionary", array.data_type()))?;
    let values = dict
        .values()
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| downcast_error("utf8 dictionary values", dict.values().data_type()))?;
    let key = dict.keys().value(row) as usize;
    Ok(Cell::Utf8(values.value(key).to_string()))
}

/// Read the value at `row` as an owned cell. Null positions yield `Cell::Null`.
pub fn read_cell(array: &dyn Array, row: usize) -> EngineResult<Cell> {
    if array.is_null(row) {
        return Ok(Cell::Null);
    }
    match array.data_type() {
        DataType::Int64 => {
            let values = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| downcast_error("int64", array.data_type()))?;
            Ok(Cell::Int64(values.value(row)))
        }
        DataType::Float64 => {
            let values = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| downcast_error("float64", array.data_type()))?;
            Ok(Cell::Float64(values.value(row)))
        }
        DataType::Boolean => {
            let values = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| downcast_error("boolean", array.data_type()))?;
            Ok(Cell::Boolean(values.value(row)))
        }
        DataType::Utf8 => {
            let values = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| downcast_error("utf8", array.data_type()))?;
            Ok(Cell::Utf8(values.value(row).to_string()))
        }
        DataType::Dictionary(_, _) => dictionary_value(array, row),
        other => Err(EngineError::type_mismatch(format!(
            "unsupported block kind {:?}",
            other
        ))),
    }
}

/// Compare two non-null positions of same-typed blocks in natural ascending
/// order. Floats use a total order: NaN equals itself and sorts above every
/// other value; -0.0 equals +0.0.
pub fn compare_values(
    left: &dyn Array,
    left_row: usize,
    right: &dyn Array,
    right_row: usize,
) -> EngineResult<Ordering> {
    let l = read_cell(left, left_row)?;
    let r = read_cell(right, right_row)?;
    Ok(compare_cells(&l, &r))
}

/// Natural ascending comparison of two cells. `Null` sorts last here; ordering
/// of nulls against values is decided by the caller's sort order before this
/// is reached.
pub fn compare_cells(left: &Cell, right: &Cell) -> Ordering {
    match (left, right) {
        (Cell::Null, Cell::Null) => Ordering::Equal,
        (Cell::Null, _) => Ordering::Greater,
        (_, Cell::Null) => Ordering::Less,
        (Cell::Int64(l), Cell::Int64(r)) => l.cmp(r),
        (Cell::Float64(l), Cell::Float64(r)) => OrderedFloat(*l).cmp(&OrderedFloat(*r)),
        (Cell::Boolean(l), Cell::Boolean(r)) => l.cmp(r),
        (Cell::Utf8(l), Cell::Utf8(r)) => l.as_str().cmp(r.as_str()),
        // mismatched kinds cannot occur on validated channels; order by tag
        _ => kind_rank(left).cmp(&kind_rank(right)),
    }
}

/// Equality with null == null and NaN == NaN semantics.
pub fn cells_equal(left: &Cell, right: &Cell) -> bool {
    compare_cells(left, right) == Ordering::Equal
}

/// Positional equality over two blocks, null == null.
pub fn values_equal(
    left: &dyn Array,
    left_row: usize,
    right: &dyn Array,
    right_row: usize,
) -> EngineResult<bool> {
    match (left.is_null(left_row), right.is_null(right_row)) {
        (true, true) => Ok(true),
        (true, false) | (false, true) => Ok(false),
        (false, false) => Ok(compare_values(left, left_row, right, right_row)? == Ordering::Equal),
    }
}

fn kind_rank(cell: &Cell) -> u8 {
    match cell {
        Cell::Null => 0,
        Cell::Int64(_) => 1,
        Cell::Float64(_) => 2,
        Cell::Boolean(_) => 3,
        Cell::Utf8(_) => 4,
    }
}

/// Accumulates cells into one arrow output column.
pub enum CellBuilder {
    Int64(Int64Builder),
    Float64(Float64Builder),
    Boolean(BooleanBuilder),
    Utf8(StringBuilder),
}

impl CellBuilder {
    pub fn for_type(data_type: &DataType) -> EngineResult<Self> {
        match cell_output_type(data_type) {
            DataType::Int64 => Ok(CellBuilder::Int64(Int64Builder::new())),
            DataType::Float64 => Ok(CellBuilder::Float64(Float64Builder::new())),
            DataType::Boolean => Ok(CellBuilder::Boolean(BooleanBuilder::new())),
            DataType::Utf8 => Ok(CellBuilder::Utf8(StringBuilder::new())),
            other => Err(EngineError::type_mismatch(format!(
                "unsupported output kind {:?}",
                other
            ))),
        }
    }

    pub fn append(&mut self, cell: Cell) -> EngineResult<()> {
        match (self, cell) {
            (CellBuilder::Int64(b), Cell::Int64(v)) => b.append_value(v),
            (CellBuilder::Int64(b), Cell::Null) => b.append_null(),
            (CellBuilder::Float64(b), Cell::Float64(v)) => b.append_value(v),
            (CellBuilder::Float64(b), Cell::Null) => b.append_null(),
            (CellBuilder::Boolean(b), Cell::Boolean(v)) => b.append_value(v),
            (CellBuilder::Boolean(b), Cell::Null) => b.append_null(),
            (CellBuilder::Utf8(b), Cell::Utf8(v)) => b.append_value(v),
            (CellBuilder::Utf8(b), Cell::Null) => b.append_null(),
            (_, cell) => {
                return Err(EngineError::type_mismatch(format!(
                    "cell {:?} does not match output column type",
                    cell
                )))
            }
        }
        Ok(())
    }

    pub fn finish(&mut self) -> ArrayRef {
        match self {
            CellBuilder::Int64(b) => Arc::new(b.finish()),
            CellBuilder::Float64(b) => Arc::new(b.finish()),
            CellBuilder::Boolean(b) => Arc::new(b.finish()),
            CellBuilder::Utf8(b) => Arc::new(b.finish()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_total_order() {
        assert_eq!(
            compare_cells(&Cell::Float64(f64::NAN), &Cell::Float64(f64::NAN)),
            Ordering::Equal
        );
        assert_eq!(
            compare_cells(&Cell::Float64(f64::NAN), &Cell::Float64(f64::INFINITY)),
            Ordering::Greater
        );
        assert_eq!(
            compare_cells(&Cell::Float64(-0.0), &Cell::Float64(0.0)),
            Ordering::Equal
        );
    }

    #[test]
    fn null_equals_null() {
        assert!(cells_equal(&Cell::Null, &Cell::Null));
        assert!(!cells_equal(&Cell::Null, &Cell::Int64(0)));
    }

    #[test]
    fn builder_round_trip() {
        let mut builder = CellBuilder::for_type(&DataType::Utf8).unwrap();
        builder.append(Cell::Utf8("a".to_string())).unwrap();
        builder.append(Cell::Null).unwrap();
        let array = builder.finish();
        assert_eq!(read_cell(array.as_ref(), 0).unwrap().is_null(), false);
        assert!(read_cell(array.as_ref(), 1).unwrap().is_null());
    }

    #[test]
    fn dictionary_reads_decode_values() {
        let dict: DictionaryArray<Int32Type> =
            vec![Some("b"), None, Some("a")].into_iter().collect();
        let cell = read_cell(&dict, 0).unwrap();
        assert!(matches!(cell, Cell::Utf8(ref s) if s == "b"));
        assert!(read_cell(&dict, 1).unwrap().is_null());
    }
}
