//! # Window Engine
//!
//! The streaming window-function operator of a columnar query engine.
//!
//! The operator consumes columnar pages from an upstream pipeline, computes
//! window functions (`row_number`, `rank`, `dense_rank`, `lag`, `lead`, and
//! anything else behind the same trait) over partitions of rows, and emits
//! pages carrying the passthrough channels plus one appended column per
//! function. Pre-grouped and pre-sorted input bounds buffering to a single
//! group; memory revocation spills closed partitions to scratch storage and
//! streams output through an external merge.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use window_engine::execution::{
//!     Operator, SortOrder, WindowFunctionSpec, WindowOperatorConfig, WindowOperatorFactory,
//!     DEFAULT_ROWS_PER_PAGE,
//! };
//! use window_engine::memory::MemoryContext;
//! use window_engine::page::Page;
//! use arrow::array::{ArrayRef, Int64Array};
//! use arrow::datatypes::DataType;
//!
//! let factory = WindowOperatorFactory::new(WindowOperatorConfig {
//!     source_types: vec![DataType::Int64, DataType::Int64],
//!     output_channels: vec![0, 1],
//!     window_functions: vec![WindowFunctionSpec::RowNumber],
//!     partition_channels: vec![0],
//!     pre_grouped_channels: vec![],
//!     sort_channels: vec![1],
//!     sort_orders: vec![SortOrder::AscNullsLast],
//!     pre_sorted_prefix: 0,
//!     expected_positions: 1024,
//!     rows_per_page: DEFAULT_ROWS_PER_PAGE,
//!     spill_enabled: false,
//! })
//! .unwrap();
//!
//! let memory = Arc::new(MemoryContext::unbounded());
//! let mut operator = factory.create_operator(memory, None).unwrap();
//!
//! let page = Page::new(vec![
//!     Arc::new(Int64Array::from(vec![1, 1, 2])) as ArrayRef,
//!     Arc::new(Int64Array::from(vec![9, 7, 8])) as ArrayRef,
//! ])
//! .unwrap();
//! operator.add_input(page).unwrap();
//! operator.finish().unwrap();
//! while !operator.is_finished() {
//!     if let Some(output) = operator.get_output().unwrap() {
//!         println!("{} rows", output.position_count());
//!     }
//! }
//! ```

pub mod error;
pub mod execution;
pub mod memory;
pub mod page;
pub mod spill;

// Public API - main types users need
pub use error::{EngineError, EngineResult};
pub use execution::operator::{Operator, OperatorState};
pub use execution::window::{WindowOperator, WindowOperatorConfig, WindowOperatorFactory};
pub use page::Page;
