/// Integration tests for spill-to-disk in the window operator
/// Covers the revocation handshake, spilled-output equivalence with the
/// in-memory path, over-commit handling, and scratch-file cleanup.
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{ArrayRef, Int64Array};
use arrow::datatypes::DataType;

use window_engine::error::{EngineError, EngineResult};
use window_engine::execution::{
    Operator, SortOrder, WindowFunctionSpec, WindowOperator, WindowOperatorConfig,
    WindowOperatorFactory,
};
use window_engine::memory::MemoryContext;
use window_engine::page::cell::{read_cell, Cell};
use window_engine::page::Page;
use window_engine::spill::{FileSpillerFactory, PartitionedMergeReader, Spiller, SpillerFactory};
use window_engine::execution::WindowOrdering;

fn int_column(values: Vec<i64>) -> ArrayRef {
    Arc::new(Int64Array::from(values))
}

fn page(partition: Vec<i64>, order: Vec<i64>) -> Page {
    Page::new(vec![int_column(partition), int_column(order)]).unwrap()
}

fn config(spill_enabled: bool) -> WindowOperatorConfig {
    WindowOperatorConfig {
        source_types: vec![DataType::Int64, DataType::Int64],
        output_channels: vec![0, 1],
        window_functions: vec![WindowFunctionSpec::RowNumber],
        partition_channels: vec![0],
        pre_grouped_channels: vec![],
        sort_channels: vec![1],
        sort_orders: vec![SortOrder::AscNullsLast],
        pre_sorted_prefix: 0,
        expected_positions: 64,
        rows_per_page: 10_000,
        spill_enabled,
    }
}

fn operator_with(
    memory: Arc<MemoryContext>,
    spill_dir: Option<&std::path::Path>,
) -> WindowOperator {
    let spiller_factory = spill_dir
        .map(|dir| Arc::new(FileSpillerFactory::new(dir)) as Arc<dyn SpillerFactory>);
    WindowOperatorFactory::new(config(spill_dir.is_some()))
        .unwrap()
        .create_operator(memory, spiller_factory)
        .unwrap()
}

fn drain_all(op: &mut WindowOperator) -> Vec<Vec<Cell>> {
    let mut rows = Vec::new();
    while !op.is_finished() {
        if let Some(page) = op.get_output().unwrap() {
            for row in 0..page.position_count() {
                rows.push(
                    page.columns()
                        .iter()
                        .map(|c| read_cell(c.as_ref(), row).unwrap())
                        .collect(),
                );
            }
        }
    }
    rows
}

fn await_spill(op: &WindowOperator) {
    while op.is_blocked().map_or(false, |spill| !spill.is_done()) {
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn spill_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().map_or(false, |e| e == "spill") {
                files.push(path);
            }
        }
    }
    files
}

#[test]
fn spill_under_pressure_matches_the_in_memory_output() {
    let first = page(vec![1, 2, 1, 2, 1, 2], vec![30, 11, 20, 13, 10, 12]);
    let second = page(vec![1, 2], vec![40, 14]);

    // reference: same input, no spill
    let mut reference = operator_with(Arc::new(MemoryContext::unbounded()), None);
    reference.add_input(first.clone()).unwrap();
    reference.add_input(second.clone()).unwrap();
    reference.finish().unwrap();
    let expected = drain_all(&mut reference);

    let dir = tempfile::tempdir().unwrap();
    let mut op = operator_with(Arc::new(MemoryContext::unbounded()), Some(dir.path()));
    op.add_input(first).unwrap();

    // both partitions buffered; partition 1 is the closed prefix after sort
    op.start_memory_revoke().unwrap();
    assert!(op.is_blocked().is_some());
    await_spill(&op);
    op.finish_memory_revoke().unwrap();
    assert!(op.is_blocked().is_none());
    assert!(!spill_files(dir.path()).is_empty());

    // the retained open partition still accepts input
    assert!(op.needs_input());
    op.add_input(second).unwrap();
    op.finish().unwrap();
    let actual = drain_all(&mut op);

    assert_eq!(actual, expected);
    // group fully drained: runs discarded
    assert!(spill_files(dir.path()).is_empty());
    op.close().unwrap();
}

#[test]
fn revocation_with_a_single_partition_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut op = operator_with(Arc::new(MemoryContext::unbounded()), Some(dir.path()));
    op.add_input(page(vec![7, 7, 7], vec![3, 1, 2])).unwrap();

    op.start_memory_revoke().unwrap();
    assert!(op.is_blocked().is_none());
    assert!(spill_files(dir.path()).is_empty());
    op.finish_memory_revoke().unwrap();

    op.finish().unwrap();
    let rows = drain_all(&mut op);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], vec![Cell::Int64(7), Cell::Int64(1), Cell::Int64(1)]);
}

#[test]
fn repeated_revocations_accumulate_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut op = operator_with(Arc::new(MemoryContext::unbounded()), Some(dir.path()));

    op.add_input(page(vec![1, 1, 2, 2], vec![2, 1, 2, 1])).unwrap();
    op.start_memory_revoke().unwrap();
    await_spill(&op);
    op.finish_memory_revoke().unwrap();

    op.add_input(page(vec![1, 3, 3], vec![3, 1, 2])).unwrap();
    op.start_memory_revoke().unwrap();
    await_spill(&op);
    op.finish_memory_revoke().unwrap();

    assert_eq!(spill_files(dir.path()).len(), 2);
    op.finish().unwrap();
    let rows = drain_all(&mut op);

    let expected: Vec<Vec<Cell>> = vec![
        vec![Cell::Int64(1), Cell::Int64(1), Cell::Int64(1)],
        vec![Cell::Int64(1), Cell::Int64(2), Cell::Int64(2)],
        vec![Cell::Int64(1), Cell::Int64(3), Cell::Int64(3)],
        vec![Cell::Int64(2), Cell::Int64(1), Cell::Int64(1)],
        vec![Cell::Int64(2), Cell::Int64(2), Cell::Int64(2)],
        vec![Cell::Int64(3), Cell::Int64(1), Cell::Int64(1)],
        vec![Cell::Int64(3), Cell::Int64(2), Cell::Int64(2)],
    ];
    assert_eq!(rows, expected);
    assert!(spill_files(dir.path()).is_empty());
}

#[test]
fn over_commit_without_spill_is_fatal() {
    let memory = Arc::new(MemoryContext::new(1));
    let mut op = operator_with(memory, None);
    let err = op
        .add_input(page(vec![1, 2, 3], vec![1, 2, 3]))
        .unwrap_err();
    assert!(matches!(err, EngineError::OverCommit { .. }));
}

#[test]
fn over_budget_requests_revocation_when_spill_is_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Arc::new(MemoryContext::new(1));
    let mut op = operator_with(memory.clone(), Some(dir.path()));

    op.add_input(page(vec![1, 1, 2, 2], vec![2, 1, 4, 3])).unwrap();
    assert!(memory.revocation_requested());

    op.start_memory_revoke().unwrap();
    await_spill(&op);
    op.finish_memory_revoke().unwrap();
    assert!(!memory.revocation_requested());

    op.finish().unwrap();
    let rows = drain_all(&mut op);
    assert_eq!(rows.len(), 4);
    // partition 2 row_number restarts after the merge
    assert_eq!(rows[2], vec![Cell::Int64(2), Cell::Int64(3), Cell::Int64(1)]);
    op.close().unwrap();
    assert_eq!(memory.reserved_bytes(), 0);
}

#[test]
fn close_after_revoke_discards_runs_and_memory() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Arc::new(MemoryContext::unbounded());
    let mut op = operator_with(memory.clone(), Some(dir.path()));

    op.add_input(page(vec![1, 1, 2, 2], vec![1, 2, 3, 4])).unwrap();
    op.start_memory_revoke().unwrap();
    await_spill(&op);
    op.finish_memory_revoke().unwrap();
    assert!(!spill_files(dir.path()).is_empty());

    op.close().unwrap();
    assert!(spill_files(dir.path()).is_empty());
    assert_eq!(memory.reserved_bytes(), 0);
    op.close().unwrap();
}

#[test]
fn spilled_runs_merge_back_in_sorted_order() {
    // invariant: spill then merged read preserves the row multiset and the
    // sort-channel order within each partition
    let dir = tempfile::tempdir().unwrap();
    let factory = FileSpillerFactory::new(dir.path());
    let mut spiller = factory.create().unwrap();
    let types = vec![DataType::Int64, DataType::Int64];

    let run_a = spiller
        .spill(&types, vec![page(vec![1, 1, 2], vec![1, 3, 2])])
        .unwrap();
    spiller.complete(run_a).unwrap();
    let run_b = spiller
        .spill(&types, vec![page(vec![1, 2], vec![2, 1])])
        .unwrap();
    spiller.complete(run_b).unwrap();

    let ordering = Arc::new(WindowOrdering::new(
        vec![0],
        0,
        vec![1],
        vec![SortOrder::AscNullsLast],
        0,
    ));
    let mut reader =
        PartitionedMergeReader::new(spiller.read_runs().unwrap(), ordering, &types, 10_000);

    let mut merged_rows = Vec::new();
    while let Some(pages) = reader.next_partition().unwrap() {
        for page in &pages {
            for row in 0..page.position_count() {
                merged_rows.push(
                    page.columns()
                        .iter()
                        .map(|c| read_cell(c.as_ref(), row))
                        .collect::<EngineResult<Vec<_>>>()
                        .unwrap(),
                );
            }
        }
    }

    let expected: Vec<Vec<Cell>> = vec![
        vec![Cell::Int64(1), Cell::Int64(1)],
        vec![Cell::Int64(1), Cell::Int64(2)],
        vec![Cell::Int64(1), Cell::Int64(3)],
        vec![Cell::Int64(2), Cell::Int64(1)],
        vec![Cell::Int64(2), Cell::Int64(2)],
    ];
    assert_eq!(merged_rows, expected);
    spiller.discard().unwrap();
}
