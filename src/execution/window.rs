/// WindowOperator: streaming window-function execution
///
/// Ingests pages one at a time, buffers at most one open pre-grouped group in
/// its pages index, sorts closed groups on demand and streams output pages
/// carrying the passthrough channels plus one appended column per window
/// function. Under memory revocation, the closed partitions of the open group
/// are handed to the spiller; group output is then produced from a k-way
/// merge over the spilled runs and the in-memory remainder.
use std::mem;
use std::sync::Arc;

use arrow::datatypes::DataType;
use fxhash::FxHashSet;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::memory::{MemoryContext, MemoryGrant};
use crate::page::cell::{self, supported_type};
use crate::page::{Page, PageBuilder};
use crate::spill::{PageStream, PartitionedMergeReader, SpillInProgress, Spiller, SpillerFactory};

use super::functions::{WindowFunction, WindowFunctionSpec};
use super::operator::{Operator, OperatorState};
use super::ordering::{SortOrder, WindowOrdering};
use super::pages_index::PagesIndex;
use super::partition::{PartitionIterator, PartitionView};

pub const DEFAULT_ROWS_PER_PAGE: usize = 10_000;

const POSITION_BYTES: usize = std::mem::size_of::<u64>();

#[derive(Clone, Debug)]
pub struct WindowOperatorConfig {
    /// Ordered types of the input channels.
    pub source_types: Vec<DataType>,
    /// Input channels passed through to the output, in output order.
    pub output_channels: Vec<usize>,
    pub window_functions: Vec<WindowFunctionSpec>,
    pub partition_channels: Vec<usize>,
    /// Prefix of `partition_channels` guaranteed grouped upstream.
    pub pre_grouped_channels: Vec<usize>,
    pub sort_channels: Vec<usize>,
    pub sort_orders: Vec<SortOrder>,
    /// Leading sort channels guaranteed sorted on input.
    pub pre_sorted_prefix: usize,
    /// Initial capacity hint for the pages index.
    pub expected_positions: usize,
    pub rows_per_page: usize,
    pub spill_enabled: bool,
}

impl WindowOperatorConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.source_types.is_empty() {
            return Err(EngineError::invariant("source types must not be empty"));
        }
        for (channel, data_type) in self.source_types.iter().enumerate() {
            if !supported_type(data_type) {
                return Err(EngineError::type_mismatch_at(
                    format!("unsupported source type {:?}", data_type),
                    channel,
                ));
            }
        }
        let channel_count = self.source_types.len();
        let in_range = |channels: &[usize], what: &str| -> EngineResult<()> {
            for &channel in channels {
                if channel >= channel_count {
                    return Err(EngineError::invariant(format!(
                        "{what} channel {channel} out of range ({channel_count} channels)"
                    )));
                }
            }
            Ok(())
        };
        in_range(&self.output_channels, "output")?;
        in_range(&self.partition_channels, "partition")?;
        in_range(&self.sort_channels, "sort")?;

        let mut seen = FxHashSet::default();
        for &channel in &self.partition_channels {
            if !seen.insert(channel) {
                return Err(EngineError::invariant(format!(
                    "duplicate partition channel {channel}"
                )));
            }
        }
        if self.pre_grouped_channels.len() > self.partition_channels.len()
            || self.pre_grouped_channels.as_slice()
                != &self.partition_channels[..self.pre_grouped_channels.len()]
        {
            return Err(EngineError::invariant(
                "pre-grouped channels must be a prefix of the partition channels",
            ));
        }
        if self.sort_orders.len() != self.sort_channels.len() {
            return Err(EngineError::invariant(format!(
                "{} sort orders for {} sort channels",
                self.sort_orders.len(),
                self.sort_channels.len()
            )));
        }
        if self.pre_sorted_prefix > self.sort_channels.len() {
            return Err(EngineError::invariant(
                "pre-sorted prefix exceeds the sort channel count",
            ));
        }
        if self.pre_sorted_prefix > 0
            && self.pre_grouped_channels.len() != self.partition_channels.len()
        {
            return Err(EngineError::invariant(
                "a pre-sorted prefix requires fully pre-grouped partitioning",
            ));
        }
        if self.rows_per_page == 0 {
            return Err(EngineError::invariant("rows per page must be positive"));
        }
        for spec in &self.window_functions {
            spec.output_type(&self.source_types)?;
        }
        Ok(())
    }
}

pub struct WindowOperatorFactory {
    config: WindowOperatorConfig,
}

impl WindowOperatorFactory {
    pub fn new(config: WindowOperatorConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &WindowOperatorConfig {
        &self.config
    }

    pub fn create_operator(
        &self,
        memory: Arc<MemoryContext>,
        spiller_factory: Option<Arc<dyn SpillerFactory>>,
    ) -> EngineResult<WindowOperator> {
        let config = &self.config;
        if config.spill_enabled && spiller_factory.is_none() {
            return Err(EngineError::invariant(
                "spill enabled but no spiller factory configured",
            ));
        }
        let functions = config
            .window_functions
            .iter()
            .map(|spec| spec.instantiate(&config.source_types))
            .collect::<EngineResult<Vec<_>>>()?;
        let function_types = config
            .window_functions
            .iter()
            .map(|spec| spec.output_type(&config.source_types))
            .collect::<EngineResult<Vec<_>>>()?;
        let ordering = Arc::new(WindowOrdering::new(
            config.partition_channels.clone(),
            config.pre_grouped_channels.len(),
            config.sort_channels.clone(),
            config.sort_orders.clone(),
            config.pre_sorted_prefix,
        ));
        let index = PagesIndex::with_capacity(config.source_types.clone(), config.expected_positions);
        Ok(WindowOperator {
            source_types: config.source_types.clone(),
            output_channels: config.output_channels.clone(),
            function_types,
            functions,
            ordering,
            rows_per_page: config.rows_per_page,
            expected_positions: config.expected_positions,
            spill_enabled: config.spill_enabled,
            memory,
            spiller_factory,
            spiller: None,
            index,
            index_reserved: 0,
            pending: None,
            drain: None,
            revoke: None,
            revoke_release: 0,
            finishing: false,
            last_group_closed: false,
            closed: false,
            state: OperatorState::NeedsInput,
        })
    }
}

/// A closed group being streamed to the output.
enum GroupDrain {
    InMemory(InMemoryDrain),
    Spilled(SpilledDrain),
}

struct InMemoryDrain {
    index: PagesIndex,
    /// bytes released when this drain completes
    reserved: usize,
    partition_begin: usize,
    partition_end: usize,
    next_row: usize,
    builder: PageBuilder,
    done: bool,
}

struct SpilledDrain {
    reader: PartitionedMergeReader,
    merged_types: Vec<DataType>,
    current: Option<CurrentPartition>,
    builder: PageBuilder,
    done: bool,
}

/// One merged partition rebuilt into a transient index.
struct CurrentPartition {
    index: PagesIndex,
    next_row: usize,
    reserved: usize,
}

pub struct WindowOperator {
    source_types: Vec<DataType>,
    output_channels: Vec<usize>,
    function_types: Vec<DataType>,
    functions: Vec<Box<dyn WindowFunction>>,
    ordering: Arc<WindowOrdering>,
    rows_per_page: usize,
    expected_positions: usize,
    spill_enabled: bool,
    memory: Arc<MemoryContext>,
    spiller_factory: Option<Arc<dyn SpillerFactory>>,
    spiller: Option<Box<dyn Spiller>>,
    /// the open group
    index: PagesIndex,
    index_reserved: usize,
    /// input rows not yet ingested (tail of a page past a group boundary)
    pending: Option<Page>,
    drain: Option<GroupDrain>,
    revoke: Option<SpillInProgress>,
    revoke_release: usize,
    finishing: bool,
    last_group_closed: bool,
    closed: bool,
    state: OperatorState,
}

impl WindowOperator {
    fn ensure_open(&self, call: &str) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::cancelled(format!(
                "{call} on closed window operator"
            )));
        }
        Ok(())
    }

    fn validate_page(&self, page: &Page) -> EngineResult<()> {
        if page.channel_count() != self.source_types.len() {
            return Err(EngineError::type_mismatch(format!(
                "page has {} channels, expected {}",
                page.channel_count(),
                self.source_types.len()
            )));
        }
        for (channel, expected) in self.source_types.iter().enumerate() {
            let actual = page.column(channel).data_type();
            if actual != expected {
                return Err(EngineError::type_mismatch_at(
                    format!("channel type {:?}, expected {:?}", actual, expected),
                    channel,
                ));
            }
        }
        Ok(())
    }

    fn spilled_runs(&self) -> usize {
        self.spiller.as_ref().map_or(0, |s| s.spilled_runs())
    }

    fn new_builder(&self) -> EngineResult<PageBuilder> {
        PageBuilder::new(
            self.output_channels.clone(),
            self.function_types.clone(),
            self.rows_per_page,
        )
    }

    /// Drive ingestion and group closure until a drain opens, input is
    /// needed, or the operator finishes.
    fn advance(&mut self) -> EngineResult<()> {
        while self.drain.is_none() && self.revoke.is_none() {
            if let Some(page) = self.pending.take() {
                self.ingest(page)?;
                continue;
            }
            if self.finishing {
                if !self.last_group_closed {
                    self.last_group_closed = true;
                    self.close_group()?;
                    continue;
                }
                self.state = OperatorState::Finished;
                return Ok(());
            }
            self.state = OperatorState::NeedsInput;
            return Ok(());
        }
        if self.drain.is_some() {
            self.state = OperatorState::HasOutput;
        }
        Ok(())
    }

    /// Append the head of `page` up to the first pre-grouped boundary; a
    /// crossed boundary closes the current group and parks the remainder.
    fn ingest(&mut self, page: Page) -> EngineResult<()> {
        if self.ordering.has_pre_grouping() && !self.index.is_empty() {
            let last = self
                .index
                .last_position()
                .ok_or_else(|| EngineError::invariant("non-empty index without positions"))?;
            if !self
                .ordering
                .pre_grouped_equal_index_page(&self.index, last, &page, 0)?
            {
                self.pending = Some(page);
                self.close_group()?;
                return Ok(());
            }
        }
        let rows = page.position_count();
        let mut group_end = rows;
        if self.ordering.has_pre_grouping() {
            for row in 1..rows {
                if !self.ordering.pre_grouped_equal_rows(&page, row - 1, row)? {
                    group_end = row;
                    break;
                }
            }
        }
        if group_end < rows {
            let head = page.slice(0, group_end)?;
            self.append_to_index(&head)?;
            self.pending = Some(page.slice(group_end, rows - group_end)?);
            self.close_group()?;
        } else {
            self.append_to_index(&page)?;
        }
        Ok(())
    }

    fn append_to_index(&mut self, page: &Page) -> EngineResult<()> {
        let bytes = page.estimated_bytes() + page.position_count() * POSITION_BYTES;
        match self.memory.reserve(bytes) {
            MemoryGrant::Granted => {}
            MemoryGrant::Overbudget => {
                if self.spill_enabled {
                    self.memory.request_revocation();
                } else {
                    self.memory.release(bytes);
                    return Err(EngineError::over_commit_with_usage(
                        "window operator buffer exceeds the memory budget and spill is disabled",
                        self.memory.limit(),
                        self.memory.reserved_bytes(),
                    ));
                }
            }
        }
        self.index.append_page(page);
        self.index_reserved += bytes;
        debug!(
            rows = page.position_count(),
            buffered = self.index.position_count(),
            "buffered input rows"
        );
        Ok(())
    }

    /// Move the open group into a drain. No-op for an empty group with no
    /// spilled runs.
    fn close_group(&mut self) -> EngineResult<()> {
        let mut index = mem::replace(
            &mut self.index,
            PagesIndex::with_capacity(self.source_types.clone(), self.expected_positions),
        );
        let reserved = mem::take(&mut self.index_reserved);
        let runs = self.spilled_runs();
        if index.is_empty() && runs == 0 {
            self.memory.release(reserved);
            return Ok(());
        }
        let rows = index.position_count();
        if runs > 0 {
            if rows > 0 {
                Self::sort_group(&self.ordering, &mut index)?;
            }
            let tail_pages = index.materialize_pages(0, rows, self.rows_per_page)?;
            let spiller = self
                .spiller
                .as_ref()
                .ok_or_else(|| EngineError::invariant("spilled runs without a spiller"))?;
            let mut streams = spiller.read_runs()?;
            streams.push(Box::new(tail_pages.into_iter().map(Ok)) as PageStream);
            let reader = PartitionedMergeReader::new(
                streams,
                self.ordering.clone(),
                &self.source_types,
                self.rows_per_page,
            );
            let merged_types: Vec<DataType> = self
                .source_types
                .iter()
                .map(cell::cell_output_type)
                .collect();
            let builder = self.new_builder()?;
            // the original index is dropped here; transient partitions
            // re-reserve as they are rebuilt
            self.memory.release(reserved);
            self.drain = Some(GroupDrain::Spilled(SpilledDrain {
                reader,
                merged_types,
                current: None,
                builder,
                done: false,
            }));
            info!(in_memory_rows = rows, runs, "closed group drains through spill merge");
        } else {
            Self::sort_group(&self.ordering, &mut index)?;
            let builder = self.new_builder()?;
            self.drain = Some(GroupDrain::InMemory(InMemoryDrain {
                index,
                reserved,
                partition_begin: 0,
                partition_end: 0,
                next_row: 0,
                builder,
                done: false,
            }));
            info!(rows, "closed group ready for output");
        }
        Ok(())
    }

    /// Sort a closed group. Fully pre-grouped input with a partial pre-sorted
    /// prefix sorts each equal-prefix sub-range on the remaining channels;
    /// otherwise the whole group is sorted by the order channels.
    fn sort_group(ordering: &WindowOrdering, index: &mut PagesIndex) -> EngineResult<()> {
        if !ordering.needs_sort() || index.is_empty() {
            return Ok(());
        }
        let rows = index.position_count();
        if ordering.fully_pre_grouped() && ordering.pre_sorted_prefix() > 0 {
            let mut begin = 0;
            while begin < rows {
                let mut end = begin + 1;
                while end < rows
                    && ordering.pre_sorted_equal(index, index.position(begin), index.position(end))?
                {
                    end += 1;
                }
                index.sort_range_suffix(ordering, begin, end);
                begin = end;
            }
        } else {
            index.sort_range(ordering, 0, rows);
        }
        Ok(())
    }

    fn produce_in_memory(
        drain: &mut InMemoryDrain,
        functions: &mut [Box<dyn WindowFunction>],
        ordering: &WindowOrdering,
    ) -> EngineResult<Option<Page>> {
        let rows = drain.index.position_count();
        loop {
            if drain.next_row >= drain.partition_end {
                if drain.partition_end >= rows {
                    drain.done = true;
                    return drain.builder.flush(drain.index.channels());
                }
                drain.partition_begin = drain.partition_end;
                drain.partition_end = PartitionIterator::partition_end(
                    &drain.index,
                    ordering,
                    drain.partition_begin,
                    rows,
                )?;
                for function in functions.iter_mut() {
                    function.reset();
                }
            }
            let view = PartitionView::new(
                &drain.index,
                ordering,
                drain.partition_begin,
                drain.partition_end,
            );
            let row = drain.next_row - drain.partition_begin;
            let cells = functions
                .iter_mut()
                .map(|function| function.process_row(&view, row))
                .collect::<EngineResult<Vec<_>>>()?;
            let address = view.address(row);
            drain.builder.append_row(address, cells)?;
            drain.next_row += 1;
            if drain.builder.is_full() {
                return drain.builder.flush(drain.index.channels());
            }
        }
    }

    fn produce_spilled(
        drain: &mut SpilledDrain,
        functions: &mut [Box<dyn WindowFunction>],
        ordering: &WindowOrdering,
        memory: &MemoryContext,
    ) -> EngineResult<Option<Page>> {
        loop {
            if drain.current.is_none() {
                match drain.reader.next_partition()? {
                    None => {
                        drain.done = true;
                        return Ok(None);
                    }
                    Some(pages) => {
                        let rows: usize = pages.iter().map(|p| p.position_count()).sum();
                        let bytes: usize = pages
                            .iter()
                            .map(|p| p.estimated_bytes() + p.position_count() * POSITION_BYTES)
                            .sum();
                        memory.reserve(bytes);
                        let mut index =
                            PagesIndex::with_capacity(drain.merged_types.clone(), rows);
                        for page in &pages {
                            index.append_page(page);
                        }
                        for function in functions.iter_mut() {
                            function.reset();
                        }
                        drain.current = Some(CurrentPartition {
                            index,
                            next_row: 0,
                            reserved: bytes,
                        });
                    }
                }
            }
            let Some(current) = drain.current.as_mut() else {
                continue;
            };
            let rows = current.index.position_count();
            while current.next_row < rows {
                let view = PartitionView::new(&current.index, ordering, 0, rows);
                let cells = functions
                    .iter_mut()
                    .map(|function| function.process_row(&view, current.next_row))
                    .collect::<EngineResult<Vec<_>>>()?;
                let address = view.address(current.next_row);
                drain.builder.append_row(address, cells)?;
                current.next_row += 1;
                if drain.builder.is_full() {
                    return drain.builder.flush(current.index.channels());
                }
            }
            // partition exhausted: flush so the next partition starts a fresh
            // chunk against its own transient index
            let page = drain.builder.flush(current.index.channels())?;
            memory.release(current.reserved);
            drain.current = None;
            if page.is_some() {
                return Ok(page);
            }
        }
    }
}

impl Operator for WindowOperator {
    fn state(&self) -> OperatorState {
        self.state
    }

    fn needs_input(&self) -> bool {
        !self.closed
            && !self.finishing
            && self.drain.is_none()
            && self.revoke.is_none()
            && self.pending.is_none()
    }

    fn add_input(&mut self, page: Page) -> EngineResult<()> {
        self.ensure_open("add_input")?;
        if !self.needs_input() {
            return Err(EngineError::invariant_in(
                "add_input while the operator does not need input",
                "window operator",
            ));
        }
        self.validate_page(&page)?;
        if page.position_count() == 0 {
            return Ok(());
        }
        self.pending = Some(page);
        self.advance()
    }

    fn finish(&mut self) -> EngineResult<()> {
        self.ensure_open("finish")?;
        if self.finishing {
            return Ok(());
        }
        self.finishing = true;
        if self.state != OperatorState::Finished {
            self.state = OperatorState::Finishing;
        }
        self.advance()
    }

    fn is_finished(&self) -> bool {
        self.state == OperatorState::Finished
    }

    fn get_output(&mut self) -> EngineResult<Option<Page>> {
        self.ensure_open("get_output")?;
        if self.revoke.is_some() {
            return Ok(None);
        }
        if self.drain.is_none() {
            return Ok(None);
        }
        let page = match self.drain.as_mut() {
            Some(GroupDrain::InMemory(drain)) => {
                Self::produce_in_memory(drain, &mut self.functions, &self.ordering)?
            }
            Some(GroupDrain::Spilled(drain)) => {
                Self::produce_spilled(drain, &mut self.functions, &self.ordering, &self.memory)?
            }
            None => None,
        };
        let done = match self.drain.as_ref() {
            Some(GroupDrain::InMemory(drain)) => drain.done,
            Some(GroupDrain::Spilled(drain)) => drain.done,
            None => false,
        };
        if done {
            match self.drain.take() {
                Some(GroupDrain::InMemory(drain)) => {
                    self.memory.release(drain.reserved);
                }
                Some(GroupDrain::Spilled(_)) => {
                    if let Some(spiller) = self.spiller.as_mut() {
                        spiller.discard()?;
                    }
                }
                None => {}
            }
            debug!("group drained");
            self.advance()?;
        }
        Ok(page)
    }

    fn is_blocked(&self) -> Option<&SpillInProgress> {
        self.revoke.as_ref()
    }

    fn start_memory_revoke(&mut self) -> EngineResult<()> {
        self.ensure_open("start_memory_revoke")?;
        if self.revoke.is_some() {
            return Err(EngineError::invariant_in(
                "memory revoke already in progress",
                "window operator",
            ));
        }
        let rows = self.index.position_count();
        if !self.spill_enabled || rows == 0 {
            self.memory.clear_revocation_request();
            return Ok(());
        }
        // sorting first makes complete partitions identifiable: everything
        // before the open tail partition is closed within the buffered data
        Self::sort_group(&self.ordering, &mut self.index)?;
        let last = self.index.position(rows - 1);
        let mut tail_start = rows - 1;
        while tail_start > 0
            && self
                .ordering
                .partition_equal(&self.index, self.index.position(tail_start - 1), last)?
        {
            tail_start -= 1;
        }
        if tail_start == 0 {
            // single open partition: retained in memory, nothing to spill
            self.memory.clear_revocation_request();
            return Ok(());
        }

        let spilled_pages = self.index.materialize_pages(0, tail_start, self.rows_per_page)?;
        let tail_pages = self.index.materialize_pages(tail_start, rows, self.rows_per_page)?;
        let mut tail_index =
            PagesIndex::with_capacity(self.source_types.clone(), self.expected_positions);
        let mut tail_reserved = 0;
        for page in &tail_pages {
            tail_reserved += page.estimated_bytes() + page.position_count() * POSITION_BYTES;
            tail_index.append_page(page);
        }
        self.memory.reserve(tail_reserved);
        self.revoke_release = mem::replace(&mut self.index_reserved, tail_reserved);
        self.index = tail_index;

        if self.spiller.is_none() {
            let factory = self.spiller_factory.as_ref().ok_or_else(|| {
                EngineError::invariant("spill enabled but no spiller factory configured")
            })?;
            self.spiller = Some(factory.create()?);
        }
        let spiller = self
            .spiller
            .as_mut()
            .ok_or_else(|| EngineError::invariant("spiller unavailable during revoke"))?;
        let in_progress = spiller.spill(&self.source_types, spilled_pages)?;
        self.revoke = Some(in_progress);
        info!(
            spilled_rows = tail_start,
            retained_rows = rows - tail_start,
            "memory revocation started"
        );
        Ok(())
    }

    fn finish_memory_revoke(&mut self) -> EngineResult<()> {
        self.ensure_open("finish_memory_revoke")?;
        if let Some(in_progress) = self.revoke.take() {
            let spiller = self
                .spiller
                .as_mut()
                .ok_or_else(|| EngineError::invariant("spiller unavailable during revoke"))?;
            spiller.complete(in_progress)?;
            self.memory.release(mem::take(&mut self.revoke_release));
            info!(runs = self.spilled_runs(), "memory revocation finished");
        }
        self.memory.clear_revocation_request();
        self.advance()
    }

    fn close(&mut self) -> EngineResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending = None;
        match self.drain.take() {
            Some(GroupDrain::InMemory(drain)) => self.memory.release(drain.reserved),
            Some(GroupDrain::Spilled(drain)) => {
                if let Some(current) = drain.current {
                    self.memory.release(current.reserved);
                }
            }
            None => {}
        }
        self.index = PagesIndex::with_capacity(self.source_types.clone(), 0);
        self.memory.release(mem::take(&mut self.index_reserved));
        if let Some(in_progress) = self.revoke.take() {
            // wait for the writer so the run file can be removed
            let _ = in_progress.wait();
            self.memory.release(mem::take(&mut self.revoke_release));
        }
        if let Some(mut spiller) = self.spiller.take() {
            spiller.discard()?;
        }
        self.memory.clear_revocation_request();
        self.state = OperatorState::Finished;
        info!("window operator closed");
        Ok(())
    }
}
