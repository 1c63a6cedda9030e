/// Spill-to-disk for the window operator
///
/// A spiller owns the sorted runs of the group currently being processed.
/// Runs are written asynchronously on a dedicated writer thread; the operator
/// observes completion through `SpillInProgress` and reads runs back as page
/// streams for the k-way merge. Write failures are retried once; the second
/// failure is fatal.
pub mod format;
pub mod merge;

pub use self::merge::PartitionedMergeReader;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use arrow::datatypes::DataType;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::page::Page;

use self::format::RunReader;

/// Completion token for one asynchronous run write.
pub struct SpillInProgress {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<EngineResult<PathBuf>>>,
}

impl SpillInProgress {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Join the writer and return the finished run path.
    pub fn wait(mut self) -> EngineResult<PathBuf> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| EngineError::invariant("spill completion already consumed"))?;
        handle
            .join()
            .map_err(|_| EngineError::spill_io("spill writer thread panicked"))?
    }
}

pub type PageStream = Box<dyn Iterator<Item = EngineResult<Page>> + Send>;

pub trait Spiller: Send {
    /// Write `pages` (one sorted run, rows already in stored order) in the
    /// background.
    fn spill(&mut self, types: &[DataType], pages: Vec<Page>) -> EngineResult<SpillInProgress>;

    /// Record a finished run; blocks if the writer is still running.
    fn complete(&mut self, in_progress: SpillInProgress) -> EngineResult<()>;

    fn spilled_runs(&self) -> usize;

    /// One page stream per run, in the order the runs were spilled.
    fn read_runs(&self) -> EngineResult<Vec<PageStream>>;

    /// Remove all runs. Idempotent.
    fn discard(&mut self) -> EngineResult<()>;
}

pub trait SpillerFactory: Send + Sync {
    fn create(&self) -> EngineResult<Box<dyn Spiller>>;
}

/// Creates spillers that write runs under a scratch directory, one
/// subdirectory per spiller.
pub struct FileSpillerFactory {
    root: PathBuf,
    next_spiller: AtomicUsize,
}

impl FileSpillerFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_spiller: AtomicUsize::new(0),
        }
    }
}

impl SpillerFactory for FileSpillerFactory {
    fn create(&self) -> EngineResult<Box<dyn Spiller>> {
        let id = self.next_spiller.fetch_add(1, Ordering::Relaxed);
        let dir = self.root.join(format!("spill-{id}"));
        fs::create_dir_all(&dir).map_err(|e| {
            EngineError::spill_io_with_path(
                format!("create spill directory: {e}"),
                dir.to_string_lossy().to_string(),
            )
        })?;
        Ok(Box::new(FileSpiller {
            dir,
            runs: Vec::new(),
            next_run: 0,
        }))
    }
}

pub struct FileSpiller {
    dir: PathBuf,
    runs: Vec<PathBuf>,
    next_run: usize,
}

impl Spiller for FileSpiller {
    fn spill(&mut self, types: &[DataType], pages: Vec<Page>) -> EngineResult<SpillInProgress> {
        let path = self.dir.join(format!("run-{}.spill", self.next_run));
        self.next_run += 1;
        let rows: usize = pages.iter().map(|p| p.position_count()).sum();
        info!(run = %path.display(), rows, "spilling sorted run");

        let done = Arc::new(AtomicBool::new(false));
        let done_flag = done.clone();
        let types = types.to_vec();
        let handle = std::thread::Builder::new()
            .name("window-spill-writer".to_string())
            .spawn(move || {
                let result = format::write_run(&path, &types, &pages).or_else(|first| {
                    warn!(
                        run = %path.display(),
                        error = %first,
                        "spill write failed, retrying once"
                    );
                    let _ = fs::remove_file(&path);
                    format::write_run(&path, &types, &pages)
                });
                done_flag.store(true, Ordering::Release);
                result.map(|_| path)
            })
            .map_err(|e| EngineError::spill_io(format!("spawn spill writer: {e}")))?;
        Ok(SpillInProgress {
            done,
            handle: Some(handle),
        })
    }

    fn complete(&mut self, in_progress: SpillInProgress) -> EngineResult<()> {
        let path = in_progress.wait()?;
        debug!(run = %path.display(), "spill run complete");
        self.runs.push(path);
        Ok(())
    }

    fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    fn read_runs(&self) -> EngineResult<Vec<PageStream>> {
        Ok(self
            .runs
            .iter()
            .map(|path| Box::new(RunPageStream::new(path.clone())) as PageStream)
            .collect())
    }

    fn discard(&mut self) -> EngineResult<()> {
        for path in self.runs.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(run = %path.display(), error = %e, "failed to remove spill run");
            }
        }
        Ok(())
    }
}

impl Drop for FileSpiller {
    fn drop(&mut self) {
        let _ = self.discard();
    }
}

/// Iterator over one run's pages with a single mid-stream retry: on the first
/// read failure the file is reopened, already-consumed pages are skipped, and
/// the read is attempted once more.
struct RunPageStream {
    path: PathBuf,
    reader: Option<EngineResult<RunReader>>,
    /// pages fully handed out; the resume point after a reopen
    consumed: u32,
    retried: bool,
    finished: bool,
}

impl RunPageStream {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            reader: None,
            consumed: 0,
            retried: false,
            finished: false,
        }
    }

    fn open(path: &Path, retried: &mut bool) -> EngineResult<RunReader> {
        match RunReader::open(path) {
            Ok(reader) => Ok(reader),
            Err(first) if !*retried => {
                *retried = true;
                warn!(run = %path.display(), error = %first, "spill open failed, retrying once");
                RunReader::open(path)
            }
            Err(e) => Err(e),
        }
    }

    fn next_page(&mut self) -> EngineResult<Option<Page>> {
        if self.reader.is_none() {
            self.reader = Some(Self::open(&self.path, &mut self.retried));
        }
        let reader = match self.reader.as_mut() {
            Some(Ok(reader)) => reader,
            Some(Err(e)) => return Err(e.clone()),
            None => return Err(EngineError::spill_io("spill reader unavailable")),
        };
        match reader.next_page() {
            Ok(page) => {
                if page.is_some() {
                    self.consumed += 1;
                }
                Ok(page)
            }
            Err(first) => {
                if self.retried {
                    return Err(first);
                }
                self.retried = true;
                warn!(
                    run = %self.path.display(),
                    error = %first,
                    "spill read failed, retrying once"
                );
                let mut reopened = RunReader::open(&self.path)?;
                reopened.skip_pages(self.consumed)?;
                let page = reopened.next_page();
                self.reader = Some(Ok(reopened));
                if let Ok(Some(_)) = &page {
                    self.consumed += 1;
                }
                page
            }
        }
    }
}

impl Iterator for RunPageStream {
    type Item = EngineResult<Page>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_page() {
            Ok(Some(page)) => Some(Ok(page)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array};

    fn page(values: Vec<i64>) -> Page {
        Page::new(vec![Arc::new(Int64Array::from(values)) as ArrayRef]).unwrap()
    }

    #[test]
    fn spill_complete_read_discard() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FileSpillerFactory::new(dir.path());
        let mut spiller = factory.create().unwrap();

        let in_progress = spiller
            .spill(&[DataType::Int64], vec![page(vec![1, 2, 3])])
            .unwrap();
        spiller.complete(in_progress).unwrap();
        assert_eq!(spiller.spilled_runs(), 1);

        let mut streams = spiller.read_runs().unwrap();
        let pages: Vec<Page> = streams
            .remove(0)
            .collect::<EngineResult<Vec<_>>>()
            .unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].position_count(), 3);

        spiller.discard().unwrap();
        assert_eq!(spiller.spilled_runs(), 0);
        // idempotent
        spiller.discard().unwrap();
    }

    #[test]
    fn completion_token_reports_done() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FileSpillerFactory::new(dir.path());
        let mut spiller = factory.create().unwrap();
        let in_progress = spiller.spill(&[DataType::Int64], vec![page(vec![7])]).unwrap();
        // wait() must succeed whether or not the writer already finished
        spiller.complete(in_progress).unwrap();
        assert_eq!(spiller.spilled_runs(), 1);
    }
}
