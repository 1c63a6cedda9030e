/// Operator contract between the driver and an operator
///
/// The driver runs a single-threaded cooperative loop: push a page when the
/// operator wants one, pull a page when one is ready, and mediate the
/// memory-revocation handshake. Suspension is modeled as explicit state
/// returns; an operator never blocks the driver thread.
use crate::error::EngineResult;
use crate::page::Page;
use crate::spill::SpillInProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    /// Accepting input pages.
    NeedsInput,
    /// Holding produced output the driver has not drained yet.
    HasOutput,
    /// `finish()` seen; draining remaining output.
    Finishing,
    /// All output drained, resources released.
    Finished,
}

pub trait Operator {
    fn state(&self) -> OperatorState;

    /// True only while the operator can accept a page right now.
    fn needs_input(&self) -> bool;

    /// Precondition: `needs_input()`. Violations surface as
    /// `InvariantViolation`.
    fn add_input(&mut self, page: Page) -> EngineResult<()>;

    /// No further `add_input` is permitted after this.
    fn finish(&mut self) -> EngineResult<()>;

    fn is_finished(&self) -> bool;

    /// Next output page, or `None` when no page is ready right now.
    fn get_output(&mut self) -> EngineResult<Option<Page>>;

    /// Pending asynchronous spill, if any; the driver reschedules until the
    /// completion reports done.
    fn is_blocked(&self) -> Option<&SpillInProgress>;

    /// Cooperative revocation handshake: hand revocable state to the
    /// spiller...
    fn start_memory_revoke(&mut self) -> EngineResult<()>;

    /// ...and release the revoked memory once the spill completed.
    fn finish_memory_revoke(&mut self) -> EngineResult<()>;

    /// Release all resources. Idempotent; legal in any state.
    fn close(&mut self) -> EngineResult<()>;
}
