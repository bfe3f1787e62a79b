//! The match protocol: start a session, pull batches, abort.
//!
//! A [`Matcher`] owns one compiled automaton and at most one live session.
//! Submitting a new string starts a new session and silently drops the
//! previous one; continuation requests naming a dropped session get `None`.
//!
//! With a batch size every response but the last is a
//! [`ResponseData::Batch`]; the terminal response then carries only the
//! match header (`states` is empty and `statesCount` is the total).  Without
//! a batch size the first response is terminal and holds the whole trace.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::automaton::Automaton;
use crate::flags::MatchFlags;
use crate::matcher::{Outcome, Run, Yield};
use crate::trace::{BatchData, MatchData};

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Identifies one submitted string.  Ids start at 1 and only grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Requests cancellation of a session from any thread.
///
/// The handle stores the id of the session to cancel; the engine polls it
/// once per node visit.  Since ids are never reused, aborting a session that
/// has already ended cannot affect a later one.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle(Arc<AtomicU64>);

impl AbortHandle {
    pub fn abort(&self, session: SessionId) {
        self.0.store(session.0, Ordering::SeqCst);
    }

    pub(crate) fn is_requested(&self, session: SessionId) -> bool {
        self.0.load(Ordering::Relaxed) == session.0
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The automaton and the matcher's bookkeeping disagree.  Only reachable
/// with an automaton that was not produced by the compiler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchError {
    /// A transition led outside the automaton.
    UndefinedPosition { pc: isize },
    /// An ITERATION_END was reached with no repetition in progress.
    MissingIteration { pc: usize },
    /// A GROUP_END was reached (or undone) with no matching GROUP.
    MissingGroup { pc: usize },
}

impl fmt::Display for MatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedPosition { pc } => write!(f, "no node at position {}", pc),
            Self::MissingIteration { pc } => {
                write!(f, "iteration end at {} without an active iteration", pc)
            }
            Self::MissingGroup { pc } => write!(f, "group bookkeeping missing at {}", pc),
        }
    }
}

impl std::error::Error for MatchError {}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseData {
    Success(MatchData),
    NoMatch(MatchData),
    Error(MatchError),
    Aborted,
    Batch(BatchData),
}

impl ResponseData {
    /// Whether the session ended with this response.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Batch(_))
    }

    /// The match header of a SUCCESS or NO_MATCH response.
    pub fn match_data(&self) -> Option<&MatchData> {
        match self {
            Self::Success(data) | Self::NoMatch(data) => Some(data),
            _ => None,
        }
    }
}

/// A reply to [`Matcher::match_string`] or [`Matcher::next_batch`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub session: SessionId,
    #[serde(flatten)]
    pub data: ResponseData,
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Live {
    id: SessionId,
    run: Run,
    /// Set once the engine finished but the final batch went out first.
    finished: Option<Outcome>,
}

impl Live {
    /// Produce the next response.  Returns `true` along with it when the
    /// session is over.
    fn step(&mut self, automaton: &Automaton, abort: &AbortHandle) -> (ResponseData, bool) {
        if abort.is_requested(self.id) {
            return (ResponseData::Aborted, true);
        }
        if let Some(outcome) = self.finished {
            return (self.terminal(outcome), true);
        }
        match self.run.resume(automaton, abort, self.id) {
            Ok(Yield::Batch(batch)) => (ResponseData::Batch(batch), false),
            Ok(Yield::Aborted) => (ResponseData::Aborted, true),
            Ok(Yield::Done(outcome)) if self.run.trace().is_batched() => {
                self.finished = Some(outcome);
                (ResponseData::Batch(self.run.trace_mut().final_batch()), false)
            }
            Ok(Yield::Done(outcome)) => (self.terminal(outcome), true),
            Err(err) => (ResponseData::Error(err), true),
        }
    }

    fn terminal(&mut self, outcome: Outcome) -> ResponseData {
        let data = self.run.trace_mut().finalize();
        match outcome {
            Outcome::Success => ResponseData::Success(data),
            Outcome::NoMatch => ResponseData::NoMatch(data),
        }
    }
}

/// Runs sessions against one automaton.
#[derive(Debug)]
pub struct Matcher {
    automaton: Arc<Automaton>,
    flags: MatchFlags,
    abort: AbortHandle,
    last_session: u64,
    live: Option<Live>,
}

impl Matcher {
    pub fn new(automaton: Arc<Automaton>, flags: MatchFlags) -> Self {
        Self {
            automaton,
            flags,
            abort: AbortHandle::default(),
            last_session: 0,
            live: None,
        }
    }

    pub fn automaton(&self) -> &Arc<Automaton> {
        &self.automaton
    }

    /// Replace the automaton.  The live session, if any, is dropped.
    pub fn set_automaton(&mut self, automaton: Arc<Automaton>) {
        self.automaton = automaton;
        self.live = None;
    }

    pub fn flags(&self) -> MatchFlags {
        self.flags
    }

    /// New flags take effect from the next session on.
    pub fn change_flags(&mut self, flags: MatchFlags) {
        self.flags = flags;
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self, session: SessionId) {
        self.abort.abort(session);
    }

    pub fn live_session(&self) -> Option<SessionId> {
        self.live.as_ref().map(|live| live.id)
    }

    /// Start a session without running it.  Drive it with
    /// [`next_batch`](Self::next_batch).
    pub fn begin(&mut self, input: &str, batch_size: Option<NonZeroUsize>) -> SessionId {
        self.last_session += 1;
        let id = SessionId::new(self.last_session);
        self.live = Some(Live {
            id,
            run: Run::new(input, self.flags, batch_size),
            finished: None,
        });
        id
    }

    /// Start a session and run it up to its first response.
    pub fn match_string(&mut self, input: &str, batch_size: Option<NonZeroUsize>) -> Response {
        let id = self.begin(input, batch_size);
        let data = self.drive().unwrap_or(ResponseData::Aborted);
        Response { session: id, data }
    }

    /// Continue `session`.  Returns `None` when `session` is not the live
    /// session: it ended, was aborted, or was superseded by a newer string.
    pub fn next_batch(&mut self, session: SessionId) -> Option<Response> {
        if self.live_session() != Some(session) {
            return None;
        }
        let data = self.drive()?;
        Some(Response { session, data })
    }

    fn drive(&mut self) -> Option<ResponseData> {
        let live = self.live.as_mut()?;
        let (data, done) = live.step(&self.automaton, &self.abort);
        if done {
            self.live = None;
        }
        Some(data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
