//! A backtracking regular-expression engine that records a replayable trace.
//!
//! Besides answering "does it match", the matcher logs every step it takes
//! (forward moves, group enters and leaves, alternative choices, loop
//! iterations and every backtrack) so that a consumer can scrub through the
//! match one step at a time.
//!
//! # Architecture
//!
//! ```text
//! pattern ──regex_syntax::ast──> AutomatonBuilder ──> Automaton
//!                                                        │
//!         input ──> Matcher (session protocol) ──> matcher::Run ──> TraceBuilder
//!                                                                       │
//!                             Response::{Batch, Success, NoMatch, ...} <┘
//!                                                │
//!                                           MatchCursor
//! ```
//!
//! * [`automaton`]: the flat instruction array, addressed by a program
//!   counter, with relative transition offsets.
//! * [`compile`]: lowers the `regex-syntax` AST into that array.  The AST is
//!   used instead of the HIR because its spans are what the trace reports.
//! * `matcher`: the backtracking engine.  All of its stacks live in one
//!   struct and are only changed through one function per kind of move.
//! * [`trace`]: filters and compacts raw steps according to [`MatchFlags`]
//!   and cuts them into batches.
//! * [`session`]: the `match` / `next_batch` / `abort` protocol.
//! * [`worker`]: runs a session on its own thread behind channels.
//! * [`cursor`]: read-side navigation over a finished or growing trace.
//!
//! # Example
//!
//! ```
//! use regex_trace::{Matcher, MatchFlags, ResponseData};
//!
//! let automaton = regex_trace::compile(r"b(ab)+r").unwrap();
//! let mut matcher = Matcher::new(automaton.into(), MatchFlags::default());
//! let response = matcher.match_string("xbababr", None);
//! match response.data {
//!     ResponseData::Success(data) => assert_eq!((data.start, data.end), (Some(1), Some(7))),
//!     other => panic!("unexpected response {:?}", other),
//! }
//! ```

use std::fmt;

pub mod automaton;
pub mod compile;
pub mod cursor;
pub mod flags;
mod matcher;
pub mod session;
pub mod trace;
pub mod worker;

pub use automaton::{Automaton, ElementType, Span};
pub use compile::{AutomatonBuilder, compile};
pub use cursor::MatchCursor;
pub use flags::{Flag, MatchFlags, MatchOptions};
pub use session::{AbortHandle, MatchError, Matcher, Response, ResponseData, SessionId};
pub use trace::{BatchData, Groups, MatchAction, MatchData, MatchGroup, MatchState, TraceBuilder};
pub use worker::{MatchWorker, WorkerError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// An error returned when a pattern cannot be turned into an automaton.
#[derive(Debug)]
pub enum Error {
    /// The pattern is not valid regex syntax.
    Parse(regex_syntax::ast::Error),
    /// Unicode property classes, ASCII classes and class set operations
    /// (`&&`, `--`, `~~`) are not supported.
    UnsupportedClass(Span),
    /// A look-around assertion other than `^`, `$`, `\A` or `\z`.
    UnsupportedAssertion(Span),
    /// Inline flags such as `(?i)` or `(?s:...)`.
    UnsupportedFlags(Span),
    /// The automaton would not be addressable with 32-bit indices.
    TooLarge,
    /// An automaton violates a structural invariant.
    Malformed(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "failed to parse pattern: {}", err),
            Self::UnsupportedClass(span) => {
                write!(f, "unsupported character class at {}", span)
            }
            Self::UnsupportedAssertion(span) => {
                write!(f, "unsupported look-around assertion at {}", span)
            }
            Self::UnsupportedFlags(span) => write!(f, "unsupported inline flags at {}", span),
            Self::TooLarge => write!(f, "pattern compiles to too many nodes"),
            Self::Malformed(reason) => write!(f, "malformed automaton: {}", reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}
