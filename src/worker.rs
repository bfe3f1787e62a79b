//! A [`Matcher`] running on its own thread.
//!
//! The worker owns the matcher; callers talk to it with request messages and
//! wait for the reply on a second channel.  Requests are served strictly in
//! order.  Cancellation bypasses the queue: [`MatchWorker::abort`] flips the
//! shared [`AbortHandle`], which the engine polls while it runs.

use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::automaton::Automaton;
use crate::flags::MatchFlags;
use crate::session::{AbortHandle, Matcher, Response, SessionId};

#[derive(Debug)]
enum Request {
    Load(Arc<Automaton>),
    Begin {
        input: String,
        batch_size: Option<NonZeroUsize>,
    },
    Match {
        input: String,
        batch_size: Option<NonZeroUsize>,
    },
    NextBatch(SessionId),
    ChangeFlags(MatchFlags),
}

#[derive(Debug)]
enum Reply {
    Done,
    Session(SessionId),
    Response(Option<Response>),
}

/// The worker thread is gone, or answered out of protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerError {
    Disconnected,
    UnexpectedReply,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "match worker has stopped"),
            Self::UnexpectedReply => write!(f, "match worker sent an unexpected reply"),
        }
    }
}

impl std::error::Error for WorkerError {}

fn serve(mut matcher: Matcher, requests: Receiver<Request>, replies: Sender<Reply>) {
    for request in requests {
        let reply = match request {
            Request::Load(automaton) => {
                matcher.set_automaton(automaton);
                Reply::Done
            }
            Request::Begin { input, batch_size } => {
                Reply::Session(matcher.begin(&input, batch_size))
            }
            Request::Match { input, batch_size } => {
                Reply::Response(Some(matcher.match_string(&input, batch_size)))
            }
            Request::NextBatch(session) => Reply::Response(matcher.next_batch(session)),
            Request::ChangeFlags(flags) => {
                matcher.change_flags(flags);
                Reply::Done
            }
        };
        if replies.send(reply).is_err() {
            break;
        }
    }
}

/// Handle to a matcher thread.  Dropping it stops the thread.
#[derive(Debug)]
pub struct MatchWorker {
    requests: Option<Sender<Request>>,
    replies: Receiver<Reply>,
    abort: AbortHandle,
    thread: Option<JoinHandle<()>>,
}

impl MatchWorker {
    pub fn spawn(automaton: Arc<Automaton>, flags: MatchFlags) -> io::Result<Self> {
        let matcher = Matcher::new(automaton, flags);
        let abort = matcher.abort_handle();
        let (request_tx, request_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("regex-trace-worker".to_string())
            .spawn(move || serve(matcher, request_rx, reply_tx))?;
        Ok(Self {
            requests: Some(request_tx),
            replies: reply_rx,
            abort,
            thread: Some(thread),
        })
    }

    fn call(&self, request: Request) -> Result<Reply, WorkerError> {
        let requests = self.requests.as_ref().ok_or(WorkerError::Disconnected)?;
        requests
            .send(request)
            .map_err(|_| WorkerError::Disconnected)?;
        self.replies.recv().map_err(|_| WorkerError::Disconnected)
    }

    /// Replace the automaton; the live session is dropped.
    pub fn load(&self, automaton: Arc<Automaton>) -> Result<(), WorkerError> {
        match self.call(Request::Load(automaton))? {
            Reply::Done => Ok(()),
            _ => Err(WorkerError::UnexpectedReply),
        }
    }

    pub fn change_flags(&self, flags: MatchFlags) -> Result<(), WorkerError> {
        match self.call(Request::ChangeFlags(flags))? {
            Reply::Done => Ok(()),
            _ => Err(WorkerError::UnexpectedReply),
        }
    }

    /// Start a session without running it, so that its id is known before
    /// the first (possibly long) call to [`next_batch`](Self::next_batch).
    pub fn begin(&self, input: &str, batch_size: Option<NonZeroUsize>) -> Result<SessionId, WorkerError> {
        let request = Request::Begin {
            input: input.to_string(),
            batch_size,
        };
        match self.call(request)? {
            Reply::Session(session) => Ok(session),
            _ => Err(WorkerError::UnexpectedReply),
        }
    }

    pub fn match_string(&self, input: &str, batch_size: Option<NonZeroUsize>) -> Result<Response, WorkerError> {
        let request = Request::Match {
            input: input.to_string(),
            batch_size,
        };
        match self.call(request)? {
            Reply::Response(Some(response)) => Ok(response),
            _ => Err(WorkerError::UnexpectedReply),
        }
    }

    pub fn next_batch(&self, session: SessionId) -> Result<Option<Response>, WorkerError> {
        match self.call(Request::NextBatch(session))? {
            Reply::Response(response) => Ok(response),
            _ => Err(WorkerError::UnexpectedReply),
        }
    }

    /// Cancel `session`.  Takes effect at the worker's next node visit, even
    /// in the middle of a request.
    pub fn abort(&self, session: SessionId) {
        self.abort.abort(session);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

impl Drop for MatchWorker {
    fn drop(&mut self) {
        // Closing the request channel ends the serve loop.
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
