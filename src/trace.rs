//! Trace data and the builder that assembles it.
//!
//! The matcher reports every step to a [`TraceBuilder`], which applies the
//! [`MatchFlags`] transformations and cuts the retained steps into batches.
//!
//! The most recently retained step stays *pending*: it is the only step any
//! later transformation may rewrite or drop, and it is never handed out in a
//! batch until the trace is flushed.  Emitted batches are therefore final,
//! and concatenating them reproduces the unbatched trace exactly.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::automaton::ElementType;
use crate::flags::MatchFlags;

/// Tags on steps that are not plain forward moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchAction {
    Backtracking,
    /// The search start advanced by one character.
    ForwardStart,
    /// Informational only, no transition was taken.
    Showcase,
}

/// One captured group as visible at some point of the match.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Span of the group in the pattern.
    #[serde(rename = "regAt")]
    pub reg_at: [usize; 2],
    /// Captured span of the input.
    #[serde(rename = "strAt")]
    pub str_at: [usize; 2],
}

/// Visible captures keyed by capture index.
pub type Groups = BTreeMap<u32, MatchGroup>;

/// One step of the trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchState {
    #[serde(rename = "type")]
    pub ty: ElementType,
    pub reg_at: [usize; 2],
    pub str_at: [usize; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<MatchAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_exact: Option<[usize; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Groups>,
}

impl MatchState {
    pub fn new(ty: ElementType, reg_at: [usize; 2], str_at: [usize; 2]) -> Self {
        Self {
            ty,
            reg_at,
            str_at,
            action: None,
            from_exact: None,
            groups: None,
        }
    }

    pub fn with_action(mut self, action: MatchAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn is_backtracking(&self) -> bool {
        self.action == Some(MatchAction::Backtracking)
    }

    /// Whether `other` would tell a viewer nothing new after `self`.
    fn same_effect(&self, other: &MatchState) -> bool {
        self.reg_at == other.reg_at
            && self.str_at == other.str_at
            && self.from_exact == other.from_exact
            && self.action == other.action
    }
}

/// The assembled trace plus the overall result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchData {
    /// Retained steps.  Empty when the trace was delivered in batches.
    pub states: Vec<MatchState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Groups>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    /// Total number of retained steps, including those sent in batches.
    pub states_count: usize,
    pub success: bool,
}

/// A contiguous window of the trace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchData {
    /// Number of steps in this window.
    pub batch_size: usize,
    /// Steps retained so far in the whole run.
    pub match_current_size: usize,
    /// `[from, to)` indices of this window in the whole trace.
    pub batch_span: [usize; 2],
    pub match_states: Vec<MatchState>,
}

/// Accumulates steps into a [`MatchData`], applying the flag-controlled
/// filtering and compaction.
#[derive(Debug)]
pub struct TraceBuilder {
    flags: MatchFlags,
    batch_size: Option<NonZeroUsize>,
    /// Steps not handed out yet; the last one is the pending step.
    states: Vec<MatchState>,
    /// Number of steps already handed out in batches.
    emitted: usize,
    data: MatchData,
}

impl TraceBuilder {
    pub fn new(flags: MatchFlags, batch_size: Option<NonZeroUsize>) -> Self {
        Self {
            flags,
            batch_size,
            states: Vec::new(),
            emitted: 0,
            data: MatchData::default(),
        }
    }

    pub fn flags(&self) -> MatchFlags {
        self.flags
    }

    pub fn is_batched(&self) -> bool {
        self.batch_size.is_some()
    }

    /// Steps retained over the whole run.
    pub fn states_count(&self) -> usize {
        self.emitted + self.states.len()
    }

    /// The header of the trace being built.
    pub fn data(&self) -> &MatchData {
        &self.data
    }

    pub fn set_start(&mut self, start: Option<usize>) {
        self.data.start = start;
    }

    pub fn set_end(&mut self, end: Option<usize>) {
        self.data.end = end;
    }

    pub fn set_success(&mut self, success: bool) {
        self.data.success = success;
    }

    /// Process an incoming step.
    pub fn add_state(&mut self, mut state: MatchState) {
        let flags = self.flags;

        // A backtrack that lands further left than the pending backtrack
        // replaces it: only the furthest unexplored decision is kept.
        let mut replaced = None;
        if flags.shorten_backtracking && state.is_backtracking() {
            if flags.backtracked_from_exact {
                state.from_exact = Some(state.reg_at);
            }
            if let Some(top) = self.states.last()
                && top.is_backtracking()
                && top.reg_at[0] > state.reg_at[0]
            {
                state.from_exact = top.from_exact;
                replaced = self.states.pop();
            }
        }

        if replaced.is_none()
            && flags.backtrack_trim_position
            && let Some(top) = self.states.last_mut()
            && top.is_backtracking()
        {
            top.reg_at[1] = top.reg_at[0];
        }

        if flags.remove_states_wo_effect
            && replaced
                .as_ref()
                .or(self.states.last())
                .is_some_and(|previous| previous.same_effect(&state))
        {
            return;
        }

        self.states.push(state);
    }

    /// Record the captures visible after the latest step.
    pub fn new_groups(&mut self, groups: Groups) {
        if groups.is_empty() {
            self.data.groups = None;
            return;
        }
        if self.flags.add_groups_to_states
            && let Some(top) = self.states.last_mut()
        {
            top.groups = Some(groups.clone());
        }
        self.data.groups = Some(groups);
    }

    /// Point the pending step (a backtrack into an alternation) at the
    /// alternation itself.
    pub fn update_option(&mut self, option_start: usize) {
        let no_error_return = self.flags.option_no_error_return;
        if let Some(top) = self.states.last_mut() {
            top.reg_at = match top.from_exact {
                Some(exact) if no_error_return => exact,
                _ => [option_start, option_start],
            };
        }
    }

    /// Steps that can no longer change: everything but the pending one.
    fn sealed(&self) -> usize {
        self.states.len().saturating_sub(1)
    }

    pub fn is_batch_ready(&self) -> bool {
        self.batch_size
            .is_some_and(|size| self.sealed() >= size.get())
    }

    /// Hand out every sealed step since the previous batch.
    pub fn batch(&mut self) -> BatchData {
        let count = self.sealed();
        self.take_batch(count)
    }

    /// Flush everything, pending step included.
    pub fn final_batch(&mut self) -> BatchData {
        let count = self.states.len();
        self.take_batch(count)
    }

    fn take_batch(&mut self, count: usize) -> BatchData {
        let from = self.emitted;
        let match_states: Vec<MatchState> = self.states.drain(..count).collect();
        self.emitted += match_states.len();
        BatchData {
            batch_size: match_states.len(),
            match_current_size: self.states_count(),
            batch_span: [from, self.emitted],
            match_states,
        }
    }

    /// Hand the assembled trace to the caller.  Steps already delivered in
    /// batches are not repeated.
    pub fn finalize(&mut self) -> MatchData {
        let mut data = std::mem::take(&mut self.data);
        data.states_count = self.states_count();
        data.states = if self.is_batched() {
            self.emitted += self.states.len();
            self.states.clear();
            Vec::new()
        } else {
            std::mem::take(&mut self.states)
        };
        data
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
