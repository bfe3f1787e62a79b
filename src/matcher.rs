//! The backtracking engine.
//!
//! A match runs over an [`Automaton`] with a program counter `pc` and an
//! input position `pos`.  Every node the search passes through leaves a
//! [`Frame`] on the active stack recording which of its transitions is being
//! tried; backtracking pops the failed frame and resumes the one below it
//! with its next alternative.
//!
//! Besides the active stack the engine keeps three pieces of bookkeeping,
//! all owned by [`MatcherState`] and only changed by the forward and
//! backward move handlers below:
//!
//! * iteration records, one per repetition currently being executed plus a
//!   history of finished ones so that a backtrack into a repetition can
//!   restore its pass count, and the start positions of the passes left
//!   behind by loop edges;
//! * open groups and a history of closed ones;
//! * per-group capture stacks, where a repetition of an outer group hides
//!   the captures its nested groups made in the previous pass.

use std::num::NonZeroUsize;

use indexmap::IndexMap;

use crate::automaton::{
    Automaton, Element, ElementKind, ElementType, GroupInfo, Node, NodeKind, Repeat, RepeatKind,
    Span, Transition,
};
use crate::flags::MatchFlags;
use crate::session::{AbortHandle, MatchError, SessionId};
use crate::trace::{BatchData, Groups, MatchAction, MatchGroup, MatchState, TraceBuilder};

// ---------------------------------------------------------------------------
// Matcher state
// ---------------------------------------------------------------------------

/// A node on the active path and the transition currently taken from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Frame {
    pc: usize,
    pos: usize,
    transition: usize,
}

/// Progress of one execution of a repetition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct IterationRecord {
    /// Program counter of the repetition's entry node.
    entry: usize,
    repeat: Repeat,
    /// Completed passes.
    count: u32,
    /// Input position at the start of the current pass.
    last_pos: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct GroupRecord {
    pc: usize,
    start: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Capture {
    Span(usize, usize),
    /// Hides the capture below it: an enclosing group started a new pass.
    Invalidated,
}

/// All mutable state of a running match.
#[derive(Debug, Default)]
pub(crate) struct MatcherState {
    frames: Vec<Frame>,
    pc: usize,
    pos: usize,
    iterations: Vec<IterationRecord>,
    iteration_history: Vec<IterationRecord>,
    /// `last_pos` of the record before each loop edge on the active path.
    pass_starts: Vec<usize>,
    groups: Vec<GroupRecord>,
    group_history: Vec<GroupRecord>,
    /// Capture stacks keyed by the program counter of the GROUP node.
    captures: IndexMap<usize, Vec<Capture>>,
}

impl MatcherState {
    /// Register a visit of the node under the cursor.  Returns the index of
    /// the transition to try.
    fn visit(&mut self) -> usize {
        match self.frames.last_mut() {
            Some(frame) if frame.pc == self.pc => {
                frame.transition += 1;
                frame.transition
            }
            _ => {
                self.frames.push(Frame {
                    pc: self.pc,
                    pos: self.pos,
                    transition: 0,
                });
                0
            }
        }
    }

    fn advance(&mut self, pc: usize, pos: usize) {
        self.pc = pc;
        self.pos = pos;
    }

    fn set_transition(&mut self, index: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.transition = index;
        }
    }

    fn check_invariants(&self) {
        debug_assert!(
            self.frames
                .last()
                .is_some_and(|top| top.pc == self.pc && top.pos == self.pos),
            "cursor out of sync with the active stack"
        );
        debug_assert!(
            self.frames.len() < 2
                || self.frames[self.frames.len() - 2].pos <= self.pos,
            "active path moved backwards through the input"
        );
        debug_assert!(self.iterations.len() <= self.frames.len());
        debug_assert!(self.pass_starts.len() <= self.frames.len());
        debug_assert!(self.groups.len() <= self.frames.len());
    }

    fn enter_iteration(&mut self, repeat: Repeat, transition: Transition) -> Step {
        let record = IterationRecord {
            entry: self.pc,
            repeat,
            count: 0,
            last_pos: self.pos,
        };
        if transition.offset == 1 {
            if repeat.max == Some(0) {
                return Step::Retry;
            }
            self.iterations.push(record);
        } else if repeat.kind == RepeatKind::Range && repeat.min > 0 {
            return Step::Retry;
        } else {
            self.iteration_history.push(record);
        }
        Step::Take(transition)
    }

    fn end_iteration(
        &mut self,
        node: &Node,
        tried: usize,
        transition: Transition,
    ) -> Result<Step, MatchError> {
        let pc = self.pc;
        let pos = self.pos;
        let record = self
            .iterations
            .last_mut()
            .ok_or(MatchError::MissingIteration { pc })?;

        // A pass that consumed nothing must not loop again.  It could be
        // repeated any number of times, so it also satisfies the minimum.
        let mut transition = transition;
        let forced = record.last_pos == pos;
        if forced {
            let exit = node
                .transitions()
                .iter()
                .enumerate()
                .skip(tried)
                .find(|(_, t)| t.offset > 0);
            let Some((index, &exit)) = exit else {
                return Ok(Step::Exhausted);
            };
            if index != tried {
                self.set_transition(index);
            }
            transition = exit;
        }

        let record = self
            .iterations
            .last_mut()
            .ok_or(MatchError::MissingIteration { pc })?;
        if transition.offset < 0 {
            if record.repeat.max.is_some_and(|max| record.count + 1 >= max) {
                return Ok(Step::Retry);
            }
            record.count += 1;
            self.pass_starts.push(record.last_pos);
            record.last_pos = pos;
        } else {
            if record.repeat.kind == RepeatKind::Range
                && !forced
                && !record.repeat.accepts(record.count + 1)
            {
                return Ok(Step::Retry);
            }
            record.count += 1;
            let done = *record;
            self.iterations.pop();
            self.iteration_history.push(done);
        }
        Ok(Step::Take(transition))
    }

    fn open_group(&mut self, automaton: &Automaton, info: &GroupInfo) {
        let pc = self.pc;
        let end = pc.saturating_add(info.end_offset);
        self.groups.push(GroupRecord {
            pc,
            start: self.pos,
        });
        for (&other, stack) in self.captures.iter_mut() {
            if other > pc && other < end && !stack.is_empty() && is_capturing(automaton, other) {
                stack.push(Capture::Invalidated);
            }
        }
    }

    fn close_group(&mut self) -> Result<(), MatchError> {
        let record = self
            .groups
            .pop()
            .ok_or(MatchError::MissingGroup { pc: self.pc })?;
        self.group_history.push(record);
        self.captures
            .entry(record.pc)
            .or_default()
            .push(Capture::Span(record.start, self.pos));
        Ok(())
    }

    /// Undo [`open_group`](Self::open_group) for the GROUP node at `pc`.
    fn unopen_group(&mut self, pc: usize, info: &GroupInfo) -> Result<(), MatchError> {
        self.groups.pop().ok_or(MatchError::MissingGroup { pc })?;
        let end = pc.saturating_add(info.end_offset);
        for (&other, stack) in self.captures.iter_mut() {
            if other > pc && other < end && stack.last() == Some(&Capture::Invalidated) {
                stack.pop();
            }
        }
        Ok(())
    }

    /// Undo [`close_group`](Self::close_group) for the GROUP_END node at `pc`.
    fn unclose_group(&mut self, pc: usize) -> Result<(), MatchError> {
        let record = self
            .group_history
            .pop()
            .ok_or(MatchError::MissingGroup { pc })?;
        if let Some(stack) = self.captures.get_mut(&record.pc) {
            stack.pop();
        }
        self.groups.push(record);
        Ok(())
    }

    /// Restore iteration records when the search backs into the repetition
    /// node at `landing`.  `above` is the node the search had moved to from
    /// there.
    fn land(&mut self, kind: &ElementKind, landing: usize, above: usize) -> Result<(), MatchError> {
        match kind {
            ElementKind::IterationEnd => {
                let looped = above < landing;
                if !looped {
                    let record = self
                        .iteration_history
                        .pop()
                        .ok_or(MatchError::MissingIteration { pc: landing })?;
                    self.iterations.push(record);
                }
                let record = self
                    .iterations
                    .last_mut()
                    .ok_or(MatchError::MissingIteration { pc: landing })?;
                debug_assert!(record.count > 0, "iteration count underflow");
                record.count = record.count.saturating_sub(1);
                if looped {
                    record.last_pos = self
                        .pass_starts
                        .pop()
                        .ok_or(MatchError::MissingIteration { pc: landing })?;
                }
            }
            ElementKind::Iteration(_) => {
                let stack = if above.saturating_sub(landing) > 1 {
                    &mut self.iteration_history
                } else {
                    &mut self.iterations
                };
                let record = stack
                    .pop()
                    .ok_or(MatchError::MissingIteration { pc: landing })?;
                debug_assert_eq!(record.entry, landing);
            }
            _ => {}
        }
        Ok(())
    }

    /// Captures whose GROUP_END the cursor has passed, keyed by capture
    /// index.
    fn visible_groups(&self, automaton: &Automaton) -> Groups {
        let mut groups = Groups::new();
        for (&pc, stack) in &self.captures {
            let Some(&Capture::Span(start, end)) = stack.last() else {
                continue;
            };
            let Some(element) = automaton.node(pc).and_then(|node| automaton.element(node)) else {
                continue;
            };
            if let ElementKind::Group(info) = &element.kind
                && let Some(index) = info.index
                && pc.saturating_add(info.end_offset) < self.pc
            {
                groups.insert(
                    index,
                    MatchGroup {
                        name: info.name.clone(),
                        reg_at: element.span.pair(),
                        str_at: [start, end],
                    },
                );
            }
        }
        groups
    }
}

fn is_capturing(automaton: &Automaton, pc: usize) -> bool {
    automaton
        .node(pc)
        .and_then(|node| automaton.element(node))
        .is_some_and(|element| matches!(&element.kind, ElementKind::Group(info) if info.index.is_some()))
}

fn target(pc: usize, offset: isize) -> Result<usize, MatchError> {
    pc.checked_add_signed(offset)
        .ok_or(MatchError::UndefinedPosition {
            pc: (pc as isize).saturating_add(offset),
        })
}

/// What a node handler decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    /// Follow this transition.
    Take(Transition),
    /// Stay on the node; its next transition is tried on the next visit.
    Retry,
    /// The node has nothing left to try.
    Exhausted,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    NoMatch,
}

/// Why [`Run::resume`] returned.
#[derive(Debug)]
pub(crate) enum Yield {
    Batch(BatchData),
    Done(Outcome),
    Aborted,
}

/// One match of one input string, resumable between batches.
#[derive(Debug)]
pub(crate) struct Run {
    input: Box<[char]>,
    /// Current search-start position.
    start: usize,
    state: MatcherState,
    trace: TraceBuilder,
}

impl Run {
    pub(crate) fn new(input: &str, flags: MatchFlags, batch_size: Option<NonZeroUsize>) -> Self {
        let mut trace = TraceBuilder::new(flags, batch_size);
        trace.set_start(Some(0));
        trace.add_state(MatchState::new(ElementType::Root, [0, 0], [0, 0]));
        Self {
            input: input.chars().collect(),
            start: 0,
            state: MatcherState::default(),
            trace,
        }
    }

    pub(crate) fn trace(&self) -> &TraceBuilder {
        &self.trace
    }

    pub(crate) fn trace_mut(&mut self) -> &mut TraceBuilder {
        &mut self.trace
    }

    /// Execute until the match ends, a batch fills up or `session` is
    /// aborted.
    pub(crate) fn resume(
        &mut self,
        automaton: &Automaton,
        abort: &AbortHandle,
        session: SessionId,
    ) -> Result<Yield, MatchError> {
        loop {
            if abort.is_requested(session) {
                return Ok(Yield::Aborted);
            }
            let pc = self.state.pc;
            let node = automaton.node(pc).ok_or(MatchError::UndefinedPosition {
                pc: pc as isize,
            })?;
            if node.kind == NodeKind::End {
                return Ok(Yield::Done(self.succeed(automaton)));
            }
            if self.trace.is_batch_ready() {
                return Ok(Yield::Batch(self.trace.batch()));
            }

            let tried = self.state.visit();
            if cfg!(debug_assertions) {
                self.state.check_invariants();
            }
            if let Some(outcome) = self.execute(automaton, node, tried)? {
                return Ok(Yield::Done(outcome));
            }
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.state.pos).copied()
    }

    fn execute(
        &mut self,
        automaton: &Automaton,
        node: &Node,
        tried: usize,
    ) -> Result<Option<Outcome>, MatchError> {
        match node.kind {
            NodeKind::Set(class) => {
                if tried == 0 && self.current().is_some_and(|c| automaton.class(class).contains(c)) {
                    self.consume(automaton, node, 1)?;
                    return Ok(None);
                }
                return self.backtrack(automaton);
            }
            NodeKind::AssertStart if self.state.pos != 0 => return self.backtrack(automaton),
            NodeKind::AssertEnd if self.state.pos != self.input.len() => {
                return self.backtrack(automaton);
            }
            _ => {}
        }

        let Some(&transition) = node.transitions().get(tried) else {
            return self.backtrack(automaton);
        };
        match transition.on {
            None => self.epsilon(automaton, node, tried, transition),
            Some(c) => {
                if self.current() == Some(c) {
                    self.consume(automaton, node, transition.offset)?;
                }
                Ok(None)
            }
        }
    }

    fn consume(&mut self, automaton: &Automaton, node: &Node, offset: isize) -> Result<(), MatchError> {
        let pc = target(self.state.pc, offset)?;
        self.state.advance(pc, self.state.pos + 1);
        if let Some(element) = automaton.element(node) {
            let step = MatchState::new(element.ty(), element.span.pair(), [self.start, self.state.pos]);
            self.record(automaton, step);
        }
        Ok(())
    }

    fn epsilon(
        &mut self,
        automaton: &Automaton,
        node: &Node,
        tried: usize,
        transition: Transition,
    ) -> Result<Option<Outcome>, MatchError> {
        let element = automaton.element(node);
        let step = match element.map(|element| &element.kind) {
            Some(ElementKind::Iteration(repeat)) => self.state.enter_iteration(*repeat, transition),
            Some(ElementKind::IterationEnd) => self.state.end_iteration(node, tried, transition)?,
            Some(ElementKind::Group(info)) => {
                self.state.open_group(automaton, info);
                Step::Take(transition)
            }
            Some(ElementKind::GroupEnd) => {
                self.state.close_group()?;
                Step::Take(transition)
            }
            Some(ElementKind::Option { branches }) => {
                if let Some(element) = element {
                    self.enter_option(automaton, element.span, branches, tried);
                }
                Step::Take(transition)
            }
            _ => Step::Take(transition),
        };
        let transition = match step {
            Step::Take(transition) => transition,
            Step::Retry => return Ok(None),
            Step::Exhausted => return self.backtrack(automaton),
        };

        let pc = target(self.state.pc, transition.offset)?;
        self.state.advance(pc, self.state.pos);
        if let Some(element) = element
            && self.is_observable(element.ty())
        {
            let step = MatchState::new(element.ty(), element.span.pair(), [self.start, self.state.pos]);
            self.record(automaton, step);
        }
        Ok(None)
    }

    /// Epsilon moves that show up in the trace.
    fn is_observable(&self, ty: ElementType) -> bool {
        let flags = self.trace.flags();
        match ty {
            ElementType::OptionEnd => !flags.ignore_option_leaves,
            ElementType::Group => !flags.ignore_group_enters,
            ElementType::GroupEnd => !flags.ignore_group_leaves,
            _ => false,
        }
    }

    fn enter_option(&mut self, automaton: &Automaton, span: Span, branches: &[Span], tried: usize) {
        let flags = self.trace.flags();
        if flags.ignore_option_enters {
            return;
        }
        let str_at = [self.start, self.state.pos];
        if flags.option_show_first_enter && tried == 0 {
            self.record(automaton, MatchState::new(ElementType::Option, span.pair(), str_at));
        }
        if flags.option_enters_show_active
            && let Some(branch) = branches.get(tried)
            && !branch.is_empty()
        {
            let step = MatchState::new(ElementType::Option, branch.pair(), str_at)
                .with_action(MatchAction::Showcase);
            self.record(automaton, step);
        }
    }

    fn record(&mut self, automaton: &Automaton, step: MatchState) {
        self.trace.add_state(step);
        self.trace.new_groups(self.state.visible_groups(automaton));
    }

    fn backtrack(&mut self, automaton: &Automaton) -> Result<Option<Outcome>, MatchError> {
        let failed_pc = self.state.pc;
        let failed = automaton
            .node(failed_pc)
            .and_then(|node| automaton.element(node));
        self.state.frames.pop();

        let mut above = failed_pc;
        while let Some(top) = self.state.frames.last()
            && automaton
                .node(top.pc)
                .is_some_and(|node| matches!(node.kind, NodeKind::Set(_)))
        {
            above = top.pc;
            self.state.frames.pop();
        }

        let landing = self.state.frames.last().copied();
        let landing_element = landing
            .and_then(|frame| automaton.node(frame.pc))
            .and_then(|node| automaton.element(node));
        if let (Some(frame), Some(element)) = (landing, landing_element) {
            self.state.land(&element.kind, frame.pc, above)?;
        }

        match failed.map(|element| &element.kind) {
            Some(ElementKind::Group(info)) => self.state.unopen_group(failed_pc, info)?,
            Some(ElementKind::GroupEnd) => self.state.unclose_group(failed_pc)?,
            _ => {}
        }

        let Some(frame) = landing else {
            return Ok(self.restart(automaton));
        };
        self.state.advance(frame.pc, frame.pos);
        if let Some(element) = failed {
            let step = MatchState::new(element.ty(), element.span.pair(), [self.start, frame.pos])
                .with_action(MatchAction::Backtracking);
            self.record(automaton, step);
            if let Some(Element {
                kind: ElementKind::Option { .. },
                span,
            }) = landing_element
            {
                self.trace.update_option(span.start);
            }
        }
        Ok(None)
    }

    /// Every path from the current start failed: move the start one
    /// character right, or give up past the end of input.
    fn restart(&mut self, automaton: &Automaton) -> Option<Outcome> {
        debug_assert!(self.state.iterations.is_empty() && self.state.groups.is_empty());
        debug_assert!(self.state.pass_starts.is_empty());
        if self.start >= self.input.len() {
            return Some(self.fail(automaton));
        }
        self.start += 1;
        self.state.advance(0, self.start);
        self.trace.set_start(Some(self.start));
        if !self.trace.flags().ignore_str_start_position_change {
            let step = MatchState::new(ElementType::Root, [0, 0], [self.start, self.start])
                .with_action(MatchAction::ForwardStart);
            self.record(automaton, step);
        }
        None
    }

    fn succeed(&mut self, automaton: &Automaton) -> Outcome {
        let end = self.state.pos;
        let len = automaton.pattern_len();
        self.trace.set_end(Some(end));
        self.trace.set_success(true);
        self.record(automaton, MatchState::new(ElementType::Root, [len, len], [self.start, end]));
        Outcome::Success
    }

    fn fail(&mut self, automaton: &Automaton) -> Outcome {
        let len = automaton.pattern_len();
        let n = self.input.len();
        self.trace.set_start(None);
        self.trace.set_end(None);
        self.record(automaton, MatchState::new(ElementType::Root, [len, len], [n, n]));
        Outcome::NoMatch
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::ElementIdx;
    use crate::compile;
    use crate::flags::Flag;
    use crate::trace::MatchData;

    fn run_with(pattern: &str, input: &str, flags: MatchFlags) -> (Outcome, MatchData) {
        let automaton = compile(pattern).unwrap();
        let mut run = Run::new(input, flags, None);
        let abort = AbortHandle::default();
        match run.resume(&automaton, &abort, SessionId::new(1)).unwrap() {
            Yield::Done(outcome) => (outcome, run.trace_mut().finalize()),
            other => panic!("{:?} on {:?}: unexpected {:?}", pattern, input, other),
        }
    }

    fn run(pattern: &str, input: &str) -> (Outcome, MatchData) {
        run_with(pattern, input, MatchFlags::default())
    }

    fn span(pattern: &str, input: &str) -> Option<(usize, usize)> {
        let (outcome, data) = run(pattern, input);
        match outcome {
            Outcome::Success => Some((data.start.unwrap(), data.end.unwrap())),
            Outcome::NoMatch => {
                assert_eq!((data.start, data.end), (None, None));
                None
            }
        }
    }

    /// Compare against the `regex` crate, which is leftmost-first too.
    fn check(pattern: &str, inputs: &[&str]) {
        let oracle = regex::Regex::new(pattern).unwrap();
        for input in inputs {
            let expected = oracle.find(input).map(|m| {
                (
                    input[..m.start()].chars().count(),
                    input[..m.end()].chars().count(),
                )
            });
            assert_eq!(span(pattern, input), expected, "{:?} on {:?}", pattern, input);
        }
    }

    fn assert_matches(pattern: &str, cases: &[(&str, bool)]) {
        for &(input, expected) in cases {
            let (outcome, data) = run(pattern, input);
            assert_eq!(
                outcome == Outcome::Success,
                expected,
                "{:?} on {:?}",
                pattern,
                input
            );
            assert_eq!(data.success, expected);
        }
    }

    #[test]
    fn test_literals() {
        assert_matches("a", &[("", false), ("aaa", true), ("d", false)]);
        assert_matches("test", &[("aaatest", true), ("aatesaaa", false)]);
        check("a", &["", "aaa", "d", "ba"]);
        check("test", &["aaatest", "aatesaaa", "tetest"]);
    }

    #[test]
    fn test_iterations() {
        assert_matches("a*", &[("", true)]);
        assert_matches("a+", &[("", false), ("bb", false)]);
        assert_matches("ba*r", &[("br", true), ("babar", true), ("tbaataaaartest", false)]);
        assert_matches("b(ab)+r", &[("babr", true), ("babar", false), ("bababr", true)]);
        assert_matches("b(ab)*r", &[("br", true), ("bar", false)]);
        check("a*", &["", "aaa", "baa"]);
        check("a+", &["", "bb", "baab"]);
        check("ba*r", &["br", "babar", "tbaataaaartest", "xbaaar"]);
        check("b(ab)+r", &["babr", "babar", "bababr", "bbabr"]);
        check("b(ab)*r", &["br", "bar", "babababr"]);
    }

    #[test]
    fn test_alternation() {
        assert_matches("a|(rb+r)", &[("ggrrab", true), ("rr", false)]);
        assert_matches(
            "t(a|(rb+r)|dd)+t",
            &[("tarbraddt", true), ("trbabbbrt", false), ("tddaddrb", false)],
        );
        check("a|(rb+r)", &["ggrrab", "rr", "rbbbr"]);
        check("t(a|(rb+r)|dd)+t", &["tarbraddt", "trbabbbrt", "tddaddrb", "xtddtx"]);
        check("ab|a", &["ab", "a", "ca"]);
        check("a|ab", &["ab"]);
    }

    #[test]
    fn test_anchors() {
        assert_matches("^a", &[("attttbttt", true), ("ta", false)]);
        assert_matches("a$", &[("ta", true), ("taaat", false)]);
        assert_matches("^(a)+|b+$", &[("ab", true), ("ba", false), ("gabg", false)]);
        check("^a", &["attttbttt", "ta"]);
        check("a$", &["ta", "taaat"]);
        check("^(a)+|b+$", &["ab", "ba", "gabg", "aab", "gbb"]);
        check("^$", &["", "a"]);
    }

    #[test]
    fn test_classes() {
        check("[abc]", &["xxc", "d", ""]);
        assert_matches("_[a-zA-Z]*_", &[("012__", true), ("_ghtw0eg_", false)]);
        check("_[a-zA-Z]*_", &["012__", "_ghtw0eg_", "x_Az_"]);
        check(r"[^a-c]+", &["abcdef", "abc"]);
        check(r"\d+\s\w+", &["tel 42 abc_9", "42abc"]);
        assert_matches(".", &[("\n", false), ("\r%", true)]);
        assert_eq!(span(".", "\r%"), Some((1, 2)));
    }

    #[test]
    fn test_empty_loops_terminate() {
        assert_eq!(span("()+", "abbbc"), Some((0, 0)));
        assert_eq!(span("()*", "abbbc"), Some((0, 0)));
        assert_eq!(span("(a|b|)*", "abbbc"), Some((0, 4)));
        assert_eq!(span("((a|b|()+)*|a|b|)+", "abbbc"), Some((0, 4)));
        assert_eq!(span("(a*)*b", "aaac"), None);
        check("(a|b|)*", &["abbbc", "c"]);
        check("(a*)+", &["", "aaa"]);
        check("(a|){3}", &["", "a", "aaaa"]);
        check("(a*){2}", &["b", "aaa"]);
    }

    #[test]
    fn test_nested_iteration() {
        assert_eq!(span("(ab(c)*)+_", "abab_"), Some((0, 5)));
        assert_eq!(span("(ab(c)*)+_", "abababab_"), Some((0, 9)));
        check("(ab(c)*)+_", &["abab_", "abababab_", "abcabababcccc_", "abc"]);
    }

    #[test]
    fn test_ranges() {
        assert_matches("(ab)?a", &[("", false), ("a", true), ("aba", true)]);
        assert_matches("a{3}", &[("aab", false), ("bbbaaab", true)]);
        assert_eq!(span("a{3,}", "baaaaaaaab"), Some((1, 9)));
        assert_matches("^a{3,6}$", &[("aaaaaa", true), ("aaaaaaa", false), ("aa", false)]);
        assert_eq!(span("a{3,6}", "aaaaaa"), Some((0, 6)));
        check("(ab)?a", &["", "a", "aba", "bba"]);
        check("a{3}", &["aab", "bbbaaab", "aaaaaaa"]);
        check("a{3,}", &["baaaaaaaab", "aa"]);
        check("a{2,4}", &["aaaaaaa", "a"]);
        check("^(a|b|(x+)){3,9}$", &["abx", "ab", "xxxxxx", "abababababab", "xxxxxxxxxxy"]);
    }

    #[test]
    fn test_range_minimum_after_backtracking() {
        // The last pass fails and is undone; the exit must still count passes.
        assert_eq!(span("x{2}", "x"), None);
        assert_eq!(span("(?:ab){2}", "ab"), None);
        check("x{2}", &["x", "xx", "xxx"]);
        check("a{3,}", &["aa", "aaa", "baab"]);
        check("(?:.){2,}", &["c", "cc", "c\nc"]);
        check("(?:ab){2}", &["ab", "abab", "abaabab"]);
        check("(?:a{1,2}){2}", &["a", "aa", "aaa", "aaaaa"]);
        check("((ab)?){2,3}c", &["c", "abc", "ababc", "xababababc"]);
    }

    #[test]
    fn test_zero_repetition_skips_body() {
        for (pattern, input) in [("(a*){0}", ""), ("(a*){0}", "aa"), ("(){0}", "x"), ("(a){0}b", "ab")] {
            let oracle = regex::Regex::new(pattern).unwrap();
            let caps = oracle.captures(input).unwrap();
            assert!(caps.get(1).is_none());
            let (outcome, data) = run(pattern, input);
            assert_eq!(outcome, Outcome::Success);
            let whole = caps.get(0).unwrap();
            assert_eq!((data.start, data.end), (Some(whole.start()), Some(whole.end())));
            assert_eq!(groups_of(&data), vec![], "{:?} on {:?}", pattern, input);
        }
        check("a{0}", &["", "aaa"]);
        check("ba{0}?c", &["bc", "bac"]);
    }

    /// Total step count of a batched run, failing once it passes `limit`.
    fn bounded_steps(pattern: &str, input: &str, limit: usize) -> (Outcome, usize) {
        let automaton = compile(pattern).unwrap();
        let mut run = Run::new(input, MatchFlags::default(), NonZeroUsize::new(64));
        let abort = AbortHandle::default();
        loop {
            match run.resume(&automaton, &abort, SessionId::new(1)).unwrap() {
                Yield::Batch(_) => assert!(
                    run.trace().states_count() < limit,
                    "{:?} on {:?} did not finish within {} steps",
                    pattern,
                    input,
                    limit
                ),
                Yield::Done(outcome) => return (outcome, run.trace().states_count()),
                Yield::Aborted => panic!("not aborted"),
            }
        }
    }

    #[test]
    fn test_nested_empty_loops_are_bounded() {
        for pattern in ["(a*)*b", "(?:a*)*b", "(?:a*)+b"] {
            for input in ["ac", "aac", "aaac"] {
                let (outcome, _) = bounded_steps(pattern, input, 5_000);
                assert_eq!(outcome, Outcome::NoMatch, "{:?} on {:?}", pattern, input);
            }
            check(pattern, &["ac", "aab", "b", "c"]);
        }
    }

    #[test]
    fn test_phone_numbers() {
        let inputs = [
            "+420 123 456 789",
            "+420123456789",
            "123 456 789",
            "123456789",
            "+ 420 123 456 789",
            "12345678",
            "+42 123 456 789",
            "123 456 7890",
        ];
        check(r"^(\+ ?\d{3} ?)?(\d{3} ?){3}$", &inputs);
        check(r"^(\+ ?\d{3})?( ?\d{3}){3}$", &inputs);
    }

    #[test]
    fn test_lazy_quantifiers() {
        check("a+?", &["aaa"]);
        check("a*?b", &["aaab", "b"]);
        check("(ab)*?c", &["ababc", "c"]);
        check("a{2,4}?", &["aaaaa"]);
        check("a??b", &["ab", "b"]);
        check("<.+?>", &["<a><b>"]);
        check("x.*?y.*y", &["x1y2y3y"]);
    }

    #[test]
    fn test_chars_not_bytes() {
        assert_eq!(span("é+", "aééb"), Some((1, 3)));
        check("[ä-ö]", &["zzö"]);
    }

    fn groups_of(data: &MatchData) -> Vec<(u32, [usize; 2])> {
        data.groups
            .iter()
            .flatten()
            .map(|(&index, group)| (index, group.str_at))
            .collect()
    }

    #[test]
    fn test_captures_agree_with_regex_crate() {
        let cases = [
            (r"(\d+)-(\d+)", "tel 12-345"),
            ("(a|ab)(c|bcd)(d*)", "abcd"),
            ("(a)(b)?c", "ac"),
            ("(?:x(y))+", "xyxy"),
        ];
        for (pattern, input) in cases {
            let oracle = regex::Regex::new(pattern).unwrap();
            let caps = oracle.captures(input).unwrap();
            let expected: Vec<(u32, [usize; 2])> = caps
                .iter()
                .enumerate()
                .skip(1)
                .filter_map(|(index, m)| m.map(|m| (index as u32, [m.start(), m.end()])))
                .collect();
            let (outcome, data) = run(pattern, input);
            assert_eq!(outcome, Outcome::Success);
            assert_eq!(groups_of(&data), expected, "{:?} on {:?}", pattern, input);
        }
    }

    #[test]
    fn test_nested_captures_from_last_pass() {
        let (_, data) = run("(ab(c)*)+_", "abcabababcccc_");
        assert_eq!((data.start, data.end), (Some(0), Some(14)));
        assert_eq!(groups_of(&data), vec![(1, [7, 13]), (2, [12, 13])]);

        let (_, data) = run("(ab(c)*)+_", "abab_");
        assert_eq!(groups_of(&data), vec![(1, [2, 4])]);

        let (_, data) = run("(ab(c)*)+_", "abcab_");
        assert_eq!(
            groups_of(&data),
            vec![(1, [3, 5])],
            "a capture from an earlier pass of the outer group is hidden"
        );
    }

    #[test]
    fn test_named_group() {
        let (_, data) = run("(?P<year>\\d{4})", "in 2024");
        let groups = data.groups.unwrap();
        let year = &groups[&1];
        assert_eq!(year.name.as_deref(), Some("year"));
        assert_eq!(year.reg_at, [0, 15]);
        assert_eq!(year.str_at, [3, 7]);
    }

    fn shape(data: &MatchData) -> Vec<(ElementType, [usize; 2], [usize; 2], Option<MatchAction>)> {
        data.states
            .iter()
            .map(|state| (state.ty, state.reg_at, state.str_at, state.action))
            .collect()
    }

    #[test]
    fn test_trace_of_simple_match() {
        use ElementType::*;
        let (_, data) = run("ab", "ab");
        assert_eq!(
            shape(&data),
            vec![
                (Root, [0, 0], [0, 0], None),
                (Primitive, [0, 1], [0, 1], None),
                (Primitive, [1, 2], [0, 2], None),
                (Root, [2, 2], [0, 2], None),
            ]
        );
        assert_eq!(data.states_count, 4);
    }

    #[test]
    fn test_trace_of_failed_match() {
        use ElementType::*;
        use MatchAction::*;
        let (outcome, data) = run("ab", "ac");
        assert_eq!(outcome, Outcome::NoMatch);
        assert_eq!(
            shape(&data),
            vec![
                (Root, [0, 0], [0, 0], None),
                (Primitive, [0, 1], [0, 1], None),
                (Primitive, [1, 2], [0, 0], Some(Backtracking)),
                (Primitive, [0, 1], [0, 0], Some(Backtracking)),
                (Root, [0, 0], [1, 1], Some(ForwardStart)),
                (Primitive, [0, 1], [1, 1], Some(Backtracking)),
                (Root, [0, 0], [2, 2], Some(ForwardStart)),
                (Primitive, [0, 1], [2, 2], Some(Backtracking)),
                (Root, [2, 2], [2, 2], None),
            ]
        );

        let flags = MatchFlags::default().with(Flag::IgnoreStrStartPositionChange);
        let (_, quiet) = run_with("ab", "ac", flags);
        assert_eq!(quiet.states.len(), 7);
        assert!(quiet.states.iter().all(|state| state.action != Some(ForwardStart)));
    }

    #[test]
    fn test_shorten_backtracking() {
        let flags = MatchFlags::default()
            .with(Flag::ShortenBacktracking)
            .with(Flag::BacktrackedFromExact);
        let (_, data) = run_with("ab", "ac", flags);
        assert_eq!(data.states.len(), 8);
        let collapsed = &data.states[2];
        assert_eq!(collapsed.reg_at, [0, 1]);
        assert_eq!(collapsed.from_exact, Some([1, 2]));
    }

    #[test]
    fn test_group_steps() {
        use ElementType::*;
        let (_, data) = run("(a)", "a");
        assert_eq!(
            shape(&data),
            vec![
                (Root, [0, 0], [0, 0], None),
                (Group, [0, 3], [0, 0], None),
                (Primitive, [1, 2], [0, 1], None),
                (GroupEnd, [2, 3], [0, 1], None),
                (Root, [3, 3], [0, 1], None),
            ]
        );

        let flags = MatchFlags::default()
            .with(Flag::IgnoreGroupEnters)
            .with(Flag::IgnoreGroupLeaves)
            .with(Flag::AddGroupsToStates);
        let (_, data) = run_with("(a)", "a", flags);
        assert_eq!(data.states.len(), 3);
        let last = data.states.last().unwrap();
        assert_eq!(last.groups.as_ref().map(|groups| groups[&1].str_at), Some([0, 1]));
        assert_eq!(data.states[1].groups, None, "not visible inside the group");
    }

    #[test]
    fn test_option_steps() {
        use ElementType::*;
        use MatchAction::*;
        let flags = MatchFlags::default().with(Flag::OptionEntersShowActive);
        let (_, data) = run_with("a|b", "b", flags);
        assert_eq!(
            shape(&data),
            vec![
                (Root, [0, 0], [0, 0], None),
                (Option, [0, 1], [0, 0], Some(Showcase)),
                (Primitive, [0, 0], [0, 0], Some(Backtracking)),
                (Option, [2, 3], [0, 0], Some(Showcase)),
                (Primitive, [2, 3], [0, 1], None),
                (OptionEnd, [2, 3], [0, 1], None),
                (Root, [3, 3], [0, 1], None),
            ]
        );

        let flags = MatchFlags::default()
            .with(Flag::OptionShowFirstEnter)
            .with(Flag::IgnoreOptionLeaves);
        let (_, data) = run_with("a|b", "a", flags);
        assert_eq!(
            shape(&data),
            vec![
                (Root, [0, 0], [0, 0], None),
                (Option, [0, 3], [0, 0], None),
                (Primitive, [0, 1], [0, 1], None),
                (Root, [3, 3], [0, 1], None),
            ]
        );

        let flags = flags
            .with(Flag::OptionEntersShowActive)
            .with(Flag::IgnoreOptionEnters);
        let (_, data) = run_with("a|b", "a", flags);
        assert_eq!(data.states.len(), 3);
    }

    #[test]
    fn test_every_start_position_is_tried() {
        assert_eq!(span("b*$", "aa"), Some((2, 2)));
        assert_eq!(span("a*", "ba"), Some((0, 0)));
        let (_, data) = run("x", "ab");
        let starts = data
            .states
            .iter()
            .filter(|state| state.action == Some(MatchAction::ForwardStart))
            .count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn test_match_found_from_earlier_starts() {
        for (pattern, input) in [("b+c", "aabbbc"), ("(x|yz)+", "wwyzx"), ("c$", "abc")] {
            let Some((start, _)) = span(pattern, input) else {
                panic!("{pattern} should match {input:?}");
            };
            for offset in 0..=start {
                let found = span(pattern, &input[offset..]).map(|(s, _)| s + offset);
                assert!(matches!(found, Some(s) if s >= offset), "{pattern} from {offset}");
            }
        }
    }

    #[test]
    fn test_abort_is_polled() {
        let automaton = compile("a").unwrap();
        let mut run = Run::new("bbbb", MatchFlags::default(), None);
        let abort = AbortHandle::default();
        abort.abort(SessionId::new(7));
        let result = run.resume(&automaton, &abort, SessionId::new(7)).unwrap();
        assert!(matches!(result, Yield::Aborted));
        assert_eq!(run.trace().states_count(), 1);

        let result = run.resume(&automaton, &abort, SessionId::new(8)).unwrap();
        assert!(matches!(result, Yield::Done(Outcome::NoMatch)), "other sessions are unaffected");
    }

    #[test]
    fn test_batches_yield_between_steps() {
        let automaton = compile("ab").unwrap();
        let mut run = Run::new("xxab", MatchFlags::default(), NonZeroUsize::new(3));
        let abort = AbortHandle::default();
        let mut batches = 0;
        loop {
            match run.resume(&automaton, &abort, SessionId::new(1)).unwrap() {
                Yield::Batch(batch) => {
                    assert_eq!(batch.batch_size, 3);
                    batches += 1;
                }
                Yield::Done(outcome) => {
                    assert_eq!(outcome, Outcome::Success);
                    break;
                }
                Yield::Aborted => panic!("not aborted"),
            }
        }
        assert!(batches > 0);
    }

    fn malformed(middle: ElementKind, transitions: Vec<Transition>) -> Automaton {
        let nodes = vec![
            Node::new(
                NodeKind::Standard(Box::new([Transition::epsilon(1)])),
                Some(ElementIdx(0)),
            ),
            Node::new(NodeKind::Standard(transitions.into_boxed_slice()), Some(ElementIdx(1))),
            Node::new(NodeKind::End, Some(ElementIdx(2))),
        ];
        let elements = vec![
            Element::new(ElementKind::Root, Span::new(0, 1)),
            Element::new(middle, Span::new(0, 1)),
            Element::new(ElementKind::End, Span::new(1, 1)),
        ];
        Automaton::from_parts_unchecked(nodes, elements, vec![])
    }

    fn structural_error(automaton: &Automaton) -> MatchError {
        let mut run = Run::new("a", MatchFlags::default(), None);
        run.resume(automaton, &AbortHandle::default(), SessionId::new(1))
            .unwrap_err()
    }

    #[test]
    fn test_structural_errors() {
        let automaton = malformed(ElementKind::IterationEnd, vec![Transition::epsilon(1)]);
        assert_eq!(structural_error(&automaton), MatchError::MissingIteration { pc: 1 });

        let automaton = malformed(ElementKind::GroupEnd, vec![Transition::epsilon(1)]);
        assert_eq!(structural_error(&automaton), MatchError::MissingGroup { pc: 1 });

        let automaton = malformed(ElementKind::Primitive('a'), vec![Transition::consume('a', 5)]);
        assert_eq!(structural_error(&automaton), MatchError::UndefinedPosition { pc: 6 });

        let automaton = malformed(ElementKind::Primitive('a'), vec![Transition::epsilon(-3)]);
        assert_eq!(structural_error(&automaton), MatchError::UndefinedPosition { pc: -2 });
    }

    #[test]
    fn test_unvalidated_group_offset_saturates() {
        let info = GroupInfo {
            index: Some(1),
            name: None,
            end_offset: usize::MAX,
        };
        let automaton = malformed(ElementKind::Group(info), vec![Transition::epsilon(1)]);
        let mut run = Run::new("a", MatchFlags::default(), None);
        let result = run.resume(&automaton, &AbortHandle::default(), SessionId::new(1));
        assert!(matches!(result, Ok(Yield::Done(Outcome::Success))));
    }

    #[test]
    fn test_stacks_unwind_completely() {
        // Every failed start position must leave the bookkeeping empty,
        // otherwise the restart debug assertion fires.
        let patterns = [
            "(a(b)?)+c",
            "((a|b)*x)|y",
            "(?:(a)|(b))+?z",
            "^(a|b|(x+)){3,9}$",
            "((a|b|()+)*|a|b|)+q",
        ];
        for pattern in patterns {
            for input in ["abab", "xxbxa", "aaabbb", ""] {
                let (outcome, data) = run(pattern, input);
                assert_eq!(data.success, outcome == Outcome::Success);
            }
        }
    }
}
