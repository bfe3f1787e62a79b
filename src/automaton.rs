//! The flat automaton executed by the backtracking matcher.
//!
//! An [`Automaton`] is an array of [`Node`]s addressed by their index, which
//! doubles as the matcher's program counter.  Transitions are stored as
//! *relative* offsets, so a node never names its successor directly:
//!
//! ```text
//!  a|b      0 ROOT      [(ε,+1)]
//!           1 OPTION    [(ε,+1), (ε,+3)]
//!           2 'a'       [(a,+1)]
//!           3 OPTION_END[(ε,+3)]
//!           4 'b'       [(b,+1)]
//!           5 OPTION_END[(ε,+1)]
//!           6 END
//! ```
//!
//! Every node may point at the source [`Element`] it was lowered from.  The
//! element carries the span in the pattern text that the trace reports as
//! `regAt`, together with whatever the matcher needs to know about the
//! construct (repetition bounds, capture index, alternative spans).

use std::fmt;
use std::io::{self, Write};
use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::Error;

// ---------------------------------------------------------------------------
// Spans
// ---------------------------------------------------------------------------

/// A half-open `[start, end)` range of character offsets into the pattern.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn is_empty(self) -> bool {
        self.start >= self.end
    }

    /// The `[start, end]` pair used by the trace wire format.
    pub fn pair(self) -> [usize; 2] {
        [self.start, self.end]
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Character classes
// ---------------------------------------------------------------------------

/// A set of characters stored as sorted, non-overlapping, non-adjacent
/// inclusive ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CharClass {
    ranges: Vec<(char, char)>,
}

/// Successor in `char` space, hopping over the surrogate gap.
fn next_char(c: char) -> Option<char> {
    match c {
        '\u{D7FF}' => Some('\u{E000}'),
        char::MAX => None,
        _ => char::from_u32(c as u32 + 1),
    }
}

fn prev_char(c: char) -> Option<char> {
    match c {
        '\u{E000}' => Some('\u{D7FF}'),
        '\0' => None,
        _ => char::from_u32(c as u32 - 1),
    }
}

impl CharClass {
    /// Build a class from arbitrary (possibly overlapping or reversed)
    /// ranges.
    pub fn new(ranges: impl IntoIterator<Item = (char, char)>) -> Self {
        let mut class = Self {
            ranges: ranges
                .into_iter()
                .map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
                .collect(),
        };
        class.canonicalize();
        class
    }

    fn canonicalize(&mut self) {
        self.ranges.sort_unstable();
        let mut merged: Vec<(char, char)> = Vec::with_capacity(self.ranges.len());
        for &(start, end) in &self.ranges {
            if let Some(last) = merged.last_mut()
                && next_char(last.1).is_none_or(|next| next >= start)
            {
                last.1 = last.1.max(end);
                continue;
            }
            merged.push((start, end));
        }
        self.ranges = merged;
    }

    /// `[0-9]`
    pub fn digit() -> Self {
        Self::new([('0', '9')])
    }

    /// `[0-9A-Za-z_]`
    pub fn word() -> Self {
        Self::new([('0', '9'), ('A', 'Z'), ('a', 'z'), ('_', '_')])
    }

    /// `[\t\n\v\f\r \u{A0}]`
    pub fn space() -> Self {
        Self::new([('\t', '\r'), (' ', ' '), ('\u{A0}', '\u{A0}')])
    }

    /// Everything except the line terminators `\n` and `\r`.
    pub fn any() -> Self {
        Self::new([('\n', '\n'), ('\r', '\r')]).negate()
    }

    pub fn ranges(&self) -> &[(char, char)] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, c: char) -> bool {
        self.ranges
            .binary_search_by(|&(start, end)| {
                if end < c {
                    std::cmp::Ordering::Less
                } else if start > c {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// The complement over all Unicode scalar values.
    pub fn negate(&self) -> Self {
        let mut ranges = Vec::with_capacity(self.ranges.len() + 1);
        let mut low = Some('\0');
        for &(start, end) in &self.ranges {
            if let Some(from) = low
                && from < start
                && let Some(to) = prev_char(start)
            {
                ranges.push((from, to));
            }
            low = next_char(end);
        }
        if let Some(from) = low {
            ranges.push((from, char::MAX));
        }
        Self { ranges }
    }

    /// Add every member of `other` to this class.
    pub fn union(&mut self, other: &CharClass) {
        self.ranges.extend_from_slice(&other.ranges);
        self.canonicalize();
    }
}

impl fmt::Display for CharClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for &(start, end) in &self.ranges {
            if start == end {
                write!(f, "{}", start.escape_debug())?;
            } else {
                write!(f, "{}-{}", start.escape_debug(), end.escape_debug())?;
            }
        }
        f.write_str("]")
    }
}

/// Index into [`Automaton::classes`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassIdx(pub(crate) u32);

impl ClassIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl Index<ClassIdx> for [CharClass] {
    type Output = CharClass;

    #[inline]
    fn index(&self, idx: ClassIdx) -> &CharClass {
        &self[idx.idx()]
    }
}

// ---------------------------------------------------------------------------
// Source elements
// ---------------------------------------------------------------------------

/// Which quantifier an iteration was written with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RepeatKind {
    /// `*`
    Zero,
    /// `+`
    One,
    /// `?`, `{n}`, `{n,}`, `{n,m}`
    Range,
}

/// Repetition bounds of an iteration element.  `max == None` is unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Repeat {
    pub kind: RepeatKind,
    pub min: u32,
    pub max: Option<u32>,
    pub greedy: bool,
}

impl Repeat {
    /// Whether `count` completed passes satisfy the bounds.
    pub fn accepts(&self, count: u32) -> bool {
        count >= self.min && self.max.is_none_or(|max| count <= max)
    }
}

/// Capture metadata of a group element.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupInfo {
    /// Capture index, `None` for non-capturing groups.
    pub index: Option<u32>,
    pub name: Option<String>,
    /// Offset from the GROUP node to its GROUP_END node.
    pub end_offset: usize,
}

/// What a source element is, plus the data the matcher needs about it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Root,
    Primitive(char),
    /// An alternation.  `branches` holds the span of every alternative in
    /// source order (an empty alternative has an empty span).
    Option { branches: Box<[Span]> },
    OptionEnd,
    Iteration(Repeat),
    IterationEnd,
    Group(GroupInfo),
    GroupEnd,
    List,
    NegatedList,
    /// `\d \w \s` and their negations.
    Special,
    Any,
    StartString,
    EndString,
    End,
}

impl ElementKind {
    pub fn ty(&self) -> ElementType {
        match self {
            ElementKind::Root => ElementType::Root,
            ElementKind::Primitive(_) => ElementType::Primitive,
            ElementKind::Option { .. } => ElementType::Option,
            ElementKind::OptionEnd => ElementType::OptionEnd,
            ElementKind::Iteration(repeat) => match repeat.kind {
                RepeatKind::Zero => ElementType::IterationZero,
                RepeatKind::One => ElementType::IterationOne,
                RepeatKind::Range => ElementType::IterationRange,
            },
            ElementKind::IterationEnd => ElementType::IterationEnd,
            ElementKind::Group(_) => ElementType::Group,
            ElementKind::GroupEnd => ElementType::GroupEnd,
            ElementKind::List => ElementType::List,
            ElementKind::NegatedList => ElementType::NegatedList,
            ElementKind::Special => ElementType::Special,
            ElementKind::Any => ElementType::Any,
            ElementKind::StartString => ElementType::StartString,
            ElementKind::EndString => ElementType::EndString,
            ElementKind::End => ElementType::End,
        }
    }
}

/// The tag reported as `type` in every trace step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementType {
    Root,
    Primitive,
    Option,
    OptionEnd,
    IterationZero,
    IterationOne,
    IterationRange,
    IterationEnd,
    Group,
    GroupEnd,
    List,
    NegatedList,
    Special,
    Any,
    StartString,
    EndString,
    End,
}

impl ElementType {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementType::Root => "ROOT",
            ElementType::Primitive => "PRIMITIVE",
            ElementType::Option => "OPTION",
            ElementType::OptionEnd => "OPTION_END",
            ElementType::IterationZero => "ITERATION_ZERO",
            ElementType::IterationOne => "ITERATION_ONE",
            ElementType::IterationRange => "ITERATION_RANGE",
            ElementType::IterationEnd => "ITERATION_END",
            ElementType::Group => "GROUP",
            ElementType::GroupEnd => "GROUP_END",
            ElementType::List => "LIST",
            ElementType::NegatedList => "NEGATED_LIST",
            ElementType::Special => "SPECIAL",
            ElementType::Any => "ANY",
            ElementType::StartString => "START_STRING",
            ElementType::EndString => "END_STRING",
            ElementType::End => "END",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A construct of the pattern source and where it was written.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Element {
    pub kind: ElementKind,
    pub span: Span,
}

impl Element {
    pub fn new(kind: ElementKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn ty(&self) -> ElementType {
        self.kind.ty()
    }
}

/// Index into [`Automaton::elements`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ElementIdx(pub(crate) u32);

impl ElementIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl Index<ElementIdx> for [Element] {
    type Output = Element;

    #[inline]
    fn index(&self, idx: ElementIdx) -> &Element {
        &self[idx.idx()]
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// One outgoing edge of a standard node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Transition {
    /// The character consumed, or `None` for an epsilon move.
    pub on: Option<char>,
    /// Program-counter delta.  Never zero.
    pub offset: isize,
}

impl Transition {
    pub const fn epsilon(offset: isize) -> Self {
        Self { on: None, offset }
    }

    pub const fn consume(c: char, offset: isize) -> Self {
        Self { on: Some(c), offset }
    }
}

/// Anchors behave as a standard node with this single transition once
/// their condition holds.
const STEP_FORWARD: [Transition; 1] = [Transition::epsilon(1)];

/// How a node is executed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Ordered alternatives, tried first to last.
    Standard(Box<[Transition]>),
    /// Consume one character in the class and advance by one.
    Set(ClassIdx),
    /// Holds only at input position 0.
    AssertStart,
    /// Holds only at the end of input.
    AssertEnd,
    /// Accept.
    End,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub element: Option<ElementIdx>,
}

impl Node {
    pub fn new(kind: NodeKind, element: Option<ElementIdx>) -> Self {
        Self { kind, element }
    }

    /// The alternatives tried by the standard dispatch.  Set and END nodes
    /// have none.
    pub fn transitions(&self) -> &[Transition] {
        match &self.kind {
            NodeKind::Standard(transitions) => transitions,
            NodeKind::AssertStart | NodeKind::AssertEnd => &STEP_FORWARD,
            NodeKind::Set(_) | NodeKind::End => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Automaton
// ---------------------------------------------------------------------------

struct NodeList(Box<[Node]>);

impl fmt::Debug for NodeList {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_map().entries(self.0.iter().enumerate()).finish()
    }
}

/// A compiled pattern, immutable once built.
#[derive(Debug)]
pub struct Automaton {
    nodes: NodeList,
    pub(crate) elements: Box<[Element]>,
    /// Character classes referenced by [`NodeKind::Set`].
    pub(crate) classes: Box<[CharClass]>,
}

impl Automaton {
    /// Assemble an automaton from its parts, checking its structure.
    pub fn from_parts(
        nodes: Vec<Node>,
        elements: Vec<Element>,
        classes: Vec<CharClass>,
    ) -> Result<Self, Error> {
        let automaton = Self::from_parts_unchecked(nodes, elements, classes);
        automaton.validate()?;
        Ok(automaton)
    }

    pub(crate) fn from_parts_unchecked(
        nodes: Vec<Node>,
        elements: Vec<Element>,
        classes: Vec<CharClass>,
    ) -> Self {
        Self {
            nodes: NodeList(nodes.into_boxed_slice()),
            elements: elements.into_boxed_slice(),
            classes: classes.into_boxed_slice(),
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes.0
    }

    pub fn len(&self) -> usize {
        self.nodes.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.0.is_empty()
    }

    /// The node at program counter `pc`, if there is one.
    pub fn node(&self, pc: usize) -> Option<&Node> {
        self.nodes.0.get(pc)
    }

    pub fn element(&self, node: &Node) -> Option<&Element> {
        node.element.and_then(|idx| self.elements.get(idx.idx()))
    }

    pub fn class(&self, idx: ClassIdx) -> &CharClass {
        &self.classes[idx]
    }

    pub fn classes(&self) -> &[CharClass] {
        &self.classes
    }

    /// Length of the pattern source, taken from the ROOT element.
    pub fn pattern_len(&self) -> usize {
        self.node(0)
            .and_then(|root| self.element(root))
            .map_or(0, |root| root.span.end)
    }

    /// Capture groups in node order: `(group pc, info, span)`.
    pub fn groups(&self) -> impl Iterator<Item = (usize, &GroupInfo, Span)> + '_ {
        self.nodes().iter().enumerate().filter_map(|(pc, node)| {
            let element = self.element(node)?;
            match &element.kind {
                ElementKind::Group(info) => Some((pc, info, element.span)),
                _ => None,
            }
        })
    }

    /// Check the structural invariants the matcher relies on.
    pub fn validate(&self) -> Result<(), Error> {
        let nodes = self.nodes();
        let is_root = nodes
            .first()
            .and_then(|node| self.element(node))
            .is_some_and(|element| element.kind == ElementKind::Root);
        if !is_root {
            return Err(Error::Malformed("node 0 must be ROOT"));
        }
        let ends = nodes.iter().filter(|node| node.kind == NodeKind::End).count();
        if ends != 1 || nodes.last().map(|node| &node.kind) != Some(&NodeKind::End) {
            return Err(Error::Malformed("automaton must end with exactly one END node"));
        }
        for (pc, node) in nodes.iter().enumerate() {
            if let Some(idx) = node.element
                && idx.idx() >= self.elements.len()
            {
                return Err(Error::Malformed("node references a missing element"));
            }
            if let NodeKind::Set(class) = node.kind
                && class.idx() >= self.classes.len()
            {
                return Err(Error::Malformed("set node references a missing class"));
            }
            for transition in node.transitions() {
                let target = pc.checked_add_signed(transition.offset);
                if transition.offset == 0 || target.is_none_or(|target| target >= nodes.len()) {
                    return Err(Error::Malformed("transition leaves the automaton"));
                }
            }
            if let Some(element) = self.element(node)
                && let ElementKind::Group(info) = &element.kind
            {
                let closes = pc
                    .checked_add(info.end_offset)
                    .and_then(|end| nodes.get(end))
                    .and_then(|end| self.element(end))
                    .is_some_and(|end| end.kind == ElementKind::GroupEnd);
                if info.end_offset == 0 || !closes {
                    return Err(Error::Malformed("GROUP does not point at its GROUP_END"));
                }
            }
        }
        Ok(())
    }

    /// Emit a Graphviz DOT representation of the automaton.
    pub fn to_dot(&self, mut buffer: impl Write) -> io::Result<()> {
        writeln!(buffer, "digraph automaton {{")?;
        writeln!(buffer, "\trankdir=LR;")?;
        writeln!(buffer, "\t0 [shape=box];")?;
        for (pc, node) in self.nodes().iter().enumerate() {
            let ty = self.element(node).map_or("?", |element| element.ty().as_str());
            writeln!(buffer, "\t// [{}] {} {:?}", pc, ty, node.kind)?;
            match &node.kind {
                NodeKind::Standard(transitions) => {
                    for (rank, transition) in transitions.iter().enumerate() {
                        let target = pc as isize + transition.offset;
                        match transition.on {
                            Some(c) => writeln!(
                                buffer,
                                "\t{} -> {} [label=\"{}\"];",
                                pc,
                                target,
                                c.escape_default()
                            )?,
                            None => writeln!(
                                buffer,
                                "\t{} -> {} [label=\"ε{}\" style=dashed];",
                                pc, target, rank
                            )?,
                        }
                    }
                }
                NodeKind::Set(class) => {
                    let label = self.classes[*class].to_string();
                    writeln!(
                        buffer,
                        "\t{} -> {} [label=\"{}\"];",
                        pc,
                        pc + 1,
                        label.escape_default()
                    )?;
                }
                NodeKind::AssertStart => writeln!(buffer, "\t{} -> {} [label=\"^\"];", pc, pc + 1)?,
                NodeKind::AssertEnd => writeln!(buffer, "\t{} -> {} [label=\"$\"];", pc, pc + 1)?,
                NodeKind::End => writeln!(buffer, "\t{} [peripheries=2];", pc)?,
            }
        }
        writeln!(buffer, "}}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
