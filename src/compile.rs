//! Pattern source → [`Automaton`].
//!
//! The pattern is parsed with `regex_syntax::ast` and lowered directly from
//! the AST: the trace reports source positions, and only the AST keeps a
//! span for every construct.  Each lowering function documents the node
//! layout it emits.

use indexmap::IndexSet;
use regex_syntax::ast::{self, Ast};
use regex_syntax::ast::parse::ParserBuilder;

use crate::Error;
use crate::automaton::{
    Automaton, CharClass, ClassIdx, Element, ElementIdx, ElementKind, GroupInfo, Node, NodeKind,
    Repeat, RepeatKind, Span, Transition,
};

/// Parse and compile `pattern` with a fresh [`AutomatonBuilder`].
pub fn compile(pattern: &str) -> Result<Automaton, Error> {
    AutomatonBuilder::default().build(pattern)
}

/// Builds an [`Automaton`] from a pattern string.
///
/// The builder can be reused; every [`build`](Self::build) starts from
/// scratch.
#[derive(Debug, Default)]
pub struct AutomatonBuilder {
    nodes: Vec<Node>,
    elements: Vec<Element>,
    /// Deduplicated character classes; indices are stored in
    /// [`NodeKind::Set`].
    classes: IndexSet<CharClass>,
    /// Byte offset in the pattern → character offset.
    char_offsets: Vec<usize>,
}

impl AutomatonBuilder {
    pub fn build(&mut self, pattern: &str) -> Result<Automaton, Error> {
        let ast = ParserBuilder::new()
            .build()
            .parse(pattern)
            .map_err(Error::Parse)?;
        self.build_ast(pattern, &ast)
    }

    /// Compile an already parsed AST.  `pattern` must be the text `ast` was
    /// parsed from.
    pub fn build_ast(&mut self, pattern: &str, ast: &Ast) -> Result<Automaton, Error> {
        self.reset(pattern);
        let len = self.char_offsets[pattern.len()];

        self.push(
            NodeKind::Standard(Box::new([Transition::epsilon(1)])),
            ElementKind::Root,
            Span::new(0, len),
        )?;
        self.lower(ast)?;
        self.push(NodeKind::End, ElementKind::End, Span::new(len, len))?;

        let classes = std::mem::take(&mut self.classes).into_iter().collect();
        Automaton::from_parts(
            std::mem::take(&mut self.nodes),
            std::mem::take(&mut self.elements),
            classes,
        )
    }

    fn reset(&mut self, pattern: &str) {
        self.nodes.clear();
        self.elements.clear();
        self.classes.clear();
        self.char_offsets.clear();
        self.char_offsets.resize(pattern.len() + 1, 0);
        let mut chars = 0;
        for (byte, c) in pattern.char_indices() {
            for offset in &mut self.char_offsets[byte..byte + c.len_utf8()] {
                *offset = chars;
            }
            chars += 1;
        }
        self.char_offsets[pattern.len()] = chars;
    }

    /// Convert a `regex-syntax` byte span into a character span.
    fn span(&self, span: &ast::Span) -> Span {
        Span::new(
            self.char_offsets[span.start.offset],
            self.char_offsets[span.end.offset],
        )
    }

    /// Append a node with its own element and return its program counter.
    fn push(&mut self, kind: NodeKind, element: ElementKind, span: Span) -> Result<usize, Error> {
        if self.nodes.len() >= u32::MAX as usize || self.elements.len() >= u32::MAX as usize {
            return Err(Error::TooLarge);
        }
        let idx = ElementIdx(self.elements.len() as u32);
        self.elements.push(Element::new(element, span));
        let pc = self.nodes.len();
        self.nodes.push(Node::new(kind, Some(idx)));
        Ok(pc)
    }

    fn intern_class(&mut self, class: CharClass) -> Result<ClassIdx, Error> {
        let (idx, _) = self.classes.insert_full(class);
        u32::try_from(idx).map(ClassIdx).map_err(|_| Error::TooLarge)
    }

    fn set(&mut self, class: CharClass, element: ElementKind, span: Span) -> Result<(), Error> {
        let class = self.intern_class(class)?;
        self.push(NodeKind::Set(class), element, span)?;
        Ok(())
    }

    /// Replace the transitions of an already pushed placeholder node.
    fn patch(&mut self, pc: usize, transitions: Vec<Transition>) {
        self.nodes[pc].kind = NodeKind::Standard(transitions.into_boxed_slice());
    }

    /// Lower one AST node, appending its nodes to the automaton.
    fn lower(&mut self, ast: &Ast) -> Result<(), Error> {
        match ast {
            Ast::Empty(_) => Ok(()),
            Ast::Flags(flags) => Err(Error::UnsupportedFlags(self.span(&flags.span))),
            Ast::Literal(literal) => {
                let span = self.span(&literal.span);
                self.push(
                    NodeKind::Standard(Box::new([Transition::consume(literal.c, 1)])),
                    ElementKind::Primitive(literal.c),
                    span,
                )?;
                Ok(())
            }
            Ast::Dot(span) => {
                let span = self.span(span);
                self.set(CharClass::any(), ElementKind::Any, span)
            }
            Ast::Assertion(assertion) => {
                let span = self.span(&assertion.span);
                let (kind, element) = match assertion.kind {
                    ast::AssertionKind::StartLine | ast::AssertionKind::StartText => {
                        (NodeKind::AssertStart, ElementKind::StartString)
                    }
                    ast::AssertionKind::EndLine | ast::AssertionKind::EndText => {
                        (NodeKind::AssertEnd, ElementKind::EndString)
                    }
                    _ => return Err(Error::UnsupportedAssertion(span)),
                };
                self.push(kind, element, span)?;
                Ok(())
            }
            Ast::ClassUnicode(class) => Err(Error::UnsupportedClass(self.span(&class.span))),
            Ast::ClassPerl(class) => {
                let span = self.span(&class.span);
                self.set(perl_class(class), ElementKind::Special, span)
            }
            Ast::ClassBracketed(class) => {
                let span = self.span(&class.span);
                let set = self.bracketed(class)?;
                let element = if class.negated {
                    ElementKind::NegatedList
                } else {
                    ElementKind::List
                };
                self.set(set, element, span)
            }
            Ast::Repetition(repetition) => self.repetition(repetition),
            Ast::Group(group) => self.group(group),
            Ast::Alternation(alternation) => self.alternation(alternation),
            Ast::Concat(concat) => {
                for ast in &concat.asts {
                    self.lower(ast)?;
                }
                Ok(())
            }
        }
    }

    /// ```text
    /// OPTION      [(ε,→b₁), (ε,→b₂), …]
    /// b₁ …        OPTION_END [(ε,→after)]
    /// b₂ …        OPTION_END [(ε,→after)]
    /// ```
    fn alternation(&mut self, alternation: &ast::Alternation) -> Result<(), Error> {
        let branches: Box<[Span]> = alternation
            .asts
            .iter()
            .map(|branch| self.span(branch.span()))
            .collect();
        let span = self.span(&alternation.span);
        let option = self.push(
            NodeKind::Standard(Box::default()),
            ElementKind::Option {
                branches: branches.clone(),
            },
            span,
        )?;

        let mut starts = Vec::with_capacity(branches.len());
        let mut ends = Vec::with_capacity(branches.len());
        for (branch, span) in alternation.asts.iter().zip(branches.iter()) {
            starts.push(self.nodes.len());
            self.lower(branch)?;
            ends.push(self.push(NodeKind::Standard(Box::default()), ElementKind::OptionEnd, *span)?);
        }

        let after = self.nodes.len();
        let enter = starts
            .iter()
            .map(|&start| Transition::epsilon((start - option) as isize))
            .collect();
        self.patch(option, enter);
        for end in ends {
            self.patch(end, vec![Transition::epsilon((after - end) as isize)]);
        }
        Ok(())
    }

    /// ```text
    /// GROUP      [(ε,+1)]
    /// body …
    /// GROUP_END  [(ε,+1)]
    /// ```
    fn group(&mut self, group: &ast::Group) -> Result<(), Error> {
        let span = self.span(&group.span);
        let (index, name) = match &group.kind {
            ast::GroupKind::CaptureIndex(index) => (Some(*index), None),
            ast::GroupKind::CaptureName { name, .. } => (Some(name.index), Some(name.name.clone())),
            ast::GroupKind::NonCapturing(flags) => {
                if !flags.items.is_empty() {
                    return Err(Error::UnsupportedFlags(self.span(&flags.span)));
                }
                (None, None)
            }
        };

        let open = self.push(
            NodeKind::Standard(Box::new([Transition::epsilon(1)])),
            ElementKind::Group(GroupInfo {
                index,
                name,
                end_offset: 0,
            }),
            span,
        )?;
        self.lower(&group.ast)?;
        let close = self.push(
            NodeKind::Standard(Box::new([Transition::epsilon(1)])),
            ElementKind::GroupEnd,
            Span::new(span.end.saturating_sub(1), span.end),
        )?;

        if let Some(idx) = self.nodes[open].element
            && let ElementKind::Group(info) = &mut self.elements[idx.0 as usize].kind
        {
            info.end_offset = close - open;
        }
        Ok(())
    }

    /// Greedy layout, `b` body nodes:
    ///
    /// ```text
    /// ITERATION_*    [(ε,+1), (ε,+b+2)]   skip only when min == 0
    /// body …
    /// ITERATION_END  [(ε,-b), (ε,+1)]
    /// ```
    ///
    /// A lazy repetition tries the same transitions in reverse order.
    fn repetition(&mut self, repetition: &ast::Repetition) -> Result<(), Error> {
        use ast::{RepetitionKind, RepetitionRange};

        let (kind, min, max) = match &repetition.op.kind {
            RepetitionKind::ZeroOrMore => (RepeatKind::Zero, 0, None),
            RepetitionKind::OneOrMore => (RepeatKind::One, 1, None),
            RepetitionKind::ZeroOrOne => (RepeatKind::Range, 0, Some(1)),
            RepetitionKind::Range(RepetitionRange::Exactly(n)) => (RepeatKind::Range, *n, Some(*n)),
            RepetitionKind::Range(RepetitionRange::AtLeast(n)) => (RepeatKind::Range, *n, None),
            RepetitionKind::Range(RepetitionRange::Bounded(m, n)) => {
                (RepeatKind::Range, *m, Some(*n))
            }
        };
        let repeat = Repeat {
            kind,
            min,
            max,
            greedy: repetition.greedy,
        };

        let span = self.span(&repetition.span);
        let entry = self.push(
            NodeKind::Standard(Box::default()),
            ElementKind::Iteration(repeat),
            span,
        )?;
        self.lower(&repetition.ast)?;
        let body = self.nodes.len() - entry - 1;
        if body == 0 {
            return Err(Error::Malformed("repetition of an empty expression"));
        }
        let op_span = self.span(&repetition.op.span);
        let exit = self.push(
            NodeKind::Standard(Box::default()),
            ElementKind::IterationEnd,
            op_span,
        )?;

        let mut enter = vec![Transition::epsilon(1)];
        if min == 0 {
            enter.push(Transition::epsilon(body as isize + 2));
        }
        let mut close = vec![Transition::epsilon(-(body as isize)), Transition::epsilon(1)];
        if !repeat.greedy {
            enter.reverse();
            close.reverse();
        }
        self.patch(entry, enter);
        self.patch(exit, close);
        Ok(())
    }

    fn bracketed(&self, class: &ast::ClassBracketed) -> Result<CharClass, Error> {
        let set = match &class.kind {
            ast::ClassSet::Item(item) => self.class_item(item)?,
            ast::ClassSet::BinaryOp(op) => return Err(Error::UnsupportedClass(self.span(&op.span))),
        };
        Ok(if class.negated { set.negate() } else { set })
    }

    fn class_item(&self, item: &ast::ClassSetItem) -> Result<CharClass, Error> {
        use ast::ClassSetItem;

        Ok(match item {
            ClassSetItem::Empty(_) => CharClass::default(),
            ClassSetItem::Literal(literal) => CharClass::new([(literal.c, literal.c)]),
            ClassSetItem::Range(range) => CharClass::new([(range.start.c, range.end.c)]),
            ClassSetItem::Perl(perl) => perl_class(perl),
            ClassSetItem::Bracketed(inner) => self.bracketed(inner)?,
            ClassSetItem::Union(union) => {
                let mut class = CharClass::default();
                for item in &union.items {
                    class.union(&self.class_item(item)?);
                }
                class
            }
            ClassSetItem::Ascii(ascii) => return Err(Error::UnsupportedClass(self.span(&ascii.span))),
            ClassSetItem::Unicode(unicode) => {
                return Err(Error::UnsupportedClass(self.span(&unicode.span)));
            }
        })
    }
}

fn perl_class(perl: &ast::ClassPerl) -> CharClass {
    let class = match perl.kind {
        ast::ClassPerlKind::Digit => CharClass::digit(),
        ast::ClassPerlKind::Space => CharClass::space(),
        ast::ClassPerlKind::Word => CharClass::word(),
    };
    if perl.negated { class.negate() } else { class }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
