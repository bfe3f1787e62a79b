//! Read-side navigation over a trace.
//!
//! A [`MatchCursor`] wraps the [`MatchData`] of one session and a position
//! in its step list.  The position may rest one step before the first
//! (`-1`) or one past the last (`len`); there is no step there and the
//! accessors return `None`.  Batches can be appended while navigating.

use crate::trace::{BatchData, Groups, MatchData, MatchState};

#[derive(Clone, Debug, Default)]
pub struct MatchCursor {
    data: MatchData,
    at: isize,
}

impl MatchCursor {
    pub fn new(data: MatchData) -> Self {
        Self { data, at: 0 }
    }

    /// Append a batch.  The step count follows the batch's running total.
    pub fn add_batch(&mut self, batch: BatchData) {
        self.data.states_count = batch.match_current_size;
        self.data.states.extend(batch.match_states);
    }

    /// Take over the header of a terminal response: start, end, step count,
    /// success and groups.  Steps are left alone.
    pub fn change_match_information(&mut self, data: &MatchData) {
        self.data.start = data.start;
        self.data.end = data.end;
        self.data.states_count = data.states_count;
        self.data.success = data.success;
        self.data.groups = data.groups.clone();
    }

    pub fn at(&self) -> isize {
        self.at
    }

    fn get(&self, index: isize) -> Option<&MatchState> {
        if index < 0 || index >= self.len() {
            return None;
        }
        self.data.states.get(index as usize)
    }

    fn len(&self) -> isize {
        self.data.states_count as isize
    }

    pub fn move_forward(&mut self, steps: usize) -> Option<&MatchState> {
        self.at = self.at.saturating_add_unsigned(steps).min(self.len());
        self.get(self.at)
    }

    pub fn move_backward(&mut self, steps: usize) -> Option<&MatchState> {
        self.at = self.at.saturating_sub_unsigned(steps).max(-1);
        self.get(self.at)
    }

    pub fn move_to(&mut self, index: isize) -> Option<&MatchState> {
        self.at = index.clamp(-1, self.len());
        self.get(self.at)
    }

    pub fn current_state(&self) -> Option<&MatchState> {
        self.get(self.at)
    }

    pub fn next_state(&self) -> Option<&MatchState> {
        self.get(self.at + 1)
    }

    pub fn before_state(&self) -> Option<&MatchState> {
        self.get(self.at - 1)
    }

    pub fn success(&self) -> bool {
        self.data.success
    }

    pub fn start(&self) -> Option<usize> {
        self.data.start
    }

    pub fn end(&self) -> Option<usize> {
        self.data.end
    }

    /// Total number of steps, counting those not received yet.
    pub fn states_len(&self) -> usize {
        self.data.states_count
    }

    pub fn states(&self) -> &[MatchState] {
        &self.data.states
    }

    pub fn groups(&self) -> Option<&Groups> {
        self.data.groups.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    use super::*;
    use crate::automaton::ElementType;
    use crate::flags::MatchFlags;
    use crate::session::{Matcher, ResponseData};

    fn data(len: usize) -> MatchData {
        let states: Vec<MatchState> = (0..len)
            .map(|i| MatchState::new(ElementType::Primitive, [i, i + 1], [0, i]))
            .collect();
        MatchData {
            states_count: states.len(),
            states,
            ..MatchData::default()
        }
    }

    #[test]
    fn test_navigation_clamps() {
        let mut cursor = MatchCursor::new(data(3));
        assert_eq!(cursor.current_state().map(|s| s.reg_at), Some([0, 1]));
        assert_eq!(cursor.before_state(), None);
        assert_eq!(cursor.next_state().map(|s| s.reg_at), Some([1, 2]));

        assert_eq!(cursor.move_forward(2).map(|s| s.reg_at), Some([2, 3]));
        assert_eq!(cursor.move_forward(10), None);
        assert_eq!(cursor.at(), 3);
        assert_eq!(cursor.before_state().map(|s| s.reg_at), Some([2, 3]));

        assert_eq!(cursor.move_backward(1).map(|s| s.reg_at), Some([2, 3]));
        assert_eq!(cursor.move_backward(100), None);
        assert_eq!(cursor.at(), -1);
        assert_eq!(cursor.next_state().map(|s| s.reg_at), Some([0, 1]));

        assert_eq!(cursor.move_to(1).map(|s| s.reg_at), Some([1, 2]));
        assert_eq!(cursor.move_to(-7), None);
        assert_eq!(cursor.at(), -1);
        assert_eq!(cursor.move_to(99), None);
        assert_eq!(cursor.at(), 3);
    }

    #[test]
    fn test_empty_cursor() {
        let mut cursor = MatchCursor::default();
        assert_eq!(cursor.current_state(), None);
        assert_eq!(cursor.move_forward(1), None);
        assert_eq!(cursor.at(), 0);
        assert_eq!(cursor.move_backward(1), None);
        assert_eq!(cursor.at(), -1);
        assert!(!cursor.success());
    }

    #[test]
    fn test_follows_a_batched_session() {
        let automaton = crate::compile("(a|b)+c").unwrap();
        let mut matcher = Matcher::new(Arc::new(automaton), MatchFlags::default());
        let mut cursor = MatchCursor::default();
        let mut response = matcher.match_string("xabbc", NonZeroUsize::new(2));
        loop {
            match response.data {
                ResponseData::Batch(batch) => {
                    cursor.add_batch(batch);
                    assert!(cursor.states().len() <= cursor.states_len());
                }
                ResponseData::Success(data) => {
                    cursor.change_match_information(&data);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
            response = matcher.next_batch(response.session).unwrap();
        }
        assert!(cursor.success());
        assert_eq!((cursor.start(), cursor.end()), (Some(1), Some(5)));
        assert_eq!(cursor.states().len(), cursor.states_len());
        assert_eq!(cursor.groups().map(|groups| groups[&1].str_at), Some([3, 4]));

        let last = cursor.move_to(cursor.states_len() as isize - 1).unwrap();
        assert_eq!(last.ty, ElementType::Root);
        assert_eq!(last.str_at, [1, 5]);
    }
}
