//! Behavioral flags shared by the matcher and the trace builder.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single behavioral flag.  The discriminant is the bit used by the
/// numeric wire encoding ([`MatchFlags::bits`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Flag {
    /// Collapse a run of backtracking steps to the nearest unexplored
    /// decision.
    ShortenBacktracking = 0x1,
    /// Record where a collapsed backtrack run started (`fromExact`).
    BacktrackedFromExact = 0x2,
    IgnoreGroupEnters = 0x4,
    IgnoreGroupLeaves = 0x8,
    IgnoreOptionLeaves = 0x10,
    IgnoreOptionEnters = 0x20,
    /// Collapse a retained backtrack step's `regAt` to its start.
    BacktrackTrimPosition = 0x40,
    /// Add a SHOWCASE step highlighting the alternative being tried.
    OptionEntersShowActive = 0x80,
    /// Do not record FORWARD_START steps.
    IgnoreStrStartPositionChange = 0x100,
    /// Add a step the first time an alternation is entered.
    OptionShowFirstEnter = 0x200,
    /// A backtrack into an alternation keeps its exact origin.
    OptionNoErrorReturn = 0x400,
    /// Drop steps identical to the previous one.
    RemoveStatesWoEffect = 0x800,
    /// Attach the visible captures to every step.
    AddGroupsToStates = 0x1000,
}

impl Flag {
    pub const ALL: [Flag; 13] = [
        Flag::ShortenBacktracking,
        Flag::BacktrackedFromExact,
        Flag::IgnoreGroupEnters,
        Flag::IgnoreGroupLeaves,
        Flag::IgnoreOptionLeaves,
        Flag::IgnoreOptionEnters,
        Flag::BacktrackTrimPosition,
        Flag::OptionEntersShowActive,
        Flag::IgnoreStrStartPositionChange,
        Flag::OptionShowFirstEnter,
        Flag::OptionNoErrorReturn,
        Flag::RemoveStatesWoEffect,
        Flag::AddGroupsToStates,
    ];

    pub fn bit(self) -> u32 {
        self as u32
    }

    /// Kebab-case name, as accepted on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Flag::ShortenBacktracking => "shorten-backtracking",
            Flag::BacktrackedFromExact => "backtracked-from-exact",
            Flag::IgnoreGroupEnters => "ignore-group-enters",
            Flag::IgnoreGroupLeaves => "ignore-group-leaves",
            Flag::IgnoreOptionLeaves => "ignore-option-leaves",
            Flag::IgnoreOptionEnters => "ignore-option-enters",
            Flag::BacktrackTrimPosition => "backtrack-trim-position",
            Flag::OptionEntersShowActive => "option-enters-show-active",
            Flag::IgnoreStrStartPositionChange => "ignore-str-start-position-change",
            Flag::OptionShowFirstEnter => "option-show-first-enter",
            Flag::OptionNoErrorReturn => "option-no-error-return",
            Flag::RemoveStatesWoEffect => "remove-states-wo-effect",
            Flag::AddGroupsToStates => "add-groups-to-states",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when parsing an unknown flag name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownFlag(pub String);

impl fmt::Display for UnknownFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown flag `{}`", self.0)
    }
}

impl std::error::Error for UnknownFlag {}

impl FromStr for Flag {
    type Err = UnknownFlag;

    /// Accepts `shorten-backtracking` as well as `SHORTEN_BACKTRACKING`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Flag::ALL
            .into_iter()
            .find(|flag| flag.name() == normalized)
            .ok_or_else(|| UnknownFlag(s.to_string()))
    }
}

/// The full flag set.  Every flag defaults to off.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchFlags {
    pub shorten_backtracking: bool,
    pub backtracked_from_exact: bool,
    pub ignore_group_enters: bool,
    pub ignore_group_leaves: bool,
    pub ignore_option_leaves: bool,
    pub ignore_option_enters: bool,
    pub backtrack_trim_position: bool,
    pub option_enters_show_active: bool,
    pub ignore_str_start_position_change: bool,
    pub option_show_first_enter: bool,
    pub option_no_error_return: bool,
    pub remove_states_wo_effect: bool,
    pub add_groups_to_states: bool,
}

impl MatchFlags {
    fn slot(&mut self, flag: Flag) -> &mut bool {
        match flag {
            Flag::ShortenBacktracking => &mut self.shorten_backtracking,
            Flag::BacktrackedFromExact => &mut self.backtracked_from_exact,
            Flag::IgnoreGroupEnters => &mut self.ignore_group_enters,
            Flag::IgnoreGroupLeaves => &mut self.ignore_group_leaves,
            Flag::IgnoreOptionLeaves => &mut self.ignore_option_leaves,
            Flag::IgnoreOptionEnters => &mut self.ignore_option_enters,
            Flag::BacktrackTrimPosition => &mut self.backtrack_trim_position,
            Flag::OptionEntersShowActive => &mut self.option_enters_show_active,
            Flag::IgnoreStrStartPositionChange => &mut self.ignore_str_start_position_change,
            Flag::OptionShowFirstEnter => &mut self.option_show_first_enter,
            Flag::OptionNoErrorReturn => &mut self.option_no_error_return,
            Flag::RemoveStatesWoEffect => &mut self.remove_states_wo_effect,
            Flag::AddGroupsToStates => &mut self.add_groups_to_states,
        }
    }

    pub fn get(&self, flag: Flag) -> bool {
        match flag {
            Flag::ShortenBacktracking => self.shorten_backtracking,
            Flag::BacktrackedFromExact => self.backtracked_from_exact,
            Flag::IgnoreGroupEnters => self.ignore_group_enters,
            Flag::IgnoreGroupLeaves => self.ignore_group_leaves,
            Flag::IgnoreOptionLeaves => self.ignore_option_leaves,
            Flag::IgnoreOptionEnters => self.ignore_option_enters,
            Flag::BacktrackTrimPosition => self.backtrack_trim_position,
            Flag::OptionEntersShowActive => self.option_enters_show_active,
            Flag::IgnoreStrStartPositionChange => self.ignore_str_start_position_change,
            Flag::OptionShowFirstEnter => self.option_show_first_enter,
            Flag::OptionNoErrorReturn => self.option_no_error_return,
            Flag::RemoveStatesWoEffect => self.remove_states_wo_effect,
            Flag::AddGroupsToStates => self.add_groups_to_states,
        }
    }

    pub fn set(&mut self, flag: Flag, on: bool) {
        *self.slot(flag) = on;
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, flag: Flag) -> Self {
        self.set(flag, true);
        self
    }

    /// Decode the numeric encoding.  Unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        let mut flags = Self::default();
        for flag in Flag::ALL {
            flags.set(flag, bits & flag.bit() != 0);
        }
        flags
    }

    pub fn bits(&self) -> u32 {
        Flag::ALL
            .into_iter()
            .filter(|&flag| self.get(flag))
            .fold(0, |bits, flag| bits | flag.bit())
    }

    pub fn iter(&self) -> impl Iterator<Item = Flag> + '_ {
        Flag::ALL.into_iter().filter(|&flag| self.get(flag))
    }
}

impl FromIterator<Flag> for MatchFlags {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), MatchFlags::with)
    }
}

/// Everything a caller configures for a match run, loadable from JSON:
///
/// ```json
/// { "flags": { "shorten_backtracking": true }, "batch_size": 500 }
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchOptions {
    pub flags: MatchFlags,
    /// Steps per batch; `None` returns the whole trace at once.
    pub batch_size: Option<NonZeroUsize>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
