//! Canonical 12-button controller input.
//!
//! Callers describe input either as a mapping of button names to pressed
//! state or as an ordered sequence of 12 booleans; [`normalize`] turns both
//! into an [`InputVector`]. Unknown button names are rejected rather than
//! silently ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InputError;

pub const BUTTON_COUNT: usize = 12;

const ALL_BUTTONS_MASK: u16 = (1 << BUTTON_COUNT) - 1;

/// Controller buttons in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Button {
    A,
    B,
    X,
    Y,
    L,
    R,
    Up,
    Down,
    Left,
    Right,
    Start,
    Select,
}

impl Button {
    pub const ALL: [Button; BUTTON_COUNT] = [
        Button::A,
        Button::B,
        Button::X,
        Button::Y,
        Button::L,
        Button::R,
        Button::Up,
        Button::Down,
        Button::Left,
        Button::Right,
        Button::Start,
        Button::Select,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Button::A => "A",
            Button::B => "B",
            Button::X => "X",
            Button::Y => "Y",
            Button::L => "L",
            Button::R => "R",
            Button::Up => "Up",
            Button::Down => "Down",
            Button::Left => "Left",
            Button::Right => "Right",
            Button::Start => "Start",
            Button::Select => "Select",
        }
    }

    /// Position in the canonical order.
    pub fn index(self) -> usize {
        self as usize
    }

    fn mask(self) -> u16 {
        1 << self.index()
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Button {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Button::ALL
            .iter()
            .copied()
            .find(|b| b.name() == s)
            .ok_or_else(|| InputError::UnknownButton(s.to_string()))
    }
}

/// Press state of all 12 buttons for one frame. Bit `i` is `Button::ALL[i]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputVector(u16);

impl InputVector {
    /// No buttons pressed.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Bits above the twelfth are discarded.
    pub fn from_bits(bits: u16) -> Self {
        Self(bits & ALL_BUTTONS_MASK)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn with(mut self, button: Button) -> Self {
        self.set(button, true);
        self
    }

    pub fn set(&mut self, button: Button, pressed: bool) {
        if pressed {
            self.0 |= button.mask();
        } else {
            self.0 &= !button.mask();
        }
    }

    pub fn is_pressed(self, button: Button) -> bool {
        self.0 & button.mask() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Pressed buttons in canonical order.
    pub fn pressed(self) -> impl Iterator<Item = Button> {
        Button::ALL.into_iter().filter(move |b| self.is_pressed(*b))
    }

    /// Build from exactly 12 booleans in canonical order.
    pub fn from_sequence(seq: &[bool]) -> Result<Self, InputError> {
        if seq.len() != BUTTON_COUNT {
            return Err(InputError::WrongLength {
                expected: BUTTON_COUNT,
                actual: seq.len(),
            });
        }
        Ok(Button::ALL
            .iter()
            .zip(seq)
            .filter(|(_, pressed)| **pressed)
            .map(|(b, _)| *b)
            .collect())
    }

    /// Build from a list of pressed button names, e.g. `["Right", "B"]`.
    pub fn from_names<I, S>(names: I) -> Result<Self, InputError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut input = Self::empty();
        for name in names {
            input.set(name.as_ref().parse()?, true);
        }
        Ok(input)
    }

    pub fn to_sequence(self) -> [bool; BUTTON_COUNT] {
        let mut seq = [false; BUTTON_COUNT];
        for b in self.pressed() {
            seq[b.index()] = true;
        }
        seq
    }
}

impl FromIterator<Button> for InputVector {
    fn from_iter<T: IntoIterator<Item = Button>>(iter: T) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl From<Button> for InputVector {
    fn from(button: Button) -> Self {
        Self::empty().with(button)
    }
}

impl fmt::Display for InputVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.pressed().map(Button::name).collect();
        f.write_str(&names.join("+"))
    }
}

/// Caller-facing input representation.
///
/// Deserializes from either `[true, false, ...]` (12 entries) or
/// `{"Right": true, "B": null}`. Absent keys and `null` mean "not pressed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    Sequence(Vec<bool>),
    Map(BTreeMap<String, Option<bool>>),
}

impl Action {
    /// Mapping form from `(name, pressed)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, bool)>,
        K: Into<String>,
    {
        Action::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v)))
                .collect(),
        )
    }

    pub fn normalize(&self) -> Result<InputVector, InputError> {
        match self {
            Action::Sequence(seq) => InputVector::from_sequence(seq),
            Action::Map(map) => {
                let mut input = InputVector::empty();
                for (name, pressed) in map {
                    let button: Button = name.parse()?;
                    input.set(button, pressed.unwrap_or(false));
                }
                Ok(input)
            }
        }
    }
}

impl From<InputVector> for Action {
    fn from(input: InputVector) -> Self {
        Action::from_pairs(input.pressed().map(|b| (b.name(), true)))
    }
}

/// `None` is "no input".
pub fn normalize(action: Option<&Action>) -> Result<InputVector, InputError> {
    action.map_or(Ok(InputVector::empty()), Action::normalize)
}
