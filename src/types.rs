// Copyright (C) 2025  Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Core types for action files and replay runs

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAction {
    Down,
    Up,
}

impl KeyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyAction::Down => "DOWN",
            KeyAction::Up => "UP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
}

impl MouseButton {
    pub fn as_str(self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
        }
    }
}

/// Position as a fraction of the recording-time screen size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalized {
    pub nx: f64,
    pub ny: f64,
}

impl Normalized {
    /// Returns `None` when the screen size would divide by zero.
    pub fn from_pixels(x: i32, y: i32, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            nx: x as f64 / width as f64,
            ny: y as f64 / height as f64,
        })
    }
}

/// The optional pair on a mouse line.
///
/// Pairs read from a file keep their token text and are written back
/// unchanged. Pairs built from pixels are written with 6 decimals.
#[derive(Debug, Clone, PartialEq)]
pub struct NormPair {
    pub value: Normalized,
    text: Option<(String, String)>,
}

impl NormPair {
    pub fn parsed(value: Normalized, nx: &str, ny: &str) -> Self {
        Self {
            value,
            text: Some((nx.to_string(), ny.to_string())),
        }
    }

    /// Source tokens, `None` for pairs that never came from a file.
    pub fn text(&self) -> Option<(&str, &str)> {
        self.text.as_ref().map(|(nx, ny)| (nx.as_str(), ny.as_str()))
    }
}

impl From<Normalized> for NormPair {
    fn from(value: Normalized) -> Self {
        Self { value, text: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub action: KeyAction,
    pub vk: u32,
    pub ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveEvent {
    pub x: i32,
    pub y: i32,
    pub norm: Option<NormPair>,
    pub ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClickEvent {
    pub button: MouseButton,
    pub action: KeyAction,
    pub x: i32,
    pub y: i32,
    pub norm: Option<NormPair>,
    pub ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollEvent {
    pub dx: i64,
    pub dy: i64,
    pub ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseOp {
    Move,
    Click,
    Scroll,
}

/// One line of an action file.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Key(KeyEvent),
    Move(MoveEvent),
    Click(ClickEvent),
    Scroll(ScrollEvent),
    MetaScreen { width: u32, height: u32 },
    MetaStart(String),
    MetaRestart(u64),
    // Raw text including the leading '#'
    Comment(String),
    // Anything else, kept verbatim so editors can round-trip it
    Unknown { raw: String },
}

impl Record {
    /// Timestamp of an input event, `None` for comments and metadata.
    pub fn ms(&self) -> Option<i64> {
        match self {
            Record::Key(e) => Some(e.ms),
            Record::Move(e) => Some(e.ms),
            Record::Click(e) => Some(e.ms),
            Record::Scroll(e) => Some(e.ms),
            _ => None,
        }
    }

    pub fn set_ms(&mut self, ms: i64) {
        match self {
            Record::Key(e) => e.ms = ms,
            Record::Move(e) => e.ms = ms,
            Record::Click(e) => e.ms = ms,
            Record::Scroll(e) => e.ms = ms,
            _ => {}
        }
    }

    pub fn is_event(&self) -> bool {
        self.ms().is_some()
    }

    /// Converts a mouse record into another mouse op.
    ///
    /// Position, normalized pair and timestamp carry over where the target op
    /// has them; fields the target lacks are dropped and new ones take neutral
    /// defaults (left button, DOWN, zero scroll). Non-mouse records are
    /// returned unchanged.
    pub fn with_mouse_op(self, op: MouseOp) -> Record {
        let (x, y, norm, ms) = match &self {
            Record::Move(e) => (e.x, e.y, e.norm.clone(), e.ms),
            Record::Click(e) => (e.x, e.y, e.norm.clone(), e.ms),
            Record::Scroll(e) => (0, 0, None, e.ms),
            _ => return self,
        };
        match op {
            MouseOp::Move => Record::Move(MoveEvent { x, y, norm, ms }),
            MouseOp::Click => {
                let (button, action) = match &self {
                    Record::Click(e) => (e.button, e.action),
                    _ => (MouseButton::Left, KeyAction::Down),
                };
                Record::Click(ClickEvent {
                    button,
                    action,
                    x,
                    y,
                    norm,
                    ms,
                })
            }
            MouseOp::Scroll => {
                let (dx, dy) = match &self {
                    Record::Scroll(e) => (e.dx, e.dy),
                    _ => (0, 0),
                };
                Record::Scroll(ScrollEvent { dx, dy, ms })
            }
        }
    }
}

/// What the lifecycle reports to the outer UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiState {
    Idle,
    Recording,
    Replaying,
}

impl fmt::Display for UiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UiState::Idle => "idle",
            UiState::Recording => "recording",
            UiState::Replaying => "replaying",
        };
        f.write_str(s)
    }
}

/// Parameters for one replay run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayParams {
    pub action_file: PathBuf,
    // At least 1; ignored while `infinite` is set
    pub repeat_count: u32,
    pub infinite: bool,
    pub use_relative_mouse: bool,
    // Multiplier applied to recorded deltas in relative mode
    pub relative_gain: f64,
    pub relative_auto_detect: bool,
}

impl Default for ReplayParams {
    fn default() -> Self {
        Self {
            action_file: PathBuf::new(),
            repeat_count: 1,
            infinite: false,
            use_relative_mouse: false,
            relative_gain: 1.0,
            relative_auto_detect: true,
        }
    }
}

impl ReplayParams {
    pub fn for_file(action_file: impl Into<PathBuf>) -> Self {
        Self {
            action_file: action_file.into(),
            ..Self::default()
        }
    }

    /// Clamps values the UI layer may hand over out of range.
    pub fn sanitized(mut self) -> Self {
        self.repeat_count = self.repeat_count.max(1);
        if !(self.relative_gain.is_finite() && self.relative_gain > 0.0) {
            self.relative_gain = 1.0;
        }
        self
    }
}
