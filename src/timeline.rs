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

//! In-memory, timestamp-sorted view of an action file
//!
//! Built once per replay start and shared read-only by both dispatch
//! channels for every repeat.

use std::path::Path;
use std::time::Duration;

use crate::parser::{LegacyEvent, parse_legacy, parse_line};
use crate::types::{KeyAction, MouseButton, Normalized, Record};

/// Spacing given to legacy JSON events, which carry no timestamps.
pub const LEGACY_STEP_MS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub norm: Option<Normalized>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    Key {
        action: KeyAction,
        vk: u32,
    },
    Move(Position),
    Click {
        button: MouseButton,
        action: KeyAction,
        // Legacy clicks press wherever the cursor already is
        position: Option<Position>,
    },
    Scroll {
        dx: i64,
        dy: i64,
    },
}

impl Event {
    pub fn is_keyboard(&self) -> bool {
        matches!(self, Event::Key { .. })
    }

    pub fn is_mouse(&self) -> bool {
        !self.is_keyboard()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    pub at_ms: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<Entry>,
    /// Screen size at record time, from `META SCREEN`.
    pub recorded_screen: Option<(u32, u32)>,
    /// Per-file monitor timeout override, from `META RESTART`.
    pub restart_ms: Option<u64>,
    pub started: Option<String>,
}

impl Timeline {
    pub fn parse(text: &str) -> Self {
        let mut timeline = Timeline::default();
        let mut legacy_seq: u64 = 0;
        let mut skipped = 0usize;

        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event = match parse_line(line) {
                Record::Key(e) => Some((e.ms, Event::Key {
                    action: e.action,
                    vk: e.vk,
                })),
                Record::Move(e) => Some((e.ms, Event::Move(Position {
                    x: e.x,
                    y: e.y,
                    norm: e.norm.map(|p| p.value),
                }))),
                Record::Click(e) => Some((e.ms, Event::Click {
                    button: e.button,
                    action: e.action,
                    position: Some(Position {
                        x: e.x,
                        y: e.y,
                        norm: e.norm.map(|p| p.value),
                    }),
                })),
                Record::Scroll(e) => Some((e.ms, Event::Scroll { dx: e.dx, dy: e.dy })),
                Record::MetaScreen { width, height } => {
                    timeline.recorded_screen = Some((width, height));
                    None
                }
                Record::MetaRestart(ms) => {
                    timeline.restart_ms = Some(ms);
                    None
                }
                Record::MetaStart(stamp) => {
                    timeline.started = Some(stamp);
                    None
                }
                Record::Comment(_) => None,
                Record::Unknown { raw } => match parse_legacy(&raw) {
                    Some(LegacyEvent::Screen { width, height }) => {
                        timeline.recorded_screen = Some((width, height));
                        None
                    }
                    Some(legacy) => legacy_to_event(legacy).map(|event| {
                        let at = (legacy_seq * LEGACY_STEP_MS) as i64;
                        legacy_seq += 1;
                        (at, event)
                    }),
                    None => {
                        skipped += 1;
                        None
                    }
                },
            };

            if let Some((ms, event)) = event {
                timeline.entries.push(Entry {
                    at_ms: ms.max(0) as u64,
                    event,
                });
            }
        }

        // Hand-edited or concatenated files may be out of order; stable sort
        // keeps declaration order for equal timestamps
        timeline.entries.sort_by_key(|e| e.at_ms);

        if skipped > 0 {
            tracing::debug!("Skipped {} unparseable action line(s)", skipped);
        }
        timeline
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time of the last event; both channels end each loop here.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.entries.last().map(|e| e.at_ms).unwrap_or(0))
    }
}

fn legacy_to_event(legacy: LegacyEvent) -> Option<Event> {
    match legacy {
        LegacyEvent::Key { action, vk } => Some(Event::Key { action, vk }),
        LegacyEvent::Move { x, y } => Some(Event::Move(Position { x, y, norm: None })),
        LegacyEvent::Click { button, action } => Some(Event::Click {
            button,
            action,
            position: None,
        }),
        LegacyEvent::Scroll { dx, dy } => Some(Event::Scroll { dx, dy }),
        LegacyEvent::Screen { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extracts_meta_and_skips_dead_lines() {
        let text = "# inputcast action v1\nMETA SCREEN 2560 1440\nMETA START 20250101-000000\nMETA RESTART 60000\n\nK DOWN 65 10\nbogus\nM SCROLL 0 -1 20\n";
        let timeline = Timeline::parse(text);
        assert_eq!(timeline.recorded_screen, Some((2560, 1440)));
        assert_eq!(timeline.restart_ms, Some(60000));
        assert_eq!(timeline.started.as_deref(), Some("20250101-000000"));
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_out_of_order_lines_are_sorted() {
        let text = "K DOWN 65 500\nK UP 65 50\nM MOVE 1 1 120\nK DOWN 66 0\n";
        let timeline = Timeline::parse(text);
        let times: Vec<u64> = timeline.entries().iter().map(|e| e.at_ms).collect();
        assert_eq!(times, vec![0, 50, 120, 500]);
    }

    #[test]
    fn test_equal_timestamps_keep_file_order() {
        let text = "K DOWN 65 10\nK DOWN 66 10\nK UP 65 10\n";
        let timeline = Timeline::parse(text);
        let vks: Vec<u32> = timeline
            .entries()
            .iter()
            .map(|e| match e.event {
                Event::Key { vk, .. } => vk,
                _ => 0,
            })
            .collect();
        assert_eq!(vks, vec![65, 66, 65]);
    }

    #[test]
    fn test_legacy_lines_get_fixed_spacing() {
        let text = concat!(
            r#"{"name": "meta", "screen": {"w": 1280, "h": 720}}"#,
            "\n",
            r#"{"name": "keyboard", "event": "press", "vk": 65}"#,
            "\n",
            r#"{"name": "keyboard", "event": "release", "vk": 65}"#,
            "\n",
            r#"{"name": "mouse", "event": "click", "target": "left", "action": true}"#,
            "\n"
        );
        let timeline = Timeline::parse(text);
        assert_eq!(timeline.recorded_screen, Some((1280, 720)));
        let times: Vec<u64> = timeline.entries().iter().map(|e| e.at_ms).collect();
        assert_eq!(times, vec![0, LEGACY_STEP_MS, 2 * LEGACY_STEP_MS]);
        assert!(matches!(
            timeline.entries()[2].event,
            Event::Click { position: None, .. }
        ));
    }

    #[test]
    fn test_negative_timestamps_clamp_to_zero() {
        let timeline = Timeline::parse("K DOWN 65 -300\n");
        assert_eq!(timeline.entries()[0].at_ms, 0);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        assert!(Timeline::load(Path::new("/definitely/not/here.action")).is_err());
    }
}
