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

//! Line codec for action files
//!
//! One record per line, whitespace-delimited tokens:
//! - `# ...` comments
//! - `META SCREEN <w> <h>`, `META START <stamp>`, `META RESTART <ms>`
//! - `K <DOWN|UP> <vk> <ms>`
//! - `M MOVE <x> <y> [<nx> <ny>] <ms>`
//! - `M CLICK <left|right> <DOWN|UP> <x> <y> [<nx> <ny>] <ms>`
//! - `M SCROLL <dx> <dy> <ms>`
//!
//! Parsing never fails: anything unrecognised becomes [`Record::Unknown`]
//! carrying the original text.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::tag,
    character::complete::{not_line_ending, space1},
    combinator::{consumed, value},
};
use serde::Deserialize;

use crate::types::{
    ClickEvent, KeyAction, KeyEvent, MoveEvent, MouseButton, NormPair, Normalized, Record,
    ScrollEvent,
};

// Token counts for mouse lines carrying the optional normalized pair
const MOVE_TOKENS_NORMALIZED: usize = 7;
const CLICK_TOKENS_NORMALIZED: usize = 9;

fn parse_key_action(input: &str) -> IResult<&str, KeyAction> {
    alt((
        value(KeyAction::Down, tag("DOWN")),
        value(KeyAction::Up, tag("UP")),
    ))
    .parse(input)
}

fn parse_button(input: &str) -> IResult<&str, MouseButton> {
    alt((
        value(MouseButton::Left, tag("left")),
        value(MouseButton::Right, tag("right")),
    ))
    .parse(input)
}

fn parse_ms(input: &str) -> IResult<&str, i64> {
    let (input, _) = space1(input)?;
    nom::character::complete::i64(input)
}

fn parse_point(input: &str) -> IResult<&str, (i32, i32)> {
    let (input, _) = space1(input)?;
    let (input, x) = nom::character::complete::i32(input)?;
    let (input, _) = space1(input)?;
    let (input, y) = nom::character::complete::i32(input)?;
    Ok((input, (x, y)))
}

fn parse_normalized(input: &str) -> IResult<&str, NormPair> {
    let (input, _) = space1(input)?;
    let (input, (nx_text, nx)) = consumed(nom::number::complete::double).parse(input)?;
    let (input, _) = space1(input)?;
    let (input, (ny_text, ny)) = consumed(nom::number::complete::double).parse(input)?;
    Ok((input, NormPair::parsed(Normalized { nx, ny }, nx_text, ny_text)))
}

fn parse_meta_screen(input: &str) -> IResult<&str, Record> {
    let (input, _) = tag("SCREEN")(input)?;
    let (input, _) = space1(input)?;
    let (input, width) = nom::character::complete::u32(input)?;
    let (input, _) = space1(input)?;
    let (input, height) = nom::character::complete::u32(input)?;
    Ok((input, Record::MetaScreen { width, height }))
}

fn parse_meta_start(input: &str) -> IResult<&str, Record> {
    let (input, _) = tag("START")(input)?;
    let (input, _) = space1(input)?;
    let (input, stamp) = not_line_ending(input)?;
    Ok((input, Record::MetaStart(stamp.trim().to_string())))
}

fn parse_meta_restart(input: &str) -> IResult<&str, Record> {
    let (input, _) = tag("RESTART")(input)?;
    let (input, _) = space1(input)?;
    let (input, ms) = nom::character::complete::u64(input)?;
    Ok((input, Record::MetaRestart(ms)))
}

fn parse_meta(input: &str) -> IResult<&str, Record> {
    let (input, _) = tag("META")(input)?;
    let (input, _) = space1(input)?;
    alt((parse_meta_screen, parse_meta_start, parse_meta_restart)).parse(input)
}

fn parse_key(input: &str) -> IResult<&str, Record> {
    let (input, _) = tag("K")(input)?;
    let (input, _) = space1(input)?;
    let (input, action) = parse_key_action(input)?;
    let (input, _) = space1(input)?;
    let (input, vk) = nom::character::complete::u32(input)?;
    let (input, ms) = parse_ms(input)?;
    Ok((input, Record::Key(KeyEvent { action, vk, ms })))
}

fn parse_move(input: &str, tokens: usize) -> IResult<&str, Record> {
    let (input, _) = tag("MOVE")(input)?;
    let (input, (x, y)) = parse_point(input)?;
    let (input, norm) = if tokens == MOVE_TOKENS_NORMALIZED {
        let (input, norm) = parse_normalized(input)?;
        (input, Some(norm))
    } else {
        (input, None)
    };
    let (input, ms) = parse_ms(input)?;
    Ok((input, Record::Move(MoveEvent { x, y, norm, ms })))
}

fn parse_click(input: &str, tokens: usize) -> IResult<&str, Record> {
    let (input, _) = tag("CLICK")(input)?;
    let (input, _) = space1(input)?;
    let (input, button) = parse_button(input)?;
    let (input, _) = space1(input)?;
    let (input, action) = parse_key_action(input)?;
    let (input, (x, y)) = parse_point(input)?;
    let (input, norm) = if tokens == CLICK_TOKENS_NORMALIZED {
        let (input, norm) = parse_normalized(input)?;
        (input, Some(norm))
    } else {
        (input, None)
    };
    let (input, ms) = parse_ms(input)?;
    Ok((
        input,
        Record::Click(ClickEvent {
            button,
            action,
            x,
            y,
            norm,
            ms,
        }),
    ))
}

fn parse_scroll(input: &str) -> IResult<&str, Record> {
    let (input, _) = tag("SCROLL")(input)?;
    let (input, _) = space1(input)?;
    let (input, dx) = nom::character::complete::i64(input)?;
    let (input, _) = space1(input)?;
    let (input, dy) = nom::character::complete::i64(input)?;
    let (input, ms) = parse_ms(input)?;
    Ok((input, Record::Scroll(ScrollEvent { dx, dy, ms })))
}

fn parse_mouse(input: &str) -> IResult<&str, Record> {
    // The optional normalized pair is detected by token count, not by shape
    let tokens = input.split_whitespace().count();
    let (input, _) = tag("M")(input)?;
    let (input, _) = space1(input)?;
    if let Ok(parsed) = parse_move(input, tokens) {
        return Ok(parsed);
    }
    if let Ok(parsed) = parse_click(input, tokens) {
        return Ok(parsed);
    }
    parse_scroll(input)
}

fn parse_record(input: &str) -> IResult<&str, Record> {
    alt((parse_meta, parse_key, parse_mouse)).parse(input)
}

/// Parses one line of an action file. Never fails.
pub fn parse_line(line: &str) -> Record {
    let raw = line.trim_end_matches(['\r', '\n']);
    let trimmed = raw.trim();

    if trimmed.starts_with('#') {
        return Record::Comment(raw.to_string());
    }

    match parse_record(trimmed) {
        Ok((remaining, record)) if remaining.trim().is_empty() => record,
        _ => Record::Unknown {
            raw: raw.to_string(),
        },
    }
}

fn format_normalized(norm: &Option<NormPair>) -> String {
    match norm {
        Some(pair) => match pair.text() {
            Some((nx, ny)) => format!(" {} {}", nx, ny),
            None => format!(" {:.6} {:.6}", pair.value.nx, pair.value.ny),
        },
        None => String::new(),
    }
}

/// Serializes a record back into its line form (without newline).
pub fn serialize(record: &Record) -> String {
    match record {
        Record::Key(e) => format!("K {} {} {}", e.action.as_str(), e.vk, e.ms),
        Record::Move(e) => format!(
            "M MOVE {} {}{} {}",
            e.x,
            e.y,
            format_normalized(&e.norm),
            e.ms
        ),
        Record::Click(e) => format!(
            "M CLICK {} {} {} {}{} {}",
            e.button.as_str(),
            e.action.as_str(),
            e.x,
            e.y,
            format_normalized(&e.norm),
            e.ms
        ),
        Record::Scroll(e) => format!("M SCROLL {} {} {}", e.dx, e.dy, e.ms),
        Record::MetaScreen { width, height } => format!("META SCREEN {} {}", width, height),
        Record::MetaStart(stamp) => format!("META START {}", stamp),
        Record::MetaRestart(ms) => format!("META RESTART {}", ms),
        Record::Comment(raw) => raw.clone(),
        Record::Unknown { raw } => raw.clone(),
    }
}

/// Event decoded from the older one-JSON-object-per-line format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LegacyEvent {
    Key { action: KeyAction, vk: u32 },
    Move { x: i32, y: i32 },
    Click { button: MouseButton, action: KeyAction },
    Scroll { dx: i64, dy: i64 },
    Screen { width: u32, height: u32 },
}

#[derive(Deserialize)]
struct LegacyPoint {
    x: f64,
    y: f64,
}

#[derive(Deserialize)]
struct LegacyScreen {
    w: u32,
    h: u32,
}

#[derive(Deserialize)]
struct LegacyLine {
    name: String,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    vk: Option<u32>,
    #[serde(default)]
    location: Option<LegacyPoint>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    action: Option<bool>,
    #[serde(default)]
    screen: Option<LegacyScreen>,
}

/// Decodes a legacy JSON line, `None` when it is not one.
pub fn parse_legacy(line: &str) -> Option<LegacyEvent> {
    let obj: LegacyLine = serde_json::from_str(line.trim()).ok()?;

    match (obj.name.as_str(), obj.event.as_deref()) {
        ("meta", _) => obj.screen.map(|s| LegacyEvent::Screen {
            width: s.w,
            height: s.h,
        }),
        ("keyboard", Some("press")) => obj.vk.map(|vk| LegacyEvent::Key {
            action: KeyAction::Down,
            vk,
        }),
        ("keyboard", Some("release")) => obj.vk.map(|vk| LegacyEvent::Key {
            action: KeyAction::Up,
            vk,
        }),
        ("mouse", Some("move")) => obj.location.map(|p| LegacyEvent::Move {
            x: p.x as i32,
            y: p.y as i32,
        }),
        ("mouse", Some("click")) => {
            let button = match obj.target.as_deref() {
                Some("right") => MouseButton::Right,
                _ => MouseButton::Left,
            };
            let action = if obj.action? {
                KeyAction::Down
            } else {
                KeyAction::Up
            };
            Some(LegacyEvent::Click { button, action })
        }
        ("mouse", Some("scroll")) => obj.location.map(|p| LegacyEvent::Scroll {
            dx: p.x as i64,
            dy: p.y as i64,
        }),
        _ => None,
    }
}

/// Shifts the timestamp of every event line by `offset_ms`.
///
/// Comments, META lines and anything unparseable pass through untouched.
/// Shifted timestamps clamp at zero.
pub fn offset_timestamps(input: &str, offset_ms: i64) -> String {
    let mut out = String::with_capacity(input.len());

    for line in input.lines() {
        let mut record = parse_line(line);
        match record.ms() {
            Some(ms) => {
                record.set_ms(ms.saturating_add(offset_ms).max(0));
                out.push_str(&serialize(&record));
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(line: &str) {
        let record = parse_line(line);
        assert!(
            !matches!(record, Record::Unknown { .. }),
            "line did not parse: {}",
            line
        );
        assert_eq!(serialize(&record), line);
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(
            parse_line("K DOWN 65 120"),
            Record::Key(KeyEvent {
                action: KeyAction::Down,
                vk: 65,
                ms: 120
            })
        );
    }

    #[test]
    fn test_parse_move_with_and_without_normalized() {
        match parse_line("M MOVE 960 540 0.500000 0.500000 33") {
            Record::Move(m) => {
                assert_eq!((m.x, m.y, m.ms), (960, 540, 33));
                assert_eq!(m.norm.map(|p| p.value), Some(Normalized { nx: 0.5, ny: 0.5 }));
            }
            other => panic!("Expected move, got {:?}", other),
        }
        match parse_line("M MOVE 960 540 33") {
            Record::Move(m) => {
                assert_eq!((m.x, m.y, m.ms), (960, 540, 33));
                assert!(m.norm.is_none());
            }
            other => panic!("Expected move, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_click_with_normalized() {
        match parse_line("M CLICK right UP -10 20 0.000000 0.018519 900") {
            Record::Click(c) => {
                assert_eq!(c.button, MouseButton::Right);
                assert_eq!(c.action, KeyAction::Up);
                assert_eq!((c.x, c.y, c.ms), (-10, 20, 900));
                assert!(c.norm.is_some());
            }
            other => panic!("Expected click, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_meta() {
        assert_eq!(
            parse_line("META SCREEN 2560 1440"),
            Record::MetaScreen {
                width: 2560,
                height: 1440
            }
        );
        assert_eq!(
            parse_line("META START 20251124-153808"),
            Record::MetaStart("20251124-153808".to_string())
        );
        assert_eq!(parse_line("META RESTART 90000"), Record::MetaRestart(90000));
    }

    #[test]
    fn test_round_trip_every_kind() {
        let lines = [
            "# inputcast action v1",
            "META SCREEN 1920 1080",
            "META START 20250101-120000",
            "META RESTART 45000",
            "K DOWN 65 0",
            "K UP 160 1250",
            "M MOVE 100 200 120",
            "M MOVE 100 200 0.052083 0.185185 120",
            "M CLICK left DOWN 5 7 300",
            "M CLICK right UP 1919 1079 0.999479 0.999074 301",
            "M SCROLL 0 -1 450",
        ];
        for line in lines {
            round_trip(line);
        }
    }

    #[test]
    fn test_round_trip_generated_lines() {
        let (w, h) = (1920u32, 1080u32);
        for i in 0..200i64 {
            let x = ((i * 37) % w as i64) as i32;
            let y = ((i * 91) % h as i64) as i32;
            let nx = x as f64 / w as f64;
            let ny = y as f64 / h as f64;
            let ms = i * 17;
            round_trip(&format!("K {} {} {}", if i % 2 == 0 { "DOWN" } else { "UP" }, i % 255, ms));
            round_trip(&format!("M MOVE {} {} {:.6} {:.6} {}", x, y, nx, ny, ms));
            round_trip(&format!("M MOVE {} {} {}", x, y, ms));
            round_trip(&format!(
                "M CLICK {} {} {} {} {:.6} {:.6} {}",
                if i % 3 == 0 { "right" } else { "left" },
                if i % 2 == 0 { "DOWN" } else { "UP" },
                x,
                y,
                nx,
                ny,
                ms
            ));
            round_trip(&format!("M SCROLL {} {} {}", i % 5 - 2, i % 3 - 1, ms));
        }
        for (nx, ny) in [("0.5", "0.25"), ("1", "0"), ("0.1234567", "0.05"), ("5e-1", "0.75")] {
            round_trip(&format!("M MOVE 100 200 {} {} 10", nx, ny));
            round_trip(&format!("M CLICK left UP 100 200 {} {} 10", nx, ny));
        }
    }

    #[test]
    fn test_short_normalized_pair_keeps_its_text() {
        match parse_line("M MOVE 100 200 0.5 0.25 10") {
            Record::Move(m) => {
                let pair = m.norm.unwrap();
                assert_eq!(pair.value, Normalized { nx: 0.5, ny: 0.25 });
                assert_eq!(pair.text(), Some(("0.5", "0.25")));
            }
            other => panic!("Expected move, got {:?}", other),
        }
        let built = NormPair::from(Normalized { nx: 0.5, ny: 0.25 });
        assert_eq!(built.text(), None);
        assert_eq!(format_normalized(&Some(built)), " 0.500000 0.250000");
    }

    #[test]
    fn test_trailing_whitespace_is_ignored() {
        assert_eq!(serialize(&parse_line("K UP 13 77   \r\n")), "K UP 13 77");
    }

    #[test]
    fn test_malformed_lines_are_inert() {
        for line in [
            "",
            "K",
            "K DOWN",
            "K SIDEWAYS 65 10",
            "M MOVE 10",
            "M MOVE 10 20 0.5 30",
            "M CLICK middle DOWN 1 2 3",
            "M TELEPORT 1 2 3",
            "META SCREEN wide tall",
            "META",
            "K DOWN 65 10 extra",
            "garbage line",
        ] {
            assert_eq!(
                parse_line(line),
                Record::Unknown {
                    raw: line.to_string()
                },
                "line: {:?}",
                line
            );
        }
    }

    #[test]
    fn test_unknown_lines_round_trip_verbatim() {
        let line = "something the editor left behind";
        assert_eq!(serialize(&parse_line(line)), line);
    }

    #[test]
    fn test_mutated_record_serializes_for_new_op() {
        let record = parse_line("M MOVE 10 20 0.100000 0.200000 55");
        let line = serialize(&record.with_mouse_op(crate::types::MouseOp::Scroll));
        assert_eq!(line, "M SCROLL 0 0 55");
        assert!(parse_line(&line).is_event());

        let record = parse_line("M MOVE 10 20 0.100000 0.200000 55");
        let line = serialize(&record.with_mouse_op(crate::types::MouseOp::Click));
        assert_eq!(line, "M CLICK left DOWN 10 20 0.100000 0.200000 55");
        assert!(parse_line(&line).is_event());
    }

    #[test]
    fn test_parse_legacy() {
        assert_eq!(
            parse_legacy(r#"{"name": "keyboard", "event": "press", "vk": 65}"#),
            Some(LegacyEvent::Key {
                action: KeyAction::Down,
                vk: 65
            })
        );
        assert_eq!(
            parse_legacy(r#"{"name": "mouse", "event": "move", "location": {"x": 10, "y": 20}}"#),
            Some(LegacyEvent::Move { x: 10, y: 20 })
        );
        assert_eq!(
            parse_legacy(
                r#"{"name": "mouse", "event": "click", "target": "right", "action": false, "location": {"x": 1, "y": 2}}"#
            ),
            Some(LegacyEvent::Click {
                button: MouseButton::Right,
                action: KeyAction::Up
            })
        );
        assert_eq!(
            parse_legacy(r#"{"name": "meta", "screen": {"w": 1280, "h": 720}}"#),
            Some(LegacyEvent::Screen {
                width: 1280,
                height: 720
            })
        );
        assert_eq!(parse_legacy("K DOWN 65 0"), None);
        assert_eq!(parse_legacy(r#"{"name": "gamepad"}"#), None);
    }

    #[test]
    fn test_offset_timestamps() {
        let input = "# header\nMETA SCREEN 1920 1080\nMETA RESTART 5000\nK DOWN 65 100\nM MOVE 1 2 2000\nM CLICK left DOWN 1 2 0.5 1 2100\nnot a record\n";
        let out = offset_timestamps(input, -500);
        assert_eq!(
            out,
            "# header\nMETA SCREEN 1920 1080\nMETA RESTART 5000\nK DOWN 65 0\nM MOVE 1 2 1500\nM CLICK left DOWN 1 2 0.5 1 1600\nnot a record\n"
        );
    }
}
