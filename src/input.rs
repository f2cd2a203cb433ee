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

//! Synthetic input injection
//!
//! Replay talks to the OS through [`InputSink`]. [`RdevSink`] is the real
//! backend; [`TrackedSink`] wraps any sink and remembers what is still held
//! so a final sweep can release it.

use rdev::{Button, EventType, Key};
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::types::MouseButton;

pub trait InputSink: Send + Sync {
    fn key_down(&self, vk: u32) -> Result<()>;
    fn key_up(&self, vk: u32) -> Result<()>;
    /// Warp the cursor to absolute screen pixels.
    fn move_to(&self, x: i32, y: i32) -> Result<()>;
    /// Nudge the pointer by a relative delta.
    fn move_by(&self, dx: i32, dy: i32) -> Result<()>;
    fn button_down(&self, button: MouseButton) -> Result<()>;
    fn button_up(&self, button: MouseButton) -> Result<()>;
    fn scroll(&self, dx: i64, dy: i64) -> Result<()>;
    /// Where the system cursor actually is, if the platform can tell.
    fn cursor_position(&self) -> Option<(i32, i32)>;
}

fn simulate(event: &EventType) -> Result<()> {
    rdev::simulate(event).map_err(|e| Error::Simulate(format!("{:?}", e)))
}

fn to_rdev_button(button: MouseButton) -> Button {
    match button {
        MouseButton::Left => Button::Left,
        MouseButton::Right => Button::Right,
    }
}

/// Injects input through rdev, with Win32 for relative motion and cursor
/// queries where available.
#[derive(Default)]
pub struct RdevSink {
    // Last absolute warp, used to emulate relative motion off Windows
    last_position: Mutex<Option<(i32, i32)>>,
}

impl RdevSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn remember(&self, x: i32, y: i32) {
        if let Ok(mut last) = self.last_position.lock() {
            *last = Some((x, y));
        }
    }
}

impl InputSink for RdevSink {
    fn key_down(&self, vk: u32) -> Result<()> {
        simulate(&EventType::KeyPress(vk_to_key(vk)))
    }

    fn key_up(&self, vk: u32) -> Result<()> {
        simulate(&EventType::KeyRelease(vk_to_key(vk)))
    }

    fn move_to(&self, x: i32, y: i32) -> Result<()> {
        simulate(&EventType::MouseMove {
            x: x as f64,
            y: y as f64,
        })?;
        self.remember(x, y);
        Ok(())
    }

    fn move_by(&self, dx: i32, dy: i32) -> Result<()> {
        #[cfg(target_os = "windows")]
        {
            send_relative_move(dx, dy)
        }

        #[cfg(not(target_os = "windows"))]
        {
            let last = self.last_position.lock().ok().and_then(|last| *last);
            let (x, y) = last.unwrap_or((0, 0));
            self.move_to(x + dx, y + dy)
        }
    }

    fn button_down(&self, button: MouseButton) -> Result<()> {
        simulate(&EventType::ButtonPress(to_rdev_button(button)))
    }

    fn button_up(&self, button: MouseButton) -> Result<()> {
        simulate(&EventType::ButtonRelease(to_rdev_button(button)))
    }

    fn scroll(&self, dx: i64, dy: i64) -> Result<()> {
        simulate(&EventType::Wheel {
            delta_x: dx,
            delta_y: dy,
        })
    }

    fn cursor_position(&self) -> Option<(i32, i32)> {
        #[cfg(target_os = "windows")]
        {
            query_cursor_position()
        }

        #[cfg(not(target_os = "windows"))]
        {
            None
        }
    }
}

#[cfg(target_os = "windows")]
fn send_relative_move(dx: i32, dy: i32) -> Result<()> {
    use windows::Win32::UI::Input::KeyboardAndMouse::{
        INPUT, INPUT_0, INPUT_MOUSE, MOUSEEVENTF_MOVE, MOUSEINPUT, SendInput,
    };

    unsafe {
        let input = INPUT {
            r#type: INPUT_MOUSE,
            Anonymous: INPUT_0 {
                mi: MOUSEINPUT {
                    dx,
                    dy,
                    mouseData: 0,
                    dwFlags: MOUSEEVENTF_MOVE,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        };
        let sent = SendInput(&[input], std::mem::size_of::<INPUT>() as i32);
        if sent == 0 {
            return Err(Error::Simulate("SendInput returned 0".to_string()));
        }
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn query_cursor_position() -> Option<(i32, i32)> {
    use windows::Win32::Foundation::POINT;
    use windows::Win32::UI::WindowsAndMessaging::GetCursorPos;

    let mut point = POINT::default();
    if unsafe { GetCursorPos(&mut point) }.is_ok() {
        Some((point.x, point.y))
    } else {
        None
    }
}

/// Something a sink can hold down and must later let go of.
pub trait Pressable: Copy + Eq + Hash {
    fn release(self, sink: &dyn InputSink) -> Result<()>;
}

impl Pressable for u32 {
    fn release(self, sink: &dyn InputSink) -> Result<()> {
        sink.key_up(self)
    }
}

impl Pressable for MouseButton {
    fn release(self, sink: &dyn InputSink) -> Result<()> {
        sink.button_up(self)
    }
}

/// Inputs one replay channel currently holds down.
///
/// Owned by a single channel. Whatever is still held is released on
/// [`Pressed::release_all`] and again on drop, so every exit path of a loop
/// lets go of its inputs.
pub struct Pressed<T: Pressable> {
    sink: Arc<dyn InputSink>,
    held: HashSet<T>,
}

pub type PressedKeys = Pressed<u32>;
pub type PressedButtons = Pressed<MouseButton>;

impl<T: Pressable> Pressed<T> {
    pub fn new(sink: Arc<dyn InputSink>) -> Self {
        Self {
            sink,
            held: HashSet::new(),
        }
    }

    pub fn mark_down(&mut self, item: T) {
        self.held.insert(item);
    }

    pub fn mark_up(&mut self, item: T) {
        self.held.remove(&item);
    }

    pub fn contains(&self, item: T) -> bool {
        self.held.contains(&item)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release everything still held. Returns how many releases were sent.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for item in self.held.drain() {
            if let Err(e) = item.release(self.sink.as_ref()) {
                tracing::warn!("Failed to release held input: {}", e);
            }
            released += 1;
        }
        released
    }
}

impl Pressed<u32> {
    pub fn press(&mut self, vk: u32) -> Result<()> {
        self.sink.key_down(vk)?;
        self.mark_down(vk);
        Ok(())
    }

    pub fn release(&mut self, vk: u32) -> Result<()> {
        self.mark_up(vk);
        self.sink.key_up(vk)
    }
}

impl Pressed<MouseButton> {
    pub fn press(&mut self, button: MouseButton) -> Result<()> {
        self.sink.button_down(button)?;
        self.mark_down(button);
        Ok(())
    }

    pub fn release(&mut self, button: MouseButton) -> Result<()> {
        self.mark_up(button);
        self.sink.button_up(button)
    }
}

impl<T: Pressable> Drop for Pressed<T> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Held {
    Key(u32),
    Button(MouseButton),
}

/// Sink wrapper that keeps a process-wide ledger of held inputs.
///
/// The run controller sweeps this ledger after every session, independent of
/// the channels' own cleanup.
pub struct TrackedSink {
    inner: Arc<dyn InputSink>,
    held: Mutex<HashSet<Held>>,
}

impl TrackedSink {
    pub fn new(inner: Arc<dyn InputSink>) -> Self {
        Self {
            inner,
            held: Mutex::new(HashSet::new()),
        }
    }

    fn note(&self, held: Held, down: bool) {
        if let Ok(mut set) = self.held.lock() {
            if down {
                set.insert(held);
            } else {
                set.remove(&held);
            }
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Release every input the ledger still considers held.
    pub fn release_all(&self) -> usize {
        let drained: Vec<Held> = match self.held.lock() {
            Ok(mut set) => set.drain().collect(),
            Err(_) => return 0,
        };
        for held in &drained {
            let result = match *held {
                Held::Key(vk) => self.inner.key_up(vk),
                Held::Button(button) => self.inner.button_up(button),
            };
            if let Err(e) = result {
                tracing::warn!("Safety release of {:?} failed: {}", held, e);
            }
        }
        if !drained.is_empty() {
            tracing::info!("Safety sweep released {} held input(s)", drained.len());
        }
        drained.len()
    }
}

impl InputSink for TrackedSink {
    fn key_down(&self, vk: u32) -> Result<()> {
        self.inner.key_down(vk)?;
        self.note(Held::Key(vk), true);
        Ok(())
    }

    fn key_up(&self, vk: u32) -> Result<()> {
        self.note(Held::Key(vk), false);
        self.inner.key_up(vk)
    }

    fn move_to(&self, x: i32, y: i32) -> Result<()> {
        self.inner.move_to(x, y)
    }

    fn move_by(&self, dx: i32, dy: i32) -> Result<()> {
        self.inner.move_by(dx, dy)
    }

    fn button_down(&self, button: MouseButton) -> Result<()> {
        self.inner.button_down(button)?;
        self.note(Held::Button(button), true);
        Ok(())
    }

    fn button_up(&self, button: MouseButton) -> Result<()> {
        self.note(Held::Button(button), false);
        self.inner.button_up(button)
    }

    fn scroll(&self, dx: i64, dy: i64) -> Result<()> {
        self.inner.scroll(dx, dy)
    }

    fn cursor_position(&self) -> Option<(i32, i32)> {
        self.inner.cursor_position()
    }
}

/// Windows virtual-key code for an rdev key, 0 when there is none.
pub fn key_to_vk(key: &Key) -> u32 {
    match key {
        Key::KeyA => 0x41,
        Key::KeyB => 0x42,
        Key::KeyC => 0x43,
        Key::KeyD => 0x44,
        Key::KeyE => 0x45,
        Key::KeyF => 0x46,
        Key::KeyG => 0x47,
        Key::KeyH => 0x48,
        Key::KeyI => 0x49,
        Key::KeyJ => 0x4A,
        Key::KeyK => 0x4B,
        Key::KeyL => 0x4C,
        Key::KeyM => 0x4D,
        Key::KeyN => 0x4E,
        Key::KeyO => 0x4F,
        Key::KeyP => 0x50,
        Key::KeyQ => 0x51,
        Key::KeyR => 0x52,
        Key::KeyS => 0x53,
        Key::KeyT => 0x54,
        Key::KeyU => 0x55,
        Key::KeyV => 0x56,
        Key::KeyW => 0x57,
        Key::KeyX => 0x58,
        Key::KeyY => 0x59,
        Key::KeyZ => 0x5A,
        Key::Num0 => 0x30,
        Key::Num1 => 0x31,
        Key::Num2 => 0x32,
        Key::Num3 => 0x33,
        Key::Num4 => 0x34,
        Key::Num5 => 0x35,
        Key::Num6 => 0x36,
        Key::Num7 => 0x37,
        Key::Num8 => 0x38,
        Key::Num9 => 0x39,
        Key::Kp0 => 0x60,
        Key::Kp1 => 0x61,
        Key::Kp2 => 0x62,
        Key::Kp3 => 0x63,
        Key::Kp4 => 0x64,
        Key::Kp5 => 0x65,
        Key::Kp6 => 0x66,
        Key::Kp7 => 0x67,
        Key::Kp8 => 0x68,
        Key::Kp9 => 0x69,
        Key::KpMultiply => 0x6A,
        Key::KpPlus => 0x6B,
        Key::KpMinus => 0x6D,
        Key::KpDivide => 0x6F,
        Key::Escape => 0x1B,
        Key::Backspace => 0x08,
        Key::Tab => 0x09,
        Key::Return => 0x0D,
        Key::Space => 0x20,
        Key::CapsLock => 0x14,
        Key::PrintScreen => 0x2C,
        Key::ScrollLock => 0x91,
        Key::Pause => 0x13,
        Key::NumLock => 0x90,
        Key::Insert => 0x2D,
        Key::Delete => 0x2E,
        Key::Home => 0x24,
        Key::End => 0x23,
        Key::PageUp => 0x21,
        Key::PageDown => 0x22,
        Key::LeftArrow => 0x25,
        Key::UpArrow => 0x26,
        Key::RightArrow => 0x27,
        Key::DownArrow => 0x28,
        Key::F1 => 0x70,
        Key::F2 => 0x71,
        Key::F3 => 0x72,
        Key::F4 => 0x73,
        Key::F5 => 0x74,
        Key::F6 => 0x75,
        Key::F7 => 0x76,
        Key::F8 => 0x77,
        Key::F9 => 0x78,
        Key::F10 => 0x79,
        Key::F11 => 0x7A,
        Key::F12 => 0x7B,
        Key::ShiftLeft => 0xA0,
        Key::ShiftRight => 0xA1,
        Key::ControlLeft => 0xA2,
        Key::ControlRight => 0xA3,
        Key::Alt => 0xA4,
        Key::AltGr => 0xA5,
        Key::MetaLeft => 0x5B,
        Key::MetaRight => 0x5C,
        Key::SemiColon => 0xBA,
        Key::Equal => 0xBB,
        Key::Comma => 0xBC,
        Key::Minus => 0xBD,
        Key::Dot => 0xBE,
        Key::Slash => 0xBF,
        Key::BackQuote => 0xC0,
        Key::LeftBracket => 0xDB,
        Key::BackSlash => 0xDC,
        Key::RightBracket => 0xDD,
        Key::Quote => 0xDE,
        Key::Unknown(code) => *code,
        _ => 0,
    }
}

/// rdev key for a Windows virtual-key code.
pub fn vk_to_key(vk: u32) -> Key {
    match vk {
        0x41 => Key::KeyA,
        0x42 => Key::KeyB,
        0x43 => Key::KeyC,
        0x44 => Key::KeyD,
        0x45 => Key::KeyE,
        0x46 => Key::KeyF,
        0x47 => Key::KeyG,
        0x48 => Key::KeyH,
        0x49 => Key::KeyI,
        0x4A => Key::KeyJ,
        0x4B => Key::KeyK,
        0x4C => Key::KeyL,
        0x4D => Key::KeyM,
        0x4E => Key::KeyN,
        0x4F => Key::KeyO,
        0x50 => Key::KeyP,
        0x51 => Key::KeyQ,
        0x52 => Key::KeyR,
        0x53 => Key::KeyS,
        0x54 => Key::KeyT,
        0x55 => Key::KeyU,
        0x56 => Key::KeyV,
        0x57 => Key::KeyW,
        0x58 => Key::KeyX,
        0x59 => Key::KeyY,
        0x5A => Key::KeyZ,
        0x30 => Key::Num0,
        0x31 => Key::Num1,
        0x32 => Key::Num2,
        0x33 => Key::Num3,
        0x34 => Key::Num4,
        0x35 => Key::Num5,
        0x36 => Key::Num6,
        0x37 => Key::Num7,
        0x38 => Key::Num8,
        0x39 => Key::Num9,
        0x60 => Key::Kp0,
        0x61 => Key::Kp1,
        0x62 => Key::Kp2,
        0x63 => Key::Kp3,
        0x64 => Key::Kp4,
        0x65 => Key::Kp5,
        0x66 => Key::Kp6,
        0x67 => Key::Kp7,
        0x68 => Key::Kp8,
        0x69 => Key::Kp9,
        0x6A => Key::KpMultiply,
        0x6B => Key::KpPlus,
        0x6D => Key::KpMinus,
        0x6F => Key::KpDivide,
        0x1B => Key::Escape,
        0x08 => Key::Backspace,
        0x09 => Key::Tab,
        0x0D => Key::Return,
        0x20 => Key::Space,
        0x14 => Key::CapsLock,
        0x2C => Key::PrintScreen,
        0x91 => Key::ScrollLock,
        0x13 => Key::Pause,
        0x90 => Key::NumLock,
        0x2D => Key::Insert,
        0x2E => Key::Delete,
        0x24 => Key::Home,
        0x23 => Key::End,
        0x21 => Key::PageUp,
        0x22 => Key::PageDown,
        0x25 => Key::LeftArrow,
        0x26 => Key::UpArrow,
        0x27 => Key::RightArrow,
        0x28 => Key::DownArrow,
        0x70 => Key::F1,
        0x71 => Key::F2,
        0x72 => Key::F3,
        0x73 => Key::F4,
        0x74 => Key::F5,
        0x75 => Key::F6,
        0x76 => Key::F7,
        0x77 => Key::F8,
        0x78 => Key::F9,
        0x79 => Key::F10,
        0x7A => Key::F11,
        0x7B => Key::F12,
        // Generic modifiers map onto the left-hand key
        0x10 | 0xA0 => Key::ShiftLeft,
        0xA1 => Key::ShiftRight,
        0x11 | 0xA2 => Key::ControlLeft,
        0xA3 => Key::ControlRight,
        0x12 | 0xA4 => Key::Alt,
        0xA5 => Key::AltGr,
        0x5B => Key::MetaLeft,
        0x5C => Key::MetaRight,
        0xBA => Key::SemiColon,
        0xBB => Key::Equal,
        0xBC => Key::Comma,
        0xBD => Key::Minus,
        0xBE => Key::Dot,
        0xBF => Key::Slash,
        0xC0 => Key::BackQuote,
        0xDB => Key::LeftBracket,
        0xDC => Key::BackSlash,
        0xDD => Key::RightBracket,
        0xDE => Key::Quote,
        other => Key::Unknown(other),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory sink for replay tests.

    use super::*;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Call {
        KeyDown(u32),
        KeyUp(u32),
        MoveTo(i32, i32),
        MoveBy(i32, i32),
        ButtonDown(MouseButton),
        ButtonUp(MouseButton),
        Scroll(i64, i64),
    }

    pub struct RecordingSink {
        calls: Mutex<Vec<(Instant, Call)>>,
        cursor: Mutex<Option<(i32, i32)>>,
        // When false, absolute warps are ignored like in exclusive-capture games
        honors_warps: bool,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                cursor: Mutex::new(Some((0, 0))),
                honors_warps: true,
            })
        }

        pub fn ignoring_warps() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                cursor: Mutex::new(Some((0, 0))),
                honors_warps: false,
            })
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().iter().map(|(_, c)| *c).collect()
        }

        pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: Call) {
            self.calls.lock().unwrap().push((Instant::now(), call));
        }
    }

    impl InputSink for RecordingSink {
        fn key_down(&self, vk: u32) -> Result<()> {
            self.push(Call::KeyDown(vk));
            Ok(())
        }

        fn key_up(&self, vk: u32) -> Result<()> {
            self.push(Call::KeyUp(vk));
            Ok(())
        }

        fn move_to(&self, x: i32, y: i32) -> Result<()> {
            self.push(Call::MoveTo(x, y));
            if self.honors_warps {
                *self.cursor.lock().unwrap() = Some((x, y));
            }
            Ok(())
        }

        fn move_by(&self, dx: i32, dy: i32) -> Result<()> {
            self.push(Call::MoveBy(dx, dy));
            Ok(())
        }

        fn button_down(&self, button: MouseButton) -> Result<()> {
            self.push(Call::ButtonDown(button));
            Ok(())
        }

        fn button_up(&self, button: MouseButton) -> Result<()> {
            self.push(Call::ButtonUp(button));
            Ok(())
        }

        fn scroll(&self, dx: i64, dy: i64) -> Result<()> {
            self.push(Call::Scroll(dx, dy));
            Ok(())
        }

        fn cursor_position(&self) -> Option<(i32, i32)> {
            *self.cursor.lock().unwrap()
        }
    }
}
