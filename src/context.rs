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

//! Shared run state passed to every channel

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Cancellation flag shared between a channel and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Flags and counters for one recording or replay session.
///
/// Replay channels get their own stop flag each, though stop requests
/// normally set both.
#[derive(Debug, Default)]
pub struct RunContext {
    pub stop_keyboard: StopFlag,
    pub stop_mouse: StopFlag,
    pub stop_recording: StopFlag,
    infinite: AtomicBool,
    interrupted: AtomicBool,
    loops_total: AtomicU32,
    loops_done: AtomicU32,
}

impl RunContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reset flags and counters before a new replay.
    pub fn arm_replay(&self, repeat_count: u32, infinite: bool) {
        self.stop_keyboard.clear();
        self.stop_mouse.clear();
        self.interrupted.store(false, Ordering::SeqCst);
        self.infinite.store(infinite, Ordering::SeqCst);
        self.loops_total.store(repeat_count, Ordering::SeqCst);
        self.loops_done.store(0, Ordering::SeqCst);
    }

    pub fn stop_replay(&self) {
        self.stop_keyboard.set();
        self.stop_mouse.set();
    }

    /// Stop the replay early, counting the current loop as done.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.stop_replay();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn replay_stopped(&self) -> bool {
        self.stop_keyboard.is_set() && self.stop_mouse.is_set()
    }

    pub fn is_infinite(&self) -> bool {
        self.infinite.load(Ordering::SeqCst)
    }

    pub fn set_infinite(&self, infinite: bool) {
        self.infinite.store(infinite, Ordering::SeqCst);
    }

    pub fn loops_total(&self) -> u32 {
        self.loops_total.load(Ordering::SeqCst)
    }

    pub fn loops_done(&self) -> u32 {
        self.loops_done.load(Ordering::SeqCst)
    }

    pub fn record_loop_done(&self) -> u32 {
        self.loops_done.fetch_add(1, Ordering::SeqCst) + 1
    }
}
