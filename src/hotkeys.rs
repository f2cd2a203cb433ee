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

//! Operator hotkeys: F10 toggles recording, F11 toggles replay, ESC stops

use rdev::EventType;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

use crate::input::key_to_vk;
use crate::recorder::{HookHub, HookSubscription};

pub const VK_ESCAPE: u32 = 0x1B;
pub const VK_F10: u32 = 0x79;
pub const VK_F11: u32 = 0x7A;

/// Keys that drive the tool and are never written into recordings.
pub const CONTROL_KEYS: [u32; 3] = [VK_ESCAPE, VK_F10, VK_F11];

pub const DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotkeyAction {
    ToggleRecord,
    ToggleReplay,
    Stop,
}

impl HotkeyAction {
    pub fn for_vk(vk: u32) -> Option<Self> {
        match vk {
            VK_F10 => Some(HotkeyAction::ToggleRecord),
            VK_F11 => Some(HotkeyAction::ToggleReplay),
            VK_ESCAPE => Some(HotkeyAction::Stop),
            _ => None,
        }
    }
}

/// Drops toggles that repeat within the window. Stop is never debounced.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: HashMap<HotkeyAction, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    pub fn accept(&mut self, action: HotkeyAction, now: Instant) -> bool {
        if action == HotkeyAction::Stop {
            return true;
        }
        match self.last.get(&action) {
            Some(prev) if now.saturating_duration_since(*prev) <= self.window => false,
            _ => {
                self.last.insert(action, now);
                true
            }
        }
    }
}

/// Installed hotkey listener; dropping it removes the hook subscription.
pub struct Hotkeys {
    _subscription: HookSubscription,
}

impl Hotkeys {
    pub fn install(hub: &Arc<HookHub>, actions: UnboundedSender<HotkeyAction>) -> Self {
        let debouncer = Mutex::new(Debouncer::new(DEBOUNCE));
        let subscription = hub.subscribe(move |event| {
            let EventType::KeyPress(key) = event else {
                return;
            };
            let Some(action) = HotkeyAction::for_vk(key_to_vk(key)) else {
                return;
            };
            let accepted = debouncer
                .lock()
                .map(|mut d| d.accept(action, Instant::now()))
                .unwrap_or(false);
            if accepted {
                tracing::debug!("Hotkey {:?}", action);
                // Receiver gone means the session is shutting down
                let _ = actions.send(action);
            }
        });
        Self {
            _subscription: subscription,
        }
    }
}
