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

//! Display dimensions for normalizing and rescaling coordinates

pub const FALLBACK_SCREEN_SIZE: (u32, u32) = (1920, 1080);

pub trait ScreenGeometry: Send + Sync {
    /// Current primary display size in pixels. Must not fail.
    fn screen_size(&self) -> (u32, u32);
}

/// Queries the primary display through rdev.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisplayGeometry;

impl ScreenGeometry for DisplayGeometry {
    fn screen_size(&self) -> (u32, u32) {
        match rdev::display_size() {
            Ok((w, h)) if w > 0 && h > 0 => (w as u32, h as u32),
            Ok(_) => FALLBACK_SCREEN_SIZE,
            Err(e) => {
                tracing::warn!("Display size unavailable ({:?}), assuming 1920x1080", e);
                FALLBACK_SCREEN_SIZE
            }
        }
    }
}

/// A display of known size, for headless runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedGeometry(pub u32, pub u32);

impl ScreenGeometry for FixedGeometry {
    fn screen_size(&self) -> (u32, u32) {
        (self.0, self.1)
    }
}
