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

//! Keyboard and mouse record/replay engine
//!
//! Input is recorded into line-oriented action files and replayed with
//! millisecond scheduling, optional resolution rescaling and relative mouse
//! motion. A template monitor can interrupt a replay and chain a restart
//! action before resuming.

pub mod context;
pub mod controller;
pub mod error;
pub mod hotkeys;
pub mod input;
pub mod logging;
pub mod monitor;
pub mod parser;
pub mod playback;
pub mod recorder;
pub mod screen;
pub mod timeline;
pub mod types;

pub use context::{RunContext, StopFlag};
pub use controller::{ControllerConfig, RunController, RunObserver, TracingObserver};
pub use error::{Error, Result};
pub use input::{InputSink, RdevSink};
pub use monitor::MonitorConfig;
pub use playback::{ReplayOutcome, Replayer};
pub use screen::{DisplayGeometry, ScreenGeometry};
pub use timeline::Timeline;
pub use types::{Record, ReplayParams, UiState};
