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

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The platform refused a synthetic input event
    #[error("Failed to simulate input: {0}")]
    Simulate(String),

    /// The global input hook could not be installed
    #[error("Failed to listen for input: {0}")]
    Listen(String),

    #[error("Failed to capture screen: {0}")]
    Capture(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Template image not found: {}", .0.display())]
    TemplateMissing(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;
