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

//! Template monitor
//!
//! Polls the screen, looks for a reference image with zero-mean normalized
//! cross-correlation and fires its stop and restart callbacks once the image
//! has been absent for longer than the configured timeout.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::context::StopFlag;
use crate::error::{Error, Result};
use crate::playback::wait_until_or_stop;

pub const MATCH_THRESHOLD: f32 = 0.8;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub template: PathBuf,
    /// Absence longer than this triggers stop + restart.
    pub timeout: Duration,
    pub interval: Duration,
    pub threshold: f32,
    /// Frames wider than this are downscaled before matching.
    pub max_frame_width: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            template: PathBuf::from("target.png"),
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(3),
            threshold: MATCH_THRESHOLD,
            max_frame_width: 480,
        }
    }
}

/// Where screen frames come from.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> Result<GrayImage>;
}

/// Captures the primary display.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScreenFrames;

impl FrameSource for ScreenFrames {
    fn capture(&self) -> Result<GrayImage> {
        let screen =
            screenshots::Screen::from_point(0, 0).map_err(|e| Error::Capture(e.to_string()))?;
        let rgba = screen
            .capture()
            .map_err(|e| Error::Capture(e.to_string()))?;
        Ok(DynamicImage::ImageRgba8(rgba).into_luma8())
    }
}

pub fn load_template(path: &Path) -> Result<GrayImage> {
    if !path.is_file() {
        return Err(Error::TemplateMissing(path.to_path_buf()));
    }
    Ok(image::open(path)?.into_luma8())
}

// Summed-area tables for window sums of values and squared values
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(values: &[f64], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0.0; stride * (height + 1)];
        let mut sq = vec![0.0; stride * (height + 1)];
        for y in 0..height {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..width {
                let v = values[y * width + x];
                row_sum += v;
                row_sq += v * v;
                let i = (y + 1) * stride + x + 1;
                sum[i] = sum[i - stride] + row_sum;
                sq[i] = sq[i - stride] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let a = y * self.stride + x;
        let b = a + w;
        let c = (y + h) * self.stride + x;
        let d = c + w;
        (
            self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
            self.sq[d] - self.sq[b] - self.sq[c] + self.sq[a],
        )
    }
}

/// Best zero-mean normalized cross-correlation of `template` over `frame`.
///
/// Scores range over [-1, 1]. Flat windows and flat templates score 0.
pub fn best_match(frame: &GrayImage, template: &GrayImage) -> f32 {
    let (fw, fh) = (frame.width() as usize, frame.height() as usize);
    let (tw, th) = (template.width() as usize, template.height() as usize);
    if tw == 0 || th == 0 || tw > fw || th > fh {
        return 0.0;
    }

    let n = (tw * th) as f64;
    let t: Vec<f64> = template.pixels().map(|p| p.0[0] as f64).collect();
    let t_mean = t.iter().sum::<f64>() / n;
    let t_centered: Vec<f64> = t.iter().map(|v| v - t_mean).collect();
    let t_energy: f64 = t_centered.iter().map(|v| v * v).sum();
    if t_energy <= f64::EPSILON {
        return 0.0;
    }

    let f: Vec<f64> = frame.pixels().map(|p| p.0[0] as f64).collect();
    let integral = Integral::new(&f, fw, fh);

    let mut best = 0.0f64;
    for y in 0..=(fh - th) {
        for x in 0..=(fw - tw) {
            let (s, s2) = integral.window(x, y, tw, th);
            let f_energy = s2 - s * s / n;
            if f_energy <= 1e-9 {
                continue;
            }
            // Template is zero-mean, so the window mean drops out
            let mut num = 0.0;
            for v in 0..th {
                let row = &f[(y + v) * fw + x..(y + v) * fw + x + tw];
                let trow = &t_centered[v * tw..(v + 1) * tw];
                num += row.iter().zip(trow).map(|(a, b)| a * b).sum::<f64>();
            }
            let score = num / (f_energy * t_energy).sqrt();
            if score > best {
                best = score;
            }
        }
    }
    best as f32
}

/// Downscale frame and template together so the frame is at most `max_width` wide.
pub fn match_score(frame: &GrayImage, template: &GrayImage, max_width: u32) -> f32 {
    if max_width == 0 || frame.width() <= max_width {
        return best_match(frame, template);
    }
    let scale = max_width as f64 / frame.width() as f64;
    let resize = |img: &GrayImage| {
        let w = ((img.width() as f64 * scale).round() as u32).max(1);
        let h = ((img.height() as f64 * scale).round() as u32).max(1);
        imageops::resize(img, w, h, FilterType::Triangle)
    };
    best_match(&resize(frame), &resize(template))
}

pub struct Monitor {
    config: MonitorConfig,
    frames: Arc<dyn FrameSource>,
    on_stop: Vec<Callback>,
    on_restart: Option<Callback>,
    on_hit: Option<Callback>,
    stop: StopFlag,
    task: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, frames: Arc<dyn FrameSource>) -> Self {
        Self {
            config,
            frames,
            on_stop: Vec::new(),
            on_restart: None,
            on_hit: None,
            stop: StopFlag::new(),
            task: None,
        }
    }

    pub fn on_stop(mut self, callback: Callback) -> Self {
        self.on_stop.push(callback);
        self
    }

    pub fn on_restart(mut self, callback: Callback) -> Self {
        self.on_restart = Some(callback);
        self
    }

    pub fn on_hit(mut self, callback: Callback) -> Self {
        self.on_hit = Some(callback);
        self
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start polling. Fails without spawning anything if the template can't
    /// be loaded.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let template = Arc::new(load_template(&self.config.template)?);
        self.stop.clear();
        tracing::info!(
            "Monitor watching for {} (timeout {:?}, every {:?})",
            self.config.template.display(),
            self.config.timeout,
            self.config.interval
        );
        let task = MonitorTask {
            config: self.config.clone(),
            template,
            frames: self.frames.clone(),
            on_stop: self.on_stop.clone(),
            on_restart: self.on_restart.clone(),
            on_hit: self.on_hit.clone(),
            stop: self.stop.clone(),
        };
        self.task = Some(tokio::spawn(task.run()));
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop.set();
        self.task = None;
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop.set();
    }
}

struct MonitorTask {
    config: MonitorConfig,
    template: Arc<GrayImage>,
    frames: Arc<dyn FrameSource>,
    on_stop: Vec<Callback>,
    on_restart: Option<Callback>,
    on_hit: Option<Callback>,
    stop: StopFlag,
}

impl MonitorTask {
    async fn poll_once(&self) -> Option<f32> {
        let frames = self.frames.clone();
        let template = self.template.clone();
        let max_width = self.config.max_frame_width;
        let result = tokio::task::spawn_blocking(move || {
            frames
                .capture()
                .map(|frame| match_score(&frame, &template, max_width))
        })
        .await;
        match result {
            Ok(Ok(score)) => Some(score),
            Ok(Err(e)) => {
                tracing::debug!("Monitor capture failed: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!("Monitor match task failed: {}", e);
                None
            }
        }
    }

    fn fire_timeout(&self) {
        tracing::info!(
            "Template absent for {:?}, stopping replay",
            self.config.timeout
        );
        for callback in &self.on_stop {
            callback();
        }
        if let Some(restart) = &self.on_restart {
            restart();
        }
    }

    async fn run(self) {
        let mut last_hit = Instant::now();
        while !self.stop.is_set() {
            if last_hit.elapsed() >= self.config.timeout {
                self.fire_timeout();
                last_hit = Instant::now();
            }

            if let Some(score) = self.poll_once().await {
                tracing::trace!("Monitor score {:.3}", score);
                if score >= self.config.threshold {
                    last_hit = Instant::now();
                    if let Some(hit) = &self.on_hit {
                        hit();
                    }
                }
            }

            let next = Instant::now() + self.config.interval;
            if !wait_until_or_stop(next, &self.stop).await {
                break;
            }
        }
        tracing::debug!("Monitor stopped");
    }
}
