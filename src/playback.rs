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

//! Playback engine for action files
//!
//! A keyboard channel and a mouse channel each walk the same sorted timeline
//! against a fresh monotonic anchor per loop. Both channels end every loop at
//! the timeline's duration, so they stay on one time cursor across repeats.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use crate::context::{RunContext, StopFlag};
use crate::controller::RunObserver;
use crate::input::{InputSink, PressedButtons, PressedKeys};
use crate::screen::ScreenGeometry;
use crate::timeline::{Event, Position, Timeline};
use crate::types::{KeyAction, ReplayParams};

/// Longest stretch a waiting channel goes without checking its stop flag.
pub const POLL_QUANTUM: Duration = Duration::from_millis(10);

/// Relative size change below which recorded pixels are used as-is.
pub const RESCALE_TOLERANCE: f64 = 0.02;

/// How close the cursor must land for absolute warps to count as working.
pub const PROBE_TOLERANCE_PX: i32 = 2;

/// Wait until `deadline` unless `stop` fires first.
///
/// Returns `true` when the deadline was reached, `false` when stopped.
pub async fn wait_until_or_stop(deadline: Instant, stop: &StopFlag) -> bool {
    loop {
        if stop.is_set() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        sleep((deadline - now).min(POLL_QUANTUM)).await;
    }
}

/// Maps recorded coordinates onto the current screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    recorded: (u32, u32),
    current: (u32, u32),
}

impl Rescale {
    /// Without a recorded size the current one is assumed.
    pub fn new(recorded: Option<(u32, u32)>, current: (u32, u32)) -> Self {
        Self {
            recorded: recorded.unwrap_or(current),
            current,
        }
    }

    pub fn differs(&self) -> bool {
        let (rw, rh) = self.recorded;
        let (cw, ch) = self.current;
        if rw == 0 || rh == 0 {
            return false;
        }
        let dw = (cw as f64 - rw as f64).abs() / rw as f64;
        let dh = (ch as f64 - rh as f64).abs() / rh as f64;
        dw > RESCALE_TOLERANCE || dh > RESCALE_TOLERANCE
    }

    pub fn target(&self, pos: &Position) -> (i32, i32) {
        match pos.norm {
            Some(n) if self.differs() => {
                let (cw, ch) = self.current;
                (
                    (n.nx * cw as f64).round() as i32,
                    (n.ny * ch as f64).round() as i32,
                )
            }
            _ => (pos.x, pos.y),
        }
    }
}

/// Turns recorded absolute positions into scaled relative deltas.
///
/// The fractional part of each scaled delta is carried into the next one, so
/// rounding never loses net displacement.
#[derive(Debug, Clone)]
pub struct RelativeMotion {
    gain: f64,
    last_raw: Option<(i32, i32)>,
    residual: (f64, f64),
}

impl RelativeMotion {
    pub fn new(gain: f64) -> Self {
        Self {
            gain,
            last_raw: None,
            residual: (0.0, 0.0),
        }
    }

    /// Forget the previous position; the next step only seeds it.
    pub fn reset_anchor(&mut self) {
        self.last_raw = None;
    }

    pub fn step(&mut self, x: i32, y: i32) -> Option<(i32, i32)> {
        let (px, py) = self.last_raw.replace((x, y))?;
        let fx = (x - px) as f64 * self.gain + self.residual.0;
        let fy = (y - py) as f64 * self.gain + self.residual.1;
        let (dx, dy) = (fx.round(), fy.round());
        self.residual = (fx - dx, fy - dy);
        Some((dx as i32, dy as i32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionMode {
    Absolute,
    Relative,
    // Relative requested with auto-detect; settled on the first move
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// All repeats ran.
    Completed { loops: u32 },
    /// Cancelled; `loops` counts only fully played loops.
    Stopped { loops: u32 },
    /// Ended early by an external signal; the cut loop counts as played.
    Interrupted { loops: u32 },
}

impl ReplayOutcome {
    pub fn loops(&self) -> u32 {
        match *self {
            ReplayOutcome::Completed { loops }
            | ReplayOutcome::Stopped { loops }
            | ReplayOutcome::Interrupted { loops } => loops,
        }
    }

    fn merge(self, other: ReplayOutcome) -> ReplayOutcome {
        use ReplayOutcome::*;
        match (self, other) {
            (Interrupted { loops: a }, b) | (b, Interrupted { loops: a }) => Interrupted {
                loops: a.max(b.loops()),
            },
            (Stopped { loops: a }, b) | (b, Stopped { loops: a }) => Stopped {
                loops: a.min(b.loops()),
            },
            (Completed { loops: a }, Completed { loops: b }) => Completed { loops: a.max(b) },
        }
    }
}

/// Per-modality dispatch, owned by exactly one channel task.
trait Dispatch: Send + 'static {
    fn name(&self) -> &'static str;
    fn wants(&self, event: &Event) -> bool;
    fn begin_loop(&mut self) {}
    fn dispatch(&mut self, event: &Event);
    /// Release whatever this channel still holds; returns the count.
    fn release_held(&mut self) -> usize;
}

struct KeyboardDispatch {
    pressed: PressedKeys,
}

impl Dispatch for KeyboardDispatch {
    fn name(&self) -> &'static str {
        "keyboard"
    }

    fn wants(&self, event: &Event) -> bool {
        event.is_keyboard()
    }

    fn dispatch(&mut self, event: &Event) {
        let Event::Key { action, vk } = *event else {
            return;
        };
        let result = match action {
            KeyAction::Down => self.pressed.press(vk),
            KeyAction::Up => self.pressed.release(vk),
        };
        if let Err(e) = result {
            tracing::warn!("Key {} {} failed: {}", action.as_str(), vk, e);
        }
    }

    fn release_held(&mut self) -> usize {
        self.pressed.release_all()
    }
}

struct MouseDispatch {
    sink: Arc<dyn InputSink>,
    pressed: PressedButtons,
    rescale: Rescale,
    mode: MotionMode,
    relative: RelativeMotion,
}

impl MouseDispatch {
    fn new(sink: Arc<dyn InputSink>, rescale: Rescale, params: &ReplayParams) -> Self {
        let mode = match (params.use_relative_mouse, params.relative_auto_detect) {
            (false, _) => MotionMode::Absolute,
            (true, true) => MotionMode::Probe,
            (true, false) => MotionMode::Relative,
        };
        Self {
            pressed: PressedButtons::new(sink.clone()),
            sink,
            rescale,
            mode,
            relative: RelativeMotion::new(params.relative_gain),
        }
    }

    fn warp(&self, x: i32, y: i32) {
        if let Err(e) = self.sink.move_to(x, y) {
            tracing::warn!("Cursor move to ({}, {}) failed: {}", x, y, e);
        }
    }

    /// Warp once and check whether the cursor actually landed there.
    fn probe(&mut self, pos: &Position) {
        let (tx, ty) = self.rescale.target(pos);
        self.warp(tx, ty);
        self.mode = match self.sink.cursor_position() {
            Some((ax, ay))
                if (ax - tx).abs() <= PROBE_TOLERANCE_PX
                    && (ay - ty).abs() <= PROBE_TOLERANCE_PX =>
            {
                MotionMode::Absolute
            }
            Some(_) => MotionMode::Relative,
            None => MotionMode::Absolute,
        };
        tracing::info!("Mouse motion auto-detected as {:?}", self.mode);
        if self.mode == MotionMode::Relative {
            self.relative.step(pos.x, pos.y);
        }
    }

    fn move_relative(&mut self, pos: &Position) {
        if let Some((dx, dy)) = self.relative.step(pos.x, pos.y) {
            if dx == 0 && dy == 0 {
                return;
            }
            if let Err(e) = self.sink.move_by(dx, dy) {
                tracing::warn!("Relative move ({}, {}) failed: {}", dx, dy, e);
            }
        }
    }
}

impl Dispatch for MouseDispatch {
    fn name(&self) -> &'static str {
        "mouse"
    }

    fn wants(&self, event: &Event) -> bool {
        event.is_mouse()
    }

    fn begin_loop(&mut self) {
        self.relative.reset_anchor();
    }

    fn dispatch(&mut self, event: &Event) {
        match event {
            Event::Move(pos) => match self.mode {
                MotionMode::Absolute => {
                    let (x, y) = self.rescale.target(pos);
                    self.warp(x, y);
                }
                MotionMode::Relative => self.move_relative(pos),
                MotionMode::Probe => self.probe(pos),
            },
            Event::Click {
                button,
                action,
                position,
            } => {
                if self.mode != MotionMode::Relative {
                    if let Some(pos) = position {
                        let (x, y) = self.rescale.target(pos);
                        self.warp(x, y);
                    }
                }
                let result = match action {
                    KeyAction::Down => self.pressed.press(*button),
                    KeyAction::Up => self.pressed.release(*button),
                };
                if let Err(e) = result {
                    tracing::warn!("Button {} {} failed: {}", button.as_str(), action.as_str(), e);
                }
            }
            Event::Scroll { dx, dy } => {
                if let Err(e) = self.sink.scroll(*dx, *dy) {
                    tracing::warn!("Scroll ({}, {}) failed: {}", dx, dy, e);
                }
            }
            Event::Key { .. } => {}
        }
    }

    fn release_held(&mut self) -> usize {
        self.pressed.release_all()
    }
}

struct Channel<D: Dispatch> {
    dispatch: D,
    timeline: Arc<Timeline>,
    ctx: Arc<RunContext>,
    stop: StopFlag,
    repeat_count: u32,
    // Only the lead channel reports loop progress
    observer: Option<Arc<dyn RunObserver>>,
}

impl<D: Dispatch> Channel<D> {
    fn stopped_outcome(&self, loops_done: u32) -> ReplayOutcome {
        if self.ctx.is_interrupted() {
            ReplayOutcome::Interrupted {
                loops: loops_done + 1,
            }
        } else {
            ReplayOutcome::Stopped { loops: loops_done }
        }
    }

    /// Play one pass. Returns `false` when stopped part-way.
    async fn play_once(&mut self) -> bool {
        let start = Instant::now();
        self.dispatch.begin_loop();

        for entry in self.timeline.entries() {
            if !self.dispatch.wants(&entry.event) {
                continue;
            }
            let target = start + Duration::from_millis(entry.at_ms);
            if !wait_until_or_stop(target, &self.stop).await {
                return false;
            }
            tracing::debug!(
                channel = self.dispatch.name(),
                at_ms = entry.at_ms,
                "dispatch {:?}",
                entry.event
            );
            self.dispatch.dispatch(&entry.event);
        }

        let loop_end = start + self.timeline.duration().max(POLL_QUANTUM);
        wait_until_or_stop(loop_end, &self.stop).await
    }

    async fn run(mut self) -> ReplayOutcome {
        let name = self.dispatch.name();
        if self.timeline.is_empty() {
            self.stop.set();
            return ReplayOutcome::Completed { loops: 0 };
        }

        let mut remaining = self.repeat_count.max(1);
        let mut loops_done = 0u32;

        loop {
            if self.stop.is_set() {
                return self.stopped_outcome(loops_done);
            }

            let total = if self.ctx.is_infinite() {
                0
            } else {
                self.repeat_count
            };
            if let Some(observer) = &self.observer {
                observer.on_loop_start(loops_done + 1, total);
            }

            let finished = self.play_once().await;

            let released = self.dispatch.release_held();
            if released > 0 {
                tracing::debug!(channel = name, "Released {} held input(s) at loop end", released);
            }

            if !finished {
                return self.stopped_outcome(loops_done);
            }

            loops_done += 1;
            if let Some(observer) = &self.observer {
                self.ctx.record_loop_done();
                observer.on_progress(loops_done, total);
            }

            if self.ctx.is_infinite() {
                continue;
            }

            remaining -= 1;
            if remaining == 0 {
                self.stop.set();
                tracing::debug!(channel = name, "Completed {} loop(s)", loops_done);
                return ReplayOutcome::Completed { loops: loops_done };
            }
        }
    }
}

/// Both channel tasks of a running replay.
pub struct ReplayHandle {
    keyboard: JoinHandle<ReplayOutcome>,
    mouse: JoinHandle<ReplayOutcome>,
}

impl ReplayHandle {
    /// Wait for both channels and fold their outcomes into one.
    pub async fn join(self) -> ReplayOutcome {
        let keyboard = Self::outcome(self.keyboard.await);
        let mouse = Self::outcome(self.mouse.await);
        keyboard.merge(mouse)
    }

    fn outcome(result: Result<ReplayOutcome, tokio::task::JoinError>) -> ReplayOutcome {
        result.unwrap_or_else(|e| {
            tracing::error!("Replay channel failed: {}", e);
            ReplayOutcome::Stopped { loops: 0 }
        })
    }
}

pub struct Replayer {
    params: ReplayParams,
    ctx: Arc<RunContext>,
    sink: Arc<dyn InputSink>,
    screen: Arc<dyn ScreenGeometry>,
    observer: Option<Arc<dyn RunObserver>>,
}

impl Replayer {
    pub fn new(
        params: ReplayParams,
        ctx: Arc<RunContext>,
        sink: Arc<dyn InputSink>,
        screen: Arc<dyn ScreenGeometry>,
    ) -> Self {
        Self {
            params: params.sanitized(),
            ctx,
            sink,
            screen,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Load the action file once and spawn both channels.
    ///
    /// A missing or unreadable file plays nothing and completes at once.
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> ReplayHandle {
        let timeline = match Timeline::load(&self.params.action_file) {
            Ok(timeline) => Arc::new(timeline),
            Err(e) => {
                tracing::warn!(
                    "Cannot read action file {}: {}",
                    self.params.action_file.display(),
                    e
                );
                Arc::new(Timeline::default())
            }
        };
        self.start_with(timeline)
    }

    pub fn start_with(self, timeline: Arc<Timeline>) -> ReplayHandle {
        self.ctx
            .arm_replay(self.params.repeat_count, self.params.infinite);
        tracing::info!(
            file = %self.params.action_file.display(),
            events = timeline.len(),
            repeat = self.params.repeat_count,
            infinite = self.params.infinite,
            "Replay starting"
        );

        let rescale = Rescale::new(timeline.recorded_screen, self.screen.screen_size());
        if rescale.differs() {
            tracing::info!("Screen size differs from recording, using normalized coordinates");
        }

        let keyboard = Channel {
            dispatch: KeyboardDispatch {
                pressed: PressedKeys::new(self.sink.clone()),
            },
            timeline: timeline.clone(),
            ctx: self.ctx.clone(),
            stop: self.ctx.stop_keyboard.clone(),
            repeat_count: self.params.repeat_count,
            observer: self.observer.clone(),
        };
        let mouse = Channel {
            dispatch: MouseDispatch::new(self.sink.clone(), rescale, &self.params),
            timeline,
            ctx: self.ctx.clone(),
            stop: self.ctx.stop_mouse.clone(),
            repeat_count: self.params.repeat_count,
            observer: None,
        };

        ReplayHandle {
            keyboard: tokio::spawn(keyboard.run()),
            mouse: tokio::spawn(mouse.run()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::testing::{Call, RecordingSink};
    use crate::screen::FixedGeometry;
    use crate::types::{MouseButton, Normalized};
    use std::sync::Mutex;

    fn replayer(
        sink: Arc<RecordingSink>,
        ctx: Arc<RunContext>,
        params: ReplayParams,
        screen: (u32, u32),
    ) -> Replayer {
        Replayer::new(
            params,
            ctx,
            sink,
            Arc::new(FixedGeometry(screen.0, screen.1)),
        )
    }

    fn arc_timeline(text: &str) -> Arc<Timeline> {
        Arc::new(Timeline::parse(text))
    }

    #[derive(Default)]
    struct LoopLog {
        starts: Mutex<Vec<(u32, u32)>>,
        progress: Mutex<Vec<(u32, u32)>>,
    }

    impl RunObserver for LoopLog {
        fn on_loop_start(&self, index: u32, total: u32) {
            self.starts.lock().unwrap().push((index, total));
        }

        fn on_progress(&self, done: u32, total: u32) {
            self.progress.lock().unwrap().push((done, total));
        }
    }

    #[test]
    fn test_rescale_uses_normalized_when_screen_differs() {
        let pos = Position {
            x: 960,
            y: 540,
            norm: Some(Normalized { nx: 0.5, ny: 0.5 }),
        };
        let bigger = Rescale::new(Some((1920, 1080)), (2560, 1440));
        assert!(bigger.differs());
        assert_eq!(bigger.target(&pos), (1280, 720));

        let same = Rescale::new(Some((1920, 1080)), (1920, 1080));
        assert!(!same.differs());
        let literal = Position {
            x: 961,
            y: 539,
            ..pos
        };
        assert_eq!(same.target(&literal), (961, 539));
    }

    #[test]
    fn test_rescale_tolerates_small_differences() {
        let rescale = Rescale::new(Some((1920, 1080)), (1930, 1080));
        assert!(!rescale.differs());
        let no_norm = Position {
            x: 100,
            y: 100,
            norm: None,
        };
        assert_eq!(
            Rescale::new(Some((1920, 1080)), (3840, 2160)).target(&no_norm),
            (100, 100)
        );
    }

    #[test]
    fn test_relative_motion_keeps_fractional_remainder() {
        let mut motion = RelativeMotion::new(0.3);
        assert_eq!(motion.step(0, 0), None);

        let mut total = 0;
        for i in 1..=10 {
            let (dx, dy) = motion.step(i, 0).unwrap();
            assert_eq!(dy, 0);
            total += dx;
        }
        // 10 px at gain 0.3 is exactly 3 px overall
        assert_eq!(total, 3);
    }

    #[test]
    fn test_relative_motion_reset_only_reseeds() {
        let mut motion = RelativeMotion::new(2.0);
        motion.step(10, 10);
        assert_eq!(motion.step(15, 5), Some((10, -10)));
        motion.reset_anchor();
        assert_eq!(motion.step(500, 500), None);
        assert_eq!(motion.step(501, 500), Some((2, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_or_stop_is_interruptible() {
        let stop = StopFlag::new();
        let stopper = stop.clone();
        let begin = Instant::now();
        tokio::spawn(async move {
            sleep(Duration::from_millis(35)).await;
            stopper.set();
        });
        let reached = wait_until_or_stop(begin + Duration::from_secs(60), &stop).await;
        assert!(!reached);
        assert!(begin.elapsed() <= Duration::from_millis(35) + POLL_QUANTUM);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_follows_timestamps() {
        let sink = RecordingSink::new();
        let ctx = RunContext::new();
        let params = ReplayParams::for_file("timed.action");
        let timeline = arc_timeline("K DOWN 65 0\nK UP 65 50\nK DOWN 66 120\nK UP 66 500\n");

        let begin = Instant::now();
        let outcome = replayer(sink.clone(), ctx.clone(), params, (1920, 1080))
            .start_with(timeline)
            .join()
            .await;
        assert_eq!(outcome, ReplayOutcome::Completed { loops: 1 });

        let calls = sink.timed_calls();
        let order: Vec<Call> = calls.iter().map(|(_, c)| *c).collect();
        assert_eq!(
            order,
            vec![
                Call::KeyDown(65),
                Call::KeyUp(65),
                Call::KeyDown(66),
                Call::KeyUp(66)
            ]
        );

        let tolerance = Duration::from_millis(15);
        for ((at, _), expected) in calls.iter().zip([0u64, 50, 120, 500]) {
            let offset = *at - begin;
            let expected = Duration::from_millis(expected);
            let gap = if offset > expected {
                offset - expected
            } else {
                expected - offset
            };
            assert!(gap <= tolerance, "event at {:?}, expected {:?}", offset, expected);
        }
        assert!(ctx.replay_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_count_stops_by_itself() {
        let sink = RecordingSink::new();
        let ctx = RunContext::new();
        let log = Arc::new(LoopLog::default());
        let params = ReplayParams {
            repeat_count: 3,
            ..ReplayParams::for_file("three.action")
        };
        let timeline = arc_timeline("K DOWN 65 0\nM SCROLL 0 -1 40\nK UP 65 80\n");

        let outcome = replayer(sink.clone(), ctx.clone(), params, (1920, 1080))
            .with_observer(log.clone())
            .start_with(timeline)
            .join()
            .await;

        assert_eq!(outcome, ReplayOutcome::Completed { loops: 3 });
        let calls = sink.calls();
        assert_eq!(calls.iter().filter(|c| **c == Call::KeyDown(65)).count(), 3);
        assert_eq!(calls.iter().filter(|c| **c == Call::Scroll(0, -1)).count(), 3);
        assert_eq!(*log.starts.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(*log.progress.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(ctx.loops_done(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_runs_until_stopped() {
        let sink = RecordingSink::new();
        let ctx = RunContext::new();
        let params = ReplayParams {
            repeat_count: 1,
            infinite: true,
            ..ReplayParams::for_file("forever.action")
        };
        let handle = replayer(sink.clone(), ctx.clone(), params, (1920, 1080))
            .start_with(arc_timeline("K DOWN 32 0\nK UP 32 100\n"));

        sleep(Duration::from_millis(1050)).await;
        assert!(!ctx.stop_keyboard.is_set());
        assert!(ctx.loops_done() >= 5);

        ctx.stop_replay();
        let outcome = handle.join().await;
        assert!(matches!(outcome, ReplayOutcome::Stopped { loops } if loops >= 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_click_releases_button() {
        let sink = RecordingSink::new();
        let ctx = RunContext::new();
        let params = ReplayParams::for_file("click.action");
        let handle = replayer(sink.clone(), ctx.clone(), params, (1920, 1080)).start_with(
            arc_timeline("K DOWN 160 0\nM CLICK left DOWN 10 10 0\nM CLICK left UP 10 10 5000\nK UP 160 5000\n"),
        );

        sleep(Duration::from_millis(100)).await;
        ctx.stop_replay();
        let outcome = handle.join().await;

        assert_eq!(outcome, ReplayOutcome::Stopped { loops: 0 });
        let calls = sink.calls();
        assert!(calls.contains(&Call::ButtonUp(MouseButton::Left)));
        assert!(calls.contains(&Call::KeyUp(160)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_counts_cut_loop() {
        let sink = RecordingSink::new();
        let ctx = RunContext::new();
        let params = ReplayParams {
            repeat_count: 5,
            ..ReplayParams::for_file("long.action")
        };
        let handle = replayer(sink, ctx.clone(), params, (1920, 1080))
            .start_with(arc_timeline("K DOWN 65 0\nK UP 65 1000\n"));

        sleep(Duration::from_millis(1500)).await;
        ctx.interrupt();
        assert_eq!(handle.join().await, ReplayOutcome::Interrupted { loops: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_moves_are_rescaled_on_a_different_screen() {
        let sink = RecordingSink::new();
        let ctx = RunContext::new();
        let text = "META SCREEN 1920 1080\nM MOVE 960 540 0.500000 0.500000 0\nM CLICK left DOWN 960 540 0.500000 0.500000 10\nM CLICK left UP 960 540 0.500000 0.500000 20\n";

        replayer(
            sink.clone(),
            ctx.clone(),
            ReplayParams::for_file("scaled.action"),
            (2560, 1440),
        )
        .start_with(arc_timeline(text))
        .join()
        .await;
        assert_eq!(sink.calls()[0], Call::MoveTo(1280, 720));

        let sink = RecordingSink::new();
        replayer(
            sink.clone(),
            ctx,
            ReplayParams::for_file("same.action"),
            (1920, 1080),
        )
        .start_with(arc_timeline(text))
        .join()
        .await;
        assert_eq!(sink.calls()[0], Call::MoveTo(960, 540));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_detect_falls_back_to_absolute() {
        let sink = RecordingSink::new();
        let params = ReplayParams {
            use_relative_mouse: true,
            ..ReplayParams::for_file("desktop.action")
        };
        replayer(sink.clone(), RunContext::new(), params, (1920, 1080))
            .start_with(arc_timeline("M MOVE 100 100 0\nM MOVE 110 120 10\n"))
            .join()
            .await;
        assert_eq!(
            sink.calls(),
            vec![Call::MoveTo(100, 100), Call::MoveTo(110, 120)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_detect_commits_to_relative_in_games() {
        let sink = RecordingSink::ignoring_warps();
        let params = ReplayParams {
            use_relative_mouse: true,
            relative_gain: 2.0,
            ..ReplayParams::for_file("game.action")
        };
        replayer(sink.clone(), RunContext::new(), params, (1920, 1080))
            .start_with(arc_timeline(
                "M MOVE 100 100 0\nM MOVE 110 95 10\nM CLICK left DOWN 300 300 20\nM CLICK left UP 300 300 30\n",
            ))
            .join()
            .await;
        assert_eq!(
            sink.calls(),
            vec![
                Call::MoveTo(100, 100),
                Call::MoveBy(20, -10),
                Call::ButtonDown(MouseButton::Left),
                Call::ButtonUp(MouseButton::Left),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_relative_without_auto_detect_never_warps() {
        let sink = RecordingSink::new();
        let params = ReplayParams {
            use_relative_mouse: true,
            relative_auto_detect: false,
            ..ReplayParams::for_file("game.action")
        };
        replayer(sink.clone(), RunContext::new(), params, (1920, 1080))
            .start_with(arc_timeline("M MOVE 0 0 0\nM MOVE 3 4 10\n"))
            .join()
            .await;
        assert_eq!(sink.calls(), vec![Call::MoveBy(3, 4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_file_completes_without_input() {
        let sink = RecordingSink::new();
        let ctx = RunContext::new();
        let outcome = replayer(
            sink.clone(),
            ctx.clone(),
            ReplayParams::for_file("/no/such/file.action"),
            (1920, 1080),
        )
        .start()
        .join()
        .await;
        assert_eq!(outcome, ReplayOutcome::Completed { loops: 0 });
        assert!(sink.calls().is_empty());
        assert!(ctx.replay_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_file_still_replays() {
        let sink = RecordingSink::new();
        let text = concat!(
            r#"{"name": "keyboard", "event": "press", "vk": 65}"#,
            "\n",
            r#"{"name": "mouse", "event": "move", "location": {"x": 5, "y": 6}}"#,
            "\n",
            r#"{"name": "keyboard", "event": "release", "vk": 65}"#,
            "\n"
        );
        replayer(
            sink.clone(),
            RunContext::new(),
            ReplayParams::for_file("legacy.action"),
            (1920, 1080),
        )
        .start_with(arc_timeline(text))
        .join()
        .await;
        assert_eq!(
            sink.calls(),
            vec![Call::KeyDown(65), Call::MoveTo(5, 6), Call::KeyUp(65)]
        );
    }
}
