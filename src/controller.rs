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

//! Run controller
//!
//! Owns the lifecycle of recording and replay sessions. A replay session is
//! supervised by one task that waits for both channels, sweeps held inputs,
//! and runs the restart chain when the monitor interrupted the main action:
//! play the restart file once, then resume the main file with its original
//! repeat count.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::context::RunContext;
use crate::input::{InputSink, TrackedSink};
use crate::monitor::{Callback, FrameSource, Monitor, MonitorConfig, ScreenFrames};
use crate::playback::{ReplayOutcome, Replayer};
use crate::recorder::{HookHub, Recorder, create_action_file, resolve_action_path, write_header};
use crate::screen::ScreenGeometry;
use crate::timeline::Timeline;
use crate::types::{ReplayParams, UiState};

/// Lifecycle callbacks for whatever UI drives the controller.
pub trait RunObserver: Send + Sync {
    fn on_ui_state(&self, _state: UiState) {}
    fn on_progress(&self, _loops_done: u32, _loops_total: u32) {}
    /// `loops_total` is 0 for infinite runs.
    fn on_loop_start(&self, _loop_index: u32, _loops_total: u32) {}
    fn on_log(&self, _message: &str) {}
}

/// Forwards every callback to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_ui_state(&self, state: UiState) {
        tracing::info!("State: {}", state);
    }

    fn on_progress(&self, loops_done: u32, loops_total: u32) {
        tracing::debug!("Progress: {}/{}", loops_done, loops_total);
    }

    fn on_loop_start(&self, loop_index: u32, loops_total: u32) {
        if loops_total == 0 {
            tracing::info!("Loop {}", loop_index);
        } else {
            tracing::info!("Loop {}/{}", loop_index, loops_total);
        }
    }

    fn on_log(&self, message: &str) {
        tracing::info!("{}", message);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub actions_dir: PathBuf,
    /// Played once when the monitor interrupts the main action.
    pub restart_file: String,
    /// Upper bound on the restart sequence before the main action resumes anyway.
    pub force_resume_after: Duration,
    pub monitor: Option<MonitorConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            actions_dir: PathBuf::from("actions"),
            restart_file: "restart.action".to_string(),
            force_resume_after: Duration::from_secs(13),
            monitor: None,
        }
    }
}

struct Session {
    state: UiState,
    recorder: Option<Recorder>,
    supervisor: Option<JoinHandle<()>>,
    last_file: Option<PathBuf>,
}

struct Inner {
    config: ControllerConfig,
    ctx: Arc<RunContext>,
    sink: Arc<TrackedSink>,
    screen: Arc<dyn ScreenGeometry>,
    hub: Arc<HookHub>,
    frames: Arc<dyn FrameSource>,
    observer: Arc<dyn RunObserver>,
    session: Mutex<Session>,
    // A restart chain is in flight; further requests are ignored
    restarting: AtomicBool,
    // The operator stopped the session; no chaining afterwards
    cancelled: AtomicBool,
}

#[derive(Clone)]
pub struct RunController {
    inner: Arc<Inner>,
}

impl RunController {
    pub fn new(
        config: ControllerConfig,
        sink: Arc<dyn InputSink>,
        screen: Arc<dyn ScreenGeometry>,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        Self::with_parts(
            config,
            sink,
            screen,
            observer,
            HookHub::global(),
            Arc::new(ScreenFrames),
        )
    }

    pub fn with_parts(
        config: ControllerConfig,
        sink: Arc<dyn InputSink>,
        screen: Arc<dyn ScreenGeometry>,
        observer: Arc<dyn RunObserver>,
        hub: Arc<HookHub>,
        frames: Arc<dyn FrameSource>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                ctx: RunContext::new(),
                sink: Arc::new(TrackedSink::new(sink)),
                screen,
                hub,
                frames,
                observer,
                session: Mutex::new(Session {
                    state: UiState::Idle,
                    recorder: None,
                    supervisor: None,
                    last_file: None,
                }),
                restarting: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn context(&self) -> Arc<RunContext> {
        self.inner.ctx.clone()
    }

    pub fn state(&self) -> UiState {
        self.inner.session().state
    }

    /// The file most recently recorded or replayed.
    pub fn last_file(&self) -> Option<PathBuf> {
        self.inner.session().last_file.clone()
    }

    /// Start recording into `path`, or into a new timestamped file.
    ///
    /// Returns the file being recorded, `None` when busy or on I/O failure.
    pub fn start_recording(&self, path: Option<PathBuf>) -> Option<PathBuf> {
        let inner = &self.inner;
        let mut session = inner.session();
        if session.state != UiState::Idle {
            drop(session);
            inner.log(&format!("Busy ({}), not starting a recording", self.state()));
            return None;
        }

        let prepared = match path {
            Some(path) if path.exists() => Ok(path),
            Some(path) => {
                let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
                write_header(&path, &stamp, inner.screen.as_ref()).map(|_| path)
            }
            None => create_action_file(&inner.config.actions_dir, inner.screen.as_ref()),
        };
        let path = match prepared {
            Ok(path) => path,
            Err(e) => {
                drop(session);
                inner.log(&format!("Cannot create action file: {}", e));
                return None;
            }
        };

        match Recorder::start(&path, &inner.ctx, inner.screen.as_ref(), &inner.hub) {
            Ok(recorder) => {
                session.recorder = Some(recorder);
                session.state = UiState::Recording;
                session.last_file = Some(path.clone());
                drop(session);
                inner.observer.on_ui_state(UiState::Recording);
                inner.log(&format!("Recording to {}", path.display()));
                Some(path)
            }
            Err(e) => {
                drop(session);
                inner.log(&format!("Cannot start recording: {}", e));
                None
            }
        }
    }

    pub fn stop_recording(&self) -> Option<PathBuf> {
        let recorder = {
            let mut session = self.inner.session();
            if session.state != UiState::Recording {
                return None;
            }
            session.state = UiState::Idle;
            session.recorder.take()
        };
        let path = recorder.map(Recorder::stop);
        self.inner.observer.on_ui_state(UiState::Idle);
        if let Some(path) = &path {
            self.inner
                .log(&format!("Recording saved to {}", path.display()));
        }
        path
    }

    /// Start a supervised replay. Returns `false` when something already runs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_replay(&self, params: ReplayParams) -> bool {
        let inner = &self.inner;
        {
            let mut session = inner.session();
            if session.state != UiState::Idle {
                let state = session.state;
                drop(session);
                inner.log(&format!("Busy ({}), not starting a replay", state));
                return false;
            }
            inner.restarting.store(false, Ordering::SeqCst);
            inner.cancelled.store(false, Ordering::SeqCst);
            session.state = UiState::Replaying;
            session.last_file = Some(params.action_file.clone());
            session.supervisor = Some(tokio::spawn(inner.clone().run_session(params)));
        }
        inner.observer.on_ui_state(UiState::Replaying);
        true
    }

    /// Stop whatever is running.
    pub fn stop(&self) {
        match self.state() {
            UiState::Recording => {
                self.stop_recording();
            }
            UiState::Replaying => {
                self.inner.cancelled.store(true, Ordering::SeqCst);
                self.inner.ctx.stop_replay();
                self.inner.log("Replay stop requested");
            }
            UiState::Idle => {}
        }
    }

    /// Interrupt the main action and chain the restart file.
    ///
    /// Returns `false` when nothing replays or a restart is already in flight.
    pub fn request_restart(&self) -> bool {
        self.inner.request_restart()
    }

    /// Wait for the current replay session, if any, to finish.
    pub async fn wait(&self) {
        let supervisor = self.inner.session().supervisor.take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                tracing::error!("Replay supervisor failed: {}", e);
                self.inner.ctx.stop_replay();
                let swept = self.inner.sink.release_all();
                if swept > 0 {
                    tracing::warn!("{} input(s) were still held after a failed replay", swept);
                }
                self.inner.finish();
            }
        }
    }
}

/// Monitor timeout for one replay, honoring a per-file `META RESTART`.
///
/// The override never drops below the poll interval.
fn monitor_timeout(config: &MonitorConfig, restart_ms: Option<u64>) -> Duration {
    match restart_ms {
        Some(ms) => Duration::from_millis(ms).max(config.interval),
        None => config.timeout,
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn log(&self, message: &str) {
        self.observer.on_log(message);
    }

    fn finish(&self) {
        self.restarting.store(false, Ordering::SeqCst);
        self.session().state = UiState::Idle;
        self.observer.on_ui_state(UiState::Idle);
    }

    fn request_restart(&self) -> bool {
        if self.session().state != UiState::Replaying || self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        if self
            .restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Restart already in flight, ignoring request");
            return false;
        }
        self.log("Target lost, interrupting replay for restart");
        self.ctx.interrupt();
        true
    }

    fn load_timeline(&self, params: &ReplayParams) -> Arc<Timeline> {
        match Timeline::load(&params.action_file) {
            Ok(timeline) => Arc::new(timeline),
            Err(e) => {
                self.log(&format!(
                    "Cannot read {}: {}",
                    params.action_file.display(),
                    e
                ));
                Arc::new(Timeline::default())
            }
        }
    }

    fn restart_params(&self, main: &ReplayParams) -> ReplayParams {
        ReplayParams {
            action_file: resolve_action_path(&self.config.actions_dir, &self.config.restart_file),
            repeat_count: 1,
            infinite: false,
            ..main.clone()
        }
    }

    fn start_monitor(self: &Arc<Self>, timeline: &Timeline) -> Option<Monitor> {
        let mut config = self.config.monitor.clone()?;
        config.timeout = monitor_timeout(&config, timeline.restart_ms);

        let weak = Arc::downgrade(self);
        let on_stop: Callback = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.request_restart();
            }
        });
        let weak = Arc::downgrade(self);
        let on_restart: Callback = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.log("Restart chain requested by monitor");
            }
        });

        let mut monitor = Monitor::new(config, self.frames.clone())
            .on_stop(on_stop)
            .on_restart(on_restart);
        match monitor.start() {
            Ok(()) => Some(monitor),
            Err(e) => {
                self.log(&format!("Monitor disabled: {}", e));
                None
            }
        }
    }

    /// Play one phase; the restart phase is cut off after `force_resume_after`.
    async fn play(
        &self,
        params: &ReplayParams,
        timeline: Arc<Timeline>,
        bounded: bool,
    ) -> ReplayOutcome {
        let handle = Replayer::new(
            params.clone(),
            self.ctx.clone(),
            self.sink.clone(),
            self.screen.clone(),
        )
        .with_observer(self.observer.clone())
        .start_with(timeline);

        // A stop that landed between phases must still apply
        if self.cancelled.load(Ordering::SeqCst) {
            self.ctx.stop_replay();
        }

        if !bounded {
            return handle.join().await;
        }

        let join = handle.join();
        tokio::pin!(join);
        tokio::select! {
            outcome = &mut join => outcome,
            _ = tokio::time::sleep(self.config.force_resume_after) => {
                self.log("Restart sequence overran, force-resuming main action");
                self.ctx.stop_replay();
                join.await
            }
        }
    }

    async fn run_session(self: Arc<Self>, params: ReplayParams) {
        let main_timeline = self.load_timeline(&params);
        let _monitor = self.start_monitor(&main_timeline);

        let mut current = params;
        let mut timeline = main_timeline;
        let mut pending_main: Option<(ReplayParams, Arc<Timeline>)> = None;

        loop {
            let in_restart = pending_main.is_some();
            let outcome = self.play(&current, timeline.clone(), in_restart).await;

            let swept = self.sink.release_all();
            if swept > 0 {
                tracing::warn!("{} input(s) were still held after replay", swept);
            }
            self.log(&format!(
                "{} finished after {} loop(s) ({:?})",
                current.action_file.display(),
                outcome.loops(),
                outcome
            ));

            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }

            if let Some((main, main_timeline)) = pending_main.take() {
                self.restarting.store(false, Ordering::SeqCst);
                self.log(&format!(
                    "Resuming {} with {} repeat(s)",
                    main.action_file.display(),
                    main.repeat_count
                ));
                current = main;
                timeline = main_timeline;
                continue;
            }

            if self.restarting.load(Ordering::SeqCst)
                && matches!(outcome, ReplayOutcome::Interrupted { .. })
            {
                let restart = self.restart_params(&current);
                self.log(&format!(
                    "Running restart sequence {}",
                    restart.action_file.display()
                ));
                let restart_timeline = self.load_timeline(&restart);
                pending_main = Some((current, timeline));
                current = restart;
                timeline = restart_timeline;
                continue;
            }

            break;
        }

        self.finish();
    }
}
