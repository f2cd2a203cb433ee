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

//! Recording of keyboard and mouse input into action files
//!
//! `rdev::listen` blocks forever and cannot be unregistered, so one listener
//! thread per process feeds a [`HookHub`]. Capture channels and hotkeys
//! subscribe to the hub and leave it by dropping their [`HookSubscription`].

use rdev::{Button, EventType};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::Instant;

use crate::context::{RunContext, StopFlag};
use crate::error::{Error, Result};
use crate::hotkeys::CONTROL_KEYS;
use crate::input::key_to_vk;
use crate::parser::serialize;
use crate::screen::ScreenGeometry;
use crate::types::{
    ClickEvent, KeyAction, KeyEvent, MouseButton, MoveEvent, NormPair, Normalized, Record,
    ScrollEvent,
};

pub const ACTION_EXTENSION: &str = "action";
pub const ACTION_HEADER: &str = "# inputcast action v1";

type HookCallback = Arc<dyn Fn(&EventType) + Send + Sync>;

/// Fans global input events out to whoever is currently subscribed.
pub struct HookHub {
    subscribers: Mutex<Vec<(u64, HookCallback)>>,
    next_id: AtomicU64,
    listener: Once,
    autostart: bool,
}

static GLOBAL_HUB: OnceLock<Arc<HookHub>> = OnceLock::new();

impl HookHub {
    /// The process-wide hub backed by the OS input hook.
    pub fn global() -> Arc<HookHub> {
        GLOBAL_HUB
            .get_or_init(|| Arc::new(Self::with_autostart(true)))
            .clone()
    }

    /// A hub that never installs an OS hook; events come from [`HookHub::dispatch`].
    pub fn detached() -> Arc<HookHub> {
        Arc::new(Self::with_autostart(false))
    }

    fn with_autostart(autostart: bool) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            listener: Once::new(),
            autostart,
        }
    }

    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> HookSubscription
    where
        F: Fn(&EventType) + Send + Sync + 'static,
    {
        if self.autostart {
            self.ensure_listening();
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push((id, Arc::new(callback)));
        }
        HookSubscription {
            hub: self.clone(),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|(sid, _)| *sid != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Deliver one event to every subscriber.
    pub fn dispatch(&self, event: &EventType) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let callbacks: Vec<HookCallback> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(event);
        }
    }

    fn ensure_listening(self: &Arc<Self>) {
        let hub = self.clone();
        self.listener.call_once(move || {
            std::thread::spawn(move || {
                tracing::debug!("Input hook listener starting");
                if let Err(e) = rdev::listen(move |event| hub.dispatch(&event.event_type)) {
                    let err = Error::Listen(format!("{:?}", e));
                    tracing::error!("{}", err);
                }
            });
        });
    }
}

/// Live subscription to a [`HookHub`]; dropping it unsubscribes.
pub struct HookSubscription {
    hub: Arc<HookHub>,
    id: u64,
}

impl Drop for HookSubscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

/// Append-only action file shared by both capture channels.
pub struct ActionWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl ActionWriter {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one complete line. Failures are logged, never raised.
    pub fn write_record(&self, record: &Record) {
        let line = format!("{}\n", serialize(record));
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            tracing::warn!("Dropped action line for {}: {}", self.path.display(), e);
        }
    }
}

fn elapsed_ms(t0: Instant) -> i64 {
    t0.elapsed().as_millis() as i64
}

/// Captures key presses, minus the operator's control keys.
pub struct KeyboardChannel {
    writer: Arc<ActionWriter>,
    t0: Instant,
    stop: StopFlag,
}

impl KeyboardChannel {
    pub fn new(writer: Arc<ActionWriter>, t0: Instant, stop: StopFlag) -> Self {
        Self { writer, t0, stop }
    }

    pub fn handle(&self, event: &EventType) {
        if self.stop.is_set() {
            return;
        }
        let (action, key) = match event {
            EventType::KeyPress(key) => (KeyAction::Down, key),
            EventType::KeyRelease(key) => (KeyAction::Up, key),
            _ => return,
        };
        let vk = key_to_vk(key);
        if vk == 0 || CONTROL_KEYS.contains(&vk) {
            return;
        }
        self.writer.write_record(&Record::Key(KeyEvent {
            action,
            vk,
            ms: elapsed_ms(self.t0),
        }));
    }
}

/// Captures moves, clicks and wheel events.
///
/// Screen size is read once at construction; a zero dimension means positions
/// are written without the normalized pair.
pub struct MouseChannel {
    writer: Arc<ActionWriter>,
    t0: Instant,
    stop: StopFlag,
    screen: (u32, u32),
    last_position: Mutex<(i32, i32)>,
}

impl MouseChannel {
    pub fn new(
        writer: Arc<ActionWriter>,
        t0: Instant,
        stop: StopFlag,
        screen: &dyn ScreenGeometry,
    ) -> Self {
        Self {
            writer,
            t0,
            stop,
            screen: screen.screen_size(),
            last_position: Mutex::new((0, 0)),
        }
    }

    fn normalize(&self, x: i32, y: i32) -> Option<NormPair> {
        Normalized::from_pixels(x, y, self.screen.0, self.screen.1).map(NormPair::from)
    }

    fn position(&self) -> (i32, i32) {
        self.last_position.lock().map(|p| *p).unwrap_or((0, 0))
    }

    pub fn handle(&self, event: &EventType) {
        if self.stop.is_set() {
            return;
        }
        let ms = elapsed_ms(self.t0);
        let record = match event {
            EventType::MouseMove { x, y } => {
                let (x, y) = (x.round() as i32, y.round() as i32);
                if let Ok(mut last) = self.last_position.lock() {
                    *last = (x, y);
                }
                Record::Move(MoveEvent {
                    x,
                    y,
                    norm: self.normalize(x, y),
                    ms,
                })
            }
            EventType::ButtonPress(button) | EventType::ButtonRelease(button) => {
                let button = match button {
                    Button::Left => MouseButton::Left,
                    Button::Right => MouseButton::Right,
                    _ => return,
                };
                let action = if matches!(event, EventType::ButtonPress(_)) {
                    KeyAction::Down
                } else {
                    KeyAction::Up
                };
                let (x, y) = self.position();
                Record::Click(ClickEvent {
                    button,
                    action,
                    x,
                    y,
                    norm: self.normalize(x, y),
                    ms,
                })
            }
            EventType::Wheel { delta_x, delta_y } => Record::Scroll(ScrollEvent {
                dx: *delta_x,
                dy: *delta_y,
                ms,
            }),
            _ => return,
        };
        self.writer.write_record(&record);
    }
}

/// A recording session; both channels share one file and one zero time.
pub struct Recorder {
    path: PathBuf,
    stop: StopFlag,
    subscriptions: Vec<HookSubscription>,
}

impl Recorder {
    /// Start capturing into `path`, appending after whatever it holds.
    pub fn start(
        path: &Path,
        ctx: &RunContext,
        screen: &dyn ScreenGeometry,
        hub: &Arc<HookHub>,
    ) -> Result<Self> {
        let writer = Arc::new(ActionWriter::open(path)?);
        let t0 = Instant::now();
        let stop = ctx.stop_recording.clone();
        stop.clear();

        let keyboard = KeyboardChannel::new(writer.clone(), t0, stop.clone());
        let mouse = MouseChannel::new(writer, t0, stop.clone(), screen);

        let subscriptions = vec![
            hub.subscribe(move |event| keyboard.handle(event)),
            hub.subscribe(move |event| mouse.handle(event)),
        ];
        tracing::info!("Recording into {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            stop,
            subscriptions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stop(mut self) -> PathBuf {
        self.stop.set();
        self.subscriptions.clear();
        tracing::info!("Recording stopped: {}", self.path.display());
        self.path
    }
}

/// Create a new, timestamp-named action file with its header lines.
pub fn create_action_file(dir: &Path, screen: &dyn ScreenGeometry) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let now = chrono::Local::now();
    let stamp = now.format("%Y%m%d-%H%M%S").to_string();
    let path = dir.join(format!("{}.{}", stamp, ACTION_EXTENSION));
    write_header(&path, &stamp, screen)?;
    Ok(path)
}

/// Write the header lines into `path`, replacing any previous content.
pub fn write_header(path: &Path, stamp: &str, screen: &dyn ScreenGeometry) -> Result<()> {
    let (width, height) = screen.screen_size();
    let lines = [
        ACTION_HEADER.to_string(),
        serialize(&Record::MetaScreen { width, height }),
        serialize(&Record::MetaStart(stamp.to_string())),
    ];
    fs::write(path, format!("{}\n", lines.join("\n")))?;
    Ok(())
}

/// Sorted `*.action` files in `dir`; a missing directory lists as empty.
pub fn list_action_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == ACTION_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// A bare name resolves inside `dir` when such a file exists there.
pub fn resolve_action_path(dir: &Path, name: &str) -> PathBuf {
    let given = PathBuf::from(name);
    if given.components().count() == 1 {
        let candidate = dir.join(&given);
        if candidate.is_file() {
            return candidate;
        }
    }
    given
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotkeys::{VK_ESCAPE, VK_F10};
    use crate::parser::parse_line;
    use crate::screen::FixedGeometry;
    use rdev::Key;
    use std::sync::atomic::AtomicUsize;

    fn records(path: &Path) -> Vec<Record> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(parse_line)
            .collect()
    }

    #[test]
    fn test_keyboard_channel_filters_control_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.action");
        let writer = Arc::new(ActionWriter::open(&path).unwrap());
        let channel = KeyboardChannel::new(writer, Instant::now(), StopFlag::new());

        channel.handle(&EventType::KeyPress(Key::KeyA));
        channel.handle(&EventType::KeyPress(Key::Escape));
        channel.handle(&EventType::KeyPress(Key::F10));
        channel.handle(&EventType::KeyRelease(Key::KeyA));
        channel.handle(&EventType::MouseMove { x: 1.0, y: 1.0 });

        let recs = records(&path);
        assert_eq!(recs.len(), 2);
        assert!(matches!(recs[0], Record::Key(KeyEvent { action: KeyAction::Down, vk: 0x41, .. })));
        assert!(matches!(recs[1], Record::Key(KeyEvent { action: KeyAction::Up, vk: 0x41, .. })));
        assert!(!recs.iter().any(|r| matches!(r, Record::Key(k) if k.vk == VK_ESCAPE || k.vk == VK_F10)));
    }

    #[test]
    fn test_mouse_channel_writes_normalized_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mouse.action");
        let writer = Arc::new(ActionWriter::open(&path).unwrap());
        let channel = MouseChannel::new(
            writer,
            Instant::now(),
            StopFlag::new(),
            &FixedGeometry(1000, 500),
        );

        channel.handle(&EventType::MouseMove { x: 500.0, y: 250.0 });
        channel.handle(&EventType::ButtonPress(Button::Left));
        channel.handle(&EventType::ButtonRelease(Button::Middle));
        channel.handle(&EventType::Wheel {
            delta_x: 0,
            delta_y: -1,
        });

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("M MOVE 500 250 0.500000 0.500000 "));
        assert!(lines[1].starts_with("M CLICK left DOWN 500 250 0.500000 0.500000 "));
        assert!(lines[2].starts_with("M SCROLL 0 -1 "));
    }

    #[test]
    fn test_mouse_channel_without_screen_size_omits_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.action");
        let writer = Arc::new(ActionWriter::open(&path).unwrap());
        let channel =
            MouseChannel::new(writer, Instant::now(), StopFlag::new(), &FixedGeometry(0, 0));
        channel.handle(&EventType::MouseMove { x: 12.0, y: 34.0 });

        match &records(&path)[0] {
            Record::Move(e) => {
                assert_eq!((e.x, e.y), (12, 34));
                assert_eq!(e.norm, None);
            }
            other => panic!("expected move, got {:?}", other),
        }
    }

    #[test]
    fn test_recorder_stops_through_hub() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.action");
        let ctx = RunContext::new();
        let hub = HookHub::detached();

        let recorder =
            Recorder::start(&path, &ctx, &FixedGeometry(1920, 1080), &hub).unwrap();
        assert_eq!(hub.subscriber_count(), 2);
        hub.dispatch(&EventType::KeyPress(Key::KeyW));
        hub.dispatch(&EventType::MouseMove { x: 10.0, y: 20.0 });

        let stopped = recorder.stop();
        assert_eq!(stopped, path);
        assert!(ctx.stop_recording.is_set());
        assert_eq!(hub.subscriber_count(), 0);

        hub.dispatch(&EventType::KeyPress(Key::KeyQ));
        let recs = records(&path);
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| r.ms().is_some_and(|ms| ms >= 0)));
    }

    #[test]
    fn test_hub_snapshot_allows_unsubscribe_in_callback() {
        let hub = HookHub::detached();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = hub.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        hub.dispatch(&EventType::KeyPress(Key::KeyA));
        drop(sub);
        hub.dispatch(&EventType::KeyPress(Key::KeyA));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_create_action_file_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let actions = dir.path().join("actions");
        let path = create_action_file(&actions, &FixedGeometry(2560, 1440)).unwrap();

        assert_eq!(path.extension().unwrap(), ACTION_EXTENSION);
        let recs = records(&path);
        assert_eq!(recs[0], Record::Comment(ACTION_HEADER.to_string()));
        assert_eq!(
            recs[1],
            Record::MetaScreen {
                width: 2560,
                height: 1440
            }
        );
        assert!(matches!(&recs[2], Record::MetaStart(stamp) if stamp.len() == 15));
    }

    #[test]
    fn test_list_and_resolve_action_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.action"), "").unwrap();
        fs::write(dir.path().join("a.action"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let names: Vec<String> = list_action_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.action", "b.action"]);

        assert_eq!(
            resolve_action_path(dir.path(), "a.action"),
            dir.path().join("a.action")
        );
        assert_eq!(
            resolve_action_path(dir.path(), "missing.action"),
            PathBuf::from("missing.action")
        );
        assert!(list_action_files(&dir.path().join("nope")).unwrap().is_empty());
    }
}
