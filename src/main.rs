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

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use inputcast::hotkeys::{HotkeyAction, Hotkeys};
use inputcast::recorder::{HookHub, list_action_files, resolve_action_path};
use inputcast::{
    ControllerConfig, DisplayGeometry, MonitorConfig, RdevSink, ReplayParams, RunController,
    TracingObserver, UiState, logging, parser,
};

/// Record and replay keyboard and mouse input
#[derive(Parser)]
#[command(name = "inputcast")]
#[command(version)]
struct Cli {
    /// Verbose logging; RUST_LOG is honored in this mode
    #[arg(long, global = true)]
    debug: bool,

    /// Directory holding action files
    #[arg(long, global = true, default_value = "actions")]
    actions_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record input until ESC or Ctrl-C
    Record {
        /// Target file; a new timestamped file when omitted
        file: Option<String>,
    },

    /// Replay an action file
    Replay {
        file: String,

        #[command(flatten)]
        options: ReplayOptions,
    },

    /// Write a copy of an action file with every timestamp shifted
    Offset {
        input: PathBuf,

        /// Milliseconds to add; may be negative
        #[arg(allow_hyphen_values = true)]
        offset_ms: i64,

        /// Defaults to `<input>-offset.action`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List recorded action files
    List,

    /// Drive recording and replay with F10, F11 and ESC
    Interactive {
        /// File replayed by F11 until something new is recorded
        file: Option<String>,

        #[command(flatten)]
        options: ReplayOptions,
    },
}

#[derive(Args, Clone)]
struct ReplayOptions {
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Repeat until stopped
    #[arg(long)]
    infinite: bool,

    /// Relative mouse motion for games that ignore cursor warps
    #[arg(long)]
    relative: bool,

    /// Multiplier for relative deltas
    #[arg(long, default_value_t = 1.0)]
    gain: f64,

    /// Use relative motion without probing absolute warps first
    #[arg(long)]
    no_auto_detect: bool,

    /// Reference image; enables the restart monitor
    #[arg(long)]
    template: Option<PathBuf>,

    /// Seconds without a match before the restart chain runs
    #[arg(long, default_value_t = 60)]
    monitor_timeout: u64,

    #[arg(long, default_value_t = 3)]
    monitor_interval: u64,

    #[arg(long, default_value = "restart.action")]
    restart_file: String,

    /// Seconds before a stuck restart sequence is abandoned
    #[arg(long, default_value_t = 13)]
    force_resume: u64,
}

impl ReplayOptions {
    fn params(&self, action_file: PathBuf) -> ReplayParams {
        ReplayParams {
            action_file,
            repeat_count: self.repeat,
            infinite: self.infinite,
            use_relative_mouse: self.relative,
            relative_gain: self.gain,
            relative_auto_detect: !self.no_auto_detect,
        }
        .sanitized()
    }

    fn controller_config(&self, actions_dir: &Path) -> ControllerConfig {
        ControllerConfig {
            actions_dir: actions_dir.to_path_buf(),
            restart_file: self.restart_file.clone(),
            force_resume_after: Duration::from_secs(self.force_resume),
            monitor: self.template.as_ref().map(|template| MonitorConfig {
                template: template.clone(),
                timeout: Duration::from_secs(self.monitor_timeout),
                interval: Duration::from_secs(self.monitor_interval.max(1)),
                ..MonitorConfig::default()
            }),
        }
    }
}

fn build_controller(config: ControllerConfig) -> RunController {
    RunController::new(
        config,
        Arc::new(RdevSink::new()),
        Arc::new(DisplayGeometry),
        Arc::new(TracingObserver),
    )
}

/// Ctrl-C stops whatever runs and tells the caller to quit.
fn install_ctrlc(controller: &RunController) -> Result<UnboundedReceiver<()>> {
    let (tx, rx) = unbounded_channel();
    let controller = controller.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl-C, stopping...");
        controller.stop();
        let _ = tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(rx)
}

async fn record(controller: RunController, file: Option<PathBuf>) -> Result<()> {
    let mut quit = install_ctrlc(&controller)?;
    let (tx, mut hotkeys_rx) = unbounded_channel();
    let _hotkeys = Hotkeys::install(&HookHub::global(), tx);

    controller
        .start_recording(file)
        .context("Recording did not start")?;
    tracing::info!("Press ESC or Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = quit.recv() => break,
            Some(action) = hotkeys_rx.recv() => {
                if matches!(action, HotkeyAction::Stop | HotkeyAction::ToggleRecord) {
                    break;
                }
            }
        }
    }
    controller.stop_recording();
    Ok(())
}

async fn replay(controller: RunController, params: ReplayParams) -> Result<()> {
    let _quit = install_ctrlc(&controller)?;
    let (tx, mut hotkeys_rx) = unbounded_channel();
    let _hotkeys = Hotkeys::install(&HookHub::global(), tx);

    let stopper = controller.clone();
    tokio::spawn(async move {
        while let Some(action) = hotkeys_rx.recv().await {
            if matches!(action, HotkeyAction::Stop | HotkeyAction::ToggleReplay) {
                stopper.stop();
            }
        }
    });

    if !controller.start_replay(params) {
        anyhow::bail!("Replay did not start");
    }
    controller.wait().await;
    Ok(())
}

async fn interactive(controller: RunController, defaults: ReplayParams) -> Result<()> {
    let mut quit = install_ctrlc(&controller)?;
    let (tx, mut hotkeys_rx) = unbounded_channel();
    let _hotkeys = Hotkeys::install(&HookHub::global(), tx);
    tracing::info!("F10 record, F11 replay, ESC stop, Ctrl-C quit");

    loop {
        tokio::select! {
            _ = quit.recv() => break,
            Some(action) = hotkeys_rx.recv() => match action {
                HotkeyAction::ToggleRecord => {
                    if controller.state() == UiState::Recording {
                        controller.stop_recording();
                    } else {
                        controller.start_recording(None);
                    }
                }
                HotkeyAction::ToggleReplay => {
                    if controller.state() == UiState::Replaying {
                        controller.stop();
                    } else {
                        let action_file = controller
                            .last_file()
                            .unwrap_or_else(|| defaults.action_file.clone());
                        controller.start_replay(ReplayParams {
                            action_file,
                            ..defaults.clone()
                        });
                    }
                }
                HotkeyAction::Stop => controller.stop(),
            },
        }
    }

    controller.stop();
    controller.wait().await;
    Ok(())
}

fn offset(input: &Path, offset_ms: i64, output: Option<PathBuf>) -> Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let output = output.unwrap_or_else(|| {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        input.with_file_name(format!("{}-offset.action", stem))
    });
    std::fs::write(&output, parser::offset_timestamps(&text, offset_ms))
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("{}", output.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug);
    let actions_dir = cli.actions_dir;

    match cli.command {
        Commands::Record { file } => {
            let controller = build_controller(ControllerConfig {
                actions_dir: actions_dir.clone(),
                ..ControllerConfig::default()
            });
            let file = file.map(|name| {
                let path = PathBuf::from(&name);
                if path.components().count() == 1 {
                    actions_dir.join(path)
                } else {
                    path
                }
            });
            if let Some(dir) = file.as_ref().and_then(|f| f.parent()) {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("Failed to create {}", dir.display()))?;
                }
            }
            record(controller, file).await
        }
        Commands::Replay { file, options } => {
            let params = options.params(resolve_action_path(&actions_dir, &file));
            let controller = build_controller(options.controller_config(&actions_dir));
            replay(controller, params).await
        }
        Commands::Offset {
            input,
            offset_ms,
            output,
        } => offset(&input, offset_ms, output),
        Commands::List => {
            for path in list_action_files(&actions_dir)? {
                println!("{}", path.display());
            }
            Ok(())
        }
        Commands::Interactive { file, options } => {
            let action_file = file
                .map(|name| resolve_action_path(&actions_dir, &name))
                .unwrap_or_default();
            let defaults = options.params(action_file);
            let controller = build_controller(options.controller_config(&actions_dir));
            interactive(controller, defaults).await
        }
    }
}
