//! rover_pilot - drive a camera rover from its video feed.
//!
//! This binary:
//! 1. Keeps the WebSocket control channel up, reconnecting on its own
//! 2. Streams MJPEG from the rover and runs the configured perception engine
//! 3. Reads operator input on stdin:
//!    `w`/`a`/`s`/`d`/`halt` drive manually, `auto`/`manual` toggle
//!    autonomous mode, `start`/`stop` toggle the video stream,
//!    `stats` prints pipeline counters, `quit` exits
//!
//! Ctrl-C leaves autonomous mode (sending a halt), stops the stream and closes
//! the control channel.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rover_pilot::{
    build_engine, Command, CommandChannel, CommandSink, ConnectionManager, ConnectionSettings,
    ConnectionState, DriveArbiter, FrameSlot, HttpSource, RoverConfig, StatusEvent, StatusSink,
    StreamController, VideoPipeline, WsConnector,
};

const STARTUP_CONNECT_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive a camera rover from its video feed")]
struct Args {
    /// Config file (JSON, or TOML when the extension is .toml).
    #[arg(long, env = "ROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Perception engine (lane|detector); overrides the config file.
    #[arg(long, env = "ROVER_ENGINE")]
    engine: Option<String>,

    /// Start the video stream once the control channel is up.
    #[arg(long)]
    stream: bool,

    /// Enter autonomous mode at startup.
    #[arg(long)]
    auto: bool,
}

/// One line of operator input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Drive(Command),
    Autonomous,
    Manual,
    StartStream,
    StopStream,
    Stats,
    Help,
    Quit,
    Empty,
}

fn parse_input(line: &str) -> Result<Input> {
    let line = line.trim();
    Ok(match line.to_ascii_lowercase().as_str() {
        "" => Input::Empty,
        "auto" => Input::Autonomous,
        "manual" => Input::Manual,
        "start" => Input::StartStream,
        "stop" => Input::StopStream,
        "stats" => Input::Stats,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        _ => {
            let command: Command = line.parse()?;
            if !command.is_drive() {
                return Err(anyhow!("'{}' is not a drive command", line));
            }
            Input::Drive(command)
        }
    })
}

enum Event {
    Line(String),
    Shutdown,
}

struct Session {
    arbiter: Arc<Mutex<DriveArbiter>>,
    channel: Arc<CommandChannel>,
    controller: StreamController,
}

impl Session {
    /// Returns `false` when the operator asked to quit.
    fn handle(&mut self, input: Input) -> Result<bool> {
        match input {
            Input::Drive(command) => {
                if self.arbiter()?.is_autonomous() {
                    log::warn!("manual '{}' sent while autonomous", command);
                }
                self.channel.send(command)?;
            }
            Input::Autonomous => self.arbiter()?.start_autonomous(),
            Input::Manual => {
                self.arbiter()?.stop_autonomous(self.channel.as_ref());
            }
            Input::StartStream => self.controller.start()?,
            Input::StopStream => self.controller.stop()?,
            Input::Stats => {
                let stats = self.controller.stats();
                println!(
                    "bytes {} | analysed {} | skipped {} | decode failures {} | resyncs {} | discarded {} bytes",
                    stats.bytes_read,
                    stats.frames_analyzed,
                    stats.frames_skipped,
                    stats.decode_failures,
                    stats.demux.resyncs,
                    stats.demux.bytes_discarded
                );
            }
            Input::Help => println!("w a s d halt | auto manual | start stop | stats | quit"),
            Input::Quit => return Ok(false),
            Input::Empty => {}
        }
        Ok(true)
    }

    fn arbiter(&self) -> Result<std::sync::MutexGuard<'_, DriveArbiter>> {
        self.arbiter
            .lock()
            .map_err(|_| anyhow!("drive arbiter lock poisoned"))
    }

    fn shutdown(mut self, manager: ConnectionManager) -> Result<()> {
        self.arbiter()?.stop_autonomous(self.channel.as_ref());
        self.controller.stop()?;
        manager.shutdown()
    }
}

const DISPLAY_TICK: Duration = Duration::from_millis(100);

fn spawn_display(events: mpsc::Receiver<StatusEvent>, frames: Option<FrameSlot>) {
    std::thread::spawn(move || loop {
        match events.recv_timeout(DISPLAY_TICK) {
            // Status lines are already logged by the sink.
            Ok(StatusEvent::Status(_)) => {}
            Ok(StatusEvent::Telemetry(text)) => println!("rover> {}", text),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if let Some(image) = frames.as_ref().and_then(FrameSlot::take) {
            log::trace!("frame ({}x{})", image.width(), image.height());
        }
    });
}

fn spawn_stdin(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(Event::Line(line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = RoverConfig::load_from(args.config.as_deref())?;
    if let Some(engine) = &args.engine {
        config.engine = engine.parse()?;
    }

    let (sink, status_events) = StatusSink::bounded(config.status_queue);
    spawn_display(status_events, sink.frames());

    let connector = WsConnector::new(&config.control.url, config.control.connect_timeout)?;
    let manager = ConnectionManager::spawn(
        connector,
        ConnectionSettings {
            retry_interval: config.control.reconnect_interval,
            send_timeout: config.control.send_timeout,
            poll_interval: config.control.poll_interval,
        },
        sink.clone(),
    )?;
    let channel = Arc::new(CommandChannel::new(manager.handle(), sink.clone()));
    let arbiter = Arc::new(Mutex::new(DriveArbiter::new()));

    let mut engine = build_engine(&config)?;
    engine
        .warm_up()
        .with_context(|| format!("warm up {} engine", engine.name()))?;
    log::info!("perception engine: {}", engine.name());
    let pipeline = VideoPipeline::new(
        engine,
        arbiter.clone(),
        channel.clone(),
        sink.clone(),
        &config.video,
    );
    let source = Arc::new(HttpSource::new(&config.video, config.control.connect_timeout));
    let controller = StreamController::new(source, pipeline, channel.clone(), sink.clone());

    let mut session = Session {
        arbiter,
        channel,
        controller,
    };

    if args.stream {
        if manager
            .handle()
            .wait_for_state(ConnectionState::Connected, STARTUP_CONNECT_WAIT)
        {
            if let Err(e) = session.handle(Input::StartStream) {
                log::warn!("video stream not started: {:#}", e);
            }
        } else {
            log::warn!(
                "control channel not up after {:?}; type 'start' to stream",
                STARTUP_CONNECT_WAIT
            );
        }
    }
    if args.auto {
        session.handle(Input::Autonomous)?;
    }

    let (tx, rx) = mpsc::channel();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Event::Shutdown);
    })
    .context("error setting Ctrl-C handler")?;
    spawn_stdin(tx);

    log::info!("rover_pilot running; type 'help' for commands, Ctrl-C to exit");
    while let Ok(event) = rx.recv() {
        let line = match event {
            Event::Line(line) => line,
            Event::Shutdown => break,
        };
        let keep_going = match parse_input(&line).and_then(|input| session.handle(input)) {
            Ok(keep_going) => keep_going,
            Err(e) => {
                eprintln!("{:#}", e);
                true
            }
        };
        if !keep_going {
            break;
        }
    }

    log::info!("shutting down");
    session.shutdown(manager)
}
