//! Rover Pilot
//!
//! Perception-to-action loop for a camera rover on a wireless link.
//!
//! # Architecture
//!
//! Two independent links connect us to the rover:
//!
//! 1. **Video**: an HTTP motion-JPEG body. `FrameDemuxer` cuts it into frames,
//!    a `PerceptionEngine` turns the newest frame into a steering signal, and
//!    `DriveArbiter` decides whether that signal becomes a command.
//! 2. **Control**: a WebSocket carrying single-token commands out and
//!    telemetry text in. `ConnectionManager` keeps it alive and reconnects on
//!    its own; `CommandChannel` writes tokens through it.
//!
//! Nothing here draws or reads user input. Status lines and telemetry go to a
//! `StatusSink` queue, annotated frames to its latest-only `FrameSlot`, for
//! whatever front end is attached.
//!
//! # Module Structure
//!
//! - `command`: command vocabulary, steering signals, drive mode
//! - `demux`: JPEG frame extraction from a chunked byte stream
//! - `frame`: JPEG decoding
//! - `perception`: lane-geometry and detector engines, vision primitives
//! - `arbiter`: autonomous-drive state machine with debounce
//! - `channel`: command delivery over the control link
//! - `connection`: control-link lifecycle and reconnect supervision
//! - `pipeline`: video stream loop and start/stop control
//! - `status`: bounded status/telemetry queue and latest-frame slot
//! - `config`: file and environment configuration

pub mod arbiter;
pub mod channel;
pub mod command;
pub mod config;
pub mod connection;
pub mod demux;
pub mod frame;
pub mod perception;
pub mod pipeline;
pub mod status;

pub use arbiter::{Dispatch, DriveArbiter};
pub use channel::{CommandChannel, CommandSink};
pub use command::{Command, DriveMode, SteeringSignal};
pub use config::{EngineKind, RoverConfig};
pub use connection::{
    ConnectionManager, ConnectionSettings, ConnectionState, Connector, ControlLink, LinkHandle,
    WsConnector,
};
pub use demux::{DemuxStats, Frame, FrameDemuxer};
pub use frame::{decode_frame, DecodedImage};
pub use perception::{build_engine, DriveContext, Perception, PerceptionEngine};
pub use pipeline::{HttpSource, PipelineStats, StreamController, StreamSource, VideoPipeline};
pub use status::{FrameSlot, StatusEvent, StatusSink};
