//! Push-only status sink.
//!
//! The core reports connection changes, command acknowledgements and
//! telemetry here. Whatever displays them lives on the other end of a bounded
//! queue; a slow consumer costs dropped events, never a stalled pipeline.
//!
//! Annotated frames do not go through that queue. They land in a `FrameSlot`
//! holding only the newest frame, so an unread frame is overwritten and text
//! events never compete with pixels for queue space.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use image::RgbImage;

use crate::connection::lock;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    /// Human-readable status line (connection state, commands, errors).
    Status(String),
    /// Text received from the rover.
    Telemetry(String),
}

/// Latest annotated frame, waiting for the display.
#[derive(Clone, Default)]
pub struct FrameSlot {
    latest: Arc<Mutex<Option<RgbImage>>>,
    published: Arc<AtomicU64>,
    overwritten: Arc<AtomicU64>,
}

impl FrameSlot {
    /// Take the newest frame, leaving the slot empty.
    pub fn take(&self) -> Option<RgbImage> {
        lock(&self.latest).take()
    }

    /// Frames published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames replaced before anyone took them.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    fn put(&self, image: RgbImage) {
        if lock(&self.latest).replace(image).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct StatusSink {
    tx: Option<SyncSender<StatusEvent>>,
    frames: Option<FrameSlot>,
    dropped: Arc<AtomicU64>,
}

impl StatusSink {
    /// Create a sink and the receiving end of its text queue. Frames are
    /// read from `frames()`.
    pub fn bounded(capacity: usize) -> (Self, Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                frames: Some(FrameSlot::default()),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A sink that only logs. Frames are discarded.
    pub fn log_only() -> Self {
        Self {
            tx: None,
            frames: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The frame slot shared by every clone of this sink.
    pub fn frames(&self) -> Option<FrameSlot> {
        self.frames.clone()
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}", message);
        self.push(StatusEvent::Status(message));
    }

    pub fn telemetry(&self, message: impl Into<String>) {
        let message = message.into();
        log::debug!("rover: {}", message);
        self.push(StatusEvent::Telemetry(message));
    }

    pub fn frame(&self, image: RgbImage) {
        if let Some(frames) = &self.frames {
            frames.put(image);
        }
    }

    /// Text events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, event: StatusEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    log::warn!("status queue full; {} events dropped so far", dropped);
                }
            }
            // Consumer went away; logging above still records status lines.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
