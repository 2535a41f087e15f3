//! Video ingestion: bytes -> frames -> perception -> arbitration.
//!
//! `VideoPipeline` is the sequential per-stream loop. `StreamController` owns
//! the thread that runs it, and toggles the rover's camera over the control
//! channel when the stream starts or stops.
//!
//! Blocking reads happen on a separate reader thread that hands chunks over a
//! small bounded queue. The pipeline only ever waits on that queue, so a stop
//! request is seen within `STOP_POLL` even when the rover has gone silent
//! mid-stream. A reader abandoned that way exits at its next read timeout.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::arbiter::{Dispatch, DriveArbiter};
use crate::channel::CommandSink;
use crate::command::Command;
use crate::config::VideoSettings;
use crate::connection::lock;
use crate::demux::{DemuxStats, Frame, FrameDemuxer};
use crate::frame::decode_frame;
use crate::perception::PerceptionEngine;
use crate::status::StatusSink;

/// How often the pipeline looks at its stop flag while waiting for bytes.
pub const STOP_POLL: Duration = Duration::from_millis(20);

/// Chunks the reader may run ahead of analysis.
const READ_AHEAD_CHUNKS: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub bytes_read: u64,
    pub frames_analyzed: u64,
    /// Complete frames superseded by a newer one from the same read.
    pub frames_skipped: u64,
    pub decode_failures: u64,
    pub analysis_failures: u64,
    pub demux: DemuxStats,
}

pub struct VideoPipeline {
    demuxer: FrameDemuxer,
    engine: Box<dyn PerceptionEngine>,
    arbiter: Arc<Mutex<DriveArbiter>>,
    commands: Arc<dyn CommandSink>,
    sink: StatusSink,
    chunk_size: usize,
    stats: Arc<Mutex<PipelineStats>>,
}

impl VideoPipeline {
    pub fn new(
        engine: Box<dyn PerceptionEngine>,
        arbiter: Arc<Mutex<DriveArbiter>>,
        commands: Arc<dyn CommandSink>,
        sink: StatusSink,
        settings: &VideoSettings,
    ) -> Self {
        Self {
            demuxer: FrameDemuxer::with_max_buffer(settings.max_buffer_bytes),
            engine,
            arbiter,
            commands,
            sink,
            chunk_size: settings.chunk_size.max(1),
            stats: Arc::new(Mutex::new(PipelineStats::default())),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn stats(&self) -> PipelineStats {
        *lock(&self.stats)
    }

    /// Shared view of the counters, readable while the pipeline runs elsewhere.
    pub fn stats_handle(&self) -> Arc<Mutex<PipelineStats>> {
        self.stats.clone()
    }

    /// Forget partial frames, e.g. before reading a new stream.
    pub fn reset(&mut self) {
        self.demuxer.reset();
    }

    /// Process one chunk. Only the newest complete frame is analysed.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Dispatch> {
        let mut frames = self.demuxer.feed(chunk);
        let newest = frames.pop();
        {
            let mut stats = lock(&self.stats);
            stats.bytes_read += chunk.len() as u64;
            stats.frames_skipped += frames.len() as u64;
            stats.demux = self.demuxer.stats();
        }
        newest.and_then(|frame| self.process_frame(&frame))
    }

    fn process_frame(&mut self, frame: &Frame) -> Option<Dispatch> {
        let image = match decode_frame(frame) {
            Ok(image) => image,
            Err(err) => {
                lock(&self.stats).decode_failures += 1;
                log::debug!("skipping frame: {:#}", err);
                return None;
            }
        };

        let context = lock(&self.arbiter).context();
        let perception = match self.engine.analyze(&image, &context) {
            Ok(perception) => perception,
            Err(err) => {
                lock(&self.stats).analysis_failures += 1;
                log::warn!(
                    "{} engine failed on frame at {}: {:#}",
                    self.engine.name(),
                    frame.offset,
                    err
                );
                return None;
            }
        };
        lock(&self.stats).frames_analyzed += 1;

        let signal = perception.signal;
        self.sink.frame(perception.annotated);
        // The mode may have changed since the snapshot; on_signal re-checks it.
        let dispatch = lock(&self.arbiter).on_signal(signal, self.commands.as_ref());
        Some(dispatch)
    }

    /// Read `reader` chunk by chunk until it ends, fails, or `stop` is set.
    ///
    /// Returns within `STOP_POLL` of `stop` being set, whether or not the
    /// reader is blocked.
    pub fn run<R: Read + Send + 'static>(&mut self, reader: R, stop: &AtomicBool) -> Result<()> {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        let chunks = spawn_reader(reader, self.chunk_size)?;
        while !stop.load(Ordering::SeqCst) {
            let chunk = match chunks.recv_timeout(STOP_POLL) {
                Ok(ReadEvent::Chunk(chunk)) => chunk,
                Ok(ReadEvent::End) => {
                    self.sink.status("video stream ended");
                    return Ok(());
                }
                Ok(ReadEvent::Failed(err)) => return Err(err).context("read video stream"),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => bail!("video reader thread exited"),
            };
            if stop.load(Ordering::SeqCst) {
                break;
            }
            self.feed(&chunk);
        }
        Ok(())
    }
}

enum ReadEvent {
    Chunk(Vec<u8>),
    End,
    Failed(io::Error),
}

fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
    chunk_size: usize,
) -> Result<Receiver<ReadEvent>> {
    let (tx, rx) = mpsc::sync_channel(READ_AHEAD_CHUNKS);
    std::thread::Builder::new()
        .name("video-reader".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; chunk_size];
            loop {
                let event = match reader.read(&mut buf) {
                    Ok(0) => ReadEvent::End,
                    Ok(n) => ReadEvent::Chunk(buf[..n].to_vec()),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => ReadEvent::Failed(err),
                };
                let last = !matches!(event, ReadEvent::Chunk(_));
                // The pipeline stopped listening; drop the stream.
                if tx.send(event).is_err() || last {
                    break;
                }
            }
        })
        .context("spawn video reader thread")?;
    Ok(rx)
}

/// Where stream bytes come from.
pub trait StreamSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn Read + Send>>;

    fn describe(&self) -> String;
}

/// MJPEG over HTTP GET.
pub struct HttpSource {
    agent: ureq::Agent,
    url: String,
}

impl HttpSource {
    pub fn new(settings: &VideoSettings, connect_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(settings.read_timeout)
            .build();
        Self {
            agent,
            url: settings.url.clone(),
        }
    }
}

impl StreamSource for HttpSource {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let response = match self.agent.get(&self.url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                bail!("video stream {} returned HTTP {}", self.url, code)
            }
            Err(err) => {
                return Err(err).with_context(|| format!("connect to video stream {}", self.url))
            }
        };
        if response.status() != 200 {
            bail!(
                "video stream {} returned HTTP {}",
                self.url,
                response.status()
            );
        }
        log::debug!(
            "video stream content type: {}",
            response.header("Content-Type").unwrap_or("unknown")
        );
        Ok(Box::new(response.into_reader()))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

struct ActiveStream {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<VideoPipeline>,
}

/// Starts and stops the video stream thread.
pub struct StreamController {
    source: Arc<dyn StreamSource>,
    commands: Arc<dyn CommandSink>,
    sink: StatusSink,
    pipeline: Option<VideoPipeline>,
    stats: Arc<Mutex<PipelineStats>>,
    active: Option<ActiveStream>,
}

impl StreamController {
    pub fn new(
        source: Arc<dyn StreamSource>,
        pipeline: VideoPipeline,
        commands: Arc<dyn CommandSink>,
        sink: StatusSink,
    ) -> Self {
        Self {
            source,
            commands,
            sink,
            stats: pipeline.stats_handle(),
            pipeline: Some(pipeline),
            active: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    pub fn stats(&self) -> PipelineStats {
        *lock(&self.stats)
    }

    /// Ask the rover to stream and start reading. A running stream is
    /// cancelled first.
    pub fn start(&mut self) -> Result<()> {
        if !self.commands.is_connected() {
            self.sink
                .status("cannot start video: control channel not connected");
            bail!("control channel not connected");
        }
        self.cancel()?;

        let mut pipeline = self
            .pipeline
            .take()
            .ok_or_else(|| anyhow!("video pipeline lost after a panic"))?;
        if let Err(err) = self.commands.send(Command::StartStream) {
            self.pipeline = Some(pipeline);
            return Err(err.context("request video stream"));
        }
        pipeline.reset();

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let source = self.source.clone();
        let sink = self.sink.clone();
        self.sink.status(format!(
            "video stream started from {} ({} engine)",
            source.describe(),
            pipeline.engine_name()
        ));
        let handle = std::thread::spawn(move || {
            let result = source
                .open()
                .and_then(|reader| pipeline.run(reader, &thread_stop));
            if let Err(err) = result {
                sink.status(format!("video stream error: {:#}", err));
            }
            pipeline
        });
        self.active = Some(ActiveStream { stop, handle });
        Ok(())
    }

    /// Stop reading and tell the rover to stop streaming.
    pub fn stop(&mut self) -> Result<()> {
        self.cancel()?;
        if let Err(err) = self.commands.send(Command::StopStream) {
            log::warn!("stop request not delivered: {:#}", err);
        }
        self.sink.status("video stream stopped");
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        active.stop.store(true, Ordering::SeqCst);
        let pipeline = active
            .handle
            .join()
            .map_err(|_| anyhow!("video stream thread panicked"))?;
        self.pipeline = Some(pipeline);
        Ok(())
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let Err(err) = self.cancel() {
            log::warn!("{:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::tests::RecordingSink;
    use crate::channel::CommandChannel;
    use crate::config::RoverConfig;
    use crate::connection::tests::{fast_settings, FakeConnector};
    use crate::connection::{ConnectionManager, ConnectionState};
    use crate::frame::tests::encode_jpeg;
    use crate::perception::{vision, LaneConfig, LaneFollower};
    use image::{Rgb, RgbImage};
    use std::io::Cursor;
    use std::time::Instant;

    fn lane_jpeg(from: (i32, i32), to: (i32, i32)) -> Vec<u8> {
        let mut image = RgbImage::new(160, 120);
        vision::draw_segment(
            &mut image,
            &vision::Segment::new(from.0, from.1, to.0, to.1),
            Rgb([255, 255, 255]),
            4,
        );
        encode_jpeg(&image)
    }

    fn pipeline_with(
        commands: Arc<dyn CommandSink>,
        sink: StatusSink,
    ) -> (VideoPipeline, Arc<Mutex<DriveArbiter>>) {
        let arbiter = Arc::new(Mutex::new(DriveArbiter::new()));
        let pipeline = VideoPipeline::new(
            Box::new(LaneFollower::new(LaneConfig::default())),
            arbiter.clone(),
            commands,
            sink,
            &RoverConfig::default().video,
        );
        (pipeline, arbiter)
    }

    #[test]
    fn split_frame_drives_left_once() {
        let commands = Arc::new(RecordingSink::default());
        let (sink, _rx) = StatusSink::bounded(16);
        let frames = sink.frames().unwrap();
        let (mut pipeline, arbiter) = pipeline_with(commands.clone(), sink);
        arbiter.lock().unwrap().start_autonomous();

        let jpeg = lane_jpeg((10, 70), (150, 110));
        let (head, tail) = jpeg.split_at(jpeg.len() / 2);
        assert_eq!(pipeline.feed(head), None);
        assert_eq!(pipeline.feed(tail), Some(Dispatch::Sent(Command::Left)));
        // Same picture again is debounced.
        assert_eq!(pipeline.feed(&jpeg), Some(Dispatch::Suppressed));

        assert_eq!(commands.sent(), vec![Command::Left]);
        let stats = pipeline.stats();
        assert_eq!(stats.frames_analyzed, 2);
        assert_eq!(stats.demux.frames_emitted, 2);
        assert_eq!(stats.bytes_read, 2 * jpeg.len() as u64);
        assert_eq!(frames.published(), 2);
        assert_eq!(frames.overwritten(), 1);
        assert!(frames.take().is_some());
    }

    #[test]
    fn manual_mode_analyses_without_sending() {
        let commands = Arc::new(RecordingSink::default());
        let (mut pipeline, _arbiter) = pipeline_with(commands.clone(), StatusSink::log_only());
        let dispatch = pipeline.feed(&lane_jpeg((10, 110), (150, 70)));
        assert_eq!(dispatch, Some(Dispatch::Ignored));
        assert!(commands.sent().is_empty());
        assert_eq!(pipeline.stats().frames_analyzed, 1);
    }

    #[test]
    fn only_newest_frame_of_a_read_is_analysed() {
        let commands = Arc::new(RecordingSink::default());
        let (mut pipeline, arbiter) = pipeline_with(commands.clone(), StatusSink::log_only());
        arbiter.lock().unwrap().start_autonomous();

        let mut bytes = lane_jpeg((10, 70), (150, 110));
        bytes.extend(lane_jpeg((10, 110), (150, 70)));
        assert_eq!(pipeline.feed(&bytes), Some(Dispatch::Sent(Command::Right)));
        let stats = pipeline.stats();
        assert_eq!(stats.frames_skipped, 1);
        assert_eq!(stats.frames_analyzed, 1);
    }

    #[test]
    fn undecodable_frame_is_counted_and_skipped() {
        let commands = Arc::new(RecordingSink::default());
        let (mut pipeline, arbiter) = pipeline_with(commands.clone(), StatusSink::log_only());
        arbiter.lock().unwrap().start_autonomous();

        assert_eq!(pipeline.feed(&[0xFF, 0xD8, 0x12, 0x34, 0xFF, 0xD9]), None);
        assert_eq!(pipeline.stats().decode_failures, 1);
        assert!(commands.sent().is_empty());

        // The stream carries on with the next good frame.
        let dispatch = pipeline.feed(&encode_jpeg(&RgbImage::new(64, 48)));
        assert_eq!(dispatch, Some(Dispatch::Sent(Command::Halt)));
    }

    #[test]
    fn run_reads_until_end_of_stream() {
        let commands = Arc::new(RecordingSink::default());
        let (mut pipeline, arbiter) = pipeline_with(commands.clone(), StatusSink::log_only());
        arbiter.lock().unwrap().start_autonomous();

        let mut bytes = vec![0x00; 100];
        bytes.extend(lane_jpeg((10, 100), (150, 94)));
        bytes.extend([0x00; 10]);
        let stop = AtomicBool::new(false);
        pipeline.run(Cursor::new(bytes), &stop).unwrap();
        assert_eq!(commands.sent(), vec![Command::Forward]);
    }

    #[test]
    fn run_honours_stop_flag() {
        let commands = Arc::new(RecordingSink::default());
        let (mut pipeline, _arbiter) = pipeline_with(commands, StatusSink::log_only());
        let stop = AtomicBool::new(true);
        pipeline
            .run(Cursor::new(lane_jpeg((10, 70), (150, 110))), &stop)
            .unwrap();
        assert_eq!(pipeline.stats().bytes_read, 0);
    }

    struct MemorySource(Vec<u8>);

    impl StreamSource for MemorySource {
        fn open(&self) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(Cursor::new(self.0.clone())))
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    /// Never ends; one byte every few milliseconds.
    struct EndlessSource;

    struct Trickle;

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(2));
            buf[0] = 0;
            Ok(1)
        }
    }

    impl StreamSource for EndlessSource {
        fn open(&self) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(Trickle))
        }

        fn describe(&self) -> String {
            "endless".to_string()
        }
    }

    /// Every opened reader blocks in `read` until the source is dropped.
    #[derive(Default)]
    struct StalledSource {
        release: Mutex<Vec<mpsc::Sender<()>>>,
    }

    struct Stalled(mpsc::Receiver<()>);

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    impl StreamSource for StalledSource {
        fn open(&self) -> Result<Box<dyn Read + Send>> {
            let (tx, rx) = mpsc::channel();
            self.release.lock().unwrap().push(tx);
            Ok(Box::new(Stalled(rx)))
        }

        fn describe(&self) -> String {
            "stalled".to_string()
        }
    }

    fn connected_channel() -> (ConnectionManager, FakeConnector, Arc<CommandChannel>) {
        let connector = FakeConnector::default();
        let manager =
            ConnectionManager::spawn(connector.clone(), fast_settings(), StatusSink::log_only())
                .unwrap();
        assert!(manager
            .handle()
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(5)));
        let channel = Arc::new(CommandChannel::new(manager.handle(), StatusSink::log_only()));
        (manager, connector, channel)
    }

    #[test]
    fn controller_toggles_stream_over_control_channel() {
        let (manager, connector, channel) = connected_channel();
        let (pipeline, arbiter) = pipeline_with(channel.clone(), StatusSink::log_only());
        arbiter.lock().unwrap().start_autonomous();
        let source = Arc::new(MemorySource(lane_jpeg((10, 70), (150, 110))));
        let mut controller =
            StreamController::new(source, pipeline, channel, StatusSink::log_only());

        controller.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        controller.stop().unwrap();

        assert_eq!(connector.sent(), vec!["start", "a", "stop"]);
        assert_eq!(controller.stats().frames_analyzed, 1);
        manager.shutdown().unwrap();
    }

    #[test]
    fn controller_refuses_without_connection() {
        let connector = FakeConnector::default();
        connector
            .failures_left
            .store(u64::MAX, std::sync::atomic::Ordering::SeqCst);
        let manager =
            ConnectionManager::spawn(connector.clone(), fast_settings(), StatusSink::log_only())
                .unwrap();
        let channel = Arc::new(CommandChannel::new(manager.handle(), StatusSink::log_only()));
        let (pipeline, _arbiter) = pipeline_with(channel.clone(), StatusSink::log_only());
        let mut controller = StreamController::new(
            Arc::new(MemorySource(Vec::new())),
            pipeline,
            channel,
            StatusSink::log_only(),
        );

        let err = controller.start().unwrap_err();
        assert!(err.to_string().contains("not connected"));
        assert!(!controller.is_running());
        assert!(connector.sent().is_empty());
        manager.shutdown().unwrap();
    }

    #[test]
    fn stop_cancels_endless_stream_and_restart_works() {
        let (manager, connector, channel) = connected_channel();
        let (pipeline, _arbiter) = pipeline_with(channel.clone(), StatusSink::log_only());
        let mut controller = StreamController::new(
            Arc::new(EndlessSource),
            pipeline,
            channel,
            StatusSink::log_only(),
        );

        controller.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(controller.is_running());
        controller.start().unwrap();
        assert!(controller.is_running());

        let started = Instant::now();
        controller.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!controller.is_running());
        assert_eq!(connector.sent(), vec!["start", "start", "stop"]);
        assert!(controller.stats().bytes_read > 0);
        manager.shutdown().unwrap();
    }

    #[test]
    fn stop_is_prompt_while_read_is_blocked() {
        let (manager, connector, channel) = connected_channel();
        let (pipeline, _arbiter) = pipeline_with(channel.clone(), StatusSink::log_only());
        let source = Arc::new(StalledSource::default());
        let mut controller =
            StreamController::new(source.clone(), pipeline, channel, StatusSink::log_only());

        controller.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(controller.is_running());

        let started = Instant::now();
        controller.stop().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
        assert!(!controller.is_running());

        // The pipeline came back, so a restart over a stalled stream works too.
        controller.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        controller.start().unwrap();
        controller.stop().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());

        assert_eq!(
            connector.sent(),
            vec!["start", "stop", "start", "start", "stop"]
        );
        manager.shutdown().unwrap();
        drop(controller);
        source.release.lock().unwrap().clear();
    }
}
