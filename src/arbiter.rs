//! Autonomous-drive state machine.
//!
//! `DriveArbiter` is the only writer of the drive mode and of `last_command`.
//! It turns a stream of per-frame steering signals into as few commands as
//! possible: a signal is dispatched only when it differs from the last command
//! sent. Leaving autonomous mode always sends exactly one halt.

use crate::channel::CommandSink;
use crate::command::{Command, DriveMode, SteeringSignal};
use crate::perception::DriveContext;

/// What the arbiter did with an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Sent(Command),
    /// Dispatched, but the channel reported a failure.
    Failed(Command),
    /// Same as the last command; debounced.
    Suppressed,
    /// No-signal, or not in autonomous mode.
    Ignored,
}

#[derive(Debug, Default)]
pub struct DriveArbiter {
    mode: DriveMode,
    last_command: Option<Command>,
}

impl DriveArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    pub fn is_autonomous(&self) -> bool {
        self.mode == DriveMode::Autonomous
    }

    pub fn last_command(&self) -> Option<Command> {
        self.last_command
    }

    /// Snapshot handed to perception for the next frame.
    pub fn context(&self) -> DriveContext {
        DriveContext {
            autonomous: self.is_autonomous(),
            last_command: self.last_command,
        }
    }

    pub fn start_autonomous(&mut self) {
        self.mode = DriveMode::Autonomous;
        self.last_command = None;
        log::info!("autonomous drive started");
    }

    /// Return to manual and send the fail-safe halt, whatever the prior state.
    pub fn stop_autonomous(&mut self, sink: &dyn CommandSink) -> Dispatch {
        self.mode = DriveMode::Manual;
        self.last_command = None;
        log::info!("autonomous drive stopped");
        dispatch(sink, Command::Halt)
    }

    /// Feed one perception result.
    pub fn on_signal(&mut self, signal: SteeringSignal, sink: &dyn CommandSink) -> Dispatch {
        if !self.is_autonomous() {
            return Dispatch::Ignored;
        }
        let Some(command) = signal.command() else {
            return Dispatch::Ignored;
        };
        if self.last_command == Some(command) {
            return Dispatch::Suppressed;
        }
        // Delivery is unconfirmed either way, so a failed send still counts.
        self.last_command = Some(command);
        dispatch(sink, command)
    }
}

fn dispatch(sink: &dyn CommandSink, command: Command) -> Dispatch {
    match sink.send(command) {
        Ok(()) => Dispatch::Sent(command),
        Err(err) => {
            log::warn!("drive command {} failed: {:#}", command, err);
            Dispatch::Failed(command)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Mutex<Vec<Command>>,
        pub(crate) fail: bool,
    }

    impl RecordingSink {
        pub(crate) fn sent(&self) -> Vec<Command> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CommandSink for RecordingSink {
        fn send(&self, command: Command) -> Result<()> {
            self.sent.lock().unwrap().push(command);
            if self.fail {
                bail!("link down");
            }
            Ok(())
        }
    }

    #[test]
    fn identical_signals_dispatch_once() {
        let sink = RecordingSink::default();
        let mut arbiter = DriveArbiter::new();
        arbiter.start_autonomous();
        for _ in 0..20 {
            arbiter.on_signal(SteeringSignal::Forward, &sink);
        }
        assert_eq!(sink.sent(), vec![Command::Forward]);
    }

    #[test]
    fn alternating_signals_dispatch_each_change() {
        let sink = RecordingSink::default();
        let mut arbiter = DriveArbiter::new();
        arbiter.start_autonomous();
        let signals = [
            SteeringSignal::Left,
            SteeringSignal::Left,
            SteeringSignal::Right,
            SteeringSignal::Left,
            SteeringSignal::Forward,
            SteeringSignal::Forward,
        ];
        let outcomes: Vec<Dispatch> = signals
            .iter()
            .map(|signal| arbiter.on_signal(*signal, &sink))
            .collect();
        assert_eq!(
            sink.sent(),
            vec![
                Command::Left,
                Command::Right,
                Command::Left,
                Command::Forward
            ]
        );
        assert_eq!(outcomes[1], Dispatch::Suppressed);
        assert_eq!(outcomes[5], Dispatch::Suppressed);
    }

    #[test]
    fn no_signal_neither_dispatches_nor_updates() {
        let sink = RecordingSink::default();
        let mut arbiter = DriveArbiter::new();
        arbiter.start_autonomous();
        arbiter.on_signal(SteeringSignal::Left, &sink);
        assert_eq!(
            arbiter.on_signal(SteeringSignal::NoSignal, &sink),
            Dispatch::Ignored
        );
        assert_eq!(arbiter.last_command(), Some(Command::Left));
        arbiter.on_signal(SteeringSignal::Left, &sink);
        assert_eq!(sink.sent(), vec![Command::Left]);
    }

    #[test]
    fn manual_mode_ignores_signals() {
        let sink = RecordingSink::default();
        let mut arbiter = DriveArbiter::new();
        assert_eq!(
            arbiter.on_signal(SteeringSignal::Forward, &sink),
            Dispatch::Ignored
        );
        assert!(sink.sent().is_empty());
        assert_eq!(arbiter.last_command(), None);
    }

    #[test]
    fn stop_always_sends_exactly_one_halt() {
        // Already manual.
        let sink = RecordingSink::default();
        let mut arbiter = DriveArbiter::new();
        assert_eq!(
            arbiter.stop_autonomous(&sink),
            Dispatch::Sent(Command::Halt)
        );
        assert_eq!(sink.sent(), vec![Command::Halt]);

        // Last command was already halt.
        let sink = RecordingSink::default();
        let mut arbiter = DriveArbiter::new();
        arbiter.start_autonomous();
        arbiter.on_signal(SteeringSignal::Halt, &sink);
        arbiter.stop_autonomous(&sink);
        assert_eq!(sink.sent(), vec![Command::Halt, Command::Halt]);
        assert_eq!(arbiter.mode(), DriveMode::Manual);
        assert_eq!(arbiter.last_command(), None);
    }

    #[test]
    fn restart_resets_debounce() {
        let sink = RecordingSink::default();
        let mut arbiter = DriveArbiter::new();
        arbiter.start_autonomous();
        arbiter.on_signal(SteeringSignal::Forward, &sink);
        arbiter.start_autonomous();
        arbiter.on_signal(SteeringSignal::Forward, &sink);
        assert_eq!(sink.sent(), vec![Command::Forward, Command::Forward]);
    }

    #[test]
    fn failed_send_still_updates_last_command() {
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let mut arbiter = DriveArbiter::new();
        arbiter.start_autonomous();
        assert_eq!(
            arbiter.on_signal(SteeringSignal::Right, &sink),
            Dispatch::Failed(Command::Right)
        );
        assert_eq!(
            arbiter.on_signal(SteeringSignal::Right, &sink),
            Dispatch::Suppressed
        );
        assert_eq!(arbiter.last_command(), Some(Command::Right));
    }
}
