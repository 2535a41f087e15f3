//! Drive command vocabulary.
//!
//! The rover firmware understands a fixed set of single-token text messages.
//! `Command` is the only way to express one, so an out-of-vocabulary token can
//! never reach the control channel: parsing rejects it first.

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

/// One token from the rover's command vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Forward,
    Left,
    Reverse,
    Right,
    Halt,
    /// Ask the rover to start pushing video.
    StartStream,
    /// Ask the rover to stop pushing video.
    StopStream,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::Forward,
        Command::Left,
        Command::Reverse,
        Command::Right,
        Command::Halt,
        Command::StartStream,
        Command::StopStream,
    ];

    /// Wire token sent over the control channel.
    pub fn token(self) -> &'static str {
        match self {
            Command::Forward => "w",
            Command::Left => "a",
            Command::Reverse => "s",
            Command::Right => "d",
            Command::Halt => "halt",
            Command::StartStream => "start",
            Command::StopStream => "stop",
        }
    }

    /// True for commands that move (or stop) the wheels.
    pub fn is_drive(self) -> bool {
        !matches!(self, Command::StartStream | Command::StopStream)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim();
        Command::ALL
            .into_iter()
            .find(|command| command.token() == token)
            .ok_or_else(|| anyhow!("'{}' is not a rover command", token))
    }
}

/// Per-frame steering decision produced by perception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SteeringSignal {
    Forward,
    Left,
    Right,
    Halt,
    /// Not enough evidence in this frame to decide anything.
    NoSignal,
}

impl SteeringSignal {
    /// The drive command this signal asks for, if any.
    pub fn command(self) -> Option<Command> {
        match self {
            SteeringSignal::Forward => Some(Command::Forward),
            SteeringSignal::Left => Some(Command::Left),
            SteeringSignal::Right => Some(Command::Right),
            SteeringSignal::Halt => Some(Command::Halt),
            SteeringSignal::NoSignal => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DriveMode {
    #[default]
    Manual,
    Autonomous,
}
