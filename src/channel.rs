//! Outbound drive commands.

use anyhow::Result;

use crate::command::Command;
use crate::connection::LinkHandle;
use crate::status::StatusSink;

/// Anything that can deliver a command to the rover.
///
/// Delivery is fire-and-forget: `Ok(())` means the token was written, not that
/// the rover acted on it.
pub trait CommandSink: Send + Sync {
    fn send(&self, command: Command) -> Result<()>;

    fn is_connected(&self) -> bool {
        true
    }
}

/// Sends command tokens over the managed control connection.
///
/// Never reconnects or retries on its own; connection state belongs to the
/// `ConnectionManager`.
#[derive(Clone)]
pub struct CommandChannel {
    link: LinkHandle,
    sink: StatusSink,
}

impl CommandChannel {
    pub fn new(link: LinkHandle, sink: StatusSink) -> Self {
        Self { link, sink }
    }
}

impl CommandSink for CommandChannel {
    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn send(&self, command: Command) -> Result<()> {
        match self.link.send_text(command.token()) {
            Ok(()) => {
                self.sink.status(format!("sent command: {}", command));
                Ok(())
            }
            Err(err) => {
                self.sink
                    .status(format!("command '{}' not sent: {:#}", command, err));
                Err(err)
            }
        }
    }
}
