//! Command tags: the two-byte envelope opening every message.

use crate::channel::{ChannelConsumer, ChannelProducer, InBuffer, OutBuffer};
use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;
use std::io::{Read, Write};

/// First byte of every command tag.
pub const MAGIC: u8 = 0xA7;

/// Length of a command tag on the wire.
pub const TAG_LEN: usize = 2;

/// The command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client binds a journal index to a journal key.
    SetKey,
    /// Client reports its state for one journal index.
    DeltaRequest,
    /// Client is ready to receive deltas.
    ClientReady,
    /// Server pushes a journal delta.
    JournalDelta,
    /// Server finished pushing deltas for this cycle.
    ServerReady,
    /// Server is alive but has nothing to say.
    ServerHeartbeat,
    /// Server answers a request with text.
    StringResponse,
}

impl Command {
    /// Returns the wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Command::SetKey => 0x01,
            Command::DeltaRequest => 0x02,
            Command::ClientReady => 0x03,
            Command::JournalDelta => 0x04,
            Command::ServerReady => 0x05,
            Command::ServerHeartbeat => 0x06,
            Command::StringResponse => 0x07,
        }
    }

    /// Returns the two-byte tag.
    #[must_use]
    pub const fn tag(self) -> [u8; TAG_LEN] {
        [MAGIC, self.code()]
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(Command::SetKey),
            0x02 => Ok(Command::DeltaRequest),
            0x03 => Ok(Command::ClientReady),
            0x04 => Ok(Command::JournalDelta),
            0x05 => Ok(Command::ServerReady),
            0x06 => Ok(Command::ServerHeartbeat),
            0x07 => Ok(Command::StringResponse),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::SetKey => "SET_KEY",
            Command::DeltaRequest => "DELTA_REQUEST",
            Command::ClientReady => "CLIENT_READY",
            Command::JournalDelta => "JOURNAL_DELTA",
            Command::ServerReady => "SERVER_READY",
            Command::ServerHeartbeat => "SERVER_HEARTBEAT",
            Command::StringResponse => "STRING_RESPONSE",
        };
        f.write_str(name)
    }
}

/// Writes a command tag.
#[derive(Debug)]
pub struct CommandProducer {
    out: OutBuffer,
}

impl CommandProducer {
    /// Creates a producer for `command`.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            out: OutBuffer::new(command.tag().to_vec()),
        }
    }
}

impl ChannelProducer for CommandProducer {
    fn has_content(&self) -> bool {
        true
    }

    fn write(&mut self, channel: &mut dyn Write) -> ProtocolResult<bool> {
        self.out.drain(channel)
    }
}

/// Reads a command tag.
///
/// A wrong magic byte is fatal. An unknown code is not: the tag is still
/// complete and [`CommandConsumer::command`] reports the code so the caller
/// can reject it and carry on.
#[derive(Debug)]
pub struct CommandConsumer {
    tag: InBuffer,
    code: Option<u8>,
}

impl Default for CommandConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandConsumer {
    /// Creates a consumer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tag: InBuffer::new(TAG_LEN),
            code: None,
        }
    }

    /// Returns true if part of a tag has been read.
    #[must_use]
    pub fn is_started(&self) -> bool {
        !self.tag.is_empty() || self.code.is_some()
    }

    /// Returns the raw code of the tag read.
    #[must_use]
    pub fn code(&self) -> Option<u8> {
        self.code
    }

    /// Returns the command read, `Some(Err(..))` for an unknown code.
    #[must_use]
    pub fn command(&self) -> Option<ProtocolResult<Command>> {
        self.code.map(Command::try_from)
    }
}

impl ChannelConsumer for CommandConsumer {
    fn reset(&mut self) {
        self.tag.expect(TAG_LEN);
        self.code = None;
    }

    fn read(&mut self, channel: &mut dyn Read) -> ProtocolResult<()> {
        if self.code.is_some() || !self.tag.fill(channel)? {
            return Ok(());
        }
        let bytes = self.tag.take();
        if bytes[0] != MAGIC {
            return Err(ProtocolError::BadMagic {
                found: bytes[0],
                expected: MAGIC,
            });
        }
        self.code = Some(bytes[1]);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.code.is_some()
    }
}
