//! Shared protocol constants for the cloudstore framed transport

use std::fmt;

use crate::error::FrameError;

// Length prefix: u32 big-endian, counts tag + body but not itself
pub const LENGTH_PREFIX_SIZE: usize = 4;

// Tag byte that opens every payload
pub const TAG_SIZE: usize = 1;

// Default cap on a declared frame length (64MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// Wire tags (keep numeric stable)
pub mod tag {
    pub const MESSAGE: u8 = 0;
    pub const PING: u8 = 1;
    pub const TIME: u8 = 2;
    pub const SIGN_UP: u8 = 3;
    pub const SIGN_IN: u8 = 4;
    pub const SIGN_OUT: u8 = 5;
    pub const UPLOAD: u8 = 6;
    pub const DOWNLOAD: u8 = 7;
    pub const MOVE: u8 = 8;
}

// SignInResponse status byte
pub mod status {
    pub const SUCCESS: u8 = 1;
    pub const FAILURE: u8 = 2;
}

// Brute-force protection defaults
pub mod limits {
    // Attempts allowed per address before the next one is converted into a ban
    pub const SIGN_IN_ATTEMPTS: u32 = 3;

    // Ban window (5 minutes)
    pub const BAN_WINDOW_SECS: u64 = 5 * 60;
}

/// Every command the protocol knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Command {
    Message = tag::MESSAGE,
    Ping = tag::PING,
    Time = tag::TIME,
    SignUp = tag::SIGN_UP,
    SignIn = tag::SIGN_IN,
    SignOut = tag::SIGN_OUT,
    Upload = tag::UPLOAD,
    Download = tag::DOWNLOAD,
    Move = tag::MOVE,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::Message,
        Command::Ping,
        Command::Time,
        Command::SignUp,
        Command::SignIn,
        Command::SignOut,
        Command::Upload,
        Command::Download,
        Command::Move,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Canonical upper-case name, e.g. `SIGN_UP`.
    pub fn name(self) -> &'static str {
        match self {
            Command::Message => "MESSAGE",
            Command::Ping => "PING",
            Command::Time => "TIME",
            Command::SignUp => "SIGN_UP",
            Command::SignIn => "SIGN_IN",
            Command::SignOut => "SIGN_OUT",
            Command::Upload => "UPLOAD",
            Command::Download => "DOWNLOAD",
            Command::Move => "MOVE",
        }
    }

    /// Commands that open or close a session.
    pub fn changes_session(self) -> bool {
        matches!(self, Command::SignUp | Command::SignIn | Command::SignOut)
    }

    /// Resolve a user-typed command name.
    ///
    /// Matching ignores case and underscores, so `sign_up`, `SIGNUP` and
    /// `SignUp` all resolve to [`Command::SignUp`].
    pub fn from_name(input: &str) -> Option<Command> {
        let wanted: String = input
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if wanted.is_empty() {
            return None;
        }
        Command::ALL
            .into_iter()
            .find(|cmd| cmd.name().replace('_', "") == wanted)
    }
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            tag::MESSAGE => Ok(Command::Message),
            tag::PING => Ok(Command::Ping),
            tag::TIME => Ok(Command::Time),
            tag::SIGN_UP => Ok(Command::SignUp),
            tag::SIGN_IN => Ok(Command::SignIn),
            tag::SIGN_OUT => Ok(Command::SignOut),
            tag::UPLOAD => Ok(Command::Upload),
            tag::DOWNLOAD => Ok(Command::Download),
            tag::MOVE => Ok(Command::Move),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        cmd.tag()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Centralized timeout constants
pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 5_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 100;

    // Calculate write deadline based on payload size (ms)
    // 5s base + 100ms per 1MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64).div_ceil(1_048_576);
        WRITE_BASE_MS + mb * PER_MB_MS
    }
}
