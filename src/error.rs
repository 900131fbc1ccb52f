//! Error types shared by the codec, the session store and the storage engine.
//!
//! Framing errors are terminal for the connection. Everything else is an
//! application failure that travels back to the peer as a normal response.

use thiserror::Error;

/// Wire-level decoding failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too large: {len} bytes (max: {max} bytes)")]
    TooLarge { len: usize, max: usize },

    #[error("frame carries no command tag")]
    Empty,

    #[error("unknown command tag: {0}")]
    UnknownCommand(u8),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("{0} is not valid utf-8")]
    InvalidUtf8(&'static str),

    #[error("unknown response status: {0}")]
    InvalidStatus(u8),
}

/// Failures of the per-user storage engine.
///
/// `Display` output is what the user sees, so [`StorageError::Io`] must not
/// be formatted onto the wire.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Unknown session. Please sign up or sign in and try again.")]
    NoSession,

    #[error("Invalid path passed. You have no access to files outside your folder.")]
    AccessDenied,

    #[error("File not found.")]
    NotFound,

    #[error("File is too large to transfer ({size} bytes, limit {max} bytes).")]
    TooLarge { size: u64, max: u64 },

    #[error("storage i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of sign-up and sign-in.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("There is an active session with such address already.")]
    AddressHasSession,

    #[error("User with such login is already registered.")]
    LoginTaken,

    #[error("This user already has an active session.")]
    LoginHasSession,

    #[error("There is no user with such login.")]
    UnknownLogin,

    #[error("Wrong password.")]
    WrongPassword,

    #[error("Address is still banned. Please try again later.")]
    Banned,

    #[error("Address is banned due to excessive number of signing in attempts.\nPlease wait {minutes} minutes and try again.")]
    NowBanned { minutes: u64 },

    #[error("Failed to create user folder.")]
    SandboxUnavailable,
}

/// Input rejected on the client before anything is sent.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Wrong input. Please enter space-separated command and arguments")]
    Empty,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Wrong number of arguments. {0}")]
    WrongArguments(&'static str),

    #[error(
        "Cannot upload {}: request would be {size} bytes, limit is {max} bytes",
        path.display()
    )]
    TooLarge {
        path: std::path::PathBuf,
        size: u64,
        max: usize,
    },

    #[error("Cannot read {}: {reason}", path.display())]
    LocalFile {
        path: std::path::PathBuf,
        reason: String,
    },
}
