//! Command tables, built once at start-up and shared read-only.
//!
//! The client table maps a command to a request builder (text arguments to
//! body bytes) and a response tag to an interpreter (body to user-visible
//! text). The server table maps a request tag to the handler producing the
//! response payload.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::auth::SessionStore;
use crate::error::{InputError, StorageError};
use crate::logger::AuditLogger;
use crate::protocol::{Command, MAX_FRAME_SIZE, TAG_SIZE};
use crate::protocol_core::{
    decode_time, encode_time, Credential, MoveRequest, Payload, SignInResponse, UploadRequest,
};
use crate::sandbox::ensure_parent_exists;

// ── Client side ──────────────────────────────────────────────────────

/// Client state touched by builders and interpreters.
#[derive(Debug)]
pub struct ClientState {
    /// `login /path` once signed in.
    pub working_dir: Option<String>,
    /// Where the body of the outstanding DOWNLOAD goes.
    pub pending_download: Option<PathBuf>,
    /// Largest frame the server accepts; bigger requests fail locally.
    pub max_frame_size: usize,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            working_dir: None,
            pending_download: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ClientState {
    pub fn prompt(&self) -> String {
        format!("<{}>:", self.working_dir.as_deref().unwrap_or(""))
    }

    /// Forget per-command state once a request/response cycle ends.
    pub fn finish_cycle(&mut self) {
        self.pending_download = None;
    }
}

pub type BuildFn = fn(&[String], &mut ClientState) -> Result<Vec<u8>, InputError>;
pub type InterpretFn = fn(&[u8], &mut ClientState) -> Result<String>;

#[derive(Clone, Copy)]
pub struct RequestBuilder {
    pub usage: &'static str,
    pub about: &'static str,
    pub build: BuildFn,
}

pub struct ClientRegistry {
    builders: HashMap<Command, RequestBuilder>,
    interpreters: HashMap<Command, InterpretFn>,
}

pub struct ClientRegistryBuilder {
    builders: HashMap<Command, RequestBuilder>,
    interpreters: HashMap<Command, InterpretFn>,
}

impl ClientRegistryBuilder {
    pub fn request(mut self, command: Command, builder: RequestBuilder) -> Result<Self> {
        if self.builders.insert(command, builder).is_some() {
            bail!("request builder for {command} registered twice");
        }
        Ok(self)
    }

    pub fn response(mut self, command: Command, interpret: InterpretFn) -> Result<Self> {
        if self.interpreters.insert(command, interpret).is_some() {
            bail!("response interpreter for {command} registered twice");
        }
        Ok(self)
    }

    pub fn build(self) -> ClientRegistry {
        ClientRegistry {
            builders: self.builders,
            interpreters: self.interpreters,
        }
    }
}

impl ClientRegistry {
    pub fn builder() -> ClientRegistryBuilder {
        ClientRegistryBuilder {
            builders: HashMap::new(),
            interpreters: HashMap::new(),
        }
    }

    /// Every command the interactive client understands.
    pub fn standard() -> Result<Self> {
        Ok(Self::builder()
            .request(Command::Ping, RequestBuilder {
                usage: "ping words...",
                about: "Server will reply with the same message",
                build: build_ping,
            })?
            .request(Command::Time, RequestBuilder {
                usage: "time",
                about: "Get the server time",
                build: build_time,
            })?
            .request(Command::SignUp, RequestBuilder {
                usage: "signUp login password",
                about: "Sign up on the server with the given login and password",
                build: build_credential,
            })?
            .request(Command::SignIn, RequestBuilder {
                usage: "signIn login password",
                about: "Sign in on the server with the given login and password",
                build: build_credential,
            })?
            .request(Command::SignOut, RequestBuilder {
                usage: "signOut",
                about: "Sign out from the server",
                build: build_sign_out,
            })?
            .request(Command::Upload, RequestBuilder {
                usage: "upload localPath cloudPath",
                about: "Upload a local file to your cloud folder",
                build: build_upload,
            })?
            .request(Command::Download, RequestBuilder {
                usage: "download cloudPath localPath",
                about: "Download a file from your cloud folder",
                build: build_download,
            })?
            .request(Command::Move, RequestBuilder {
                usage: "move cloudPathFrom cloudPathTo",
                about: "Move or rename a file inside your cloud folder",
                build: build_move,
            })?
            .response(Command::Message, interpret_text)?
            .response(Command::Ping, interpret_ping)?
            .response(Command::Time, interpret_time)?
            .response(Command::SignUp, interpret_text)?
            .response(Command::SignIn, interpret_sign_in)?
            .response(Command::SignOut, interpret_sign_out)?
            .response(Command::Upload, interpret_text)?
            .response(Command::Download, interpret_download)?
            .response(Command::Move, interpret_text)?
            .build())
    }

    /// Turns one input line into the request payload, or a local failure.
    pub fn prepare(&self, line: &str, state: &mut ClientState) -> Result<Payload, InputError> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(InputError::Empty)?;
        let command = Command::from_name(name)
            .ok_or_else(|| InputError::UnknownCommand(name.to_string()))?;
        let builder = self
            .builders
            .get(&command)
            .ok_or_else(|| InputError::UnknownCommand(name.to_string()))?;
        let args: Vec<String> = words.map(str::to_string).collect();
        let body = (builder.build)(&args, state)?;
        Ok(Payload::new(command, body))
    }

    /// Renders a server response for the user.
    pub fn interpret(&self, payload: &Payload, state: &mut ClientState) -> Result<String> {
        let interpret = self
            .interpreters
            .get(&payload.command)
            .ok_or_else(|| anyhow!("unexpected {} response", payload.command))?;
        interpret(&payload.body, state)
    }

    pub fn help(&self) -> String {
        let mut entries: Vec<_> = self.builders.iter().collect();
        entries.sort_by_key(|(cmd, _)| **cmd);
        let mut out = String::new();
        out.push_str("<> means that you are not signed in yet.\n");
        out.push_str("<login /dir> shows your login and working directory.\n");
        out.push_str("Available commands:\n");
        for (_, b) in entries {
            out.push_str(&format!("{}\n\t{}\n", b.usage, b.about));
        }
        out.push_str("exit\n\tShutdown client\n");
        out.push_str("help\n\tShow this message");
        out
    }
}

fn expect_args(args: &[String], count: usize, usage: &'static str) -> Result<(), InputError> {
    if args.len() != count {
        return Err(InputError::WrongArguments(usage));
    }
    Ok(())
}

fn build_ping(args: &[String], _: &mut ClientState) -> Result<Vec<u8>, InputError> {
    Ok(args.join(" ").into_bytes())
}

fn build_time(args: &[String], _: &mut ClientState) -> Result<Vec<u8>, InputError> {
    expect_args(args, 0, "time takes no arguments")?;
    Ok(Vec::new())
}

fn build_credential(args: &[String], _: &mut ClientState) -> Result<Vec<u8>, InputError> {
    expect_args(args, 2, "You have to pass only login and password")?;
    Ok(Credential::new(&args[0], &args[1]).encode())
}

fn build_sign_out(args: &[String], _: &mut ClientState) -> Result<Vec<u8>, InputError> {
    expect_args(args, 0, "signOut takes no arguments")?;
    Ok(Vec::new())
}

fn build_upload(args: &[String], state: &mut ClientState) -> Result<Vec<u8>, InputError> {
    expect_args(
        args,
        2,
        "You have to pass only path to file and path to save file on server",
    )?;
    let local = expand_home(&args[0]);
    let unreadable = |e: std::io::Error| InputError::LocalFile {
        path: local.clone(),
        reason: e.to_string(),
    };
    // tag + path length field + path + file contents
    let overhead = (TAG_SIZE + 4 + args[1].len()) as u64;
    let too_large = |size: u64| InputError::TooLarge {
        path: local.clone(),
        size,
        max: state.max_frame_size,
    };

    let declared = overhead + std::fs::metadata(&local).map_err(unreadable)?.len();
    if declared > state.max_frame_size as u64 {
        return Err(too_large(declared));
    }
    let data = std::fs::read(&local).map_err(unreadable)?;
    let body = UploadRequest {
        path: args[1].clone(),
        data,
    }
    .encode();
    // the file may have grown since it was measured
    let actual = (TAG_SIZE + body.len()) as u64;
    if actual > state.max_frame_size as u64 {
        return Err(too_large(actual));
    }
    Ok(body)
}

fn build_download(args: &[String], state: &mut ClientState) -> Result<Vec<u8>, InputError> {
    expect_args(
        args,
        2,
        "You have to pass only path to file in cloud and path to save file",
    )?;
    state.pending_download = Some(expand_home(&args[1]));
    Ok(args[0].clone().into_bytes())
}

fn build_move(args: &[String], _: &mut ClientState) -> Result<Vec<u8>, InputError> {
    expect_args(
        args,
        2,
        "You have to pass only path of file in cloud to move and its new path",
    )?;
    Ok(MoveRequest {
        source: args[0].clone(),
        dest: args[1].clone(),
    }
    .encode())
}

/// `~` or `~/...` expands to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn interpret_text(body: &[u8], _: &mut ClientState) -> Result<String> {
    Ok(String::from_utf8_lossy(body).into_owned())
}

fn interpret_ping(body: &[u8], _: &mut ClientState) -> Result<String> {
    Ok(format!("ping {}", String::from_utf8_lossy(body)))
}

fn interpret_time(body: &[u8], _: &mut ClientState) -> Result<String> {
    let millis = decode_time(body)?;
    let at = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow!("server time {millis} out of range"))?;
    Ok(at.with_timezone(&Local).to_rfc3339())
}

fn interpret_sign_in(body: &[u8], state: &mut ClientState) -> Result<String> {
    match SignInResponse::decode(body)? {
        SignInResponse::Success { login, working_dir } => {
            state.working_dir = Some(format!("{login} {working_dir}"));
            Ok("Signed in successfully".to_string())
        }
        SignInResponse::Failure { message } => {
            Ok(message.unwrap_or_else(|| "Failed to sign in.".to_string()))
        }
    }
}

fn interpret_sign_out(_: &[u8], state: &mut ClientState) -> Result<String> {
    state.working_dir = None;
    Ok("Signed out".to_string())
}

fn interpret_download(body: &[u8], state: &mut ClientState) -> Result<String> {
    let target = state
        .pending_download
        .take()
        .ok_or_else(|| anyhow!("Got unwanted DOWNLOAD payload"))?;
    let saved = ensure_parent_exists(&target).and_then(|_| std::fs::write(&target, body));
    Ok(match saved {
        Ok(()) => format!("File saved to {}", target.display()),
        Err(e) => format!("Failed to save file from cloud: {e}"),
    })
}

// ── Server side ──────────────────────────────────────────────────────

/// What a server handler may touch while serving one request.
pub struct RequestContext<'a> {
    pub peer: SocketAddr,
    /// Frame cap shared with the peer; responses must stay under it.
    pub max_frame_size: usize,
    pub sessions: &'a SessionStore,
    pub audit: &'a dyn AuditLogger,
}

pub type HandlerFn = fn(&[u8], &RequestContext<'_>) -> Payload;

pub struct ServerRegistry {
    handlers: HashMap<Command, HandlerFn>,
}

impl ServerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(mut self, command: Command, handler: HandlerFn) -> Result<Self> {
        if self.handlers.insert(command, handler).is_some() {
            bail!("handler for {command} registered twice");
        }
        Ok(self)
    }

    pub fn standard() -> Result<Self> {
        Self::empty()
            .register(Command::Ping, handle_ping)?
            .register(Command::Time, handle_time)?
            .register(Command::SignUp, handle_sign_up)?
            .register(Command::SignIn, handle_sign_in)?
            .register(Command::SignOut, handle_sign_out)?
            .register(Command::Upload, handle_upload)?
            .register(Command::Download, handle_download)?
            .register(Command::Move, handle_move)
    }

    /// Runs the handler for `request`. A tag without handler gets a MESSAGE reply.
    pub fn dispatch(&self, request: &Payload, ctx: &RequestContext<'_>) -> Payload {
        match self.handlers.get(&request.command) {
            Some(handler) => handler(&request.body, ctx),
            None => {
                debug!(peer = %ctx.peer, command = %request.command, "no handler for command");
                Payload::message("The server can't handle this command.")
            }
        }
    }
}

fn malformed(ctx: &RequestContext<'_>, command: Command, e: impl std::fmt::Display) -> Payload {
    debug!(peer = %ctx.peer, command = %command, error = %e, "malformed request body");
    Payload::message(format!("Malformed {command} request: {e}"))
}

/// Logs full I/O detail locally and returns a generic line for the wire.
fn storage_failure(
    ctx: &RequestContext<'_>,
    what: &str,
    e: &StorageError,
    generic: &'static str,
) -> String {
    match e {
        StorageError::Io(io) => {
            error!(peer = %ctx.peer, error = %io, "{what} failed");
            ctx.audit.error(what, ctx.peer, &io.to_string());
            generic.to_string()
        }
        other => other.to_string(),
    }
}

fn handle_ping(body: &[u8], _: &RequestContext<'_>) -> Payload {
    Payload::new(Command::Ping, body)
}

fn handle_time(_: &[u8], _: &RequestContext<'_>) -> Payload {
    Payload::new(Command::Time, encode_time(chrono::Utc::now().timestamp_millis()))
}

fn handle_sign_up(body: &[u8], ctx: &RequestContext<'_>) -> Payload {
    let credential = match Credential::decode(body) {
        Ok(c) => c,
        Err(e) => return malformed(ctx, Command::SignUp, e),
    };
    match ctx.sessions.sign_up(ctx.peer, &credential) {
        Ok(working_dir) => Payload::new(
            Command::SignIn,
            SignInResponse::Success {
                login: credential.login,
                working_dir,
            }
            .encode(),
        ),
        Err(e) => Payload::new(Command::SignUp, e.to_string()),
    }
}

fn handle_sign_in(body: &[u8], ctx: &RequestContext<'_>) -> Payload {
    let credential = match Credential::decode(body) {
        Ok(c) => c,
        Err(e) => return malformed(ctx, Command::SignIn, e),
    };
    let response = match ctx.sessions.sign_in(ctx.peer, &credential) {
        Ok(working_dir) => SignInResponse::Success {
            login: credential.login,
            working_dir,
        },
        Err(e) => SignInResponse::failure(e.to_string()),
    };
    Payload::new(Command::SignIn, response.encode())
}

fn handle_sign_out(_: &[u8], ctx: &RequestContext<'_>) -> Payload {
    ctx.sessions.sign_out(ctx.peer);
    Payload::empty(Command::SignOut)
}

fn handle_upload(body: &[u8], ctx: &RequestContext<'_>) -> Payload {
    let request = match UploadRequest::decode(body) {
        Ok(r) => r,
        Err(e) => return malformed(ctx, Command::Upload, e),
    };
    let result = ctx.sessions.require_login(ctx.peer).and_then(|login| {
        let stored = ctx
            .sessions
            .storage()
            .upload(&login, &request.path, &request.data)?;
        Ok((login, stored))
    });
    match result {
        Ok((login, stored)) => {
            ctx.audit.stored(&login, &stored, request.data.len() as u64);
            Payload::message("File uploaded successfully.")
        }
        Err(e) => {
            let reason = storage_failure(
                ctx,
                "upload",
                &e,
                "Error occurred while trying to write a file on server.",
            );
            Payload::message(format!("Failed to upload file.\n{reason}"))
        }
    }
}

fn handle_download(body: &[u8], ctx: &RequestContext<'_>) -> Payload {
    let path = match std::str::from_utf8(body) {
        Ok(p) => p,
        Err(e) => return malformed(ctx, Command::Download, e),
    };
    let result = ctx.sessions.require_login(ctx.peer).and_then(|login| {
        let limit = ctx.max_frame_size.saturating_sub(TAG_SIZE) as u64;
        let (source, bytes) = ctx.sessions.storage().download_within(&login, path, limit)?;
        Ok((login, source, bytes))
    });
    match result {
        Ok((login, source, bytes)) => {
            ctx.audit.sent(&login, &source, bytes.len() as u64);
            Payload::new(Command::Download, bytes)
        }
        Err(e) => Payload::message(storage_failure(
            ctx,
            "download",
            &e,
            "Failed to download file from cloud.",
        )),
    }
}

fn handle_move(body: &[u8], ctx: &RequestContext<'_>) -> Payload {
    let request = match MoveRequest::decode(body) {
        Ok(r) => r,
        Err(e) => return malformed(ctx, Command::Move, e),
    };
    let result = ctx.sessions.require_login(ctx.peer).and_then(|login| {
        let (from, to) = ctx
            .sessions
            .storage()
            .move_file(&login, &request.source, &request.dest)?;
        Ok((login, from, to))
    });
    match result {
        Ok((login, from, to)) => {
            ctx.audit.moved(&login, &from, &to);
            Payload::message("File moved successfully.")
        }
        Err(e) => Payload::message(storage_failure(ctx, "move", &e, "Failed to move a file.")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthPolicy;
    use crate::logger::NoopLogger;
    use crate::sandbox::Storage;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sessions(tmp: &TempDir) -> SessionStore {
        let storage = Arc::new(Storage::open(tmp.path()).unwrap());
        SessionStore::new(storage, AuthPolicy::default(), Arc::new(NoopLogger))
    }

    fn ctx<'a>(sessions: &'a SessionStore, port: u16) -> RequestContext<'a> {
        RequestContext {
            peer: SocketAddr::from(([127, 0, 0, 1], port)),
            max_frame_size: MAX_FRAME_SIZE,
            sessions,
            audit: &NoopLogger,
        }
    }

    fn text(p: &Payload) -> String {
        String::from_utf8(p.body.clone()).unwrap()
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let err = ServerRegistry::empty()
            .register(Command::Ping, handle_ping)
            .unwrap()
            .register(Command::Ping, handle_ping);
        assert!(err.is_err());

        let err = ClientRegistry::builder()
            .response(Command::Message, interpret_text)
            .unwrap()
            .response(Command::Message, interpret_text);
        assert!(err.is_err());
    }

    #[test]
    fn test_standard_tables_build() {
        assert!(ServerRegistry::standard().is_ok());
        assert!(ClientRegistry::standard().is_ok());
    }

    #[test]
    fn test_prepare_local_failures() {
        let reg = ClientRegistry::standard().unwrap();
        let mut state = ClientState::default();
        assert!(matches!(reg.prepare("   ", &mut state), Err(InputError::Empty)));
        assert!(matches!(reg.prepare("delete x", &mut state), Err(InputError::UnknownCommand(_))));
        assert!(matches!(
            reg.prepare("message hi", &mut state),
            Err(InputError::UnknownCommand(_))
        ));
        assert!(matches!(
            reg.prepare("signIn alice", &mut state),
            Err(InputError::WrongArguments(_))
        ));
        assert!(matches!(reg.prepare("time now", &mut state), Err(InputError::WrongArguments(_))));
        assert!(matches!(
            reg.prepare("upload /definitely/not/here.txt /a.txt", &mut state),
            Err(InputError::LocalFile { .. })
        ));
    }

    #[test]
    fn test_prepare_builds_bodies() {
        let reg = ClientRegistry::standard().unwrap();
        let mut state = ClientState::default();

        let p = reg.prepare("ping hello   world", &mut state).unwrap();
        assert_eq!(p, Payload::new(Command::Ping, b"hello world".to_vec()));

        let p = reg.prepare("SIGN_UP alice pw1", &mut state).unwrap();
        assert_eq!(p.command, Command::SignUp);
        assert_eq!(Credential::decode(&p.body).unwrap(), Credential::new("alice", "pw1"));

        let p = reg.prepare("move /a /b", &mut state).unwrap();
        assert_eq!(MoveRequest::decode(&p.body).unwrap().dest, "/b");

        let p = reg.prepare("download /notes/a.txt /tmp/out.txt", &mut state).unwrap();
        assert_eq!(p.body, b"/notes/a.txt");
        assert_eq!(state.pending_download, Some(PathBuf::from("/tmp/out.txt")));
        state.finish_cycle();
        assert!(state.pending_download.is_none());

        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("a.txt");
        std::fs::write(&local, b"contents").unwrap();
        let p = reg
            .prepare(&format!("upload {} /notes/a.txt", local.display()), &mut state)
            .unwrap();
        let req = UploadRequest::decode(&p.body).unwrap();
        assert_eq!(req.path, "/notes/a.txt");
        assert_eq!(req.data, b"contents");
    }

    #[test]
    fn test_upload_over_frame_cap_fails_locally() {
        let reg = ClientRegistry::standard().unwrap();
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("big.bin");
        std::fs::write(&local, vec![0u8; 4096]).unwrap();
        let line = format!("upload {} /big.bin", local.display());

        let mut state = ClientState {
            max_frame_size: 1024,
            ..Default::default()
        };
        match reg.prepare(&line, &mut state) {
            Err(InputError::TooLarge { size, max, .. }) => {
                assert_eq!(size, 4096 + 4 + 8 + 1);
                assert_eq!(max, 1024);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }

        // exactly at the cap is still allowed
        state.max_frame_size = 4096 + 4 + 8 + 1;
        assert!(reg.prepare(&line, &mut state).is_ok());
    }

    #[test]
    fn test_interpret_sign_in_and_out_update_prompt() {
        let reg = ClientRegistry::standard().unwrap();
        let mut state = ClientState::default();
        assert_eq!(state.prompt(), "<>:");

        let ok = Payload::new(
            Command::SignIn,
            SignInResponse::Success {
                login: "alice".into(),
                working_dir: "/".into(),
            }
            .encode(),
        );
        assert_eq!(reg.interpret(&ok, &mut state).unwrap(), "Signed in successfully");
        assert_eq!(state.prompt(), "<alice />:");

        let refused = SignInResponse::failure("Wrong password.").encode();
        let fail = Payload::new(Command::SignIn, refused);
        assert_eq!(reg.interpret(&fail, &mut state).unwrap(), "Wrong password.");

        let out = Payload::empty(Command::SignOut);
        assert_eq!(reg.interpret(&out, &mut state).unwrap(), "Signed out");
        assert_eq!(state.prompt(), "<>:");
    }

    #[test]
    fn test_interpret_download_writes_pending_target() {
        let reg = ClientRegistry::standard().unwrap();
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("nested/out.bin");
        let mut state = ClientState {
            pending_download: Some(target.clone()),
            ..Default::default()
        };
        let msg = reg
            .interpret(&Payload::new(Command::Download, b"abc".to_vec()), &mut state)
            .unwrap();
        assert!(msg.starts_with("File saved to"));
        assert_eq!(std::fs::read(&target).unwrap(), b"abc");

        assert!(reg
            .interpret(&Payload::new(Command::Download, b"abc".to_vec()), &mut state)
            .is_err());
    }

    #[test]
    fn test_interpret_time_and_ping() {
        let reg = ClientRegistry::standard().unwrap();
        let mut state = ClientState::default();
        let shown = reg
            .interpret(&Payload::new(Command::Time, encode_time(0)), &mut state)
            .unwrap();
        assert!(shown.contains("19"), "{shown}");
        assert!(reg.interpret(&Payload::new(Command::Time, vec![1]), &mut state).is_err());
        assert_eq!(
            reg.interpret(&Payload::new(Command::Ping, b"hi".to_vec()), &mut state).unwrap(),
            "ping hi"
        );
    }

    #[test]
    fn test_help_lists_every_command() {
        let help = ClientRegistry::standard().unwrap().help();
        let words = [
            "ping", "time", "signUp", "signIn", "signOut", "upload", "download", "move", "exit",
            "help",
        ];
        for word in words {
            assert!(help.contains(word), "help is missing {word}");
        }
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/tmp/x"), PathBuf::from("/tmp/x"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_home("~/x"), PathBuf::from(home).join("x"));
        }
    }

    #[test]
    fn test_server_sign_up_and_storage_flow() {
        let tmp = TempDir::new().unwrap();
        let s = sessions(&tmp);
        let reg = ServerRegistry::standard().unwrap();
        let c = ctx(&s, 7000);

        let upload = UploadRequest {
            path: "/a.txt".into(),
            data: b"x".to_vec(),
        };
        let r = reg.dispatch(&Payload::new(Command::Upload, upload.encode()), &c);
        assert!(text(&r).contains("Unknown session"));

        let r = reg.dispatch(
            &Payload::new(Command::SignUp, Credential::new("alice", "pw1").encode()),
            &c,
        );
        assert_eq!(r.command, Command::SignIn);
        assert_eq!(
            SignInResponse::decode(&r.body).unwrap(),
            SignInResponse::Success {
                login: "alice".into(),
                working_dir: "/".into()
            }
        );

        let r = reg.dispatch(&Payload::new(Command::Upload, upload.encode()), &c);
        assert_eq!(text(&r), "File uploaded successfully.");

        let r = reg.dispatch(&Payload::new(Command::Download, b"/a.txt".to_vec()), &c);
        assert_eq!(r, Payload::new(Command::Download, b"x".to_vec()));

        let r = reg.dispatch(&Payload::new(Command::Download, b"/missing".to_vec()), &c);
        assert_eq!(r.command, Command::Message);
        assert_eq!(text(&r), "File not found.");

        let r = reg.dispatch(&Payload::new(Command::Download, b"../../etc/passwd".to_vec()), &c);
        assert!(text(&r).contains("no access"));

        let mv = MoveRequest {
            source: "/a.txt".into(),
            dest: "/b/a.txt".into(),
        };
        let r = reg.dispatch(&Payload::new(Command::Move, mv.encode()), &c);
        assert_eq!(text(&r), "File moved successfully.");

        let r = reg.dispatch(&Payload::new(Command::Move, mv.encode()), &c);
        assert_eq!(text(&r), "Failed to move a file.");

        let r = reg.dispatch(&Payload::empty(Command::SignOut), &c);
        assert_eq!(r, Payload::empty(Command::SignOut));
        assert!(s.login_of(c.peer).is_none());
    }

    #[test]
    fn test_server_sign_up_failure_uses_sign_up_tag() {
        let tmp = TempDir::new().unwrap();
        let s = sessions(&tmp);
        let reg = ServerRegistry::standard().unwrap();
        let sign_up = Payload::new(Command::SignUp, Credential::new("bob", "pw").encode());
        reg.dispatch(&sign_up, &ctx(&s, 1));
        let r = reg.dispatch(&sign_up, &ctx(&s, 2));
        assert_eq!(r.command, Command::SignUp);
        assert_eq!(text(&r), "User with such login is already registered.");
    }

    #[test]
    fn test_download_over_frame_cap_is_refused() {
        let tmp = TempDir::new().unwrap();
        let s = sessions(&tmp);
        let reg = ServerRegistry::standard().unwrap();
        let c = RequestContext {
            max_frame_size: 64,
            ..ctx(&s, 1)
        };
        reg.dispatch(&Payload::new(Command::SignUp, Credential::new("alice", "pw").encode()), &c);
        s.storage().upload("alice", "/fits.bin", &[1u8; 63]).unwrap();
        s.storage().upload("alice", "/big.bin", &[1u8; 64]).unwrap();

        let r = reg.dispatch(&Payload::new(Command::Download, b"/fits.bin".to_vec()), &c);
        assert_eq!(r.command, Command::Download);
        assert_eq!(r.wire_len(), 64);

        let r = reg.dispatch(&Payload::new(Command::Download, b"/big.bin".to_vec()), &c);
        assert_eq!(r.command, Command::Message);
        assert!(text(&r).contains("too large"), "{}", text(&r));
    }

    #[test]
    fn test_server_answers_unhandled_and_malformed() {
        let tmp = TempDir::new().unwrap();
        let s = sessions(&tmp);
        let reg = ServerRegistry::standard().unwrap();
        let c = ctx(&s, 1);

        let r = reg.dispatch(&Payload::message("hello?"), &c);
        assert_eq!(r, Payload::message("The server can't handle this command."));

        let r = reg.dispatch(&Payload::new(Command::SignIn, vec![0, 0]), &c);
        assert_eq!(r.command, Command::Message);
        assert!(text(&r).starts_with("Malformed SIGN_IN request"));

        let r = reg.dispatch(&Payload::new(Command::Ping, b"echo me".to_vec()), &c);
        assert_eq!(r, Payload::new(Command::Ping, b"echo me".to_vec()));

        let r = reg.dispatch(&Payload::empty(Command::Time), &c);
        assert!(decode_time(&r.body).unwrap() > 0);
    }
}
