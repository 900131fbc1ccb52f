//! Async (Tokio) transport for the cloudstore daemon and interactive client.

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};

use crate::protocol::timeouts::write_deadline_ms;
use crate::protocol_core::{encode_frame_to_bytes, Payload};

const READ_CHUNK: usize = 64 * 1024;

pub(crate) async fn write_frame_timed<W>(stream: &mut W, payload: &Payload, ms: u64) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let frame = encode_frame_to_bytes(payload)?;
    match timeout(Duration::from_millis(ms), async {
        stream.write_all(&frame).await?;
        stream.flush().await
    })
    .await
    {
        Ok(result) => result.context("frame write failed"),
        Err(_) => anyhow::bail!("frame write timeout ({} ms)", ms),
    }
}

pub(crate) async fn write_frame<W>(stream: &mut W, payload: &Payload) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let ms = write_deadline_ms(payload.wire_len());
    write_frame_timed(stream, payload, ms).await
}

pub mod server {
    use super::*;
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Semaphore;
    use tracing::{debug, error, info, warn};

    use crate::auth::{AuthPolicy, SessionStore};
    use crate::config::ServerConfig;
    use crate::logger::AuditLogger;
    use crate::protocol::Command;
    use crate::protocol_core::FrameDecoder;
    use crate::registry::{RequestContext, ServerRegistry};
    use crate::sandbox::Storage;

    /// State shared by every connection of one server process.
    pub struct Server {
        sessions: Arc<SessionStore>,
        registry: ServerRegistry,
        workers: Arc<Semaphore>,
        audit: Arc<dyn AuditLogger>,
        config: ServerConfig,
    }

    impl Server {
        pub fn new(root: &Path, config: ServerConfig, audit: Arc<dyn AuditLogger>) -> Result<Self> {
            config.validate()?;
            let storage = Arc::new(
                Storage::open(root)
                    .with_context(|| format!("failed to open storage root {}", root.display()))?,
            );
            let sessions = Arc::new(SessionStore::new(
                storage,
                AuthPolicy::from(&config),
                Arc::clone(&audit),
            ));
            Ok(Self {
                sessions,
                registry: ServerRegistry::standard()?,
                workers: Arc::new(Semaphore::new(config.worker_threads)),
                audit,
                config,
            })
        }

        pub fn sessions(&self) -> &Arc<SessionStore> {
            &self.sessions
        }

        pub fn config(&self) -> &ServerConfig {
            &self.config
        }

        /// Session commands always run to completion: an abandoned sign-in
        /// would leave a session the client never learns about.
        pub fn deadline_for(&self, command: Command) -> Option<Duration> {
            self.config
                .command_timeout()
                .filter(|_| !command.changes_session())
        }

        /// Runs one request on the shared worker pool.
        ///
        /// Handlers do blocking file I/O, so they run on the blocking pool
        /// and at most `worker_threads` of them run at once.
        async fn execute(self: &Arc<Self>, peer: SocketAddr, request: Payload) -> Result<Payload> {
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            let server = Arc::clone(self);
            let command = request.command;
            let task = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let ctx = RequestContext {
                    peer,
                    max_frame_size: server.config.max_frame_size,
                    sessions: &server.sessions,
                    audit: server.audit.as_ref(),
                };
                server.registry.dispatch(&request, &ctx)
            });

            let joined = match self.deadline_for(command) {
                Some(limit) => match timeout(limit, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(peer = %peer, command = %command, "command timed out");
                        return Ok(Payload::message("Command timed out on server."));
                    }
                },
                None => task.await,
            };
            match joined {
                Ok(response) => Ok(response),
                Err(e) => {
                    error!(peer = %peer, command = %command, error = %e, "command handler failed");
                    Ok(Payload::message("Internal server error."))
                }
            }
        }
    }

    pub async fn serve(
        bind: &str,
        root: &Path,
        config: ServerConfig,
        audit: Arc<dyn AuditLogger>,
    ) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        let server = Arc::new(Server::new(root, config, audit)?);
        serve_listener(listener, server).await
    }

    /// Accept loop. Each connection gets its own task; command execution is
    /// shared through the server's worker pool.
    pub async fn serve_listener(listener: TcpListener, server: Arc<Server>) -> Result<()> {
        info!(
            addr = %listener.local_addr().context("listener address")?,
            root = %server.sessions.storage().root().display(),
            workers = server.config.worker_threads,
            "cloudstore daemon listening"
        );
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            debug!(peer = %peer, "connection accepted");
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, &server).await {
                    warn!(peer = %peer, error = %e, "connection closed with error");
                    server.audit.error("connection", peer, &format!("{e:#}"));
                }
            });
        }
    }

    /// Serves one connection until EOF or a framing error.
    ///
    /// Requests are answered strictly in arrival order. Whatever session
    /// the peer holds is released when the connection ends, however it ends.
    pub async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        server: &Arc<Server>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = FrameDecoder::new(server.config.max_frame_size);
        let mut buf = vec![0u8; READ_CHUNK];

        let served: Result<()> = async {
            loop {
                while let Some(request) = decoder.decode_next()? {
                    debug!(
                        peer = %peer,
                        command = %request.command,
                        len = request.body.len(),
                        "request"
                    );
                    let response = server.execute(peer, request).await?;
                    write_frame(&mut writer, &response).await?;
                }
                let n = reader.read(&mut buf).await.context("read failed")?;
                if n == 0 {
                    return Ok(());
                }
                decoder.extend(&buf[..n]);
            }
        }
        .await;

        server.sessions.sign_out(peer);
        debug!(peer = %peer, "connection closed");
        served
    }
}

pub mod client {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tracing::debug;

    use crate::cli::ClientOpts;
    use crate::error::FrameError;
    use crate::protocol::timeouts::CONNECT_MS;
    use crate::protocol::{Command, MAX_FRAME_SIZE};
    use crate::protocol_core::FrameDecoder;
    use crate::registry::{ClientRegistry, ClientState};

    type Incoming = Result<Payload, FrameError>;

    pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
        let addr = format!("{}:{}", host, port);
        let connecting = TcpStream::connect(&addr);
        let stream = match timeout(Duration::from_millis(CONNECT_MS), connecting).await {
            Ok(res) => res.with_context(|| format!("connect {}", addr))?,
            Err(_) => anyhow::bail!("connect {} timed out ({} ms)", addr, CONNECT_MS),
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Where the driver is in its request/response cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Phase {
        Idle,
        AwaitingInput,
        AwaitingResponse(Command),
        ShuttingDown,
    }

    enum Event {
        Line(std::io::Result<Option<String>>),
        Incoming(Option<Incoming>),
    }

    /// Interactive loop with at most one command in flight.
    ///
    /// The next input line is only read once the current command has
    /// finished: answered, rejected locally, or cut off by a disconnect.
    pub struct SessionDriver<R, W> {
        registry: Arc<ClientRegistry>,
        state: ClientState,
        lines: Lines<R>,
        out: W,
        phase: Phase,
        max_frame_size: usize,
    }

    impl<R, W> SessionDriver<R, W>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        pub fn new(registry: Arc<ClientRegistry>, input: R, out: W) -> Self {
            Self {
                registry,
                state: ClientState::default(),
                lines: input.lines(),
                out,
                phase: Phase::Idle,
                max_frame_size: MAX_FRAME_SIZE,
            }
        }

        /// Frame cap for both directions. Uploads that would exceed it fail
        /// before anything is sent.
        pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
            self.max_frame_size = max_frame_size;
            self.state.max_frame_size = max_frame_size;
            self
        }

        pub fn phase(&self) -> Phase {
            self.phase
        }

        pub fn state(&self) -> &ClientState {
            &self.state
        }

        pub fn into_output(self) -> W {
            self.out
        }

        pub async fn run(&mut self, stream: TcpStream) -> Result<()> {
            let (reader, mut writer) = stream.into_split();
            let (tx, mut responses) = mpsc::channel::<Incoming>(16);
            let reader_task = tokio::spawn(read_responses(reader, tx, self.max_frame_size));

            self.say("Connected to server.")?;
            let outcome = self.drive(&mut writer, &mut responses).await;

            self.phase = Phase::ShuttingDown;
            reader_task.abort();
            let _ = writer.shutdown().await;
            self.say("Shutting down")?;
            outcome
        }

        async fn drive<Wr>(
            &mut self,
            writer: &mut Wr,
            responses: &mut mpsc::Receiver<Incoming>,
        ) -> Result<()>
        where
            Wr: AsyncWriteExt + Unpin,
        {
            loop {
                self.phase = Phase::AwaitingInput;
                self.prompt()?;

                let event = tokio::select! {
                    line = self.lines.next_line() => Event::Line(line),
                    incoming = responses.recv() => Event::Incoming(incoming),
                };
                let line = match event {
                    Event::Line(line) => match line.context("failed to read input")? {
                        Some(line) => line,
                        None => return Ok(()),
                    },
                    Event::Incoming(Some(Ok(payload))) => {
                        // Nothing is in flight; show it and ask again.
                        let shown = self.registry.interpret(&payload, &mut self.state);
                        self.report(shown)?;
                        continue;
                    }
                    Event::Incoming(Some(Err(e))) => {
                        return Err(e).context("protocol error from server");
                    }
                    Event::Incoming(None) => {
                        self.say("Connection to server lost.")?;
                        return Ok(());
                    }
                };

                match line.trim() {
                    "" => continue,
                    "exit" => return Ok(()),
                    "help" => {
                        let help = self.registry.help();
                        self.say(&help)?;
                        continue;
                    }
                    _ => {}
                }

                let request = match self.registry.prepare(&line, &mut self.state) {
                    Ok(request) => request,
                    Err(e) => {
                        self.state.finish_cycle();
                        self.say(&format!("Command ended with failure: {e}"))?;
                        continue;
                    }
                };

                self.phase = Phase::AwaitingResponse(request.command);
                debug!(command = %request.command, len = request.body.len(), "sending request");
                if let Err(e) = write_frame(writer, &request).await {
                    debug!(error = %e, "request not sent");
                    self.say("Connection to server lost. Command cancelled.")?;
                    return Ok(());
                }

                match responses.recv().await {
                    Some(Ok(payload)) => {
                        let shown = self.registry.interpret(&payload, &mut self.state);
                        self.state.finish_cycle();
                        self.report(shown)?;
                    }
                    Some(Err(e)) => return Err(e).context("protocol error from server"),
                    None => {
                        self.say("Connection to server lost. Command cancelled.")?;
                        return Ok(());
                    }
                }
            }
        }

        fn report(&mut self, shown: Result<String>) -> Result<()> {
            match shown {
                Ok(text) => self.say(&text),
                Err(e) => self.say(&format!("Command ended with failure: {e}")),
            }
        }

        fn prompt(&mut self) -> Result<()> {
            write!(self.out, "{}", self.state.prompt())?;
            self.out.flush()?;
            Ok(())
        }

        fn say(&mut self, text: &str) -> Result<()> {
            writeln!(self.out, "{text}")?;
            self.out.flush()?;
            Ok(())
        }
    }

    /// Decodes server frames into `tx` until EOF, a read error or a framing error.
    async fn read_responses(
        mut reader: OwnedReadHalf,
        tx: mpsc::Sender<Incoming>,
        max_frame_size: usize,
    ) {
        let mut decoder = FrameDecoder::new(max_frame_size);
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => decoder.extend(&buf[..n]),
                Err(e) => {
                    debug!(error = %e, "server read failed");
                    return;
                }
            }
            loop {
                match decoder.decode_next() {
                    Ok(Some(payload)) => {
                        if tx.send(Ok(payload)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        }
    }

    /// Connects and runs the interactive session on stdin/stdout.
    pub async fn run(opts: &ClientOpts) -> Result<()> {
        let stream = connect(&opts.host, opts.port).await?;
        let registry = Arc::new(ClientRegistry::standard()?);
        let input = BufReader::new(tokio::io::stdin());
        let mut driver = SessionDriver::new(registry, input, std::io::stdout())
            .with_max_frame_size(opts.max_frame_size);
        driver.run(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::client::{Phase, SessionDriver};
    use super::server::{serve_listener, Server};
    use super::*;
    use crate::config::ServerConfig;
    use crate::logger::NoopLogger;
    use crate::protocol::Command;
    use crate::protocol_core::{Credential, FrameDecoder};
    use crate::registry::ClientRegistry;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn start_server(
        root: &std::path::Path,
        config: ServerConfig,
    ) -> (std::net::SocketAddr, Arc<Server>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(root, config, Arc::new(NoopLogger)).unwrap());
        let shared = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = serve_listener(listener, shared).await;
        });
        (addr, server)
    }

    async fn request(
        stream: &mut TcpStream,
        decoder: &mut FrameDecoder,
        payload: Payload,
    ) -> Payload {
        write_frame(stream, &payload).await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(p) = decoder.decode_next().unwrap() {
                return p;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
            decoder.extend(&buf[..n]);
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_disconnect_releases_session() {
        let tmp = tempfile::tempdir().unwrap();
        let (addr, server) = start_server(tmp.path(), ServerConfig::default()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = FrameDecoder::default();
        let reply = request(
            &mut stream,
            &mut decoder,
            Payload::new(Command::SignUp, Credential::new("alice", "pw").encode()),
        )
        .await;
        assert_eq!(reply.command, Command::SignIn);
        assert_eq!(server.sessions().active_sessions().len(), 1);

        drop(stream);
        let sessions = Arc::clone(server.sessions());
        wait_until(move || sessions.active_sessions().is_empty()).await;

        // the login can be used again from a new connection
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = FrameDecoder::default();
        let reply = request(
            &mut stream,
            &mut decoder,
            Payload::new(Command::SignIn, Credential::new("alice", "pw").encode()),
        )
        .await;
        assert_eq!(reply.body[0], crate::protocol::status::SUCCESS);
    }

    #[tokio::test]
    async fn test_unknown_tag_closes_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let (addr, _server) = start_server(tmp.path(), ServerConfig::default()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0, 0, 0, 1, 200]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            max_frame_size: 1024,
            ..ServerConfig::default()
        };
        let (addr, _server) = start_server(tmp.path(), config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_requests_answered_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let (addr, _server) = start_server(tmp.path(), ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        // pipeline several requests in one write
        let mut burst = bytes::BytesMut::new();
        for i in 0..20u8 {
            let ping = Payload::new(Command::Ping, vec![i]);
            crate::protocol_core::encode_frame(&ping, &mut burst).unwrap();
        }
        stream.write_all(&burst).await.unwrap();

        let mut decoder = FrameDecoder::default();
        let mut buf = [0u8; 1024];
        let mut seen = Vec::new();
        while seen.len() < 20 {
            while let Some(p) = decoder.decode_next().unwrap() {
                seen.push(p.body[0]);
            }
            if seen.len() == 20 {
                break;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            decoder.extend(&buf[..n]);
        }
        assert_eq!(seen, (0..20u8).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_driver_runs_commands_one_at_a_time() {
        let srv = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let (addr, _server) = start_server(srv.path(), ServerConfig::default()).await;

        let src = local.path().join("a.txt");
        std::fs::write(&src, b"hello cloud").unwrap();
        let dst = local.path().join("back/a.txt");
        let script = format!(
            "help\nfrobnicate\nsignUp alice pw1\nupload {} /notes/a.txt\nmove /notes/a.txt /archive/a.txt\ndownload /notes/a.txt {}\ndownload /archive/a.txt {}\nsignOut\nexit\nping never sent\n",
            src.display(),
            dst.display(),
            dst.display()
        );

        let registry = Arc::new(ClientRegistry::standard().unwrap());
        let mut driver = SessionDriver::new(registry, script.as_bytes(), Vec::new());
        let stream = TcpStream::connect(addr).await.unwrap();
        driver.run(stream).await.unwrap();
        assert_eq!(driver.phase(), Phase::ShuttingDown);
        assert!(driver.state().working_dir.is_none());

        let out = String::from_utf8(driver.into_output()).unwrap();
        assert!(out.contains("Available commands:"));
        assert!(out.contains("Command ended with failure: Unknown command: frobnicate"));
        assert!(out.contains("Signed in successfully"));
        assert!(out.contains("<alice />:"));
        assert!(out.contains("File uploaded successfully."));
        assert!(out.contains("File moved successfully."));
        assert!(out.contains("File not found."));
        assert!(out.contains("File saved to"));
        assert!(out.contains("Signed out"));
        assert!(!out.contains("ping never sent"));
        assert!(out.trim_end().ends_with("Shutting down"));
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello cloud");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_upload_keeps_session() {
        let srv = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            max_frame_size: 1024,
            ..ServerConfig::default()
        };
        let (addr, _server) = start_server(srv.path(), config).await;

        let big = local.path().join("big.bin");
        std::fs::write(&big, vec![7u8; 4096]).unwrap();
        let script = format!(
            "signUp alice pw1\nupload {} /big.bin\nping still here\n",
            big.display()
        );

        let registry = Arc::new(ClientRegistry::standard().unwrap());
        let mut driver =
            SessionDriver::new(registry, script.as_bytes(), Vec::new()).with_max_frame_size(1024);
        let stream = TcpStream::connect(addr).await.unwrap();
        driver.run(stream).await.unwrap();

        let out = String::from_utf8(driver.into_output()).unwrap();
        assert!(out.contains("Command ended with failure: Cannot upload"), "{out}");
        assert!(out.contains("ping still here"), "{out}");
        assert!(!out.contains("Connection to server lost"), "{out}");
        assert!(!srv.path().join("alice/big.bin").exists());
    }

    #[tokio::test]
    async fn test_session_commands_ignore_command_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            command_timeout_secs: 5,
            ..ServerConfig::default()
        };
        let server = Server::new(tmp.path(), config, Arc::new(NoopLogger)).unwrap();
        for command in Command::ALL {
            let expected = (!command.changes_session()).then(|| Duration::from_secs(5));
            assert_eq!(server.deadline_for(command), expected, "{command}");
        }

        let untimed =
            Server::new(tmp.path(), ServerConfig::default(), Arc::new(NoopLogger)).unwrap();
        assert_eq!(untimed.deadline_for(Command::Upload), None);
    }

    #[tokio::test]
    async fn test_driver_stops_when_server_goes_away() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // accept, read one frame worth of bytes, then hang up without answering
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = s.read(&mut buf).await;
        });

        let registry = Arc::new(ClientRegistry::standard().unwrap());
        let mut driver = SessionDriver::new(registry, &b"time\ntime\n"[..], Vec::new());
        let stream = TcpStream::connect(addr).await.unwrap();
        driver.run(stream).await.unwrap();

        let out = String::from_utf8(driver.into_output()).unwrap();
        assert!(out.contains("Connection to server lost."), "{out}");
    }
}
