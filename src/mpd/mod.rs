use crate::config::MpdConfig;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

const GREETING_PREFIX: &str = "OK MPD ";
const MAX_LINE_SIZE: usize = 64 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);
const RESYNC_TIMEOUT: Duration = Duration::from_secs(2);

pub type SessionHandle = Arc<dyn RemoteSession>;

/// One request understood by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Status,
    Stats,
    CurrentSong,
    PlaylistInfo,
    ListAllInfo(String),
    Clear,
    Add(String),
    Play(Option<u32>),
    Stop,
    Next,
    Previous,
    Pause(bool),
    Random(bool),
    Load(String),
    ListPlaylists,
    ListPlaylistInfo(String),
    Update(Option<String>),
    Password(String),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Status => "status",
            Self::Stats => "stats",
            Self::CurrentSong => "currentsong",
            Self::PlaylistInfo => "playlistinfo",
            Self::ListAllInfo(_) => "listallinfo",
            Self::Clear => "clear",
            Self::Add(_) => "add",
            Self::Play(_) => "play",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::Pause(_) => "pause",
            Self::Random(_) => "random",
            Self::Load(_) => "load",
            Self::ListPlaylists => "listplaylists",
            Self::ListPlaylistInfo(_) => "listplaylistinfo",
            Self::Update(_) => "update",
            Self::Password(_) => "password",
        }
    }

    /// Whether the command edits the play queue.
    #[cfg(test)]
    pub fn mutates_queue(&self) -> bool {
        matches!(self, Self::Clear | Self::Add(_) | Self::Load(_))
    }

    /// Request line without the trailing newline.
    pub fn to_line(&self) -> String {
        let name = self.name();
        match self {
            Self::ListAllInfo(arg)
            | Self::Add(arg)
            | Self::Load(arg)
            | Self::ListPlaylistInfo(arg)
            | Self::Password(arg) => format!("{name} {}", quote(arg)),
            Self::Update(Some(path)) => format!("{name} {}", quote(path)),
            Self::Play(Some(pos)) => format!("{name} {pos}"),
            Self::Pause(on) | Self::Random(on) => format!("{name} {}", u8::from(*on)),
            _ => name.to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("password ****"),
            other => f.write_str(&other.to_line()),
        }
    }
}

fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// `key: value` pairs returned by one successful command, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pairs: Vec<(String, String)>,
}

impl Reply {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Flat view of the reply; the first value seen for a key wins.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for (k, v) in &self.pairs {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        map
    }

    /// Splits a listing into one record per boundary key. Pairs before the
    /// first boundary are dropped.
    pub fn records(&self, boundaries: &[&str]) -> Vec<Reply> {
        let mut records = Vec::new();
        let mut current: Option<Vec<(String, String)>> = None;
        for (k, v) in &self.pairs {
            if boundaries.contains(&k.as_str()) {
                if let Some(done) = current.take() {
                    records.push(Reply::new(done));
                }
                current = Some(Vec::new());
            }
            if let Some(record) = current.as_mut() {
                record.push((k.clone(), v.clone()));
            }
        }
        if let Some(done) = current {
            records.push(Reply::new(done));
        }
        records
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("can't connect to MPD at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("MPD handshake failed: {0}")]
    Handshake(String),
    #[error("MPD rejected `{command}`: {message} (ACK {code})")]
    Ack {
        code: u32,
        command: String,
        message: String,
    },
    #[error("MPD protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("session closed")]
    Closed,
}

/// A live connection to the daemon.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn id(&self) -> Uuid;

    /// Issues one command and waits for its complete reply.
    async fn call(&self, command: &Command) -> Result<Reply, SessionError>;

    /// Closes the connection. Later calls fail with [`SessionError::Closed`].
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens new sessions against one configured endpoint.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    fn endpoint(&self) -> String;

    async fn open(&self) -> Result<SessionHandle, SessionError>;
}

/// Runs `command` with an upper bound on how long the reply may take.
pub async fn call_bounded(
    session: &dyn RemoteSession,
    command: &Command,
    limit: Duration,
) -> Result<Reply, SessionError> {
    match timeout(limit, session.call(command)).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout(limit)),
    }
}

type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// Where the last exchange got to. Anything but `Idle` at the start of a call
// means the previous caller was dropped part way through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Sending,
    Awaiting,
}

struct Wire {
    reader: BoxedReader,
    writer: BoxedWriter,
    stage: Stage,
}

impl Wire {
    async fn exchange(&mut self, command: &Command) -> Result<Reply, SessionError> {
        let mut line = command.to_line();
        line.push('\n');
        self.stage = Stage::Sending;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        self.stage = Stage::Awaiting;
        let reply = read_reply(&mut self.reader).await;
        self.stage = Stage::Idle;
        reply
    }

    /// Skips the reply an abandoned command still has coming. A request cut
    /// off mid-line can't be recovered.
    async fn resync(&mut self) -> Result<(), SessionError> {
        match self.stage {
            Stage::Idle => Ok(()),
            Stage::Sending => Err(SessionError::Protocol(
                "previous request was cut off before it was sent".to_string(),
            )),
            Stage::Awaiting => {
                timeout(RESYNC_TIMEOUT, skip_reply(&mut self.reader))
                    .await
                    .map_err(|_| {
                        SessionError::Protocol(format!(
                            "abandoned reply did not finish within {RESYNC_TIMEOUT:?}"
                        ))
                    })??;
                self.stage = Stage::Idle;
                Ok(())
            }
        }
    }
}

enum WireState {
    Ready(Wire),
    Broken,
    Closed,
}

pub struct MpdSession {
    id: Uuid,
    version: String,
    wire: Mutex<WireState>,
    closed: AtomicBool,
}

impl MpdSession {
    /// Reads the greeting and authenticates if a password is given.
    pub async fn handshake<R, W>(
        reader: R,
        writer: W,
        password: Option<&str>,
    ) -> Result<Self, SessionError>
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut wire = Wire {
            reader: Box::new(reader),
            writer: Box::new(writer),
            stage: Stage::Idle,
        };

        let greeting = read_line(&mut wire.reader).await?;
        let version = greeting
            .strip_prefix(GREETING_PREFIX)
            .ok_or_else(|| SessionError::Handshake(format!("unexpected greeting: {greeting}")))?
            .to_string();

        if let Some(password) = password.filter(|p| !p.is_empty()) {
            wire.exchange(&Command::Password(password.to_string()))
                .await
                .map_err(|err| match err {
                    SessionError::Ack { message, .. } => {
                        SessionError::Handshake(format!("password rejected: {message}"))
                    }
                    other => other,
                })?;
        }

        Ok(Self {
            id: Uuid::new_v4(),
            version,
            wire: Mutex::new(WireState::Ready(wire)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

#[async_trait]
impl RemoteSession for MpdSession {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn call(&self, command: &Command) -> Result<Reply, SessionError> {
        let mut guard = self.wire.lock().await;
        let wire = match &mut *guard {
            WireState::Ready(wire) => wire,
            WireState::Broken => {
                return Err(SessionError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connection to MPD was lost",
                )))
            }
            WireState::Closed => return Err(SessionError::Closed),
        };

        if wire.stage != Stage::Idle {
            if let Err(err) = wire.resync().await {
                tracing::warn!(
                    session_id = %self.id,
                    error = %err,
                    "dropping MPD connection left mid-reply"
                );
                *guard = WireState::Broken;
                return Err(err);
            }
            tracing::debug!(session_id = %self.id, "discarded reply to an abandoned command");
        }

        match wire.exchange(command).await {
            Ok(reply) => Ok(reply),
            Err(err @ SessionError::Ack { .. }) => Err(err),
            Err(err) => {
                *guard = WireState::Broken;
                Err(err)
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.wire.lock().await;
        if let WireState::Ready(wire) = &mut *guard {
            let farewell = async {
                wire.writer.write_all(b"close\n").await?;
                wire.writer.shutdown().await
            };
            if let Ok(Err(err)) = timeout(CLOSE_TIMEOUT, farewell).await {
                tracing::debug!(session_id = %self.id, error = %err, "MPD close was not clean");
            }
        }
        *guard = WireState::Closed;
        tracing::debug!(session_id = %self.id, "MPD session closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn read_line<R>(reader: &mut R) -> Result<String, SessionError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut buf = String::new();
    let n = (&mut *reader)
        .take(MAX_LINE_SIZE as u64)
        .read_line(&mut buf)
        .await?;
    if !buf.ends_with('\n') {
        if n >= MAX_LINE_SIZE {
            return Err(SessionError::Protocol(format!(
                "line longer than {MAX_LINE_SIZE} bytes"
            )));
        }
        return Err(SessionError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "MPD closed the connection",
        )));
    }
    let trimmed = buf.trim_end_matches(['\r', '\n']).len();
    buf.truncate(trimmed);
    Ok(buf)
}

async fn read_reply<R>(reader: &mut R) -> Result<Reply, SessionError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut pairs = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line == "OK" {
            return Ok(Reply::new(pairs));
        }
        if let Some(rest) = line.strip_prefix("ACK ") {
            return Err(parse_ack(rest));
        }
        match line.split_once(": ") {
            Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
            None => {
                return Err(SessionError::Protocol(format!(
                    "unexpected reply line: {line}"
                )))
            }
        }
    }
}

// The first line may be the tail of one a cancelled reader already started.
async fn skip_reply<R>(reader: &mut R) -> Result<(), SessionError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    loop {
        let line = read_line(reader).await?;
        if line == "OK" || line.starts_with("ACK ") {
            return Ok(());
        }
    }
}

// ACK [error@command_list_num] {current_command} message_text
fn parse_ack(rest: &str) -> SessionError {
    let (code, tail) = rest
        .strip_prefix('[')
        .and_then(|r| r.split_once(']'))
        .map(|(inside, tail)| {
            let code = inside
                .split('@')
                .next()
                .and_then(|c| c.parse().ok())
                .unwrap_or(0);
            (code, tail.trim_start())
        })
        .unwrap_or((0, rest));

    let (command, message) = tail
        .strip_prefix('{')
        .and_then(|r| r.split_once('}'))
        .map(|(command, message)| (command.to_string(), message.trim().to_string()))
        .unwrap_or_else(|| (String::new(), tail.trim().to_string()));

    SessionError::Ack {
        code,
        command,
        message,
    }
}

/// Dials the daemon over TCP.
#[derive(Debug, Clone)]
pub struct TcpSessionFactory {
    host: String,
    port: u16,
    password: Option<String>,
    connect_timeout: Duration,
}

impl TcpSessionFactory {
    pub fn new(config: &MpdConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone().filter(|p| !p.is_empty()),
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[async_trait]
impl SessionFactory for TcpSessionFactory {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&self) -> Result<SessionHandle, SessionError> {
        let endpoint = self.endpoint();
        tracing::debug!(%endpoint, "dialing MPD");

        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(SessionError::Connect { endpoint, source }),
            Err(_) => return Err(SessionError::Timeout(self.connect_timeout)),
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, "can't set TCP_NODELAY on MPD socket");
        }

        let (read_half, write_half) = stream.into_split();
        let session = timeout(
            self.connect_timeout,
            MpdSession::handshake(
                BufReader::new(read_half),
                write_half,
                self.password.as_deref(),
            ),
        )
        .await
        .map_err(|_| SessionError::Timeout(self.connect_timeout))??;

        tracing::info!(
            session_id = %session.id(),
            %endpoint,
            version = session.version(),
            "connected to MPD"
        );
        Ok(Arc::new(session))
    }
}
