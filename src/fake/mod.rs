//! In-memory daemon for tests.

use crate::mpd::{Command, RemoteSession, Reply, SessionError, SessionFactory, SessionHandle};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
struct Daemon {
    queue: Vec<String>,
    catalog: Vec<(String, String)>,
    playlists: BTreeMap<String, Vec<String>>,
    random: bool,
    state: &'static str,
    log: Vec<Command>,
    failing: HashSet<&'static str>,
    ping_fails: bool,
    hanging: bool,
}

pub struct FakeSession {
    id: Uuid,
    daemon: Mutex<Daemon>,
    closed: AtomicBool,
    closing: Notify,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            daemon: Mutex::new(Daemon {
                state: "stop",
                ..Daemon::default()
            }),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        }
    }

    pub fn with_queue(self, files: &[&str]) -> Self {
        self.daemon().queue = files.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Catalog of `(file, title)` pairs.
    pub fn with_catalog(self, entries: &[(&str, &str)]) -> Self {
        self.daemon().catalog = entries
            .iter()
            .map(|(f, t)| (f.to_string(), t.to_string()))
            .collect();
        self
    }

    pub fn with_playlist(self, name: &str, files: &[&str]) -> Self {
        self.daemon()
            .playlists
            .insert(name.to_string(), files.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.daemon().ping_fails = fails;
    }

    /// Makes every later call block until the session is closed.
    pub fn set_hanging(&self, hanging: bool) {
        self.daemon().hanging = hanging;
    }

    pub fn fail_command(&self, name: &'static str) {
        self.daemon().failing.insert(name);
    }

    pub fn queue(&self) -> Vec<String> {
        self.daemon().queue.clone()
    }

    pub fn log(&self) -> Vec<Command> {
        self.daemon().log.clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.daemon().log.iter().map(Command::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.daemon().log.iter().filter(|c| c.name() == name).count()
    }

    pub fn mutations(&self) -> usize {
        self.daemon().log.iter().filter(|c| c.mutates_queue()).count()
    }

    fn daemon(&self) -> MutexGuard<'_, Daemon> {
        self.daemon.lock().unwrap()
    }
}

fn pairs(items: &[(&str, String)]) -> Reply {
    Reply::new(
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

fn ack(command: &Command, message: &str) -> SessionError {
    SessionError::Ack {
        code: 50,
        command: command.name().to_string(),
        message: message.to_string(),
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn call(&self, command: &Command) -> Result<Reply, SessionError> {
        let closing = self.closing.notified();
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let hanging = {
            let mut daemon = self.daemon();
            daemon.log.push(command.clone());
            daemon.hanging
        };
        if hanging {
            closing.await;
            return Err(SessionError::Closed);
        }

        let mut daemon = self.daemon();
        if daemon.failing.contains(command.name()) {
            return Err(ack(command, "scripted failure"));
        }

        let reply = match command {
            Command::Ping if daemon.ping_fails => {
                return Err(SessionError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "scripted probe failure",
                )))
            }
            Command::PlaylistInfo => {
                let mut out = Vec::new();
                for (pos, file) in daemon.queue.iter().enumerate() {
                    out.push(("file", file.clone()));
                    out.push(("Pos", pos.to_string()));
                }
                pairs(&out)
            }
            Command::ListAllInfo(_) => {
                let mut out = vec![("directory", "Music".to_string())];
                for (file, title) in &daemon.catalog {
                    out.push(("file", file.clone()));
                    out.push(("Title", title.clone()));
                }
                pairs(&out)
            }
            Command::Clear => {
                daemon.queue.clear();
                Reply::default()
            }
            Command::Add(file) => {
                daemon.queue.push(file.clone());
                Reply::default()
            }
            Command::Load(name) => {
                let stored = daemon.playlists.get(name).cloned();
                match stored {
                    Some(files) => {
                        daemon.queue.extend(files);
                        Reply::default()
                    }
                    None => return Err(ack(command, "No such playlist")),
                }
            }
            Command::Play(_) => {
                daemon.state = "play";
                Reply::default()
            }
            Command::Stop => {
                daemon.state = "stop";
                Reply::default()
            }
            Command::Random(on) => {
                daemon.random = *on;
                Reply::default()
            }
            Command::Status => pairs(&[
                ("random", u8::from(daemon.random).to_string()),
                ("playlistlength", daemon.queue.len().to_string()),
                ("state", daemon.state.to_string()),
            ]),
            Command::Stats => pairs(&[("songs", daemon.catalog.len().to_string())]),
            Command::CurrentSong => match daemon.queue.first() {
                Some(file) => pairs(&[
                    ("file", file.clone()),
                    ("Artist", "Band".to_string()),
                    ("Title", "Song & Dance".to_string()),
                ]),
                None => Reply::default(),
            },
            Command::ListPlaylistInfo(name) => match daemon.playlists.get(name) {
                Some(files) => {
                    let mut out = Vec::new();
                    for file in files {
                        out.push(("file", file.clone()));
                        out.push(("Title", file.trim_end_matches(".flac").to_uppercase()));
                    }
                    pairs(&out)
                }
                None => return Err(ack(command, "No such playlist")),
            },
            Command::ListPlaylists => {
                let out: Vec<_> = daemon
                    .playlists
                    .keys()
                    .map(|name| ("playlist", name.clone()))
                    .collect();
                pairs(&out)
            }
            Command::Update(_) => pairs(&[("updating_db", "1".to_string())]),
            _ => Reply::default(),
        };
        Ok(reply)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closing.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out fresh [`FakeSession`]s and remembers them.
#[derive(Default)]
pub struct FakeFactory {
    refuse: AtomicBool,
    opens: AtomicUsize,
    opened: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeFactory {
    pub fn refusing() -> Self {
        let factory = Self::default();
        factory.refuse.store(true, Ordering::SeqCst);
        factory
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn last_opened(&self) -> Option<Arc<FakeSession>> {
        self.opened.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    fn endpoint(&self) -> String {
        "fake:6600".to_string()
    }

    async fn open(&self) -> Result<SessionHandle, SessionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SessionError::Connect {
                endpoint: self.endpoint(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal"),
            });
        }
        let session = Arc::new(FakeSession::new());
        self.opened.lock().unwrap().push(session.clone());
        Ok(session)
    }
}
