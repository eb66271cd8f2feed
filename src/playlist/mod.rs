use crate::model::{catalog_from_reply, QueueSnapshot};
use crate::mpd::{call_bounded, Command, RemoteSession, Reply, SessionError};
use serde::Serialize;
use std::time::Duration;

const CATALOG_ROOT: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PopulateOutcome {
    /// The queue already had items; nothing was touched.
    AlreadyPopulated { queued: usize },
    Populated { added: usize, failed: usize },
}

/// Fills an empty queue with the whole catalog.
#[derive(Debug, Clone)]
pub struct PlaylistInitializer {
    timeout: Duration,
}

impl PlaylistInitializer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn call(
        &self,
        session: &dyn RemoteSession,
        command: &Command,
    ) -> Result<Reply, SessionError> {
        let result = call_bounded(session, command, self.timeout).await;
        if let Err(err) = &result {
            tracing::warn!(
                command = command.name(),
                session_id = %session.id(),
                error = %err,
                "playlist step failed"
            );
        }
        result
    }

    /// An unreadable queue is treated as empty.
    pub async fn ensure_populated(&self, session: &dyn RemoteSession) -> PopulateOutcome {
        let mut failed = 0;
        let queue = match self.call(session, &Command::PlaylistInfo).await {
            Ok(reply) => QueueSnapshot::from_reply(&reply),
            Err(_) => {
                failed += 1;
                QueueSnapshot::default()
            }
        };
        if !queue.is_empty() {
            tracing::debug!(queued = queue.len(), "MPD queue already populated");
            return PopulateOutcome::AlreadyPopulated {
                queued: queue.len(),
            };
        }

        if self.call(session, &Command::Clear).await.is_err() {
            failed += 1;
        }

        let catalog = match self
            .call(session, &Command::ListAllInfo(CATALOG_ROOT.to_string()))
            .await
        {
            Ok(reply) => catalog_from_reply(&reply),
            Err(_) => {
                failed += 1;
                Vec::new()
            }
        };

        let mut added = 0;
        for entry in &catalog {
            match self.call(session, &Command::Add(entry.file.clone())).await {
                Ok(_) => added += 1,
                Err(_) => failed += 1,
            }
        }

        if self.start_stop(session).await.is_err() {
            failed += 1;
        }

        tracing::info!(added, failed, "populated MPD queue from catalog");
        PopulateOutcome::Populated { added, failed }
    }

    /// Plays then immediately stops. MPD only reports the current song in
    /// `status` after at least one playback transition.
    pub async fn start_stop(&self, session: &dyn RemoteSession) -> Result<(), SessionError> {
        let played = self.call(session, &Command::Play(None)).await;
        let stopped = self.call(session, &Command::Stop).await;
        played?;
        stopped?;
        Ok(())
    }

    /// Empties the queue, then refills it from the catalog.
    pub async fn reload_all(&self, session: &dyn RemoteSession) -> PopulateOutcome {
        let _ = self.call(session, &Command::Clear).await;
        self.ensure_populated(session).await
    }

    /// Replaces the queue with a stored playlist. Every step runs; the first
    /// failure is returned.
    pub async fn load_named(
        &self,
        session: &dyn RemoteSession,
        name: &str,
    ) -> Result<(), SessionError> {
        let cleared = self.call(session, &Command::Clear).await.map(drop);
        let loaded = self
            .call(session, &Command::Load(name.to_string()))
            .await
            .map(drop);
        let cycled = self.start_stop(session).await;
        cleared.and(loaded).and(cycled)
    }
}
