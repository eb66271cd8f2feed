//! Owns the one live MPD session and keeps it healthy.
//!
//! A background probe pings the current session every `probe_interval`.
//! Once more than `failure_threshold` probes in a row have failed, a new
//! session is opened, installed, and only then is the old one closed, so
//! readers of [`ConnectionSupervisor::current`] never see a session the
//! supervisor already closed.

use crate::config::SupervisorConfig;
use crate::model::{LinkState, SupervisorStatus};
use crate::mpd::{
    call_bounded, Command, RemoteSession, SessionError, SessionFactory, SessionHandle,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

/// What one probe tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Failed { consecutive: u32 },
    Reconnected { session_id: Uuid },
    ReconnectFailed,
}

struct ProbeState {
    consecutive_failures: u32,
    link: LinkState,
    reconnects: u64,
}

pub struct ConnectionSupervisor {
    current: RwLock<SessionHandle>,
    state: Mutex<ProbeState>,
    // Serializes swaps; held across the factory dial.
    reconnect_lock: tokio::sync::Mutex<()>,
    factory: Arc<dyn SessionFactory>,
    config: SupervisorConfig,
}

impl ConnectionSupervisor {
    pub fn new(
        session: SessionHandle,
        factory: Arc<dyn SessionFactory>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            current: RwLock::new(session),
            state: Mutex::new(ProbeState {
                consecutive_failures: 0,
                link: LinkState::Connected,
                reconnects: 0,
            }),
            reconnect_lock: tokio::sync::Mutex::new(()),
            factory,
            config,
        }
    }

    /// The authoritative session. The lock is released before returning.
    pub fn current(&self) -> SessionHandle {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn probe_once(&self) -> ProbeOutcome {
        let session = self.current();
        let result = call_bounded(
            session.as_ref(),
            &Command::Ping,
            self.config.command_timeout(),
        )
        .await;

        let err = match result {
            Ok(_) => {
                let mut state = self.state();
                if state.link != LinkState::Connected {
                    tracing::info!(session_id = %session.id(), "MPD probe recovered");
                }
                state.consecutive_failures = 0;
                state.link = LinkState::Connected;
                return ProbeOutcome::Healthy;
            }
            Err(err) => err,
        };

        let consecutive = {
            let mut state = self.state();
            state.consecutive_failures += 1;
            state.link = LinkState::Degraded(state.consecutive_failures);
            state.consecutive_failures
        };
        tracing::warn!(
            session_id = %session.id(),
            consecutive,
            threshold = self.config.failure_threshold,
            error = %err,
            "MPD probe failed"
        );

        if consecutive <= self.config.failure_threshold {
            return ProbeOutcome::Failed { consecutive };
        }

        self.state().link = LinkState::Reconnecting;
        match self.replace_session(Some(session.id())).await {
            Ok(fresh) => ProbeOutcome::Reconnected {
                session_id: fresh.id(),
            },
            Err(err) => {
                self.state().consecutive_failures = 0;
                tracing::warn!(
                    endpoint = %self.factory.endpoint(),
                    error = %err,
                    "MPD reconnect failed; will retry after further probe failures"
                );
                ProbeOutcome::ReconnectFailed
            }
        }
    }

    /// Replaces the current session unconditionally.
    pub async fn reconnect(&self) -> Result<Uuid, SessionError> {
        let fresh = self.replace_session(None).await?;
        Ok(fresh.id())
    }

    // With `stale` set, the swap is skipped when another caller already
    // replaced that session while we waited for the lock.
    async fn replace_session(&self, stale: Option<Uuid>) -> Result<SessionHandle, SessionError> {
        let _guard = self.reconnect_lock.lock().await;

        if let Some(stale_id) = stale {
            let current = self.current();
            if current.id() != stale_id {
                let mut state = self.state();
                state.consecutive_failures = 0;
                state.link = LinkState::Connected;
                return Ok(current);
            }
        }

        tracing::info!(endpoint = %self.factory.endpoint(), "opening replacement MPD session");
        let fresh = self.factory.open().await?;

        let old = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, fresh.clone())
        };
        {
            let mut state = self.state();
            state.consecutive_failures = 0;
            state.link = LinkState::Connected;
            state.reconnects += 1;
        }
        tracing::info!(
            old_session = %old.id(),
            new_session = %fresh.id(),
            "swapped MPD session"
        );

        old.close().await;
        Ok(fresh)
    }

    pub fn status(&self) -> SupervisorStatus {
        let session = self.current();
        let state = self.state();
        SupervisorStatus {
            link: state.link,
            consecutive_failures: state.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            reconnects: state.reconnects,
            session_id: session.id(),
            session_closed: session.is_closed(),
            endpoint: self.factory.endpoint(),
        }
    }

    /// Probes until `shutdown` flips to true, then closes the current session.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.probe_once().await;
                    tracing::trace!(?outcome, "probe tick");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.current().close().await;
        tracing::info!("MPD supervisor stopped");
    }

    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run(shutdown).await })
    }
}
