use crate::mpd::{call_bounded, Command, RemoteSession, Reply, SessionError, SessionHandle};
use crate::supervisor::ConnectionSupervisor;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The session was replaced while the command was in flight. Retrying
    /// picks up the new session.
    #[error("`{command}` ran against a session that was replaced")]
    Stale { command: &'static str },
    #[error("`{command}` got no reply within {after:?}")]
    Timeout {
        command: &'static str,
        after: Duration,
    },
    #[error("`{command}` failed: {source}")]
    Failed {
        command: &'static str,
        #[source]
        source: SessionError,
    },
}

/// Runs single commands for request handlers against whatever session is
/// current. Never retries and never touches probe state.
#[derive(Clone)]
pub struct CommandGateway {
    supervisor: Arc<ConnectionSupervisor>,
    timeout: Duration,
}

impl CommandGateway {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        let timeout = supervisor.config().command_timeout();
        Self {
            supervisor,
            timeout,
        }
    }

    pub async fn execute(&self, command: &Command) -> Result<Reply, CommandError> {
        let session = self.supervisor.current();
        match call_bounded(session.as_ref(), command, self.timeout).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                let err = classify(command.name(), session.is_closed(), err);
                tracing::warn!(
                    command = command.name(),
                    session_id = %session.id(),
                    error = %err,
                    "MPD command failed"
                );
                Err(err)
            }
        }
    }

    /// Snapshot of the current session for multi-step routines.
    pub fn session(&self) -> SessionHandle {
        self.supervisor.current()
    }
}

fn classify(command: &'static str, session_closed: bool, err: SessionError) -> CommandError {
    match err {
        SessionError::Closed => CommandError::Stale { command },
        _ if session_closed => CommandError::Stale { command },
        SessionError::Timeout(after) => CommandError::Timeout { command, after },
        source => CommandError::Failed { command, source },
    }
}
