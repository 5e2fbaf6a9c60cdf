//! IDLE as a single deadline-bearing round.
//!
//! Entering IDLE consumes the IMAP session; the round takes it out of the
//! connection, waits, issues DONE, and restores it. A round that cannot be
//! unwound leaves the connection dead and the pool discards it.

use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::Session;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use super::connection::{ImapConnection, ImapSession};
use crate::types::IngestError;

/// What one IDLE round observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The server pushed data (EXISTS or similar) for the selected mailbox.
    NewData,
    /// The wait window elapsed; re-issuing IDLE doubles as the keepalive.
    Timeout,
    /// The round was interrupted from our side.
    Interrupted,
}

impl ImapConnection {
    /// One IDLE round: enter IDLE (bounded by `startup`), wait up to `wait`
    /// for server data, then terminate with DONE.
    pub async fn idle_round(
        &mut self,
        startup: Duration,
        wait: Duration,
    ) -> Result<IdleOutcome, IngestError> {
        let session = self.take_session()?;
        let (session, outcome) = match session {
            ImapSession::Tls(s) => {
                let (s, o) = idle_once(s, startup, wait).await;
                (s.map(ImapSession::Tls), o)
            }
            ImapSession::Plain(s) => {
                let (s, o) = idle_once(s, startup, wait).await;
                (s.map(ImapSession::Plain), o)
            }
        };
        if let Some(session) = session {
            self.restore_session(session);
        }
        outcome
    }
}

async fn idle_once<S>(
    session: Session<S>,
    startup: Duration,
    wait: Duration,
) -> (Option<Session<S>>, Result<IdleOutcome, IngestError>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug + 'static,
{
    let mut handle = session.idle();

    match timeout(startup, handle.init()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            // IDLE never started; try to unwind so the session survives.
            return match handle.done().await {
                Ok(s) => (Some(s), Err(e.into())),
                Err(done_err) => (None, Err(done_err.into())),
            };
        }
        Err(_) => return (None, Err(IngestError::Timeout(startup))),
    }

    // Dropping the stop source interrupts the wait, so it stays bound
    // until the future resolves.
    let (idle_wait, _stop) = handle.wait_with_timeout(wait);
    let result = idle_wait.await;

    match handle.done().await {
        Ok(s) => {
            let outcome = match result {
                Ok(IdleResponse::NewData(_)) => Ok(IdleOutcome::NewData),
                Ok(IdleResponse::Timeout) => Ok(IdleOutcome::Timeout),
                Ok(IdleResponse::ManualInterrupt) => Ok(IdleOutcome::Interrupted),
                Err(e) => Err(e.into()),
            };
            (Some(s), outcome)
        }
        Err(e) => (None, Err(e.into())),
    }
}
