//! Running a connection on its own task.
//!
//! [`spawn`] moves a [`Connection`] onto a tokio task that processes
//! transport events, reconnect deadlines and caller commands in one loop.
//! Callers interact with it through a cloneable [`ConnectionHandle`].

use crate::connection::{Connection, ConnectionError, ReadyStateMirror};
use crate::traits::{ReadyState, TransportKind};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
enum Command {
    Send(Value),
    Open(Option<TransportKind>),
    Close,
}

/// A cloneable handle to a spawned connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    ready_state: ReadyStateMirror,
}

impl ConnectionHandle {
    /// Queue a message for sending.
    ///
    /// Delivery failures are logged by the connection task.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Shutdown`] if the task is gone.
    pub fn send(&self, payload: Value) -> Result<(), ConnectionError> {
        self.command(Command::Send(payload))
    }

    /// Serialise `payload` and queue it for sending.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails or the task is gone.
    pub fn send_json<T>(&self, payload: &T) -> Result<(), ConnectionError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(ConnectionError::Encode)?;
        self.send(value)
    }

    /// Reopen the active transport kind. See [`Connection::open`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Shutdown`] if the task is gone.
    pub fn open(&self) -> Result<(), ConnectionError> {
        self.command(Command::Open(None))
    }

    /// Reopen the primary transport. See [`Connection::open_primary`]; a
    /// refusal after the downgrade is logged by the connection task.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Shutdown`] if the task is gone.
    pub fn open_primary(&self) -> Result<(), ConnectionError> {
        self.command(Command::Open(Some(TransportKind::Primary)))
    }

    /// Downgrade to the fallback transport.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Shutdown`] if the task is gone.
    pub fn open_fallback(&self) -> Result<(), ConnectionError> {
        self.command(Command::Open(Some(TransportKind::Fallback)))
    }

    fn command(&self, command: Command) -> Result<(), ConnectionError> {
        self.commands
            .send(command)
            .map_err(|_| ConnectionError::Shutdown)
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Shutdown`] if the task is gone.
    pub fn close(&self) -> Result<(), ConnectionError> {
        self.command(Command::Close)
    }

    /// Ready state as last observed by the connection task.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.ready_state.get()
    }

    /// Whether the connection task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Run `connection` on a new tokio task.
///
/// The task ends once every [`ConnectionHandle`] has been dropped; the
/// connection is closed on the way out.
pub fn spawn(mut connection: Connection) -> (ConnectionHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle {
        commands: tx,
        ready_state: connection.ready_state_mirror(),
    };

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Send(payload)) => {
                        if let Err(e) = connection.send(payload) {
                            warn!(error = %e, "Send failed");
                        }
                    }
                    Some(Command::Open(None)) => connection.open(),
                    Some(Command::Open(Some(TransportKind::Primary))) => {
                        if let Err(e) = connection.open_primary() {
                            warn!(error = %e, "Cannot reopen primary transport");
                        }
                    }
                    Some(Command::Open(Some(TransportKind::Fallback))) => {
                        connection.open_fallback();
                    }
                    Some(Command::Close) => connection.close(),
                    None => {
                        debug!("All connection handles dropped");
                        connection.close();
                        if let Err(e) = connection.process_pending() {
                            warn!(error = %e, "Error while shutting down connection");
                        }
                        break;
                    }
                },
                result = connection.process_next() => match result {
                    Ok(()) => {}
                    Err(ConnectionError::Shutdown) => break,
                    Err(e) => warn!(error = %e, "Error processing transport event"),
                }
            }
        }
        debug!("Connection task finished");
    });

    (handle, task)
}
