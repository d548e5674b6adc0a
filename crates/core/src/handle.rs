//! Handles are how other services talk to a running reflector: commands
//! travel over a channel and are applied between receive-loop steps, so
//! callers never contend for the reflector's state.

use std::net::SocketAddr;

use flume as chan;
use serde::Serialize;
use thiserror::Error;

use crate::peer::PeerSummary;
use crate::peers::TableStats;
use crate::ring::TalkRecord;

/// Frames queued towards a bridge before the queue sheds load.
pub const BRIDGE_QUEUE_CAPACITY: usize = 512;

/// Create the bounded transmit queue a bridge installs with
/// [`Command::RegisterBridge`].
pub fn bridge_queue() -> (chan::Sender<Vec<u8>>, chan::Receiver<Vec<u8>>) {
    chan::bounded(BRIDGE_QUEUE_CAPACITY)
}

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Disconnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// Aggregate view served to snapshot consumers.
#[derive(Debug, Clone, Serialize)]
pub struct ReflectorStats {
    pub reflector: String,
    #[serde(flatten)]
    pub table: TableStats,
    /// Datagrams that failed to decode.
    pub malformed_frames: u64,
    /// Fan-out sends that failed.
    pub send_errors: u64,
    pub connected_bridges: usize,
}

/// Commands applied by the reflector service between receive-loop steps.
#[derive(Debug)]
pub enum Command {
    Stats {
        reply: chan::Sender<ReflectorStats>,
    },
    Peers {
        reply: chan::Sender<Vec<PeerSummary>>,
    },
    TalkHistory {
        reply: chan::Sender<Vec<TalkRecord>>,
    },
    /// Remove a peer as an operator action.
    Unlink {
        addr: SocketAddr,
        reply: chan::Sender<bool>,
    },
    /// Install an outbound bridge: its transmit queue receives every
    /// forwarded frame.
    RegisterBridge {
        name: String,
        tx: chan::Sender<Vec<u8>>,
    },
    UnregisterBridge {
        name: String,
    },
    /// A frame the bridge received from its remote, to be fanned out to
    /// local peers only.
    InjectFrame {
        bridge: String,
        frame: Vec<u8>,
    },
}

/// A cloneable handle to a running reflector service.
#[derive(Debug, Clone)]
pub struct Handle {
    commands: chan::Sender<Command>,
}

impl Handle {
    pub(crate) fn new(commands: chan::Sender<Command>) -> Self {
        Self { commands }
    }

    pub async fn stats(&self) -> Result<ReflectorStats, Error> {
        let (reply, rx) = chan::bounded(1);
        self.commands.send(Command::Stats { reply })?;
        Ok(rx.recv_async().await?)
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, Error> {
        let (reply, rx) = chan::bounded(1);
        self.commands.send(Command::Peers { reply })?;
        Ok(rx.recv_async().await?)
    }

    pub async fn talk_history(&self) -> Result<Vec<TalkRecord>, Error> {
        let (reply, rx) = chan::bounded(1);
        self.commands.send(Command::TalkHistory { reply })?;
        Ok(rx.recv_async().await?)
    }

    /// Remove a peer. Returns whether it was connected.
    pub async fn unlink(&self, addr: SocketAddr) -> Result<bool, Error> {
        let (reply, rx) = chan::bounded(1);
        self.commands.send(Command::Unlink { addr, reply })?;
        Ok(rx.recv_async().await?)
    }

    pub fn register_bridge(&self, name: &str, tx: chan::Sender<Vec<u8>>) -> Result<(), Error> {
        self.commands.send(Command::RegisterBridge {
            name: name.to_owned(),
            tx,
        })?;
        Ok(())
    }

    pub fn unregister_bridge(&self, name: &str) -> Result<(), Error> {
        self.commands.send(Command::UnregisterBridge {
            name: name.to_owned(),
        })?;
        Ok(())
    }

    pub fn inject_frame(&self, bridge: &str, frame: Vec<u8>) -> Result<(), Error> {
        self.commands.send(Command::InjectFrame {
            bridge: bridge.to_owned(),
            frame,
        })?;
        Ok(())
    }
}
