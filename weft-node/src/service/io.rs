//! Interface between the service and the transport adapters.
use std::collections::VecDeque;

use localtime::LocalDuration;
use log::*;

use crate::service::connection::ConnectionId;
use crate::service::message::{Message, SignalingPayload};
use crate::service::DisconnectReason;

/// I/O operation to execute at the transport level.
#[derive(Debug)]
pub enum Io {
    /// Open a direct transport session.
    Dial {
        conn: ConnectionId,
        host: String,
        port: u16,
    },
    /// Create an assisted transport session.
    Open {
        conn: ConnectionId,
        initiator: bool,
    },
    /// Feed a remote signalling payload into an assisted session.
    SignalInlet {
        conn: ConnectionId,
        payload: SignalingPayload,
    },
    /// There are some messages ready to be sent on a session.
    Write(ConnectionId, Vec<Message>),
    /// Close a transport session.
    Disconnect(ConnectionId, DisconnectReason),
    /// Ask for a wakeup in a specified amount of time.
    Wakeup(LocalDuration),
}

/// Interface to the network.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Outgoing I/O queue.
    io: VecDeque<Io>,
}

impl Outbox {
    /// Open a direct transport session.
    pub fn dial(&mut self, conn: ConnectionId, host: impl ToString, port: u16) {
        self.io.push_back(Io::Dial {
            conn,
            host: host.to_string(),
            port,
        });
    }

    /// Create an assisted transport session.
    pub fn open(&mut self, conn: ConnectionId, initiator: bool) {
        self.io.push_back(Io::Open { conn, initiator });
    }

    /// Feed a remote signalling payload into an assisted session.
    pub fn signal_inlet(&mut self, conn: ConnectionId, payload: SignalingPayload) {
        self.io.push_back(Io::SignalInlet { conn, payload });
    }

    /// Close a transport session.
    pub fn disconnect(&mut self, conn: ConnectionId, reason: DisconnectReason) {
        self.io.push_back(Io::Disconnect(conn, reason));
    }

    pub fn write(&mut self, conn: ConnectionId, msg: Message) {
        trace!(target: "service", "Write {:?} to {}", &msg, conn);

        self.io.push_back(Io::Write(conn, vec![msg]));
    }

    pub fn write_all(&mut self, conn: ConnectionId, msgs: impl IntoIterator<Item = Message>) {
        let msgs = msgs.into_iter().collect::<Vec<_>>();

        for (ix, msg) in msgs.iter().enumerate() {
            trace!(
                target: "service",
                "Write {:?} to {} ({}/{})",
                msg,
                conn,
                ix + 1,
                msgs.len()
            );
        }
        self.io.push_back(Io::Write(conn, msgs));
    }

    pub fn wakeup(&mut self, after: LocalDuration) {
        self.io.push_back(Io::Wakeup(after));
    }

    #[cfg(any(test, feature = "test"))]
    pub(crate) fn queue(&mut self) -> &mut VecDeque<Io> {
        &mut self.io
    }
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.io.pop_front()
    }
}
