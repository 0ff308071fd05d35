//! Per-transfer session state and the retransmitting send primitive.
//!
//! A session owns one endpoint (its ephemeral port is the server-side TID),
//! remembers the peer it talks to, and coordinates with at most one
//! retransmission task at a time. Every non-terminal send is matched by
//! exactly one confirmation before the next send; the confirmation stops the
//! retransmitter through a single-slot rendezvous channel. A retransmitter
//! that exhausts its retries instead fires the session-wide cancellation
//! token, which the receive loop surfaces as a connection timeout.

use crate::filesystem::MemoryFile;
use crate::tftp::{ErrorCode, OpCode, Packet, SocketError, TftpResult, TftpSocket};
use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const RETRANSMISSION_DELAY: Duration = Duration::from_millis(500);
pub const RETRANSMISSION_RETRIES: u32 = 20; // 10 seconds until the peer is declared gone

/// Protocol phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ini,
    Rrq,
    Wrq,
}

/// Determines which operations are allowed depending on the state of the
/// current session. Requests only open sessions, data answers a write,
/// acks answer a read, and a peer error may abort either transfer.
pub fn transition_allowed(state: SessionState, opcode: OpCode) -> bool {
    matches!(
        (opcode, state),
        (OpCode::Rrq, SessionState::Ini)
            | (OpCode::Wrq, SessionState::Ini)
            | (OpCode::Data, SessionState::Wrq)
            | (OpCode::Ack, SessionState::Rrq)
            | (OpCode::Error, SessionState::Rrq)
            | (OpCode::Error, SessionState::Wrq)
    )
}

/// State for one file transfer.
pub struct SessionContext {
    pub state: SessionState,
    /// Session endpoint. Starts out as the shared listener socket and is
    /// replaced with an ephemeral one once a transfer is accepted.
    pub sock: Arc<TftpSocket>,
    /// The peer's address and port (its TID), fixed for the whole session.
    pub raddr: SocketAddr,
    /// Next expected (write) or last sent (read) block number.
    pub block: u16,
    /// The file this transfer reads from or writes into.
    pub file: Option<Arc<MemoryFile>>,
    /// Set once a short block has been read or received.
    pub last_block: bool,
    /// Rendezvous with the running retransmitter, if any.
    active_tx: Option<oneshot::Sender<()>>,
    /// Fired by a retransmitter that has given up on the peer.
    timeout: CancellationToken,
}

impl SessionContext {
    pub fn new(sock: Arc<TftpSocket>, raddr: SocketAddr) -> SessionContext {
        SessionContext {
            state: SessionState::Ini,
            sock,
            raddr,
            block: 1,
            file: None,
            last_block: false,
            active_tx: None,
            timeout: CancellationToken::new(),
        }
    }

    /// Whether a retransmitter has given up on the peer.
    pub fn timed_out(&self) -> bool {
        self.timeout.is_cancelled()
    }

    /// Send a packet to the session peer. With `once` set the datagram goes
    /// out a single time (terminal acks and error replies). Otherwise a
    /// retransmission task resends the same bytes every
    /// [`RETRANSMISSION_DELAY`] until the next confirmation, and fires the
    /// session timeout after [`RETRANSMISSION_RETRIES`] unanswered resends.
    pub async fn send(&mut self, pkt: &Packet, once: bool) -> TftpResult<()> {
        let bytes = pkt.to_bytes();
        self.sock.send_raw(&bytes, self.raddr).await?;
        if once {
            return Ok(());
        }

        let (ack_tx, mut ack_rx) = oneshot::channel();
        let sock = Arc::clone(&self.sock);
        let raddr = self.raddr;
        let timeout = self.timeout.clone();
        tokio::spawn(async move {
            for _ in 0..RETRANSMISSION_RETRIES {
                tokio::select! {
                    // confirmed, or the session is gone
                    _ = &mut ack_rx => return,
                    _ = time::sleep(RETRANSMISSION_DELAY) => {}
                }
                if let Err(e) = sock.send_raw(&bytes, raddr).await {
                    warn!("could not write ({e})");
                }
            }
            timeout.cancel(); // connection timeout
        });

        self.active_tx = Some(ack_tx);
        Ok(())
    }

    /// Confirm a previous send operation, thus stopping retransmissions.
    pub fn confirm_previous_pkt_sent(&mut self) {
        if let Some(ack) = self.active_tx.take() {
            // a retransmitter that already gave up just drops the token
            let _ = ack.send(());
        }
    }
}

/// Why a session ended before its transfer completed.
#[derive(Debug)]
pub enum SessionError {
    /// The peer stopped acknowledging and the retransmitter gave up.
    ConnTimeout(SocketAddr),
    /// The peer sent an opcode that is not legal in the current state.
    IllegalOp { opcode: OpCode, state: SessionState },
    /// The peer aborted the transfer with an error packet.
    Peer { code: ErrorCode, message: String },
    Socket(SocketError),
    Io(io::Error),
    Internal(String),
}

impl error::Error for SessionError {}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::ConnTimeout(raddr) => write!(f, "{raddr}: connection timeout"),
            SessionError::IllegalOp { opcode, state } => {
                write!(f, "opcode {opcode:?} is illegal in state {state:?}")
            }
            SessionError::Peer { code, message } => {
                write!(f, "peer aborted the transfer: {code:?} ({message})")
            }
            SessionError::Socket(e) => write!(f, "{e}"),
            SessionError::Io(e) => write!(f, "file IO error: {e}"),
            SessionError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl From<SocketError> for SessionError {
    fn from(e: SocketError) -> SessionError {
        SessionError::Socket(e)
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> SessionError {
        SessionError::Io(e)
    }
}
