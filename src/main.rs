// This is an implementation of a TFTP server compliant with RFC 1350,
// storing every transferred file in an in-memory namespace.
//
// Transfer begins with a request to read or write a file. If the server
// grants the request, the file moves in blocks of 512 bytes, each data
// packet carrying one block that must be acked before the next one is sent.
// A data packet shorter than 512 bytes marks the end of the transfer.
//
// On data loss the intended recipient times out and retransmits its last
// packet (data or ack), prompting the sender to retransmit the lost one.
// Each side therefore keeps exactly one packet around for retransmission.
//
// Both ends of a transfer are identified by TIDs, which are plain UDP
// ports. The initial request arrives on the well-known port 69; the reply
// comes from a freshly bound ephemeral port that serves as the server's TID
// for the rest of the session. A datagram from any other host or port is
// answered with an "unknown TID" error and otherwise ignored, the only
// error that does not belong to the session it arrives on.
//
// Most other errors terminate the connection: an error packet is sent as a
// courtesy, never acked and never retransmitted, and timeouts catch the
// case where it gets lost.
//
// Whoever sends the final ack is encouraged to dally, staying around long
// enough to re-ack the final data block if the first ack got lost.

pub mod filesystem;
pub mod handlers;
pub mod logging;
pub mod session;
pub mod tftp;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{info, warn};

use filesystem::Root;
use session::SessionContext;
use tftp::{Packet, TftpSocket};

#[derive(Parser)]
#[command(version, about = "TFTP server storing transfers in memory")]
struct Args {
    /// Address the listener accepts initial requests on.
    #[arg(long, default_value = "0.0.0.0:69")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let listener = Arc::new(
        TftpSocket::bind(args.bind)
            .with_context(|| format!("error listening on tftpd service ({})", args.bind))?,
    );
    let store = Arc::new(Root::new());
    let mut sessions: JoinSet<()> = JoinSet::new();
    info!("tftpd listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            recvd = listener.recv_from() => {
                let (buf, raddr) = match recvd {
                    Ok(recvd) => recvd,
                    Err(e) => {
                        warn!("could not read ({e})");
                        continue;
                    }
                };
                let pkt = match Packet::parse_from_buf(&buf) {
                    Ok(pkt) => pkt,
                    Err(e) => {
                        warn!("could not decode packet ({e})");
                        continue;
                    }
                };
                let listener = Arc::clone(&listener);
                let store = Arc::clone(&store);
                sessions.spawn(async move {
                    let mut ctx = SessionContext::new(listener, raddr);
                    handlers::process_request(&mut ctx, &store, pkt).await;
                });
            }
            // reap finished sessions as we go
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    info!("tftpd terminating...");
    while sessions.join_next().await.is_some() {}
    Ok(())
}
