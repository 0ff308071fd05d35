// This module drives individual transfers.
//
// A session begins when the listener hands over a decoded initial request.
// The handler for that request binds its own ephemeral endpoint, whose port
// becomes the server-side TID, answers the request (first data block for a
// read, the block-0 ack for a write), and then enters the receive loop. The
// loop cycles through 1-second read deadlines, filters out datagrams from
// foreign TIDs, and feeds everything else back through the opcode dispatch
// until the transfer is complete.
//
// Write sessions linger for a dally period after acking the last data block:
// if that final ack is lost, the client retransmits its last block and the
// session must still be around to re-ack it. Read sessions end immediately
// on the final ack, retransmitting the last data block is the client's cue
// that the ack was lost.

use crate::filesystem::Root;
use crate::session::{transition_allowed, SessionContext, SessionError, SessionState};
use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket, BLOCK_SIZE};
use rand::Rng;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Deadline expiries a write session waits out after the final ack, ready to
/// re-ack a duplicated last data block.
const DALLY_DELAY: u32 = 3;

/// Read deadline for one iteration of the receive loop.
const READ_DEADLINE: Duration = Duration::from_secs(1);

/// How many random ports to try when binding a session endpoint.
const BIND_ATTEMPTS: u32 = 16;

/// Entry point for a freshly created session: dispatch the initial packet to
/// the handler for its opcode. Anything other than a request cannot open a
/// session; the error reply then goes out through the listener socket since
/// no session endpoint exists yet.
pub async fn process_request(ctx: &mut SessionContext, store: &Root, pkt: Packet) {
    if !transition_allowed(ctx.state, pkt.opcode()) {
        let reply = Packet::Error { code: ErrorCode::IllegalOp, message: String::new() };
        if let Err(e) = ctx.send(&reply, true).await {
            warn!("could not write ({e})");
        }
        warn!(
            "session with {} ended: {}",
            ctx.raddr,
            SessionError::IllegalOp { opcode: pkt.opcode(), state: ctx.state }
        );
        return;
    }

    let result = match pkt {
        Packet::ReadReq { path, mode } => handle_read_req(ctx, store, &path, &mode).await,
        Packet::WriteReq { path, mode } => handle_write_req(ctx, store, &path, &mode).await,
        // the transition guard admits nothing else in the initial state
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!("session with {} ended: {e}", ctx.raddr);
    }
}

async fn handle_write_req(
    ctx: &mut SessionContext,
    store: &Root,
    path: &str,
    mode: &str,
) -> Result<(), SessionError> {
    ctx.state = SessionState::Wrq;
    ctx.sock = bind_ephemeral()?;

    if !mode.eq_ignore_ascii_case("octet") {
        let reply = Packet::Error {
            code: ErrorCode::Undefined,
            message: "unsupported mode of operation".to_string(),
        };
        ctx.send(&reply, true).await?;
        return Ok(());
    }

    let Some(name) = base_name(path) else {
        let reply = Packet::Error {
            code: ErrorCode::AccessViolation,
            message: "invalid file name".to_string(),
        };
        ctx.send(&reply, true).await?;
        return Ok(());
    };
    info!("write request from {}: put {}", ctx.raddr, name);

    let file = store.create_memory_file(name);
    ctx.file = Some(Arc::clone(&file));
    // block-0 handshake
    ctx.send(&Packet::Ack { block: 0 }, false).await?;
    serve_req(ctx, DALLY_DELAY).await?;
    file.sync()?;
    store.save(file);

    Ok(())
}

async fn handle_read_req(
    ctx: &mut SessionContext,
    store: &Root,
    path: &str,
    mode: &str,
) -> Result<(), SessionError> {
    ctx.state = SessionState::Rrq;
    ctx.sock = bind_ephemeral()?;

    if !mode.eq_ignore_ascii_case("octet") {
        let reply = Packet::Error {
            code: ErrorCode::Undefined,
            message: "unsupported mode of operation".to_string(),
        };
        ctx.send(&reply, true).await?;
        return Ok(());
    }

    let Some(name) = base_name(path) else {
        let reply = Packet::Error {
            code: ErrorCode::AccessViolation,
            message: "invalid file name".to_string(),
        };
        ctx.send(&reply, true).await?;
        return Ok(());
    };
    info!("read request from {}: get {}", ctx.raddr, name);

    let file = match store.open(name) {
        Ok(file) => file,
        Err(_) => {
            let reply = Packet::Error { code: ErrorCode::FileNotFound, message: String::new() };
            ctx.send(&reply, true).await?;
            return Ok(());
        }
    };
    ctx.file = Some(file);

    let pkt = next_data_packet(ctx, ctx.block)?
        .ok_or_else(|| SessionError::Internal("no data for the first block".to_string()))?;
    ctx.send(&pkt, false).await?;
    serve_req(ctx, 0).await?;

    if let Some(file) = &ctx.file {
        file.close()?;
    }
    Ok(())
}

/// Drive a session until its transfer is complete and, for writes, the dally
/// period has passed without further traffic.
async fn serve_req(ctx: &mut SessionContext, dally: u32) -> Result<(), SessionError> {
    let mut done = false;
    let mut idle = 0;

    while !done || idle < dally {
        if ctx.timed_out() {
            return Err(SessionError::ConnTimeout(ctx.raddr));
        }
        let (buf, addr) = match ctx.sock.recv_from_with_timeout(READ_DEADLINE).await {
            Ok(recvd) => recvd,
            Err(SocketError::Timeout(_)) => {
                if done {
                    idle += 1;
                }
                continue;
            }
            Err(e) => {
                warn!("could not read ({e})");
                continue;
            }
        };
        if addr != ctx.raddr {
            // a foreign TID must not disturb the transfer
            let reply = Packet::Error { code: ErrorCode::UnknownTid, message: String::new() };
            if let Err(e) = ctx.sock.send(&reply, addr).await {
                warn!("could not write ({e})");
            }
            continue;
        }
        let pkt = match Packet::parse_from_buf(&buf) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("could not decode packet ({e})");
                continue;
            }
        };
        done = process_transfer(ctx, pkt).await?;
        idle = 0;
    }
    Ok(())
}

/// Opcode dispatch for packets arriving mid-transfer.
async fn process_transfer(ctx: &mut SessionContext, pkt: Packet) -> Result<bool, SessionError> {
    if !transition_allowed(ctx.state, pkt.opcode()) {
        let reply = Packet::Error { code: ErrorCode::IllegalOp, message: String::new() };
        ctx.send(&reply, true).await?;
        return Err(SessionError::IllegalOp { opcode: pkt.opcode(), state: ctx.state });
    }

    match pkt {
        Packet::Data { block, data } => handle_data(ctx, block, &data).await,
        Packet::Ack { block } => handle_ack(ctx, block).await,
        Packet::Error { code, message } => {
            // the peer gave up; end the session without a reply
            ctx.confirm_previous_pkt_sent();
            Err(SessionError::Peer { code, message })
        }
        // the transition guard admits no requests mid-transfer
        _ => Ok(false),
    }
}

/// Store one arriving data block and acknowledge it.
async fn handle_data(
    ctx: &mut SessionContext,
    block: u16,
    data: &[u8],
) -> Result<bool, SessionError> {
    if ctx.block != block {
        return Ok(false); // stale or premature block, the peer will retransmit
    }
    let Some(file) = ctx.file.clone() else {
        return Err(SessionError::Internal("no file bound to the write session".to_string()));
    };

    let off = u64::from(block.wrapping_sub(1)) * BLOCK_SIZE as u64;
    file.write_at(data, off)?;
    ctx.confirm_previous_pkt_sent();

    if data.len() < BLOCK_SIZE {
        ctx.send(&Packet::Ack { block }, true).await?;
        return Ok(true); // last block
    }
    ctx.send(&Packet::Ack { block }, false).await?;

    ctx.block = ctx.block.wrapping_add(1);
    Ok(false)
}

/// Send the next data block once the peer has acknowledged the previous one.
async fn handle_ack(ctx: &mut SessionContext, block: u16) -> Result<bool, SessionError> {
    if ctx.block != block {
        return Ok(false); // stale ack
    }

    let next = next_data_packet(ctx, ctx.block.wrapping_add(1))?;
    ctx.confirm_previous_pkt_sent();
    let Some(pkt) = next else {
        return Ok(true); // the acked block was the final one
    };
    ctx.send(&pkt, false).await?;

    ctx.block = ctx.block.wrapping_add(1);
    Ok(false)
}

/// Read one block out of the session file. Returns None once the file is
/// exhausted and the final short block has already gone out.
fn next_data_packet(ctx: &mut SessionContext, block: u16) -> Result<Option<Packet>, SessionError> {
    let Some(file) = ctx.file.clone() else {
        return Err(SessionError::Internal("no file bound to the read session".to_string()));
    };

    let mut buf = [0u8; BLOCK_SIZE];
    let off = u64::from(block.wrapping_sub(1)) * BLOCK_SIZE as u64;
    let n = match file.read_at(&mut buf, off) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            if ctx.last_block {
                return Ok(None);
            }
            // a block-aligned file ends with an explicit empty block
            0
        }
        Err(e) => return Err(SessionError::Io(e)),
    };
    if n < BLOCK_SIZE {
        ctx.last_block = true;
    }
    Ok(Some(Packet::Data { block, data: buf[..n].to_vec() }))
}

/// Bind a session endpoint on a random ephemeral port, which becomes the
/// server-side TID for the transfer.
fn bind_ephemeral() -> Result<Arc<TftpSocket>, SessionError> {
    let mut rng = rand::thread_rng();
    for _ in 0..BIND_ATTEMPTS {
        let port = rng.gen_range(1024..65535);
        match TftpSocket::bind((Ipv4Addr::UNSPECIFIED, port).into()) {
            Ok(sock) => return Ok(Arc::new(sock)),
            Err(e) => warn!("could not bind port {port} ({e})"),
        }
    }
    Err(SessionError::Internal("could not bind an ephemeral endpoint".to_string()))
}

/// Final path component of a requested name; transfers live in a flat
/// namespace.
fn base_name(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::TftpResult;
    use std::net::SocketAddr;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn client() -> TftpSocket {
        TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap()
    }

    /// Spawn a session the way the listener would, addressed at `raddr`.
    fn spawn_session(store: Arc<Root>, raddr: SocketAddr, pkt: Packet) -> JoinHandle<()> {
        let listener = Arc::new(TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap());
        tokio::spawn(async move {
            let mut ctx = SessionContext::new(listener, raddr);
            process_request(&mut ctx, &store, pkt).await;
        })
    }

    async fn recv_packet(sock: &TftpSocket) -> (Packet, SocketAddr) {
        let (buf, addr) = sock.recv_from_with_timeout(Duration::from_secs(2)).await.unwrap();
        (Packet::parse_from_buf(&buf).unwrap(), addr)
    }

    /// Receive until `want` shows up, skipping retransmissions of earlier
    /// packets that may interleave with it.
    async fn expect_packet(sock: &TftpSocket, want: &Packet) -> SocketAddr {
        for _ in 0..8 {
            let (pkt, addr) = recv_packet(sock).await;
            if pkt == *want {
                return addr;
            }
        }
        panic!("never received {want:?}");
    }

    fn read_req(path: &str) -> Packet {
        Packet::ReadReq { path: path.to_string(), mode: "octet".to_string() }
    }

    fn write_req(path: &str) -> Packet {
        Packet::WriteReq { path: path.to_string(), mode: "octet".to_string() }
    }

    fn contents(store: &Root, name: &str) -> Vec<u8> {
        let file = store.open(name).unwrap();
        let mut buf = vec![0; 4096];
        let n = file.read_at(&mut buf, 0).unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let store = Arc::new(Root::new());
        let client = client();
        let raddr = client.local_addr().unwrap();

        // path components are stripped on the way in
        let session = spawn_session(Arc::clone(&store), raddr, write_req("dir/hello.txt"));

        let (handshake, session_addr) = recv_packet(&client).await;
        assert_eq!(handshake, Packet::Ack { block: 0 });

        client
            .send(&Packet::Data { block: 1, data: b"hi\n".to_vec() }, session_addr)
            .await
            .unwrap();
        expect_packet(&client, &Packet::Ack { block: 1 }).await;

        // the file is published once the dally period has run out
        timeout(Duration::from_secs(6), session).await.unwrap().unwrap();
        assert_eq!(contents(&store, "hello.txt"), b"hi\n");

        // and a read of the same name delivers the same bytes
        let session = spawn_session(Arc::clone(&store), raddr, read_req("hello.txt"));
        let (data, session_addr) = recv_packet(&client).await;
        assert_eq!(data, Packet::Data { block: 1, data: b"hi\n".to_vec() });
        client.send(&Packet::Ack { block: 1 }, session_addr).await.unwrap();
        timeout(Duration::from_secs(2), session).await.unwrap().unwrap();

        // the final ack ends the session: nothing is retransmitted
        assert!(matches!(
            client.recv_from_with_timeout(Duration::from_millis(700)).await,
            Err(SocketError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_write_block_aligned_file() {
        let store = Arc::new(Root::new());
        let client = client();
        let raddr = client.local_addr().unwrap();

        let session = spawn_session(Arc::clone(&store), raddr, write_req("aligned"));

        let (_, session_addr) = recv_packet(&client).await;
        client
            .send(&Packet::Data { block: 1, data: vec![0x41; 512] }, session_addr)
            .await
            .unwrap();
        expect_packet(&client, &Packet::Ack { block: 1 }).await;

        // a 512-multiple upload is closed out by an empty block
        client.send(&Packet::Data { block: 2, data: vec![] }, session_addr).await.unwrap();
        expect_packet(&client, &Packet::Ack { block: 2 }).await;

        timeout(Duration::from_secs(6), session).await.unwrap().unwrap();
        assert_eq!(contents(&store, "aligned"), vec![0x41; 512]);
    }

    #[tokio::test]
    async fn test_write_three_blocks() {
        let store = Arc::new(Root::new());
        let client = client();
        let raddr = client.local_addr().unwrap();

        let payload: Vec<u8> = (0..1025u32).map(|i| i as u8).collect();
        let session = spawn_session(Arc::clone(&store), raddr, write_req("big"));

        let (_, session_addr) = recv_packet(&client).await;
        for (i, chunk) in payload.chunks(512).enumerate() {
            let block = i as u16 + 1;
            client
                .send(&Packet::Data { block, data: chunk.to_vec() }, session_addr)
                .await
                .unwrap();
            expect_packet(&client, &Packet::Ack { block }).await;
        }

        timeout(Duration::from_secs(6), session).await.unwrap().unwrap();
        assert_eq!(contents(&store, "big"), payload);
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let store = Arc::new(Root::new());
        let client = client();
        let raddr = client.local_addr().unwrap();

        let session = spawn_session(Arc::clone(&store), raddr, read_req("missing"));

        let (reply, _) = recv_packet(&client).await;
        assert_eq!(reply, Packet::Error { code: ErrorCode::FileNotFound, message: String::new() });
        timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_read_block_aligned_file() {
        let store = Arc::new(Root::new());
        let file = store.create_memory_file("aligned");
        file.write_at(&vec![0x42; 512], 0).unwrap();
        store.save(file);

        let client = client();
        let raddr = client.local_addr().unwrap();
        let session = spawn_session(Arc::clone(&store), raddr, read_req("aligned"));

        let (data, session_addr) = recv_packet(&client).await;
        assert_eq!(data, Packet::Data { block: 1, data: vec![0x42; 512] });
        client.send(&Packet::Ack { block: 1 }, session_addr).await.unwrap();

        // the download is closed out by an empty block
        expect_packet(&client, &Packet::Data { block: 2, data: vec![] }).await;
        client.send(&Packet::Ack { block: 2 }, session_addr).await.unwrap();

        timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_foreign_tid_is_rejected() {
        let store = Arc::new(Root::new());
        let real_client = client();
        let raddr = real_client.local_addr().unwrap();

        let session = spawn_session(Arc::clone(&store), raddr, write_req("guarded"));
        let (_, session_addr) = recv_packet(&real_client).await;

        // a third party barges in from a different port
        let intruder = client();
        intruder
            .send(&Packet::Data { block: 1, data: b"evil".to_vec() }, session_addr)
            .await
            .unwrap();
        let (reply, _) = recv_packet(&intruder).await;
        assert_eq!(reply, Packet::Error { code: ErrorCode::UnknownTid, message: String::new() });

        // the real transfer is unaffected
        real_client
            .send(&Packet::Data { block: 1, data: b"hi\n".to_vec() }, session_addr)
            .await
            .unwrap();
        expect_packet(&real_client, &Packet::Ack { block: 1 }).await;

        timeout(Duration::from_secs(6), session).await.unwrap().unwrap();
        assert_eq!(contents(&store, "guarded"), b"hi\n");
    }

    #[tokio::test]
    async fn test_unsupported_mode_is_refused() {
        let store = Arc::new(Root::new());
        let client = client();
        let raddr = client.local_addr().unwrap();

        let pkt = Packet::WriteReq { path: "f".to_string(), mode: "netascii".to_string() };
        let session = spawn_session(Arc::clone(&store), raddr, pkt);

        let (reply, _) = recv_packet(&client).await;
        assert_eq!(
            reply,
            Packet::Error {
                code: ErrorCode::Undefined,
                message: "unsupported mode of operation".to_string(),
            }
        );
        timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
        assert!(store.open("f").is_err());
    }

    #[tokio::test]
    async fn test_illegal_initial_opcode() {
        let store = Arc::new(Root::new());
        let client = client();
        let raddr = client.local_addr().unwrap();

        let session = spawn_session(Arc::clone(&store), raddr, Packet::Ack { block: 1 });

        let (reply, _) = recv_packet(&client).await;
        assert_eq!(reply, Packet::Error { code: ErrorCode::IllegalOp, message: String::new() });
        timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_illegal_opcode_mid_transfer_terminates() {
        let store = Arc::new(Root::new());
        let client = client();
        let raddr = client.local_addr().unwrap();

        let session = spawn_session(Arc::clone(&store), raddr, write_req("doomed"));
        let (_, session_addr) = recv_packet(&client).await;

        // an ack has no business answering a write request
        client.send(&Packet::Ack { block: 0 }, session_addr).await.unwrap();
        expect_packet(&client, &Packet::Error { code: ErrorCode::IllegalOp, message: String::new() })
            .await;

        // the session dies without dallying and nothing is published
        timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
        assert!(store.open("doomed").is_err());
    }

    #[tokio::test]
    async fn test_peer_error_aborts_write() {
        let store = Arc::new(Root::new());
        let client = client();
        let raddr = client.local_addr().unwrap();

        let session = spawn_session(Arc::clone(&store), raddr, write_req("aborted"));
        let (_, session_addr) = recv_packet(&client).await;

        let abort = Packet::Error { code: ErrorCode::Undefined, message: "giving up".to_string() };
        client.send(&abort, session_addr).await.unwrap();

        timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
        assert!(store.open("aborted").is_err());
    }

    #[tokio::test]
    async fn test_stale_data_block_is_ignored() {
        let store = Arc::new(Root::new());
        let client = client();
        let raddr = client.local_addr().unwrap();

        let session = spawn_session(Arc::clone(&store), raddr, write_req("steady"));
        let (_, session_addr) = recv_packet(&client).await;

        // a block the session is not waiting for draws no ack at all
        client
            .send(&Packet::Data { block: 5, data: b"nope".to_vec() }, session_addr)
            .await
            .unwrap();
        let stray: TftpResult<_> = client.recv_from_with_timeout(Duration::from_millis(300)).await;
        assert!(matches!(stray, Err(SocketError::Timeout(_))));

        // while the expected block completes the transfer as usual
        client
            .send(&Packet::Data { block: 1, data: b"ok".to_vec() }, session_addr)
            .await
            .unwrap();
        expect_packet(&client, &Packet::Ack { block: 1 }).await;

        timeout(Duration::from_secs(6), session).await.unwrap().unwrap();
        assert_eq!(contents(&store, "steady"), b"ok");
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_write() {
        let store = Arc::new(Root::new());
        let client = client();
        let raddr = client.local_addr().unwrap();

        let session = spawn_session(Arc::clone(&store), raddr, write_req("ghost"));
        let (_, _) = recv_packet(&client).await;

        // never answer: the block-0 ack is retransmitted until the session
        // declares a connection timeout and gives up without publishing
        timeout(Duration::from_secs(13), session).await.unwrap().unwrap();
        assert!(store.open("ghost").is_err());
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("hello.txt"), Some("hello.txt"));
        assert_eq!(base_name("/a/b/c.bin"), Some("c.bin"));
        assert_eq!(base_name("dir/"), None);
        assert_eq!(base_name(""), None);
        assert_eq!(base_name("."), None);
        assert_eq!(base_name(".."), None);
        assert_eq!(base_name("a/.."), None);
    }
}
