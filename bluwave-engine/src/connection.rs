//! Transport lifecycle for both roles: listener + accept loop (host),
//! outbound connect (client), per-connection read and writer tasks,
//! sequential broadcast, disconnect path.
//!
//! Each connection gets exactly one read task and one writer task; all
//! outbound frames for a peer go through its writer's queue, so writes are
//! serialized per connection. Registry mutations happen under the single
//! engine state mutex.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bluwave_core::{encode_frame, DeviceId, FrameBuffer, Hello};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::engine::{EngineState, Inner, PeerHandle};
use crate::errors::EngineError;
use crate::router;

const READ_CHUNK: usize = 4096;

/// Bind the listener and start the accept loop. Returns the bound address
/// (the configured port, or the ephemeral one when configured as 0).
pub(crate) async fn start_listening(inner: Arc<Inner>) -> Result<SocketAddr, EngineError> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, inner.config.transport_port))
        .await
        .map_err(EngineError::RadioUnavailable)?;
    let addr = listener.local_addr()?;
    let mut state = inner.state.lock().await;
    state.listen_addr = Some(addr);
    let loop_inner = inner.clone();
    state.tasks.spawn(accept_loop(loop_inner, listener));
    Ok(addr)
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                // Capacity is enforced here, before any handshake: a full
                // host closes the socket immediately, no queueing.
                let full = inner.state.lock().await.registry.is_full();
                if full {
                    tracing::debug!(%addr, "at capacity, rejecting inbound connection");
                    drop(stream);
                    continue;
                }
                let conn_inner = inner.clone();
                let mut state = inner.state.lock().await;
                state.tasks.spawn(async move {
                    if let Err(err) = accept_connection(conn_inner, stream).await {
                        tracing::debug!(error = %err, "inbound connection setup failed");
                    }
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed, stopping listener");
                break;
            }
        }
    }
}

/// Handshake and register one inbound connection, then hand it its tasks.
/// Wire order seen by the peer: our hello, the wrapped group key, then chat
/// frames.
async fn accept_connection(inner: Arc<Inner>, mut stream: TcpStream) -> Result<(), EngineError> {
    let hello_bytes = read_frame(&mut stream).await?;
    let hello = Hello::from_bytes(&hello_bytes)
        .map_err(|e| EngineError::HandshakeRejected(e.to_string()))?;
    hello
        .validate()
        .map_err(|e| EngineError::HandshakeRejected(e.to_string()))?;
    let peer_id = hello.device_id;

    let (tx, rx) = mpsc::unbounded_channel();
    let (own_hello, wrapped, gen);
    {
        let mut state = inner.state.lock().await;
        if state.session.is_none() {
            return Err(EngineError::NotInSession);
        }
        let displaced = match state.registry.connect(peer_id, &hello.name, false) {
            Ok(d) => d,
            Err(_) => {
                // Lost the race to the last slot; same silent rejection.
                tracing::debug!(peer = %peer_id, "at capacity, rejecting inbound connection");
                return Ok(());
            }
        };
        if displaced {
            // One connection per address: shut the old one down first.
            if let Some(old) = state.peers.remove(&peer_id) {
                if let Some(abort) = old.read_abort {
                    abort.abort();
                }
            }
            tracing::debug!(peer = %peer_id, "replacing existing connection");
        }
        state.crypto.establish_group_key(&hello.public_key);
        wrapped = state.crypto.wrap_group_key(&hello.public_key)?;
        own_hello = Hello::new(
            inner.device_id,
            state.crypto.keypair().public_key().clone(),
            inner.config.display_name.clone(),
        );
        gen = state.next_gen();
        state.peers.insert(
            peer_id,
            PeerHandle {
                tx,
                read_abort: None,
                gen,
            },
        );
        if let Some(sess) = state.session.as_mut() {
            sess.active = true;
        }
        inner.publish_devices(&state);
        // Published under the state lock: a teardown racing on a failing
        // stream has to order after this registration, so its
        // `connected = false` is never overwritten by a stale `true`.
        inner.watches.connected_tx.send_replace(true);
        inner.append_system(format!("{} joined the chat", hello.name));
    }

    let handshake = async {
        write_frame(&mut stream, &own_hello.to_bytes().map_err(EngineError::invalid_data)?).await?;
        write_frame(&mut stream, &wrapped).await
    };
    if let Err(err) = handshake.await {
        disconnect_peer(&inner, peer_id, gen).await;
        return Err(err);
    }

    spawn_connection_tasks(&inner, peer_id, gen, stream, rx).await;
    tracing::info!(peer = %peer_id, name = %hello.name, "peer joined");
    Ok(())
}

/// Client role: dial the host, handshake, receive the wrapped group key,
/// register the single host connection. On failure nothing is retained.
pub(crate) async fn connect_to(inner: Arc<Inner>, addr: SocketAddr) -> Result<(), EngineError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(EngineError::ConnectionFailed)?;

    let own_hello = {
        let state = inner.state.lock().await;
        Hello::new(
            inner.device_id,
            state.crypto.keypair().public_key().clone(),
            inner.config.display_name.clone(),
        )
    };
    write_frame(&mut stream, &own_hello.to_bytes().map_err(EngineError::invalid_data)?).await?;

    let host_hello = Hello::from_bytes(&read_frame(&mut stream).await?)
        .map_err(|e| EngineError::HandshakeRejected(e.to_string()))?;
    host_hello
        .validate()
        .map_err(|e| EngineError::HandshakeRejected(e.to_string()))?;
    let wrapped = read_frame(&mut stream).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let gen;
    {
        let mut state = inner.state.lock().await;
        if state.session.is_none() {
            return Err(EngineError::NotInSession);
        }
        state
            .crypto
            .unwrap_group_key(&host_hello.public_key, &wrapped)?;
        state
            .registry
            .connect(host_hello.device_id, &host_hello.name, true)
            .map_err(|_| EngineError::HandshakeRejected("registry full".to_string()))?;
        gen = state.next_gen();
        state.peers.insert(
            host_hello.device_id,
            PeerHandle {
                tx,
                read_abort: None,
                gen,
            },
        );
        if let Some(sess) = state.session.as_mut() {
            sess.active = true;
        }
        inner.publish_devices(&state);
        // Same lock discipline as the accept side.
        inner.watches.connected_tx.send_replace(true);
        inner.append_system(format!("{} joined the chat", host_hello.name));
    }

    spawn_connection_tasks(&inner, host_hello.device_id, gen, stream, rx).await;
    tracing::info!(host = %host_hello.device_id, "joined host");
    Ok(())
}

async fn spawn_connection_tasks(
    inner: &Arc<Inner>,
    peer_id: DeviceId,
    gen: u64,
    stream: TcpStream,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut state = inner.state.lock().await;
    let abort = state
        .tasks
        .spawn(read_loop(inner.clone(), peer_id, gen, read_half));
    if let Some(handle) = state.peers.get_mut(&peer_id) {
        if handle.gen == gen {
            handle.read_abort = Some(abort);
        }
    }
    state
        .tasks
        .spawn(write_loop(inner.clone(), peer_id, gen, write_half, rx));
}

/// Per-connection read task: bounded chunk reads feed the frame buffer; each
/// complete frame goes to the router. Any read failure or unrecoverable
/// stream state ends the loop and runs the disconnect path exactly once.
async fn read_loop(inner: Arc<Inner>, peer_id: DeviceId, gen: u64, mut reader: OwnedReadHalf) {
    let mut frames = FrameBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];
    'conn: loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break 'conn,
            Ok(n) => {
                frames.extend(&chunk[..n]);
                loop {
                    match frames.next_frame() {
                        Ok(Some(frame)) => {
                            router::on_frame_from_peer(&inner, peer_id, &frame).await;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::warn!(peer = %peer_id, error = %err, "dropping connection");
                            break 'conn;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(peer = %peer_id, error = %err, "read failed");
                break 'conn;
            }
        }
    }
    disconnect_peer(&inner, peer_id, gen).await;
}

/// Per-connection writer task: drains the peer's queue onto the socket. A
/// write failure takes this connection's disconnect path without touching
/// the others.
async fn write_loop(
    inner: Arc<Inner>,
    peer_id: DeviceId,
    gen: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            tracing::debug!(peer = %peer_id, error = %err, "write failed");
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    disconnect_peer(&inner, peer_id, gen).await;
}

/// Queue `frame` to every connection except `exclude`, in connection order.
/// Failures surface in the owning writer task; one bad peer never blocks the
/// rest.
pub(crate) fn broadcast(state: &EngineState, exclude: Option<DeviceId>, frame: &[u8]) {
    for id in state.registry.connected_ids() {
        if Some(id) == exclude {
            continue;
        }
        if let Some(peer) = state.peers.get(&id) {
            let _ = peer.tx.send(frame.to_vec());
        }
    }
}

/// Run a peer's disconnect side effects exactly once. The `gen` guard keeps
/// a stale path (from a connection that was since replaced) from tearing
/// down its replacement.
pub(crate) async fn disconnect_peer(inner: &Arc<Inner>, peer_id: DeviceId, gen: u64) {
    let mut state = inner.state.lock().await;
    match state.peers.get(&peer_id) {
        Some(handle) if handle.gen == gen => {}
        _ => return,
    }
    if let Some(handle) = state.peers.remove(&peer_id) {
        if let Some(abort) = handle.read_abort {
            abort.abort();
        }
    }
    if !state.registry.disconnect(peer_id) {
        return;
    }
    let name = state
        .registry
        .device(peer_id)
        .map(|d| d.name.clone())
        .unwrap_or_else(|| peer_id.to_string());
    let last = state.registry.connected_count() == 0;
    let client_role = matches!(
        state.session.as_ref().map(|s| s.role),
        Some(bluwave_core::Role::Client)
    );
    if last {
        if let Some(sess) = state.session.as_mut() {
            sess.active = false;
        }
        if client_role {
            // The only link a client has is the host; losing it ends the
            // session entirely.
            state.session = None;
            state.crypto.clear_keys();
        }
    }
    inner.publish_devices(&state);
    // Watch publishes stay under the lock so a concurrent registration
    // cannot interleave its own `connected = true` between them.
    if last {
        inner.watches.connected_tx.send_replace(false);
        if client_role {
            inner.watches.role_tx.send_replace(None);
        }
    }
    inner.append_system(format!("{name} left the chat"));
    drop(state);
    tracing::info!(peer = %peer_id, "peer disconnected");
}

/// Read exactly one length-prefixed frame (handshake phase).
async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, EngineError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > bluwave_core::MAX_FRAME_LEN {
        return Err(EngineError::HandshakeRejected("oversized frame".to_string()));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<(), EngineError> {
    let frame = encode_frame(body).map_err(EngineError::invalid_data)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}
