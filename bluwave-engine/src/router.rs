//! Relay fan-out policy: local sends broadcast to everyone; a host forwards
//! a peer's ciphertext unchanged to every other peer; a client only consumes.

use std::sync::Arc;

use bluwave_core::{encode_frame, ChatMessage, DeviceId, Role, WirePayload};

use crate::connection;
use crate::engine::Inner;
use crate::errors::EngineError;

/// Build, log and broadcast a locally typed message. With no peers connected
/// the append is the whole effect.
pub(crate) async fn send_local(inner: &Arc<Inner>, text: &str) -> Result<(), EngineError> {
    let state = inner.state.lock().await;
    if state.session.is_none() {
        return Err(EngineError::NotInSession);
    }
    let msg = ChatMessage::local(
        text.to_string(),
        inner.device_id,
        inner.config.display_name.clone(),
    );
    let payload = WirePayload::from_message(&msg, inner.device_id);
    inner.append_message(msg);
    if state.registry.connected_count() == 0 {
        return Ok(());
    }
    let bytes = payload.to_bytes().map_err(EngineError::invalid_data)?;
    let envelope = state.crypto.encrypt(&bytes)?;
    let frame = encode_frame(&envelope).map_err(EngineError::invalid_data)?;
    connection::broadcast(&state, None, &frame);
    Ok(())
}

/// Handle one complete frame from a peer. Undecryptable or malformed frames
/// are dropped and logged; they never terminate the read loop. A host
/// re-transmits the sender's envelope as-is, preserving the original
/// ciphertext end to end.
pub(crate) async fn on_frame_from_peer(inner: &Arc<Inner>, from: DeviceId, envelope: &[u8]) {
    let state = inner.state.lock().await;
    let plaintext = match state.crypto.decrypt(envelope) {
        Ok(p) => p,
        Err(err) => {
            tracing::warn!(peer = %from, error = %err, "dropping undecryptable frame");
            return;
        }
    };
    let payload = match WirePayload::from_bytes(&plaintext) {
        Ok(p) => p,
        Err(err) => {
            tracing::warn!(peer = %from, error = %err, "dropping malformed payload");
            return;
        }
    };
    let is_host = matches!(state.session.as_ref().map(|s| s.role), Some(Role::Host));
    inner.append_message(ChatMessage::remote(payload));
    if is_host {
        match encode_frame(envelope) {
            Ok(frame) => connection::broadcast(&state, Some(from), &frame),
            Err(err) => tracing::warn!(peer = %from, error = %err, "relay frame too large"),
        }
    }
}
