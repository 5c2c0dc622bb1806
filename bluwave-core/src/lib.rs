//! BluWave chat protocol core.
//! No I/O here: crypto, framing, wire messages and device bookkeeping only;
//! the engine crate owns sockets and tasks.

pub mod crypto;
pub mod device;
pub mod message;
pub mod protocol;
pub mod wire;

pub use crypto::{derive_group_key, CryptoError, CryptoSession, DeviceId, Keypair, PublicKey};
pub use device::{Device, DeviceRegistry, Role, Session, MAX_CONNECTIONS};
pub use message::{ChatMessage, MessageKind, WirePayload};
pub use protocol::{Announce, Hello, PROTOCOL_VERSION, SERVICE_NAME, SERVICE_UUID};
pub use wire::{encode_frame, FrameBuffer, FrameError, MAX_FRAME_LEN};
