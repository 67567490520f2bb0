//! Client/server network reconciliation for the skerry engine.
//!
//! Sits above the island coordinator. The [`NetworkServer`] observes world
//! changes and emits packets per client; the [`NetworkClient`] applies
//! incoming packets either directly — snapping islands and recording
//! discontinuities — or by launching a speculative extrapolation that
//! replays buffered inputs from the snapshot timestamp to the present.
//!
//! Transport is out of scope: both sides emit packets into an outbound list
//! and accept packets through `receive`, so any datagram layer can carry
//! them. `bincode` is the reference codec.

pub mod client;
pub mod clock;
pub mod error;
pub mod extrapolation;
pub mod history;
pub mod packet;
pub mod server;
pub mod settings;

pub use client::NetworkClient;
pub use clock::{ClockSync, CLOCK_SYNC_SAMPLES};
pub use error::NetError;
pub use extrapolation::{run_extrapolation, ExtrapolationInput, ExtrapolationJob};
pub use history::{InputFrame, InputHistory};
pub use packet::{Packet, PoolSnapshot};
pub use server::{is_fully_owned_by_client, NetworkServer, RemoteClient};
pub use settings::{ClientSettings, ServerSettings};
