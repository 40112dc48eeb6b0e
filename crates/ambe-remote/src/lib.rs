//! Remote access to a shared AMBE chip.
//!
//! A server owns the chip and its multi-queue scheduler; clients connect
//! over TCP and get one chip channel each. Because the server interleaves
//! requests from several clients, responses are correlated by a 32-bit tag
//! carried on every frame rather than by order — the client side is a
//! [`TaggingDevice`](ambe_device::TaggingDevice) driven by a FIFO scheduler.
//!
//! Tag 0 is reserved for session control (hello, busy, ping/pong) encoded
//! as JSON; all other tags carry raw packet bytes.

pub mod client;
pub mod error;
pub mod server;
pub mod session;
pub mod wire;

pub use client::RemoteDevice;
pub use error::{RemoteError, Result};
pub use server::{serve, SharedChip};
pub use session::SessionMessage;
pub use wire::{decode_frame, encode_frame, read_frame, write_frame, TaggedFrame, CONTROL_TAG};
