//! LED controller protocol: wire formats and the UDP transmitter

pub mod transmitter;
pub mod wire;

pub use transmitter::{SendOutcome, TransmitError, TransmitStats, Transmitter};
pub use wire::{decode_into, DatagramInfo, Encoder, WireError, MAX_PAYLOAD};
