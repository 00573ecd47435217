//! Connect-RPC plumbing for envd.

pub mod envelope;
pub mod events;

pub use envelope::{encode, try_decode_one, Decoded, Envelope, EnvelopeDecoder, Frame};
pub use events::ProcessEvent;
