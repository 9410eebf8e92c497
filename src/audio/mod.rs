//! # Audio Pipeline Module
//!
//! Real-time audio for the voice session: microphone capture, sample
//! encoding for transport, and scheduled playback of response audio.
//!
//! ## Key Components:
//! - **Codec**: f32 PCM [-1, 1] <-> little-endian 16-bit PCM <-> base64
//! - **Capture**: 16kHz mono microphone input, fixed 4096-sample framing
//! - **Playback**: 24kHz output clock, gapless in-order scheduling,
//!   fade-out interruption
//!
//! ## Audio Format Requirements:
//! - **Outbound**: 16kHz, 16-bit PCM, mono, little-endian
//! - **Inbound**: 24kHz, 16-bit PCM, mono, little-endian

pub mod capture; // Microphone acquisition and framing
pub mod codec; // PCM <-> transport encoding
pub mod playback; // Output clock, live set, interruption
