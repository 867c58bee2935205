//! Bootloader wire protocol.
//!
//! - [`frame`]: frame layout, command codes and response assembly
//! - [`engine`]: one-request-one-response exchange over a [`crate::Port`]

pub mod engine;
pub mod frame;

pub use {
    engine::{EngineConfig, ProtocolEngine},
    frame::{Command, Frame, FrameAssembler, build_frame, is_echo_of},
};
