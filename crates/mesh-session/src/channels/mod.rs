//! Control data channel messages

pub mod control;

pub use control::ControlMessage;
