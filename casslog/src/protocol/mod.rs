//! Logger wire protocol.

pub mod engine;
pub mod opcode;
pub mod resume;

// Re-export common types
pub use engine::{EngineConfig, FileDescriptor, ProtocolEngine};
pub use opcode::{LISTING_SENTINEL, Opcode, SCALAR_SENTINEL};
pub use resume::ResumeFrame;
