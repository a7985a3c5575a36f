pub mod codec;
pub mod raw_message;

pub use codec::FrameCodec;
pub use raw_message::{RawMessage, SignatureBlock};
