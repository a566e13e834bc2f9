//! Server half of the strand transport: the row framer (encoder side of
//! the wire contract) and the streaming response writer.

pub mod framer;
pub mod response;

pub use framer::{FrameError, RowFramer};
pub use response::{ResponseHandle, ResponseHead, ResponseStream, WriteError};
