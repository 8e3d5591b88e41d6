//! Wire bridge between the client and a driver subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response)
//! - **codec**: newline-delimited JSON codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
