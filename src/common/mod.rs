//! Core types shared across the engine: addresses, flow metadata,
//! flow context, and the boxed stream alias.

mod address;
mod flow;
mod metadata;

pub use address::Address;
pub use flow::{FlowContext, ShutdownHandle, ShutdownSignal};
pub use metadata::{FlowMetadata, Network};

use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe async duplex stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed duplex stream handed between inbounds, handlers and the router
pub type Stream = Box<dyn AsyncStream>;
