//! # Ports
//!
//! - `outbound` - what the client requires from its environment (a secure
//!   datagram transport and a way to dial one)
//! - `inbound` - what the client calls back into (notification handlers)

pub mod inbound;
pub mod outbound;

pub use inbound::{HandlerError, NotificationHandler};
pub use outbound::{DatagramTransport, SessionDialer};
