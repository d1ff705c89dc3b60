//! AniDB UDP API: wire codec, datagram transport and the session handler

mod codec;
mod handler;
mod transport;

pub use codec::{mask_for_log, Command, ResponseClass, ReturnCode, UdpResponse};
pub use handler::{Credentials, UdpConnectionHandler, UdpHandlerConfig};
pub use transport::{SocketTransport, UdpTransport};
