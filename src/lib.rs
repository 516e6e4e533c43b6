//! A raw SMB1/CIFS client wire engine.
//!
//! The crate covers the transport-facing machinery of an SMB1 client:
//! building and framing packets, correlating replies by MID, fragmenting and
//! reassembling the chunked transaction families, and MD5-based packet
//! signing. Protocol policy above the wire (authentication, file semantics)
//! is left to the caller, who drives the engine through [`Connection`].

pub mod connection;
pub mod error;
pub mod packets;
pub mod request;
pub mod trans;

pub use connection::signing::SigningState;
pub use connection::transport::{TcpTransport, Transport};
pub use connection::{Connection, ConnectionConfig, OplockHandler};
pub use error::Error;
pub use packets::header::{Command, Status};
pub use packets::trans::TransFamily;
pub use request::{Request, RequestState, Session, Tree};
pub use trans::{TransReply, TransRequest};

pub type Result<T> = std::result::Result<T, crate::Error>;
