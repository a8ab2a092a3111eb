//! Binary RPC plumbing shared by the nodeflow coordinator and its workers:
//! frame codec, request correlation, dispatch table and Unix socket transport.

pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod frame;
pub mod rpc;
pub mod transport;

pub use connection::{DEFAULT_RPC_TIMEOUT, FrameSink, InlineSink, RpcConnection};
pub use dispatch::{DispatchTable, Params};
pub use frame::{Frame, FrameDecoder, FrameKind, ProtocolError};
pub use rpc::{Envelope, Fault, Method, PacketId, RpcRequest, RpcResponse, RpcResult, Scope, codes};
pub use transport::{RpcServer, TransportError, connect};
