//! JSON-RPC 2.0 interface to the runtime
//!
//! Runtime failures keep their kind in the error code (`-32001` .. `-32005`);
//! protocol failures use the standard JSON-RPC codes.

mod dispatcher;
mod message;
mod transport;

pub use dispatcher::{
    RpcDispatcher, COMPLETE_NOTIFICATION, DOWNLOAD_NOTIFICATION, TOKEN_NOTIFICATION,
};
pub use message::{
    parse_request, RpcError, RpcId, RpcMessage, RpcNotification, RpcRequest, RpcResponse,
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION, METHOD_NOT_FOUND,
    PARSE_ERROR,
};
pub use transport::{serve, serve_stdio};
