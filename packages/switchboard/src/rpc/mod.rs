//! JSON-RPC 2.0: frame codec, request correlator, handler registry, and
//! the dispatch pipeline shared by every transport.

pub mod correlator;
pub mod dispatch;
pub mod frame;
pub mod registry;

pub use correlator::{Correlator, PendingResponse, RequestError};
pub use dispatch::{dispatch, DispatchTarget, ReplySink, CLIENT_DISCONNECTED};
pub use frame::{
    format_error, format_notify, format_request, format_result, parse_bytes, parse_value,
    ErrorCode, ErrorObject, Frame, FrameError,
};
pub use registry::{HandlerContext, HandlerEntry, Outcome, Registry, RegistryError};
