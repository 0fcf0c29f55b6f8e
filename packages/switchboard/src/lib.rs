// Switchboard - JSON-RPC service toolkit
//
// A family of network service utilities built on one cooperative
// concurrency core: an abort-propagating scheduler tree, a bounded
// concurrency gate, and a JSON-RPC request correlator. The HTTP, duplex
// socket, and multi-node bus transports all feed the same dispatch
// pipeline.

pub mod config;
pub mod kernel;
pub mod rpc;
pub mod transport;

pub use config::Config;
