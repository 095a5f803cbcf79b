//! The wire protocol spoken between the stafford agent and server. The HTTP
//! transport carries the same JSON documents; this module covers the native
//! TCP framing and the request/response vocabulary.

pub mod wire;
