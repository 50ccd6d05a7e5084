//! HTTP RPC surface for the pinnet client.
//!
//! Exposes the seven content operations (`exists`, `id`, `upload`,
//! `upload_string`, `dag_upload`, `dag_upload_string`, `remove`) and the
//! two filesystem operations (`list`, `list_ext`) to external callers,
//! plus a health endpoint.

pub mod server;

pub use server::{build_router, start_server, AppState};
