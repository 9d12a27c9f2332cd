//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, request ID, body limit, in-flight bound)
//!     → SnapshotHandle::load (one snapshot for the whole request)
//!     → dispatcher.rs (route match → middleware chain → pool selection)
//!     → client.rs (forward to the target, retry elsewhere when allowed)
//!     → response.rs (error classes for failed dispatches)
//!     → Send to client
//! ```

pub mod client;
pub mod dispatcher;
pub mod request;
pub mod response;
pub mod server;

pub use client::{build_client, HttpClient};
pub use dispatcher::{DispatchPolicy, Dispatcher};
pub use request::{MakeRequestUuid, X_REQUEST_ID};
pub use response::DispatchError;
pub use server::{AppState, HttpServer, ServerError};
