//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     certificates[] → tls.rs (load PEM, index by name) → CertificateStore
//!     CertificateStore + listener.tls (default) → SniResolver → axum-server
//!
//! Handshake:
//!     SNI name → certificate_for(name) → presented chain, else the default
//!
//! Reconciliation:
//!     TLS routers → CertificateResolver::certificate_for(host) → diagnostics
//! ```
//!
//! # Design Decisions
//! - Certificate content never influences routing
//! - TLS is optional and handled transparently by the listener

pub mod tls;

pub use tls::{Certificate, CertificateResolver, CertificateStore, SniResolver, TlsError};
