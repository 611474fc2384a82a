//! Client library for backends that register routes with a Portal server:
//! dials the RPC endpoint, performs the initial `Register`, and (optionally)
//! runs a background renewal loop that keeps the lease alive until
//! cancelled. See `SPEC_FULL.md` §4.5.

mod csr;
mod error;
mod renewal;
mod transport;

pub use csr::{CertResolver, ClientIdentity};
pub use error::ClientError;
pub use renewal::{PortalClient, RenewalHandle};

pub use portal_core::rpc::pb;
