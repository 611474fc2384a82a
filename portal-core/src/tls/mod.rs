mod acceptor;
mod ca;
mod setup;
mod trust;

pub use acceptor::{build_rustls, load_cert_chain_and_key};
pub use ca::CertAuthority;
pub use setup::{setup_tls_with_hot_reload, TlsSetup};
pub use trust::{load_pem_bundle, RootCaStore};
