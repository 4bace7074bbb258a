pub mod ca;
pub mod envelope;
pub mod error;
pub mod scep;
pub mod token;

pub use ca::{CertificateAuthority, IssuedCert};
pub use error::PkiError;
pub use scep::ScepServer;
pub use token::opaque_token;
