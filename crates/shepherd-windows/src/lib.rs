pub mod endpoints;
pub mod error;
pub mod soap;
pub mod syncml;

pub use endpoints::{process_discovery, process_enrollment, process_policy};
pub use error::WindowsError;
pub use syncml::process_management;

/// Content type for the MS-MDE2 SOAP endpoints.
pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// Content type for SyncML management sessions.
pub const SYNCML_CONTENT_TYPE: &str = "application/vnd.syncml.dm+xml";
