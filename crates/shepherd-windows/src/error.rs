use thiserror::Error;

#[derive(Debug, Error)]
pub enum WindowsError {
    /// Rendered to the client as a SOAP fault.
    #[error("{reason}")]
    Fault { code: &'static str, reason: String },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("device {0} is not MDM enrolled")]
    NotEnrolled(String),

    #[error("store error: {0}")]
    Store(#[from] shepherd_store::StoreError),

    #[error("PKI error: {0}")]
    Pki(#[from] shepherd_pki::PkiError),
}

impl WindowsError {
    pub fn fault(reason: impl Into<String>) -> Self {
        WindowsError::Fault { code: "s:Receiver", reason: reason.into() }
    }

    pub fn sender_fault(reason: impl Into<String>) -> Self {
        WindowsError::Fault { code: "s:Sender", reason: reason.into() }
    }
}

impl From<quick_xml::Error> for WindowsError {
    fn from(e: quick_xml::Error) -> Self {
        WindowsError::Xml(e.to_string())
    }
}
