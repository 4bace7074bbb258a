use thiserror::Error;

#[derive(Debug, Error)]
pub enum AbmError {
    /// ABM answered 403 T_C_NOT_SIGNED: an operator must accept the new
    /// terms before syncs can resume.
    #[error("Apple Business Manager terms and conditions are not signed")]
    TermsNotSigned,

    #[error("ABM session authentication failed")]
    Unauthorized,

    #[error("ABM returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("ABM transport error: {0}")]
    Transport(String),

    #[error("unexpected ABM response: {0}")]
    Decode(String),

    #[error("store error: {0}")]
    Store(#[from] shepherd_store::StoreError),
}

impl From<reqwest::Error> for AbmError {
    fn from(e: reqwest::Error) -> Self {
        AbmError::Transport(e.to_string())
    }
}
