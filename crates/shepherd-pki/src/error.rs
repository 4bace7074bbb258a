use thiserror::Error;

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("PEM error: {0}")]
    Pem(String),

    #[error("certificate parse error: {0}")]
    Parse(String),

    #[error("certificate issuance failed: {0}")]
    Issue(String),

    #[error("invalid SCEP challenge")]
    BadChallenge,

    #[error("envelope error: {0}")]
    Envelope(String),
}
