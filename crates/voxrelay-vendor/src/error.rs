use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    /// Credentials were rejected or the signed URL could not be built.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No connection became available within the acquisition timeout.
    #[error("{pool} pool exhausted after waiting {}ms", waited.as_millis())]
    PoolExhausted { pool: String, waited: Duration },

    /// The vendor socket could not be opened.
    #[error("connect error: {0}")]
    Connect(String),

    /// The vendor answered with a non-zero error code.
    #[error("vendor error {code}: {message}")]
    VendorProtocol { code: i64, message: String },

    /// The socket failed or closed while in use.
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound vendor data could not be decoded.
    #[error("malformed vendor message: {0}")]
    Malformed(String),

    /// The reply generator failed.
    #[error("reply error: {0}")]
    Reply(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
