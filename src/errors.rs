/// Represent errors of the attack pipeline and the underlying NFC session.
///
/// `TagLost` doubles as "the tag did not answer": a silent tag and a tag
/// that left the field are indistinguishable on the reader side.
#[derive(Debug)]
pub enum NfcError {
    TagLost,

    Protocol(&'static str),

    Checksum(&'static str),

    InvalidNonce,

    AttackFailed,

    Precondition(String),

    Device(nfc1::Error),

    Io(std::io::Error),
}

impl std::fmt::Display for NfcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NfcError::TagLost => write!(f, "Tag moved out."),
            NfcError::Protocol(what) => write!(f, "Protocol violation: {}.", what),
            NfcError::Checksum(what) => write!(f, "CRC check of the returned {} failed.", what),
            NfcError::InvalidNonce => {
                write!(f, "Captured nonces are not related by the tag PRNG.")
            }
            NfcError::AttackFailed => write!(f, "No valid key found."),
            NfcError::Precondition(what) => write!(f, "{}", what),
            NfcError::Device(error) => write!(f, "NFC device error: {}.", error),
            NfcError::Io(error) => write!(f, "IO error: {}.", error),
        }
    }
}

/// Helper for `NfcError` result
pub type NfcResult<T> = Result<T, NfcError>;

impl From<nfc1::Error> for NfcError {
    fn from(error: nfc1::Error) -> Self {
        match error {
            // The only transport error the session logic interprets: the tag
            // is absent or abandoned the handshake.
            nfc1::Error::RfTransmissionError => NfcError::TagLost,
            other => NfcError::Device(other),
        }
    }
}

impl From<std::io::Error> for NfcError {
    fn from(error: std::io::Error) -> Self {
        NfcError::Io(error)
    }
}
