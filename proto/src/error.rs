#[derive(Debug)]
pub enum DecodeError {
    InvalidBase64(base64::DecodeError),
    InvalidLength,
    InvalidFormat,
    /// The encoded bytes were produced at a different fidelity than the caller asked for
    FidelityMismatch { expected: u8, found: u8 },
    Bincode(bincode::Error),
    Other(anyhow::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidBase64(e) => write!(f, "Invalid Base64: {}", e),
            DecodeError::InvalidLength => write!(f, "Invalid Length"),
            DecodeError::InvalidFormat => write!(f, "Invalid Format"),
            DecodeError::FidelityMismatch { expected, found } => {
                write!(f, "Fidelity mismatch: expected tier {}, found tier {}", expected, found)
            }
            DecodeError::Bincode(e) => write!(f, "Bincode: {}", e),
            DecodeError::Other(e) => write!(f, "Other: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<base64::DecodeError> for DecodeError {
    fn from(e: base64::DecodeError) -> Self { DecodeError::InvalidBase64(e) }
}

impl From<bincode::Error> for DecodeError {
    fn from(e: bincode::Error) -> Self { DecodeError::Bincode(e) }
}

impl From<anyhow::Error> for DecodeError {
    fn from(e: anyhow::Error) -> Self { DecodeError::Other(e) }
}
