use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("event line too long: {0} bytes (max 8388608)")]
    LineTooLong(usize),

    #[error("malformed event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_too_long_display() {
        let e = ProtocolError::LineTooLong(9_000_000);
        assert!(e.to_string().contains("9000000"));
    }

    #[test]
    fn invalid_field_display() {
        let e = ProtocolError::InvalidField {
            field: "content",
            reason: "no sealed copy for bob".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("content"));
        assert!(msg.contains("bob"));
    }

    #[test]
    fn from_json_error() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let proto_err: ProtocolError = json_err.into();
        assert!(proto_err.to_string().starts_with("malformed event"));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken");
        let proto_err: ProtocolError = io_err.into();
        assert!(proto_err.to_string().contains("broken"));
    }
}
