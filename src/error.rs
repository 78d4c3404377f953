use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("URI error: {0}")]
    Uri(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Response size limit exceeded ({0} bytes)")]
    SizeLimit(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ProxyError::Upstream("connection refused".into()).to_string(),
            "Upstream error: connection refused"
        );
        assert_eq!(
            ProxyError::SizeLimit(10 << 20).to_string(),
            "Response size limit exceeded (10485760 bytes)"
        );
    }

    #[test]
    fn test_url_parse_error_converts() {
        let err: ProxyError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, ProxyError::Url(_)));
    }
}
