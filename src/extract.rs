//! PDF text extraction service.
//!
//! Connectors and the reconcile pass supply bytes; this module returns plain
//! UTF-8 text. The extraction mechanics themselves live in `pdf-extract`;
//! this boundary only consumes its output.

/// Extraction error: the buffer was not a readable PDF. The caller skips the
/// document's field pass and moves on; nothing panics.
#[derive(Debug)]
pub enum TextError {
    Pdf(String),
}

impl std::fmt::Display for TextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
        }
    }
}

impl std::error::Error for TextError {}

/// Extract all text from an in-memory PDF.
pub fn pdf_text(bytes: &[u8]) -> Result<String, TextError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| TextError::Pdf(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_pdf_returns_error() {
        let err = pdf_text(b"not a pdf").unwrap_err();
        assert!(matches!(err, TextError::Pdf(_)));
    }
}
