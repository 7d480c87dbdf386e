// Error model shared by the tokenizer, mapper, sorter, and star join.
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Usage,
    NotFound,
    Permission,
    Format,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    path: Option<PathBuf>,
    line: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            path: None,
            line: None,
            source: None,
        }
    }

    /// Classifies an I/O failure; missing and unreadable files keep their own kinds.
    pub fn io(err: io::Error, message: impl Into<String>) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            _ => ErrorKind::Io,
        };
        Self::new(kind).with_message(message).with_source(err)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn line(&self) -> Option<u64> {
        self.line
    }

    /// True for the IOFailure family (missing, unreadable, unwritable).
    pub fn is_io(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Io | ErrorKind::NotFound | ErrorKind::Permission
        )
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_line(mut self, line: u64) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(line) = self.line {
            write!(f, " (line: {line})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};
    use std::error::Error as StdError;
    use std::io;

    #[test]
    fn io_errors_are_classified_by_cause() {
        let cases = [
            (io::ErrorKind::NotFound, ErrorKind::NotFound),
            (io::ErrorKind::PermissionDenied, ErrorKind::Permission),
            (io::ErrorKind::UnexpectedEof, ErrorKind::Io),
        ];

        for (cause, kind) in cases {
            let err = Error::io(io::Error::from(cause), "read failed");
            assert_eq!(err.kind(), kind);
            assert!(err.is_io());
            assert!(err.source().is_some());
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::Format)
            .with_message("unterminated quoted field")
            .with_path("/tmp/core.txt")
            .with_line(7);
        assert!(!err.is_io());
        assert_eq!(
            err.to_string(),
            "Format: unterminated quoted field (path: /tmp/core.txt) (line: 7)"
        );
    }
}
