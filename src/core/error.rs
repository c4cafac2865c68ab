use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    SchemaLocked,
    WrongDocId,
    TypeMismatch,
    UnsupportedOperation,
    InvalidArgument,
    Io,
    Parse,
    CorruptData,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    /// Lookup miss on a named resource (`what` is "table", "field", "doc", ...).
    pub fn not_found(what: &str, name: &str) -> Self {
        Error::new(ErrorKind::NotFound, format!("{} '{}' not found", what, name))
    }

    pub fn already_exists(what: &str, name: &str) -> Self {
        Error::new(ErrorKind::AlreadyExists, format!("{} '{}' already exists", what, name))
    }

    pub fn wrong_doc_id(expected: u32, got: u32) -> Self {
        Error::new(
            ErrorKind::WrongDocId,
            format!("expected doc id {}, got {}", expected, got),
        )
    }

    pub fn schema_locked(partition: &str) -> Self {
        Error::new(
            ErrorKind::SchemaLocked,
            format!("schema of partition '{}' is locked", partition),
        )
    }

    pub fn type_mismatch(field: &str, detail: impl fmt::Display) -> Self {
        Error::new(ErrorKind::TypeMismatch, format!("field '{}': {}", field, detail))
    }

    pub fn unsupported(detail: impl Into<String>) -> Self {
        Error::new(ErrorKind::UnsupportedOperation, detail.into())
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, detail.into())
    }

    pub fn corrupt(detail: impl Into<String>) -> Self {
        Error::new(ErrorKind::CorruptData, detail.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, detail.into())
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: err.to_string(),
        }
    }
}

impl From<fst::Error> for Error {
    fn from(err: fst::Error) -> Self {
        Error {
            kind: ErrorKind::Internal,
            context: format!("FST error: {}", err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: format!("JSON error: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
