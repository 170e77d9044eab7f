use serde::{Deserialize, Serialize};

pub type Error = UbifvmError;
pub type Result<T> = std::result::Result<T, Error>;

/// Builds a `UbifvmError` variant with the current file and line attached.
///
/// ```ignore
/// return Err(fvm_error!(NotFound { description: "no such partition".to_string() }));
/// ```
#[macro_export]
macro_rules! fvm_error {
    ($variant:ident { $($fields:tt)* }) => {{
        $crate::UbifvmError::$variant {
            meta: $crate::ErrorMeta::new($crate::ErrorLocation::new(file!(), line!())),
            $($fields)*
        }
    }};
    ($variant:ident) => {{
        $crate::UbifvmError::$variant {
            meta: $crate::ErrorMeta::new($crate::ErrorLocation::new(file!(), line!())),
        }
    }};
}

#[derive(Debug, Clone, Copy)]
pub struct ErrorLocation {
    file: &'static str,
    line: u32,
}

impl ErrorLocation {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }
}

impl Default for ErrorLocation {
    fn default() -> Self {
        Self {
            file: "<unknown>",
            line: 0,
        }
    }
}

impl std::fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone)]
pub struct ErrorMeta {
    pub location: ErrorLocation,
    pub contexts: Vec<(String, ErrorLocation)>,
}

impl ErrorMeta {
    pub fn new(location: ErrorLocation) -> Self {
        Self {
            location,
            contexts: Vec::new(),
        }
    }
}

impl std::fmt::Display for ErrorMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            return write!(f, "(at {})", self.location);
        }
        if self.contexts.is_empty() {
            return Ok(());
        }
        let mut iter = self.contexts.iter().rev();
        if let Some(context) = iter.next() {
            write!(f, "{} (at {})", context.0, context.1)?;
        }
        for context in iter {
            write!(f, "\n  - caused by: {} (at {})", context.0, context.1)?;
        }
        write!(f, "\n  - caused by: ")
    }
}

/// Status codes reported to clients of the volume manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    NoSpace,
    OutOfRange,
    BadState,
    AlreadyExists,
    NotFound,
    AccessDenied,
    Io,
    IoDataIntegrity,
    InvalidArgs,
    WrongType,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NoSpace => "NO_SPACE",
            Status::OutOfRange => "OUT_OF_RANGE",
            Status::BadState => "BAD_STATE",
            Status::AlreadyExists => "ALREADY_EXISTS",
            Status::NotFound => "NOT_FOUND",
            Status::AccessDenied => "ACCESS_DENIED",
            Status::Io => "IO",
            Status::IoDataIntegrity => "IO_DATA_INTEGRITY",
            Status::InvalidArgs => "INVALID_ARGS",
            Status::WrongType => "WRONG_TYPE",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! fvm_error_variants {
    ($( $variant:ident { $( $(#[$field_attr:meta])* $field:ident : $ty:ty ),* $(,)? } => $message:expr ),* $(,)?) => {
        #[derive(thiserror::Error, Debug)]
        pub enum UbifvmError {
            $(
                #[error($message)]
                $variant {
                    $( $(#[$field_attr])* $field: $ty, )*
                },
            )*
        }

        impl UbifvmError {
            fn contexts_mut(&mut self) -> &mut Vec<(String, ErrorLocation)> {
                match self {
                    $( UbifvmError::$variant { meta, .. } => &mut meta.contexts, )*
                }
            }
        }
    };
}

fvm_error_variants! {
    ThreadCreation {
        #[source]
        source: std::io::Error,
        meta: ErrorMeta,
    } => "{meta}Thread creation error: {source} {meta:#}",
    IoError {
        #[source]
        source: std::io::Error,
        meta: ErrorMeta,
    } => "{meta}I/O error: {source} {meta:#}",
    InvalidParameter {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Invalid parameter error: {description} {meta:#}",
    MetadataCorrupt {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Metadata corrupt: {description} {meta:#}",
    Incompatible {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Incompatible metadata: {description} {meta:#}",
    TooSmall {
        required: u64,
        available: u64,
        meta: ErrorMeta,
    } => "{meta}Device too small: {required} bytes required, {available} bytes available {meta:#}",
    NoSpace {
        description: String,
        meta: ErrorMeta,
    } => "{meta}No space: {description} {meta:#}",
    SliceOverlap {
        vslice: u64,
        meta: ErrorMeta,
    } => "{meta}Virtual slice {vslice} is already allocated {meta:#}",
    OutOfRange {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Out of range: {description} {meta:#}",
    NotAllocated {
        vslice: u64,
        meta: ErrorMeta,
    } => "{meta}Virtual slice {vslice} is not allocated {meta:#}",
    SizeLimit {
        limit: u64,
        requested: u64,
        meta: ErrorMeta,
    } => "{meta}Slice limit exceeded: {requested} slices requested, limit is {limit} {meta:#}",
    Bounds {
        required: u64,
        capacity: u64,
        meta: ErrorMeta,
    } => "{meta}Allocation table too small: {required} slices required, capacity is {capacity} {meta:#}",
    NotFound {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Not found: {description} {meta:#}",
    AlreadyExists {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Already exists: {description} {meta:#}",
    BadState {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Bad state: {description} {meta:#}",
    AccessDenied {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Access denied: {description} {meta:#}",
    RpcError {
        description: String,
        meta: ErrorMeta,
    } => "{meta}RPC error: {description} {meta:#}",
}

impl UbifvmError {
    /// Maps the error onto the status code reported to clients.
    pub fn status(&self) -> Status {
        match self {
            UbifvmError::MetadataCorrupt { .. } => Status::IoDataIntegrity,
            UbifvmError::Incompatible { .. } => Status::WrongType,
            UbifvmError::TooSmall { .. }
            | UbifvmError::NoSpace { .. }
            | UbifvmError::SizeLimit { .. } => Status::NoSpace,
            UbifvmError::OutOfRange { .. }
            | UbifvmError::NotAllocated { .. }
            | UbifvmError::Bounds { .. } => Status::OutOfRange,
            UbifvmError::NotFound { .. } => Status::NotFound,
            UbifvmError::AlreadyExists { .. } => Status::AlreadyExists,
            UbifvmError::BadState { .. } => Status::BadState,
            UbifvmError::AccessDenied { .. } => Status::AccessDenied,
            UbifvmError::IoError { .. }
            | UbifvmError::ThreadCreation { .. } => Status::Io,
            UbifvmError::InvalidParameter { .. }
            | UbifvmError::SliceOverlap { .. }
            | UbifvmError::RpcError { .. } => Status::InvalidArgs,
        }
    }

    #[track_caller]
    pub fn context(self, message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        self.context_at(message, location)
    }

    pub fn context_at(
        mut self,
        message: impl Into<String>,
        location: &'static std::panic::Location<'static>,
    ) -> Self {
        self.contexts_mut().push((
            message.into(),
            ErrorLocation::new(location.file(), location.line()),
        ));
        self
    }
}

impl From<std::io::Error> for UbifvmError {
    #[track_caller]
    fn from(source: std::io::Error) -> Self {
        let location = std::panic::Location::caller();
        UbifvmError::IoError {
            source,
            meta: ErrorMeta::new(ErrorLocation::new(location.file(), location.line())),
        }
    }
}

impl From<serde_json::Error> for UbifvmError {
    #[track_caller]
    fn from(source: serde_json::Error) -> Self {
        let location = std::panic::Location::caller();
        UbifvmError::RpcError {
            description: source.to_string(),
            meta: ErrorMeta::new(ErrorLocation::new(location.file(), location.line())),
        }
    }
}

/// Extension trait to add context to Results.
pub trait ResultExt<T> {
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<UbifvmError>,
{
    #[track_caller]
    fn context(self, message: impl Into<String>) -> Result<T> {
        let location = std::panic::Location::caller();
        self.map_err(|e| e.into().context_at(message, location))
    }
}
