//! Compilation error types.

/// Error type for the compiler core.
///
/// Everything here is fatal: the pipeline stops at the first failure and the
/// driver decides whether to print and exit or move on to another module.
/// User-facing parse errors never reach this type; they belong to the front
/// end.
#[derive(Debug)]
pub enum CompileError {
    /// A configuration the pipeline cannot honor (detected at pass entry).
    Unsupported(String),
    /// An inter-pass invariant audit failed. Always a compiler bug.
    Verify(String),
    /// A pass-internal invariant breach surfaced as an error.
    Logic(String),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Unsupported(s) => write!(f, "unsupported configuration: {}", s),
            CompileError::Verify(s) => write!(f, "verification failure: {}", s),
            CompileError::Logic(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<String> for CompileError {
    fn from(s: String) -> Self {
        CompileError::Logic(s)
    }
}
