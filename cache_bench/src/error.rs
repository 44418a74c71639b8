use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum BenchError {
    /// The benchmark arena could not be mapped.
    NoMem(nix::Error),
    /// Pinning a thread to a core failed.
    Affinity(nix::Error),
    Io(std::io::Error),
    /// Cache parameters that make the index arithmetic meaningless (zero sets, zero ways...).
    InvalidGeometry(String),
    /// Not enough lines in the arena satisfy the set constraints.
    PatternExhausted {
        wanted: usize,
        found: usize,
        limit_lines: usize,
    },
    InvalidStride(usize),
    WorkerPanicked,
    Parse { line: usize, message: String },
}

impl Display for BenchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchError::NoMem(e) => write!(f, "failed to map benchmark memory: {}", e),
            BenchError::Affinity(e) => write!(f, "failed to set cpu affinity: {}", e),
            BenchError::Io(e) => write!(f, "i/o error: {}", e),
            BenchError::InvalidGeometry(msg) => write!(f, "invalid cache geometry: {}", msg),
            BenchError::PatternExhausted {
                wanted,
                found,
                limit_lines,
            } => write!(
                f,
                "only {} of {} conflicting lines exist within the first {} lines, increase --mem-size",
                found, wanted, limit_lines
            ),
            BenchError::InvalidStride(stride) => write!(f, "invalid stride {}", stride),
            BenchError::WorkerPanicked => write!(f, "a measurement thread panicked"),
            BenchError::Parse { line, message } => write!(f, "line {}: {}", line, message),
        }
    }
}

impl std::error::Error for BenchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BenchError::NoMem(e) | BenchError::Affinity(e) => Some(e),
            BenchError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BenchError {
    fn from(e: std::io::Error) -> Self {
        BenchError::Io(e)
    }
}
