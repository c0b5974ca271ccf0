use crate::refinement::errors::RefineError;

pub type ReductionResult<T> = Result<T, ReductionError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReductionError {
    /// A group needs at least one member.
    EmptyGroup,

    /// Members contributed vectors of different lengths.
    LengthMismatch {
        expected: usize,
        found: usize,
    },

    /// Members contributed values of different types to one collective.
    TypeMismatch,

    /// Another member panicked while holding the group lock.
    Poisoned,
}

impl std::error::Error for ReductionError {}

impl std::fmt::Display for ReductionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReductionError::EmptyGroup => write!(f, "Reduction group has no members"),
            ReductionError::LengthMismatch { expected, found } => {
                write!(f, "Reduction length mismatch: expected {expected}, found {found}")
            }
            ReductionError::TypeMismatch => {
                write!(f, "Group members contributed different value types")
            }
            ReductionError::Poisoned => write!(f, "Reduction group lock poisoned"),
        }
    }
}

impl From<ReductionError> for RefineError {
    fn from(err: ReductionError) -> Self {
        RefineError::Reduction { text: err.to_string() }
    }
}
