use thiserror::Error;

/// Fatal simulation errors, detected at the point an instruction attempts to
/// execute (or while the program is loaded). None of these are recoverable:
/// the run halts and the offending instruction is reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("invalid register `{0}`")]
    InvalidRegister(String),
    #[error("label `{0}` not defined or defined too many times")]
    InvalidLabel(String),
    #[error("unaligned or invalid memory address {0}")]
    InvalidAddress(i64),
    #[error("syntax error in `{0}`")]
    Syntax(String),
    #[error("program exceeds the instruction memory limit")]
    MemoryLimitExceeded,
}

impl SimError {
    /// Process exit code reported for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            SimError::InvalidRegister(_) => 1,
            SimError::InvalidLabel(_) => 2,
            SimError::InvalidAddress(_) => 3,
            SimError::Syntax(_) => 4,
            SimError::MemoryLimitExceeded => 5,
        }
    }
}

/// A [`SimError`] tied to the instruction that raised it mid-run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}\nerror encountered at:\n{text}")]
pub struct RunError {
    pub kind: SimError,
    /// Index of the offending instruction in the instruction table.
    pub pc: u32,
    /// Source text of the offending instruction.
    pub text: String,
}

/// A [`SimError`] raised while parsing, tied to a source line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub kind: SimError,
    pub line: usize,
}
