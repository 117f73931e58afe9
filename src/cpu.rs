use crate::error::RunError;
use crate::mem::DataMemory;
use crate::predictor::BranchPredictor;
use crate::program::Program;
use crate::regs::RegisterFile;
use crate::trace::Tracer;

/// End state of a completed run, with the reporting data every variant
/// must expose.
#[derive(Debug)]
pub struct ExecResult {
    pub regs: RegisterFile,
    pub mem: DataMemory,
    pub cycles_taken: u64,
    /// How many times each instruction-table entry retired. Squashed
    /// instructions are never counted.
    pub exec_counts: Vec<u64>,
}

/// Common contract of the pipeline variants.
pub trait Cpu {
    fn new(prog: Program, regs: RegisterFile, mem: DataMemory) -> Self
    where
        Self: Sized;

    /// Replace the default branch predictor.
    fn with_predictor(self, predictor: Box<dyn BranchPredictor>) -> Self
    where
        Self: Sized;

    /// Install a per-cycle reporting sink.
    fn with_tracer(self, tracer: Box<dyn Tracer>) -> Self
    where
        Self: Sized;

    /// Run to completion.
    fn exec_all(self) -> Result<ExecResult, RunError>;
}
