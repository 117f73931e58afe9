use crate::cpu::{Cpu, ExecResult};
use crate::error::RunError;
use crate::mem::DataMemory;
use crate::program::Program;
use crate::regs::RegisterFile;

pub mod cpu;
pub mod deep;
pub mod error;
pub mod five_stage;
pub mod hazard;
pub mod inst;
pub mod mem;
pub mod predictor;
pub mod program;
pub mod regs;
pub mod trace;

/// Parse `asm/<name>.asm` and run it to completion on the given engine.
pub fn parse_and_exec<C: Cpu>(
    name: &str,
    regs: RegisterFile,
    mem: DataMemory,
) -> Result<ExecResult, RunError> {
    let contents =
        std::fs::read_to_string(format!("asm/{name}.asm")).expect("failed to open file");
    let prog = contents
        .parse::<Program>()
        .expect("failed to parse assembly");
    C::new(prog, regs, mem).exec_all()
}
