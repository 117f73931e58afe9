use crate::regs::RegisterFile;
use std::io::Write;

/// Per-cycle reporting sink. Fed once per simulated clock with the cycle
/// number, the architectural registers, and the memory words stored that
/// cycle (empty for the bypassed variant, which does not report deltas).
pub trait Tracer {
    fn cycle(&mut self, cycle: u64, regs: &RegisterFile, mem_delta: &[(u32, i32)]);
}

/// Discards the trace. Used by tests and benches.
#[derive(Debug, Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn cycle(&mut self, _cycle: u64, _regs: &RegisterFile, _mem_delta: &[(u32, i32)]) {}
}

/// Textual dump: one line of 32 register values per cycle, followed by the
/// store-delta count and one `address value` line per stored word.
pub struct TextTracer<W: Write> {
    out: W,
    show_delta: bool,
}

impl<W: Write> TextTracer<W> {
    pub fn new(out: W, show_delta: bool) -> Self {
        Self { out, show_delta }
    }
}

impl<W: Write> Tracer for TextTracer<W> {
    fn cycle(&mut self, cycle: u64, regs: &RegisterFile, mem_delta: &[(u32, i32)]) {
        let _ = writeln!(self.out, "cycle {cycle}: {regs}");
        if self.show_delta {
            let _ = writeln!(self.out, "{}", mem_delta.len());
            for (addr, value) in mem_delta {
                let _ = writeln!(self.out, "{addr} {value}");
            }
        }
    }
}
