//! The 5-stage bypassed pipeline: IF, ID, EX, MEM, WB, one slot per stage.
//!
//! Each simulated clock evaluates the stages strictly backward (WB first,
//! IF last) so every stage sees the state its downstream neighbour left at
//! the end of the previous cycle; that ordering is what makes stalls ripple
//! backward one stage per cycle. Results are forwarded through a shadow
//! register bank, so a dependent instruction reads a value the cycle after
//! it is computed, well before the architectural commit in WB. The only
//! data-hazard bubble left is the load-use case: a load's lock is released
//! at the end of the cycle its value lands in the bypass bank, one cycle
//! too late for a consumer already waiting in EX.

use log::debug;

use crate::cpu::{Cpu, ExecResult};
use crate::error::{RunError, SimError};
use crate::hazard::HazardTable;
use crate::inst::{alu_result, branch_taken, decode, Decoded, Opcode, Reg};
use crate::mem::DataMemory;
use crate::predictor::{BranchPredictor, SaturatingPredictor};
use crate::program::Program;
use crate::regs::RegisterFile;
use crate::trace::{NullTracer, Tracer};

const IF: usize = 0;
const ID: usize = 1;
const EX: usize = 2;
const MEM: usize = 3;
const WB: usize = 4;
const STAGES: usize = 5;

/// Stage-specific scratch carried by a slot as the instruction advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scratch {
    None,
    /// ALU/ADDI result, or the value loaded from memory.
    Value(i32),
    /// Word index of a validated memory access.
    Addr(u32),
}

/// One occupied pipeline stage.
#[derive(Debug, Clone)]
struct Slot {
    /// Instruction-table index.
    pc: u32,
    op: Opcode,
    /// Direction the fetch stage guessed for a conditional branch.
    predicted: Option<bool>,
    /// Resolved operands, present once the slot has passed ID.
    decoded: Option<Decoded>,
    scratch: Scratch,
}

impl Slot {
    fn decoded(&self) -> &Decoded {
        self.decoded.as_ref().expect("instruction past decode")
    }
}

pub struct FiveStage {
    prog: Program,
    regs: RegisterFile,
    /// Shadow bank holding results before their architectural commit.
    bypass: RegisterFile,
    mem: DataMemory,
    hazards: HazardTable,
    predictor: Box<dyn BranchPredictor>,
    tracer: Box<dyn Tracer>,
    slots: [Option<Slot>; STAGES],
    pc: u32,
    /// Cleared while an unresolved jump drains the front of the pipe.
    fetch_enabled: bool,
    /// PC override raised by EX, applied after the stages and before fetch.
    redirect: Option<u32>,
    /// Load destination whose lock drops once the whole cycle has run.
    load_release: Option<Reg>,
    exec_counts: Vec<u64>,
    cycles: u64,
}

impl Cpu for FiveStage {
    fn new(prog: Program, regs: RegisterFile, mut mem: DataMemory) -> Self {
        mem.protect_code(prog.len());
        let exec_counts = vec![0; prog.insts.len()];

        Self {
            bypass: regs.clone(),
            regs,
            mem,
            hazards: HazardTable::new(),
            predictor: Box::new(SaturatingPredictor::new(0)),
            tracer: Box::new(NullTracer),
            slots: Default::default(),
            pc: 0,
            fetch_enabled: true,
            redirect: None,
            load_release: None,
            exec_counts,
            cycles: 0,
            prog,
        }
    }

    fn with_predictor(mut self, predictor: Box<dyn BranchPredictor>) -> Self {
        self.predictor = predictor;
        self
    }

    fn with_tracer(mut self, tracer: Box<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    fn exec_all(mut self) -> Result<ExecResult, RunError> {
        loop {
            self.step()?;

            let idle =
                self.slots.iter().all(Option::is_none) && self.pc >= self.prog.len();
            self.tracer.cycle(self.cycles, &self.regs, &[]);
            if idle {
                break;
            }

            self.cycles += 1;
            debug_assert!(self.cycles < 100_000_000, "pipeline deadlock or runaway program");
        }

        Ok(ExecResult {
            regs: self.regs,
            mem: self.mem,
            cycles_taken: self.cycles,
            exec_counts: self.exec_counts,
        })
    }
}

impl FiveStage {
    /// Advance every stage by one clock, oldest stage first.
    fn step(&mut self) -> Result<(), RunError> {
        self.writeback();
        self.memory();
        self.execute()?;
        self.decode_stage()?;
        self.fetch_advance();

        if let Some(reg) = self.load_release.take() {
            self.hazards.release(reg);
        }
        if let Some(target) = self.redirect.take() {
            self.pc = target;
        }
        self.fetch();
        Ok(())
    }

    /// WB: commit the bypassed result into the architectural register file.
    fn writeback(&mut self) {
        let Some(slot) = self.slots[WB].take() else {
            return;
        };

        if slot.op.writes_reg() {
            let Scratch::Value(value) = slot.scratch else {
                unreachable!("producer reached WB without a result");
            };
            let dst = slot.decoded().dst.expect("producer without destination");
            self.regs.set(dst, value);
        }
        self.exec_counts[slot.pc as usize] += 1;
    }

    /// MEM: loads land in the bypass bank, stores hit memory once their data
    /// register is lock-free, ALU results pass through into the bypass bank.
    fn memory(&mut self) {
        let Some(mut slot) = self.slots[MEM].take() else {
            return;
        };

        match slot.op {
            Opcode::Lw => {
                let Scratch::Addr(word) = slot.scratch else {
                    unreachable!("load reached MEM without an address");
                };
                let value = self.mem.read_word(word);
                let dst = slot.decoded().dst.expect("load without destination");
                self.bypass.set(dst, value);
                slot.scratch = Scratch::Value(value);
                // The lock drops only after EX has been evaluated this
                // cycle; a consumer already waiting there stalls one cycle.
                self.load_release = Some(dst);
                self.slots[WB] = Some(slot);
            }
            Opcode::Sw => {
                let src = slot.decoded().src1.expect("store without data register");
                if self.hazards.is_free(src) {
                    let Scratch::Addr(word) = slot.scratch else {
                        unreachable!("store reached MEM without an address");
                    };
                    self.mem.write_word(word, self.bypass.get(src));
                    self.slots[WB] = Some(slot);
                } else {
                    debug!("sw at {} deferred, data register still locked", slot.pc);
                    self.slots[MEM] = Some(slot);
                }
            }
            op if op.writes_reg() => {
                let Scratch::Value(value) = slot.scratch else {
                    unreachable!("ALU result missing in MEM");
                };
                let dst = slot.decoded().dst.expect("producer without destination");
                self.bypass.set(dst, value);
                self.hazards.release(dst);
                self.slots[WB] = Some(slot);
            }
            _ => {
                // Branches and jumps drain through.
                self.slots[WB] = Some(slot);
            }
        }
    }

    /// EX: stall until every source register is lock-free, then compute on
    /// bypassed values. Branches and jumps resolve here.
    fn execute(&mut self) -> Result<(), RunError> {
        let Some(mut slot) = self.slots[EX].take() else {
            return Ok(());
        };
        if self.slots[MEM].is_some() {
            // Structural stall: a deferred store still owns MEM.
            self.slots[EX] = Some(slot);
            return Ok(());
        }

        let d = slot.decoded().clone();
        match slot.op {
            op if op.is_alu() => {
                let (s1, s2) = (d.src1.expect("alu sources"), d.src2.expect("alu sources"));
                if self.hazards.is_free(s1) && self.hazards.is_free(s2) {
                    let value = alu_result(op, self.bypass.get(s1), self.bypass.get(s2));
                    self.acquire_dst(&d);
                    slot.scratch = Scratch::Value(value);
                    self.slots[MEM] = Some(slot);
                } else {
                    self.slots[EX] = Some(slot);
                }
            }
            Opcode::Addi => {
                let src = d.src1.expect("addi source");
                if self.hazards.is_free(src) {
                    let value = self.bypass.get(src).wrapping_add(d.imm);
                    self.acquire_dst(&d);
                    slot.scratch = Scratch::Value(value);
                    self.slots[MEM] = Some(slot);
                } else {
                    self.slots[EX] = Some(slot);
                }
            }
            Opcode::Lw | Opcode::Sw => {
                let m = d.mem.expect("memory operand");
                if m.base.map_or(true, |b| self.hazards.is_free(b)) {
                    let base = m.base.map_or(0, |b| self.bypass.get(b));
                    let addr = i64::from(base) + i64::from(m.offset);
                    let word = self
                        .mem
                        .word_index(addr)
                        .map_err(|e| self.fatal(e, slot.pc))?;
                    if slot.op == Opcode::Lw {
                        self.acquire_dst(&d);
                    }
                    slot.scratch = Scratch::Addr(word);
                    self.slots[MEM] = Some(slot);
                } else {
                    self.slots[EX] = Some(slot);
                }
            }
            Opcode::Beq | Opcode::Bne => {
                let (s1, s2) = (
                    d.src1.expect("branch sources"),
                    d.src2.expect("branch sources"),
                );
                if self.hazards.is_free(s1) && self.hazards.is_free(s2) {
                    let taken =
                        branch_taken(slot.op, self.bypass.get(s1), self.bypass.get(s2));
                    let label = d.label.as_deref().expect("branch target");
                    let target = self
                        .prog
                        .resolve_label(label)
                        .map_err(|e| self.fatal(e, slot.pc))?;

                    self.predictor.update(slot.pc, taken);
                    if taken != slot.predicted.unwrap_or(false) {
                        debug!(
                            "mispredicted {} at {}, squashing the front end",
                            slot.op, slot.pc
                        );
                        self.slots[IF] = None;
                        self.slots[ID] = None;
                        self.fetch_enabled = true;
                        self.redirect = Some(if taken { target } else { slot.pc + 1 });
                    }
                    self.slots[MEM] = Some(slot);
                } else {
                    self.slots[EX] = Some(slot);
                }
            }
            Opcode::J => {
                let label = d.label.as_deref().expect("jump target");
                let target = self
                    .prog
                    .resolve_label(label)
                    .map_err(|e| self.fatal(e, slot.pc))?;
                self.redirect = Some(target);
                self.fetch_enabled = true;
                self.slots[MEM] = Some(slot);
            }
            op => unreachable!("{op} unhandled in EX"),
        }
        Ok(())
    }

    /// ID: resolve the operand strings and hand off to EX.
    fn decode_stage(&mut self) -> Result<(), RunError> {
        if self.slots[EX].is_some() {
            return Ok(());
        }
        let Some(mut slot) = self.slots[ID].take() else {
            return Ok(());
        };

        let inst = self.prog.fetch(slot.pc).expect("pc outside the table");
        match decode(inst) {
            Ok(d) => {
                slot.decoded = Some(d);
                self.slots[EX] = Some(slot);
                Ok(())
            }
            Err(e) => Err(self.fatal(e, slot.pc)),
        }
    }

    /// IF: hand the fetched instruction to ID.
    fn fetch_advance(&mut self) {
        if self.slots[ID].is_none() {
            if let Some(slot) = self.slots[IF].take() {
                self.slots[ID] = Some(slot);
            }
        }
    }

    /// Fetch the instruction at PC, consulting the predictor for branches.
    fn fetch(&mut self) {
        if !self.fetch_enabled || self.slots[IF].is_some() || self.pc >= self.prog.len() {
            return;
        }

        let pc = self.pc;
        let op = self.prog.fetch(pc).expect("pc outside the table").op;
        let mut predicted = None;
        let mut next_pc = pc + 1;
        match op {
            Opcode::Beq | Opcode::Bne => {
                let taken = self.predictor.predict(pc);
                predicted = Some(taken);
                if taken {
                    // An unresolvable label falls through here; EX reports it.
                    if let Some(target) = self.branch_target(pc) {
                        next_pc = target;
                    }
                }
            }
            Opcode::J => self.fetch_enabled = false,
            _ => {}
        }

        self.slots[IF] = Some(Slot {
            pc,
            op,
            predicted,
            decoded: None,
            scratch: Scratch::None,
        });
        self.pc = next_pc;
    }

    fn branch_target(&self, pc: u32) -> Option<u32> {
        let inst = self.prog.fetch(pc)?;
        self.prog.resolve_label(&inst.args[2]).ok()
    }

    fn acquire_dst(&mut self, d: &Decoded) {
        if let Some(dst) = d.dst {
            self.hazards.acquire(dst);
        }
    }

    fn fatal(&self, kind: SimError, pc: u32) -> RunError {
        RunError {
            kind,
            pc,
            text: self.prog.source_line(pc),
        }
    }
}
