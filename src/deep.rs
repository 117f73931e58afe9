//! The deep pipeline: IF1, IF2, DEC1, DEC2, ID, then two sub-pipes of
//! different length — ALU1 → WB1 for ALU/ADDI/branch/jump (7 stages) and
//! ALU2 → MEM1 → MEM2 → WB2 for loads and stores (9 stages).
//!
//! There is no bypass network: every operand read is architectural, so ID is
//! the interlock point and a dependent instruction waits out the producer's
//! full latency. Because the two sub-pipes differ in length, a younger ALU
//! result can reach write-back before an older load does; each instruction
//! carries a monotonically increasing order tag assigned at fetch, and the
//! write-back arbiter commits the smaller tag first, deferring the other by
//! a cycle. A FIFO of in-flight load tags additionally keeps any ALU result
//! from committing ahead of an older load still in the memory pipe.

use std::collections::VecDeque;

use log::debug;

use crate::cpu::{Cpu, ExecResult};
use crate::error::{RunError, SimError};
use crate::hazard::HazardTable;
use crate::inst::{alu_result, branch_taken, decode, Opcode, Reg};
use crate::mem::DataMemory;
use crate::predictor::{BranchPredictor, SaturatingPredictor};
use crate::program::Program;
use crate::regs::RegisterFile;
use crate::trace::{NullTracer, Tracer};

const IF1: usize = 0;
const IF2: usize = 1;
const DEC1: usize = 2;
const DEC2: usize = 3;
const ID: usize = 4;
const ALU1: usize = 5;
const ALU2: usize = 6;
const MEM1: usize = 7;
const MEM2: usize = 8;
const WB1: usize = 9;
const WB2: usize = 10;
const STAGES: usize = 11;

/// One occupied pipeline stage.
#[derive(Debug, Clone)]
struct Slot {
    /// Instruction-table index.
    pc: u32,
    /// Issue sequence number assigned at fetch; write-back ties break on it.
    tag: u64,
    op: Opcode,
    /// Direction the fetch stage guessed for a conditional branch.
    predicted: Option<bool>,
    /// Resolved operands, present once the slot has passed DEC2.
    decoded: Option<crate::inst::Decoded>,
    /// ALU-path result, or the store value captured at dispatch.
    value: i32,
    /// Word index once the address stage has run.
    word: u32,
    /// Destination lock held by this instruction, dropped on commit/squash.
    locked: Option<Reg>,
    /// Operand-resolution failure, raised only once the instruction is
    /// known not to be on a squashed path.
    fault: Option<SimError>,
}

impl Slot {
    fn decoded(&self) -> &crate::inst::Decoded {
        self.decoded.as_ref().expect("instruction past decode")
    }
}

pub struct DeepPipeline {
    prog: Program,
    regs: RegisterFile,
    mem: DataMemory,
    hazards: HazardTable,
    predictor: Box<dyn BranchPredictor>,
    tracer: Box<dyn Tracer>,
    slots: [Option<Slot>; STAGES],
    pc: u32,
    /// Cleared while an unresolved jump drains the front of the pipe.
    fetch_enabled: bool,
    next_tag: u64,
    /// PC override raised by ALU1, applied after the stages, before fetch.
    redirect: Option<u32>,
    /// Order tags of loads fetched but not yet committed, oldest first.
    pending_loads: VecDeque<u64>,
    /// Order tags of predicted branches not yet resolved, oldest first.
    /// Memory writes and WB2 commits younger than the front must wait.
    unresolved_branches: VecDeque<u64>,
    /// Locks dropped once the whole cycle has run.
    releases: Vec<Reg>,
    exec_counts: Vec<u64>,
    cycles: u64,
}

impl Cpu for DeepPipeline {
    fn new(prog: Program, regs: RegisterFile, mut mem: DataMemory) -> Self {
        mem.protect_code(prog.len());
        mem.enable_delta();
        let exec_counts = vec![0; prog.insts.len()];

        Self {
            regs,
            mem,
            hazards: HazardTable::new(),
            predictor: Box::new(SaturatingPredictor::new(0)),
            tracer: Box::new(NullTracer),
            slots: Default::default(),
            pc: 0,
            fetch_enabled: true,
            next_tag: 1,
            redirect: None,
            pending_loads: VecDeque::new(),
            unresolved_branches: VecDeque::new(),
            releases: Vec::new(),
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
            let delta = self.mem.take_delta();
            self.tracer.cycle(self.cycles, &self.regs, &delta);
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

impl DeepPipeline {
    /// Advance every stage by one clock, oldest stages first.
    fn step(&mut self) -> Result<(), RunError> {
        self.writeback();
        self.mem2();
        self.mem1();
        self.alu2()?;
        self.alu1()?;
        self.dispatch()?;
        self.dec2();
        self.dec1();
        self.if2();
        self.if1();

        if let Some(target) = self.redirect.take() {
            self.pc = target;
        }
        self.fetch();
        for reg in std::mem::take(&mut self.releases) {
            self.hazards.release(reg);
        }
        Ok(())
    }

    /// True when no load older than `tag` is still in flight.
    fn load_queue_clear(&self, tag: u64) -> bool {
        self.pending_loads.front().map_or(true, |&front| tag < front)
    }

    /// True when no unresolved branch older than `tag` is in flight.
    fn commit_allowed(&self, tag: u64) -> bool {
        self.unresolved_branches
            .front()
            .map_or(true, |&front| tag <= front)
    }

    /// Arbitrate the two write-back ports.
    fn writeback(&mut self) {
        match (self.slots[WB1].is_some(), self.slots[WB2].is_some()) {
            (false, false) => {}
            (true, false) => self.wb1_alone(),
            (false, true) => self.wb2_alone(),
            (true, true) => self.wb_pair(),
        }
    }

    fn wb_pair(&mut self) {
        let (tag1, writes1) = {
            let s = self.slots[WB1].as_ref().expect("checked");
            (s.tag, s.op.writes_reg())
        };
        let (tag2, op2) = {
            let s = self.slots[WB2].as_ref().expect("checked");
            (s.tag, s.op)
        };

        if op2 == Opcode::Sw {
            // A store commits nothing here, so it never blocks the other
            // port by order; only the load-queue check gates the producer.
            if writes1 {
                if self.load_queue_clear(tag1) {
                    self.commit_wb1();
                }
                self.retire_wb2();
            } else {
                self.retire_wb1();
                self.retire_wb2();
            }
        } else if writes1 {
            // Two register producers ready: the older order tag wins, the
            // other port defers one cycle.
            if tag1 < tag2 {
                if self.load_queue_clear(tag1) {
                    self.commit_wb1();
                }
            } else if self.commit_allowed(tag2) {
                self.commit_wb2();
            }
        } else {
            self.retire_wb1();
            if self.commit_allowed(tag2) {
                self.commit_wb2();
            }
        }
    }

    fn wb1_alone(&mut self) {
        let (tag1, writes1) = {
            let s = self.slots[WB1].as_ref().expect("checked");
            (s.tag, s.op.writes_reg())
        };
        if !writes1 {
            self.retire_wb1();
        } else if self.load_queue_clear(tag1) {
            self.commit_wb1();
        }
    }

    fn wb2_alone(&mut self) {
        let (tag2, op2) = {
            let s = self.slots[WB2].as_ref().expect("checked");
            (s.tag, s.op)
        };
        if op2 == Opcode::Sw {
            self.retire_wb2();
        } else if self.commit_allowed(tag2) {
            self.commit_wb2();
        }
    }

    fn commit_wb1(&mut self) {
        let slot = self.slots[WB1].take().expect("checked");
        let dst = slot.decoded().dst.expect("producer without destination");
        self.regs.set(dst, slot.value);
        if let Some(reg) = slot.locked {
            self.releases.push(reg);
        }
        self.exec_counts[slot.pc as usize] += 1;
    }

    fn commit_wb2(&mut self) {
        let slot = self.slots[WB2].take().expect("checked");
        let dst = slot.decoded().dst.expect("load without destination");
        self.regs.set(dst, slot.value);
        let popped = self.pending_loads.pop_front();
        debug_assert_eq!(popped, Some(slot.tag), "pending-load queue out of order");
        if let Some(reg) = slot.locked {
            self.releases.push(reg);
        }
        self.exec_counts[slot.pc as usize] += 1;
    }

    fn retire_wb1(&mut self) {
        let slot = self.slots[WB1].take().expect("checked");
        self.exec_counts[slot.pc as usize] += 1;
    }

    fn retire_wb2(&mut self) {
        let slot = self.slots[WB2].take().expect("checked");
        self.exec_counts[slot.pc as usize] += 1;
    }

    /// MEM2: the actual data-memory access.
    fn mem2(&mut self) {
        if self.slots[WB2].is_some() {
            return;
        }
        let Some(mut slot) = self.slots[MEM2].take() else {
            return;
        };

        if slot.op == Opcode::Lw {
            slot.value = self.mem.read_word(slot.word);
            self.slots[WB2] = Some(slot);
        } else if self.commit_allowed(slot.tag) {
            self.mem.write_word(slot.word, slot.value);
            self.slots[WB2] = Some(slot);
        } else {
            // A store fetched behind a still-unresolved branch must not
            // touch memory yet; hold it (it is squashed on misprediction).
            self.slots[MEM2] = Some(slot);
        }
    }

    fn mem1(&mut self) {
        if self.slots[MEM2].is_none() {
            if let Some(slot) = self.slots[MEM1].take() {
                self.slots[MEM2] = Some(slot);
            }
        }
    }

    /// ALU2: effective-address computation for the memory sub-pipe.
    fn alu2(&mut self) -> Result<(), RunError> {
        if self.slots[MEM1].is_some() {
            return Ok(());
        }
        let Some(mut slot) = self.slots[ALU2].take() else {
            return Ok(());
        };

        let m = slot.decoded().mem.expect("memory operand");
        let base = m.base.map_or(0, |b| self.regs.get(b));
        let addr = i64::from(base) + i64::from(m.offset);
        match self.mem.word_index(addr) {
            Ok(word) => {
                slot.word = word;
                self.slots[MEM1] = Some(slot);
                Ok(())
            }
            // A bad address on a path that may still be squashed waits for
            // the older branch to resolve before it can kill the run.
            Err(e) if self.commit_allowed(slot.tag) => Err(self.fatal(e, slot.pc)),
            Err(_) => {
                self.slots[ALU2] = Some(slot);
                Ok(())
            }
        }
    }

    /// ALU1: arithmetic, and branch/jump resolution.
    fn alu1(&mut self) -> Result<(), RunError> {
        if self.slots[WB1].is_some() {
            return Ok(());
        }
        let Some(mut slot) = self.slots[ALU1].take() else {
            return Ok(());
        };

        let d = slot.decoded().clone();
        match slot.op {
            op if op.is_alu() => {
                let (s1, s2) = (d.src1.expect("alu sources"), d.src2.expect("alu sources"));
                slot.value = alu_result(op, self.regs.get(s1), self.regs.get(s2));
            }
            Opcode::Addi => {
                let src = d.src1.expect("addi source");
                slot.value = self.regs.get(src).wrapping_add(d.imm);
            }
            Opcode::Beq | Opcode::Bne => {
                let (s1, s2) = (
                    d.src1.expect("branch sources"),
                    d.src2.expect("branch sources"),
                );
                let taken = branch_taken(slot.op, self.regs.get(s1), self.regs.get(s2));
                let label = d.label.as_deref().expect("branch target");
                let target = self
                    .prog
                    .resolve_label(label)
                    .map_err(|e| self.fatal(e, slot.pc))?;

                self.predictor.update(slot.pc, taken);
                debug_assert_eq!(self.unresolved_branches.front(), Some(&slot.tag));
                self.unresolved_branches.pop_front();

                if taken != slot.predicted.unwrap_or(false) {
                    debug!(
                        "mispredicted {} at {}, squashing everything younger than tag {}",
                        slot.op, slot.pc, slot.tag
                    );
                    self.squash_younger(slot.tag);
                    self.redirect = Some(if taken { target } else { slot.pc + 1 });
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
            }
            op => unreachable!("{op} routed onto the ALU path"),
        }
        self.slots[WB1] = Some(slot);
        Ok(())
    }

    /// ID: the interlock point. Dispatch to a sub-pipe once every source
    /// register is lock-free; producers take their destination lock here.
    fn dispatch(&mut self) -> Result<(), RunError> {
        let Some(mut slot) = self.slots[ID].take() else {
            return Ok(());
        };
        if let Some(fault) = slot.fault.clone() {
            if self.commit_allowed(slot.tag) {
                return Err(self.fatal(fault, slot.pc));
            }
            // Possibly a squashed-path instruction; hold it until the older
            // branch resolves.
            self.slots[ID] = Some(slot);
            return Ok(());
        }
        let d = slot.decoded().clone();

        match slot.op {
            Opcode::Lw => {
                let m = d.mem.expect("memory operand");
                if self.slots[ALU2].is_none()
                    && m.base.map_or(true, |b| self.hazards.is_free(b))
                {
                    let dst = d.dst.expect("load without destination");
                    self.hazards.acquire(dst);
                    slot.locked = Some(dst);
                    self.slots[ALU2] = Some(slot);
                    return Ok(());
                }
            }
            Opcode::Sw => {
                let m = d.mem.expect("memory operand");
                let src = d.src1.expect("store without data register");
                if self.slots[ALU2].is_none()
                    && self.hazards.is_free(src)
                    && m.base.map_or(true, |b| self.hazards.is_free(b))
                {
                    // The store value is read once, at dispatch.
                    slot.value = self.regs.get(src);
                    self.slots[ALU2] = Some(slot);
                    return Ok(());
                }
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Slt => {
                let (s1, s2) = (d.src1.expect("alu sources"), d.src2.expect("alu sources"));
                if self.slots[ALU1].is_none()
                    && self.hazards.is_free(s1)
                    && self.hazards.is_free(s2)
                {
                    let dst = d.dst.expect("producer without destination");
                    self.hazards.acquire(dst);
                    slot.locked = Some(dst);
                    self.slots[ALU1] = Some(slot);
                    return Ok(());
                }
            }
            Opcode::Addi => {
                let src = d.src1.expect("addi source");
                if self.slots[ALU1].is_none() && self.hazards.is_free(src) {
                    let dst = d.dst.expect("producer without destination");
                    self.hazards.acquire(dst);
                    slot.locked = Some(dst);
                    self.slots[ALU1] = Some(slot);
                    return Ok(());
                }
            }
            Opcode::Beq | Opcode::Bne => {
                let (s1, s2) = (
                    d.src1.expect("branch sources"),
                    d.src2.expect("branch sources"),
                );
                if self.slots[ALU1].is_none()
                    && self.hazards.is_free(s1)
                    && self.hazards.is_free(s2)
                {
                    self.slots[ALU1] = Some(slot);
                    return Ok(());
                }
            }
            Opcode::J => {
                if self.slots[ALU1].is_none() {
                    self.slots[ALU1] = Some(slot);
                    return Ok(());
                }
            }
        }

        // Interlocked or structurally blocked; hold ID.
        self.slots[ID] = Some(slot);
        Ok(())
    }

    /// DEC2: resolve the operand strings. Failures travel with the slot and
    /// surface at dispatch, once the instruction cannot be squashed anymore.
    fn dec2(&mut self) {
        if self.slots[ID].is_some() {
            return;
        }
        let Some(mut slot) = self.slots[DEC2].take() else {
            return;
        };

        let inst = self.prog.fetch(slot.pc).expect("pc outside the table");
        match decode(inst) {
            Ok(d) => slot.decoded = Some(d),
            Err(e) => slot.fault = Some(e),
        }
        self.slots[ID] = Some(slot);
    }

    fn dec1(&mut self) {
        if self.slots[DEC2].is_none() {
            if let Some(slot) = self.slots[DEC1].take() {
                self.slots[DEC2] = Some(slot);
            }
        }
    }

    fn if2(&mut self) {
        if self.slots[DEC1].is_none() {
            if let Some(slot) = self.slots[IF2].take() {
                self.slots[DEC1] = Some(slot);
            }
        }
    }

    fn if1(&mut self) {
        if self.slots[IF2].is_none() {
            if let Some(slot) = self.slots[IF1].take() {
                self.slots[IF2] = Some(slot);
            }
        }
    }

    /// Fetch the instruction at PC, consulting the predictor for branches.
    fn fetch(&mut self) {
        if !self.fetch_enabled || self.slots[IF1].is_some() || self.pc >= self.prog.len()
        {
            return;
        }

        let pc = self.pc;
        let op = self.prog.fetch(pc).expect("pc outside the table").op;
        let tag = self.next_tag;
        self.next_tag += 1;

        let mut predicted = None;
        let mut next_pc = pc + 1;
        match op {
            Opcode::Beq | Opcode::Bne => {
                let taken = self.predictor.predict(pc);
                predicted = Some(taken);
                self.unresolved_branches.push_back(tag);
                if taken {
                    // An unresolvable label falls through; ALU1 reports it.
                    if let Some(target) = self.branch_target(pc) {
                        next_pc = target;
                    }
                }
            }
            Opcode::J => self.fetch_enabled = false,
            Opcode::Lw => self.pending_loads.push_back(tag),
            _ => {}
        }

        self.slots[IF1] = Some(Slot {
            pc,
            tag,
            op,
            predicted,
            decoded: None,
            value: 0,
            word: 0,
            locked: None,
            fault: None,
        });
        self.pc = next_pc;
    }

    fn branch_target(&self, pc: u32) -> Option<u32> {
        let inst = self.prog.fetch(pc)?;
        self.prog.resolve_label(&inst.args[2]).ok()
    }

    /// Discard every in-flight instruction younger than `tag`, wherever it
    /// sits, undoing its locks and queue entries.
    fn squash_younger(&mut self, tag: u64) {
        for stage in &mut self.slots {
            if stage.as_ref().map_or(false, |s| s.tag > tag) {
                if let Some(squashed) = stage.take() {
                    if let Some(reg) = squashed.locked {
                        self.hazards.release(reg);
                    }
                }
            }
        }
        self.pending_loads.retain(|&t| t <= tag);
        self.unresolved_branches.retain(|&t| t <= tag);
        self.fetch_enabled = true;
    }

    fn fatal(&self, kind: SimError, pc: u32) -> RunError {
        RunError {
            kind,
            pc,
            text: self.prog.source_line(pc),
        }
    }
}
