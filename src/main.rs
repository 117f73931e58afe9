use std::path::PathBuf;
use std::{fs, process};

use clap::{Parser, ValueEnum};

use mipsim::cpu::{Cpu, ExecResult};
use mipsim::deep::DeepPipeline;
use mipsim::error::RunError;
use mipsim::five_stage::FiveStage;
use mipsim::mem::DataMemory;
use mipsim::predictor::{BhrPredictor, BranchPredictor, CombinedPredictor, SaturatingPredictor};
use mipsim::program::Program;
use mipsim::regs::RegisterFile;
use mipsim::trace::TextTracer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Variant {
    /// 5-stage pipeline with full bypassing.
    Five,
    /// 7-9 stage pipeline with interlocks only.
    Deep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    /// Per-address 2-bit saturating counters.
    Saturating,
    /// Global 2-bit branch history register.
    Bhr,
    /// Per-address histories over a shared counter bank.
    Combined,
}

#[derive(Parser, Debug)]
#[command(about = "Cycle-accurate pipelined MIPS simulator")]
struct Args {
    /// Assembly source file.
    file: PathBuf,

    /// Pipeline variant to simulate.
    #[arg(long, value_enum, default_value_t = Variant::Five)]
    pipeline: Variant,

    /// Branch prediction strategy.
    #[arg(long, value_enum, default_value_t = Strategy::Saturating)]
    predictor: Strategy,

    /// Initial predictor counter/history state (0..=3).
    #[arg(long, default_value_t = 0)]
    init: u8,

    /// Suppress the per-cycle dump.
    #[arg(long)]
    quiet: bool,
}

fn main() {
    let _ = flexi_logger::Logger::try_with_env_or_str("warn").map(|l| l.start());
    let args = Args::parse();

    let contents = fs::read_to_string(&args.file).expect("failed to open file");
    let prog: Program = match contents.parse() {
        Ok(prog) => prog,
        Err(e) => {
            eprintln!("{e}");
            process::exit(e.kind.exit_code());
        }
    };
    let listing: Vec<String> = prog.insts.iter().map(|inst| inst.text()).collect();

    let predictor: Box<dyn BranchPredictor> = match args.predictor {
        Strategy::Saturating => Box::new(SaturatingPredictor::new(args.init)),
        Strategy::Bhr => Box::new(BhrPredictor::new(args.init)),
        Strategy::Combined => Box::new(CombinedPredictor::new(args.init, 1 << 16)),
    };

    let result = match args.pipeline {
        Variant::Five => run::<FiveStage>(prog, predictor, args.quiet, false),
        Variant::Deep => run::<DeepPipeline>(prog, predictor, args.quiet, true),
    };

    match result {
        Ok(res) => report(&res, &listing, args.pipeline),
        Err(e) => {
            eprintln!("{e}");
            process::exit(e.kind.exit_code());
        }
    }
}

fn run<C: Cpu>(
    prog: Program,
    predictor: Box<dyn BranchPredictor>,
    quiet: bool,
    show_delta: bool,
) -> Result<ExecResult, RunError> {
    let mut cpu = C::new(prog, RegisterFile::new(), DataMemory::new()).with_predictor(predictor);
    if !quiet {
        cpu = cpu.with_tracer(Box::new(TextTracer::new(
            std::io::stdout().lock(),
            show_delta,
        )));
    }
    cpu.exec_all()
}

fn report(res: &ExecResult, listing: &[String], variant: Variant) {
    println!();
    println!("total number of cycles: {}", res.cycles_taken);

    if variant == Variant::Five {
        println!();
        println!("nonzero data values:");
        for (addr, value) in res.mem.nonzero_words() {
            println!("{}-{}: {:#x}", addr, addr + 3, value);
        }
        println!();
        println!("count of instructions executed:");
        for (count, text) in res.exec_counts.iter().zip(listing) {
            println!("{count} times:\t{text}");
        }
    }
}
