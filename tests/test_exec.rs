use mipsim::cpu::{Cpu, ExecResult};
use mipsim::deep::DeepPipeline;
use mipsim::error::{RunError, SimError};
use mipsim::five_stage::FiveStage;
use mipsim::inst::Reg;
use mipsim::mem::DataMemory;
use mipsim::parse_and_exec;
use mipsim::predictor::{BhrPredictor, BranchPredictor, CombinedPredictor, SaturatingPredictor};
use mipsim::program::Program;
use mipsim::regs::RegisterFile;

fn r(name: &str) -> Reg {
    name.parse().expect("bad register in test")
}

fn exec_src<C: Cpu>(
    src: &str,
    regs: RegisterFile,
    mem: DataMemory,
) -> Result<ExecResult, RunError> {
    let prog: Program = src.parse().expect("failed to parse test program");
    C::new(prog, regs, mem).exec_all()
}

#[generic_tests::define]
mod t {
    use super::*;

    #[test]
    fn test_arith<C: Cpu>() {
        let res = parse_and_exec::<C>("arith", RegisterFile::new(), DataMemory::new()).unwrap();
        assert_eq!(res.regs.get(r("$t0")), 5);
        assert_eq!(res.regs.get(r("$t1")), 7);
        assert_eq!(res.regs.get(r("$t2")), 12);
        assert_eq!(res.exec_counts, vec![1, 1, 1]);
    }

    #[test]
    fn test_load_use<C: Cpu>() {
        let mut mem = DataMemory::new();
        mem.set_word(400, 21);
        let regs = RegisterFile::from([(r("$sp"), 400)]);

        let res = parse_and_exec::<C>("loaduse", regs, mem).unwrap();
        assert_eq!(res.regs.get(r("$t0")), 21);
        assert_eq!(res.regs.get(r("$t1")), 42);
    }

    #[test]
    fn test_taken_branch_discards_wrong_path<C: Cpu>() {
        let res =
            parse_and_exec::<C>("branch_taken", RegisterFile::new(), DataMemory::new()).unwrap();
        assert_eq!(res.regs.get(r("$t0")), 0);
        assert_eq!(res.regs.get(r("$t1")), 2);
        // The fall-through addi never retires.
        assert_eq!(res.exec_counts, vec![1, 0, 1]);
    }

    #[test]
    fn test_loop<C: Cpu>() {
        let regs = RegisterFile::from([(r("$a0"), 10), (r("$sp"), 400)]);
        let res = parse_and_exec::<C>("loop", regs, DataMemory::new()).unwrap();

        assert_eq!(res.regs.get(r("$v0")), 55);
        assert_eq!(res.mem.get_word(400), 55);
        // beq runs once per iteration plus the exit; j once per iteration.
        assert_eq!(res.exec_counts[2], 11);
        assert_eq!(res.exec_counts[5], 10);
        assert_eq!(res.exec_counts[6], 1);
    }

    #[test]
    fn test_memcopy<C: Cpu>() {
        let mut mem = DataMemory::new();
        for i in 0..8 {
            mem.set_word(400 + 4 * i, i as i32 + 1);
        }
        let regs = RegisterFile::from([(r("$a0"), 8), (r("$a1"), 400), (r("$a2"), 480)]);

        let res = parse_and_exec::<C>("memcopy", regs, mem).unwrap();
        for i in 0..8 {
            assert_eq!(res.mem.get_word(480 + 4 * i), i as i32 + 1);
        }
    }

    #[test]
    fn test_hazard_chain<C: Cpu>() {
        let regs = RegisterFile::from([(r("$sp"), 400)]);
        let res = parse_and_exec::<C>("hazards", regs, DataMemory::new()).unwrap();

        assert_eq!(res.regs.get(r("$t1")), 6);
        assert_eq!(res.regs.get(r("$t2")), 3);
        assert_eq!(res.regs.get(r("$t3")), 18);
        assert_eq!(res.regs.get(r("$t4")), 1);
        assert_eq!(res.mem.get_word(400), 18);
    }

    #[test]
    fn test_writes_to_zero_are_dropped<C: Cpu>() {
        let res = parse_and_exec::<C>("zero", RegisterFile::new(), DataMemory::new()).unwrap();
        assert_eq!(res.regs.get(Reg::ZERO), 0);
        assert_eq!(res.regs.get(r("$t0")), 0);
        assert_eq!(res.exec_counts, vec![1, 1]);
    }

    #[test]
    fn test_waw_commits_in_program_order<C: Cpu>() {
        let mut mem = DataMemory::new();
        mem.set_word(400, 99);
        let regs = RegisterFile::from([(r("$sp"), 400)]);

        let res = parse_and_exec::<C>("waw", regs, mem).unwrap();
        // The younger addi must win even though the load commits later in
        // the deep pipe.
        assert_eq!(res.regs.get(r("$t0")), 5);
    }

    #[instantiate_tests(<FiveStage>)]
    mod five_stage {}

    #[instantiate_tests(<DeepPipeline>)]
    mod deep {}
}

mod timing {
    use super::*;

    #[test]
    fn five_stage_fill_drain_law() {
        // I instructions, N stages, no hazards: I + N - 1 cycles.
        let res = parse_and_exec::<FiveStage>("indep", RegisterFile::new(), DataMemory::new())
            .unwrap();
        assert_eq!(res.cycles_taken, 3 + 5 - 1);
    }

    #[test]
    fn five_stage_bypass_hides_raw_hazards() {
        // The dependent chain runs without a single stall.
        let res = parse_and_exec::<FiveStage>("arith", RegisterFile::new(), DataMemory::new())
            .unwrap();
        assert_eq!(res.cycles_taken, 7);
    }

    #[test]
    fn five_stage_load_use_stalls_one_cycle() {
        let mut mem = DataMemory::new();
        mem.set_word(400, 21);
        let regs = RegisterFile::from([(r("$sp"), 400)]);

        let res = parse_and_exec::<FiveStage>("loaduse", regs, mem).unwrap();
        assert_eq!(res.cycles_taken, 2 + 5 - 1 + 1);
    }

    #[test]
    fn five_stage_mispredict_refetches_target() {
        let res =
            parse_and_exec::<FiveStage>("branch_taken", RegisterFile::new(), DataMemory::new())
                .unwrap();
        assert_eq!(res.cycles_taken, 8);
    }

    #[test]
    fn deep_fill_drain_law() {
        let res = parse_and_exec::<DeepPipeline>("indep", RegisterFile::new(), DataMemory::new())
            .unwrap();
        assert_eq!(res.cycles_taken, 3 + 7 - 1);
    }

    #[test]
    fn deep_interlocks_expose_raw_hazards() {
        // Without bypassing, each dependent addi/add waits out its producer.
        let res = parse_and_exec::<DeepPipeline>("arith", RegisterFile::new(), DataMemory::new())
            .unwrap();
        assert_eq!(res.cycles_taken, 11);
    }

    #[test]
    fn deep_load_use_latency() {
        let mut mem = DataMemory::new();
        mem.set_word(400, 21);
        let regs = RegisterFile::from([(r("$sp"), 400)]);

        let res = parse_and_exec::<DeepPipeline>("loaduse", regs, mem).unwrap();
        assert_eq!(res.cycles_taken, 12);
    }

    #[test]
    fn deep_mispredict_refetches_target() {
        let res =
            parse_and_exec::<DeepPipeline>("branch_taken", RegisterFile::new(), DataMemory::new())
                .unwrap();
        assert_eq!(res.cycles_taken, 13);
    }

    #[test]
    fn deep_waw_defers_younger_producer() {
        let mut mem = DataMemory::new();
        mem.set_word(400, 99);
        let regs = RegisterFile::from([(r("$sp"), 400)]);

        let res = parse_and_exec::<DeepPipeline>("waw", regs, mem).unwrap();
        assert_eq!(res.regs.get(r("$t0")), 5);
        assert_eq!(res.cycles_taken, 10);
    }

    #[test]
    fn deep_store_never_blocks_the_other_port() {
        // A store in WB2 and a younger producer in WB1 complete in the same
        // cycle; only the pending-load queue could have held the producer.
        let regs = RegisterFile::from([(r("$a0"), 7)]);
        let res = parse_and_exec::<DeepPipeline>("wbrace", regs, DataMemory::new()).unwrap();

        assert_eq!(res.mem.get_word(400), 7);
        assert_eq!(res.regs.get(r("$t0")), 9);
        assert_eq!(res.regs.get(r("$t1")), 1);
        assert_eq!(res.cycles_taken, 9);
    }
}

mod predictors {
    use super::*;

    fn all_strategies(init: u8) -> Vec<Box<dyn BranchPredictor>> {
        vec![
            Box::new(SaturatingPredictor::new(init)),
            Box::new(BhrPredictor::new(init)),
            Box::new(CombinedPredictor::new(init, 1 << 16)),
        ]
    }

    fn run_loop<C: Cpu>(predictor: Box<dyn BranchPredictor>) -> ExecResult {
        let src = std::fs::read_to_string("asm/loop.asm").unwrap();
        let prog: Program = src.parse().unwrap();
        let regs = RegisterFile::from([(r("$a0"), 10), (r("$sp"), 400)]);
        C::new(prog, regs, DataMemory::new())
            .with_predictor(predictor)
            .exec_all()
            .unwrap()
    }

    #[test]
    fn strategies_agree_on_final_state() {
        // Prediction only moves cycles around; the architectural result is
        // the same whatever the strategy or initial bias.
        for init in [0, 3] {
            for predictor in all_strategies(init) {
                let res = run_loop::<FiveStage>(predictor);
                assert_eq!(res.regs.get(r("$v0")), 55);
                assert_eq!(res.mem.get_word(400), 55);
            }
            for predictor in all_strategies(init) {
                let res = run_loop::<DeepPipeline>(predictor);
                assert_eq!(res.regs.get(r("$v0")), 55);
                assert_eq!(res.mem.get_word(400), 55);
            }
        }
    }
}

mod errors {
    use super::*;

    #[test]
    fn invalid_register_is_fatal() {
        let err = exec_src::<FiveStage>(
            "add $t0, $bogus, $t1",
            RegisterFile::new(),
            DataMemory::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, SimError::InvalidRegister("$bogus".to_owned()));
        assert_eq!(err.pc, 0);
    }

    #[test]
    fn undefined_label_is_fatal() {
        let err = exec_src::<FiveStage>(
            "beq $zero, $zero, nowhere",
            RegisterFile::new(),
            DataMemory::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, SimError::InvalidLabel("nowhere".to_owned()));
    }

    #[test]
    fn redefined_label_is_fatal_at_use() {
        let src = "x: addi $t0, $zero, 1\nx: addi $t1, $zero, 2\nj x";
        let err = exec_src::<FiveStage>(src, RegisterFile::new(), DataMemory::new()).unwrap_err();
        assert_eq!(err.kind, SimError::InvalidLabel("x".to_owned()));
        assert_eq!(err.pc, 2);
    }

    #[test]
    fn unaligned_address_is_fatal() {
        let err = exec_src::<FiveStage>(
            "lw $t0, 402($zero)",
            RegisterFile::new(),
            DataMemory::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, SimError::InvalidAddress(402));
    }

    #[test]
    fn address_inside_code_footprint_is_fatal() {
        let err =
            exec_src::<FiveStage>("lw $t0, 0($zero)", RegisterFile::new(), DataMemory::new())
                .unwrap_err();
        assert_eq!(err.kind, SimError::InvalidAddress(0));
    }

    #[test]
    fn malformed_immediate_is_fatal() {
        let err = exec_src::<FiveStage>(
            "addi $t0, $zero, seven",
            RegisterFile::new(),
            DataMemory::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, SimError::Syntax("seven".to_owned()));
    }

    #[test]
    fn deep_pipe_reports_the_same_errors() {
        let err = exec_src::<DeepPipeline>(
            "sw $t0, 7($zero)",
            RegisterFile::new(),
            DataMemory::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, SimError::InvalidAddress(7));
        assert_eq!(err.text, "sw $t0, 7($zero)");
    }
}
