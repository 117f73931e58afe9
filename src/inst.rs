use crate::error::SimError;
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};

/// The supported opcodes. Unknown mnemonics are rejected once, at parse time,
/// so nothing else can reach the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    Slt,
    Addi,
    Lw,
    Sw,
    Beq,
    Bne,
    J,
}

impl Opcode {
    pub fn is_alu(self) -> bool {
        matches!(self, Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Slt)
    }

    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Beq | Opcode::Bne)
    }

    pub fn is_mem(self) -> bool {
        matches!(self, Opcode::Lw | Opcode::Sw)
    }

    /// Opcodes that produce a register result.
    pub fn writes_reg(self) -> bool {
        self.is_alu() || matches!(self, Opcode::Addi | Opcode::Lw)
    }
}

/// An architectural register index, 0..=31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

impl Reg {
    pub const ZERO: Reg = Reg(0);

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl FromStr for Reg {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let idx = match s {
            "$zero" => 0,
            "$at" => 1,
            "$v0" => 2,
            "$v1" => 3,
            "$a0" => 4,
            "$a1" => 5,
            "$a2" => 6,
            "$a3" => 7,
            "$t0" => 8,
            "$t1" => 9,
            "$t2" => 10,
            "$t3" => 11,
            "$t4" => 12,
            "$t5" => 13,
            "$t6" => 14,
            "$t7" => 15,
            "$s0" => 16,
            "$s1" => 17,
            "$s2" => 18,
            "$s3" => 19,
            "$s4" => 20,
            "$s5" => 21,
            "$s6" => 22,
            "$s7" => 23,
            "$t8" => 24,
            "$t9" => 25,
            "$k0" => 26,
            "$k1" => 27,
            "$gp" => 28,
            "$sp" => 29,
            "$s8" => 30,
            "$ra" => 31,
            _ => match s.strip_prefix('$').and_then(|n| n.parse::<u8>().ok()) {
                Some(n) if n < 32 => n,
                _ => return Err(SimError::InvalidRegister(s.to_owned())),
            },
        };

        Ok(Reg(idx))
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// A memory operand: `offset(base)`, `(base)`, or a bare absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<Reg>,
    pub offset: i32,
}

impl FromStr for MemOperand {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_suffix(')') {
            let (offset, reg) = rest
                .split_once('(')
                .ok_or_else(|| SimError::Syntax(s.to_owned()))?;
            let offset = if offset.is_empty() {
                0
            } else {
                parse_imm(offset)?
            };

            Ok(MemOperand {
                base: Some(reg.parse()?),
                offset,
            })
        } else {
            Ok(MemOperand {
                base: None,
                offset: parse_imm(s)?,
            })
        }
    }
}

/// Parse a signed immediate literal.
pub fn parse_imm(s: &str) -> Result<i32, SimError> {
    s.parse::<i32>().map_err(|_| SimError::Syntax(s.to_owned()))
}

/// One instruction-table entry: an opcode plus up to three operand strings,
/// exactly as the parser tokenized them. Operand validity is only checked
/// when the instruction reaches a decode stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInst {
    pub op: Opcode,
    pub args: [String; 3],
}

impl SourceInst {
    /// Reconstructed source text, used for error reports and listings.
    pub fn text(&self) -> String {
        let args = self
            .args
            .iter()
            .filter(|a| !a.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        if args.is_empty() {
            self.op.to_string()
        } else {
            format!("{} {}", self.op, args)
        }
    }
}

impl fmt::Display for SourceInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// Operand strings resolved into register indices and literals. Built by a
/// decode stage; failures surface as the fatal error kinds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Decoded {
    pub dst: Option<Reg>,
    pub src1: Option<Reg>,
    pub src2: Option<Reg>,
    pub imm: i32,
    pub mem: Option<MemOperand>,
    pub label: Option<String>,
}

/// Resolve the operand strings of one instruction.
pub fn decode(inst: &SourceInst) -> Result<Decoded, SimError> {
    let arg = |n: usize| -> Result<&str, SimError> {
        let s = inst.args[n].as_str();
        if s.is_empty() {
            Err(SimError::Syntax(inst.text()))
        } else {
            Ok(s)
        }
    };
    let reg = |n: usize| -> Result<Reg, SimError> { arg(n)?.parse() };

    let mut d = Decoded::default();
    match inst.op {
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Slt => {
            d.dst = Some(reg(0)?);
            d.src1 = Some(reg(1)?);
            d.src2 = Some(reg(2)?);
        }
        Opcode::Addi => {
            d.dst = Some(reg(0)?);
            d.src1 = Some(reg(1)?);
            d.imm = parse_imm(arg(2)?)?;
        }
        Opcode::Lw => {
            d.dst = Some(reg(0)?);
            d.mem = Some(arg(1)?.parse()?);
        }
        Opcode::Sw => {
            d.src1 = Some(reg(0)?);
            d.mem = Some(arg(1)?.parse()?);
        }
        Opcode::Beq | Opcode::Bne => {
            d.src1 = Some(reg(0)?);
            d.src2 = Some(reg(1)?);
            d.label = Some(arg(2)?.to_owned());
        }
        Opcode::J => {
            d.label = Some(arg(0)?.to_owned());
        }
    }

    Ok(d)
}

/// The arithmetic performed by the execute stages.
pub fn alu_result(op: Opcode, a: i32, b: i32) -> i32 {
    match op {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Slt => i32::from(a < b),
        _ => unreachable!("{op} is not an ALU opcode"),
    }
}

/// Branch condition evaluation.
pub fn branch_taken(op: Opcode, a: i32, b: i32) -> bool {
    match op {
        Opcode::Beq => a == b,
        Opcode::Bne => a != b,
        _ => unreachable!("{op} is not a branch opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg() {
        assert_eq!("$zero".parse(), Ok(Reg(0)));
        assert_eq!("$sp".parse(), Ok(Reg(29)));
        assert_eq!("$ra".parse(), Ok(Reg(31)));
        assert_eq!("$t0".parse(), Ok(Reg(8)));
        assert_eq!("$t8".parse(), Ok(Reg(24)));
        assert_eq!("$s0".parse(), Ok(Reg(16)));
        assert_eq!("$s8".parse(), Ok(Reg(30)));
        assert_eq!("$0".parse(), Ok(Reg(0)));
        assert_eq!("$31".parse(), Ok(Reg(31)));

        assert!("$32".parse::<Reg>().is_err());
        assert!("$t10".parse::<Reg>().is_err());
        assert!("zero".parse::<Reg>().is_err());
        assert!("$-1".parse::<Reg>().is_err());
    }

    #[test]
    fn test_mem_operand() {
        assert_eq!(
            "0($sp)".parse(),
            Ok(MemOperand {
                base: Some(Reg(29)),
                offset: 0
            })
        );
        assert_eq!(
            "-8($t0)".parse(),
            Ok(MemOperand {
                base: Some(Reg(8)),
                offset: -8
            })
        );
        assert_eq!(
            "($t1)".parse(),
            Ok(MemOperand {
                base: Some(Reg(9)),
                offset: 0
            })
        );
        assert_eq!(
            "400".parse(),
            Ok(MemOperand {
                base: None,
                offset: 400
            })
        );

        assert!("4[$sp]".parse::<MemOperand>().is_err());
        assert!("4($sp".parse::<MemOperand>().is_err());
        assert!("x($sp)".parse::<MemOperand>().is_err());
        assert!("4($xx)".parse::<MemOperand>().is_err());
    }

    #[test]
    fn test_opcode() {
        assert_eq!("add".parse(), Ok(Opcode::Add));
        assert_eq!("addi".parse(), Ok(Opcode::Addi));
        assert_eq!("j".parse(), Ok(Opcode::J));
        assert!("jalr".parse::<Opcode>().is_err());
        assert!("ADD".parse::<Opcode>().is_err());
    }

    #[test]
    fn test_decode_errors() {
        let inst = SourceInst {
            op: Opcode::Add,
            args: ["$t0".into(), "$bogus".into(), "$t1".into()],
        };
        assert_eq!(
            decode(&inst),
            Err(SimError::InvalidRegister("$bogus".to_owned()))
        );

        let inst = SourceInst {
            op: Opcode::Addi,
            args: ["$t0".into(), "$t1".into(), "seven".into()],
        };
        assert_eq!(decode(&inst), Err(SimError::Syntax("seven".to_owned())));

        let inst = SourceInst {
            op: Opcode::Beq,
            args: ["$t0".into(), "$t1".into(), String::new()],
        };
        assert!(decode(&inst).is_err());
    }

    #[test]
    fn test_alu_result() {
        assert_eq!(alu_result(Opcode::Add, 5, 7), 12);
        assert_eq!(alu_result(Opcode::Sub, 5, 7), -2);
        assert_eq!(alu_result(Opcode::Mul, -3, 4), -12);
        assert_eq!(alu_result(Opcode::Slt, -3, 4), 1);
        assert_eq!(alu_result(Opcode::Slt, 4, 4), 0);
        assert_eq!(alu_result(Opcode::Add, i32::MAX, 1), i32::MIN);
    }
}
