use crate::error::{ParseError, SimError};
use crate::inst::{Opcode, SourceInst};
use crate::mem::MEM_WORDS;
use hashbrown::HashMap;
use std::str::FromStr;

/// A label definition. Redefinitions are recorded rather than rejected at
/// parse time; using such a label is what fails, as `InvalidLabel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelDef {
    At(u32),
    Redefined,
}

/// The instruction table and label map produced from one source file.
/// Immutable once simulation starts.
#[derive(Debug, Clone)]
pub struct Program {
    pub insts: Vec<SourceInst>,
    pub labels: HashMap<String, LabelDef>,
}

impl FromStr for Program {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut insts = Vec::new();
        let mut labels = HashMap::new();

        let define = |labels: &mut HashMap<String, LabelDef>, name: &str, at: usize| {
            labels
                .entry(name.to_owned())
                .and_modify(|def| *def = LabelDef::Redefined)
                .or_insert(LabelDef::At(at as u32));
        };

        for (i, line) in s.lines().enumerate() {
            // Line numbers start at 1
            let lineno = i + 1;
            let err = |kind: SimError| ParseError { kind, line: lineno };

            // Strip the comment, then tokenize on commas and whitespace
            let line = &line[..line.find('#').unwrap_or(line.len())];
            let mut tokens: Vec<&str> = line
                .split([',', ' ', '\t'])
                .filter(|t| !t.is_empty())
                .collect();
            if tokens.is_empty() {
                continue;
            }

            // Accepted label forms: "foo:", "foo: inst", "foo:inst", "foo : inst"
            if let Some((label, rest)) = tokens[0].split_once(':') {
                define(&mut labels, label, insts.len());
                tokens.remove(0);
                if !rest.is_empty() {
                    tokens.insert(0, rest);
                }
            } else if tokens.len() > 1 && tokens[1].starts_with(':') {
                define(&mut labels, tokens[0], insts.len());
                let rest = &tokens[1][1..];
                tokens.drain(..2);
                if !rest.is_empty() {
                    tokens.insert(0, rest);
                }
            }
            if tokens.is_empty() {
                continue;
            }

            let op = tokens[0]
                .parse::<Opcode>()
                .map_err(|_| err(SimError::Syntax(tokens[0].to_owned())))?;
            if tokens.len() > 4 {
                return Err(err(SimError::Syntax(line.trim().to_owned())));
            }

            let mut args = [String::new(), String::new(), String::new()];
            for (slot, tok) in args.iter_mut().zip(&tokens[1..]) {
                *slot = (*tok).to_owned();
            }

            if insts.len() >= MEM_WORDS as usize {
                return Err(err(SimError::MemoryLimitExceeded));
            }
            insts.push(SourceInst { op, args });
        }

        Ok(Program { insts, labels })
    }
}

impl Program {
    pub fn fetch(&self, pc: u32) -> Option<&SourceInst> {
        self.insts.get(pc as usize)
    }

    pub fn len(&self) -> u32 {
        self.insts.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Source text of the instruction at `pc`, for error reports.
    pub fn source_line(&self, pc: u32) -> String {
        self.fetch(pc).map(SourceInst::text).unwrap_or_default()
    }

    /// Resolve a branch/jump target. A malformed label name is a syntax
    /// error; a well-formed one that is undefined (or defined more than
    /// once) is an `InvalidLabel`.
    pub fn resolve_label(&self, name: &str) -> Result<u32, SimError> {
        let well_formed = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && name.chars().all(|c| c.is_ascii_alphanumeric())
            && name.parse::<Opcode>().is_err();
        if !well_formed {
            return Err(SimError::Syntax(name.to_owned()));
        }

        match self.labels.get(name) {
            Some(LabelDef::At(pc)) => Ok(*pc),
            _ => Err(SimError::InvalidLabel(name.to_owned())),
        }
    }
}
