use crate::error::SimError;
use hashbrown::HashMap;

/// Byte span shared by the instruction table and the data words.
pub const MEM_BYTES: u32 = 1 << 20;
/// Same bound in words.
pub const MEM_WORDS: u32 = MEM_BYTES / 4;

/// Flat word-addressable data memory. Byte addresses must be 4-aligned,
/// outside the instruction-table footprint, and inside the 1 MiB bound;
/// anything else is an `InvalidAddress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMemory {
    words: Vec<i32>,
    code_words: u32,
    delta: HashMap<u32, i32>,
    track_delta: bool,
}

impl DataMemory {
    pub fn new() -> Self {
        Self {
            words: vec![0; MEM_WORDS as usize],
            code_words: 0,
            delta: HashMap::new(),
            track_delta: false,
        }
    }

    /// Mark the first `code_words` words as occupied by instructions.
    pub(crate) fn protect_code(&mut self, code_words: u32) {
        self.code_words = code_words;
    }

    /// Record every stored word until the next [`DataMemory::take_delta`].
    pub(crate) fn enable_delta(&mut self) {
        self.track_delta = true;
    }

    /// Translate a computed byte address into a word index, applying the
    /// validity rules.
    pub fn word_index(&self, byte_addr: i64) -> Result<u32, SimError> {
        let valid = byte_addr % 4 == 0
            && byte_addr >= i64::from(self.code_words) * 4
            && byte_addr < i64::from(MEM_BYTES);
        if valid {
            Ok((byte_addr / 4) as u32)
        } else {
            Err(SimError::InvalidAddress(byte_addr))
        }
    }

    pub fn read_word(&self, word: u32) -> i32 {
        self.words[word as usize]
    }

    pub fn write_word(&mut self, word: u32, value: i32) {
        self.words[word as usize] = value;
        if self.track_delta {
            self.delta.insert(word * 4, value);
        }
    }

    /// Words stored since the previous call, as (byte address, value) pairs
    /// sorted by address, then cleared for the next cycle.
    pub fn take_delta(&mut self) -> Vec<(u32, i32)> {
        let mut delta: Vec<_> = self.delta.drain().collect();
        delta.sort_unstable();
        delta
    }

    /// All nonzero words, for the termination report.
    pub fn nonzero_words(&self) -> Vec<(u32, i32)> {
        self.words
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0)
            .map(|(i, &v)| (i as u32 * 4, v))
            .collect()
    }

    /// Direct word write for driver/test setup; no footprint check.
    pub fn set_word(&mut self, byte_addr: u32, value: i32) {
        assert!(byte_addr % 4 == 0 && byte_addr < MEM_BYTES);
        self.words[(byte_addr / 4) as usize] = value;
    }

    pub fn get_word(&self, byte_addr: u32) -> i32 {
        assert!(byte_addr % 4 == 0 && byte_addr < MEM_BYTES);
        self.words[(byte_addr / 4) as usize]
    }
}

impl Default for DataMemory {
    fn default() -> Self {
        Self::new()
    }
}
