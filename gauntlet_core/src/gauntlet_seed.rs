//! Deterministic seed derivation.
//!
//! Every run in a bracket is reproducible from one root seed. A seed is a
//! short printable token: a non-numeric kind character followed by four
//! base-91 groups, one per 32-bit word of generator state.
//!
//! ```text
//!  T  h7#Qa  0p]@L  ZZ.k4  ~aB9(
//!  |  \___/  \___/  \___/  \___/
//! kind  x0     x1     y0     y1
//! ```
//!
//! The generator is xorshift128+ carried on 32-bit words. The shift
//! constants and the word layout are part of the reproducibility contract:
//! a seed printed by one build must replay identically on another.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Characters used by the seed payload (91 symbols).
const ALPHABET: &[u8; 91] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!#$%&()*+,-./:;<=>?@[]^_`{|}~";

/// Characters per encoded 32-bit word (91^5 > 2^32 > 91^4).
const GROUP_WIDTH: usize = 5;

/// Words of generator state carried in a seed.
const WORDS: usize = 4;

/// Payload length in characters, excluding the kind prefix.
pub const PAYLOAD_LEN: usize = GROUP_WIDTH * WORDS;

/// Errors produced when parsing or building seeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeedError {
    #[error("seed is empty")]
    Empty,

    #[error("seed kind must be a non-numeric character, got {0:?}")]
    NumericKind(char),

    #[error("seed payload must be {expected} characters, got {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("invalid seed character {0:?}")]
    InvalidCharacter(char),

    #[error("seed group {0:?} does not fit in 32 bits")]
    Overflow(String),
}

// =============================================================================
// SEED KIND + SEED
// =============================================================================

/// The kind prefix of a seed.
///
/// Only a debugging aid: the kind never feeds into the generator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeedKind(char);

impl SeedKind {
    /// Root seed of a whole tournament run.
    pub const TOURNAMENT: SeedKind = SeedKind('T');

    /// Seed handed to a composite bracket node.
    pub const MATCH: SeedKind = SeedKind('M');

    /// Seed handed to a single game.
    pub const GAME: SeedKind = SeedKind('G');

    /// Creates a kind, rejecting digits and whitespace.
    pub fn new(kind: char) -> Result<Self, SeedError> {
        if kind.is_ascii_digit() || kind.is_whitespace() {
            return Err(SeedError::NumericKind(kind));
        }
        Ok(Self(kind))
    }

    pub fn as_char(&self) -> char {
        self.0
    }
}

/// An immutable seed token.
///
/// Seeds are validated on construction, so decoding the words of an
/// existing `Seed` cannot fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Seed(String);

impl Seed {
    /// Builds a seed from four state words.
    pub fn from_words(kind: SeedKind, words: [u32; 4]) -> Self {
        let mut text = String::with_capacity(1 + PAYLOAD_LEN);
        text.push(kind.0);
        for word in words {
            text.push_str(&encode_word(word));
        }
        Self(text)
    }

    /// Returns the kind prefix.
    pub fn kind(&self) -> SeedKind {
        // Validated on construction: the first char always exists.
        SeedKind(self.0.chars().next().unwrap_or('?'))
    }

    /// Returns the four state words encoded in the payload.
    pub fn words(&self) -> [u32; 4] {
        // Validated on construction, decoding cannot fail here.
        decode_payload(self.payload()).unwrap_or([0; 4])
    }

    /// Returns the seed text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn payload(&self) -> &str {
        let kind_len = self.0.chars().next().map(char::len_utf8).unwrap_or(0);
        &self.0[kind_len..]
    }
}

impl FromStr for Seed {
    type Err = SeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let kind = chars.next().ok_or(SeedError::Empty)?;
        SeedKind::new(kind)?;
        decode_payload(chars.as_str())?;
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Seed {
    type Error = SeedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Seed> for String {
    fn from(seed: Seed) -> Self {
        seed.0
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// BASE-91 WORD CODEC
// =============================================================================

/// Encodes one word as a fixed-width base-91 group, most significant first.
pub fn encode_word(word: u32) -> String {
    let mut digits = [0u8; GROUP_WIDTH];
    let mut rest = word;
    for slot in digits.iter_mut().rev() {
        *slot = ALPHABET[(rest % 91) as usize];
        rest /= 91;
    }
    digits.iter().map(|&b| b as char).collect()
}

/// Decodes one base-91 group back into a word.
pub fn decode_word(group: &str) -> Result<u32, SeedError> {
    if group.chars().count() != GROUP_WIDTH {
        return Err(SeedError::BadLength {
            expected: GROUP_WIDTH,
            actual: group.chars().count(),
        });
    }
    let mut acc: u64 = 0;
    for c in group.chars() {
        let digit = symbol_index(c).ok_or(SeedError::InvalidCharacter(c))?;
        acc = acc * 91 + digit as u64;
    }
    u32::try_from(acc).map_err(|_| SeedError::Overflow(group.to_string()))
}

fn symbol_index(c: char) -> Option<usize> {
    if !c.is_ascii() {
        return None;
    }
    ALPHABET.iter().position(|&b| b == c as u8)
}

fn decode_payload(payload: &str) -> Result<[u32; 4], SeedError> {
    let actual = payload.chars().count();
    if actual != PAYLOAD_LEN {
        return Err(SeedError::BadLength {
            expected: PAYLOAD_LEN,
            actual,
        });
    }
    if let Some(bad) = payload.chars().find(|c| symbol_index(*c).is_none()) {
        return Err(SeedError::InvalidCharacter(bad));
    }
    // All-ASCII from here on, so byte slicing is safe.
    let mut words = [0u32; 4];
    for (i, word) in words.iter_mut().enumerate() {
        let start = i * GROUP_WIDTH;
        *word = decode_word(&payload[start..start + GROUP_WIDTH])?;
    }
    Ok(words)
}

// =============================================================================
// GENERATOR
// =============================================================================

/// Where a seed should come from when one may or may not be supplied.
pub enum SeedSource<'a> {
    /// Use this seed as-is.
    Seed(Seed),

    /// Derive a new seed from this generator.
    Generator(&'a mut SeedGenerator),
}

/// Deterministic xorshift128+ generator over four 32-bit words.
///
/// Holds exactly one snapshot slot for [`save`](Self::save) /
/// [`rollback`](Self::rollback).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedGenerator {
    /// `(x0, x1, y0, y1)`: high/low words of the two 64-bit lanes
    state: [u32; 4],

    /// Single saved snapshot
    snapshot: Option<[u32; 4]>,
}

impl SeedGenerator {
    /// Creates a generator from a seed.
    pub fn new(seed: &Seed) -> Self {
        Self::from_words(seed.words())
    }

    /// Creates a generator directly from state words.
    pub fn from_words(state: [u32; 4]) -> Self {
        Self {
            state,
            snapshot: None,
        }
    }

    /// Returns the raw state words.
    pub fn state(&self) -> [u32; 4] {
        self.state
    }

    /// Advances the state and returns a value in `[0, 2^32)`.
    pub fn next_u32(&mut self) -> u32 {
        let [x0, x1, y0, y1] = self.state;

        let nx0 = x0 ^ ((x0 << 23) | (x1 >> 9));
        let nx1 = x1 ^ (x1 << 23);

        let ny0 = nx0 ^ y0 ^ (nx0 >> 17) ^ (y0 >> 26);
        let ny1 = nx1 ^ y1 ^ ((nx0 << 15) | (nx1 >> 17)) ^ ((y0 << 6) | (y1 >> 26));

        self.state = [y0, y1, ny0, ny1];
        ny1.wrapping_add(y1)
    }

    /// Returns a value in `[0, range)`.
    ///
    /// # Panics
    /// Panics if `range` is zero.
    pub fn next_below(&mut self, range: u32) -> u32 {
        assert!(range > 0, "next_below called with an empty range");
        self.next_u32() % range
    }

    /// Derives a fresh seed, consuming four outputs.
    pub fn derive_seed(&mut self, kind: SeedKind) -> Seed {
        let words = [
            self.next_u32(),
            self.next_u32(),
            self.next_u32(),
            self.next_u32(),
        ];
        Seed::from_words(kind, words)
    }

    /// Stores the current state in the snapshot slot, replacing any
    /// previous snapshot.
    pub fn save(&mut self) {
        self.snapshot = Some(self.state);
    }

    /// Restores the saved snapshot. The snapshot stays in the slot.
    ///
    /// Returns `false` (and changes nothing) when nothing was saved.
    pub fn rollback(&mut self) -> bool {
        match self.snapshot {
            Some(saved) => {
                self.state = saved;
                true
            }
            None => false,
        }
    }

    /// Creates a seed from OS entropy. Only for root seeds.
    pub fn fresh_random_seed(kind: SeedKind) -> Seed {
        let mut words = [0u32; 4];
        for word in words.iter_mut() {
            *word = OsRng.next_u32();
        }
        Seed::from_words(kind, words)
    }

    /// Resolves an optional seed source: passthrough for a seed, derivation
    /// for a generator, fresh entropy otherwise.
    pub fn seed_from(source: Option<SeedSource<'_>>, kind: SeedKind) -> Seed {
        match source {
            Some(SeedSource::Seed(seed)) => seed,
            Some(SeedSource::Generator(generator)) => generator.derive_seed(kind),
            None => Self::fresh_random_seed(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Reference xorshift128+ on native 64-bit lanes.
    fn reference_next(s: &mut [u64; 2]) -> u32 {
        let mut s1 = s[0];
        let s0 = s[1];
        s[0] = s0;
        s1 ^= s1 << 23;
        s[1] = s1 ^ s0 ^ (s1 >> 17) ^ (s0 >> 26);
        s[1].wrapping_add(s0) as u32
    }

    fn sample_seed() -> Seed {
        Seed::from_words(SeedKind::TOURNAMENT, [0x1234_5678, 0x9abc_def0, 0x0f0f_0f0f, 0xdead_beef])
    }

    #[test]
    fn test_alphabet_is_91_distinct_symbols() {
        let mut seen = std::collections::HashSet::new();
        for &b in ALPHABET.iter() {
            assert!(seen.insert(b), "duplicate symbol {}", b as char);
            assert!(b != b'"' && b != b'\'' && b != b'\\');
        }
        assert_eq!(seen.len(), 91);
    }

    #[test]
    fn test_split_words_match_64bit_reference() {
        let words = [0x1234_5678, 0x9abc_def0, 0x0f0f_0f0f, 0xdead_beef];
        let mut generator = SeedGenerator::from_words(words);
        let mut lanes = [
            ((words[0] as u64) << 32) | words[1] as u64,
            ((words[2] as u64) << 32) | words[3] as u64,
        ];

        for _ in 0..1000 {
            assert_eq!(generator.next_u32(), reference_next(&mut lanes));
        }
        let [x0, x1, y0, y1] = generator.state();
        assert_eq!(((x0 as u64) << 32) | x1 as u64, lanes[0]);
        assert_eq!(((y0 as u64) << 32) | y1 as u64, lanes[1]);
    }

    #[test]
    fn test_seed_layout() {
        let seed = sample_seed();
        assert_eq!(seed.as_str().len(), 1 + PAYLOAD_LEN);
        assert_eq!(seed.kind(), SeedKind::TOURNAMENT);
        assert_eq!(seed.words(), [0x1234_5678, 0x9abc_def0, 0x0f0f_0f0f, 0xdead_beef]);
        assert_eq!(encode_word(0), "AAAAA");
    }

    #[test]
    fn test_seed_parse_errors() {
        assert_eq!("".parse::<Seed>(), Err(SeedError::Empty));
        assert_eq!(
            "7AAAAAAAAAAAAAAAAAAAA".parse::<Seed>(),
            Err(SeedError::NumericKind('7'))
        );
        assert!(matches!("TAAAA".parse::<Seed>(), Err(SeedError::BadLength { .. })));
        assert_eq!(
            "TAAAAAAAAAAAAAAAAAAA\\".parse::<Seed>(),
            Err(SeedError::InvalidCharacter('\\'))
        );
        // 91^5 - 1 is above u32::MAX
        assert!(matches!(
            "T~~~~~AAAAAAAAAAAAAAA".parse::<Seed>(),
            Err(SeedError::Overflow(_))
        ));
    }

    #[test]
    fn test_seed_serde_roundtrip_validates() {
        let seed = sample_seed();
        let json = serde_json::to_string(&seed).unwrap();
        let back: Seed = serde_json::from_str(&json).unwrap();
        assert_eq!(back, seed);

        assert!(serde_json::from_str::<Seed>("\"1bad\"").is_err());
    }

    #[test]
    fn test_derived_seeds_are_deterministic() {
        let mut a = SeedGenerator::new(&sample_seed());
        let mut b = SeedGenerator::new(&sample_seed());

        let seeds_a: Vec<Seed> = (0..5).map(|_| a.derive_seed(SeedKind::GAME)).collect();
        let seeds_b: Vec<Seed> = (0..5).map(|_| b.derive_seed(SeedKind::GAME)).collect();

        assert_eq!(seeds_a, seeds_b);
        assert_ne!(seeds_a[0], seeds_a[1]);
        assert!(seeds_a.iter().all(|s| s.kind() == SeedKind::GAME));
    }

    #[test]
    fn test_save_and_rollback_single_slot() {
        let mut generator = SeedGenerator::new(&sample_seed());
        assert!(!generator.rollback());

        generator.save();
        let first: Vec<u32> = (0..3).map(|_| generator.next_u32()).collect();
        assert!(generator.rollback());
        let replay: Vec<u32> = (0..3).map(|_| generator.next_u32()).collect();
        assert_eq!(first, replay);

        // Slot is kept after rollback
        assert!(generator.rollback());
        assert_eq!(generator.next_u32(), first[0]);

        // Saving again replaces the slot
        generator.save();
        let after = generator.next_u32();
        generator.rollback();
        assert_eq!(generator.next_u32(), after);
    }

    #[test]
    fn test_seed_from_sources() {
        let seed = sample_seed();
        let passthrough = SeedGenerator::seed_from(Some(SeedSource::Seed(seed.clone())), SeedKind::GAME);
        assert_eq!(passthrough, seed);

        let mut generator = SeedGenerator::new(&seed);
        let mut twin = generator.clone();
        let derived = SeedGenerator::seed_from(Some(SeedSource::Generator(&mut generator)), SeedKind::MATCH);
        assert_eq!(derived, twin.derive_seed(SeedKind::MATCH));

        let fresh = SeedGenerator::seed_from(None, SeedKind::TOURNAMENT);
        assert_eq!(fresh.kind(), SeedKind::TOURNAMENT);
        assert!(fresh.as_str().parse::<Seed>().is_ok());
    }

    #[test]
    #[should_panic]
    fn test_next_below_zero_panics() {
        SeedGenerator::new(&sample_seed()).next_below(0);
    }

    proptest! {
        #[test]
        fn prop_word_roundtrip(word in any::<u32>()) {
            prop_assert_eq!(decode_word(&encode_word(word)).unwrap(), word);
        }

        #[test]
        fn prop_next_below_in_range(words in any::<[u32; 4]>(), range in 1u32..=u32::MAX) {
            let mut generator = SeedGenerator::from_words(words);
            for _ in 0..16 {
                prop_assert!(generator.next_below(range) < range);
            }
        }

        #[test]
        fn prop_seed_text_roundtrip(words in any::<[u32; 4]>()) {
            let seed = Seed::from_words(SeedKind::MATCH, words);
            let parsed: Seed = seed.as_str().parse().unwrap();
            prop_assert_eq!(parsed.words(), words);
        }
    }
}
