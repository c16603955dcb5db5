//! Packed-string decoding and ZSCII translation.
//!
//! A packed string is a run of big-endian words, three 5-bit Z-characters
//! per word, final word flagged by bit 15. Decoding is a small state
//! machine: three alphabets, temporary and (v1/v2) locking shifts,
//! abbreviation expansion, and a 10-bit ZSCII escape.

use crate::header::Header;
use crate::memory::Memory;
use bitreader::BitReader;
use lazy_static::lazy_static;
use std::collections::HashMap;

const ALPHABET_A0: &str = "abcdefghijklmnopqrstuvwxyz";
const ALPHABET_A1: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ALPHABET_A2: &str = " \n0123456789.,!?_#'\"/\\-:()";
// v1 has no newline in A2; `<` sits in its place
const ALPHABET_A2_V1: &str = " 0123456789.,!?_#'\"/\\<-:()";

/// Abbreviation banks are 32 entries each, three banks.
const MAX_ABBREV_INDEX: u8 = 96;

const ABBREV_DEPTH_LIMIT: u8 = 4;

lazy_static! {
    /// Default ZSCII 155..223 to Unicode mapping (Z-machine standard
    /// table 1), used when the story carries no translation table.
    static ref DEFAULT_UNICODE_TABLE: HashMap<u16, char> = {
        let pairs: &[(u16, u32)] = &[
            (155, 0xE4), (156, 0xF6), (157, 0xFC), (158, 0xC4), (159, 0xD6),
            (160, 0xDC), (161, 0xDF), (162, 0xBB), (163, 0xAB), (164, 0xEB),
            (165, 0xEF), (166, 0xFF), (167, 0xCB), (168, 0xCF), (169, 0xE1),
            (170, 0xE9), (171, 0xED), (172, 0xF3), (173, 0xFA), (174, 0xFD),
            (175, 0xC1), (176, 0xC9), (177, 0xCD), (178, 0xD3), (179, 0xDA),
            (180, 0xDD), (181, 0xE0), (182, 0xE8), (183, 0xEC), (184, 0xF2),
            (185, 0xF9), (186, 0xC0), (187, 0xC8), (188, 0xCC), (189, 0xD2),
            (190, 0xD9), (191, 0xE2), (192, 0xEA), (193, 0xEE), (194, 0xF4),
            (195, 0xFB), (196, 0xC2), (197, 0xCA), (198, 0xCE), (199, 0xD4),
            (200, 0xDB), (201, 0xE5), (202, 0xC5), (203, 0xF8), (204, 0xD8),
            (205, 0xE3), (206, 0xF1), (207, 0xF5), (208, 0xC3), (209, 0xD1),
            (210, 0xD5), (211, 0xE6), (212, 0xC6), (213, 0xE7), (214, 0xC7),
            (215, 0xFE), (216, 0xF0), (217, 0xDE), (218, 0xD0), (219, 0xA3),
            (220, 0x153), (221, 0x152), (222, 0xA1), (223, 0xBF),
        ];
        pairs
            .iter()
            .map(|&(z, u)| (z, char::from_u32(u).unwrap()))
            .collect()
    };
}

/// Everything the codec needs from the story image, bundled so callers
/// don't thread five addresses through every call.
pub struct TextEnv<'a> {
    pub mem: &'a Memory,
    pub version: u8,
    pub abbrev_addr: usize,
    pub alphabet_addr: usize,
    pub unicode_addr: usize,
}

impl<'a> TextEnv<'a> {
    pub fn from_memory(mem: &'a Memory) -> Self {
        let header = Header::new(mem);
        let version = header.version();
        TextEnv {
            mem,
            version,
            abbrev_addr: header.abbrev_addr(),
            alphabet_addr: if version >= 5 {
                header.alphabet_table_addr()
            } else {
                0
            },
            unicode_addr: header.unicode_table_addr(),
        }
    }

    fn alphabets(&self) -> [String; 3] {
        if self.alphabet_addr != 0 {
            let base = self.alphabet_addr;
            let row = |n: usize| {
                (0..26)
                    .map(|i| self.mem.u8(base + n * 26 + i) as char)
                    .collect::<String>()
            };
            return [row(0), row(1), row(2)];
        }
        let a2 = if self.version == 1 {
            ALPHABET_A2_V1
        } else {
            ALPHABET_A2
        };
        [
            ALPHABET_A0.to_string(),
            ALPHABET_A1.to_string(),
            a2.to_string(),
        ]
    }

    /// Map one ZSCII code to its display character. `None` means the code
    /// produces no output.
    pub fn zscii_to_unicode(&self, code: u16) -> Option<char> {
        match code {
            0 => None,
            13 => Some('\n'),
            32..=126 => Some(code as u8 as char),
            155..=251 => {
                if self.unicode_addr != 0 {
                    let count = self.mem.u8(self.unicode_addr) as u16;
                    let index = code - 155;
                    if index < count {
                        let unit = self.mem.u16(self.unicode_addr + 1 + 2 * index as usize);
                        char::from_u32(unit as u32).or(Some('?'))
                    } else {
                        Some('?')
                    }
                } else {
                    DEFAULT_UNICODE_TABLE.get(&code).copied().or(Some('?'))
                }
            }
            _ => None,
        }
    }

    /// Decode the packed string at `addr`. Returns the text and the
    /// number of bytes consumed.
    pub fn decode_string(&self, addr: usize) -> Result<(String, usize), String> {
        self.decode_with_depth(addr, 0)
    }

    fn decode_with_depth(&self, addr: usize, depth: u8) -> Result<(String, usize), String> {
        if depth > ABBREV_DEPTH_LIMIT {
            return Err(format!(
                "abbreviation nesting exceeds {ABBREV_DEPTH_LIMIT} at {addr:#06x}"
            ));
        }

        let (zchars, consumed) = self.collect_zchars(addr)?;
        let alphabets = self.alphabets();

        let mut text = String::new();
        let mut current: usize = 0;
        let mut previous: usize = 0;
        let mut temp_shift: u8 = 0;
        let mut abbrev_bank: u8 = 0;
        let mut escape = Escape::None;

        for zc in zchars {
            if abbrev_bank > 0 {
                let index = 32 * (abbrev_bank - 1) + zc;
                text.push_str(&self.expand_abbrev(index, depth)?);
                abbrev_bank = 0;
            } else if let Escape::High = escape {
                escape = Escape::Low((zc as u16) << 5);
            } else if let Escape::Low(high) = escape {
                if let Some(ch) = self.zscii_to_unicode(high | zc as u16) {
                    text.push(ch);
                }
                escape = Escape::None;
            } else if zc == 0 {
                text.push(' ');
            } else if zc == 6 && current == 2 {
                escape = Escape::High;
            } else if zc == 7 && current == 2 && self.version > 1 {
                text.push('\n');
            } else if self.version < 3 {
                match zc {
                    1 => {
                        if self.version == 1 {
                            text.push('\n');
                        } else {
                            abbrev_bank = zc;
                        }
                    }
                    2..=5 => {
                        previous = current;
                        current = shift_rotate(current, zc);
                        // 2/3 shift one character; 4/5 lock
                        temp_shift = if zc <= 3 { 1 } else { 0 };
                    }
                    _ => push_alphabet_char(&mut text, &alphabets, current, zc),
                }
            } else {
                match zc {
                    1..=3 => abbrev_bank = zc,
                    4 => {
                        current = 1;
                        temp_shift = 1;
                    }
                    5 => {
                        current = 2;
                        temp_shift = 1;
                    }
                    _ => push_alphabet_char(&mut text, &alphabets, current, zc),
                }
            }

            // A temporary shift covers exactly one alphabet lookup, then
            // reverts (to the previous alphabet in v1/v2, to A0 in v3+).
            if temp_shift == 2 {
                current = if self.version < 3 { previous } else { 0 };
                temp_shift = 0;
            } else if temp_shift > 0 {
                temp_shift += 1;
            }
        }

        Ok((text, consumed))
    }

    fn collect_zchars(&self, addr: usize) -> Result<(Vec<u8>, usize), String> {
        let mut zchars = Vec::new();
        let mut offset = addr;
        loop {
            if offset + 1 >= self.mem.len() {
                return Err(format!(
                    "packed string at {addr:#06x} runs past end of memory"
                ));
            }
            let word = [self.mem.u8(offset), self.mem.u8(offset + 1)];
            offset += 2;

            let mut reader = BitReader::new(&word);
            let last = reader
                .read_u8(1)
                .map_err(|e| format!("bit unpack failed: {e}"))? == 1;
            for _ in 0..3 {
                zchars.push(
                    reader
                        .read_u8(5)
                        .map_err(|e| format!("bit unpack failed: {e}"))?,
                );
            }
            if last {
                return Ok((zchars, offset - addr));
            }
        }
    }

    fn expand_abbrev(&self, index: u8, depth: u8) -> Result<String, String> {
        if index >= MAX_ABBREV_INDEX {
            return Err(format!("bad abbreviation index: {index}"));
        }
        let entry_addr = self.abbrev_addr + 2 * index as usize;
        let string_addr = self.mem.u16(entry_addr) as usize * 2;
        let (expansion, _) = self.decode_with_depth(string_addr, depth + 1)?;
        Ok(expansion)
    }

    /// Encode `word` into `resolution` Z-characters packed into words,
    /// the form dictionary keys take (6 chars in v1-3, 9 in v4+).
    /// Characters outside the alphabets become 10-bit ZSCII escapes.
    pub fn encode_word(&self, word: &str, resolution: usize) -> Vec<u16> {
        let alphabets = self.alphabets();
        let shift_a1 = if self.version < 3 { 2 } else { 4 };
        let shift_a2 = if self.version < 3 { 3 } else { 5 };

        let mut zchars: Vec<u8> = Vec::new();
        for ch in word.chars() {
            if zchars.len() >= resolution {
                break;
            }
            if let Some(i) = alphabets[0].find(ch) {
                zchars.push(i as u8 + 6);
            } else if let Some(i) = alphabets[1].find(ch) {
                zchars.push(shift_a1);
                zchars.push(i as u8 + 6);
            } else if let Some(i) = alphabets[2].find(ch).filter(|&i| i > 1) {
                zchars.push(shift_a2);
                zchars.push(i as u8 + 6);
            } else {
                // 10-bit escape (only 8 bits ever used in practice)
                let code = ch as u32 & 0xFF;
                zchars.push(shift_a2);
                zchars.push(6);
                zchars.push((code >> 5) as u8);
                zchars.push((code & 0x1F) as u8);
            }
        }

        zchars.truncate(resolution);
        while zchars.len() < resolution {
            zchars.push(5);
        }

        let mut words = Vec::with_capacity(resolution / 3);
        for group in zchars.chunks(3) {
            words.push(((group[0] as u16) << 10) | ((group[1] as u16) << 5) | group[2] as u16);
        }
        if let Some(last) = words.last_mut() {
            *last |= 0x8000;
        }
        words
    }
}

enum Escape {
    None,
    High,
    Low(u16),
}

fn push_alphabet_char(text: &mut String, alphabets: &[String; 3], current: usize, zc: u8) {
    if let Some(ch) = alphabets[current].chars().nth(zc as usize - 6) {
        text.push(ch);
    }
}

/// v1/v2 shift rotation: codes 2/4 step forward through A0-A1-A2, codes
/// 3/5 step backward.
fn shift_rotate(current: usize, zc: u8) -> usize {
    match zc {
        2 | 4 => (current + 1) % 3,
        _ => (current + 2) % 3,
    }
}
