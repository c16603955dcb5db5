//! Dictionary loading and input tokenization.
//!
//! The dictionary is parsed once after load into an address map keyed by
//! the decoded entry text. Tokenizing splits player input on spaces and
//! on the story's separator characters; separators are tokens in their
//! own right and get their own parse-buffer records.

use crate::vm::ZMachine;
use indexmap::IndexMap;
use log::debug;

/// A token located in the input buffer: dictionary address (0 when
/// unknown), length in characters, character offset within the text.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub dict_addr: usize,
    pub length: usize,
    pub offset: usize,
}

impl ZMachine {
    /// Key length in characters: dictionary entries resolve 6 Z-chars in
    /// v1-3, 9 in v4+.
    fn dict_key_length(&self) -> usize {
        if self.version <= 3 {
            6
        } else {
            9
        }
    }

    /// Parse the dictionary block at `addr` into separators and a
    /// decoded-text -> entry-address map.
    pub fn parse_dictionary_at(
        &self,
        addr: usize,
    ) -> Result<(Vec<u8>, IndexMap<String, usize>), String> {
        let mut read = self.memory.reader(addr);
        let separator_count = read.byte() as usize;
        let mut separators = Vec::with_capacity(separator_count);
        for _ in 0..separator_count {
            separators.push(read.byte());
        }
        let entry_length = read.byte() as usize;
        let entry_count = read.word() as usize;
        if entry_length == 0 && entry_count > 0 {
            return Err(format!("dictionary at {addr:#06x} has zero entry length"));
        }

        let mut entries = IndexMap::with_capacity(entry_count);
        let first_entry = read.position;
        for n in 0..entry_count {
            let entry_addr = first_entry + n * entry_length;
            let (text, _) = self.text_env().decode_string(entry_addr)?;
            entries.insert(text, entry_addr);
        }
        Ok((separators, entries))
    }

    /// Load the story's main dictionary. Called once from `new`.
    pub fn populate_dictionary(&mut self) -> Result<(), String> {
        let (separators, entries) = self.parse_dictionary_at(self.header().dict_addr())?;
        self.separators = separators;
        self.dictionary = entries;
        Ok(())
    }

    /// Look `word` up in the main dictionary; 0 when absent. Both the
    /// stored keys and the probe are truncated to the key length.
    pub fn check_dictionary(&self, word: &str) -> usize {
        let truncated: String = word.chars().take(self.dict_key_length()).collect();
        self.dictionary.get(&truncated).copied().unwrap_or(0)
    }

    /// Split `text` into tokens. Spaces separate and are dropped;
    /// separator characters separate and are kept as one-character
    /// tokens.
    pub fn split_input<'t>(&self, text: &'t str, separators: &[u8]) -> Vec<(&'t str, usize)> {
        let bytes = text.as_bytes();
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b' ' {
                i += 1;
            } else if separators.contains(&bytes[i]) {
                tokens.push((&text[i..i + 1], i));
                i += 1;
            } else {
                let start = i;
                while i < bytes.len() && bytes[i] != b' ' && !separators.contains(&bytes[i]) {
                    i += 1;
                }
                tokens.push((&text[start..i], start));
            }
        }
        tokens
    }

    /// Tokenize `text` into the parse buffer at `parse_addr`. With a
    /// `dictionary` override (the `tokenise` opcode) that dictionary's
    /// entries and separators are used instead of the story's main one.
    /// With `skip_unknown` set, records for unrecognized words are left
    /// untouched rather than zeroed.
    pub fn tokenise(
        &mut self,
        text: &str,
        parse_addr: usize,
        dictionary: Option<usize>,
        skip_unknown: bool,
    ) -> Result<(), String> {
        let start_offset = if self.version <= 4 { 1 } else { 2 };
        let key_length = self.dict_key_length();

        let override_dict = match dictionary {
            Some(addr) if addr != 0 => Some(self.parse_dictionary_at(addr)?),
            _ => None,
        };
        let separators: Vec<u8> = match &override_dict {
            Some((seps, _)) => seps.clone(),
            None => self.separators.clone(),
        };

        let tokens: Vec<Token> = self
            .split_input(text, &separators)
            .into_iter()
            .map(|(word, offset)| {
                let dict_addr = match &override_dict {
                    Some((_, entries)) => {
                        let truncated: String = word.chars().take(key_length).collect();
                        entries.get(&truncated).copied().unwrap_or(0)
                    }
                    None => self.check_dictionary(word),
                };
                Token {
                    dict_addr,
                    length: word.len(),
                    offset: offset + start_offset,
                }
            })
            .collect();

        let capacity = self.memory.u8(parse_addr) as usize;
        let count = tokens.len().min(capacity);
        debug!(
            "tokenise {:?} -> {} tokens ({} written) at parse buffer {:#06x}",
            text,
            tokens.len(),
            count,
            parse_addr
        );

        self.write_u8(parse_addr + 1, count as u8)?;
        for (i, token) in tokens.iter().take(count).enumerate() {
            let record = parse_addr + 2 + i * 4;
            if token.dict_addr == 0 && skip_unknown {
                continue;
            }
            self.write_u16(record, token.dict_addr as u16)?;
            self.write_u8(record + 2, token.length as u8)?;
            self.write_u8(record + 3, token.offset as u8)?;
        }
        Ok(())
    }

    /// Read back the player text stored in a text buffer, for the
    /// `tokenise` opcode which re-parses an already-filled buffer.
    pub fn read_text_buffer(&self, text_addr: usize) -> String {
        let mut text = String::new();
        if self.version <= 4 {
            let mut addr = text_addr + 1;
            loop {
                let b = self.memory.u8(addr);
                if b == 0 {
                    break;
                }
                text.push(b as char);
                addr += 1;
            }
        } else {
            let length = self.memory.u8(text_addr + 1) as usize;
            for i in 0..length {
                text.push(self.memory.u8(text_addr + 2 + i) as char);
            }
        }
        text
    }
}
