//! Typed view over the 64-byte story header.

use crate::memory::Memory;
use std::fmt;

/// How a v1-3 story wants its status line drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLineType {
    Score,
    TimeBased,
}

/// Interpretation of the flag1 byte for v1-3 stories.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flag1V3 {
    pub time_based_status: bool,
    pub two_disc_story: bool,
    pub tandy_bit: bool,
    pub status_line_unavailable: bool,
    pub screen_splitting: bool,
    pub variable_pitch_default: bool,
}

/// Interpretation of the flag1 byte for v4+ stories.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flag1V4 {
    pub colors_available: bool,
    pub pictures_available: bool,
    pub bold_available: bool,
    pub italic_available: bool,
    pub fixed_pitch_available: bool,
    pub sound_available: bool,
    pub timed_input_available: bool,
}

/// Borrowed view over the header region of story memory. Owns nothing;
/// every accessor reads the live image, so runtime writes to the header
/// (flag2) are always visible.
pub struct Header<'a> {
    mem: &'a Memory,
}

impl<'a> Header<'a> {
    pub fn new(mem: &'a Memory) -> Self {
        Header { mem }
    }

    pub fn version(&self) -> u8 {
        self.mem.u8(0x00)
    }

    pub fn release(&self) -> u16 {
        self.mem.u16(0x02)
    }

    pub fn high_memory_addr(&self) -> usize {
        self.mem.u16(0x04) as usize
    }

    pub fn initial_pc(&self) -> usize {
        self.mem.u16(0x06) as usize
    }

    pub fn dict_addr(&self) -> usize {
        self.mem.u16(0x08) as usize
    }

    /// Stored object table base. The property-defaults table lives here;
    /// the object records follow it (see `object`).
    pub fn object_table_addr(&self) -> usize {
        self.mem.u16(0x0A) as usize
    }

    pub fn global_variable_addr(&self) -> usize {
        self.mem.u16(0x0C) as usize
    }

    pub fn static_memory_addr(&self) -> usize {
        self.mem.u16(0x0E) as usize
    }

    pub fn flag1_raw(&self) -> u8 {
        self.mem.u8(0x01)
    }

    pub fn flag2_raw(&self) -> u16 {
        self.mem.u16(0x10)
    }

    pub fn serial_number(&self) -> [u8; 6] {
        let mut serial = [0u8; 6];
        for (i, b) in serial.iter_mut().enumerate() {
            *b = self.mem.u8(0x12 + i);
        }
        serial
    }

    pub fn abbrev_addr(&self) -> usize {
        self.mem.u16(0x18) as usize
    }

    /// File length in bytes. The stored word is scaled by a
    /// version-dependent multiplier.
    pub fn file_length(&self) -> usize {
        let stored = self.mem.u16(0x1A) as usize;
        match self.version() {
            1..=3 => stored * 2,
            4..=5 => stored * 4,
            _ => stored * 8,
        }
    }

    pub fn checksum(&self) -> u16 {
        self.mem.u16(0x1C)
    }

    pub fn routine_offset(&self) -> usize {
        self.mem.u16(0x28) as usize
    }

    pub fn string_offset(&self) -> usize {
        self.mem.u16(0x2A) as usize
    }

    pub fn terminator_chars_addr(&self) -> usize {
        self.mem.u16(0x2E) as usize
    }

    /// Custom alphabet table (3 x 26 bytes), 0 when absent. v5+.
    pub fn alphabet_table_addr(&self) -> usize {
        self.mem.u16(0x34) as usize
    }

    pub fn extension_table_addr(&self) -> usize {
        self.mem.u16(0x36) as usize
    }

    /// Custom ZSCII-to-Unicode translation table from the header
    /// extension, 0 when absent.
    pub fn unicode_table_addr(&self) -> usize {
        let ext = self.extension_table_addr();
        if ext == 0 {
            return 0;
        }
        let ext_len = self.mem.u16(ext) as usize;
        if ext_len >= 3 {
            self.mem.u16(ext + 3 * 2) as usize
        } else {
            0
        }
    }

    pub fn status_line_type(&self) -> StatusLineType {
        if self.flag1_raw() & 0x02 != 0 {
            StatusLineType::TimeBased
        } else {
            StatusLineType::Score
        }
    }

    pub fn flag1_v3(&self) -> Flag1V3 {
        let f = self.flag1_raw();
        Flag1V3 {
            time_based_status: f & 0x02 != 0,
            two_disc_story: f & 0x04 != 0,
            tandy_bit: f & 0x08 != 0,
            status_line_unavailable: f & 0x10 != 0,
            screen_splitting: f & 0x20 != 0,
            variable_pitch_default: f & 0x40 != 0,
        }
    }

    pub fn flag1_v4(&self) -> Flag1V4 {
        let f = self.flag1_raw();
        Flag1V4 {
            colors_available: f & 0x01 != 0,
            pictures_available: f & 0x02 != 0,
            bold_available: f & 0x04 != 0,
            italic_available: f & 0x08 != 0,
            fixed_pitch_available: f & 0x10 != 0,
            sound_available: f & 0x20 != 0,
            timed_input_available: f & 0x80 != 0,
        }
    }

    pub fn transcripting_on(&self) -> bool {
        self.flag2_raw() & 0x01 != 0
    }

    /// Sanity-check the header against the actual byte count. Called once
    /// at load; violations are fatal (malformed story).
    pub fn validate(&self, byte_count: usize) -> Result<(), String> {
        let version = self.version();
        if !(1..=8).contains(&version) || version == 6 {
            return Err(format!("unsupported story file version: {version}"));
        }
        if byte_count < 0x40 {
            return Err(format!("story file too small for a header: {byte_count} bytes"));
        }
        let file_length = self.file_length();
        // A zero length word is tolerated (some ancient files omit it).
        if file_length > 0 && file_length > byte_count {
            return Err(format!(
                "header claims {file_length} bytes but file has {byte_count}"
            ));
        }
        if self.static_memory_addr() > byte_count {
            return Err(format!(
                "static memory base {:#06x} beyond end of file",
                self.static_memory_addr()
            ));
        }
        Ok(())
    }
}

impl<'a> fmt::Display for Header<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let serial = self.serial_number();
        write!(
            f,
            "
Z-code version:           {}
Release number:           {}
Serial number:            {}
Start PC:                 {:#06x}
Dictionary address:       {:#06x}
Object table address:     {:#06x}
Global variables address: {:#06x}
Size of dynamic memory:   {:#06x}
Abbreviations address:    {:#06x}
File size:                {:#06x}
Checksum:                 {:#06x}
",
            self.version(),
            self.release(),
            serial.iter().map(|&b| b as char).collect::<String>(),
            self.initial_pc(),
            self.dict_addr(),
            self.object_table_addr(),
            self.global_variable_addr(),
            self.static_memory_addr(),
            self.abbrev_addr(),
            self.file_length(),
            self.checksum(),
        )
    }
}
