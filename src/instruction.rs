//! Instruction decoding: from a PC, produce a fully-parsed instruction
//! record (form, opcode, operands, store target, branch target, inline
//! text, and the address of the next instruction).

use crate::memory::Memory;
use crate::text::TextEnv;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// 2-byte constant
    Large,
    /// 1-byte constant
    Small,
    /// 1-byte variable index, dereferenced at dispatch
    Variable,
    Omitted,
}

impl OperandType {
    pub fn from_bits(bits: u8) -> OperandType {
        match bits & 0x03 {
            0b00 => OperandType::Large,
            0b01 => OperandType::Small,
            0b10 => OperandType::Variable,
            _ => OperandType::Omitted,
        }
    }

    /// The four 2-bit fields of a VAR-form type byte, high bits first.
    pub fn from_type_byte(byte: u8) -> [OperandType; 4] {
        [
            OperandType::from_bits(byte >> 6),
            OperandType::from_bits(byte >> 4),
            OperandType::from_bits(byte >> 2),
            OperandType::from_bits(byte),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpForm {
    Long,
    Short,
    Var,
    Ext,
}

/// Decoded branch data. Offsets 0 and 1 are "return false/true" and are
/// carried in `returns`; anything else resolves to a target address.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    /// Branch when the test result equals this
    pub condition: bool,
    pub address: Option<usize>,
    pub returns: Option<u16>,
}

/// A fully decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub addr: usize,
    /// Flat opcode number: 2OP 1-31, 1OP 128-143, 0OP 176-191,
    /// VAR 224-255, EXT 1000+
    pub opcode: u16,
    pub name: &'static str,
    pub form: OpForm,
    pub optypes: Vec<OperandType>,
    pub operands: Vec<u16>,
    pub store: Option<u8>,
    pub branch: Option<Branch>,
    pub text: Option<String>,
    /// Address just past this instruction
    pub next: usize,
}

impl Instruction {
    pub fn decode(mem: &Memory, addr: usize, version: u8) -> Result<Instruction, String> {
        if addr >= mem.len() {
            return Err(format!("instruction address {addr:#06x} out of bounds"));
        }

        let raw = mem.u8(addr);
        let form = match raw {
            0xBE => OpForm::Ext,
            _ => match raw >> 6 {
                0b11 => OpForm::Var,
                0b10 => OpForm::Short,
                _ => OpForm::Long,
            },
        };

        let mut optypes: Vec<OperandType> = Vec::new();
        let opcode: u16;
        let mut pointer = addr + 1;

        match form {
            OpForm::Long => {
                opcode = (raw & 0x1F) as u16;
                if opcode == 0 {
                    return Err(format!("invalid long-form opcode 0 at {addr:#06x}"));
                }
                for shift in [6u8, 5] {
                    optypes.push(if raw >> shift & 1 != 0 {
                        OperandType::Variable
                    } else {
                        OperandType::Small
                    });
                }
            }
            OpForm::Short => {
                let op_type = OperandType::from_bits(raw >> 4);
                if op_type == OperandType::Omitted {
                    opcode = (raw & 0x0F) as u16 + 176;
                } else {
                    opcode = (raw & 0x0F) as u16 + 128;
                    optypes.push(op_type);
                }
            }
            OpForm::Var => {
                opcode = if raw & 0x20 != 0 {
                    (raw & 0x1F) as u16 + 224
                } else {
                    (raw & 0x1F) as u16
                };
                optypes.extend(OperandType::from_type_byte(mem.u8(pointer)));
                pointer += 1;
                // call_vs2/call_vn2 carry a second type byte (up to 8
                // operands)
                if raw == 0xEC || raw == 0xFA {
                    optypes.extend(OperandType::from_type_byte(mem.u8(pointer)));
                    pointer += 1;
                }
            }
            OpForm::Ext => {
                opcode = mem.u8(pointer) as u16 + 1000;
                pointer += 1;
                optypes.extend(OperandType::from_type_byte(mem.u8(pointer)));
                pointer += 1;
            }
        }

        // Operands stop at the first omitted type
        if let Some(end) = optypes.iter().position(|&t| t == OperandType::Omitted) {
            optypes.truncate(end);
        }

        let mut read = mem.reader(pointer);
        let mut operands = Vec::with_capacity(optypes.len());
        for &op_type in &optypes {
            operands.push(match op_type {
                OperandType::Large => read.word(),
                _ => read.byte() as u16,
            });
        }

        let store = if does_store(opcode, version) {
            Some(read.byte())
        } else {
            None
        };

        let branch = if does_branch(opcode, version) {
            let first = read.byte();
            let condition = first & 0x80 != 0;
            let offset: i32 = if first & 0x40 != 0 {
                (first & 0x3F) as i32
            } else {
                let mut long = (((first & 0x3F) as i32) << 8) | read.byte() as i32;
                if long >= 0x2000 {
                    long -= 0x4000;
                }
                long
            };
            Some(match offset {
                0 => Branch {
                    condition,
                    address: None,
                    returns: Some(0),
                },
                1 => Branch {
                    condition,
                    address: None,
                    returns: Some(1),
                },
                _ => Branch {
                    condition,
                    address: Some((read.position as i32 + offset - 2) as usize),
                    returns: None,
                },
            })
        } else {
            None
        };

        let text = if does_text(opcode) {
            let env = TextEnv::from_memory(mem);
            let (string, length) = env.decode_string(read.position)?;
            read.position += length;
            Some(string)
        } else {
            None
        };

        Ok(Instruction {
            addr,
            opcode,
            name: opcode_name(opcode, version),
            form,
            optypes,
            operands,
            store,
            branch,
            text,
            next: read.position,
        })
    }
}

/// Does this opcode take a store byte? Several assignments moved between
/// versions, so the answer is version-aware.
pub fn does_store(opcode: u16, version: u8) -> bool {
    match opcode {
        // 2OP
        8 | 9 | 15 | 16 | 17 | 18 | 19 | 20 | 21 | 22 | 23 | 24 | 25 => true,
        // 1OP
        129 | 130 | 131 | 132 | 136 | 142 => true,
        143 => version <= 4, // not; call_1n in v5+ discards
        // 0OP: save/restore store in v4 only; catch in v5+
        181 | 182 => version == 4,
        185 => version >= 5,
        // VAR
        224 | 231 | 236 | 246 | 247 | 248 => true,
        228 => version >= 5, // aread returns the terminator
        // EXT
        1000 | 1001 | 1002 | 1003 | 1004 | 1009 | 1010 | 1012 => true,
        _ => false,
    }
}

/// Does this opcode carry branch data?
pub fn does_branch(opcode: u16, version: u8) -> bool {
    match opcode {
        1 | 2 | 3 | 4 | 5 | 6 | 7 | 10 => true,
        128 | 129 | 130 => true,
        189 | 191 => true,
        181 | 182 => version < 4, // save/restore branch in v1-3
        247 | 255 => true,        // scan_table, check_arg_count
        1006 | 1024 | 1027 => true, // stubbed picture/menu opcodes still consume branch bytes
        _ => false,
    }
}

/// print and print_ret carry an inline packed string.
pub fn does_text(opcode: u16) -> bool {
    opcode == 178 || opcode == 179
}

pub fn opcode_name(opcode: u16, version: u8) -> &'static str {
    match opcode {
        1 => "je",
        2 => "jl",
        3 => "jg",
        4 => "dec_chk",
        5 => "inc_chk",
        6 => "jin",
        7 => "test",
        8 => "or",
        9 => "and",
        10 => "test_attr",
        11 => "set_attr",
        12 => "clear_attr",
        13 => "store",
        14 => "insert_obj",
        15 => "loadw",
        16 => "loadb",
        17 => "get_prop",
        18 => "get_prop_addr",
        19 => "get_next_prop",
        20 => "add",
        21 => "sub",
        22 => "mul",
        23 => "div",
        24 => "mod",
        25 => "call_2s",
        26 => "call_2n",
        27 => "set_colour",
        28 => "throw",
        128 => "jz",
        129 => "get_sibling",
        130 => "get_child",
        131 => "get_parent",
        132 => "get_prop_len",
        133 => "inc",
        134 => "dec",
        135 => "print_addr",
        136 => "call_1s",
        137 => "remove_obj",
        138 => "print_obj",
        139 => "ret",
        140 => "jump",
        141 => "print_paddr",
        142 => "load",
        143 => {
            if version <= 4 {
                "not"
            } else {
                "call_1n"
            }
        }
        176 => "rtrue",
        177 => "rfalse",
        178 => "print",
        179 => "print_ret",
        180 => "nop",
        181 => "save",
        182 => "restore",
        183 => "restart",
        184 => "ret_popped",
        185 => {
            if version <= 4 {
                "pop"
            } else {
                "catch"
            }
        }
        186 => "quit",
        187 => "new_line",
        188 => "show_status",
        189 => "verify",
        191 => "piracy",
        224 => {
            if version <= 3 {
                "call"
            } else {
                "call_vs"
            }
        }
        225 => "storew",
        226 => "storeb",
        227 => "put_prop",
        228 => {
            if version <= 4 {
                "sread"
            } else {
                "aread"
            }
        }
        229 => "print_char",
        230 => "print_num",
        231 => "random",
        232 => "push",
        233 => "pull",
        234 => "split_window",
        235 => "set_window",
        236 => "call_vs2",
        237 => "erase_window",
        238 => "erase_line",
        239 => "set_cursor",
        240 => "get_cursor",
        241 => "set_text_style",
        242 => "buffer_mode",
        243 => "output_stream",
        244 => "input_stream",
        245 => "sound_effect",
        246 => "read_char",
        247 => "scan_table",
        248 => "not",
        249 => "call_vn",
        250 => "call_vn2",
        251 => "tokenise",
        252 => "encode_text",
        253 => "copy_table",
        254 => "print_table",
        255 => "check_arg_count",
        1000 => "save",
        1001 => "restore",
        1002 => "log_shift",
        1003 => "art_shift",
        1004 => "set_font",
        1009 => "save_undo",
        1010 => "restore_undo",
        1011 => "print_unicode",
        1012 => "check_unicode",
        _ => "unknown",
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}: {}", self.addr, self.name)?;
        for (i, op) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match self.optypes[i] {
                OperandType::Variable => write!(f, "{sep}V{op:02x}")?,
                _ => write!(f, "{sep}#{op:04x}")?,
            }
        }
        if let Some(store) = self.store {
            write!(f, " -> V{store:02x}")?;
        }
        if let Some(branch) = &self.branch {
            let sense = if branch.condition { "TRUE" } else { "FALSE" };
            match (branch.returns, branch.address) {
                (Some(0), _) => write!(f, " [{sense} RFALSE]")?,
                (Some(_), _) => write!(f, " [{sense} RTRUE]")?,
                (_, Some(target)) => write!(f, " [{sense} {target:#06x}]")?,
                _ => {}
            }
        }
        Ok(())
    }
}
