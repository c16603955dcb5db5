//! Machine state: story memory, the frame stack, variable addressing and
//! the fetch/decode/dispatch loop.

use crate::header::{Header, StatusLineType};
use crate::instruction::{Branch, Instruction, OperandType};
use crate::memory::Memory;
use crate::ops;
use crate::text::TextEnv;
use crate::ui::ZUI;
use crate::zrand::ZRand;

use indexmap::IndexMap;
use log::debug;

/// A routine may declare at most 15 locals.
pub const MAX_LOCALS: usize = 15;

/// How many in-memory undo states `save_undo` keeps before evicting the
/// oldest.
const UNDO_SLOTS: usize = 16;

/// One routine activation: locals, its own evaluation stack, and where to
/// resume (and store) when it returns. The bottom frame has no return
/// address and never pops.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// PC to resume at after this frame returns
    pub resume: usize,
    /// Variable the return value goes to (None = discard)
    pub store: Option<u8>,
    pub locals: Vec<u16>,
    pub stack: Vec<u16>,
    /// How many arguments the caller supplied (for check_arg_count)
    pub arg_count: usize,
}

impl Frame {
    /// Build a frame from declared local defaults, with the caller's
    /// arguments overwriting the first locals.
    pub fn new(resume: usize, store: Option<u8>, mut locals: Vec<u16>, args: &[u16]) -> Frame {
        let arg_count = args.len();
        for (local, &arg) in locals.iter_mut().zip(args.iter()) {
            *local = arg;
        }
        Frame {
            resume,
            store,
            locals,
            stack: Vec::new(),
            arg_count,
        }
    }

    pub fn initial() -> Frame {
        Frame::new(0, None, Vec::new(), &[])
    }

    pub fn read_local(&self, index: usize) -> Result<u16, String> {
        self.locals
            .get(index)
            .copied()
            .ok_or_else(|| format!("read of undeclared local {}", index + 1))
    }

    pub fn write_local(&mut self, index: usize, value: u16) -> Result<(), String> {
        match self.locals.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(format!("write to undeclared local {}", index + 1)),
        }
    }

    pub fn stack_push(&mut self, value: u16) {
        self.stack.push(value);
    }

    pub fn stack_pop(&mut self) -> Result<u16, String> {
        self.stack.pop().ok_or_else(|| "stack underflow".to_string())
    }

    pub fn stack_peek(&self) -> Result<u16, String> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| "peek of empty stack".to_string())
    }

    /// Serialize in the Quetzal Stks wire layout: return PC (3 bytes),
    /// flags (bits 0-3 locals count, bit 4 set when the result is
    /// discarded), store byte (always present), argument mask, stack
    /// length, locals, stack words. All big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 2 * (self.locals.len() + self.stack.len()));
        bytes.push((self.resume >> 16) as u8);
        bytes.push((self.resume >> 8) as u8);
        bytes.push(self.resume as u8);

        let mut flags = self.locals.len() as u8;
        if self.store.is_none() {
            flags |= 0x10;
        }
        bytes.push(flags);
        bytes.push(self.store.unwrap_or(0));

        let mut arg_mask = 0u8;
        for bit in 0..self.arg_count.min(7) {
            arg_mask |= 1 << bit;
        }
        bytes.push(arg_mask);

        bytes.extend_from_slice(&(self.stack.len() as u16).to_be_bytes());
        for &local in &self.locals {
            bytes.extend_from_slice(&local.to_be_bytes());
        }
        for &value in &self.stack {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        bytes
    }

    /// Parse one frame record; returns the frame and the bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Result<(Frame, usize), String> {
        if data.len() < 8 {
            return Err("frame record truncated in header".to_string());
        }
        let resume = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | data[2] as usize;
        let flags = data[3];
        let num_locals = (flags & 0x0F) as usize;
        let store = if flags & 0x10 == 0 {
            Some(data[4])
        } else {
            None
        };
        let arg_mask = data[5];
        if arg_mask & 0x80 != 0 {
            return Err(format!("reserved bit set in argument mask: {arg_mask:#04x}"));
        }
        let arg_count = arg_mask.count_ones() as usize;
        let stack_length = ((data[6] as usize) << 8) | data[7] as usize;

        let total = 8 + 2 * (num_locals + stack_length);
        if data.len() < total {
            return Err("frame record truncated in body".to_string());
        }

        let mut locals = Vec::with_capacity(num_locals);
        let mut offset = 8;
        for _ in 0..num_locals {
            locals.push(((data[offset] as u16) << 8) | data[offset + 1] as u16);
            offset += 2;
        }
        let mut stack = Vec::with_capacity(stack_length);
        for _ in 0..stack_length {
            stack.push(((data[offset] as u16) << 8) | data[offset + 1] as u16);
            offset += 2;
        }

        let mut frame = Frame::new(resume, store, locals, &[]);
        frame.stack = stack;
        frame.arg_count = arg_count;
        Ok((frame, total))
    }
}

/// The Z-machine proper. Owns the story image and all mutable run state;
/// talks to the host only through the `ZUI` boundary.
pub struct ZMachine {
    pub memory: Memory,
    pub version: u8,
    pub pc: usize,
    pub frames: Vec<Frame>,
    pub rng: ZRand,
    pub ui: Box<dyn ZUI>,
    pub running: bool,
    /// Dynamic memory exactly as loaded, for restart and CMem diffing
    pub original_dynamic: Vec<u8>,
    /// Decoded dictionary key -> entry address, in story order
    pub dictionary: IndexMap<String, usize>,
    pub separators: Vec<u8>,
    /// In-memory save states for save_undo/restore_undo
    pub undo_states: Vec<Vec<u8>>,
    pub obj_size: usize,
    pub attr_width: usize,
}

impl ZMachine {
    pub fn new(story: Vec<u8>, ui: Box<dyn ZUI>, seed: Option<u64>) -> Result<ZMachine, String> {
        let memory = Memory::new(story);
        let header = Header::new(&memory);
        header.validate(memory.len())?;

        let version = header.version();
        let initial_pc = header.initial_pc();
        let static_addr = header.static_memory_addr();
        let original_dynamic = memory.slice(0, static_addr).to_vec();

        let rng = match seed {
            Some(seed) => ZRand::new_seeded(seed),
            None => ZRand::new_uniform(),
        };

        let mut zm = ZMachine {
            memory,
            version,
            pc: initial_pc,
            frames: vec![Frame::initial()],
            rng,
            ui,
            running: false,
            original_dynamic,
            dictionary: IndexMap::new(),
            separators: Vec::new(),
            undo_states: Vec::new(),
            obj_size: if version <= 3 { 9 } else { 14 },
            attr_width: if version <= 3 { 4 } else { 6 },
        };
        zm.populate_dictionary()?;
        debug!(
            "loaded v{} story, release {}, initial pc {:#06x}, {} dictionary words",
            version,
            zm.header().release(),
            initial_pc,
            zm.dictionary.len()
        );
        Ok(zm)
    }

    pub fn header(&self) -> Header<'_> {
        Header::new(&self.memory)
    }

    pub fn text_env(&self) -> TextEnv<'_> {
        TextEnv::from_memory(&self.memory)
    }

    pub fn read_zstring(&self, addr: usize) -> Result<String, String> {
        Ok(self.text_env().decode_string(addr)?.0)
    }

    // --- Memory (dynamic-region enforcement lives here) ---

    pub fn write_u8(&mut self, addr: usize, value: u8) -> Result<(), String> {
        if addr >= self.header().static_memory_addr() {
            return Err(format!(
                "write to static memory at {addr:#06x} (pc {:#06x})",
                self.pc
            ));
        }
        self.memory.write_u8(addr, value)
    }

    pub fn write_u16(&mut self, addr: usize, value: u16) -> Result<(), String> {
        self.write_u8(addr, (value >> 8) as u8)?;
        self.write_u8(addr + 1, (value & 0xFF) as u8)
    }

    // --- Packed addresses ---

    pub fn unpack(&self, packed: u16) -> usize {
        match self.version {
            1..=3 => packed as usize * 2,
            4..=7 => packed as usize * 4,
            _ => packed as usize * 8,
        }
    }

    pub fn unpack_routine_addr(&self, packed: u16) -> usize {
        let addr = self.unpack(packed);
        if self.version == 7 {
            addr + self.header().routine_offset() * 8
        } else {
            addr
        }
    }

    pub fn unpack_string_addr(&self, packed: u16) -> usize {
        let addr = self.unpack(packed);
        if self.version == 7 {
            addr + self.header().string_offset() * 8
        } else {
            addr
        }
    }

    // --- Variables ---

    pub fn read_global(&self, index: usize) -> Result<u16, String> {
        if index > 240 {
            return Err(format!("can't read global {index}"));
        }
        Ok(self
            .memory
            .u16(self.header().global_variable_addr() + index * 2))
    }

    pub fn write_global(&mut self, index: usize, value: u16) -> Result<(), String> {
        if index > 240 {
            return Err(format!("can't write global {index}"));
        }
        let addr = self.header().global_variable_addr() + index * 2;
        self.write_u16(addr, value)
    }

    fn frame(&self) -> &Frame {
        self.frames.last().expect("frame stack is never empty")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack is never empty")
    }

    pub fn stack_push(&mut self, value: u16) {
        self.frame_mut().stack_push(value);
    }

    pub fn stack_pop(&mut self) -> Result<u16, String> {
        self.frame_mut().stack_pop()
    }

    pub fn stack_peek(&self) -> Result<u16, String> {
        self.frame().stack_peek()
    }

    /// Variable 0 pops the frame stack; 1-15 are locals; 16-255 globals.
    pub fn read_variable(&mut self, index: u8) -> Result<u16, String> {
        match index {
            0 => self.stack_pop(),
            1..=15 => self.frame().read_local(index as usize - 1),
            _ => self.read_global(index as usize - 16),
        }
    }

    /// As `read_variable` but variable 0 peeks instead of popping.
    pub fn read_indirect_variable(&mut self, index: u8) -> Result<u16, String> {
        match index {
            0 => self.stack_peek(),
            1..=15 => self.frame().read_local(index as usize - 1),
            _ => self.read_global(index as usize - 16),
        }
    }

    pub fn write_variable(&mut self, index: u8, value: u16) -> Result<(), String> {
        match index {
            0 => {
                self.stack_push(value);
                Ok(())
            }
            1..=15 => self.frame_mut().write_local(index as usize - 1, value),
            _ => self.write_global(index as usize - 16, value),
        }
    }

    /// As `write_variable` but variable 0 replaces the top of stack
    /// instead of pushing.
    pub fn write_indirect_variable(&mut self, index: u8, value: u16) -> Result<(), String> {
        if index == 0 {
            self.stack_pop()?;
            self.stack_push(value);
            Ok(())
        } else {
            self.write_variable(index, value)
        }
    }

    // --- Calls, returns, branches ---

    /// Call the routine at packed address `packed`. A packed address of 0
    /// stores 0 and falls through to the next instruction.
    pub fn call_routine(
        &mut self,
        packed: u16,
        args: &[u16],
        store: Option<u8>,
        return_pc: usize,
    ) -> Result<(), String> {
        if packed == 0 {
            if let Some(store) = store {
                self.write_variable(store, 0)?;
            }
            self.pc = return_pc;
            return Ok(());
        }

        let routine_addr = self.unpack_routine_addr(packed);
        let mut read = self.memory.reader(routine_addr);
        let count = read.byte() as usize;
        if count > MAX_LOCALS {
            return Err(format!(
                "routine at {routine_addr:#06x} declares {count} locals"
            ));
        }
        let mut locals = Vec::with_capacity(count);
        for _ in 0..count {
            // v5+ drops the initial-value words; locals start at 0
            if self.version <= 4 {
                locals.push(read.word());
            } else {
                locals.push(0);
            }
        }
        let first_instruction = read.position;

        self.frames.push(Frame::new(return_pc, store, locals, args));
        self.pc = first_instruction;
        Ok(())
    }

    /// Pop the current frame, store `value` where the caller asked, and
    /// resume the caller.
    pub fn return_from_routine(&mut self, value: u16) -> Result<(), String> {
        if self.frames.len() <= 1 {
            return Err("return from the bottom frame".to_string());
        }
        let frame = self.frames.pop().expect("checked above");
        self.pc = frame.resume;
        if let Some(store) = frame.store {
            self.write_variable(store, value)?;
        }
        Ok(())
    }

    /// Apply a decoded branch: taken when `result` matches the branch
    /// sense. Offsets 0/1 return false/true from the current routine.
    pub fn process_branch(
        &mut self,
        branch: &Branch,
        next: usize,
        result: bool,
    ) -> Result<(), String> {
        if result == branch.condition {
            match branch.returns {
                Some(value) => self.return_from_routine(value),
                None => {
                    self.pc = branch.address.expect("branch without target or return");
                    Ok(())
                }
            }
        } else {
            self.pc = next;
            Ok(())
        }
    }

    /// Store a result (if the instruction stores) and advance, branching
    /// on the truth of `value` when the instruction also branches.
    pub fn process_result(&mut self, instr: &Instruction, value: u16) -> Result<(), String> {
        if let Some(store) = instr.store {
            self.write_variable(store, value)?;
        }
        match &instr.branch {
            Some(branch) => self.process_branch(branch, instr.next, value != 0),
            None => {
                self.pc = instr.next;
                Ok(())
            }
        }
    }

    // --- Checksum / status / restart ---

    pub fn calculate_checksum(&self) -> u16 {
        let end = self.header().file_length().min(self.memory.len());
        let mut sum: u32 = 0;
        for addr in 0x40..end {
            sum = (sum + self.memory.u8(addr) as u32) & 0xFFFF;
        }
        sum as u16
    }

    /// Status strings for the v1-3 status line: current room on the
    /// left, score/turns or a 12-hour clock on the right.
    pub fn status_line(&mut self) -> Result<(String, String), String> {
        let room = self.read_global(0)?;
        let left = self.object_name(room)?;
        let right = match self.header().status_line_type() {
            StatusLineType::Score => {
                let score = self.read_global(1)? as i16;
                let turns = self.read_global(2)?;
                format!("{score}/{turns}")
            }
            StatusLineType::TimeBased => {
                let hours = self.read_global(1)?;
                let minutes = self.read_global(2)?;
                let am_pm = if hours >= 12 { "PM" } else { "AM" };
                let display_hours = match hours % 12 {
                    0 => 12,
                    h => h,
                };
                format!("{display_hours:02}:{minutes:02} {am_pm}")
            }
        };
        Ok((left, right))
    }

    pub fn update_status_bar(&mut self) -> Result<(), String> {
        if self.version > 3 {
            return Ok(());
        }
        let (left, right) = self.status_line()?;
        self.ui.set_status_bar(&left, &right);
        Ok(())
    }

    /// Reload dynamic memory from the original image and reset the frame
    /// stack. Flag2 bits 0-1 (transcripting, force-fixed-pitch) survive.
    pub fn restart(&mut self) -> Result<(), String> {
        let preserved = self.memory.u16(0x10) & 0x0003;
        let original = self.original_dynamic.clone();
        self.memory.write_slice(0, &original)?;
        let flag2 = (self.memory.u16(0x10) & !0x0003) | preserved;
        self.memory.write_u16(0x10, flag2)?;

        self.frames = vec![Frame::initial()];
        self.pc = self.header().initial_pc();
        Ok(())
    }

    pub fn push_undo_state(&mut self, state: Vec<u8>) {
        if self.undo_states.len() >= UNDO_SLOTS {
            self.undo_states.remove(0);
        }
        self.undo_states.push(state);
    }

    // --- Execution loop ---

    /// Resolve operand values: VARIABLE operands dereference (popping for
    /// variable 0), constants pass through.
    pub fn resolve_operands(&mut self, instr: &Instruction) -> Result<Vec<u16>, String> {
        let mut args = Vec::with_capacity(instr.operands.len());
        for (i, &operand) in instr.operands.iter().enumerate() {
            if instr.optypes[i] == OperandType::Variable {
                args.push(self.read_variable(operand as u8)?);
            } else {
                args.push(operand);
            }
        }
        Ok(args)
    }

    /// One fetch/decode/dispatch cycle.
    pub fn step(&mut self) -> Result<(), String> {
        let instr = Instruction::decode(&self.memory, self.pc, self.version)?;
        let args = self.resolve_operands(&instr)?;
        ops::dispatch(self, &instr, &args)
    }

    /// Run until the story quits or an unrecoverable error surfaces.
    pub fn run(&mut self) -> Result<(), String> {
        self.running = true;
        while self.running {
            self.step()?;
        }
        Ok(())
    }
}
