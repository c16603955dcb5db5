//! Opcode handlers and the dispatch table.
//!
//! One handler per opcode; the dispatcher maps the flat opcode number to
//! its handler. Every handler leaves the PC pointing at the next
//! instruction to execute, whether by falling through, branching,
//! calling or returning.

use crate::instruction::{Branch, Instruction};
use crate::quetzal;
use crate::vm::ZMachine;
use log::{debug, warn};
use std::fs;

fn to_i16(value: u16) -> i16 {
    value as i16
}

fn u16_wrap(value: i32) -> u16 {
    (value & 0xFFFF) as u16
}

// --- Control flow ---

fn op_call(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    if args.is_empty() {
        return zm.process_result(instr, 0);
    }
    zm.call_routine(args[0], &args[1..], instr.store, instr.next)
}

fn op_ret(zm: &mut ZMachine, _instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.return_from_routine(args[0])
}

fn op_rtrue(zm: &mut ZMachine, _instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    zm.return_from_routine(1)
}

fn op_rfalse(zm: &mut ZMachine, _instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    zm.return_from_routine(0)
}

fn op_ret_popped(zm: &mut ZMachine, _instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    let value = zm.stack_pop()?;
    zm.return_from_routine(value)
}

fn op_jump(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let offset = to_i16(args[0]) as i64;
    zm.pc = (instr.next as i64 + offset - 2) as usize;
    Ok(())
}

fn op_quit(zm: &mut ZMachine, _instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    zm.running = false;
    Ok(())
}

fn op_nop(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    zm.pc = instr.next;
    Ok(())
}

fn op_restart(zm: &mut ZMachine, _instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    zm.restart()
}

fn op_catch(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    let token = zm.frames.len() as u16;
    zm.process_result(instr, token)
}

fn op_throw(zm: &mut ZMachine, _instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let token = args[1] as usize;
    if token == 0 || token > zm.frames.len() {
        return Err(format!(
            "throw to invalid frame {} (depth {})",
            token,
            zm.frames.len()
        ));
    }
    zm.frames.truncate(token);
    zm.return_from_routine(args[0])
}

// --- Branches ---

fn op_je(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let result = args[1..].contains(&args[0]);
    zm.process_branch(branch_of(instr)?, instr.next, result)
}

fn op_jz(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.process_branch(branch_of(instr)?, instr.next, args[0] == 0)
}

fn op_jl(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let result = to_i16(args[0]) < to_i16(args[1]);
    zm.process_branch(branch_of(instr)?, instr.next, result)
}

fn op_jg(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let result = to_i16(args[0]) > to_i16(args[1]);
    zm.process_branch(branch_of(instr)?, instr.next, result)
}

fn op_jin(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let result = zm.parent(args[0])? == args[1];
    zm.process_branch(branch_of(instr)?, instr.next, result)
}

fn op_test(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let result = args[0] & args[1] == args[1];
    zm.process_branch(branch_of(instr)?, instr.next, result)
}

fn op_test_attr(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let result = zm.test_attr(args[0], args[1])?;
    zm.process_branch(branch_of(instr)?, instr.next, result)
}

fn op_verify(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    let result = zm.calculate_checksum() == zm.header().checksum();
    zm.process_branch(branch_of(instr)?, instr.next, result)
}

fn op_piracy(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    zm.process_branch(branch_of(instr)?, instr.next, true)
}

fn op_check_arg_count(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let supplied = zm.frames.last().map(|f| f.arg_count).unwrap_or(0);
    let result = supplied >= args[0] as usize;
    zm.process_branch(branch_of(instr)?, instr.next, result)
}

fn branch_of(instr: &Instruction) -> Result<&Branch, String> {
    instr
        .branch
        .as_ref()
        .ok_or_else(|| format!("{} decoded without branch data", instr.name))
}

// --- Arithmetic ---

fn op_add(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let result = to_i16(args[0]) as i32 + to_i16(args[1]) as i32;
    zm.process_result(instr, u16_wrap(result))
}

fn op_sub(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let result = to_i16(args[0]) as i32 - to_i16(args[1]) as i32;
    zm.process_result(instr, u16_wrap(result))
}

fn op_mul(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let result = to_i16(args[0]) as i32 * to_i16(args[1]) as i32;
    zm.process_result(instr, u16_wrap(result))
}

fn op_div(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let b = to_i16(args[1]) as i32;
    if b == 0 {
        return Err(format!("division by zero at {:#06x}", instr.addr));
    }
    // Rust integer division truncates toward zero, as required
    let result = to_i16(args[0]) as i32 / b;
    zm.process_result(instr, u16_wrap(result))
}

fn op_mod(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let b = to_i16(args[1]) as i32;
    if b == 0 {
        return Err(format!("modulo by zero at {:#06x}", instr.addr));
    }
    let a = to_i16(args[0]) as i32;
    // Sign follows the dividend
    let result = a - (a / b) * b;
    zm.process_result(instr, u16_wrap(result))
}

// --- Logical ---

fn op_or(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.process_result(instr, args[0] | args[1])
}

fn op_and(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.process_result(instr, args[0] & args[1])
}

fn op_not(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.process_result(instr, !args[0])
}

fn op_log_shift(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let places = to_i16(args[1]);
    let result = match places {
        0 => args[0],
        1..=15 => args[0] << places,
        -15..=-1 => args[0] >> -places,
        _ => 0,
    };
    zm.process_result(instr, result)
}

fn op_art_shift(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let places = to_i16(args[1]);
    let value = to_i16(args[0]);
    let result = match places {
        0 => value,
        1..=15 => ((value as i32) << places) as i16,
        -15..=-1 => value >> -places,
        _ => {
            if places < 0 && value < 0 {
                -1
            } else {
                0
            }
        }
    };
    zm.process_result(instr, result as u16)
}

// --- Memory ---

fn op_loadw(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let addr = args[0].wrapping_add((to_i16(args[1]) as u16).wrapping_mul(2));
    let value = zm.memory.u16(addr as usize);
    zm.process_result(instr, value)
}

fn op_loadb(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let addr = args[0].wrapping_add(to_i16(args[1]) as u16);
    let value = zm.memory.u8(addr as usize) as u16;
    zm.process_result(instr, value)
}

fn op_storew(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let addr = args[0].wrapping_add((to_i16(args[1]) as u16).wrapping_mul(2));
    zm.write_u16(addr as usize, args[2])?;
    zm.pc = instr.next;
    Ok(())
}

fn op_storeb(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let addr = args[0].wrapping_add(to_i16(args[1]) as u16);
    zm.write_u8(addr as usize, args[2] as u8)?;
    zm.pc = instr.next;
    Ok(())
}

fn op_store(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.write_indirect_variable(args[0] as u8, args[1])?;
    zm.pc = instr.next;
    Ok(())
}

fn op_load(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let value = zm.read_indirect_variable(args[0] as u8)?;
    zm.process_result(instr, value)
}

// --- Stack ---

fn op_push(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.stack_push(args[0]);
    zm.pc = instr.next;
    Ok(())
}

fn op_pull(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let value = zm.stack_pop()?;
    zm.write_indirect_variable(args[0] as u8, value)?;
    zm.pc = instr.next;
    Ok(())
}

fn op_pop(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    zm.stack_pop()?;
    zm.pc = instr.next;
    Ok(())
}

// --- Variables ---

fn op_inc(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let var = args[0] as u8;
    let value = zm.read_indirect_variable(var)?.wrapping_add(1);
    zm.write_indirect_variable(var, value)?;
    zm.pc = instr.next;
    Ok(())
}

fn op_dec(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let var = args[0] as u8;
    let value = zm.read_indirect_variable(var)?.wrapping_sub(1);
    zm.write_indirect_variable(var, value)?;
    zm.pc = instr.next;
    Ok(())
}

fn op_inc_chk(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let var = args[0] as u8;
    let value = zm.read_indirect_variable(var)?.wrapping_add(1);
    zm.write_indirect_variable(var, value)?;
    let result = to_i16(value) > to_i16(args[1]);
    zm.process_branch(branch_of(instr)?, instr.next, result)
}

fn op_dec_chk(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let var = args[0] as u8;
    let value = zm.read_indirect_variable(var)?.wrapping_sub(1);
    zm.write_indirect_variable(var, value)?;
    let result = to_i16(value) < to_i16(args[1]);
    zm.process_branch(branch_of(instr)?, instr.next, result)
}

// --- Objects ---

fn op_set_attr(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.set_attr(args[0], args[1])?;
    zm.pc = instr.next;
    Ok(())
}

fn op_clear_attr(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.clear_attr(args[0], args[1])?;
    zm.pc = instr.next;
    Ok(())
}

fn op_insert_obj(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.insert_obj(args[0], args[1])?;
    zm.pc = instr.next;
    Ok(())
}

fn op_remove_obj(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.remove_obj(args[0])?;
    zm.pc = instr.next;
    Ok(())
}

fn op_get_parent(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let parent = zm.parent(args[0])?;
    zm.process_result(instr, parent)
}

fn op_get_sibling(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let sibling = zm.sibling(args[0])?;
    zm.process_result(instr, sibling)
}

fn op_get_child(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let child = zm.child(args[0])?;
    zm.process_result(instr, child)
}

// --- Properties ---

fn op_get_prop(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let value = zm.get_prop_value(args[0], args[1] as u8)?;
    zm.process_result(instr, value)
}

fn op_get_prop_addr(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let addr = zm.get_prop_addr(args[0], args[1] as u8)?;
    zm.process_result(instr, addr as u16)
}

fn op_get_next_prop(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let next = zm.get_next_prop(args[0], args[1] as u8)?;
    zm.process_result(instr, next as u16)
}

fn op_get_prop_len(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let length = zm.get_prop_len(args[0] as usize);
    zm.process_result(instr, length as u16)
}

fn op_put_prop(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    zm.put_prop(args[0], args[1] as u8, args[2])?;
    zm.pc = instr.next;
    Ok(())
}

// --- Printing ---

fn op_print(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    let text = instr
        .text
        .clone()
        .ok_or_else(|| "print decoded without inline text".to_string())?;
    zm.ui.output(&text);
    zm.pc = instr.next;
    Ok(())
}

fn op_print_ret(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    let text = instr
        .text
        .clone()
        .ok_or_else(|| "print_ret decoded without inline text".to_string())?;
    zm.ui.output(&text);
    zm.ui.output("\n");
    zm.return_from_routine(1)
}

fn op_new_line(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    zm.ui.output("\n");
    zm.pc = instr.next;
    Ok(())
}

fn op_print_num(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let text = to_i16(args[0]).to_string();
    zm.ui.output(&text);
    zm.pc = instr.next;
    Ok(())
}

fn op_print_char(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let text = match zm.text_env().zscii_to_unicode(args[0]) {
        Some(ch) => ch.to_string(),
        None => String::new(),
    };
    zm.ui.output(&text);
    zm.pc = instr.next;
    Ok(())
}

fn op_print_obj(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let name = zm.object_name(args[0])?;
    let is_location = args[0] == zm.read_global(0)?;
    zm.ui.output_object(&name, is_location);
    zm.pc = instr.next;
    Ok(())
}

fn op_print_addr(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let text = zm.read_zstring(args[0] as usize)?;
    zm.ui.output(&text);
    zm.pc = instr.next;
    Ok(())
}

fn op_print_paddr(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let addr = zm.unpack_string_addr(args[0]);
    let text = zm.read_zstring(addr)?;
    zm.ui.output(&text);
    zm.pc = instr.next;
    Ok(())
}

fn op_print_unicode(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    if let Some(ch) = char::from_u32(args[0] as u32) {
        zm.ui.output(&ch.to_string());
    }
    zm.pc = instr.next;
    Ok(())
}

fn op_check_unicode(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    // We can both print and read anything the terminal hands us
    zm.process_result(instr, 3)
}

fn op_print_table(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let width = args[1] as usize;
    let height = args.get(2).copied().unwrap_or(1) as usize;
    let skip = args.get(3).copied().unwrap_or(0) as usize;

    let mut out = String::new();
    {
        let env = zm.text_env();
        let mut addr = args[0] as usize;
        for row in 0..height {
            if row > 0 {
                out.push('\n');
            }
            for i in 0..width {
                if let Some(ch) = env.zscii_to_unicode(env.mem.u8(addr + i) as u16) {
                    out.push(ch);
                }
            }
            addr += width + skip;
        }
    }
    zm.ui.output(&out);
    zm.pc = instr.next;
    Ok(())
}

// --- Input ---

fn op_sread(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    if zm.version <= 3 {
        zm.update_status_bar()?;
    }
    let text_addr = args[0] as usize;
    let parse_addr = args.get(1).copied().unwrap_or(0) as usize;
    // Timed input (v4+ extra operands) is not supported; ignore them.

    let line = match zm.ui.input_line() {
        Some(line) => line,
        None => {
            // EOF on input ends the session cleanly
            zm.running = false;
            return Ok(());
        }
    };

    let max_len = zm.memory.u8(text_addr) as usize;
    let input: String = line.to_lowercase().chars().take(max_len).collect();
    let bytes: Vec<u8> = input
        .chars()
        .map(|ch| if (' '..='~').contains(&ch) { ch as u8 } else { b'?' })
        .collect();

    if zm.version <= 4 {
        for (i, &b) in bytes.iter().enumerate() {
            zm.write_u8(text_addr + 1 + i, b)?;
        }
        zm.write_u8(text_addr + 1 + bytes.len(), 0)?;
    } else {
        zm.write_u8(text_addr + 1, bytes.len() as u8)?;
        for (i, &b) in bytes.iter().enumerate() {
            zm.write_u8(text_addr + 2 + i, b)?;
        }
    }

    if parse_addr != 0 {
        zm.tokenise(&input, parse_addr, None, false)?;
    }

    if zm.version >= 5 {
        // aread returns the terminating character (always newline here)
        zm.process_result(instr, 13)
    } else {
        zm.pc = instr.next;
        Ok(())
    }
}

fn op_read_char(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    let line = match zm.ui.input_line() {
        Some(line) => line,
        None => {
            zm.running = false;
            return Ok(());
        }
    };
    let code = match line.chars().next() {
        Some(ch) if (' '..='~').contains(&ch) => ch as u16,
        Some(_) => b'?' as u16,
        None => 13,
    };
    zm.process_result(instr, code)
}

fn op_tokenise(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let text = zm.read_text_buffer(args[0] as usize);
    let dictionary = args.get(2).map(|&d| d as usize);
    let skip_unknown = args.get(3).copied().unwrap_or(0) != 0;
    zm.tokenise(&text, args[1] as usize, dictionary, skip_unknown)?;
    zm.pc = instr.next;
    Ok(())
}

fn op_encode_text(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let text_addr = args[0] as usize;
    let length = args[1] as usize;
    let from = args[2] as usize;
    let coded_addr = args[3] as usize;

    let word: String = (0..length)
        .map(|i| zm.memory.u8(text_addr + from + i) as char)
        .collect();
    let resolution = if zm.version <= 3 { 6 } else { 9 };
    let words = zm.text_env().encode_word(&word, resolution);
    for (i, w) in words.iter().enumerate() {
        zm.write_u16(coded_addr + i * 2, *w)?;
    }
    zm.pc = instr.next;
    Ok(())
}

// --- Tables ---

fn op_scan_table(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let form = args.get(3).copied().unwrap_or(0x82);
    let word_mode = form & 0x80 != 0;
    let entry_len = (form & 0x7F) as usize;
    if entry_len == 0 {
        return Err(format!("scan_table with zero entry length at {:#06x}", instr.addr));
    }

    let mut found = 0usize;
    for i in 0..args[2] as usize {
        let addr = args[1] as usize + i * entry_len;
        let value = if word_mode {
            zm.memory.u16(addr)
        } else {
            zm.memory.u8(addr) as u16
        };
        if value == args[0] {
            found = addr;
            break;
        }
    }
    zm.process_result(instr, found as u16)
}

fn op_copy_table(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let first = args[0] as usize;
    let second = args[1] as usize;
    let size = to_i16(args[2]);
    let count = size.unsigned_abs() as usize;

    if second == 0 {
        for i in 0..count {
            zm.write_u8(first + i, 0)?;
        }
    } else if size < 0 {
        // Negative size forces a forward copy even when regions overlap
        for i in 0..count {
            let byte = zm.memory.u8(first + i);
            zm.write_u8(second + i, byte)?;
        }
    } else {
        let bytes: Vec<u8> = (0..count).map(|i| zm.memory.u8(first + i)).collect();
        for (i, &byte) in bytes.iter().enumerate() {
            zm.write_u8(second + i, byte)?;
        }
    }
    zm.pc = instr.next;
    Ok(())
}

// --- Random ---

fn op_random(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    let range = to_i16(args[0]);
    if range <= 0 {
        if range == 0 {
            zm.rng.reseed_uniform();
        } else {
            zm.rng.seed(range.unsigned_abs() as u64);
        }
        zm.process_result(instr, 0)
    } else {
        let value = zm.rng.gen_range(range as u16);
        zm.process_result(instr, value)
    }
}

// --- Status line ---

fn op_show_status(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    zm.update_status_bar()?;
    zm.pc = instr.next;
    Ok(())
}

// --- Save / restore ---

fn save_continuation(instr: &Instruction) -> Result<usize, String> {
    match &instr.branch {
        // The restored machine resumes on the save instruction's success
        // path, so resolve the branch for a true result now.
        Some(branch) if branch.condition => branch
            .address
            .ok_or_else(|| "save branch may not be a return".to_string()),
        _ => Ok(instr.next),
    }
}

/// Serialize the machine as the restored side will see it: the store
/// variable (when present) already holds 2, and the PC is the success
/// continuation.
fn serialize_for_save(zm: &mut ZMachine, instr: &Instruction) -> Result<Vec<u8>, String> {
    let continuation = save_continuation(instr)?;
    if let Some(store) = instr.store {
        zm.write_variable(store, 2)?;
    }
    let data = quetzal::save(zm, continuation);
    Ok(data)
}

/// Report the live outcome of a save/restore attempt: branch for the
/// v1-3 forms, store for v4+. `provisional` marks that the store
/// variable already holds the placeholder written by
/// `serialize_for_save` and must be replaced rather than pushed.
fn finish_save_result(
    zm: &mut ZMachine,
    instr: &Instruction,
    ok: bool,
    provisional: bool,
) -> Result<(), String> {
    if let Some(store) = instr.store {
        let value = if ok { 1 } else { 0 };
        if provisional {
            zm.write_indirect_variable(store, value)?;
        } else {
            zm.write_variable(store, value)?;
        }
        zm.pc = instr.next;
        Ok(())
    } else if let Some(branch) = &instr.branch {
        let branch = branch.clone();
        zm.process_branch(&branch, instr.next, ok)
    } else {
        zm.pc = instr.next;
        Ok(())
    }
}

fn op_save(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    if !args.is_empty() {
        // The v5 table form (save bytes to an auxiliary file) is not
        // supported; report failure.
        warn!("save with operands is unsupported; reporting failure");
        return finish_save_result(zm, instr, false, false);
    }
    let filename = zm.ui.input_filename("Save to file: ");
    if filename.is_empty() {
        return finish_save_result(zm, instr, false, false);
    }

    let data = serialize_for_save(zm, instr)?;
    let ok = match fs::write(&filename, &data) {
        Ok(()) => true,
        Err(e) => {
            warn!("save to {filename:?} failed: {e}");
            false
        }
    };
    finish_save_result(zm, instr, ok, instr.store.is_some())
}

fn op_restore(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    if !args.is_empty() {
        warn!("restore with operands is unsupported; reporting failure");
        return finish_save_result(zm, instr, false, false);
    }
    let filename = zm.ui.input_filename("Restore from file: ");
    if filename.is_empty() {
        return finish_save_result(zm, instr, false, false);
    }

    let data = match fs::read(&filename) {
        Ok(data) => data,
        Err(e) => {
            warn!("could not read {filename:?}: {e}");
            return finish_save_result(zm, instr, false, false);
        }
    };
    match quetzal::restore(zm, &data) {
        // State (including PC) is fully replaced; the machine resumes on
        // the original save's success path seeing result 2.
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("restore failed: {e}");
            finish_save_result(zm, instr, false, false)
        }
    }
}

fn op_save_undo(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    let data = serialize_for_save(zm, instr)?;
    zm.push_undo_state(data);
    finish_save_result(zm, instr, true, instr.store.is_some())
}

fn op_restore_undo(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    let data = match zm.undo_states.pop() {
        Some(data) => data,
        None => return finish_save_result(zm, instr, false, false),
    };
    match quetzal::restore(zm, &data) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("restore_undo failed: {e}");
            finish_save_result(zm, instr, false, false)
        }
    }
}

// --- Screen model stubs ---
// Window, cursor, styling, sound and mouse control are out of scope;
// the opcodes are accepted and ignored so v4/v5 stories keep running.

fn op_screen_nop(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    debug!("ignoring screen opcode {} at {:#06x}", instr.name, instr.addr);
    zm.pc = instr.next;
    Ok(())
}

fn op_get_cursor(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    // No cursor tracking; report row 1, column 1
    let table = args[0] as usize;
    zm.write_u16(table, 1)?;
    zm.write_u16(table + 2, 1)?;
    zm.pc = instr.next;
    Ok(())
}

fn op_set_font(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    // 0 = font unchanged/unavailable
    zm.process_result(instr, 0)
}

fn op_branch_false_stub(zm: &mut ZMachine, instr: &Instruction, _args: &[u16]) -> Result<(), String> {
    zm.process_branch(branch_of(instr)?, instr.next, false)
}

/// Map a decoded instruction to its handler and run it.
pub fn dispatch(zm: &mut ZMachine, instr: &Instruction, args: &[u16]) -> Result<(), String> {
    match instr.opcode {
        // 2OP
        1 => op_je(zm, instr, args),
        2 => op_jl(zm, instr, args),
        3 => op_jg(zm, instr, args),
        4 => op_dec_chk(zm, instr, args),
        5 => op_inc_chk(zm, instr, args),
        6 => op_jin(zm, instr, args),
        7 => op_test(zm, instr, args),
        8 => op_or(zm, instr, args),
        9 => op_and(zm, instr, args),
        10 => op_test_attr(zm, instr, args),
        11 => op_set_attr(zm, instr, args),
        12 => op_clear_attr(zm, instr, args),
        13 => op_store(zm, instr, args),
        14 => op_insert_obj(zm, instr, args),
        15 => op_loadw(zm, instr, args),
        16 => op_loadb(zm, instr, args),
        17 => op_get_prop(zm, instr, args),
        18 => op_get_prop_addr(zm, instr, args),
        19 => op_get_next_prop(zm, instr, args),
        20 => op_add(zm, instr, args),
        21 => op_sub(zm, instr, args),
        22 => op_mul(zm, instr, args),
        23 => op_div(zm, instr, args),
        24 => op_mod(zm, instr, args),
        25 | 26 => op_call(zm, instr, args), // call_2s / call_2n
        27 => op_screen_nop(zm, instr, args), // set_colour
        28 => op_throw(zm, instr, args),
        // 1OP
        128 => op_jz(zm, instr, args),
        129 => op_get_sibling(zm, instr, args),
        130 => op_get_child(zm, instr, args),
        131 => op_get_parent(zm, instr, args),
        132 => op_get_prop_len(zm, instr, args),
        133 => op_inc(zm, instr, args),
        134 => op_dec(zm, instr, args),
        135 => op_print_addr(zm, instr, args),
        136 => op_call(zm, instr, args), // call_1s
        137 => op_remove_obj(zm, instr, args),
        138 => op_print_obj(zm, instr, args),
        139 => op_ret(zm, instr, args),
        140 => op_jump(zm, instr, args),
        141 => op_print_paddr(zm, instr, args),
        142 => op_load(zm, instr, args),
        143 => {
            if zm.version <= 4 {
                op_not(zm, instr, args)
            } else {
                op_call(zm, instr, args) // call_1n
            }
        }
        // 0OP
        176 => op_rtrue(zm, instr, args),
        177 => op_rfalse(zm, instr, args),
        178 => op_print(zm, instr, args),
        179 => op_print_ret(zm, instr, args),
        180 => op_nop(zm, instr, args),
        181 => op_save(zm, instr, args),
        182 => op_restore(zm, instr, args),
        183 => op_restart(zm, instr, args),
        184 => op_ret_popped(zm, instr, args),
        185 => {
            if zm.version <= 4 {
                op_pop(zm, instr, args)
            } else {
                op_catch(zm, instr, args)
            }
        }
        186 => op_quit(zm, instr, args),
        187 => op_new_line(zm, instr, args),
        188 => op_show_status(zm, instr, args),
        189 => op_verify(zm, instr, args),
        191 => op_piracy(zm, instr, args),
        // VAR
        224 => op_call(zm, instr, args), // call / call_vs
        225 => op_storew(zm, instr, args),
        226 => op_storeb(zm, instr, args),
        227 => op_put_prop(zm, instr, args),
        228 => op_sread(zm, instr, args),
        229 => op_print_char(zm, instr, args),
        230 => op_print_num(zm, instr, args),
        231 => op_random(zm, instr, args),
        232 => op_push(zm, instr, args),
        233 => op_pull(zm, instr, args),
        234 | 235 | 237 | 238 | 239 | 241 | 242 | 243 | 244 | 245 => {
            op_screen_nop(zm, instr, args)
        }
        236 => op_call(zm, instr, args), // call_vs2
        240 => op_get_cursor(zm, instr, args),
        246 => op_read_char(zm, instr, args),
        247 => op_scan_table(zm, instr, args),
        248 => op_not(zm, instr, args),
        249 | 250 => op_call(zm, instr, args), // call_vn / call_vn2
        251 => op_tokenise(zm, instr, args),
        252 => op_encode_text(zm, instr, args),
        253 => op_copy_table(zm, instr, args),
        254 => op_print_table(zm, instr, args),
        255 => op_check_arg_count(zm, instr, args),
        // EXT
        1000 => op_save(zm, instr, args),
        1001 => op_restore(zm, instr, args),
        1002 => op_log_shift(zm, instr, args),
        1003 => op_art_shift(zm, instr, args),
        1004 => op_set_font(zm, instr, args),
        1009 => op_save_undo(zm, instr, args),
        1010 => op_restore_undo(zm, instr, args),
        1011 => op_print_unicode(zm, instr, args),
        1012 => op_check_unicode(zm, instr, args),
        1005 | 1007 | 1008 | 1013 | 1016 | 1017 | 1018 | 1020 | 1021 | 1022 | 1023 | 1025
        | 1026 | 1028 => op_screen_nop(zm, instr, args),
        1006 | 1024 | 1027 => op_branch_false_stub(zm, instr, args),
        _ => Err(format!(
            "unimplemented opcode {} ({}) at {:#06x}",
            instr.name, instr.opcode, instr.addr
        )),
    }
}
