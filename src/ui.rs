//! The narrow boundary between the execution core and the outside world.
//!
//! The machine only ever asks for these five operations; everything about
//! how text is rendered (styling, the status bar, prompts) lives behind
//! this trait so the core can be driven by a terminal, a test harness, or
//! an embedding host.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use crossterm::cursor::{MoveTo, RestorePosition, SavePosition};
use crossterm::execute;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::terminal;

pub trait ZUI {
    /// Append text to the transcript. No newline is added.
    fn output(&mut self, text: &str);

    /// Print an object name, possibly highlighted. `is_location` marks the
    /// current room (as opposed to an inventory item).
    fn output_object(&mut self, name: &str, is_location: bool);

    /// Display the two status strings. May be a no-op.
    fn set_status_bar(&mut self, left: &str, right: &str);

    /// Block until a line of input is available. `None` means end of
    /// input (EOF/interrupt) and is treated as a clean quit upstream.
    fn input_line(&mut self) -> Option<String>;

    /// Block for a save/restore filename. An empty string cancels.
    fn input_filename(&mut self, prompt: &str) -> String;
}

/// Terminal implementation. With `plain` set (or stdout not a tty) all
/// styling and the status bar are suppressed and output passes straight
/// through, which keeps transcripts pipeable.
pub struct TerminalUI {
    plain: bool,
    highlight: bool,
    last_output: String,
}

impl TerminalUI {
    pub fn new(plain: bool, highlight: bool) -> Self {
        let plain = plain || !atty::is(atty::Stream::Stdout);
        TerminalUI {
            plain,
            highlight,
            last_output: String::new(),
        }
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }
}

impl ZUI for TerminalUI {
    fn output(&mut self, text: &str) {
        print!("{text}");
        self.flush();
        if !text.is_empty() {
            self.last_output = text.to_string();
        }
    }

    fn output_object(&mut self, name: &str, is_location: bool) {
        if self.plain || !self.highlight {
            print!("{name}");
        } else {
            let color = if is_location { Color::Yellow } else { Color::Cyan };
            let _ = execute!(
                io::stdout(),
                SetForegroundColor(color),
                SetAttribute(Attribute::Bold),
                Print(name),
                SetAttribute(Attribute::Reset),
                ResetColor,
            );
        }
        self.flush();
        if !name.is_empty() {
            self.last_output = name.to_string();
        }
    }

    fn set_status_bar(&mut self, left: &str, right: &str) {
        if self.plain {
            return;
        }
        let width = terminal::size().map(|(w, _)| w as usize).unwrap_or(80);
        let padding = width.saturating_sub(left.len() + right.len() + 1).max(1);
        let mut bar = format!(" {left}{}{right}", " ".repeat(padding));
        bar.truncate(width);

        // Draw on row 1 in reverse video without disturbing the cursor
        let _ = execute!(
            io::stdout(),
            SavePosition,
            MoveTo(0, 0),
            SetAttribute(Attribute::Reverse),
            Print(&bar),
            SetAttribute(Attribute::Reset),
            RestorePosition,
        );
    }

    fn input_line(&mut self) -> Option<String> {
        // Suppress our own prompt when the story already printed one.
        if !self.plain && !self.last_output.trim_end().ends_with('>') {
            let _ = execute!(
                io::stdout(),
                SetAttribute(Attribute::Bold),
                Print("> "),
                SetAttribute(Attribute::Reset),
            );
        }
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                self.last_output.clear();
                Some(line.trim_end_matches(['\n', '\r']).to_string())
            }
        }
    }

    fn input_filename(&mut self, prompt: &str) -> String {
        print!("{prompt}");
        self.flush();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => String::new(),
            Ok(_) => line.trim().to_string(),
        }
    }
}

/// Scripted implementation for tests and headless runs: output is
/// captured, input is served from a queue. Clones share state, so a
/// test can keep a handle while the machine owns the boxed copy.
#[derive(Clone, Default)]
pub struct CaptureUI {
    state: Rc<RefCell<CaptureState>>,
}

#[derive(Default)]
struct CaptureState {
    transcript: String,
    status: Option<(String, String)>,
    input_queue: VecDeque<String>,
    filename_queue: VecDeque<String>,
}

impl CaptureUI {
    pub fn new() -> Self {
        CaptureUI::default()
    }

    pub fn with_input(lines: &[&str]) -> Self {
        let ui = CaptureUI::default();
        for line in lines {
            ui.queue_input(line);
        }
        ui
    }

    pub fn queue_input(&self, line: &str) {
        self.state.borrow_mut().input_queue.push_back(line.to_string());
    }

    pub fn queue_filename(&self, name: &str) {
        self.state
            .borrow_mut()
            .filename_queue
            .push_back(name.to_string());
    }

    pub fn transcript(&self) -> String {
        self.state.borrow().transcript.clone()
    }

    pub fn status(&self) -> Option<(String, String)> {
        self.state.borrow().status.clone()
    }
}

impl ZUI for CaptureUI {
    fn output(&mut self, text: &str) {
        self.state.borrow_mut().transcript.push_str(text);
    }

    fn output_object(&mut self, name: &str, _is_location: bool) {
        self.state.borrow_mut().transcript.push_str(name);
    }

    fn set_status_bar(&mut self, left: &str, right: &str) {
        self.state.borrow_mut().status = Some((left.to_string(), right.to_string()));
    }

    fn input_line(&mut self) -> Option<String> {
        self.state.borrow_mut().input_queue.pop_front()
    }

    fn input_filename(&mut self, _prompt: &str) -> String {
        self.state
            .borrow_mut()
            .filename_queue
            .pop_front()
            .unwrap_or_default()
    }
}
