use std::env;
use std::fs;
use std::process::ExitCode;

use lantern::ui::TerminalUI;
use lantern::vm::ZMachine;

struct Args {
    story_path: String,
    plain: bool,
    highlight: bool,
    seed: Option<u64>,
}

fn parse_args() -> Result<Args, String> {
    let mut story_path = None;
    let mut plain = false;
    let mut highlight = true;
    let mut seed = None;

    let mut argv = env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--plain" => plain = true,
            "--no-highlight" => highlight = false,
            "--seed" => {
                let value = argv.next().ok_or("--seed needs a value")?;
                seed = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("bad seed: {value}"))?,
                );
            }
            "--help" | "-h" => {
                return Err(usage());
            }
            _ if arg.starts_with('-') => return Err(format!("unknown flag {arg}\n{}", usage())),
            _ => {
                if story_path.replace(arg).is_some() {
                    return Err(usage());
                }
            }
        }
    }

    Ok(Args {
        story_path: story_path.ok_or_else(usage)?,
        plain,
        highlight,
        seed,
    })
}

fn usage() -> String {
    "usage: lantern [--plain] [--no-highlight] [--seed N] <story-file>".to_string()
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let story = match fs::read(&args.story_path) {
        Ok(story) => story,
        Err(e) => {
            eprintln!("can't read {}: {e}", args.story_path);
            return ExitCode::FAILURE;
        }
    };

    let ui = TerminalUI::new(args.plain, args.highlight);
    let mut zm = match ZMachine::new(story, Box::new(ui), args.seed) {
        Ok(zm) => zm,
        Err(e) => {
            eprintln!("{}: {e}", args.story_path);
            return ExitCode::FAILURE;
        }
    };

    match zm.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal interpreter error: {e}");
            ExitCode::FAILURE
        }
    }
}
