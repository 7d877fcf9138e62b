use std::{env, process::ExitCode};

use lily::{Options, ParseMode, State};

const USAGE: &str = "\
Usage: lily [option] ...
Options:
  -h        Show this help and exit.
  -t        Run the input in tag mode (code between <@lily and @>).
  -s code   Run the given string instead of a file.
  -g N      Start collecting after N tagged allocations.
  file      Run this file.";

fn main() -> ExitCode {
    let mut mode = ParseMode::NoTags;
    let mut inline_code: Option<String> = None;
    let mut file: Option<String> = None;
    let mut gc_start: Option<u32> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => {
                println!("{USAGE}");
                return ExitCode::SUCCESS;
            }
            "-t" => mode = ParseMode::Tags,
            "-s" => {
                let Some(code) = args.next() else {
                    eprintln!("lily: -s needs a code string.");
                    return ExitCode::FAILURE;
                };
                inline_code = Some(code);
            }
            "-g" => {
                let value = args.next().and_then(|v| v.parse().ok());
                let Some(value) = value else {
                    eprintln!("lily: -g needs a number.");
                    return ExitCode::FAILURE;
                };
                gc_start = Some(value);
            }
            other if other.starts_with('-') => {
                eprintln!("lily: unknown option '{other}'.");
                return ExitCode::FAILURE;
            }
            other => {
                // The script name plus everything after it becomes argv.
                let mut argv = vec![other.to_string()];
                argv.extend(args.by_ref());
                file = Some(other.to_string());
                let mut options = Options {
                    argv,
                    ..Options::default()
                };
                if let Some(gc_start) = gc_start {
                    options.gc_start = gc_start;
                }
                return run(options, mode, inline_code, file);
            }
        }
    }

    let mut options = Options::default();
    if let Some(gc_start) = gc_start {
        options.gc_start = gc_start;
    }
    run(options, mode, inline_code, file)
}

fn run(
    options: Options,
    mode: ParseMode,
    inline_code: Option<String>,
    file: Option<String>,
) -> ExitCode {
    let mut state = State::new(options);
    let ok = match (&inline_code, &file) {
        (Some(code), _) => state.parse_string("<cmdline>", mode, code),
        (None, Some(path)) => state.parse_file(mode, path),
        (None, None) => {
            eprintln!("lily: nothing to run (try -h).");
            return ExitCode::FAILURE;
        }
    };

    if ok {
        ExitCode::SUCCESS
    } else {
        match state.get_error() {
            Some(error) => eprintln!("{error}"),
            None => eprintln!("lily: execution failed."),
        }
        ExitCode::FAILURE
    }
}
