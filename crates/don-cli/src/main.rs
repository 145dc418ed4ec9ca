use std::{env, path::PathBuf, process::ExitCode};

use don::{BuildOptions, StdOutput, run_build};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut options = BuildOptions::default();
    let mut targets: Vec<String> = Vec::new();
    let mut parse_options = true;
    let mut script: Option<PathBuf> = None;

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if parse_options && arg.starts_with('-') {
            let flags = &arg[1..];
            if flags.is_empty() {
                eprintln!("Invalid argument: \"-\"");
                return ExitCode::FAILURE;
            }
            if flags == "-" {
                parse_options = false;
                i += 1;
                continue;
            }
            for flag in flags.chars() {
                match flag {
                    'i' => {
                        if script.is_some() {
                            eprintln!("Input file already specified");
                            return ExitCode::FAILURE;
                        }
                        i += 1;
                        let Some(path) = args.get(i) else {
                            eprintln!("Option \"-i\" requires an argument");
                            return ExitCode::FAILURE;
                        };
                        script = Some(PathBuf::from(path));
                    }
                    #[cfg(debug_assertions)]
                    'd' => options.disassemble = true,
                    _ => {
                        eprintln!("Unknown option: {flag}");
                        return ExitCode::FAILURE;
                    }
                }
            }
        } else {
            targets.push(arg.clone());
        }
        i += 1;
    }

    if let Some(script) = script {
        options.script = script;
    }

    match run_build(&options, &targets, &mut StdOutput) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}
