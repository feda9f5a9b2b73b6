//! The npz driver: compile source to bytecode files, and load and run them.

use std::{env, fs, process::exit};

use npz::{StdPrint, Vm};

const NPZ_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes: 0 success, 2 usage, 65 compile/load error, 70 runtime error,
/// 74 filesystem error.
fn main() {
    let args: Vec<String> = env::args().collect();
    exit(drive(&args));
}

fn drive(args: &[String]) -> i32 {
    if args.len() == 1 {
        print_help();
        return 0;
    }

    // -R consumes the rest of the command line and must come first.
    if args[1] == "-R" {
        let Some(target) = args.get(2) else {
            eprintln!("Expected binary file name.");
            return 2;
        };
        let cmd_args: Vec<String> = args[3..].to_vec();
        return run_file(target, cmd_args);
    }

    let mut compile_target: Option<&str> = None;
    let mut output_target: Option<&str> = None;
    let mut run_target: Option<&str> = None;
    let mut show_help = false;
    let mut show_version = false;

    let mut i = 1;
    while i < args.len() {
        let arg = &args[i];
        match arg.as_str() {
            "-R" => {
                eprintln!("-R must be the first flag.");
                return 2;
            }
            "-c" | "-o" | "-r" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("{arg} does not precede a path.");
                    return 2;
                };
                match arg.as_str() {
                    "-c" => compile_target = Some(value),
                    "-o" => output_target = Some(value),
                    _ => run_target = Some(value),
                }
                i += 1;
            }
            "-h" => show_help = true,
            "-v" => show_version = true,
            other => {
                eprintln!("Invalid argument '{other}'.");
                return 2;
            }
        }
        i += 1;
    }

    if show_help {
        print_help();
    }
    if show_version {
        println!("npz version {NPZ_VERSION}");
    }

    if let Some(source) = compile_target {
        let Some(output) = output_target else {
            eprintln!("No output file specified.");
            return 2;
        };
        let code = compile_file(source, output);
        if code != 0 {
            return code;
        }
    }

    if let Some(target) = run_target {
        return run_file(target, Vec::new());
    }

    0
}

fn print_help() {
    println!("Usage: npz [options]");
    println!("Options:");
    println!("  -c [target]\t\tCompile target");
    println!("  -o [target]\t\tOutput target to file");
    println!("  -r [target]\t\tRuns the target compiled file");
    println!("  -R [target]\t\tRuns the target compiled file,");
    println!("             \t\tpassing all remaining args to the VM");
    println!("  -v\t\tPrint version");
    println!("  -h\t\tPrint this help message");
}

fn compile_file(source_path: &str, output_path: &str) -> i32 {
    let source = match fs::read_to_string(source_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file \"{source_path}\": {err}.");
            return 74;
        }
    };

    let mut writer = StdPrint;
    let mut vm = Vm::new(&mut writer);
    let function = match vm.compile_source(&source, Some(source_path)) {
        Ok(function) => function,
        Err(err) => {
            eprintln!("{err}");
            return 65;
        }
    };

    let bytes = vm.dump_function(function);
    if let Err(err) = fs::write(output_path, bytes) {
        eprintln!("Could not write file \"{output_path}\": {err}.");
        return 74;
    }
    0
}

fn run_file(path: &str, cmd_args: Vec<String>) -> i32 {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Could not open file \"{path}\": {err}.");
            return 74;
        }
    };

    let mut writer = StdPrint;
    let mut vm = Vm::new(&mut writer);
    vm.set_cmd_args(cmd_args);

    let function = match vm.load_function(&bytes) {
        Ok(function) => function,
        Err(err) => {
            eprintln!("{err}");
            return 65;
        }
    };

    match vm.run_function(function) {
        Ok(_) => 0,
        Err(exception) => {
            eprint!("{exception}");
            70
        }
    }
}
