// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;
use vbci_runtime::Vm;

/// Bytecode interpreter: loads, verifies and executes a compiled program.
#[derive(Parser)]
#[command(name = "vbci", about = "Run a bytecode file.")]
struct Args {
    /// File to execute.
    path: PathBuf,

    /// Log verbosity: trace, debug, info, warn, error or off.
    #[arg(short = 'l', long = "log_level", default_value = "error")]
    log_level: LevelFilter,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .init();

    let vm = match Vm::load(&args.path) {
        Ok(vm) => vm,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(255);
        }
    };

    let code = vm.run();
    // Exit codes are a u8 window over the program's i32 result.
    ExitCode::from(code as u8)
}
