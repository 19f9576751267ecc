use std::{env, path::PathBuf};

use clap::Shell;

#[path = "src/cli.rs"]
mod cli;

fn main() {
    let mut out_dir = match env::var_os("OUT_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => return,
    };
    let _ = out_dir.pop();
    let _ = out_dir.pop();
    let _ = out_dir.pop();

    let mut cli = cli::generate_cli();
    cli.gen_completions("mastf", Shell::Bash, &out_dir);
    cli.gen_completions("mastf", Shell::Fish, out_dir);
}
