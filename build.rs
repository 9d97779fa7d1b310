//! Renders the `skiff` manual pages from the clap definitions.
//!
//! One page covers the top-level command and one page is written per
//! subcommand (`skiff-deploy.1`, `skiff-logs.1`, ...), all into `OUT_DIR`.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn render(command: clap::Command, out_dir: &Path, file_name: &str) -> io::Result<()> {
    let mut page = Vec::new();
    Man::new(command).render(&mut page)?;
    fs::write(out_dir.join(file_name), page)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let root = cli::Cli::command();
    for sub in root.get_subcommands() {
        render(sub.clone(), &out_dir, &format!("skiff-{}.1", sub.get_name()))?;
    }
    render(root, &out_dir, "skiff.1")?;

    Ok(())
}
