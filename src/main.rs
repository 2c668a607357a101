use std::env::set_var;

use anyhow::{bail, Result};
use clap::Parser;
use log::error;

use cib::cli::Cli;
use cib::ops;

fn init_logging(verbose: bool) {
    if verbose && std::env::var("RUST_LOG").is_err() {
        set_var("RUST_LOG", "debug");
    }
    env_logger::init();
}

/// Enforces the path-count rule for each mode (`CIBReadArgs`'s switch-case
/// validation, §6): `create`/`append`/`delete`/`query` need at least one
/// path; `extract` accepts zero or more; `metadata`/`print` take none.
fn validate(cli: &Cli) -> Result<()> {
    let n = cli.paths.len();
    if (cli.create || cli.append || cli.delete || cli.query) && n == 0 {
        bail!("this mode requires at least one path");
    }
    if (cli.metadata || cli.print) && n != 0 {
        bail!("this mode does not take any paths");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    validate(&cli)?;

    let result = if cli.create {
        ops::create(&cli.archive, &cli.paths, cli.compress)
    } else if cli.append {
        ops::append(&cli.archive, &cli.paths, cli.compress)
    } else if cli.extract {
        ops::extract(&cli.archive, &cli.paths)
    } else if cli.delete {
        ops::delete(&cli.archive, &cli.paths)
    } else if cli.query {
        ops::query(&cli.archive, &cli.paths)
    } else if cli.metadata {
        ops::print_metadata(&cli.archive)
    } else {
        ops::print_structure(&cli.archive)
    };

    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}
