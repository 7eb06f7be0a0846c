//! Development tasks for the pktq workspace.
//!
//! Run with: `cargo xtask <command>`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use xshell::{cmd, Shell};

type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error>>;

/// A bolero property in `fuzz/tests`.
struct FuzzTarget {
    test_file: &'static str,
    property: &'static str,
    about: &'static str,
}

const FUZZ_TARGETS: &[FuzzTarget] = &[
    FuzzTarget {
        test_file: "index_word",
        property: "fuzz_index_word",
        about: "packed index reserve and swap",
    },
    FuzzTarget {
        test_file: "mpdb",
        property: "fuzz_mpdb",
        about: "interleaved producers against consumer swaps",
    },
    FuzzTarget {
        test_file: "region_lifecycle",
        property: "fuzz_region_model",
        about: "region state machine",
    },
    FuzzTarget {
        test_file: "region_lifecycle",
        property: "fuzz_real_region",
        about: "SharedRegion checked against the state machine",
    },
];

#[derive(Parser)]
#[command(name = "xtask", about = "Development tasks for pktq")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Unit, conformance and doc tests, plus every fuzz property in smoke mode
    Test,
    /// Fuzz one property with cargo-bolero, or list them all
    Fuzz {
        /// Property name, e.g. `fuzz_mpdb`
        property: Option<String>,
    },
    /// Run the multi-producer example
    Example {
        #[arg(long)]
        release: bool,
    },
    /// Clippy with warnings denied, all targets
    Clippy,
    /// rustfmt check (or `--fix`)
    Fmt {
        #[arg(long)]
        fix: bool,
    },
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("xtask: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result {
    let sh = Shell::new()?;
    sh.change_dir(workspace_root()?);

    match cli.command {
        Command::Test => test(&sh),
        Command::Fuzz { property } => fuzz(&sh, property.as_deref()),
        Command::Example { release } => {
            let release = release.then_some("--release");
            cmd!(sh, "cargo run -p pktq --example basic {release...}").run()?;
            Ok(())
        }
        Command::Clippy => {
            cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
            Ok(())
        }
        Command::Fmt { fix } => {
            let check = (!fix).then_some(["--", "--check"]).into_iter().flatten();
            cmd!(sh, "cargo fmt --all {check...}").run()?;
            Ok(())
        }
    }
}

fn workspace_root() -> Result<PathBuf> {
    let manifest_dir = match std::env::var_os("CARGO_MANIFEST_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir()?.join("xtask"),
    };
    Ok(manifest_dir
        .parent()
        .ok_or("xtask has no parent directory")?
        .to_path_buf())
}

fn test(sh: &Shell) -> Result {
    if cmd!(sh, "cargo nextest --version").quiet().run().is_ok() {
        cmd!(sh, "cargo nextest run --workspace").run()?;
        // nextest skips doctests
        cmd!(sh, "cargo test --workspace --doc").run()?;
    } else {
        cmd!(sh, "cargo test --workspace").run()?;
    }
    Ok(())
}

fn fuzz(sh: &Shell, property: Option<&str>) -> Result {
    let Some(property) = property else {
        println!("fuzz properties (cargo xtask fuzz <property>):");
        for t in FUZZ_TARGETS {
            println!("  {:<20} {}", t.property, t.about);
        }
        println!("\nsmoke run:");
        cmd!(sh, "cargo test -p pktq-fuzz").run()?;
        return Ok(());
    };

    let target = FUZZ_TARGETS
        .iter()
        .find(|t| t.property == property)
        .ok_or_else(|| format!("no fuzz property named `{property}`"))?;

    if cmd!(sh, "cargo bolero --version").quiet().run().is_err() {
        return Err("cargo-bolero is required: cargo install cargo-bolero".into());
    }
    let test_file = target.test_file;
    cmd!(sh, "cargo bolero test {property} -p pktq-fuzz --test {test_file}").run()?;
    Ok(())
}
