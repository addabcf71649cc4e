//! Build helper: `cargo xtask build-ebpf`, `cargo xtask build`, `cargo xtask run`

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::Command;

const EBPF_MANIFEST: &str = "ipfilter-ebpf/Cargo.toml";
const EBPF_TARGET: &str = "bpfel-unknown-none";

#[derive(Parser)]
enum Cli {
    /// Build the XDP program
    BuildEbpf {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },
    /// Build the XDP program and the daemon
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },
    /// Build in release mode and run the daemon under sudo
    Run {
        /// Config file passed through to ipfilterd
        #[arg(short, long, default_value = "config.txt")]
        config: PathBuf,

        /// Extra arguments for ipfilterd
        #[arg(last = true)]
        extra: Vec<String>,
    },
}

fn main() -> Result<()> {
    match Cli::parse() {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_userspace(release)
        }
        Cli::Run { config, extra } => {
            build_ebpf(true)?;
            build_userspace(true)?;
            run(&config, &extra)
        }
    }
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

fn build_ebpf(release: bool) -> Result<()> {
    println!("Building XDP program ({})...", profile(release));

    let mut args = vec![
        "+nightly",
        "build",
        "--manifest-path",
        EBPF_MANIFEST,
        "--target",
        EBPF_TARGET,
        "-Z",
        "build-std=core",
        "--target-dir",
        "target",
    ];
    if release {
        args.push("--release");
    }
    cargo(&args).context("XDP program build failed")?;

    println!("Built target/{}/{}/ipfilter", EBPF_TARGET, profile(release));
    Ok(())
}

fn build_userspace(release: bool) -> Result<()> {
    println!("Building ipfilterd ({})...", profile(release));

    let mut args = vec!["build", "-p", "ipfilter-control"];
    if release {
        args.push("--release");
    }
    cargo(&args).context("Userspace build failed")
}

fn cargo(args: &[&str]) -> Result<()> {
    let status = Command::new("cargo")
        .args(args)
        .status()
        .context("Failed to run cargo")?;
    if !status.success() {
        bail!("cargo {} exited with {}", args.join(" "), status);
    }
    Ok(())
}

fn run(config: &Path, extra: &[String]) -> Result<()> {
    let object = format!("target/{}/release/ipfilter", EBPF_TARGET);
    println!("Running ipfilterd with {}...", config.display());

    let status = Command::new("sudo")
        .arg("./target/release/ipfilterd")
        .arg("--config")
        .arg(config)
        .args(["--bpf-object", &object])
        .args(extra)
        .status()
        .context("Failed to run ipfilterd")?;

    if !status.success() {
        bail!("ipfilterd exited with {}", status);
    }
    Ok(())
}
