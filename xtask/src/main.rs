use anyhow::Context as _;
use pico_args::Arguments;
use std::{
    env,
    ffi::OsString,
    fs, io,
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};
use wait_timeout::ChildExt as _;

/// The library crates, in dependency order.
const PACKAGES: &[&str] = &["fusecore-kernel", "fusecore"];

const DEMO_PACKAGE: &str = "fusecore-demo-memfs-shell";

/// Upper bound of a single test suite run. A hung loopback session fails the run.
const SUITE_TIMEOUT: Duration = Duration::from_secs(60 * 5);

const CARGO_DOC_TIMEOUT: Duration = Duration::from_secs(60 * 15);

fn main() -> anyhow::Result<()> {
    let show_help = || {
        eprintln!(
            "\
cargo-xtask
Workspace automation for fusecore

Usage:
    cargo xtask <SUBCOMMAND>

Subcommands:
    lint                    Check formatting and run clippy
    test [-p PACKAGE]       Run the unit and loopback suites
    doc                     Build API docs of the library crates
    demo [-- ARGS...]       Start the in-memory filesystem shell

Flags:
    -h, --help  Show this message
"
        );
    };

    let mut args = Arguments::from_env();

    if args.contains(["-h", "--help"]) {
        show_help();
        return Ok(());
    }

    let subcommand = args.subcommand()?;
    match subcommand.as_deref() {
        Some("lint") => {
            finish(args)?;
            do_lint()
        }
        Some("test") => {
            let package: Option<String> = args.opt_value_from_str(["-p", "--package"])?;
            finish(args)?;
            do_test(package.as_deref())
        }
        Some("doc") => {
            finish(args)?;
            do_doc()
        }
        Some("demo") => do_demo(args.finish()),
        Some(subcommand) => {
            show_help();
            anyhow::bail!("unknown subcommand: {}", subcommand);
        }
        None => {
            show_help();
            anyhow::bail!("missing subcommand");
        }
    }
}

/// Reject arguments left over after parsing a subcommand.
fn finish(args: Arguments) -> anyhow::Result<()> {
    let rest = args.finish();
    anyhow::ensure!(rest.is_empty(), "unexpected arguments: {:?}", rest);
    Ok(())
}

fn do_lint() -> anyhow::Result<()> {
    if cargo().args(["fmt", "--version"]).run_silent().is_ok() {
        cargo().args(["fmt", "--all", "--", "--check"]).run()?;
    } else {
        eprintln!("[cargo-xtask] rustfmt is not installed; skip format check");
    }

    if cargo().args(["clippy", "--version"]).run_silent().is_ok() {
        cargo()
            .args(["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])
            .run()?;
    } else {
        eprintln!("[cargo-xtask] clippy is not installed; skip lints");
    }

    Ok(())
}

fn do_test(package: Option<&str>) -> anyhow::Result<()> {
    let packages = match package {
        Some(package) => {
            anyhow::ensure!(
                PACKAGES.contains(&package),
                "unknown package {:?} (expected one of {:?})",
                package,
                PACKAGES
            );
            vec![package]
        }
        None => PACKAGES.to_vec(),
    };

    for package in packages {
        // kernel layout assertions are unit tests; they run before the encoders' tests.
        cargo()
            .args(["test", "--lib", "--package", package])
            .run_timeout(SUITE_TIMEOUT)?;

        if package == "fusecore" {
            cargo()
                .args(["test", "--package", package, "--test", "loopback"])
                .env("RUST_LOG", env::var_os("RUST_LOG").unwrap_or_else(|| "warn".into()))
                .run_timeout(SUITE_TIMEOUT)?;
        }

        cargo()
            .args(["test", "--doc", "--package", package])
            .run_timeout(SUITE_TIMEOUT)?;
    }

    if package.is_none() {
        cargo()
            .args(["build", "--package", DEMO_PACKAGE])
            .run()?;
    }

    Ok(())
}

fn do_doc() -> anyhow::Result<()> {
    let doc_dir = target_dir().join("doc");
    if doc_dir.exists() {
        fs::remove_dir_all(&doc_dir)?;
    }

    for package in PACKAGES {
        cargo()
            .arg("doc")
            .arg("--no-deps")
            .arg(format!("--package={}", package))
            .env("RUSTDOCFLAGS", "-D warnings")
            .run_timeout(CARGO_DOC_TIMEOUT)?;
    }

    let lockfile = doc_dir.join(".lock");
    if lockfile.exists() {
        fs::remove_file(lockfile)?;
    }

    fs::write(
        doc_dir.join("index.html"),
        "<meta http-equiv=\"refresh\" content=\"0;url=fusecore\">\n",
    )?;

    Ok(())
}

fn do_demo(rest: Vec<OsString>) -> anyhow::Result<()> {
    // the `--` separator may remain among the free arguments.
    let rest = rest.into_iter().skip_while(|arg| arg == "--");

    cargo()
        .args(["run", "--quiet", "--package", DEMO_PACKAGE, "--"])
        .args(rest)
        .stdin(Stdio::inherit())
        .run()
}

fn cargo() -> Command {
    let cargo = env::var_os("CARGO")
        .or_else(|| option_env!("CARGO").map(Into::into))
        .unwrap_or_else(|| "cargo".into());
    let mut command = Command::new(cargo);
    command.current_dir(project_root());
    command.stdin(Stdio::null());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());
    command.env("CARGO_INCREMENTAL", "0");
    command.env("RUST_BACKTRACE", "1");
    command
}

trait CommandExt {
    fn run(&mut self) -> anyhow::Result<()>;
    fn run_timeout(&mut self, timeout: Duration) -> anyhow::Result<()>;
    fn run_silent(&mut self) -> anyhow::Result<()>;
}

impl CommandExt for Command {
    fn run(&mut self) -> anyhow::Result<()> {
        run_impl(self, None)
    }

    fn run_timeout(&mut self, timeout: Duration) -> anyhow::Result<()> {
        run_impl(self, Some(timeout))
    }

    fn run_silent(&mut self) -> anyhow::Result<()> {
        self.stdout(Stdio::null());
        self.stderr(Stdio::null());
        self.run()
    }
}

fn run_impl(cmd: &mut Command, timeout: Option<Duration>) -> anyhow::Result<()> {
    eprintln!("[cargo-xtask] run {:?}", cmd);

    let mut child = cmd.spawn().context("failed to spawn the subprocess")?;

    let status = match timeout {
        None => child.wait()?,
        Some(timeout) => match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                match child.kill() {
                    // the child exited between the timeout and the kill.
                    Err(err) if err.kind() == io::ErrorKind::InvalidInput => (),
                    result => result?,
                }
                child.wait()?;
                anyhow::bail!("subprocess timed out after {:?}", timeout);
            }
        },
    };

    anyhow::ensure!(status.success(), "subprocess failed: {}", status);

    Ok(())
}

fn project_root() -> PathBuf {
    let manifest_dir = env::var_os("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .or_else(|| option_env!("CARGO_MANIFEST_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./xtask"));
    match manifest_dir.parent() {
        Some(root) if !root.as_os_str().is_empty() => root.to_owned(),
        _ => PathBuf::from("."),
    }
}

fn target_dir() -> PathBuf {
    env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| project_root().join("target"))
}
