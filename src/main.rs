use std::io::Write;

#[macro_use]
mod macros;

mod analysis;
mod args;
mod artifact;
mod cmd;
mod context;
mod format;
mod orchestrator;
mod quality;
mod sink;
mod stats;
mod store;
mod util;
mod wasm;

const USAGE: &'static str = "\
A gauge for comparing WebAssembly code generators on a fixed set of workloads.

USAGE:
    wasmgauge <command> ...

COMMANDS:
    analyze   Re-run quality filtering and statistics on a persisted run.
    cmp       Print a comparison table from benchmark results.
    measure   Execute a run specification and persist raw and derived results.
    version   Print the version of wasmgauge and exit.

";

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn"),
    )
    .init();
    match run(&mut lexopt::Parser::from_env()) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if std::env::var("RUST_BACKTRACE").map_or(false, |v| v == "1") {
                writeln!(&mut std::io::stderr(), "{:?}", err).unwrap();
            } else {
                writeln!(&mut std::io::stderr(), "{:#}", err).unwrap();
            }
            std::process::exit(1);
        }
    }
}

fn run(p: &mut lexopt::Parser) -> anyhow::Result<i32> {
    let cmd = args::next_as_command(USAGE, p)?;
    match &*cmd {
        "analyze" => cmd::analyze::run(p),
        "cmp" => cmd::cmp::run(p),
        "measure" => cmd::measure::run(p),
        "version" => cmd::version::run(p),
        unk => anyhow::bail!("unrecognized command '{}'", unk),
    }
}
