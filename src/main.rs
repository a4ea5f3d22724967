use anyhow::{bail, Result};
use termcolor::{ColorChoice, StandardStream};

use wasm_slice::config::Options;
use wasm_slice::run::{do_analysis, RunConfig};

/// Static analysis and backward slicing for WebAssembly.
///
/// This program:
///  - Loads a wasm module
///  - Builds a CFG in SSA form for every local function
///  - Optionally computes the backward slice of one instruction
///  - Prints an annotated listing (kept instructions in green) and can
///    dump the CFGs as `.dot`
fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        bail!(
            "Usage: wasm-slice <file.wasm> [--function N] [--criterion LABEL] [--dot DIR]\n\
             \x20      [--no-propagate-locals] [--no-propagate-globals] [--no-const] [--keep-blocks]"
        );
    }

    let mut config = RunConfig::default();
    let mut opts = Options::default();
    let mut file: Option<String> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--function" => {
                i += 1;
                config.function = Some(parse_u32(&args, i, "--function")?);
            }
            "--criterion" => {
                i += 1;
                config.criterion = Some(parse_u32(&args, i, "--criterion")?);
            }
            "--dot" => {
                i += 1;
                config.dot_dir =
                    Some(args.get(i).cloned().ok_or_else(|| anyhow::anyhow!("--dot needs a directory"))?);
            }
            "--no-propagate-locals" => opts.propagate_locals = false,
            "--no-propagate-globals" => opts.propagate_globals = false,
            "--no-const" => opts.use_const = false,
            "--keep-blocks" => opts.keep_entire_blocks = true,
            other if file.is_none() => file = Some(other.to_string()),
            other => bail!("unexpected argument: {}", other),
        }
        i += 1;
    }
    config.opts = opts;

    let Some(file) = file else {
        bail!("no input file given");
    };
    let bytes = std::fs::read(&file)?;

    let out = StandardStream::stdout(ColorChoice::Auto);
    do_analysis(out.lock(), &bytes, &config)?;
    Ok(())
}

fn parse_u32(args: &[String], i: usize, flag: &str) -> Result<u32> {
    let Some(raw) = args.get(i) else {
        bail!("{flag} needs a value");
    };
    Ok(raw.parse()?)
}
