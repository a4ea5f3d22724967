//! The analysis driver behind the binary: parse, analyze, print.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use termcolor::{Color, ColorSpec, WriteColor};
use wirm::Module;

use crate::builder::build_cfg;
use crate::cfg::{BlockContent, Cfg};
use crate::config::Options;
use crate::ingest::ingest_module;
use crate::label::Label;
use crate::slice::{instructions_to_keep, slice};
use crate::ssa::{annotate, VarState};

pub const SPACE_PER_TAB: usize = 4;

/// What one invocation should do.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Restrict to one function index.
    pub function: Option<u32>,
    /// Slice criterion: a label id in the function section.
    pub criterion: Option<u32>,
    /// Directory to drop per-function `.dot` files into.
    pub dot_dir: Option<String>,
    pub opts: Options,
}

/// Analyze every local function of a module: annotate, optionally
/// slice, and print an annotated listing.
pub fn do_analysis<W: WriteColor>(
    mut out: W,
    wasm_bytes: &[u8],
    config: &RunConfig,
) -> anyhow::Result<()> {
    let mut wasm = Module::parse(wasm_bytes, false, true)
        .map_err(|e| anyhow!("failed to parse wasm module: {e:?}"))?;
    let functions = ingest_module(&mut wasm)?;

    for func in &functions {
        if let Some(only) = config.function {
            if func.idx != only {
                continue;
            }
        }
        let cfg = build_cfg(func)?;
        let annotated = annotate(&cfg, &config.opts)?;

        let kept = match config.criterion {
            Some(id) => {
                let criterion = Label::function(id);
                let kept = instructions_to_keep(&annotated, criterion)?;
                // Also materialise the sliced CFG; its validation is
                // part of the run.
                let sliced = slice(&annotated, criterion, &config.opts)?;
                if let Some(dir) = &config.dot_dir {
                    write_dot(&mut out, dir, &format!("f{}_slice.dot", func.idx), &sliced.to_dot(|_| String::new()))?;
                }
                Some(kept)
            }
            None => None,
        };

        flush_function(&mut out, &annotated, kept.as_ref())?;

        if let Some(dir) = &config.dot_dir {
            let dot = annotated.to_dot(|a| a.to_string());
            write_dot(&mut out, dir, &format!("f{}.dot", func.idx), &dot)?;
        }
    }
    Ok(())
}

fn write_dot<W: WriteColor>(out: &mut W, dir: &str, name: &str, dot: &str) -> anyhow::Result<()> {
    let path = PathBuf::from(dir).join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(&path, dot).with_context(|| format!("writing {}", path.display()))?;
    writeln!(out, "wrote {}", path.display())?;
    Ok(())
}

/// Annotated listing of one function, one line per instruction, with
/// kept instructions marked.
fn flush_function<W: WriteColor>(
    out: &mut W,
    cfg: &Cfg<VarState>,
    kept: Option<&std::collections::BTreeSet<Label>>,
) -> anyhow::Result<()> {
    writeln!(out, "function #{} ({} instructions):", cfg.func_idx, cfg.instruction_count())?;
    let mut tabs = 1;
    if let Some(kept) = kept {
        writeln!(out, "{}in slice: {} instructions", tab(tabs), kept.len())?;
    }
    tabs += 1;
    for (idx, block) in &cfg.blocks {
        let role = if *idx == cfg.entry_block {
            " (entry)"
        } else if *idx == cfg.exit_block {
            " (exit)"
        } else if cfg.loop_heads.contains(idx) {
            " (loop head)"
        } else {
            ""
        };
        writeln!(out, "{}block {idx}{role}:", tab(tabs - 1))?;
        let labels = match &block.content {
            BlockContent::Data(ls) => ls.clone(),
            BlockContent::Control(l) | BlockContent::Merge(l) => vec![*l],
        };
        for label in labels {
            let instr = cfg.find_instr(label)?;
            let in_slice = kept.map(|k| k.contains(&label)).unwrap_or(false);
            let mark = if in_slice { "*" } else { " " };
            let line = format!("{}{label}\t{mark} {instr}  {}\n", tab(tabs), instr.after);
            if in_slice {
                green(&mut *out, true, &line);
            } else {
                write!(out, "{line}")?;
            }
        }
    }
    writeln!(out)?;
    Ok(())
}

// ===========================
// = Terminal Printing Logic =
// ===========================

const WRITE_ERR: &str = "Uh oh, something went wrong while printing to terminal";

pub fn color<W: WriteColor>(mut out: W, s: &str, bold: bool, c: Color) {
    out.set_color(ColorSpec::new().set_bold(bold).set_fg(Some(c))).expect(WRITE_ERR);
    write!(out, "{}", s).expect(WRITE_ERR);
    out.set_color(&ColorSpec::default()).expect(WRITE_ERR);
}

pub fn green<W: WriteColor>(out: W, bold: bool, s: &str) {
    color(out, s, bold, Color::Green)
}

pub fn red<W: WriteColor>(out: W, bold: bool, s: &str) {
    color(out, s, bold, Color::Red)
}

pub fn tab(tab: usize) -> String {
    " ".repeat(SPACE_PER_TAB * tab)
}
