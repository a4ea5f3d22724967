use wasm_slice::builder::build_cfg;
use wasm_slice::cfg::Cfg;
use wasm_slice::config::Options;
use wasm_slice::ingest::ingest_module;
use wasm_slice::label::Label;
use wasm_slice::ssa::{annotate, VarState};
use wirm::Module;

/// Parse a wat module, ingest it and return the annotated CFG of its
/// first local function.
pub fn annotated(wat_src: &str) -> Cfg<VarState> {
    annotated_with(wat_src, &Options::default())
}

pub fn annotated_with(wat_src: &str, opts: &Options) -> Cfg<VarState> {
    let bytes = wat::parse_str(wat_src).expect("valid wat");
    let mut module = Module::parse(&bytes, false, true).expect("valid wasm");
    let funcs = ingest_module(&mut module).expect("supported operator subset");
    let func = funcs.first().expect("at least one function");
    let cfg = build_cfg(func).expect("lowering succeeds");
    annotate(&cfg, opts).expect("annotation succeeds")
}

/// Shorthand for a function-section label.
pub fn fl(id: u32) -> Label {
    Label::function(id)
}
