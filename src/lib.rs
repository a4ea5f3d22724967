//! Intra-procedural static analysis and backward slicing for
//! WebAssembly functions.
//!
//! The pipeline: a pre-parsed module ([`ingest`]) becomes labelled
//! instruction trees, lowered into flat CFGs ([`builder`]); spec
//! inference ([`ssa`]) names every stack slot with an SSA variable;
//! use-def, control- and memory-dependence relations are derived from
//! the annotations ([`usedef`], [`controldep`], [`memdep`]); and the
//! slicer ([`slice`]) composes them to cut a function down to whatever
//! a criterion instruction depends on, keeping the result stack-valid.

pub mod builder;
pub mod cfg;
pub mod config;
pub mod controldep;
pub mod error;
pub mod fixpoint;
pub mod ingest;
pub mod instr;
pub mod label;
pub mod memdep;
pub mod memory;
pub mod run;
pub mod slice;
pub mod ssa;
pub mod summary;
pub mod transfer;
pub mod tree;
pub mod types;
pub mod usedef;
pub mod value;

pub use cfg::{BasicBlock, BlockContent, BlockIdx, Cfg};
pub use config::Options;
pub use error::AnalysisError;
pub use label::{Label, Section};
pub use slice::{instructions_to_keep, slice};
pub use ssa::{annotate, count_vars, Var, VarState};
