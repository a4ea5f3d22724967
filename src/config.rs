//! Analysis options, passed explicitly through every entry point.

/// Knobs read by spec inference, the use-def engine and the slicer.
/// These are set once at the boundary and treated as immutable for the
/// duration of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Locals propagate through `local.get/set/tee` without minting
    /// fresh variables.
    pub propagate_locals: bool,
    /// Same for globals through `global.get/set`.
    pub propagate_globals: bool,
    /// Constants collapse to `Var::Const` instead of fresh defining vars.
    pub use_const: bool,
    /// The slicer keeps every instruction of a block that contains at
    /// least one kept instruction (coarse but fast).
    pub keep_entire_blocks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            propagate_locals: true,
            propagate_globals: true,
            use_const: true,
            keep_entire_blocks: false,
        }
    }
}
