/// Tunable knobs of rematerialization and hoisting.
///
/// The layout and clone limits are heuristics: a cone that touches many
/// layouts usually means the rewrite fragments the program rather than
/// simplifying it, and long cones trade one conversion for many duplicated
/// operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RematConfig {
    /// Warps per CTA of the target kernel.
    pub num_warps: u32,
    /// Threads per warp of the target device.
    pub threads_per_warp: u32,
    /// Most distinct encodings a single cone may touch.
    pub max_layouts: usize,
    /// Most operations a single rematerialization may clone.
    pub max_remat_ops: usize,
    /// Treat reductions as cheap enough to duplicate.
    pub remat_reductions: bool,
}

impl Default for RematConfig {
    fn default() -> Self {
        RematConfig {
            num_warps: 4,
            threads_per_warp: 32,
            max_layouts: 4,
            max_remat_ops: 16,
            remat_reductions: false,
        }
    }
}

impl RematConfig {
    /// Threads in one CTA.
    pub fn num_threads(&self) -> usize {
        (self.num_warps * self.threads_per_warp) as usize
    }
}
