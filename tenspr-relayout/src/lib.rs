//! Layout rematerialization and loop hoisting for tensor kernels.
//!
//! Every tensor value carries an encoding that says how its elements are
//! spread over threads, warps and registers. Moving a value from one
//! encoding to another goes through shared memory and is costly, so this
//! crate removes layout conversions where it can: by recomputing the
//! producers of a converted value directly in the target layout
//! ([`chain`]), and by moving conversions of loop-carried values out of
//! their loop ([`loops`]).
//!
//! Planning ([`remat`]) only reads the graph. A rewrite that cannot be
//! applied leaves the graph unchanged and the conversion in place.

pub mod chain;
pub mod clone;
pub mod config;
pub mod error;
pub mod interp;
pub mod ir;
pub mod loops;
pub mod remat;
pub mod rules;

pub use chain::{rematerialize_all, rematerialize_conversion_chain, try_rematerialize, ChainReport};
pub use clone::{clone_with_infer_type, ValueMapping};
pub use config::RematConfig;
pub use error::{Error, Result};
pub use loops::{can_move_out_of_loop, fixup_loops, hoist_all, hoist_conversion_out_of_loop, HoistReport};
pub use remat::{simulate_backward_rematerialization, RematContext};
pub use rules::{expensive_load_or_store, expensive_to_remat, invert_encoding, LayoutRule, RuleTable};

/// Counts of one [`remove_layout_conversions`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub rematerialized: usize,
    pub hoisted: usize,
    pub fixed: usize,
}

/// Remove as many layout conversions from `graph` as possible.
///
/// Rematerializes conversions, hoists conversions out of loops, then
/// rematerializes what hoisting exposed and closes with [`fixup_loops`].
/// Only a [fatal](Error::is_fatal) error is returned.
pub fn remove_layout_conversions(graph: &mut ir::Graph, rules: &RuleTable, config: &RematConfig) -> Result<PassStats> {
    let mut stats = PassStats::default();
    stats.rematerialized += rematerialize_all(graph, rules, config);
    stats.hoisted += hoist_all(graph, rules, config);
    stats.rematerialized += rematerialize_all(graph, rules, config);
    stats.fixed = fixup_loops(graph)?;
    log::debug!("relayout: {stats:?}");
    Ok(stats)
}
