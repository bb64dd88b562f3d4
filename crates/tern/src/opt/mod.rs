mod cleanup;
mod escape;
mod inline;
mod lift;
mod tailcall;

pub use cleanup::*;
pub use escape::*;
pub use inline::*;
pub use lift::*;
pub use tailcall::*;

use std::mem;

use crate::ir::{dump_function, IrModule};

/// Pass selection for [`optimize_module`]. Everything defaults to on;
/// the driver flips individual passes off for debugging.
#[derive(Clone, Copy, Debug)]
pub struct OptOptions {
	pub lift: bool,
	pub tail_calls: bool,
	pub inline: bool,
	pub stack_promotion: bool,
	/// Upper bound on module-level rounds. Each round runs every
	/// function to its own fixpoint; another round starts only when
	/// some function changed.
	pub max_rounds: u32,
}

impl Default for OptOptions {
	fn default() -> Self {
		Self {
			lift: true,
			tail_calls: true,
			inline: true,
			stack_promotion: true,
			max_rounds: 8,
		}
	}
}

/// Runs the pipeline over every function with a body. Rounds repeat at
/// module level because inlining one function can open up work in its
/// callers, and closure bodies sit after their parents in the function
/// list.
pub fn optimize_module(module: &mut IrModule, options: &OptOptions) {
	let trace = std::env::var("TERN_OPT_TRACE").is_ok_and(|v| v == "1");
	// Nothing is inlinable until its own pipeline has run, so a body is
	// only ever spliced in after it has been optimized at least once.
	for fun in &mut module.functions {
		fun.can_inline = false;
	}
	for round in 0..options.max_rounds {
		let mut changed = false;
		for index in 0..module.functions.len() {
			changed |= optimize_function(module, index, options, trace, round);
		}
		if !changed {
			break;
		}
	}
}

fn optimize_function(
	module: &mut IrModule,
	index: usize,
	options: &OptOptions,
	trace: bool,
	round: u32,
) -> bool {
	if !module.functions[index].has_body() {
		return false;
	}
	// The function is taken out of the module so inlining can read
	// other functions while rewriting this one.
	let mut fun = mem::take(&mut module.functions[index]);
	let types = &module.types;
	let mut changed = cleanup(&mut fun);
	loop {
		let mut round_changed = false;
		if options.lift && lift_allocs(types, &mut fun, false) {
			round_changed = true;
			cleanup(&mut fun);
		}
		if options.tail_calls && rewrite_tail_calls(types, &mut fun) {
			round_changed = true;
			cleanup(&mut fun);
		}
		if options.inline && inline_static_calls(module, &mut fun) {
			round_changed = true;
			cleanup(&mut fun);
		}
		if options.inline && inline_closure_calls(module, &mut fun) {
			round_changed = true;
			cleanup(&mut fun);
		}
		if options.stack_promotion && promote_stack(&mut fun) {
			round_changed = true;
			cleanup(&mut fun);
		}
		if !round_changed {
			break;
		}
		changed = true;
	}
	// Parameter spill slots stay while tail calls might still appear;
	// a loop-free function can trade them for direct argument reads.
	if options.lift && !fun.self_calls(fun.id) && lift_allocs(types, &mut fun, true) {
		cleanup(&mut fun);
		changed = true;
	}
	fun.can_inline = !fun.self_calls(fun.id);
	if trace && changed {
		eprintln!("; after round {round}\n{}", dump_function(module, &fun));
	}
	module.functions[index] = fun;
	changed
}
