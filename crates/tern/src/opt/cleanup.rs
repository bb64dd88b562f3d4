use std::collections::{HashMap, HashSet};

use crate::ir::{IrBlockId, IrFunction, IrStmtId, IrStmtKind};

/// Dead-code and control-flow cleanup. Runs between every other pass;
/// the rest of the pipeline relies on it to physically remove deleted
/// statements, drop unreachable blocks, and renumber densely.
///
/// The first body block is never merged into block 0, which keeps
/// block 0 a pure prologue with a known jump target for loop rewrites.
pub fn cleanup(fun: &mut IrFunction) -> bool {
	let mut changed = delete_dead(fun);
	changed |= strip_deleted(fun);
	changed |= collapse_blocks(fun);
	fun.recompute_preds();
	fun.renumber();
	changed
}

/// Deletion propagation: unused values, write-only allocations, and
/// self-copies, to a fixpoint.
fn delete_dead(fun: &mut IrFunction) -> bool {
	let mut changed = false;
	loop {
		let mut round = false;
		for id in fun.placed_stmts() {
			if !fun.is_alive(id) {
				continue;
			}
			if fun.stmt(id).kind.produces_value() {
				if fun.value(id).is_some_and(|def| def.users.is_empty()) {
					fun.mark_deleted(id);
					round = true;
					continue;
				}
				if matches!(fun.stmt(id).kind, IrStmtKind::Alloc { .. }) {
					let users: Vec<IrStmtId> = fun
						.value(id)
						.map(|def| def.users.iter().copied().collect())
						.unwrap_or_default();
					let write_only = users
						.iter()
						.all(|user| fun.stmt(*user).kind.write_dst() == Some(id));
					if write_only {
						for user in users {
							fun.mark_deleted(user);
						}
						fun.mark_deleted(id);
						round = true;
					}
				}
				continue;
			}
			if matches!(fun.stmt(id).kind, IrStmtKind::Copy { dst, src } if dst == src) {
				fun.mark_deleted(id);
				round = true;
			}
		}
		changed |= round;
		if !round {
			break;
		}
	}
	changed
}

/// Physical removal of deleted statements and comments from block
/// lists. The arena slots stay behind; nothing references them anymore.
fn strip_deleted(fun: &mut IrFunction) -> bool {
	for id in fun.placed_stmts() {
		if matches!(fun.stmt(id).kind, IrStmtKind::Comment(_)) {
			fun.mark_deleted(id);
		}
	}
	let mut changed = false;
	let stmts = &fun.stmts;
	for block in &mut fun.blocks {
		let before = block.stmts.len();
		block.stmts.retain(|id| !stmts[id.0 as usize].deleted);
		changed |= block.stmts.len() != before;
	}
	changed
}

fn collapse_blocks(fun: &mut IrFunction) -> bool {
	let mut changed = false;
	loop {
		fun.recompute_preds();
		if drop_unreachable(fun) {
			changed = true;
			continue;
		}
		if splice_jump_chains(fun) {
			changed = true;
			continue;
		}
		if merge_single_pred(fun) {
			changed = true;
			continue;
		}
		break;
	}
	changed
}

fn drop_unreachable(fun: &mut IrFunction) -> bool {
	let mut reachable = HashSet::new();
	let mut worklist = vec![fun.entry()];
	while let Some(block) = worklist.pop() {
		if !reachable.insert(block) {
			continue;
		}
		if let Some(last) = fun.block(block).stmts.last() {
			worklist.extend(fun.stmt(*last).kind.successors());
		}
	}
	if reachable.len() == fun.blocks.len() {
		return false;
	}
	let dead: Vec<IrStmtId> = fun
		.blocks
		.iter()
		.filter(|b| !reachable.contains(&b.id))
		.flat_map(|b| b.stmts.iter().copied())
		.collect();
	for id in dead {
		fun.mark_deleted(id);
	}
	fun.blocks.retain(|b| reachable.contains(&b.id));
	true
}

/// Redirect edges through blocks that contain nothing but a jump. The
/// emptied blocks become unreachable and fall to the next round.
fn splice_jump_chains(fun: &mut IrFunction) -> bool {
	let entry = fun.entry();
	let mut forward: HashMap<IrBlockId, IrBlockId> = HashMap::new();
	for block in &fun.blocks {
		if block.id == entry || block.stmts.len() != 1 {
			continue;
		}
		if let IrStmtKind::Jump { to } = fun.stmt(block.stmts[0]).kind
			&& to != block.id
		{
			forward.insert(block.id, to);
		}
	}
	if forward.is_empty() {
		return false;
	}
	let resolve = |mut block: IrBlockId| {
		let mut seen = HashSet::new();
		while let Some(next) = forward.get(&block) {
			if !seen.insert(block) {
				break;
			}
			block = *next;
		}
		block
	};
	let mut changed = false;
	let terminators: Vec<IrStmtId> = fun
		.blocks
		.iter()
		.filter_map(|b| b.stmts.last().copied())
		.collect();
	for id in terminators {
		fun.stmt_mut(id).kind.for_each_successor_mut(|target| {
			let resolved = resolve(*target);
			if resolved != *target {
				*target = resolved;
				changed = true;
			}
		});
	}
	changed
}

/// Merge a block into its unique jump-predecessor. One merge per call;
/// the caller loops. Block 0 never absorbs its successor.
fn merge_single_pred(fun: &mut IrFunction) -> bool {
	let entry = fun.entry();
	let candidate = fun.blocks.iter().find_map(|block| {
		if block.id == entry || block.preds.len() != 1 {
			return None;
		}
		let pred = block.preds[0];
		if pred == block.id || pred == entry {
			return None;
		}
		let last = *fun.block(pred).stmts.last()?;
		match fun.stmt(last).kind {
			IrStmtKind::Jump { to } if to == block.id => Some((pred, block.id, last)),
			_ => None,
		}
	});
	let Some((pred, block, jump)) = candidate else {
		return false;
	};
	fun.mark_deleted(jump);
	fun.block_mut(pred).stmts.pop();
	let moved = std::mem::take(&mut fun.block_mut(block).stmts);
	fun.block_mut(pred).stmts.extend(moved);
	let position = fun.block_position(block).expect("merged block exists");
	fun.blocks.remove(position);
	true
}

#[cfg(test)]
mod tests {
	use super::cleanup;
	use crate::ir::{lower_program, verify_module, IrStmtKind};
	use crate::sem::{Exp, FnDecl, Program, Stm, TypeTable, VarDecl};

	fn lowered(locals: Vec<VarDecl>, body: Vec<Stm>) -> crate::ir::IrModule {
		let types = TypeTable::new();
		let unit = types.builtins.unit;
		let program = Program {
			types,
			globals: Vec::new(),
			fns: vec![FnDecl {
				name: "f".to_string(),
				key: None,
				params: Vec::new(),
				ret: unit,
				locals,
				body: Some(body),
				is_test: false,
			}],
		};
		lower_program(&program).expect("lowering")
	}

	#[test]
	fn removes_write_only_locals() {
		let types = TypeTable::new();
		let int = types.builtins.int;
		let mut module = lowered(
			vec![VarDecl {
				name: "x".to_string(),
				ty: int,
			}],
			vec![
				Stm::Assign {
					local: 0,
					value: Exp::Int(5),
				},
				Stm::Return(None),
			],
		);
		cleanup(&mut module.functions[0]);
		let fun = &module.functions[0];
		assert_eq!(
			fun.placed_stmts()
				.iter()
				.filter(|id| matches!(
					fun.stmt(**id).kind,
					IrStmtKind::Alloc { .. } | IrStmtKind::Store { .. }
				))
				.count(),
			0
		);
		verify_module(&module).expect("clean module verifies");
	}

	#[test]
	fn drops_unreachable_code_after_return() {
		let mut module = lowered(
			Vec::new(),
			vec![Stm::Return(None), Stm::Expr(Exp::Int(1))],
		);
		let before = module.functions[0].blocks.len();
		cleanup(&mut module.functions[0]);
		let fun = &module.functions[0];
		assert!(fun.blocks.len() < before);
		assert!(
			fun.placed_stmts()
				.iter()
				.all(|id| !matches!(fun.stmt(*id).kind, IrStmtKind::IntConst(1)))
		);
		verify_module(&module).expect("clean module verifies");
	}

	#[test]
	fn never_merges_the_body_into_block_zero() {
		let mut module = lowered(Vec::new(), vec![Stm::Return(None)]);
		cleanup(&mut module.functions[0]);
		let fun = &module.functions[0];
		// Block 0 keeps its jump even when the body is a lone return.
		assert_eq!(fun.blocks.len(), 2);
		let entry_last = *fun.blocks[0].stmts.last().expect("entry terminator");
		assert!(matches!(fun.stmt(entry_last).kind, IrStmtKind::Jump { .. }));
	}

	#[test]
	fn reaches_a_fixpoint() {
		let types = TypeTable::new();
		let int = types.builtins.int;
		let mut module = lowered(
			vec![VarDecl {
				name: "x".to_string(),
				ty: int,
			}],
			vec![
				Stm::Assign {
					local: 0,
					value: Exp::Int(5),
				},
				Stm::Return(None),
				Stm::Expr(Exp::Int(9)),
			],
		);
		assert!(cleanup(&mut module.functions[0]));
		assert!(!cleanup(&mut module.functions[0]));
	}

	#[test]
	fn renumbers_densely() {
		let types = TypeTable::new();
		let int = types.builtins.int;
		let mut module = lowered(
			vec![VarDecl {
				name: "x".to_string(),
				ty: int,
			}],
			vec![
				Stm::Assign {
					local: 0,
					value: Exp::Int(5),
				},
				Stm::Return(None),
			],
		);
		cleanup(&mut module.functions[0]);
		let fun = &module.functions[0];
		let mut nums: Vec<u32> = fun
			.placed_stmts()
			.iter()
			.filter_map(|id| fun.value(*id).map(|def| def.num))
			.collect();
		let sorted = nums.clone();
		nums.sort();
		assert_eq!(nums, sorted);
		assert_eq!(nums, (0..nums.len() as u32).collect::<Vec<_>>());
	}
}
