use std::collections::{BTreeSet, HashMap};

use crate::ir::{
	IrFunId, IrFunction, IrModule, IrStmt, IrStmtId, IrStmtKind, IrValueDef, SubstMap,
};

/// Inline every eligible static call in `caller`. Eligible callees have
/// a body, no remaining calls of their own, no far returns, and are not
/// self-recursive; test functions keep their calls observable.
pub fn inline_static_calls(module: &IrModule, caller: &mut IrFunction) -> bool {
	if caller.is_test {
		return false;
	}
	let mut changed = false;
	loop {
		let site = caller.placed_stmts().into_iter().find_map(|id| {
			if !caller.is_alive(id) {
				return None;
			}
			let IrStmtKind::Call { fun, args } = &caller.stmt(id).kind else {
				return None;
			};
			let callee = module.function(*fun);
			if !callee.can_inline
				|| !callee.has_body()
				|| callee.has_static_calls()
				|| callee.has_far_return()
			{
				return None;
			}
			Some((id, args.clone(), *fun))
		});
		let Some((call, args, target)) = site else {
			break;
		};
		splice_body(caller, module.function(target), call, &args, None);
		changed = true;
	}
	if changed {
		caller.recompute_preds();
	}
	changed
}

/// Inline indirect calls whose receiver provably is one specific
/// closure built in this same function. The closure's body replaces the
/// call; its state accesses read the captured record in place, and a
/// far return collapses to an ordinary return once it reaches its home.
pub fn inline_closure_calls(module: &IrModule, caller: &mut IrFunction) -> bool {
	if caller.is_test {
		return false;
	}
	let mut changed = false;
	loop {
		let mut site = None;
		for id in caller.placed_stmts() {
			if !caller.is_alive(id) {
				continue;
			}
			let IrStmtKind::VirtualCall { receiver, args } = &caller.stmt(id).kind
			else {
				continue;
			};
			let Some((target, env)) = resolve_receiver(caller, *receiver) else {
				continue;
			};
			let callee = module.function(target);
			if !callee.can_inline
				|| !callee.has_body()
				|| callee.has_static_calls()
				|| has_virtual_calls(callee)
			{
				continue;
			}
			site = Some((id, args.clone(), target, env));
			break;
		}
		let Some((call, args, target, env)) = site else {
			break;
		};
		let captures = capture_operands(caller, env);
		splice_body(
			caller,
			module.function(target),
			call,
			&args,
			Some((env, captures)),
		);
		changed = true;
	}
	if changed {
		caller.recompute_preds();
	}
	changed
}

/// Field operands of the aggregate backing a closure's state, when the
/// record provably has exactly one initializing construction. Capture
/// records are never written again after construction, so field loads
/// inside the inlined body can read these operands directly.
fn capture_operands(fun: &IrFunction, env: IrStmtId) -> Option<Vec<IrStmtId>> {
	let writers: Vec<IrStmtId> = fun
		.value(env)?
		.users
		.iter()
		.copied()
		.filter(|user| fun.stmt(*user).kind.write_dst() == Some(env))
		.collect();
	let &[writer] = &writers[..] else {
		return None;
	};
	match &fun.stmt(writer).kind {
		IrStmtKind::MakeAnd { fields, .. } => Some(fields.clone()),
		_ => None,
	}
}

fn has_virtual_calls(fun: &IrFunction) -> bool {
	fun.live_stmts()
		.any(|stmt| matches!(stmt.kind, IrStmtKind::VirtualCall { .. }))
}

/// Walk a receiver back through single-writer copies to the dispatch
/// record that produced it.
fn resolve_receiver(fun: &IrFunction, receiver: IrStmtId) -> Option<(IrFunId, IrStmtId)> {
	let mut current = receiver;
	for _ in 0..32 {
		if !matches!(fun.stmt(current).kind, IrStmtKind::Alloc { .. }) {
			return None;
		}
		let writers: Vec<IrStmtId> = fun
			.value(current)?
			.users
			.iter()
			.copied()
			.filter(|user| fun.stmt(*user).kind.write_dst() == Some(current))
			.collect();
		let &[writer] = &writers[..] else {
			return None;
		};
		match fun.stmt(writer).kind {
			IrStmtKind::MakeVirtual { env, fun: target, .. } => {
				return Some((target, env));
			}
			IrStmtKind::Copy { src, .. } => current = src,
			_ => return None,
		}
	}
	None
}

/// Splice `callee`'s body over the call statement `call`. `args` aligns
/// with the callee's argument slots (return slot included); `env`, when
/// present, stands in for argument 0 of a closure body and carries the
/// construction-site capture operands for field-load forwarding.
fn splice_body(
	caller: &mut IrFunction,
	callee: &IrFunction,
	call: IrStmtId,
	args: &[IrStmtId],
	env: Option<(IrStmtId, Option<Vec<IrStmtId>>)>,
) {
	let (call_block, position) = caller.placement(call).expect("inlined call is placed");

	// Split the block: everything after the call moves to the
	// continuation, and the call itself goes away.
	let continuation = caller.add_block();
	let tail = caller.block_mut(call_block).stmts.split_off(position + 1);
	caller.block_mut(continuation).stmts = tail;
	caller.block_mut(call_block).stmts.pop();
	caller.mark_deleted(call);

	let mut block_map = HashMap::new();
	for block in &callee.blocks {
		block_map.insert(block.id, caller.add_block());
	}

	// First pass reserves arena slots so operand references can be
	// remapped independent of statement order.
	let mut stmt_map: HashMap<IrStmtId, IrStmtId> = HashMap::new();
	for block in &callee.blocks {
		for source in &block.stmts {
			let new_id = IrStmtId(caller.stmts.len() as u32);
			let result = callee.stmt(*source).result.as_ref().map(|def| {
				let num = caller.next_num;
				caller.next_num += 1;
				IrValueDef {
					num,
					ty: def.ty,
					is_addr: def.is_addr,
					users: BTreeSet::new(),
				}
			});
			caller.stmts.push(IrStmt {
				kind: IrStmtKind::Comment(String::new()),
				result,
				deleted: false,
			});
			stmt_map.insert(*source, new_id);
		}
	}

	// Second pass fills in remapped kinds. Argument accesses become
	// substitutions against the call's operands, and loads of the
	// closure's state fields become the capture operands themselves;
	// returns turn into jumps to the continuation, except a far return
	// that still has to unwind further.
	let mut subst = SubstMap::new();
	let mut state_fields: HashMap<IrStmtId, u32> = HashMap::new();
	for block in &callee.blocks {
		for source in &block.stmts {
			let new_id = stmt_map[source];
			let mut kind = callee.stmt(*source).kind.clone();
			if let IrStmtKind::Arg { index } = kind {
				let replacement = match &env {
					Some((env, _)) if index == 0 => *env,
					Some(_) => args[index as usize - 1],
					None => args[index as usize],
				};
				subst.insert(new_id, replacement);
				caller.stmt_mut(new_id).deleted = true;
				continue;
			}
			if let Some((_, Some(captures))) = &env {
				if let IrStmtKind::FieldAddr { base, field } = kind
					&& matches!(callee.stmt(base).kind, IrStmtKind::Arg { index: 0 })
				{
					state_fields.insert(*source, field);
				}
				if let IrStmtKind::Load { addr } = kind
					&& let Some(field) = state_fields.get(&addr)
					&& let Some(capture) = captures.get(*field as usize)
				{
					subst.insert(new_id, *capture);
					caller.stmt_mut(new_id).deleted = true;
					continue;
				}
			}
			kind.for_each_operand_mut(|op| *op = stmt_map[op]);
			kind.for_each_successor_mut(|target| *target = block_map[target]);
			match kind {
				IrStmtKind::Return { far: false } => {
					kind = IrStmtKind::Jump { to: continuation };
				}
				IrStmtKind::Return { far: true } => {
					kind = if caller.closure.is_some() {
						IrStmtKind::Return { far: true }
					} else {
						// The far return reached its home.
						IrStmtKind::Return { far: false }
					};
				}
				// Parameter links belong to the callee's frame.
				IrStmtKind::Alloc {
					on_stack,
					param: Some(_),
				} => {
					kind = IrStmtKind::Alloc {
						on_stack,
						param: None,
					};
				}
				_ => {}
			}
			caller.stmt_mut(new_id).kind = kind;
			caller.register_uses(new_id);
		}
	}

	for block in &callee.blocks {
		let target = block_map[&block.id];
		let stmts: Vec<IrStmtId> = block
			.stmts
			.iter()
			.map(|source| stmt_map[source])
			.filter(|id| caller.is_alive(*id))
			.collect();
		caller.block_mut(target).stmts = stmts;
	}

	let jump = caller.new_stmt(IrStmtKind::Jump {
		to: block_map[&callee.entry()],
	});
	caller.push_stmt(call_block, jump);

	subst.apply(caller);

	// Copied stack slots move to the caller's prologue so a call site
	// inside a loop reuses one frame slot per iteration.
	let entry = caller.entry();
	let copied: Vec<IrStmtId> = callee
		.blocks
		.iter()
		.flat_map(|b| b.stmts.iter().map(|source| stmt_map[source]))
		.collect();
	for id in copied {
		if !caller.is_alive(id) {
			continue;
		}
		if matches!(caller.stmt(id).kind, IrStmtKind::Alloc { on_stack: true, .. }) {
			let holder = caller
				.blocks
				.iter()
				.find(|b| b.stmts.contains(&id))
				.map(|b| b.id);
			if let Some(holder) = holder
				&& holder != entry
			{
				caller.block_mut(holder).stmts.retain(|s| *s != id);
				caller.insert_before_terminator(entry, id);
			}
		}
	}
}
