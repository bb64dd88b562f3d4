use crate::ir::{IrBlockId, IrFunction, IrStmtId, IrStmtKind};
use crate::sem::TypeTable;

/// Rewrites self-calls in tail position into jumps back to the first
/// body block, turning direct recursion into a loop. Block 0 spills
/// every by-register parameter into a slot, so the rewrite only has to
/// store the new argument values and jump.
///
/// Two shapes count as tail position: a call immediately followed by a
/// return, and a call whose result is reloaded from the call's return
/// slot and stored straight through the function's own return slot.
/// Functions returning a composite value are left alone; their result
/// writes back through a caller-owned slot the loop would clobber.
pub fn rewrite_tail_calls(types: &TypeTable, fun: &mut IrFunction) -> bool {
	if fun.ret_param.is_some_and(|ret| types.is_composite(ret)) {
		return false;
	}
	let Some(back_edge) = back_edge_target(fun) else {
		return false;
	};
	let mut changed = false;
	while let Some(tail) = find_tail_call(fun) {
		apply(fun, tail, back_edge);
		changed = true;
	}
	if changed {
		fun.recompute_preds();
	}
	changed
}

fn back_edge_target(fun: &IrFunction) -> Option<IrBlockId> {
	let entry = fun.entry();
	let last = *fun.block(entry).stmts.last()?;
	match fun.stmt(last).kind {
		IrStmtKind::Jump { to } => Some(to),
		_ => None,
	}
}

struct TailCall {
	call: IrStmtId,
	args: Vec<IrStmtId>,
	/// Reload statements of the slot-reload shape, in order.
	reload: Option<(IrStmtId, IrStmtId)>,
	ret: IrStmtId,
}

fn find_tail_call(fun: &IrFunction) -> Option<TailCall> {
	for id in fun.placed_stmts() {
		if !fun.is_alive(id) {
			continue;
		}
		let IrStmtKind::Call { fun: target, args } = &fun.stmt(id).kind else {
			continue;
		};
		if *target != fun.id {
			continue;
		}
		if let Some(tail) = trace_tail(fun, id, args.clone()) {
			return Some(tail);
		}
	}
	None
}

/// Walk forward from the call to a plain return, collecting whatever
/// lies between. Comments are skipped; a jump is followed only into a
/// block the current one exclusively feeds.
fn trace_tail(fun: &IrFunction, call: IrStmtId, args: Vec<IrStmtId>) -> Option<TailCall> {
	let (mut block, position) = fun.placement(call)?;
	let mut position = position + 1;
	let mut trailing = Vec::new();
	loop {
		let stmts = &fun.block(block).stmts;
		let id = *stmts.get(position)?;
		match &fun.stmt(id).kind {
			IrStmtKind::Comment(_) => position += 1,
			IrStmtKind::Jump { to } => {
				let preds = &fun.block(*to).preds;
				if preds.len() != 1 || preds[0] != block {
					return None;
				}
				block = *to;
				position = 0;
			}
			IrStmtKind::Return { far: true } => return None,
			IrStmtKind::Return { far: false } => {
				return classify(fun, call, args, trailing, id);
			}
			_ => {
				if trailing.len() == 2 {
					return None;
				}
				trailing.push(id);
				position += 1;
			}
		}
	}
}

fn classify(
	fun: &IrFunction,
	call: IrStmtId,
	args: Vec<IrStmtId>,
	trailing: Vec<IrStmtId>,
	ret: IrStmtId,
) -> Option<TailCall> {
	match trailing[..] {
		[] => {
			// With a return value, the callee must already write
			// through this function's own return slot.
			if fun.ret_param.is_some() {
				let slot = ret_slot_arg(fun)?;
				if args.last() != Some(&slot) {
					return None;
				}
			}
			Some(TailCall {
				call,
				args,
				reload: None,
				ret,
			})
		}
		[load, store] => {
			fun.ret_param?;
			let IrStmtKind::Load { addr } = fun.stmt(load).kind else {
				return None;
			};
			if Some(&addr) != args.last() {
				return None;
			}
			let IrStmtKind::Store { addr, value } = fun.stmt(store).kind else {
				return None;
			};
			if value != load || Some(addr) != ret_slot_arg(fun) {
				return None;
			}
			Some(TailCall {
				call,
				args,
				reload: Some((load, store)),
				ret,
			})
		}
		_ => None,
	}
}

fn ret_slot_arg(fun: &IrFunction) -> Option<IrStmtId> {
	let ret_index = fun.params.len() as u32;
	fun.placed_stmts().into_iter().find(|id| {
		fun.is_alive(*id)
			&& matches!(fun.stmt(*id).kind, IrStmtKind::Arg { index } if index == ret_index)
	})
}

fn spill_slot(fun: &IrFunction, index: u32) -> Option<IrStmtId> {
	fun.placed_stmts().into_iter().find(|id| {
		fun.is_alive(*id)
			&& matches!(
				fun.stmt(*id).kind,
				IrStmtKind::Alloc { param: Some(p), .. } if p == index
			)
	})
}

fn arg_value(fun: &IrFunction, index: u32) -> Option<IrStmtId> {
	fun.placed_stmts().into_iter().find(|id| {
		fun.is_alive(*id)
			&& matches!(fun.stmt(*id).kind, IrStmtKind::Arg { index: i } if i == index)
	})
}

fn apply(fun: &mut IrFunction, tail: TailCall, back_edge: IrBlockId) {
	fun.mark_deleted(tail.call);
	if let Some((load, store)) = tail.reload {
		fun.mark_deleted(store);
		fun.mark_deleted(load);
	}

	let mut writebacks = Vec::new();
	for index in 0..fun.params.len() {
		let arg = tail.args[index];
		if fun.params[index].by_addr {
			// The parameter's storage is the argument address itself.
			let Some(slot) = arg_value(fun, index as u32) else {
				continue;
			};
			if arg == slot {
				continue;
			}
			writebacks.push(fun.new_stmt(IrStmtKind::Copy {
				dst: slot,
				src: arg,
			}));
		} else {
			let Some(slot) = spill_slot(fun, index as u32) else {
				continue;
			};
			if passes_slot_unchanged(fun, arg, slot) {
				continue;
			}
			writebacks.push(fun.new_stmt(IrStmtKind::Store {
				addr: slot,
				value: arg,
			}));
		}
	}

	let (ret_block, ret_position) = fun.placement(tail.ret).expect("return is placed");
	for (offset, writeback) in writebacks.into_iter().enumerate() {
		fun.block_mut(ret_block)
			.stmts
			.insert(ret_position + offset, writeback);
	}
	fun.stmt_mut(tail.ret).kind = IrStmtKind::Jump { to: back_edge };
}

/// The argument is the parameter's own current value when it is a load
/// of the spill slot and nothing but the prologue writes that slot.
fn passes_slot_unchanged(fun: &IrFunction, arg: IrStmtId, slot: IrStmtId) -> bool {
	if !matches!(fun.stmt(arg).kind, IrStmtKind::Load { addr } if addr == slot) {
		return false;
	}
	let Some(def) = fun.value(slot) else {
		return false;
	};
	def.users
		.iter()
		.filter(|user| fun.stmt(**user).kind.write_dst() == Some(slot))
		.count() == 1
}

#[cfg(test)]
mod tests {
	use super::rewrite_tail_calls;
	use crate::ir::{lower_program, verify_module, IrStmtKind};
	use crate::opt::cleanup;
	use crate::sem::{
		BinOp, CaseDef, ChoiceType, CmpOp, Exp, FnDecl, Program, Stm, TypeDef, TypeTable,
		VarDecl,
	};

	fn countdown_program() -> Program {
		let mut types = TypeTable::new();
		let int = types.builtins.int;
		let unit = types.builtins.unit;
		let bool_ty = types.add(TypeDef::Choice(ChoiceType {
			name: "bool".to_string(),
			cases: vec![
				CaseDef {
					name: "false".to_string(),
					payload: None,
				},
				CaseDef {
					name: "true".to_string(),
					payload: None,
				},
			],
		}));
		Program {
			types,
			globals: Vec::new(),
			fns: vec![FnDecl {
				name: "count".to_string(),
				key: None,
				params: vec![VarDecl {
					name: "n".to_string(),
					ty: int,
				}],
				ret: unit,
				locals: Vec::new(),
				body: Some(vec![
					Stm::If {
						cond: Exp::Cmp {
							op: CmpOp::Le,
							bool_ty,
							lhs: Box::new(Exp::Param(0)),
							rhs: Box::new(Exp::Int(0)),
						},
						then_body: vec![Stm::Return(None)],
						else_body: Vec::new(),
					},
					Stm::Expr(Exp::Call {
						target: 0,
						args: vec![Exp::Bin {
							op: BinOp::Sub,
							lhs: Box::new(Exp::Param(0)),
							rhs: Box::new(Exp::Int(1)),
						}],
					}),
					Stm::Return(None),
				]),
				is_test: false,
			}],
		}
	}

	#[test]
	fn turns_a_tail_self_call_into_a_loop() {
		let mut module = lower_program(&countdown_program()).expect("lowering");
		let types = module.types.clone();
		let fun = &mut module.functions[0];
		cleanup(fun);
		assert!(rewrite_tail_calls(&types, fun));
		cleanup(fun);

		assert!(!fun.has_static_calls());
		// The decrement now stores back into the parameter slot and
		// the first body block became a loop head.
		assert!(fun.blocks[1].preds.len() >= 2);
		let slot = fun
			.placed_stmts()
			.into_iter()
			.find(|id| {
				matches!(
					fun.stmt(*id).kind,
					IrStmtKind::Alloc { param: Some(0), .. }
				)
			})
			.expect("spill slot survives");
		let writes = fun
			.placed_stmts()
			.iter()
			.filter(|id| {
				matches!(fun.stmt(**id).kind, IrStmtKind::Store { addr, .. } if addr == slot)
			})
			.count();
		assert_eq!(writes, 2);
		verify_module(&module).expect("rewritten module verifies");
	}

	#[test]
	fn leaves_non_tail_recursion_alone() {
		let mut types = TypeTable::new();
		let int = types.builtins.int;
		// factorial-style: the self-call result feeds a multiply, so
		// the call is not in tail position.
		let bool_ty = types.add(TypeDef::Choice(ChoiceType {
			name: "bool".to_string(),
			cases: vec![
				CaseDef {
					name: "false".to_string(),
					payload: None,
				},
				CaseDef {
					name: "true".to_string(),
					payload: None,
				},
			],
		}));
		let program = Program {
			types,
			globals: Vec::new(),
			fns: vec![FnDecl {
				name: "fact".to_string(),
				key: None,
				params: vec![VarDecl {
					name: "n".to_string(),
					ty: int,
				}],
				ret: int,
				locals: Vec::new(),
				body: Some(vec![
					Stm::If {
						cond: Exp::Cmp {
							op: CmpOp::Le,
							bool_ty,
							lhs: Box::new(Exp::Param(0)),
							rhs: Box::new(Exp::Int(1)),
						},
						then_body: vec![Stm::Return(Some(Exp::Int(1)))],
						else_body: Vec::new(),
					},
					Stm::Return(Some(Exp::Bin {
						op: BinOp::Mul,
						lhs: Box::new(Exp::Param(0)),
						rhs: Box::new(Exp::Call {
							target: 0,
							args: vec![Exp::Bin {
								op: BinOp::Sub,
								lhs: Box::new(Exp::Param(0)),
								rhs: Box::new(Exp::Int(1)),
							}],
						}),
					})),
				]),
				is_test: false,
			}],
		};
		let mut module = lower_program(&program).expect("lowering");
		let types = module.types.clone();
		let fun = &mut module.functions[0];
		cleanup(fun);
		assert!(!rewrite_tail_calls(&types, fun));
		assert!(fun.has_static_calls());
		verify_module(&module).expect("module verifies");
	}
}
