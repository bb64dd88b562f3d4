use std::collections::HashSet;

use crate::ir::{IrFunction, IrStmtId, IrStmtKind};

/// Escape analysis: heap allocations whose address never outlives the
/// function body are flipped to stack slots. Runs to a fixpoint, since
/// an address stored into an already-promoted slot stops escaping.
pub fn promote_stack(fun: &mut IrFunction) -> bool {
	let mut changed = false;
	loop {
		let mut round = false;
		for id in fun.placed_stmts() {
			if !fun.is_alive(id) {
				continue;
			}
			if !matches!(
				fun.stmt(id).kind,
				IrStmtKind::Alloc { on_stack: false, .. }
			) {
				continue;
			}
			let mut visited = HashSet::new();
			if escapes(fun, id, &mut visited) {
				continue;
			}
			if let IrStmtKind::Alloc { on_stack, .. } = &mut fun.stmt_mut(id).kind {
				*on_stack = true;
			}
			relocate_to_entry(fun, id);
			round = true;
		}
		if !round {
			break;
		}
		changed = true;
	}
	changed
}

/// Whether the address `id` can outlive the current activation.
fn escapes(fun: &IrFunction, id: IrStmtId, visited: &mut HashSet<IrStmtId>) -> bool {
	if !visited.insert(id) {
		return false;
	}
	let Some(def) = fun.value(id) else {
		return true;
	};
	for user in &def.users {
		let kept = match &fun.stmt(*user).kind {
			IrStmtKind::Load { .. }
			| IrStmtKind::ArrayLen { .. }
			| IrStmtKind::ChoiceTag { .. } => true,
			IrStmtKind::Copy { dst, src } => {
				// Copying into the slot is local. Copying its
				// contents out can carry captured addresses, so
				// the destination must itself stay in the frame;
				// a return slot or by-address parameter does not.
				*dst == id || (*src == id && base_is_stack(fun, *dst))
			}
			IrStmtKind::Store { addr, value } => {
				// Writing into the slot is local; storing the
				// address itself only stays local when the
				// destination is already a stack slot.
				*addr == id || (*value == id && base_is_stack(fun, *addr))
			}
			IrStmtKind::FieldAddr { .. }
			| IrStmtKind::CaseAddr { .. }
			| IrStmtKind::IndexAddr { .. } => !escapes(fun, *user, visited),
			IrStmtKind::MakeAnd { dst, .. }
			| IrStmtKind::MakeOr { dst, .. }
			| IrStmtKind::MakeArray { dst, .. }
			| IrStmtKind::MakeSlice { dst, .. }
			| IrStmtKind::MakeString { dst, .. } => {
				*dst == id || base_is_stack(fun, *dst)
			}
			IrStmtKind::MakeVirtual { dst, .. } => *dst == id || base_is_stack(fun, *dst),
			// A callee may retain any address it receives.
			IrStmtKind::Call { .. } | IrStmtKind::VirtualCall { .. } => false,
			_ => false,
		};
		if !kept {
			return true;
		}
	}
	false
}

/// Chase a destination through derived addresses down to its
/// allocation; true only when that allocation is already on the stack.
fn base_is_stack(fun: &IrFunction, mut id: IrStmtId) -> bool {
	loop {
		match &fun.stmt(id).kind {
			IrStmtKind::FieldAddr { base, .. }
			| IrStmtKind::CaseAddr { base, .. }
			| IrStmtKind::IndexAddr { base, .. } => id = *base,
			IrStmtKind::Alloc { on_stack, .. } => return *on_stack,
			_ => return false,
		}
	}
}

/// Stack slots live in block 0 so a loop body never re-allocates them.
fn relocate_to_entry(fun: &mut IrFunction, id: IrStmtId) {
	let entry = fun.entry();
	let holder = fun
		.blocks
		.iter()
		.find(|b| b.stmts.contains(&id))
		.map(|b| b.id);
	let Some(holder) = holder else {
		return;
	};
	if holder == entry {
		return;
	}
	fun.block_mut(holder).stmts.retain(|s| *s != id);
	fun.insert_before_terminator(entry, id);
}

#[cfg(test)]
mod tests {
	use super::promote_stack;
	use crate::ir::{lower_program, verify_module, IrStmtKind};
	use crate::sem::{
		Exp, FieldDef, FnDecl, Program, RecordType, Stm, TypeDef, TypeTable, VarDecl,
	};

	fn pair_types() -> (TypeTable, crate::sem::TypeId) {
		let mut types = TypeTable::new();
		let int = types.builtins.int;
		let pair = types.add(TypeDef::Record(RecordType {
			name: "pair".to_string(),
			fields: vec![
				FieldDef {
					name: "x".to_string(),
					ty: int,
				},
				FieldDef {
					name: "y".to_string(),
					ty: int,
				},
			],
		}));
		(types, pair)
	}

	#[test]
	fn promotes_function_local_records() {
		let (types, pair) = pair_types();
		let int = types.builtins.int;
		let program = Program {
			types,
			globals: Vec::new(),
			fns: vec![FnDecl {
				name: "f".to_string(),
				key: None,
				params: Vec::new(),
				ret: int,
				locals: vec![VarDecl {
					name: "p".to_string(),
					ty: pair,
				}],
				body: Some(vec![
					Stm::Assign {
						local: 0,
						value: Exp::MakeRecord {
							ty: pair,
							fields: vec![Exp::Int(1), Exp::Int(2)],
						},
					},
					Stm::Return(Some(Exp::Field {
						base: Box::new(Exp::Local(0)),
						field: 0,
					})),
				]),
				is_test: false,
			}],
		};
		let mut module = lower_program(&program).expect("lowering");
		assert!(promote_stack(&mut module.functions[0]));
		let fun = &module.functions[0];
		assert!(
			fun.placed_stmts()
				.iter()
				.filter(|id| matches!(fun.stmt(**id).kind, IrStmtKind::Alloc { .. }))
				.all(|id| matches!(
					fun.stmt(*id).kind,
					IrStmtKind::Alloc { on_stack: true, .. }
				))
		);
		verify_module(&module).expect("promoted module verifies");
	}

	#[test]
	fn keeps_call_arguments_on_the_heap() {
		let (types, pair) = pair_types();
		let unit = types.builtins.unit;
		let sink = FnDecl {
			name: "sink".to_string(),
			key: None,
			params: vec![VarDecl {
				name: "p".to_string(),
				ty: pair,
			}],
			ret: unit,
			locals: Vec::new(),
			body: Some(vec![Stm::Return(None)]),
			is_test: false,
		};
		let caller = FnDecl {
			name: "caller".to_string(),
			key: None,
			params: Vec::new(),
			ret: unit,
			locals: Vec::new(),
			body: Some(vec![
				Stm::Expr(Exp::Call {
					target: 0,
					args: vec![Exp::MakeRecord {
						ty: pair,
						fields: vec![Exp::Int(1), Exp::Int(2)],
					}],
				}),
				Stm::Return(None),
			]),
			is_test: false,
		};
		let program = Program {
			types,
			globals: Vec::new(),
			fns: vec![sink, caller],
		};
		let mut module = lower_program(&program).expect("lowering");
		promote_stack(&mut module.functions[1]);
		let fun = &module.functions[1];
		// The copy handed to the callee must not move to the stack.
		let call_arg = fun
			.placed_stmts()
			.into_iter()
			.find_map(|id| match &fun.stmt(id).kind {
				IrStmtKind::Call { args, .. } => Some(args[0]),
				_ => None,
			})
			.expect("call placed");
		assert!(matches!(
			fun.stmt(call_arg).kind,
			IrStmtKind::Alloc { on_stack: false, .. }
		));
		verify_module(&module).expect("module verifies");
	}

	#[test]
	fn keeps_returned_closure_state_on_the_heap() {
		let (mut types, pair) = pair_types();
		let int = types.builtins.int;
		let counter_fn = types.add(TypeDef::Closure(crate::sem::ClosureSig {
			params: Vec::new(),
			ret: int,
		}));
		// The counter record is captured by address and the closure
		// leaves through the return slot, so neither the record, the
		// capture state, nor the closure slot may move to the frame.
		let program = Program {
			types,
			globals: Vec::new(),
			fns: vec![FnDecl {
				name: "make_counter".to_string(),
				key: None,
				params: Vec::new(),
				ret: counter_fn,
				locals: vec![VarDecl {
					name: "c".to_string(),
					ty: pair,
				}],
				body: Some(vec![
					Stm::Assign {
						local: 0,
						value: Exp::MakeRecord {
							ty: pair,
							fields: vec![Exp::Int(0), Exp::Int(0)],
						},
					},
					Stm::Return(Some(Exp::Closure {
						ty: counter_fn,
						params: Vec::new(),
						locals: Vec::new(),
						captures: vec![0],
						body: vec![Stm::Return(Some(Exp::Field {
							base: Box::new(Exp::Capture(0)),
							field: 0,
						}))],
					})),
				]),
				is_test: false,
			}],
		};
		let mut module = lower_program(&program).expect("lowering");
		crate::opt::optimize_module(&mut module, &crate::opt::OptOptions::default());
		let fun = module
			.functions
			.iter()
			.find(|f| f.name == "make_counter")
			.expect("builder exists");
		let promoted: Vec<_> = fun
			.placed_stmts()
			.into_iter()
			.filter(|id| matches!(fun.stmt(*id).kind, IrStmtKind::Alloc { on_stack: true, .. }))
			.collect();
		assert!(
			promoted.is_empty(),
			"state reachable from the returned closure moved to the frame: {promoted:?}"
		);
		verify_module(&module).expect("optimized module verifies");
	}
}
