use std::collections::HashSet;

use crate::ir::{IrBlockId, IrFunction, IrModule, IrStmtId, IrStmtKind, IrValueDef};
use crate::sem::{TypeDef, TypeId};

#[derive(Clone, Debug)]
pub struct IrVerifyError {
	pub function: String,
	pub message: String,
}

/// Structural and type check over a whole module. Run after lowering
/// and again after optimization; every pass must leave the module in a
/// state this accepts.
pub fn verify_module(module: &IrModule) -> Result<(), Vec<IrVerifyError>> {
	let mut errors = Vec::new();
	for fun in module.emitted_functions() {
		verify_function(module, fun, &mut errors);
	}
	if errors.is_empty() {
		Ok(())
	} else {
		Err(errors)
	}
}

fn verify_function(module: &IrModule, fun: &IrFunction, errors: &mut Vec<IrVerifyError>) {
	let mut push = |message: String| {
		errors.push(IrVerifyError {
			function: fun.name.clone(),
			message,
		});
	};

	let block_ids: HashSet<IrBlockId> = fun.blocks.iter().map(|b| b.id).collect();
	if block_ids.len() != fun.blocks.len() {
		push("duplicate block id".to_string());
	}

	let mut placed: HashSet<IrStmtId> = HashSet::new();
	for block in &fun.blocks {
		let Some(last) = block.stmts.last() else {
			push(format!("block {} is empty", block.id.0));
			continue;
		};
		if !fun.stmt(*last).kind.is_terminator() {
			push(format!("block {} has no terminator", block.id.0));
		}
		for (position, id) in block.stmts.iter().enumerate() {
			let stmt = fun.stmt(*id);
			if stmt.deleted {
				push(format!(
					"block {} places deleted statement {}",
					block.id.0, id.0
				));
			}
			if !placed.insert(*id) {
				push(format!("statement {} placed twice", id.0));
			}
			if stmt.kind.is_terminator() && position + 1 != block.stmts.len() {
				push(format!("terminator in the middle of block {}", block.id.0));
			}
			for successor in stmt.kind.successors() {
				if !block_ids.contains(&successor) {
					push(format!(
						"block {} jumps to missing block {}",
						block.id.0, successor.0
					));
				}
			}
			if let Err(message) = check_stmt(module, fun, *id) {
				push(format!("{} ({}): {message}", stmt.kind.name(), id.0));
			}
		}
	}

	// Operand and user caches must agree with placement.
	for id in &placed {
		let stmt = fun.stmt(*id);
		stmt.kind.for_each_operand(|operand| match fun.value(operand) {
			None => push(format!(
				"{} ({}): operand {} produces no value",
				stmt.kind.name(),
				id.0,
				operand.0
			)),
			Some(def) => {
				if !placed.contains(&operand) {
					push(format!(
						"{} ({}): operand ${} is not placed",
						stmt.kind.name(),
						id.0,
						def.num
					));
				}
				if !def.users.contains(id) {
					push(format!(
						"{} ({}): missing from users of ${}",
						stmt.kind.name(),
						id.0,
						def.num
					));
				}
			}
		});
	}

	for block in &fun.blocks {
		let mut expected: Vec<IrBlockId> = fun
			.blocks
			.iter()
			.filter(|pred| {
				pred.stmts.last().is_some_and(|last| {
					fun.stmt(*last).kind.successors().contains(&block.id)
				})
			})
			.map(|pred| pred.id)
			.collect();
		expected.sort();
		expected.dedup();
		if expected != block.preds {
			push(format!("block {} has stale predecessors", block.id.0));
		}
	}
}

/// Diagnostic for one statement, for inline display in dumps.
pub(crate) fn stmt_diagnostic(
	module: &IrModule,
	fun: &IrFunction,
	id: IrStmtId,
) -> Option<String> {
	check_stmt(module, fun, id).err()
}

/// One statement's local rules. Errors on the first violation.
fn check_stmt(module: &IrModule, fun: &IrFunction, id: IrStmtId) -> Result<(), String> {
	let types = &module.types;
	let stmt = fun.stmt(id);

	let value_of = |operand: IrStmtId| -> Result<&IrValueDef, String> {
		fun.value(operand)
			.ok_or_else(|| format!("operand {} produces no value", operand.0))
	};
	let simple_value = |operand: IrStmtId, what: &str| -> Result<TypeId, String> {
		let def = value_of(operand)?;
		if def.is_addr {
			return Err(format!("{what} is an address"));
		}
		if !types.is_simple(def.ty) {
			return Err(format!("{what} is not simple-typed"));
		}
		Ok(def.ty)
	};
	let pointee = |operand: IrStmtId, what: &str| -> Result<TypeId, String> {
		fun.pointee(types, operand)
			.ok_or_else(|| format!("{what} is not an address"))
	};

	match &stmt.kind {
		IrStmtKind::IntConst(_) | IrStmtKind::FloatConst(_) | IrStmtKind::TagConst { .. } => {
			Ok(())
		}
		IrStmtKind::Bin { lhs, rhs, .. } => {
			let l = simple_value(*lhs, "left operand")?;
			let r = simple_value(*rhs, "right operand")?;
			if types.is_ref(l) || types.is_ref(r) {
				return Err("arithmetic on a reference".to_string());
			}
			if l != r {
				return Err("operand types differ".to_string());
			}
			Ok(())
		}
		IrStmtKind::Cmp { lhs, rhs, .. } => {
			let l = simple_value(*lhs, "left operand")?;
			let r = simple_value(*rhs, "right operand")?;
			if l != r {
				return Err("operand types differ".to_string());
			}
			Ok(())
		}
		IrStmtKind::Convert { value } => {
			simple_value(*value, "operand")?;
			Ok(())
		}
		IrStmtKind::Alloc { .. } => {
			let def = result_of(stmt)?;
			if !def.is_addr {
				return Err("allocation result is not an address".to_string());
			}
			Ok(())
		}
		IrStmtKind::GlobalAddr(global) => {
			let Some(decl) = module.globals.get(global.0 as usize) else {
				return Err("global out of range".to_string());
			};
			expect_addr_of(stmt, decl.ty)
		}
		IrStmtKind::FieldAddr { base, field } => {
			let record_ty = pointee(*base, "base")?;
			let TypeDef::Record(record) = types.get(record_ty) else {
				return Err("base is not a record".to_string());
			};
			let Some(decl) = record.fields.get(*field as usize) else {
				return Err(format!("field {field} out of range"));
			};
			expect_addr_of(stmt, decl.ty)
		}
		IrStmtKind::CaseAddr { base, case } => {
			let choice_ty = pointee(*base, "base")?;
			let TypeDef::Choice(choice) = types.get(choice_ty) else {
				return Err("base is not a choice".to_string());
			};
			let Some(decl) = choice.cases.get(*case as usize) else {
				return Err(format!("case {case} out of range"));
			};
			let Some(payload) = decl.payload else {
				return Err(format!("case {case} has no payload"));
			};
			expect_addr_of(stmt, payload)
		}
		IrStmtKind::IndexAddr { base, index } => {
			let elem = sequence_elem(module, pointee(*base, "base")?)
				.ok_or_else(|| "base is not a sequence".to_string())?;
			simple_value(*index, "index")?;
			expect_addr_of(stmt, elem)
		}
		IrStmtKind::ArrayLen { base } => {
			sequence_elem(module, pointee(*base, "base")?)
				.ok_or_else(|| "base is not a sequence".to_string())?;
			expect_value_of(stmt, types.builtins.int)
		}
		IrStmtKind::ChoiceTag { base } => {
			let choice_ty = pointee(*base, "base")?;
			if !matches!(types.get(choice_ty), TypeDef::Choice(_)) {
				return Err("base is not a choice".to_string());
			}
			expect_value_of(stmt, types.builtins.int)
		}
		IrStmtKind::Load { addr } => {
			let ty = pointee(*addr, "source")?;
			if !types.is_simple(ty) {
				return Err("load of a non-register type".to_string());
			}
			expect_value_of(stmt, ty)
		}
		IrStmtKind::Arg { index } => {
			let def = result_of(stmt)?;
			let index = *index as usize;
			if index == fun.params.len() {
				let Some(ret) = fun.ret_param else {
					return Err(
						"return-slot access in a function without one".to_string()
					);
				};
				if def.ty != ret || !def.is_addr {
					return Err("return-slot type mismatch".to_string());
				}
				return Ok(());
			}
			let Some(param) = fun.params.get(index) else {
				return Err(format!("argument {index} out of range"));
			};
			if def.ty != param.ty || def.is_addr != param.by_addr {
				return Err(format!("argument {index} type mismatch"));
			}
			Ok(())
		}
		IrStmtKind::Store { addr, value } => {
			let ty = simple_value(*value, "stored value")?;
			let dst = pointee(*addr, "destination")?;
			if ty != dst {
				return Err("stored value type mismatch".to_string());
			}
			Ok(())
		}
		IrStmtKind::Copy { dst, src } => {
			let dst_ty = pointee(*dst, "destination")?;
			let src_ty = pointee(*src, "source")?;
			if dst_ty != src_ty {
				return Err("copy endpoint types differ".to_string());
			}
			if !types.is_composite(dst_ty) {
				return Err("copy of a non-composite type".to_string());
			}
			Ok(())
		}
		IrStmtKind::MakeAnd { dst, fields } => {
			let TypeDef::Record(record) = types.get(pointee(*dst, "destination")?) else {
				return Err("destination is not a record".to_string());
			};
			let expected: Vec<TypeId> = record
				.fields
				.iter()
				.map(|f| f.ty)
				.filter(|ty| !types.is_empty(*ty))
				.collect();
			if expected.len() != fields.len() {
				return Err(format!(
					"{} operands for {} non-empty fields",
					fields.len(),
					expected.len()
				));
			}
			for (operand, ty) in fields.iter().zip(expected) {
				check_init_operand(module, fun, *operand, ty)?;
			}
			Ok(())
		}
		IrStmtKind::MakeOr { dst, case, payload } => {
			let choice_ty = pointee(*dst, "destination")?;
			let TypeDef::Choice(choice) = types.get(choice_ty) else {
				return Err("destination is not a choice".to_string());
			};
			if !types.is_composite(choice_ty) {
				return Err("construction of a register choice".to_string());
			}
			let Some(decl) = choice.cases.get(*case as usize) else {
				return Err(format!("case {case} out of range"));
			};
			let wants = decl.payload.filter(|ty| !types.is_empty(*ty));
			match (wants, payload) {
				(None, None) => Ok(()),
				(None, Some(_)) => Err(format!("case {case} takes no payload")),
				(Some(_), None) => Err(format!("case {case} requires a payload")),
				(Some(ty), Some(operand)) => {
					check_init_operand(module, fun, *operand, ty)
				}
			}
		}
		IrStmtKind::MakeArray { dst, elems } | IrStmtKind::MakeSlice { dst, elems } => {
			let elem = sequence_elem(module, pointee(*dst, "destination")?)
				.ok_or_else(|| "destination is not a sequence".to_string())?;
			if types.is_empty(elem) {
				if !elems.is_empty() {
					return Err("elements for an empty element type".to_string());
				}
				return Ok(());
			}
			for operand in elems {
				check_init_operand(module, fun, *operand, elem)?;
			}
			Ok(())
		}
		IrStmtKind::MakeString { dst, str } => {
			if pointee(*dst, "destination")? != types.builtins.str_ {
				return Err("destination is not a string".to_string());
			}
			if module.strings.get(str.0 as usize).is_none() {
				return Err("string constant out of range".to_string());
			}
			Ok(())
		}
		IrStmtKind::MakeVirtual { dst, env, fun: target } => {
			if !matches!(types.get(pointee(*dst, "destination")?), TypeDef::Closure(_)) {
				return Err("destination is not a closure".to_string());
			}
			let Some(callee) = module.functions.get(target.0 as usize) else {
				return Err("closure function out of range".to_string());
			};
			let Some(info) = &callee.closure else {
				return Err("closure function has no closure info".to_string());
			};
			if pointee(*env, "captured state")? != info.env_ty {
				return Err("captured state type mismatch".to_string());
			}
			Ok(())
		}
		IrStmtKind::Call { fun: target, args } => {
			let Some(callee) = module.functions.get(target.0 as usize) else {
				return Err("callee out of range".to_string());
			};
			let params: Vec<TypeId> = callee.params.iter().map(|p| p.ty).collect();
			check_call_args(module, fun, args, &params, callee.ret_param)
		}
		IrStmtKind::VirtualCall { receiver, args } => {
			let TypeDef::Closure(sig) = types.get(pointee(*receiver, "receiver")?) else {
				return Err("receiver is not a closure".to_string());
			};
			let params: Vec<TypeId> = sig
				.params
				.iter()
				.copied()
				.filter(|ty| !types.is_empty(*ty))
				.collect();
			let ret = Some(sig.ret).filter(|ty| !types.is_empty(*ty));
			check_call_args(module, fun, args, &params, ret)
		}
		IrStmtKind::Comment(_) => Ok(()),
		IrStmtKind::Return { far } => {
			if *far && fun.closure.is_none() {
				return Err("far return outside a closure".to_string());
			}
			Ok(())
		}
		IrStmtKind::Jump { .. } => Ok(()),
		IrStmtKind::Switch { discr, targets } => {
			let def = value_of(*discr)?;
			if def.is_addr {
				return Err("discriminant is an address".to_string());
			}
			match types.get(def.ty) {
				TypeDef::Choice(choice) => {
					if choice.cases.len() != targets.len() {
						return Err(format!(
							"{} targets for {} cases",
							targets.len(),
							choice.cases.len()
						));
					}
					Ok(())
				}
				TypeDef::Int => {
					if targets.is_empty() {
						Err("switch with no targets".to_string())
					} else {
						Ok(())
					}
				}
				_ => Err("discriminant is not switchable".to_string()),
			}
		}
	}
}

fn result_of(stmt: &crate::ir::IrStmt) -> Result<&IrValueDef, String> {
	stmt.result
		.as_ref()
		.ok_or_else(|| "statement has no result slot".to_string())
}

fn expect_addr_of(stmt: &crate::ir::IrStmt, ty: TypeId) -> Result<(), String> {
	let def = result_of(stmt)?;
	if !def.is_addr {
		return Err("result is not an address".to_string());
	}
	if def.ty != ty {
		return Err("result type mismatch".to_string());
	}
	Ok(())
}

fn expect_value_of(stmt: &crate::ir::IrStmt, ty: TypeId) -> Result<(), String> {
	let def = result_of(stmt)?;
	if def.is_addr {
		return Err("result is an address".to_string());
	}
	if def.ty != ty {
		return Err("result type mismatch".to_string());
	}
	Ok(())
}

fn sequence_elem(module: &IrModule, ty: TypeId) -> Option<TypeId> {
	match module.types.get(ty) {
		TypeDef::Array { elem } | TypeDef::Slice { elem } => Some(*elem),
		_ => None,
	}
}

/// An initializer or argument operand against an expected slot type:
/// simple slots take register values, composite and reference slots
/// take either an address of the pointee or a reference value.
fn check_init_operand(
	module: &IrModule,
	fun: &IrFunction,
	operand: IrStmtId,
	expected: TypeId,
) -> Result<(), String> {
	let types = &module.types;
	let def = fun
		.value(operand)
		.ok_or_else(|| format!("operand {} produces no value", operand.0))?;
	if types.is_composite(expected) {
		return match fun.pointee(types, operand) {
			Some(ty) if ty == expected => Ok(()),
			_ => Err("composite operand address mismatch".to_string()),
		};
	}
	if !def.is_addr && def.ty == expected {
		return Ok(());
	}
	if let TypeDef::Ref { to } = types.get(expected)
		&& def.is_addr && def.ty == *to
	{
		return Ok(());
	}
	Err("operand type mismatch".to_string())
}

fn check_call_args(
	module: &IrModule,
	fun: &IrFunction,
	args: &[IrStmtId],
	params: &[TypeId],
	ret: Option<TypeId>,
) -> Result<(), String> {
	let expected = params.len() + usize::from(ret.is_some());
	if args.len() != expected {
		return Err(format!("{} arguments for {} slots", args.len(), expected));
	}
	for (arg, ty) in args.iter().zip(params.iter()) {
		check_init_operand(module, fun, *arg, *ty)?;
	}
	if let Some(ret) = ret {
		let slot = args[params.len()];
		if fun.pointee(&module.types, slot) != Some(ret) {
			return Err("return-slot argument type mismatch".to_string());
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::verify_module;
	use crate::ir::{lower_program, IrStmtKind};
	use crate::sem::{
		CaseDef, ChoiceType, CmpOp, Exp, FnDecl, Program, Stm, TypeDef, TypeTable, VarDecl,
	};

	fn int_identity() -> Program {
		let types = TypeTable::new();
		let int = types.builtins.int;
		Program {
			types,
			globals: Vec::new(),
			fns: vec![FnDecl {
				name: "id".to_string(),
				key: None,
				params: vec![VarDecl {
					name: "x".to_string(),
					ty: int,
				}],
				ret: int,
				locals: Vec::new(),
				body: Some(vec![Stm::Return(Some(Exp::Param(0)))]),
				is_test: false,
			}],
		}
	}

	#[test]
	fn accepts_freshly_lowered_functions() {
		let module = lower_program(&int_identity()).expect("lowering");
		verify_module(&module).expect("verification");
	}

	#[test]
	fn rejects_a_block_without_terminator() {
		let mut module = lower_program(&int_identity()).expect("lowering");
		let fun = &mut module.functions[0];
		let entry = fun.entry();
		fun.block_mut(entry).stmts.pop();
		let errors = verify_module(&module).expect_err("missing terminator");
		assert!(errors.iter().any(|e| e.message.contains("no terminator")));
	}

	#[test]
	fn rejects_a_store_through_a_register_value() {
		let mut module = lower_program(&int_identity()).expect("lowering");
		let fun = &mut module.functions[0];
		// Redirect the parameter spill at its own argument value,
		// which is neither an address nor a reference.
		let (store, arg) = fun
			.placed_stmts()
			.into_iter()
			.find_map(|id| match fun.stmt(id).kind {
				IrStmtKind::Store { value, .. } => Some((id, value)),
				_ => None,
			})
			.expect("spill store");
		if let IrStmtKind::Store { addr, .. } = &mut fun.stmt_mut(store).kind {
			*addr = arg;
		}
		let errors = verify_module(&module).expect_err("bad store");
		assert!(
			errors
				.iter()
				.any(|e| e.message.contains("is not an address")
					|| e.message.contains("users"))
		);
	}

	#[test]
	fn rejects_comparisons_across_types() {
		let mut types = TypeTable::new();
		let int = types.builtins.int;
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
				name: "mixed".to_string(),
				key: None,
				params: vec![VarDecl {
					name: "x".to_string(),
					ty: int,
				}],
				ret: int,
				locals: Vec::new(),
				body: Some(vec![
					Stm::Expr(Exp::Float(1.5)),
					Stm::Expr(Exp::Cmp {
						op: CmpOp::Le,
						bool_ty,
						lhs: Box::new(Exp::Param(0)),
						rhs: Box::new(Exp::Int(0)),
					}),
					Stm::Return(Some(Exp::Param(0))),
				]),
				is_test: false,
			}],
		};
		let mut module = lower_program(&program).expect("lowering");
		let fun = &mut module.functions[0];
		let float = fun
			.placed_stmts()
			.into_iter()
			.find(|id| matches!(fun.stmt(*id).kind, IrStmtKind::FloatConst(_)))
			.expect("float const placed");
		let cmp = fun
			.placed_stmts()
			.into_iter()
			.find(|id| matches!(fun.stmt(*id).kind, IrStmtKind::Cmp { .. }))
			.expect("cmp placed");
		if let IrStmtKind::Cmp { rhs, .. } = &mut fun.stmt_mut(cmp).kind {
			*rhs = float;
		}
		fun.register_uses(cmp);
		let errors = verify_module(&module).expect_err("mixed comparison");
		assert!(errors.iter().any(|e| e.message.contains("operand types differ")));
	}

	#[test]
	fn rejects_stale_predecessor_lists() {
		let mut module = lower_program(&int_identity()).expect("lowering");
		let fun = &mut module.functions[0];
		fun.blocks[1].preds.clear();
		let errors = verify_module(&module).expect_err("stale preds");
		assert!(errors.iter().any(|e| e.message.contains("stale")));
	}
}
