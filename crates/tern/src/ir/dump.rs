use std::fmt::Write;

use crate::ir::{IrFunction, IrModule, IrStmtId, IrStmtKind};
use crate::sem::{TypeDef, TypeId, TypeTable};

/// Deterministic text rendering of a module, for traces and tests.
pub fn dump_module(module: &IrModule) -> String {
	let mut out = String::new();
	for (index, global) in module.globals.iter().enumerate() {
		let _ = writeln!(
			out,
			"global g{}: {} = {}",
			index,
			type_name(&module.types, global.ty),
			global.name
		);
	}
	for fun in module.emitted_functions() {
		if !out.is_empty() {
			out.push('\n');
		}
		out.push_str(&dump_function(module, fun));
	}
	out
}

pub fn dump_function(module: &IrModule, fun: &IrFunction) -> String {
	let types = &module.types;
	let mut out = String::new();
	let params: Vec<String> = fun
		.params
		.iter()
		.map(|p| {
			let addr = if p.by_addr { "&" } else { "" };
			format!("{}: {addr}{}", p.name, type_name(types, p.ty))
		})
		.collect();
	let ret = match fun.ret_param {
		Some(ty) => format!(" -> {}", type_name(types, ty)),
		None => String::new(),
	};
	let _ = writeln!(out, "fn {}({}){} {{", fun.name, params.join(", "), ret);

	for block in &fun.blocks {
		let preds: Vec<String> = block.preds.iter().map(|p| format!("b{}", p.0)).collect();
		if preds.is_empty() {
			let _ = writeln!(out, "b{}:", block.id.0);
		} else {
			let _ = writeln!(out, "b{}: ; preds {}", block.id.0, preds.join(" "));
		}
		for id in &block.stmts {
			let _ = write!(out, "\t{}", render_stmt(module, fun, *id));
			// A failing self-check rides along as a bug marker.
			match crate::ir::verify::stmt_diagnostic(module, fun, *id) {
				Some(message) => {
					let _ = writeln!(out, " ; BUG: {message}");
				}
				None => out.push('\n'),
			}
		}
	}
	out.push_str("}\n");
	out
}

fn operand(fun: &IrFunction, id: IrStmtId) -> String {
	match fun.value(id) {
		Some(def) => format!("${}", def.num),
		None => format!("?{}", id.0),
	}
}

fn render_stmt(module: &IrModule, fun: &IrFunction, id: IrStmtId) -> String {
	let types = &module.types;
	let stmt = fun.stmt(id);
	let lhs = match &stmt.result {
		Some(def) => {
			let addr = if def.is_addr { "&" } else { "" };
			format!("${}: {addr}{} = ", def.num, type_name(types, def.ty))
		}
		None => String::new(),
	};
	let op = |id: IrStmtId| operand(fun, id);
	let body = match &stmt.kind {
		IrStmtKind::IntConst(v) => format!("int {v}"),
		IrStmtKind::FloatConst(v) => format!("float {v}"),
		IrStmtKind::TagConst { case } => format!("tag {case}"),
		IrStmtKind::Bin { op: o, lhs, rhs } => {
			format!("bin {o:?} {}, {}", op(*lhs), op(*rhs))
		}
		IrStmtKind::Cmp { op: o, lhs, rhs } => {
			format!("cmp {o:?} {}, {}", op(*lhs), op(*rhs))
		}
		IrStmtKind::Convert { value } => format!("convert {}", op(*value)),
		IrStmtKind::Alloc { on_stack, param } => {
			let mut text = if *on_stack { "alloc!".to_string() } else { "alloc".to_string() };
			if let Some(index) = param {
				let _ = write!(text, " param {index}");
			}
			text
		}
		IrStmtKind::GlobalAddr(global) => format!("global_addr g{}", global.0),
		IrStmtKind::FieldAddr { base, field } => {
			format!("field_addr {}, {field}", op(*base))
		}
		IrStmtKind::CaseAddr { base, case } => format!("case_addr {}, {case}", op(*base)),
		IrStmtKind::IndexAddr { base, index } => {
			format!("index_addr {}, {}", op(*base), op(*index))
		}
		IrStmtKind::ArrayLen { base } => format!("array_len {}", op(*base)),
		IrStmtKind::ChoiceTag { base } => format!("choice_tag {}", op(*base)),
		IrStmtKind::Load { addr } => format!("load {}", op(*addr)),
		IrStmtKind::Arg { index } => format!("arg {index}"),
		IrStmtKind::Store { addr, value } => format!("store {}, {}", op(*addr), op(*value)),
		IrStmtKind::Copy { dst, src } => format!("copy {}, {}", op(*dst), op(*src)),
		IrStmtKind::MakeAnd { dst, fields } => {
			format!("make_and {}{}", op(*dst), render_list(fun, fields))
		}
		IrStmtKind::MakeOr { dst, case, payload } => match payload {
			Some(payload) => format!("make_or {}, {case}, {}", op(*dst), op(*payload)),
			None => format!("make_or {}, {case}", op(*dst)),
		},
		IrStmtKind::MakeArray { dst, elems } => {
			format!("make_array {}{}", op(*dst), render_list(fun, elems))
		}
		IrStmtKind::MakeSlice { dst, elems } => {
			format!("make_slice {}{}", op(*dst), render_list(fun, elems))
		}
		IrStmtKind::MakeString { dst, str } => {
			let text = module
				.strings
				.get(str.0 as usize)
				.map(String::as_str)
				.unwrap_or("?");
			format!("make_string {}, {text:?}", op(*dst))
		}
		IrStmtKind::MakeVirtual { dst, env, fun: target } => {
			let name = module
				.functions
				.get(target.0 as usize)
				.map(|f| f.name.as_str())
				.unwrap_or("?");
			format!("make_virtual {}, {}, {name}", op(*dst), op(*env))
		}
		IrStmtKind::Call { fun: target, args } => {
			let name = module
				.functions
				.get(target.0 as usize)
				.map(|f| f.name.as_str())
				.unwrap_or("?");
			format!("call {name}{}", render_list(fun, args))
		}
		IrStmtKind::VirtualCall { receiver, args } => {
			format!("virtual_call {}{}", op(*receiver), render_list(fun, args))
		}
		IrStmtKind::Comment(text) => format!("; {text}"),
		IrStmtKind::Return { far: false } => "return".to_string(),
		IrStmtKind::Return { far: true } => "far_return".to_string(),
		IrStmtKind::Jump { to } => format!("jump b{}", to.0),
		IrStmtKind::Switch { discr, targets } => {
			let targets: Vec<String> = targets.iter().map(|t| format!("b{}", t.0)).collect();
			format!("switch {} [{}]", op(*discr), targets.join(" "))
		}
	};
	format!("{lhs}{body}")
}

fn render_list(fun: &IrFunction, ids: &[IrStmtId]) -> String {
	let mut out = String::new();
	for id in ids {
		let _ = write!(out, ", {}", operand(fun, *id));
	}
	out
}

pub fn type_name(types: &TypeTable, ty: TypeId) -> String {
	match types.get(ty) {
		TypeDef::Unit => "unit".to_string(),
		TypeDef::Int => "int".to_string(),
		TypeDef::Float => "float".to_string(),
		TypeDef::Str => "str".to_string(),
		TypeDef::Ref { to } => format!("&{}", type_name(types, *to)),
		TypeDef::Array { elem } => format!("[{}]", type_name(types, *elem)),
		TypeDef::Slice { elem } => format!("[]{}", type_name(types, *elem)),
		TypeDef::Record(record) => record.name.clone(),
		TypeDef::Choice(choice) => choice.name.clone(),
		TypeDef::Closure(sig) => {
			let params: Vec<String> =
				sig.params.iter().map(|p| type_name(types, *p)).collect();
			format!("fn({}) -> {}", params.join(", "), type_name(types, sig.ret))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::dump_module;
	use crate::ir::lower_program;
	use crate::sem::{BinOp, Exp, FnDecl, Program, Stm, TypeTable, VarDecl};

	#[test]
	fn dump_is_stable_across_runs() {
		let types = TypeTable::new();
		let int = types.builtins.int;
		let program = Program {
			types,
			globals: Vec::new(),
			fns: vec![FnDecl {
				name: "twice".to_string(),
				key: None,
				params: vec![VarDecl {
					name: "x".to_string(),
					ty: int,
				}],
				ret: int,
				locals: Vec::new(),
				body: Some(vec![Stm::Return(Some(Exp::Bin {
					op: BinOp::Add,
					lhs: Box::new(Exp::Param(0)),
					rhs: Box::new(Exp::Param(0)),
				}))]),
				is_test: false,
			}],
		};
		let first = dump_module(&lower_program(&program).expect("lowering"));
		let second = dump_module(&lower_program(&program).expect("lowering"));
		assert_eq!(first, second);
		assert!(first.contains("fn twice(x: int) -> int {"));
		assert!(first.contains("bin Add"));
	}
}
