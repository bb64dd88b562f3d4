use std::collections::BTreeSet;

use crate::ir::{IrBlockId, IrFunId, IrGlobalId, IrStmtId, IrStrId};
use crate::sem::TypeId;

/// The result slot of a value-producing statement. `num` is the dense
/// display/order number (reassigned on renumbering); `users` is a
/// non-owning cache of every statement currently using this value.
#[derive(Clone, Debug)]
pub struct IrValueDef {
	pub num: u32,
	pub ty: TypeId,
	/// True when this value denotes the address of a `ty`, false when it
	/// is a register value of `ty`. Composite-typed values are always
	/// addresses.
	pub is_addr: bool,
	pub users: BTreeSet<IrStmtId>,
}

#[derive(Clone, Debug)]
pub struct IrStmt {
	pub kind: IrStmtKind,
	pub result: Option<IrValueDef>,
	pub deleted: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IrBinOp {
	Add,
	Sub,
	Mul,
	Div,
	Rem,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IrCmpOp {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
}

#[derive(Clone, Debug)]
pub enum IrStmtKind {
	// Value-producing statements.
	IntConst(i64),
	FloatConst(f64),
	/// Register value of an enum-like or nilable choice type, by case
	/// index.
	TagConst { case: u32 },
	Bin { op: IrBinOp, lhs: IrStmtId, rhs: IrStmtId },
	Cmp { op: IrCmpOp, lhs: IrStmtId, rhs: IrStmtId },
	Convert { value: IrStmtId },
	/// Address of a fresh slot for the result type. Heap by default;
	/// escape analysis flips `on_stack`. `param` links a by-register
	/// parameter's backing slot to its parameter index.
	Alloc { on_stack: bool, param: Option<u32> },
	GlobalAddr(IrGlobalId),
	FieldAddr { base: IrStmtId, field: u32 },
	CaseAddr { base: IrStmtId, case: u32 },
	IndexAddr { base: IrStmtId, index: IrStmtId },
	ArrayLen { base: IrStmtId },
	ChoiceTag { base: IrStmtId },
	Load { addr: IrStmtId },
	/// Parameter access; index `params.len()` is the return slot.
	Arg { index: u32 },

	// Void statements.
	Store { addr: IrStmtId, value: IrStmtId },
	Copy { dst: IrStmtId, src: IrStmtId },
	MakeAnd { dst: IrStmtId, fields: Vec<IrStmtId> },
	MakeOr { dst: IrStmtId, case: u32, payload: Option<IrStmtId> },
	MakeArray { dst: IrStmtId, elems: Vec<IrStmtId> },
	MakeSlice { dst: IrStmtId, elems: Vec<IrStmtId> },
	MakeString { dst: IrStmtId, str: IrStrId },
	MakeVirtual { dst: IrStmtId, env: IrStmtId, fun: IrFunId },
	/// Static call. `args` aligns with the callee's parameter list and
	/// carries the return-slot address as trailing element when the
	/// callee has a return parameter.
	Call { fun: IrFunId, args: Vec<IrStmtId> },
	/// Indirect call through a closure value's dispatch record.
	VirtualCall { receiver: IrStmtId, args: Vec<IrStmtId> },
	/// Non-semantic annotation, stripped by cleanup.
	Comment(String),

	// Terminators.
	Return { far: bool },
	Jump { to: IrBlockId },
	/// One successor per case of the discriminant, case i to target i.
	Switch { discr: IrStmtId, targets: Vec<IrBlockId> },
}

impl IrStmtKind {
	pub fn produces_value(&self) -> bool {
		matches!(
			self,
			Self::IntConst(_)
				| Self::FloatConst(_)
				| Self::TagConst { .. }
				| Self::Bin { .. }
				| Self::Cmp { .. }
				| Self::Convert { .. }
				| Self::Alloc { .. }
				| Self::GlobalAddr(_)
				| Self::FieldAddr { .. }
				| Self::CaseAddr { .. }
				| Self::IndexAddr { .. }
				| Self::ArrayLen { .. }
				| Self::ChoiceTag { .. }
				| Self::Load { .. }
				| Self::Arg { .. }
		)
	}

	pub fn is_terminator(&self) -> bool {
		matches!(
			self,
			Self::Return { .. } | Self::Jump { .. } | Self::Switch { .. }
		)
	}

	pub fn for_each_operand(&self, mut f: impl FnMut(IrStmtId)) {
		match self {
			Self::IntConst(_)
			| Self::FloatConst(_)
			| Self::TagConst { .. }
			| Self::Alloc { .. }
			| Self::GlobalAddr(_)
			| Self::Arg { .. }
			| Self::Comment(_)
			| Self::Return { .. }
			| Self::Jump { .. } => {}
			Self::Bin { lhs, rhs, .. }
			| Self::Cmp { lhs, rhs, .. }
			| Self::Store {
				addr: lhs,
				value: rhs,
			}
			| Self::Copy { dst: lhs, src: rhs }
			| Self::IndexAddr {
				base: lhs,
				index: rhs,
			} => {
				f(*lhs);
				f(*rhs);
			}
			Self::Convert { value } => f(*value),
			Self::FieldAddr { base, .. }
			| Self::CaseAddr { base, .. }
			| Self::ArrayLen { base }
			| Self::ChoiceTag { base } => f(*base),
			Self::Load { addr } => f(*addr),
			Self::MakeAnd { dst, fields } => {
				f(*dst);
				for field in fields {
					f(*field);
				}
			}
			Self::MakeOr { dst, payload, .. } => {
				f(*dst);
				if let Some(payload) = payload {
					f(*payload);
				}
			}
			Self::MakeArray { dst, elems } | Self::MakeSlice { dst, elems } => {
				f(*dst);
				for elem in elems {
					f(*elem);
				}
			}
			Self::MakeString { dst, .. } => f(*dst),
			Self::MakeVirtual { dst, env, .. } => {
				f(*dst);
				f(*env);
			}
			Self::Call { args, .. } => {
				for arg in args {
					f(*arg);
				}
			}
			Self::VirtualCall { receiver, args } => {
				f(*receiver);
				for arg in args {
					f(*arg);
				}
			}
			Self::Switch { discr, .. } => f(*discr),
		}
	}

	pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut IrStmtId)) {
		match self {
			Self::IntConst(_)
			| Self::FloatConst(_)
			| Self::TagConst { .. }
			| Self::Alloc { .. }
			| Self::GlobalAddr(_)
			| Self::Arg { .. }
			| Self::Comment(_)
			| Self::Return { .. }
			| Self::Jump { .. } => {}
			Self::Bin { lhs, rhs, .. }
			| Self::Cmp { lhs, rhs, .. }
			| Self::Store {
				addr: lhs,
				value: rhs,
			}
			| Self::Copy { dst: lhs, src: rhs }
			| Self::IndexAddr {
				base: lhs,
				index: rhs,
			} => {
				f(lhs);
				f(rhs);
			}
			Self::Convert { value } => f(value),
			Self::FieldAddr { base, .. }
			| Self::CaseAddr { base, .. }
			| Self::ArrayLen { base }
			| Self::ChoiceTag { base } => f(base),
			Self::Load { addr } => f(addr),
			Self::MakeAnd { dst, fields } => {
				f(dst);
				for field in fields {
					f(field);
				}
			}
			Self::MakeOr { dst, payload, .. } => {
				f(dst);
				if let Some(payload) = payload {
					f(payload);
				}
			}
			Self::MakeArray { dst, elems } | Self::MakeSlice { dst, elems } => {
				f(dst);
				for elem in elems {
					f(elem);
				}
			}
			Self::MakeString { dst, .. } => f(dst),
			Self::MakeVirtual { dst, env, .. } => {
				f(dst);
				f(env);
			}
			Self::Call { args, .. } => {
				for arg in args {
					f(arg);
				}
			}
			Self::VirtualCall { receiver, args } => {
				f(receiver);
				for arg in args {
					f(arg);
				}
			}
			Self::Switch { discr, .. } => f(discr),
		}
	}

	pub fn operands(&self) -> Vec<IrStmtId> {
		let mut out = Vec::new();
		self.for_each_operand(|op| out.push(op));
		out
	}

	pub fn successors(&self) -> Vec<IrBlockId> {
		match self {
			Self::Jump { to } => vec![*to],
			Self::Switch { targets, .. } => targets.clone(),
			_ => Vec::new(),
		}
	}

	pub fn for_each_successor_mut(&mut self, mut f: impl FnMut(&mut IrBlockId)) {
		match self {
			Self::Jump { to } => f(to),
			Self::Switch { targets, .. } => {
				for target in targets {
					f(target);
				}
			}
			_ => {}
		}
	}

	/// The destination address when this statement is a write against a
	/// pre-allocated destination.
	pub fn write_dst(&self) -> Option<IrStmtId> {
		match self {
			Self::Store { addr, .. } => Some(*addr),
			Self::Copy { dst, .. }
			| Self::MakeAnd { dst, .. }
			| Self::MakeOr { dst, .. }
			| Self::MakeArray { dst, .. }
			| Self::MakeSlice { dst, .. }
			| Self::MakeString { dst, .. }
			| Self::MakeVirtual { dst, .. } => Some(*dst),
			_ => None,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::IntConst(_) => "int",
			Self::FloatConst(_) => "float",
			Self::TagConst { .. } => "tag",
			Self::Bin { .. } => "bin",
			Self::Cmp { .. } => "cmp",
			Self::Convert { .. } => "convert",
			Self::Alloc { .. } => "alloc",
			Self::GlobalAddr(_) => "global_addr",
			Self::FieldAddr { .. } => "field_addr",
			Self::CaseAddr { .. } => "case_addr",
			Self::IndexAddr { .. } => "index_addr",
			Self::ArrayLen { .. } => "array_len",
			Self::ChoiceTag { .. } => "choice_tag",
			Self::Load { .. } => "load",
			Self::Arg { .. } => "arg",
			Self::Store { .. } => "store",
			Self::Copy { .. } => "copy",
			Self::MakeAnd { .. } => "make_and",
			Self::MakeOr { .. } => "make_or",
			Self::MakeArray { .. } => "make_array",
			Self::MakeSlice { .. } => "make_slice",
			Self::MakeString { .. } => "make_string",
			Self::MakeVirtual { .. } => "make_virtual",
			Self::Call { .. } => "call",
			Self::VirtualCall { .. } => "virtual_call",
			Self::Comment(_) => "comment",
			Self::Return { far: false } => "return",
			Self::Return { far: true } => "far_return",
			Self::Jump { .. } => "jump",
			Self::Switch { .. } => "switch",
		}
	}
}
