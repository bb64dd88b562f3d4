use crate::sem::{TypeId, TypeTable};

/// A fully type-checked, generic-free compilation unit, as handed over by
/// the type checker. Every sub-expression's type is derivable without
/// further resolution; generic instantiations arrive as separate `FnDecl`s
/// carrying a stable `key`.
#[derive(Clone, Debug)]
pub struct Program {
	pub types: TypeTable,
	pub globals: Vec<GlobalDecl>,
	pub fns: Vec<FnDecl>,
}

#[derive(Clone, Debug)]
pub struct GlobalDecl {
	pub name: String,
	pub ty: TypeId,
}

#[derive(Clone, Debug)]
pub struct FnDecl {
	pub name: String,
	/// Instantiation identity. Two decls with the same key share one
	/// built function body.
	pub key: Option<String>,
	pub params: Vec<VarDecl>,
	pub ret: TypeId,
	pub locals: Vec<VarDecl>,
	/// `None` marks an external declaration: no body is ever built and
	/// the function is excluded from emission.
	pub body: Option<Vec<Stm>>,
	pub is_test: bool,
}

#[derive(Clone, Debug)]
pub struct VarDecl {
	pub name: String,
	pub ty: TypeId,
}

#[derive(Clone, Debug)]
pub enum Stm {
	Expr(Exp),
	Assign { local: usize, value: Exp },
	SetField { base: Exp, field: usize, value: Exp },
	SetIndex { base: Exp, index: Exp, value: Exp },
	SetGlobal { global: usize, value: Exp },
	/// Case 0 of the condition's choice type is the false branch,
	/// case 1 the true branch.
	If { cond: Exp, then_body: Vec<Stm>, else_body: Vec<Stm> },
	While { cond: Exp, body: Vec<Stm> },
	/// One arm per case, in declaration order.
	Case { scrutinee: Exp, arms: Vec<Vec<Stm>> },
	Return(Option<Exp>),
	/// Inside a closure body: return from the enclosing function's
	/// caller, not from the closure's own invocation.
	FarReturn(Option<Exp>),
}

#[derive(Clone, Debug)]
pub enum Exp {
	Int(i64),
	Float(f64),
	Str { ty: TypeId, value: String },
	Local(usize),
	Param(usize),
	/// Captured enclosing-function local, by position in the closure's
	/// capture list. Only valid inside closure bodies.
	Capture(usize),
	Global(usize),
	Field { base: Box<Exp>, field: usize },
	Index { base: Box<Exp>, index: Box<Exp> },
	Len(Box<Exp>),
	CasePayload { base: Box<Exp>, case: u32 },
	Bin { op: BinOp, lhs: Box<Exp>, rhs: Box<Exp> },
	Cmp { op: CmpOp, bool_ty: TypeId, lhs: Box<Exp>, rhs: Box<Exp> },
	Convert { to: TypeId, value: Box<Exp> },
	Call { target: usize, args: Vec<Exp> },
	CallClosure { closure: Box<Exp>, args: Vec<Exp> },
	MakeRecord { ty: TypeId, fields: Vec<Exp> },
	MakeChoice { ty: TypeId, case: u32, payload: Option<Box<Exp>> },
	MakeArray { ty: TypeId, elems: Vec<Exp> },
	MakeSlice { ty: TypeId, elems: Vec<Exp> },
	Closure {
		ty: TypeId,
		params: Vec<VarDecl>,
		locals: Vec<VarDecl>,
		/// Enclosing-function local indices, in capture-field order.
		captures: Vec<usize>,
		body: Vec<Stm>,
	},
	/// Receiver evaluated once; each message is sent to it in order; the
	/// cascade's value is the receiver itself.
	Cascade { receiver: Box<Exp>, messages: Vec<CascadeMsg> },
}

#[derive(Clone, Debug)]
pub struct CascadeMsg {
	pub target: usize,
	pub args: Vec<Exp>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinOp {
	Add,
	Sub,
	Mul,
	Div,
	Rem,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmpOp {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
}
