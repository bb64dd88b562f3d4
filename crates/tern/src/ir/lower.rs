use std::collections::HashMap;

use crate::ir::{
	IrBinOp, IrBlockId, IrCmpOp, IrClosureInfo, IrFunId, IrFunction, IrModule, IrParam,
	IrStmtId, IrStmtKind,
};
use crate::sem::{
	BinOp, CascadeMsg, CmpOp, Exp, FnDecl, Program, Stm, TypeDef, TypeId, VarDecl,
};

#[derive(Clone, Debug)]
pub struct IrLowerError {
	pub function: String,
	pub message: String,
}

/// Lowers a whole type-checked program into an initial, unoptimized
/// module: per function, block 0 carries every local allocation and the
/// parameter spills, the remaining blocks carry the translated body.
pub fn lower_program(program: &Program) -> Result<IrModule, Vec<IrLowerError>> {
	let mut module = IrModule::new(program.types.clone());
	for global in &program.globals {
		module.add_global(global.name.clone(), global.ty);
	}

	// Instantiations of the same generic definition share one body;
	// the stable key decides identity before anything is built.
	let mut by_key: HashMap<&str, IrFunId> = HashMap::new();
	let mut fn_ids = Vec::with_capacity(program.fns.len());
	let mut canonical = Vec::new();
	for (index, decl) in program.fns.iter().enumerate() {
		if let Some(key) = &decl.key
			&& let Some(existing) = by_key.get(key.as_str())
		{
			fn_ids.push(*existing);
			continue;
		}
		let id = module.add_function(function_shell(&module, decl));
		if let Some(key) = &decl.key {
			by_key.insert(key, id);
		}
		fn_ids.push(id);
		canonical.push((index, id));
	}

	let mut errors = Vec::new();
	for (index, id) in canonical {
		let decl = &program.fns[index];
		let Some(body) = &decl.body else {
			continue;
		};
		if let Err(message) = lower_function_body(
			&mut module,
			&fn_ids,
			program,
			id,
			&decl.params,
			&decl.locals,
			body,
			None,
		) {
			errors.push(IrLowerError {
				function: decl.name.clone(),
				message,
			});
		}
	}

	if errors.is_empty() {
		Ok(module)
	} else {
		Err(errors)
	}
}

fn function_shell(module: &IrModule, decl: &FnDecl) -> IrFunction {
	let mut shell = IrFunction::new(decl.name.clone());
	for param in &decl.params {
		if module.types.is_empty(param.ty) {
			continue;
		}
		shell.params.push(IrParam {
			name: param.name.clone(),
			ty: param.ty,
			by_addr: module.types.is_composite(param.ty),
		});
	}
	if !module.types.is_empty(decl.ret) {
		shell.ret_param = Some(decl.ret);
	}
	shell.is_test = decl.is_test;
	shell
}

/// How a source parameter is reached from the body.
enum ParamAccess {
	/// Empty-typed, dropped from the signature.
	None,
	/// By-register parameter spilled into a backing slot in block 0.
	Slot(IrStmtId),
	/// By-address parameter; the argument value is the address.
	Addr(IrStmtId),
}

#[derive(Clone)]
struct CaptureAccess {
	field: u32,
	/// Field type in the capture record: the variable's own type for
	/// by-value captures, a reference to it for by-address captures.
	field_ty: TypeId,
}

struct InnerClosure {
	/// Source type and record access per capture; the access is absent
	/// for empty-typed variables, which take no field.
	captures: Vec<(TypeId, Option<CaptureAccess>)>,
	ret_slot_field: Option<u32>,
	home_ret: Option<TypeId>,
}

struct FunctionLowerer<'a> {
	module: &'a mut IrModule,
	fn_ids: &'a [IrFunId],
	program: &'a Program,
	fun: IrFunction,
	decl_params: &'a [VarDecl],
	decl_locals: &'a [VarDecl],
	entry: IrBlockId,
	first_body: IrBlockId,
	current: IrBlockId,
	local_slots: Vec<IrStmtId>,
	param_access: Vec<ParamAccess>,
	env_arg: Option<IrStmtId>,
	closure: Option<InnerClosure>,
	ret_arg: Option<IrStmtId>,
}

#[allow(clippy::too_many_arguments)]
fn lower_function_body(
	module: &mut IrModule,
	fn_ids: &[IrFunId],
	program: &Program,
	id: IrFunId,
	params: &[VarDecl],
	locals: &[VarDecl],
	body: &[Stm],
	closure: Option<InnerClosure>,
) -> Result<(), String> {
	let fun = std::mem::take(&mut module.functions[id.0 as usize]);
	let mut lowerer = FunctionLowerer {
		module,
		fn_ids,
		program,
		fun,
		decl_params: params,
		decl_locals: locals,
		entry: IrBlockId(0),
		first_body: IrBlockId(0),
		current: IrBlockId(0),
		local_slots: Vec::new(),
		param_access: Vec::new(),
		env_arg: None,
		closure,
		ret_arg: None,
	};
	let result = lowerer.run(body);
	let fun = lowerer.fun;
	module.functions[id.0 as usize] = fun;
	result
}

impl<'a> FunctionLowerer<'a> {
	fn run(&mut self, body: &[Stm]) -> Result<(), String> {
		self.entry = self.fun.add_block();
		self.first_body = self.fun.add_block();
		self.current = self.first_body;
		self.lower_prologue();
		for stm in body {
			self.lower_stm(stm)?;
		}
		if !self.is_terminated(self.current) {
			self.push_void(IrStmtKind::Return { far: false });
		}
		let jump = self.fun.new_stmt(IrStmtKind::Jump {
			to: self.first_body,
		});
		self.fun.push_stmt(self.entry, jump);
		self.fun.recompute_preds();
		Ok(())
	}

	/// Block 0: local allocations, argument accesses, parameter spills.
	fn lower_prologue(&mut self) {
		for local in self.decl_locals {
			let slot = self.fun.new_value(
				IrStmtKind::Alloc {
					on_stack: false,
					param: None,
				},
				local.ty,
				true,
			);
			self.fun.push_stmt(self.entry, slot);
			self.local_slots.push(slot);
		}
		if self.closure.is_some() {
			// The closure's captured-state record is argument 0.
			let env_ty = self.fun.params[0].ty;
			let env = self.fun.new_value(IrStmtKind::Arg { index: 0 }, env_ty, true);
			self.fun.push_stmt(self.entry, env);
			self.env_arg = Some(env);
		}
		let skip = usize::from(self.closure.is_some());
		let mut ir_index = skip as u32;
		for param in self.decl_params {
			if self.module.types.is_empty(param.ty) {
				self.param_access.push(ParamAccess::None);
				continue;
			}
			if self.module.types.is_composite(param.ty) {
				let arg = self.fun.new_value(
					IrStmtKind::Arg { index: ir_index },
					param.ty,
					true,
				);
				self.fun.push_stmt(self.entry, arg);
				self.param_access.push(ParamAccess::Addr(arg));
			} else {
				let arg = self.fun.new_value(
					IrStmtKind::Arg { index: ir_index },
					param.ty,
					false,
				);
				self.fun.push_stmt(self.entry, arg);
				let slot = self.fun.new_value(
					IrStmtKind::Alloc {
						on_stack: false,
						param: Some(ir_index),
					},
					param.ty,
					true,
				);
				self.fun.push_stmt(self.entry, slot);
				let spill = self.fun.new_stmt(IrStmtKind::Store {
					addr: slot,
					value: arg,
				});
				self.fun.push_stmt(self.entry, spill);
				self.param_access.push(ParamAccess::Slot(slot));
			}
			ir_index += 1;
		}
	}

	fn is_terminated(&self, block: IrBlockId) -> bool {
		self.fun
			.block(block)
			.stmts
			.last()
			.is_some_and(|last| self.fun.stmt(*last).kind.is_terminator())
	}

	fn push_value(&mut self, kind: IrStmtKind, ty: TypeId, is_addr: bool) -> IrStmtId {
		let id = self.fun.new_value(kind, ty, is_addr);
		self.fun.push_stmt(self.current, id);
		id
	}

	fn push_void(&mut self, kind: IrStmtKind) -> IrStmtId {
		let id = self.fun.new_stmt(kind);
		self.fun.push_stmt(self.current, id);
		id
	}

	/// Temporaries allocate in block 0 like locals, so the function has
	/// one fixed set of slots regardless of control flow.
	fn alloc_tmp(&mut self, ty: TypeId) -> IrStmtId {
		let id = self.fun.new_value(
			IrStmtKind::Alloc {
				on_stack: false,
				param: None,
			},
			ty,
			true,
		);
		self.fun.push_stmt(self.entry, id);
		id
	}

	fn ret_slot_arg(&mut self) -> Result<IrStmtId, String> {
		if let Some(existing) = self.ret_arg {
			return Ok(existing);
		}
		let ret = self
			.fun
			.ret_param
			.ok_or_else(|| "function has no return slot".to_string())?;
		let index = self.fun.params.len() as u32;
		let arg = self.fun.new_value(IrStmtKind::Arg { index }, ret, true);
		self.fun.push_stmt(self.entry, arg);
		self.ret_arg = Some(arg);
		Ok(arg)
	}

	/// Address of the lexical home function's return slot, chased
	/// through the capture record when this function is a closure.
	fn home_ret_slot_addr(&mut self) -> Result<IrStmtId, String> {
		let Some(closure) = &self.closure else {
			return self.ret_slot_arg();
		};
		let field = closure
			.ret_slot_field
			.ok_or_else(|| "closure captures no return slot".to_string())?;
		let home_ret = closure
			.home_ret
			.ok_or_else(|| "closure home function returns nothing".to_string())?;
		let env = self.env_arg.ok_or_else(|| "closure has no env".to_string())?;
		let field_ty = self.module.types.ref_to(home_ret);
		let fa = self.push_value(IrStmtKind::FieldAddr { base: env, field }, field_ty, true);
		Ok(self.push_value(IrStmtKind::Load { addr: fa }, field_ty, false))
	}

	fn lower_stm(&mut self, stm: &Stm) -> Result<(), String> {
		match stm {
			Stm::Expr(e) => {
				self.lower_exp(e)?;
			}
			Stm::Assign { local, value } => {
				let ty = self.decl_locals[*local].ty;
				let slot = self.local_slots[*local];
				let value = self.lower_exp(value)?;
				self.write_to(slot, ty, value)?;
			}
			Stm::SetField { base, field, value } => {
				let base_ty = self.exp_ty(base)?;
				let field_ty = self.field_ty(base_ty, *field)?;
				let base = self.require(base, "field target")?;
				let value = self.lower_exp(value)?;
				if !self.module.types.is_empty(field_ty) {
					let fa = self.push_value(
						IrStmtKind::FieldAddr {
							base,
							field: *field as u32,
						},
						field_ty,
						true,
					);
					self.write_to(fa, field_ty, value)?;
				}
			}
			Stm::SetIndex { base, index, value } => {
				let base_ty = self.exp_ty(base)?;
				let elem_ty = self.elem_ty(base_ty)?;
				let base = self.require(base, "index target")?;
				let index = self.require(index, "index")?;
				let value = self.lower_exp(value)?;
				if !self.module.types.is_empty(elem_ty) {
					let ia = self.push_value(
						IrStmtKind::IndexAddr { base, index },
						elem_ty,
						true,
					);
					self.write_to(ia, elem_ty, value)?;
				}
			}
			Stm::SetGlobal { global, value } => {
				let decl = &self.module.globals[*global];
				let (gid, ty) = (decl.id, decl.ty);
				let value = self.lower_exp(value)?;
				if !self.module.types.is_empty(ty) {
					let ga = self.push_value(IrStmtKind::GlobalAddr(gid), ty, true);
					self.write_to(ga, ty, value)?;
				}
			}
			Stm::If {
				cond,
				then_body,
				else_body,
			} => {
				let discr = self.require(cond, "condition")?;
				let then_block = self.fun.add_block();
				let else_block = self.fun.add_block();
				let join = self.fun.add_block();
				self.push_void(IrStmtKind::Switch {
					discr,
					targets: vec![else_block, then_block],
				});
				self.current = then_block;
				for stm in then_body {
					self.lower_stm(stm)?;
				}
				if !self.is_terminated(self.current) {
					self.push_void(IrStmtKind::Jump { to: join });
				}
				self.current = else_block;
				for stm in else_body {
					self.lower_stm(stm)?;
				}
				if !self.is_terminated(self.current) {
					self.push_void(IrStmtKind::Jump { to: join });
				}
				self.current = join;
			}
			Stm::While { cond, body } => {
				let head = self.fun.add_block();
				self.push_void(IrStmtKind::Jump { to: head });
				self.current = head;
				let discr = self.require(cond, "loop condition")?;
				let body_block = self.fun.add_block();
				let exit = self.fun.add_block();
				self.push_void(IrStmtKind::Switch {
					discr,
					targets: vec![exit, body_block],
				});
				self.current = body_block;
				for stm in body {
					self.lower_stm(stm)?;
				}
				if !self.is_terminated(self.current) {
					self.push_void(IrStmtKind::Jump { to: head });
				}
				self.current = exit;
			}
			Stm::Case { scrutinee, arms } => {
				let ty = self.exp_ty(scrutinee)?;
				let cases = match self.module.types.get(ty) {
					TypeDef::Choice(choice) => choice.cases.len(),
					_ => return Err("case scrutinee is not a choice".to_string()),
				};
				if cases != arms.len() {
					return Err(format!(
						"case arm count {} does not match {} cases",
						arms.len(),
						cases
					));
				}
				let value = self.require(scrutinee, "case scrutinee")?;
				let discr = if self.module.types.is_simple(ty) {
					value
				} else {
					let int = self.module.types.builtins.int;
					self.push_value(IrStmtKind::ChoiceTag { base: value }, int, false)
				};
				let targets: Vec<IrBlockId> =
					(0..arms.len()).map(|_| self.fun.add_block()).collect();
				let join = self.fun.add_block();
				self.push_void(IrStmtKind::Switch {
					discr,
					targets: targets.clone(),
				});
				for (arm, target) in arms.iter().zip(targets) {
					self.current = target;
					for stm in arm {
						self.lower_stm(stm)?;
					}
					if !self.is_terminated(self.current) {
						self.push_void(IrStmtKind::Jump { to: join });
					}
				}
				self.current = join;
			}
			Stm::Return(value) => {
				if let Some(ret_ty) = self.fun.ret_param {
					let value = match value {
						Some(value) => self.lower_exp(value)?,
						None => None,
					};
					let slot = self.ret_slot_arg()?;
					self.write_to(slot, ret_ty, value)?;
				} else if let Some(value) = value {
					self.lower_exp(value)?;
				}
				self.push_void(IrStmtKind::Return { far: false });
				// Dead code after a return lands in an unreachable
				// block and is dropped by cleanup, keeping this a
				// single linear pass.
				self.current = self.fun.add_block();
			}
			Stm::FarReturn(value) => {
				if self.closure.is_none() {
					return Err("far return outside a closure body".to_string());
				}
				let home_ret = self.closure.as_ref().and_then(|c| c.home_ret);
				if let Some(ret_ty) = home_ret {
					let value = match value {
						Some(value) => self.lower_exp(value)?,
						None => None,
					};
					let slot = self.home_ret_slot_addr()?;
					self.write_to(slot, ret_ty, value)?;
				} else if let Some(value) = value {
					self.lower_exp(value)?;
				}
				self.push_void(IrStmtKind::Return { far: true });
				self.current = self.fun.add_block();
			}
		}
		Ok(())
	}

	/// Store or copy `value` into `slot` according to the type's
	/// classification; empty types write nothing.
	fn write_to(
		&mut self,
		slot: IrStmtId,
		ty: TypeId,
		value: Option<IrStmtId>,
	) -> Result<(), String> {
		if self.module.types.is_empty(ty) {
			return Ok(());
		}
		let value = value.ok_or_else(|| "missing value for non-empty write".to_string())?;
		if self.module.types.is_composite(ty) {
			self.push_void(IrStmtKind::Copy {
				dst: slot,
				src: value,
			});
		} else {
			self.push_void(IrStmtKind::Store { addr: slot, value });
		}
		Ok(())
	}

	fn require(&mut self, e: &Exp, what: &str) -> Result<IrStmtId, String> {
		self.lower_exp(e)?
			.ok_or_else(|| format!("{what} produced no value"))
	}

	fn lower_exp(&mut self, e: &Exp) -> Result<Option<IrStmtId>, String> {
		let int = self.module.types.builtins.int;
		let float = self.module.types.builtins.float;
		match e {
			Exp::Int(v) => Ok(Some(self.push_value(IrStmtKind::IntConst(*v), int, false))),
			Exp::Float(v) => Ok(Some(self.push_value(
				IrStmtKind::FloatConst(*v),
				float,
				false,
			))),
			Exp::Str { ty, value } => {
				let dst = self.alloc_tmp(*ty);
				let str = self.module.intern_string(value);
				self.push_void(IrStmtKind::MakeString { dst, str });
				Ok(Some(dst))
			}
			Exp::Local(index) => {
				let ty = self.decl_locals[*index].ty;
				let slot = self.local_slots[*index];
				self.read_slot(slot, ty)
			}
			Exp::Param(index) => match self.param_access[*index] {
				ParamAccess::None => Ok(None),
				ParamAccess::Addr(arg) => Ok(Some(arg)),
				ParamAccess::Slot(slot) => {
					let ty = self.decl_params[*index].ty;
					self.read_slot(slot, ty)
				}
			},
			Exp::Capture(index) => {
				let Some(closure) = &self.closure else {
					return Err("capture access outside a closure body".to_string());
				};
				let Some(access) = closure.captures[*index].1.clone() else {
					return Ok(None);
				};
				let env = self
					.env_arg
					.ok_or_else(|| "closure has no env".to_string())?;
				let fa = self.push_value(
					IrStmtKind::FieldAddr {
						base: env,
						field: access.field,
					},
					access.field_ty,
					true,
				);
				Ok(Some(self.push_value(
					IrStmtKind::Load { addr: fa },
					access.field_ty,
					false,
				)))
			}
			Exp::Global(index) => {
				let decl = &self.module.globals[*index];
				let (gid, ty) = (decl.id, decl.ty);
				if self.module.types.is_empty(ty) {
					return Ok(None);
				}
				let ga = self.push_value(IrStmtKind::GlobalAddr(gid), ty, true);
				if self.module.types.is_composite(ty) {
					Ok(Some(ga))
				} else {
					Ok(Some(self.push_value(IrStmtKind::Load { addr: ga }, ty, false)))
				}
			}
			Exp::Field { base, field } => {
				let base_ty = self.exp_ty(base)?;
				let field_ty = self.field_ty(base_ty, *field)?;
				if self.module.types.is_empty(field_ty) {
					self.lower_exp(base)?;
					return Ok(None);
				}
				let base = self.require(base, "field base")?;
				let fa = self.push_value(
					IrStmtKind::FieldAddr {
						base,
						field: *field as u32,
					},
					field_ty,
					true,
				);
				if self.module.types.is_composite(field_ty) {
					Ok(Some(fa))
				} else {
					Ok(Some(self.push_value(
						IrStmtKind::Load { addr: fa },
						field_ty,
						false,
					)))
				}
			}
			Exp::Index { base, index } => {
				let base_ty = self.exp_ty(base)?;
				let elem_ty = self.elem_ty(base_ty)?;
				let base = self.require(base, "index base")?;
				let index = self.require(index, "index")?;
				if self.module.types.is_empty(elem_ty) {
					return Ok(None);
				}
				let ia = self.push_value(IrStmtKind::IndexAddr { base, index }, elem_ty, true);
				if self.module.types.is_composite(elem_ty) {
					Ok(Some(ia))
				} else {
					Ok(Some(self.push_value(
						IrStmtKind::Load { addr: ia },
						elem_ty,
						false,
					)))
				}
			}
			Exp::Len(base) => {
				let base = self.require(base, "length operand")?;
				Ok(Some(self.push_value(IrStmtKind::ArrayLen { base }, int, false)))
			}
			Exp::CasePayload { base, case } => {
				let base_ty = self.exp_ty(base)?;
				let payload_ty = self.payload_ty(base_ty, *case)?;
				if self.module.types.is_empty(payload_ty) {
					self.lower_exp(base)?;
					return Ok(None);
				}
				let base = self.require(base, "case payload base")?;
				let ca = self.push_value(
					IrStmtKind::CaseAddr { base, case: *case },
					payload_ty,
					true,
				);
				if self.module.types.is_composite(payload_ty) {
					Ok(Some(ca))
				} else {
					Ok(Some(self.push_value(
						IrStmtKind::Load { addr: ca },
						payload_ty,
						false,
					)))
				}
			}
			Exp::Bin { op, lhs, rhs } => {
				let ty = self.exp_ty(lhs)?;
				let lhs = self.require(lhs, "operand")?;
				let rhs = self.require(rhs, "operand")?;
				Ok(Some(self.push_value(
					IrStmtKind::Bin {
						op: lower_bin_op(*op),
						lhs,
						rhs,
					},
					ty,
					false,
				)))
			}
			Exp::Cmp {
				op,
				bool_ty,
				lhs,
				rhs,
			} => {
				let lhs = self.require(lhs, "operand")?;
				let rhs = self.require(rhs, "operand")?;
				Ok(Some(self.push_value(
					IrStmtKind::Cmp {
						op: lower_cmp_op(*op),
						lhs,
						rhs,
					},
					*bool_ty,
					false,
				)))
			}
			Exp::Convert { to, value } => {
				let value = self.require(value, "conversion operand")?;
				Ok(Some(self.push_value(IrStmtKind::Convert { value }, *to, false)))
			}
			Exp::Call { target, args } => self.emit_static_call(*target, None, args),
			Exp::CallClosure { closure, args } => {
				let sig_ty = self.exp_ty(closure)?;
				let ret = match self.module.types.get(sig_ty) {
					TypeDef::Closure(sig) => sig.ret,
					_ => return Err("indirect call target is not a closure".to_string()),
				};
				let receiver = self.require(closure, "closure value")?;
				let mut ops = Vec::with_capacity(args.len() + 1);
				for arg in args {
					if let Some(op) = self.lower_argument(arg)? {
						ops.push(op);
					}
				}
				let result = self.reserve_ret_slot(ret, &mut ops);
				self.push_void(IrStmtKind::VirtualCall {
					receiver,
					args: ops,
				});
				self.finish_call_result(ret, result)
			}
			Exp::MakeRecord { ty, fields } => {
				if self.module.types.is_empty(*ty) {
					for field in fields {
						self.lower_exp(field)?;
					}
					return Ok(None);
				}
				let dst = self.alloc_tmp(*ty);
				let mut ops = Vec::new();
				for field in fields {
					if let Some(op) = self.lower_exp(field)? {
						ops.push(op);
					}
				}
				self.push_void(IrStmtKind::MakeAnd { dst, fields: ops });
				Ok(Some(dst))
			}
			Exp::MakeChoice { ty, case, payload } => {
				if self.module.types.is_simple(*ty) {
					// Enum-like and nilable choices are register
					// values: the tag, or the wrapped reference.
					return match payload {
						Some(payload) => {
							let value = self.require(payload, "choice payload")?;
							Ok(Some(self.push_value(
								IrStmtKind::Convert { value },
								*ty,
								false,
							)))
						}
						None => Ok(Some(self.push_value(
							IrStmtKind::TagConst { case: *case },
							*ty,
							false,
						))),
					};
				}
				let dst = self.alloc_tmp(*ty);
				let op = match payload {
					Some(payload) => self.lower_exp(payload)?,
					None => None,
				};
				self.push_void(IrStmtKind::MakeOr {
					dst,
					case: *case,
					payload: op,
				});
				Ok(Some(dst))
			}
			Exp::MakeArray { ty, elems } => self.lower_sequence_ctor(*ty, elems, true),
			Exp::MakeSlice { ty, elems } => self.lower_sequence_ctor(*ty, elems, false),
			Exp::Closure {
				ty,
				params,
				locals,
				captures,
				body,
			} => self.lower_closure(*ty, params, locals, captures, body),
			Exp::Cascade { receiver, messages } => {
				let value = self.require(receiver, "cascade receiver")?;
				for CascadeMsg { target, args } in messages {
					self.emit_static_call(*target, Some(value), args)?;
				}
				Ok(Some(value))
			}
		}
	}

	fn read_slot(&mut self, slot: IrStmtId, ty: TypeId) -> Result<Option<IrStmtId>, String> {
		if self.module.types.is_empty(ty) {
			return Ok(None);
		}
		if self.module.types.is_composite(ty) {
			return Ok(Some(slot));
		}
		Ok(Some(self.push_value(IrStmtKind::Load { addr: slot }, ty, false)))
	}

	fn lower_sequence_ctor(
		&mut self,
		ty: TypeId,
		elems: &[Exp],
		array: bool,
	) -> Result<Option<IrStmtId>, String> {
		let elem_ty = self.elem_ty(ty)?;
		let dst = self.alloc_tmp(ty);
		let mut ops = Vec::new();
		for elem in elems {
			let op = self.lower_exp(elem)?;
			if !self.module.types.is_empty(elem_ty) {
				ops.push(op.ok_or_else(|| "element produced no value".to_string())?);
			}
		}
		if array {
			self.push_void(IrStmtKind::MakeArray { dst, elems: ops });
		} else {
			self.push_void(IrStmtKind::MakeSlice { dst, elems: ops });
		}
		Ok(Some(dst))
	}

	/// By-value composite arguments are copied at the call site; the
	/// receiver of a cascade is exempt and passes its address directly.
	fn lower_argument(&mut self, arg: &Exp) -> Result<Option<IrStmtId>, String> {
		let ty = self.exp_ty(arg)?;
		if self.module.types.is_empty(ty) {
			self.lower_exp(arg)?;
			return Ok(None);
		}
		let op = self.require(arg, "argument")?;
		if self.module.types.is_composite(ty) {
			let tmp = self.alloc_tmp(ty);
			self.push_void(IrStmtKind::Copy { dst: tmp, src: op });
			return Ok(Some(tmp));
		}
		Ok(Some(op))
	}

	fn reserve_ret_slot(&mut self, ret: TypeId, ops: &mut Vec<IrStmtId>) -> Option<IrStmtId> {
		if self.module.types.is_empty(ret) {
			return None;
		}
		let tmp = self.alloc_tmp(ret);
		ops.push(tmp);
		Some(tmp)
	}

	fn finish_call_result(
		&mut self,
		ret: TypeId,
		slot: Option<IrStmtId>,
	) -> Result<Option<IrStmtId>, String> {
		let Some(slot) = slot else {
			return Ok(None);
		};
		if self.module.types.is_composite(ret) {
			return Ok(Some(slot));
		}
		Ok(Some(self.push_value(IrStmtKind::Load { addr: slot }, ret, false)))
	}

	fn emit_static_call(
		&mut self,
		target: usize,
		receiver: Option<IrStmtId>,
		args: &[Exp],
	) -> Result<Option<IrStmtId>, String> {
		let fun = self.fn_ids[target];
		let ret = self.program.fns[target].ret;
		let mut ops = Vec::with_capacity(args.len() + 2);
		if let Some(receiver) = receiver {
			ops.push(receiver);
		}
		for arg in args {
			if let Some(op) = self.lower_argument(arg)? {
				ops.push(op);
			}
		}
		let result = self.reserve_ret_slot(ret, &mut ops);
		self.push_void(IrStmtKind::Call { fun, args: ops });
		self.finish_call_result(ret, result)
	}

	fn lower_closure(
		&mut self,
		ty: TypeId,
		params: &[VarDecl],
		locals: &[VarDecl],
		captures: &[usize],
		body: &[Stm],
	) -> Result<Option<IrStmtId>, String> {
		let sig = match self.module.types.get(ty) {
			TypeDef::Closure(sig) => sig.clone(),
			_ => return Err("closure literal has a non-closure type".to_string()),
		};
		let home_ret = match &self.closure {
			Some(inner) => inner.home_ret,
			None => self.fun.ret_param,
		};

		// One capture-record field per captured variable: by value for
		// simple variables, by address for composite ones; plus the
		// home function's return-slot address when it returns a value.
		let mut fields = Vec::new();
		let mut field_ops = Vec::new();
		let mut accesses = Vec::new();
		for local in captures {
			let var_ty = self.decl_locals[*local].ty;
			if self.module.types.is_empty(var_ty) {
				accesses.push((var_ty, None));
				continue;
			}
			let by_addr = self.module.types.is_composite(var_ty);
			let field_ty = if by_addr {
				self.module.types.ref_to(var_ty)
			} else {
				var_ty
			};
			let op = if by_addr {
				self.local_slots[*local]
			} else {
				let slot = self.local_slots[*local];
				self.push_value(IrStmtKind::Load { addr: slot }, var_ty, false)
			};
			accesses.push((
				var_ty,
				Some(CaptureAccess {
					field: fields.len() as u32,
					field_ty,
				}),
			));
			fields.push(crate::sem::FieldDef {
				name: self.decl_locals[*local].name.clone(),
				ty: field_ty,
			});
			field_ops.push(op);
		}
		let ret_slot_field = match home_ret {
			Some(ret_ty) => {
				let field_ty = self.module.types.ref_to(ret_ty);
				let op = self.home_ret_slot_addr()?;
				let field = fields.len() as u32;
				fields.push(crate::sem::FieldDef {
					name: "ret_slot".to_string(),
					ty: field_ty,
				});
				field_ops.push(op);
				Some(field)
			}
			None => None,
		};

		let serial = self.module.functions.len();
		let env_ty = self.module.types.add(TypeDef::Record(crate::sem::RecordType {
			name: format!("{}.env{}", self.fun.name, serial),
			fields,
		}));

		let env = self.alloc_tmp(env_ty);
		self.push_void(IrStmtKind::MakeAnd {
			dst: env,
			fields: field_ops,
		});

		let mut shell = IrFunction::new(format!("{}.fn{}", self.fun.name, serial));
		shell.params.push(IrParam {
			name: "self".to_string(),
			ty: env_ty,
			by_addr: true,
		});
		for param in params {
			if self.module.types.is_empty(param.ty) {
				continue;
			}
			shell.params.push(IrParam {
				name: param.name.clone(),
				ty: param.ty,
				by_addr: self.module.types.is_composite(param.ty),
			});
		}
		if !self.module.types.is_empty(sig.ret) {
			shell.ret_param = Some(sig.ret);
		}
		shell.closure = Some(IrClosureInfo {
			parent: self.fun.id,
			env_ty,
			ret_slot_field,
			home_ret,
		});
		let fid = self.module.add_function(shell);

		lower_function_body(
			self.module,
			self.fn_ids,
			self.program,
			fid,
			params,
			locals,
			body,
			Some(InnerClosure {
				captures: accesses,
				ret_slot_field,
				home_ret,
			}),
		)?;

		let closure_slot = self.alloc_tmp(ty);
		self.push_void(IrStmtKind::MakeVirtual {
			dst: closure_slot,
			env,
			fun: fid,
		});
		Ok(Some(closure_slot))
	}

	// Result type of a fully-typed expression.
	fn exp_ty(&self, e: &Exp) -> Result<TypeId, String> {
		let builtins = self.module.types.builtins;
		Ok(match e {
			Exp::Int(_) => builtins.int,
			Exp::Float(_) => builtins.float,
			Exp::Str { ty, .. } => *ty,
			Exp::Local(index) => self.decl_locals[*index].ty,
			Exp::Param(index) => self.decl_params[*index].ty,
			Exp::Capture(index) => {
				let Some(closure) = &self.closure else {
					return Err("capture access outside a closure body".to_string());
				};
				closure.captures[*index].0
			}
			Exp::Global(index) => self.module.globals[*index].ty,
			Exp::Field { base, field } => {
				let base_ty = self.exp_ty(base)?;
				self.field_ty(base_ty, *field)?
			}
			Exp::Index { base, .. } => {
				let base_ty = self.exp_ty(base)?;
				self.elem_ty(base_ty)?
			}
			Exp::Len(_) => builtins.int,
			Exp::CasePayload { base, case } => {
				let base_ty = self.exp_ty(base)?;
				self.payload_ty(base_ty, *case)?
			}
			Exp::Bin { lhs, .. } => self.exp_ty(lhs)?,
			Exp::Cmp { bool_ty, .. } => *bool_ty,
			Exp::Convert { to, .. } => *to,
			Exp::Call { target, .. } => self.program.fns[*target].ret,
			Exp::CallClosure { closure, .. } => {
				let sig_ty = self.exp_ty(closure)?;
				match self.module.types.get(sig_ty) {
					TypeDef::Closure(sig) => sig.ret,
					_ => {
						return Err(
							"indirect call target is not a closure".to_string()
						);
					}
				}
			}
			Exp::MakeRecord { ty, .. }
			| Exp::MakeChoice { ty, .. }
			| Exp::MakeArray { ty, .. }
			| Exp::MakeSlice { ty, .. }
			| Exp::Closure { ty, .. } => *ty,
			Exp::Cascade { receiver, .. } => self.exp_ty(receiver)?,
		})
	}

	fn field_ty(&self, base_ty: TypeId, field: usize) -> Result<TypeId, String> {
		let record_ty = match self.module.types.get(base_ty) {
			TypeDef::Ref { to } => *to,
			_ => base_ty,
		};
		match self.module.types.get(record_ty) {
			TypeDef::Record(record) => record
				.fields
				.get(field)
				.map(|f| f.ty)
				.ok_or_else(|| format!("field {field} out of range")),
			_ => Err("field access on a non-record type".to_string()),
		}
	}

	fn elem_ty(&self, base_ty: TypeId) -> Result<TypeId, String> {
		let seq_ty = match self.module.types.get(base_ty) {
			TypeDef::Ref { to } => *to,
			_ => base_ty,
		};
		match self.module.types.get(seq_ty) {
			TypeDef::Array { elem } | TypeDef::Slice { elem } => Ok(*elem),
			_ => Err("indexing a non-sequence type".to_string()),
		}
	}

	fn payload_ty(&self, base_ty: TypeId, case: u32) -> Result<TypeId, String> {
		match self.module.types.get(base_ty) {
			TypeDef::Choice(choice) => choice
				.cases
				.get(case as usize)
				.and_then(|c| c.payload)
				.ok_or_else(|| format!("case {case} has no payload")),
			_ => Err("case payload access on a non-choice type".to_string()),
		}
	}
}

fn lower_bin_op(op: BinOp) -> IrBinOp {
	match op {
		BinOp::Add => IrBinOp::Add,
		BinOp::Sub => IrBinOp::Sub,
		BinOp::Mul => IrBinOp::Mul,
		BinOp::Div => IrBinOp::Div,
		BinOp::Rem => IrBinOp::Rem,
	}
}

fn lower_cmp_op(op: CmpOp) -> IrCmpOp {
	match op {
		CmpOp::Eq => IrCmpOp::Eq,
		CmpOp::Ne => IrCmpOp::Ne,
		CmpOp::Lt => IrCmpOp::Lt,
		CmpOp::Le => IrCmpOp::Le,
		CmpOp::Gt => IrCmpOp::Gt,
		CmpOp::Ge => IrCmpOp::Ge,
	}
}

#[cfg(test)]
mod tests {
	use super::lower_program;
	use crate::ir::{IrFunction, IrStmtKind};
	use crate::sem::{
		BinOp, Exp, FieldDef, FnDecl, Program, RecordType, Stm, TypeDef, TypeTable, VarDecl,
	};

	fn var(name: &str, ty: crate::sem::TypeId) -> VarDecl {
		VarDecl {
			name: name.to_string(),
			ty,
		}
	}

	fn decl(name: &str, params: Vec<VarDecl>, ret: crate::sem::TypeId, body: Vec<Stm>) -> FnDecl {
		FnDecl {
			name: name.to_string(),
			key: None,
			params,
			ret,
			locals: Vec::new(),
			body: Some(body),
			is_test: false,
		}
	}

	fn program(types: TypeTable, fns: Vec<FnDecl>) -> Program {
		Program {
			types,
			globals: Vec::new(),
			fns,
		}
	}

	fn count_kind(fun: &IrFunction, pred: impl Fn(&IrStmtKind) -> bool) -> usize {
		fun.placed_stmts()
			.iter()
			.filter(|id| pred(&fun.stmt(**id).kind))
			.count()
	}

	#[test]
	fn spills_simple_params_into_block_zero_slots() {
		let types = TypeTable::new();
		let int = types.builtins.int;
		let add = decl(
			"add",
			vec![var("a", int), var("b", int)],
			int,
			vec![Stm::Return(Some(Exp::Bin {
				op: BinOp::Add,
				lhs: Box::new(Exp::Param(0)),
				rhs: Box::new(Exp::Param(1)),
			}))],
		);
		let module = lower_program(&program(types, vec![add])).expect("lowering");
		let fun = &module.functions[0];

		assert_eq!(fun.params.len(), 2);
		assert_eq!(fun.ret_param, Some(int));
		let entry = &fun.blocks[0];
		let spill_slots = entry
			.stmts
			.iter()
			.filter(|id| {
				matches!(
					fun.stmt(**id).kind,
					IrStmtKind::Alloc { param: Some(_), .. }
				)
			})
			.count();
		assert_eq!(spill_slots, 2);
		let last = *entry.stmts.last().expect("entry terminator");
		assert!(matches!(fun.stmt(last).kind, IrStmtKind::Jump { to } if to == fun.blocks[1].id));

		// Parameter reads go through the slots, not the raw arguments.
		assert_eq!(count_kind(fun, |k| matches!(k, IrStmtKind::Load { .. })), 2);
		assert_eq!(count_kind(fun, |k| matches!(k, IrStmtKind::Bin { .. })), 1);
		// The result is stored through the trailing return-slot argument.
		assert_eq!(
			count_kind(fun, |k| matches!(k, IrStmtKind::Arg { index: 2 })),
			1
		);
	}

	#[test]
	fn returns_a_literal_with_no_extra_allocations() {
		let types = TypeTable::new();
		let int = types.builtins.int;
		let f = decl("f", Vec::new(), int, vec![Stm::Return(Some(Exp::Int(42)))]);
		let module = lower_program(&program(types, vec![f])).expect("lowering");
		let fun = &module.functions[0];

		// A simple return goes straight through the return-slot
		// argument: no local allocation is ever built for it.
		assert_eq!(count_kind(fun, |k| matches!(k, IrStmtKind::Alloc { .. })), 0);
		assert_eq!(
			count_kind(fun, |k| matches!(k, IrStmtKind::IntConst { .. })),
			1
		);
		assert_eq!(count_kind(fun, |k| matches!(k, IrStmtKind::Store { .. })), 1);
		let body_last = *fun.blocks[1].stmts.last().expect("body terminator");
		assert!(matches!(
			fun.stmt(body_last).kind,
			IrStmtKind::Return { far: false }
		));
	}

	#[test]
	fn empty_element_constructors_take_no_operands() {
		let mut types = TypeTable::new();
		let unit = types.builtins.unit;
		let int = types.builtins.int;
		let arr = types.add(TypeDef::Array { elem: unit });
		let of_arr = types.add(TypeDef::Array { elem: arr });
		let f = decl(
			"f",
			Vec::new(),
			int,
			vec![
				Stm::Expr(Exp::MakeArray {
					ty: of_arr,
					elems: vec![
						Exp::MakeArray {
							ty: arr,
							elems: vec![],
						},
						Exp::MakeArray {
							ty: arr,
							elems: vec![],
						},
					],
				}),
				Stm::Return(Some(Exp::Int(0))),
			],
		);
		let module = lower_program(&program(types, vec![f])).expect("lowering");
		let fun = &module.functions[0];
		// The inner constructors carry no operands; the outer one holds
		// the two inner addresses.
		let zero_arg = fun
			.placed_stmts()
			.iter()
			.filter(|id| {
				matches!(&fun.stmt(**id).kind, IrStmtKind::MakeArray { elems, .. } if elems.is_empty())
			})
			.count();
		assert_eq!(zero_arg, 2);
		crate::ir::verify_module(&module).expect("module verifies");
	}

	#[test]
	fn drops_empty_typed_params_from_the_signature() {
		let types = TypeTable::new();
		let unit = types.builtins.unit;
		let int = types.builtins.int;
		let f = decl(
			"f",
			vec![var("u", unit), var("x", int)],
			unit,
			vec![Stm::Return(None)],
		);
		let module = lower_program(&program(types, vec![f])).expect("lowering");
		let fun = &module.functions[0];
		assert_eq!(fun.params.len(), 1);
		assert_eq!(fun.params[0].name, "x");
		assert_eq!(fun.ret_param, None);
	}

	#[test]
	fn copies_composite_arguments_at_the_call_site() {
		let mut types = TypeTable::new();
		let int = types.builtins.int;
		let unit = types.builtins.unit;
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
		let callee = decl("sink", vec![var("p", pair)], unit, vec![Stm::Return(None)]);
		let mut caller = decl(
			"caller",
			Vec::new(),
			unit,
			vec![
				Stm::Expr(Exp::Call {
					target: 0,
					args: vec![Exp::Local(0)],
				}),
				Stm::Return(None),
			],
		);
		caller.locals.push(var("p", pair));
		let module = lower_program(&program(types, vec![callee, caller])).expect("lowering");
		let fun = &module.functions[1];

		assert_eq!(count_kind(fun, |k| matches!(k, IrStmtKind::Copy { .. })), 1);
		let call = fun
			.placed_stmts()
			.into_iter()
			.find(|id| matches!(fun.stmt(*id).kind, IrStmtKind::Call { .. }))
			.expect("call placed");
		let IrStmtKind::Call { args, .. } = &fun.stmt(call).kind else {
			unreachable!();
		};
		// One argument, no return slot for a unit-returning callee.
		assert_eq!(args.len(), 1);
		let copy_tmp = args[0];
		assert!(matches!(
			fun.stmt(copy_tmp).kind,
			IrStmtKind::Alloc { param: None, .. }
		));
	}

	#[test]
	fn instantiations_with_one_key_share_one_function() {
		let types = TypeTable::new();
		let unit = types.builtins.unit;
		let mut a = decl("box[int]", Vec::new(), unit, vec![Stm::Return(None)]);
		a.key = Some("box[int]".to_string());
		let mut b = decl("box[int]", Vec::new(), unit, vec![Stm::Return(None)]);
		b.key = Some("box[int]".to_string());
		let module = lower_program(&program(types, vec![a, b])).expect("lowering");
		assert_eq!(module.functions.len(), 1);
	}

	#[test]
	fn closures_capture_the_home_return_slot() {
		let mut types = TypeTable::new();
		let int = types.builtins.int;
		let closure_ty = types.add(TypeDef::Closure(crate::sem::ClosureSig {
			params: Vec::new(),
			ret: types.builtins.unit,
		}));
		let outer = decl(
			"outer",
			Vec::new(),
			int,
			vec![
				Stm::Expr(Exp::Closure {
					ty: closure_ty,
					params: Vec::new(),
					locals: Vec::new(),
					captures: Vec::new(),
					body: vec![Stm::FarReturn(Some(Exp::Int(7)))],
				}),
				Stm::Return(Some(Exp::Int(0))),
			],
		);
		let module = lower_program(&program(types, vec![outer])).expect("lowering");
		assert_eq!(module.functions.len(), 2);

		let closure_fun = &module.functions[1];
		let info = closure_fun.closure.as_ref().expect("closure info");
		assert_eq!(info.parent, module.functions[0].id);
		assert_eq!(info.ret_slot_field, Some(0));
		assert_eq!(info.home_ret, Some(int));
		assert_eq!(
			count_kind(closure_fun, |k| matches!(
				k,
				IrStmtKind::Return { far: true }
			)),
			1
		);
		// The closure stores the far-returned value through the
		// captured slot address before returning.
		assert_eq!(
			count_kind(closure_fun, |k| matches!(k, IrStmtKind::Store { .. })),
			1
		);
	}

	#[test]
	fn dead_code_after_return_lands_in_an_unreachable_block() {
		let types = TypeTable::new();
		let unit = types.builtins.unit;
		let f = decl(
			"f",
			Vec::new(),
			unit,
			vec![Stm::Return(None), Stm::Expr(Exp::Int(1))],
		);
		let module = lower_program(&program(types, vec![f])).expect("lowering");
		let fun = &module.functions[0];

		let dead = fun
			.placed_stmts()
			.into_iter()
			.find(|id| matches!(fun.stmt(*id).kind, IrStmtKind::IntConst(1)))
			.expect("dead constant placed");
		let holder = fun
			.blocks
			.iter()
			.find(|b| b.stmts.contains(&dead))
			.expect("holding block");
		assert!(holder.preds.is_empty());
	}
}
