use std::collections::{BTreeSet, HashMap};

use crate::ir::{IrBlockId, IrFunId, IrGlobalId, IrStmt, IrStmtId, IrStmtKind, IrStrId, IrValueDef};
use crate::sem::{TypeDef, TypeId, TypeTable};

/// Owns every string constant, global, and function of one compilation
/// unit. All small-integer ids are assigned from the module's own
/// counters; there is no hidden global state.
#[derive(Clone, Debug, Default)]
pub struct IrModule {
	pub types: TypeTable,
	pub strings: Vec<String>,
	pub globals: Vec<IrGlobal>,
	pub functions: Vec<IrFunction>,
}

#[derive(Clone, Debug)]
pub struct IrGlobal {
	pub id: IrGlobalId,
	pub name: String,
	pub ty: TypeId,
}

#[derive(Clone, Debug)]
pub struct IrParam {
	pub name: String,
	pub ty: TypeId,
	/// Composite-typed and closure-self parameters are passed by
	/// address; simple ones by register.
	pub by_addr: bool,
}

/// Back-link from a closure's function to the literal it implements.
#[derive(Clone, Debug)]
pub struct IrClosureInfo {
	pub parent: IrFunId,
	pub env_ty: TypeId,
	/// Field index in `env_ty` of the captured return-slot address of
	/// the lexical home function, when that function returns a value.
	pub ret_slot_field: Option<u32>,
	/// Return type of the lexical home function.
	pub home_ret: Option<TypeId>,
}

#[derive(Clone, Debug, Default)]
pub struct IrFunction {
	pub id: IrFunId,
	pub name: String,
	pub params: Vec<IrParam>,
	/// Pointee type of the caller-owned return slot; present only when
	/// the return type is non-empty. The slot's address is argument
	/// `params.len()`.
	pub ret_param: Option<TypeId>,
	/// Empty for external declarations, which are excluded from
	/// emission.
	pub blocks: Vec<IrBlock>,
	/// Statement arena; `IrStmtId` indexes here. Slots of deleted
	/// statements stay in place until they drop out of every block list.
	pub stmts: Vec<IrStmt>,
	pub closure: Option<IrClosureInfo>,
	pub can_inline: bool,
	pub is_test: bool,
	pub next_num: u32,
	pub next_block: u32,
}

#[derive(Clone, Debug, Default)]
pub struct IrBlock {
	pub id: IrBlockId,
	/// Ordered statement list; the last element is the terminator.
	pub stmts: Vec<IrStmtId>,
	/// Inverse of the successor relation, recomputed by cleanup.
	pub preds: Vec<IrBlockId>,
}

impl IrModule {
	pub fn new(types: TypeTable) -> Self {
		Self {
			types,
			strings: Vec::new(),
			globals: Vec::new(),
			functions: Vec::new(),
		}
	}

	pub fn intern_string(&mut self, value: &str) -> IrStrId {
		if let Some(position) = self.strings.iter().position(|s| s == value) {
			return IrStrId(position as u32);
		}
		let id = IrStrId(self.strings.len() as u32);
		self.strings.push(value.to_string());
		id
	}

	pub fn add_global(&mut self, name: String, ty: TypeId) -> IrGlobalId {
		let id = IrGlobalId(self.globals.len() as u32);
		self.globals.push(IrGlobal { id, name, ty });
		id
	}

	pub fn add_function(&mut self, mut function: IrFunction) -> IrFunId {
		let id = IrFunId(self.functions.len() as u32);
		function.id = id;
		self.functions.push(function);
		id
	}

	pub fn function(&self, id: IrFunId) -> &IrFunction {
		&self.functions[id.0 as usize]
	}

	pub fn function_mut(&mut self, id: IrFunId) -> &mut IrFunction {
		&mut self.functions[id.0 as usize]
	}

	/// Functions the backend should emit: external declarations never
	/// had a body built and are skipped.
	pub fn emitted_functions(&self) -> impl Iterator<Item = &IrFunction> {
		self.functions.iter().filter(|f| f.has_body())
	}
}

impl IrFunction {
	pub fn new(name: String) -> Self {
		Self {
			name,
			..Self::default()
		}
	}

	pub fn has_body(&self) -> bool {
		!self.blocks.is_empty()
	}

	pub fn add_block(&mut self) -> IrBlockId {
		let id = IrBlockId(self.next_block);
		self.next_block += 1;
		self.blocks.push(IrBlock {
			id,
			stmts: Vec::new(),
			preds: Vec::new(),
		});
		id
	}

	pub fn block_position(&self, id: IrBlockId) -> Option<usize> {
		self.blocks.iter().position(|b| b.id == id)
	}

	pub fn block(&self, id: IrBlockId) -> &IrBlock {
		let position = self.block_position(id).expect("block exists");
		&self.blocks[position]
	}

	pub fn block_mut(&mut self, id: IrBlockId) -> &mut IrBlock {
		let position = self.block_position(id).expect("block exists");
		&mut self.blocks[position]
	}

	pub fn entry(&self) -> IrBlockId {
		self.blocks[0].id
	}

	pub fn stmt(&self, id: IrStmtId) -> &IrStmt {
		&self.stmts[id.0 as usize]
	}

	pub fn stmt_mut(&mut self, id: IrStmtId) -> &mut IrStmt {
		&mut self.stmts[id.0 as usize]
	}

	pub fn value(&self, id: IrStmtId) -> Option<&IrValueDef> {
		self.stmts[id.0 as usize].result.as_ref()
	}

	pub fn value_mut(&mut self, id: IrStmtId) -> Option<&mut IrValueDef> {
		self.stmts[id.0 as usize].result.as_mut()
	}

	pub fn is_alive(&self, id: IrStmtId) -> bool {
		!self.stmt(id).deleted
	}

	/// New void statement in the arena. Does not place it in a block.
	pub fn new_stmt(&mut self, kind: IrStmtKind) -> IrStmtId {
		debug_assert!(!kind.produces_value());
		let id = IrStmtId(self.stmts.len() as u32);
		self.stmts.push(IrStmt {
			kind,
			result: None,
			deleted: false,
		});
		self.register_uses(id);
		id
	}

	/// New value-producing statement in the arena.
	pub fn new_value(&mut self, kind: IrStmtKind, ty: TypeId, is_addr: bool) -> IrStmtId {
		debug_assert!(kind.produces_value());
		let id = IrStmtId(self.stmts.len() as u32);
		let num = self.next_num;
		self.next_num += 1;
		self.stmts.push(IrStmt {
			kind,
			result: Some(IrValueDef {
				num,
				ty,
				is_addr,
				users: BTreeSet::new(),
			}),
			deleted: false,
		});
		self.register_uses(id);
		id
	}

	pub(crate) fn register_uses(&mut self, id: IrStmtId) {
		let operands = self.stmt(id).kind.operands();
		for operand in operands {
			if let Some(def) = self.value_mut(operand) {
				def.users.insert(id);
			}
		}
	}

	/// Flag a statement deleted and drop it from its operands' user
	/// sets. The arena slot stays until cleanup compacts block lists.
	pub fn mark_deleted(&mut self, id: IrStmtId) {
		if self.stmt(id).deleted {
			return;
		}
		self.stmt_mut(id).deleted = true;
		let operands = self.stmt(id).kind.operands();
		for operand in operands {
			if let Some(def) = self.value_mut(operand) {
				def.users.remove(&id);
			}
		}
	}

	/// Block and position a statement is placed at, if any.
	pub fn placement(&self, id: IrStmtId) -> Option<(IrBlockId, usize)> {
		for block in &self.blocks {
			if let Some(position) = block.stmts.iter().position(|s| *s == id) {
				return Some((block.id, position));
			}
		}
		None
	}

	pub fn push_stmt(&mut self, block: IrBlockId, stmt: IrStmtId) {
		self.block_mut(block).stmts.push(stmt);
	}

	pub fn insert_before_terminator(&mut self, block: IrBlockId, stmt: IrStmtId) {
		let terminated = self
			.block(block)
			.stmts
			.last()
			.is_some_and(|last| self.stmt(*last).kind.is_terminator());
		let block = self.block_mut(block);
		let at = if terminated {
			block.stmts.len() - 1
		} else {
			block.stmts.len()
		};
		block.stmts.insert(at, stmt);
	}

	/// The pointee type when `id` can be stored through: either an
	/// address value, or a register value of reference type.
	pub fn pointee(&self, types: &TypeTable, id: IrStmtId) -> Option<TypeId> {
		let def = self.value(id)?;
		if def.is_addr {
			return Some(def.ty);
		}
		match types.get(def.ty) {
			TypeDef::Ref { to } => Some(*to),
			_ => None,
		}
	}

	pub fn recompute_preds(&mut self) {
		let mut preds: HashMap<IrBlockId, Vec<IrBlockId>> = HashMap::new();
		for block in &self.blocks {
			let Some(last) = block.stmts.last() else {
				continue;
			};
			for successor in self.stmt(*last).kind.successors() {
				preds.entry(successor).or_default().push(block.id);
			}
		}
		for block in &mut self.blocks {
			let mut list = preds.remove(&block.id).unwrap_or_default();
			list.sort();
			list.dedup();
			block.preds = list;
		}
	}

	/// Dense renumbering: block ids follow block order, value numbers
	/// follow statement order within block order. Predecessor lists are
	/// re-sorted for determinism.
	pub fn renumber(&mut self) {
		let mut block_map = HashMap::new();
		for (position, block) in self.blocks.iter().enumerate() {
			block_map.insert(block.id, IrBlockId(position as u32));
		}
		for block in &mut self.blocks {
			block.id = block_map[&block.id];
			for pred in &mut block.preds {
				*pred = block_map[pred];
			}
			block.preds.sort();
		}
		let stmt_ids: Vec<IrStmtId> = self
			.blocks
			.iter()
			.flat_map(|b| b.stmts.iter().copied())
			.collect();
		for id in &stmt_ids {
			self.stmt_mut(*id)
				.kind
				.for_each_successor_mut(|target| *target = block_map[target]);
		}
		self.next_block = self.blocks.len() as u32;

		let mut num = 0;
		for id in &stmt_ids {
			if let Some(def) = self.value_mut(*id) {
				def.num = num;
				num += 1;
			}
		}
		self.next_num = num;
	}

	pub fn self_calls(&self, own: IrFunId) -> bool {
		self.live_stmts().any(|stmt| {
			matches!(stmt.kind, IrStmtKind::Call { fun, .. } if fun == own)
		})
	}

	pub fn has_static_calls(&self) -> bool {
		self.live_stmts()
			.any(|stmt| matches!(stmt.kind, IrStmtKind::Call { .. }))
	}

	pub fn has_far_return(&self) -> bool {
		self.live_stmts()
			.any(|stmt| matches!(stmt.kind, IrStmtKind::Return { far: true }))
	}

	pub fn live_stmts(&self) -> impl Iterator<Item = &IrStmt> {
		self.stmts.iter().filter(|s| !s.deleted)
	}

	/// Statement ids reachable through block lists, in block order.
	pub fn placed_stmts(&self) -> Vec<IrStmtId> {
		self.blocks
			.iter()
			.flat_map(|b| b.stmts.iter().copied())
			.collect()
	}
}
