use std::collections::HashMap;

use crate::ir::{IrFunction, IrStmtId};

/// Value replacement map shared by every optimization pass. Chained
/// replacements resolve to their final value in one step after the
/// first lookup (path compression, memoized in place). Applying an
/// exhausted map a second time is a no-op.
#[derive(Clone, Debug, Default)]
pub struct SubstMap {
	map: HashMap<IrStmtId, IrStmtId>,
}

impl SubstMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	pub fn insert(&mut self, old: IrStmtId, new: IrStmtId) {
		debug_assert_ne!(old, new, "value substituted into itself");
		self.map.insert(old, new);
	}

	/// Final replacement for `id`, compressing the lookup chain.
	pub fn resolve(&mut self, id: IrStmtId) -> IrStmtId {
		let Some(next) = self.map.get(&id).copied() else {
			return id;
		};
		let root = self.resolve(next);
		debug_assert_ne!(root, id, "substitution chain loops back");
		self.map.insert(id, root);
		root
	}

	/// Rewrite every live statement's operands and keep the used-by
	/// sets consistent. Returns true when anything changed.
	pub fn apply(&mut self, f: &mut IrFunction) -> bool {
		if self.is_empty() {
			return false;
		}
		let mut changed = false;
		for index in 0..f.stmts.len() {
			let id = IrStmtId(index as u32);
			if !f.is_alive(id) {
				continue;
			}
			let before = f.stmt(id).kind.operands();
			let after: Vec<IrStmtId> =
				before.iter().map(|op| self.resolve(*op)).collect();
			if before == after {
				continue;
			}
			let mut position = 0;
			f.stmt_mut(id).kind.for_each_operand_mut(|op| {
				*op = after[position];
				position += 1;
			});
			for old in &before {
				if !after.contains(old)
					&& let Some(def) = f.value_mut(*old)
				{
					def.users.remove(&id);
				}
			}
			for new in &after {
				if !before.contains(new)
					&& let Some(def) = f.value_mut(*new)
				{
					def.users.insert(id);
				}
			}
			changed = true;
		}
		changed
	}
}
