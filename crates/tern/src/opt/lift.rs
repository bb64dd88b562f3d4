use crate::ir::{IrFunction, IrStmtId, IrStmtKind, SubstMap};
use crate::sem::TypeTable;

/// Replaces single-store register-typed allocations with the stored
/// value itself: every load becomes the value, and the slot disappears.
///
/// Parameter spill slots are only lifted when `lift_params` is set; the
/// tail-call rewrite needs them in place until self-calls are gone.
pub fn lift_allocs(types: &TypeTable, fun: &mut IrFunction, lift_params: bool) -> bool {
	let mut subst = SubstMap::new();
	let mut deleted = false;
	for id in fun.placed_stmts() {
		if !fun.is_alive(id) {
			continue;
		}
		let IrStmtKind::Alloc { param, .. } = fun.stmt(id).kind else {
			continue;
		};
		if param.is_some() && !lift_params {
			continue;
		}
		let Some(def) = fun.value(id) else {
			continue;
		};
		if !types.is_simple(def.ty) {
			continue;
		}

		let users: Vec<IrStmtId> = def.users.iter().copied().collect();
		let mut stores = Vec::new();
		let mut loads = Vec::new();
		for user in &users {
			match fun.stmt(*user).kind {
				IrStmtKind::Store { addr, value } if addr == id => {
					stores.push((*user, value));
				}
				IrStmtKind::Load { addr } if addr == id => loads.push(*user),
				_ => {}
			}
		}
		if stores.len() != 1 || stores.len() + loads.len() != users.len() {
			continue;
		}
		let (store, value) = stores[0];
		// A slot that stores its own loaded value never settles.
		if loads.contains(&value) {
			continue;
		}

		for load in &loads {
			subst.insert(*load, value);
			fun.mark_deleted(*load);
		}
		fun.mark_deleted(store);
		fun.mark_deleted(id);
		deleted = true;
	}
	subst.apply(fun) | deleted
}
