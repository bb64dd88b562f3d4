//! Property tests over the lowering and the pipeline. These stress
//! invariants that must hold for ANY input, not just the hand-picked
//! fixtures in the pass modules:
//!
//! 1. Shape classification is a partition: every type is exactly one
//!    of empty, simple, composite.
//! 2. Substitution chains resolve to their final value, and an applied
//!    map is exhausted (second apply is a no-op).
//! 3. Cleanup reaches a fixpoint: a second call reports no change.
//! 4. Any straight-line arithmetic function survives the whole
//!    pipeline and still verifies.

use proptest::prelude::*;

use crate::ir::{lower_program, verify_module, IrStmtId, SubstMap};
use crate::opt::{cleanup, optimize_module, OptOptions};
use crate::sem::{
	BinOp, CaseDef, ChoiceType, Exp, FieldDef, FnDecl, Program, RecordType, Stm, TypeDef,
	TypeTable, VarDecl,
};

fn arb_type_def() -> impl Strategy<Value = TypeDef> {
	prop_oneof![
		Just(TypeDef::Unit),
		Just(TypeDef::Int),
		Just(TypeDef::Float),
		Just(TypeDef::Str),
		(0u32..4).prop_map(|n| TypeDef::Record(RecordType {
			name: "r".to_string(),
			fields: (0..n)
				.map(|i| FieldDef {
					name: format!("f{i}"),
					ty: crate::sem::TypeId(1),
				})
				.collect(),
		})),
		(1u32..4).prop_map(|n| TypeDef::Choice(ChoiceType {
			name: "c".to_string(),
			cases: (0..n)
				.map(|i| CaseDef {
					name: format!("k{i}"),
					payload: None,
				})
				.collect(),
		})),
	]
}

fn arb_bin_op() -> impl Strategy<Value = BinOp> {
	prop_oneof![
		Just(BinOp::Add),
		Just(BinOp::Sub),
		Just(BinOp::Mul),
	]
}

/// Integer expression trees over two parameters and small constants.
fn arb_int_exp() -> impl Strategy<Value = Exp> {
	let leaf = prop_oneof![
		(-100i64..100).prop_map(Exp::Int),
		Just(Exp::Param(0)),
		Just(Exp::Param(1)),
	];
	leaf.prop_recursive(4, 24, 2, |inner| {
		(arb_bin_op(), inner.clone(), inner).prop_map(|(op, lhs, rhs)| Exp::Bin {
			op,
			lhs: Box::new(lhs),
			rhs: Box::new(rhs),
		})
	})
}

fn int_function(body: Vec<Stm>, types: TypeTable) -> Program {
	let int = types.builtins.int;
	Program {
		types,
		globals: Vec::new(),
		fns: vec![FnDecl {
			name: "f".to_string(),
			key: None,
			params: vec![
				VarDecl {
					name: "a".to_string(),
					ty: int,
				},
				VarDecl {
					name: "b".to_string(),
					ty: int,
				},
			],
			ret: int,
			locals: Vec::new(),
			body: Some(body),
			is_test: false,
		}],
	}
}

proptest! {
	#[test]
	fn shapes_partition_every_type(defs in prop::collection::vec(arb_type_def(), 0..12)) {
		let mut types = TypeTable::new();
		let mut ids = vec![
			types.builtins.unit,
			types.builtins.int,
			types.builtins.float,
			types.builtins.str_,
		];
		for def in defs {
			ids.push(types.add(def));
		}
		for id in ids {
			let classes = [
				types.is_empty(id),
				types.is_simple(id),
				types.is_composite(id),
			];
			prop_assert_eq!(classes.iter().filter(|c| **c).count(), 1);
		}
	}

	#[test]
	fn substitution_chains_resolve_to_the_end(len in 2u32..16) {
		let mut subst = SubstMap::new();
		for i in 0..len - 1 {
			subst.insert(IrStmtId(i), IrStmtId(i + 1));
		}
		for i in 0..len {
			prop_assert_eq!(subst.resolve(IrStmtId(i)), IrStmtId(len - 1));
		}
	}

	#[test]
	fn cleanup_reaches_a_fixpoint(exp in arb_int_exp()) {
		let program = int_function(vec![Stm::Return(Some(exp))], TypeTable::new());
		let mut module = lower_program(&program).expect("lowering");
		let fun = &mut module.functions[0];
		cleanup(fun);
		prop_assert!(!cleanup(fun));
	}

	#[test]
	fn pipeline_output_always_verifies(exps in prop::collection::vec(arb_int_exp(), 1..4)) {
		let mut body: Vec<Stm> = exps.iter().cloned().map(Stm::Expr).collect();
		body.push(Stm::Return(Some(
			exps.into_iter().next().expect("at least one expression"),
		)));
		let program = int_function(body, TypeTable::new());
		let mut module = lower_program(&program).expect("lowering");
		verify_module(&module).expect("lowered module verifies");
		optimize_module(&mut module, &OptOptions::default());
		verify_module(&module).expect("optimized module verifies");
	}
}
