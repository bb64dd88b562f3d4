use std::io::{self, Write};

use clap::{Arg, ArgAction, Command};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use tern::opt::OptOptions;
use tern::sem::{
	BinOp, CascadeMsg, CaseDef, ChoiceType, CmpOp, Exp, FieldDef, FnDecl, Program, RecordType,
	Stm, TypeDef, TypeTable, VarDecl,
};
use tern::{compile, CompileError};

fn main() {
	let matches = Command::new("ternc")
		.about("Dumps tern IR for the bundled demo programs")
		.arg(Arg::new("demo")
			.help("Demo program to compile")
			.value_parser(["countdown", "adder", "pair", "cascade"])
			.required_unless_present("list")
			.value_name("DEMO"))
		.arg(Arg::new("list")
			.short('l')
			.long("list")
			.help("List the bundled demo programs")
			.action(ArgAction::SetTrue))
		.arg(Arg::new("no_opt")
			.long("no-opt")
			.help("Dump the lowered module without running the pipeline")
			.action(ArgAction::SetTrue))
		.arg(Arg::new("no_lift")
			.long("no-lift")
			.help("Disable alloc-to-register lifting")
			.action(ArgAction::SetTrue))
		.arg(Arg::new("no_tail_calls")
			.long("no-tail-calls")
			.help("Disable tail-call rewriting")
			.action(ArgAction::SetTrue))
		.arg(Arg::new("no_inline")
			.long("no-inline")
			.help("Disable inlining")
			.action(ArgAction::SetTrue))
		.arg(Arg::new("no_stack_promotion")
			.long("no-stack-promotion")
			.help("Disable escape-based stack promotion")
			.action(ArgAction::SetTrue))
		.arg(Arg::new("max_rounds")
			.long("max-rounds")
			.value_name("N")
			.value_parser(clap::value_parser!(u32).range(1..))
			.help("Upper bound on module-level optimization rounds"))
		.get_matches();

	if matches.get_flag("list") {
		println!("countdown  tail-recursive loop over an int parameter");
		println!("adder      closure capture, virtual dispatch, inlining");
		println!("pair       record construction, field access, stack promotion");
		println!("cascade    repeated messages to one receiver");
		return;
	}

	let demo = matches
		.get_one::<String>("demo")
		.expect("clap enforces required argument");
	let program = match demo.as_str() {
		"countdown" => countdown(),
		"adder" => adder(),
		"pair" => pair(),
		_ => cascade(),
	};

	let mut options = OptOptions {
		lift: !matches.get_flag("no_lift"),
		tail_calls: !matches.get_flag("no_tail_calls"),
		inline: !matches.get_flag("no_inline"),
		stack_promotion: !matches.get_flag("no_stack_promotion"),
		..OptOptions::default()
	};
	if let Some(max_rounds) = matches.get_one::<u32>("max_rounds") {
		options.max_rounds = *max_rounds;
	}
	if matches.get_flag("no_opt") {
		options.max_rounds = 0;
	}

	match compile(&program, &options) {
		Ok(module) => print!("{}", tern::ir::dump_module(&module)),
		Err(errors) => {
			let _ = report_errors(&errors);
			std::process::exit(1);
		}
	}
}

fn report_errors(errors: &[CompileError]) -> io::Result<()> {
	let mut stderr = StandardStream::stderr(ColorChoice::Auto);
	let mut spec = ColorSpec::new();
	spec.set_fg(Some(Color::Red)).set_bold(true);
	for error in errors {
		stderr.set_color(&spec)?;
		write!(&mut stderr, "error")?;
		stderr.reset()?;
		writeln!(&mut stderr, ": {error}")?;
	}
	Ok(())
}

/// `count(n)` calls itself with `n - 1` until `n <= 0`. The pipeline
/// turns the self-call into a back edge.
fn countdown() -> Program {
	let mut types = TypeTable::new();
	let int = types.builtins.int;
	let unit = types.builtins.unit;
	let bool_ty = bool_choice(&mut types);
	Program {
		types,
		globals: Vec::new(),
		fns: vec![FnDecl {
			name: "count".to_string(),
			key: None,
			params: vec![var("n", int)],
			ret: unit,
			locals: Vec::new(),
			body: Some(vec![
				Stm::If {
					cond: Exp::Cmp {
						op: CmpOp::Le,
						bool_ty,
						lhs: Box::new(Exp::Param(0)),
						rhs: Box::new(Exp::Int(0)),
					},
					then_body: vec![Stm::Return(None)],
					else_body: Vec::new(),
				},
				Stm::Expr(Exp::Call {
					target: 0,
					args: vec![Exp::Bin {
						op: BinOp::Sub,
						lhs: Box::new(Exp::Param(0)),
						rhs: Box::new(Exp::Int(1)),
					}],
				}),
				Stm::Return(None),
			]),
			is_test: false,
		}],
	}
}

/// `adder(base)` returns a closure adding a captured local to its
/// argument; `use_adder` builds one and applies it. Both inliners get
/// exercised here.
fn adder() -> Program {
	let mut types = TypeTable::new();
	let int = types.builtins.int;
	let step_fn = types.add(TypeDef::Closure(tern::sem::ClosureSig {
		params: vec![int],
		ret: int,
	}));
	Program {
		types,
		globals: Vec::new(),
		fns: vec![
			FnDecl {
				name: "adder".to_string(),
				key: None,
				params: vec![var("base", int)],
				ret: step_fn,
				locals: vec![var("step", int)],
				body: Some(vec![
					Stm::Assign {
						local: 0,
						value: Exp::Bin {
							op: BinOp::Add,
							lhs: Box::new(Exp::Param(0)),
							rhs: Box::new(Exp::Int(1)),
						},
					},
					Stm::Return(Some(Exp::Closure {
						ty: step_fn,
						params: vec![var("x", int)],
						locals: Vec::new(),
						captures: vec![0],
						body: vec![Stm::Return(Some(Exp::Bin {
							op: BinOp::Add,
							lhs: Box::new(Exp::Param(0)),
							rhs: Box::new(Exp::Capture(0)),
						}))],
					})),
				]),
				is_test: false,
			},
			FnDecl {
				name: "use_adder".to_string(),
				key: None,
				params: Vec::new(),
				ret: int,
				locals: Vec::new(),
				body: Some(vec![Stm::Return(Some(Exp::CallClosure {
					closure: Box::new(Exp::Call {
						target: 0,
						args: vec![Exp::Int(10)],
					}),
					args: vec![Exp::Int(2)],
				}))]),
				is_test: false,
			},
		],
	}
}

/// Builds a two-field record in a local, reads a field back. The
/// allocation never escapes, so promotion moves it onto the stack.
fn pair() -> Program {
	let mut types = TypeTable::new();
	let int = types.builtins.int;
	let pair_ty = types.add(TypeDef::Record(RecordType {
		name: "pair".to_string(),
		fields: vec![field("a", int), field("b", int)],
	}));
	Program {
		types,
		globals: Vec::new(),
		fns: vec![FnDecl {
			name: "local_pair".to_string(),
			key: None,
			params: Vec::new(),
			ret: int,
			locals: vec![var("p", pair_ty)],
			body: Some(vec![
				Stm::Assign {
					local: 0,
					value: Exp::MakeRecord {
						ty: pair_ty,
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
	}
}

/// A counter record receiving two `bump` messages through a cascade.
/// The receiver is evaluated once and re-used for every message.
fn cascade() -> Program {
	let mut types = TypeTable::new();
	let int = types.builtins.int;
	let unit = types.builtins.unit;
	let counter = types.add(TypeDef::Record(RecordType {
		name: "counter".to_string(),
		fields: vec![field("value", int)],
	}));
	Program {
		types,
		globals: Vec::new(),
		fns: vec![
			FnDecl {
				name: "bump".to_string(),
				key: None,
				params: vec![var("self", counter), var("by", int)],
				ret: unit,
				locals: Vec::new(),
				body: Some(vec![
					Stm::SetField {
						base: Exp::Param(0),
						field: 0,
						value: Exp::Bin {
							op: BinOp::Add,
							lhs: Box::new(Exp::Field {
								base: Box::new(Exp::Param(0)),
								field: 0,
							}),
							rhs: Box::new(Exp::Param(1)),
						},
					},
					Stm::Return(None),
				]),
				is_test: false,
			},
			FnDecl {
				name: "bump_twice".to_string(),
				key: None,
				params: Vec::new(),
				ret: int,
				locals: vec![var("c", counter)],
				body: Some(vec![
					Stm::Assign {
						local: 0,
						value: Exp::MakeRecord {
							ty: counter,
							fields: vec![Exp::Int(0)],
						},
					},
					Stm::Expr(Exp::Cascade {
						receiver: Box::new(Exp::Local(0)),
						messages: vec![
							CascadeMsg {
								target: 0,
								args: vec![Exp::Int(1)],
							},
							CascadeMsg {
								target: 0,
								args: vec![Exp::Int(2)],
							},
						],
					}),
					Stm::Return(Some(Exp::Field {
						base: Box::new(Exp::Local(0)),
						field: 0,
					})),
				]),
				is_test: false,
			},
		],
	}
}

fn bool_choice(types: &mut TypeTable) -> tern::sem::TypeId {
	types.add(TypeDef::Choice(ChoiceType {
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
	}))
}

fn var(name: &str, ty: tern::sem::TypeId) -> VarDecl {
	VarDecl {
		name: name.to_string(),
		ty,
	}
}

fn field(name: &str, ty: tern::sem::TypeId) -> FieldDef {
	FieldDef {
		name: name.to_string(),
		ty,
	}
}
