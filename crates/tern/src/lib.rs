//! Middle tier of the tern compiler: lowers a type-checked tree into a
//! basic-block IR with explicit memory effects, then runs a fixpoint
//! optimization pipeline over it. The frontend hands in a
//! [`sem::Program`]; the backend receives an [`ir::IrModule`].

use std::fmt;

pub mod ir;
pub mod opt;
pub mod sem;

#[derive(Clone, Debug)]
pub struct CompileError {
	pub function: Option<String>,
	pub message: String,
}

impl fmt::Display for CompileError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.function {
			Some(function) => write!(f, "{}: {}", function, self.message),
			None => write!(f, "{}", self.message),
		}
	}
}

/// Lower, verify, optimize, verify again. The second verification is
/// the pipeline's safety net: a pass that corrupts the module fails
/// here instead of in the backend.
pub fn compile(
	program: &sem::Program,
	options: &opt::OptOptions,
) -> Result<ir::IrModule, Vec<CompileError>> {
	let mut module = ir::lower_program(program).map_err(|errors| {
		errors
			.into_iter()
			.map(|e| CompileError {
				function: Some(e.function),
				message: e.message,
			})
			.collect::<Vec<_>>()
	})?;
	verify(&module)?;
	opt::optimize_module(&mut module, options);
	verify(&module)?;
	Ok(module)
}

fn verify(module: &ir::IrModule) -> Result<(), Vec<CompileError>> {
	ir::verify_module(module).map_err(|errors| {
		errors
			.into_iter()
			.map(|e| CompileError {
				function: Some(e.function),
				message: e.message,
			})
			.collect()
	})
}

#[cfg(test)]
mod prop_tests;
