use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TypeId(pub u32);

/// Well-known type ids seeded by `TypeTable::new`.
#[derive(Clone, Copy, Debug)]
pub struct Builtins {
	pub unit: TypeId,
	pub int: TypeId,
	pub float: TypeId,
	pub str_: TypeId,
}

#[derive(Clone, Debug)]
pub struct TypeTable {
	pub defs: Vec<TypeDef>,
	pub builtins: Builtins,
	ref_cache: HashMap<TypeId, TypeId>,
}

#[derive(Clone, Debug)]
pub enum TypeDef {
	Unit,
	Int,
	Float,
	Str,
	Ref { to: TypeId },
	Array { elem: TypeId },
	Slice { elem: TypeId },
	Record(RecordType),
	Choice(ChoiceType),
	Closure(ClosureSig),
}

#[derive(Clone, Debug)]
pub struct RecordType {
	pub name: String,
	pub fields: Vec<FieldDef>,
}

#[derive(Clone, Debug)]
pub struct ChoiceType {
	pub name: String,
	pub cases: Vec<CaseDef>,
}

#[derive(Clone, Debug)]
pub struct FieldDef {
	pub name: String,
	pub ty: TypeId,
}

#[derive(Clone, Debug)]
pub struct CaseDef {
	pub name: String,
	pub payload: Option<TypeId>,
}

#[derive(Clone, Debug)]
pub struct ClosureSig {
	pub params: Vec<TypeId>,
	pub ret: TypeId,
}

/// Storage classification of a type. Fixed by the type's structural
/// definition, never by context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Shape {
	/// Zero-size. Never allocated, passed, or copied.
	Empty,
	/// Register-representable. Passed and stored by value.
	Simple,
	/// Always manipulated through an address, copied explicitly.
	Composite,
}

impl TypeTable {
	pub fn new() -> Self {
		let mut table = Self {
			defs: Vec::new(),
			builtins: Builtins {
				unit: TypeId(0),
				int: TypeId(0),
				float: TypeId(0),
				str_: TypeId(0),
			},
			ref_cache: HashMap::new(),
		};
		table.builtins = Builtins {
			unit: table.add(TypeDef::Unit),
			int: table.add(TypeDef::Int),
			float: table.add(TypeDef::Float),
			str_: table.add(TypeDef::Str),
		};
		table
	}

	pub fn add(&mut self, def: TypeDef) -> TypeId {
		let id = TypeId(self.defs.len() as u32);
		self.defs.push(def);
		id
	}

	pub fn get(&self, id: TypeId) -> &TypeDef {
		&self.defs[id.0 as usize]
	}

	/// Reference type pointing at `to`, deduplicated.
	pub fn ref_to(&mut self, to: TypeId) -> TypeId {
		if let Some(existing) = self.ref_cache.get(&to) {
			return *existing;
		}
		let id = self.add(TypeDef::Ref { to });
		self.ref_cache.insert(to, id);
		id
	}

	pub fn shape(&self, id: TypeId) -> Shape {
		match self.get(id) {
			TypeDef::Unit => Shape::Empty,
			TypeDef::Int | TypeDef::Float | TypeDef::Ref { .. } => Shape::Simple,
			TypeDef::Str
			| TypeDef::Array { .. }
			| TypeDef::Slice { .. }
			| TypeDef::Closure(_) => Shape::Composite,
			TypeDef::Record(record) => {
				if record.fields.iter().all(|f| self.is_empty(f.ty)) {
					Shape::Empty
				} else {
					Shape::Composite
				}
			}
			TypeDef::Choice(choice) => {
				if choice.cases.iter().all(|c| c.payload.is_none()) {
					return Shape::Simple;
				}
				if self.is_nilable_ref(choice) {
					return Shape::Simple;
				}
				Shape::Composite
			}
		}
	}

	pub fn is_empty(&self, id: TypeId) -> bool {
		self.shape(id) == Shape::Empty
	}

	pub fn is_simple(&self, id: TypeId) -> bool {
		self.shape(id) == Shape::Simple
	}

	pub fn is_composite(&self, id: TypeId) -> bool {
		self.shape(id) == Shape::Composite
	}

	pub fn is_ref(&self, id: TypeId) -> bool {
		matches!(self.get(id), TypeDef::Ref { .. })
	}

	// Exactly one null case and one reference-typed case.
	fn is_nilable_ref(&self, choice: &ChoiceType) -> bool {
		if choice.cases.len() != 2 {
			return false;
		}
		let nulls = choice.cases.iter().filter(|c| c.payload.is_none()).count();
		let refs = choice
			.cases
			.iter()
			.filter(|c| c.payload.is_some_and(|p| self.is_ref(p)))
			.count();
		nulls == 1 && refs == 1
	}
}

impl Default for TypeTable {
	fn default() -> Self {
		Self::new()
	}
}
