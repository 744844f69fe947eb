//! Conversion of machine output into [`Value`]s.
//!
//! Resolution replaces memo references with copies of the values they refer
//! to, and rebuilds the builtin types that Python's unpickler would have
//! created by calling a class or function from the standard library.

use std::collections::HashSet;

use super::machine::{memo_target, Memo, Node, ObjectNode};
use super::{Error, Object, Recursive, Value, DEPTH_LIMIT};

pub(super) fn resolve(root: &Node, memo: &Memo) -> Result<Value, Error> {
	let mut resolver = Resolver {
		memo,
		active: HashSet::new(),
	};
	resolver.node(root, 0)
}

struct Resolver<'m> {
	memo: &'m Memo,
	/// Memo indexes whose values are currently being resolved. Encountering
	/// one of these again means the value contains itself.
	active: HashSet<u64>,
}

impl Resolver<'_> {
	fn node(&mut self, node: &Node, depth: usize) -> Result<Value, Error> {
		if depth > DEPTH_LIMIT {
			return Err(Error::DepthLimitExceeded);
		}
		let depth = depth + 1;

		Ok(match node {
			Node::None => Value::None,
			Node::Bool(b) => Value::Bool(*b),
			Node::Int(n) => Value::Int(*n),
			Node::BigInt(n) => Value::BigInt(n.clone()),
			Node::Float(f) => Value::Float(*f),
			Node::Str(s) => Value::Str(s.clone()),
			Node::Bytes(b) => Value::Bytes(b.clone()),
			Node::ByteArray(b) => Value::ByteArray(b.clone()),
			Node::List(items) => Value::List(self.nodes(items, depth)?),
			Node::Tuple(items) => Value::Tuple(self.nodes(items, depth)?),
			Node::Set(items) => Value::Set(self.nodes(items, depth)?),
			Node::FrozenSet(items) => Value::FrozenSet(self.nodes(items, depth)?),
			Node::Dict(pairs) => Value::Dict(self.pairs(pairs, depth)?),
			Node::Global(g) => Value::Global(g.clone()),
			Node::Object(obj) => reconstruct(self.object(obj, depth)?),
			Node::Ref(idx) => {
				let target = memo_target(self.memo, *idx)?;
				let entry = self.memo.get(&target).ok_or(Error::MemoNotFound(target))?;
				if !self.active.insert(target) {
					tracing::trace!(idx = target, "found recursive reference");
					return Ok(Value::Recursive(recursive_kind(&entry.node)));
				}
				let value = self.node(&entry.node, depth);
				self.active.remove(&target);
				value?
			}
		})
	}

	fn nodes(&mut self, nodes: &[Node], depth: usize) -> Result<Vec<Value>, Error> {
		nodes.iter().map(|n| self.node(n, depth)).collect()
	}

	fn pairs(&mut self, pairs: &[(Node, Node)], depth: usize) -> Result<Vec<(Value, Value)>, Error> {
		pairs
			.iter()
			.map(|(k, v)| Ok((self.node(k, depth)?, self.node(v, depth)?)))
			.collect()
	}

	fn object(&mut self, obj: &ObjectNode, depth: usize) -> Result<Object, Error> {
		Ok(Object {
			class: self.node(&obj.class, depth)?,
			args: self.nodes(&obj.args, depth)?,
			kwargs: self.pairs(&obj.kwargs, depth)?,
			state: match &obj.state {
				Some(state) => Some(self.node(state, depth)?),
				None => None,
			},
			list_items: self.nodes(&obj.list_items, depth)?,
			dict_items: self.pairs(&obj.dict_items, depth)?,
		})
	}
}

fn recursive_kind(node: &Node) -> Recursive {
	match node {
		Node::List(_) => Recursive::List,
		Node::Dict(_) => Recursive::Dict,
		Node::Set(_) | Node::FrozenSet(_) => Recursive::Set,
		Node::Object(obj) if !obj.dict_items.is_empty() => Recursive::Dict,
		Node::Object(obj) if !obj.list_items.is_empty() => Recursive::List,
		_ => Recursive::Other,
	}
}

/// Rebuilds the value produced by calling a standard library class or
/// function that the unpickler knows how to emulate.
///
/// Objects built by anything else are returned unchanged.
fn reconstruct(obj: Object) -> Value {
	let Some(global) = obj.global() else {
		return Value::Object(Box::new(obj));
	};

	let rebuilt = match (global.module.as_str(), global.name.as_str()) {
		("builtins", "set") => iterable_arg(&obj).map(|items| Value::Set(with_list_items(items, &obj))),
		("builtins", "frozenset") => iterable_arg(&obj).map(Value::FrozenSet),
		("builtins", "list") => iterable_arg(&obj).map(|items| Value::List(with_list_items(items, &obj))),
		("builtins", "tuple") => iterable_arg(&obj).map(Value::Tuple),
		("builtins", "dict") | ("collections", "OrderedDict") | ("collections", "Counter") => {
			mapping_arg(&obj).map(|pairs| Value::Dict(with_dict_items(pairs, &obj)))
		}
		("collections", "defaultdict") => Some(Value::Dict(with_dict_items(
			match obj.args.get(1) {
				Some(arg) => pairs_of(arg).unwrap_or_default(),
				None => Vec::new(),
			},
			&obj,
		))),
		("builtins", "bytes") | ("_codecs", "encode") => bytes_args(&obj.args).map(Value::Bytes),
		("builtins", "bytearray") => bytes_args(&obj.args).map(Value::ByteArray),
		// _reconstructor(class, base, state) initializes the new instance with
		// base.__init__(obj, state), which fills dict and list subclasses.
		("copyreg", "_reconstructor") => match obj.args.as_slice() {
			[class, rest @ ..] => {
				let mut rebuilt = Object {
					class: class.clone(),
					args: Vec::new(),
					..obj.clone()
				};
				match rest {
					[Value::Global(base), init] if base.is("builtins", "dict") => {
						let mut pairs = pairs_of(init).unwrap_or_default();
						pairs.append(&mut rebuilt.dict_items);
						rebuilt.dict_items = pairs;
					}
					[Value::Global(base), Value::List(items) | Value::Tuple(items)]
						if base.is("builtins", "list") =>
					{
						let mut items = items.clone();
						items.append(&mut rebuilt.list_items);
						rebuilt.list_items = items;
					}
					_ => {}
				}
				Some(reconstruct(rebuilt))
			}
			[] => None,
		},
		("copyreg", "__newobj__" | "__newobj_ex__") => match obj.args.split_first() {
			Some((class, args)) => Some(reconstruct(Object {
				class: class.clone(),
				args: args.to_vec(),
				..obj.clone()
			})),
			None => None,
		},
		_ => None,
	};

	match rebuilt {
		Some(value) => {
			tracing::trace!(global = %global, "reconstructed builtin");
			value
		}
		None => Value::Object(Box::new(obj)),
	}
}

/// Returns the items of the optional iterable passed as the only argument to
/// a collection constructor.
fn iterable_arg(obj: &Object) -> Option<Vec<Value>> {
	match obj.args.as_slice() {
		[] => Some(Vec::new()),
		[Value::List(items) | Value::Tuple(items) | Value::Set(items) | Value::FrozenSet(items)] => {
			Some(items.clone())
		}
		[Value::Dict(pairs)] => Some(pairs.iter().map(|(k, _)| k.clone()).collect()),
		_ => None,
	}
}

fn mapping_arg(obj: &Object) -> Option<Vec<(Value, Value)>> {
	match obj.args.as_slice() {
		[] => Some(Vec::new()),
		[arg] => pairs_of(arg),
		_ => None,
	}
}

/// Interprets a dict, or a sequence of two-element sequences, as key-value
/// pairs.
fn pairs_of(value: &Value) -> Option<Vec<(Value, Value)>> {
	match value {
		Value::Dict(pairs) => Some(pairs.clone()),
		Value::List(items) | Value::Tuple(items) => items
			.iter()
			.map(|item| match item {
				Value::List(pair) | Value::Tuple(pair) => match pair.as_slice() {
					[k, v] => Some((k.clone(), v.clone())),
					_ => None,
				},
				_ => None,
			})
			.collect(),
		_ => None,
	}
}

fn with_list_items(mut items: Vec<Value>, obj: &Object) -> Vec<Value> {
	items.extend(obj.list_items.iter().cloned());
	items
}

fn with_dict_items(mut pairs: Vec<(Value, Value)>, obj: &Object) -> Vec<(Value, Value)> {
	pairs.extend(obj.kwargs.iter().cloned());
	pairs.extend(obj.dict_items.iter().cloned());
	pairs
}

/// Evaluates the arguments of `bytes(...)`, `bytearray(...)`, or
/// `_codecs.encode(...)` as used by protocols before 3.
fn bytes_args(args: &[Value]) -> Option<Vec<u8>> {
	match args {
		[] => Some(Vec::new()),
		[Value::Bytes(b) | Value::ByteArray(b)] => Some(b.clone()),
		[Value::List(items) | Value::Tuple(items)] => items
			.iter()
			.map(|item| match item {
				Value::Int(n) => u8::try_from(*n).ok(),
				_ => None,
			})
			.collect(),
		[Value::Str(text), Value::Str(encoding)] => encode(text, encoding),
		_ => None,
	}
}

fn encode(text: &str, encoding: &str) -> Option<Vec<u8>> {
	let encoding = encoding.to_ascii_lowercase().replace(['-', '_'], "");
	match encoding.as_str() {
		"latin1" | "iso88591" | "l1" => text.chars().map(|c| u8::try_from(c).ok()).collect(),
		"ascii" => text
			.chars()
			.map(|c| if c.is_ascii() { u8::try_from(c).ok() } else { None })
			.collect(),
		"utf8" => Some(text.as_bytes().to_vec()),
		_ => None,
	}
}
