//! The unpickling stack machine.

use std::collections::HashMap;

use super::opcode::*;
use super::{BigInt, Error, Global, DEPTH_LIMIT, MAX_STR_DIGITS};

type Result<T> = std::result::Result<T, Error>;

/// A value under construction by the machine.
///
/// `Node` mirrors [`Value`](super::Value), except that values stored in the
/// memo are replaced by [`Node::Ref`]s wherever they appear. Opcodes like
/// APPEND and SETITEMS mutate their targets after they are memoized, so every
/// reference has to observe those changes until the machine stops.
#[derive(Clone, Debug)]
pub(super) enum Node {
	None,
	Bool(bool),
	Int(i64),
	BigInt(BigInt),
	Float(f64),
	Str(String),
	Bytes(Vec<u8>),
	ByteArray(Vec<u8>),
	List(Vec<Node>),
	Tuple(Vec<Node>),
	Dict(Vec<(Node, Node)>),
	Set(Vec<Node>),
	FrozenSet(Vec<Node>),
	Global(Global),
	Object(Box<ObjectNode>),
	Ref(u64),
}

#[derive(Clone, Debug)]
pub(super) struct ObjectNode {
	pub class: Node,
	pub args: Vec<Node>,
	pub kwargs: Vec<(Node, Node)>,
	pub state: Option<Node>,
	pub list_items: Vec<Node>,
	pub dict_items: Vec<(Node, Node)>,
}

/// A node along with its nesting depth.
///
/// References count as leaves, since dropping or walking a `Node` never
/// follows them. Resolution enforces its own limit across references.
#[derive(Clone, Debug)]
pub(super) struct Entry {
	pub node: Node,
	depth: usize,
}

impl Entry {
	fn leaf(node: Node) -> Entry {
		Entry { node, depth: 0 }
	}

	fn nested(node: Node, children: &[Entry]) -> Result<Entry> {
		let depth = 1 + children.iter().map(|e| e.depth).max().unwrap_or(0);
		check_depth(depth)?;
		Ok(Entry { node, depth })
	}

	/// Records that `child_depth` now appears inside of this entry.
	fn absorb(&mut self, child_depth: usize) -> Result<()> {
		self.depth = self.depth.max(child_depth + 1);
		check_depth(self.depth)
	}
}

fn check_depth(depth: usize) -> Result<()> {
	if depth > DEPTH_LIMIT {
		Err(Error::DepthLimitExceeded)
	} else {
		Ok(())
	}
}

pub(super) type Memo = HashMap<u64, Entry>;

/// The first memo index used for values shared by DUP. Python's memo indexes
/// are signed sizes, so the input can never store or fetch one this large.
const DUP_MEMO_BASE: u64 = 1 << 63;

/// The number of bytes past which a LONG1 or LONG4 integer, without redundant
/// sign bytes, is sure to exceed [`MAX_STR_DIGITS`] digits.
const LONG_BYTES_LIMIT: usize = 1800;

pub(super) struct Machine<'a> {
	input: &'a [u8],
	pos: usize,
	stack: Vec<Entry>,
	marks: Vec<usize>,
	memo: Memo,
	/// The number of memo entries created by DUP rather than by the input.
	dups: u64,
	protocol: u8,
}

impl<'a> Machine<'a> {
	pub fn new(input: &'a [u8]) -> Machine<'a> {
		Machine {
			input,
			pos: 0,
			stack: Vec::new(),
			marks: Vec::new(),
			memo: HashMap::new(),
			dups: 0,
			protocol: 0,
		}
	}

	/// Runs the machine until it reaches a STOP opcode, and returns the final
	/// value along with the memo that its references point into.
	pub fn run(mut self) -> Result<(Node, Memo)> {
		loop {
			let op = match self.input.get(self.pos) {
				Some(op) => *op,
				None => return Err(Error::Eof),
			};
			self.pos += 1;
			if op == STOP {
				let root = self.pop()?;
				tracing::debug!(
					protocol = self.protocol,
					consumed = self.pos,
					memo = self.memo.len(),
					"reached end of pickle"
				);
				return Ok((root.node, self.memo));
			}
			self.step(op)?;
		}
	}

	fn step(&mut self, op: u8) -> Result<()> {
		match op {
			PROTO => {
				let proto = self.read_u8()?;
				if proto > HIGHEST_PROTOCOL {
					return Err(Error::UnsupportedProtocol(proto));
				}
				self.protocol = proto;
			}
			FRAME => {
				// Frames only exist to batch reads, and the whole input is
				// already in memory. Python still loads each frame in full
				// before running it, so a short frame is truncated data even
				// when it ends between opcodes.
				let len = u64::from_le_bytes(self.read_array()?);
				let remaining = self.input.len() - self.pos;
				if usize::try_from(len).map_or(true, |len| len > remaining) {
					return Err(Error::Truncated);
				}
			}

			MARK => self.marks.push(self.stack.len()),
			POP => {
				if self.marks.last() == Some(&self.stack.len()) {
					self.marks.pop();
				} else {
					self.pop()?;
				}
			}
			POP_MARK => {
				self.pop_mark()?;
			}
			DUP => {
				// Both copies must refer to the same object, so that mutating
				// one mutates the other.
				if !matches!(self.top()?.node, Node::Ref(_)) {
					let idx = DUP_MEMO_BASE + self.dups;
					self.dups += 1;
					self.memo_put(idx)?;
				}
				let top = self.top()?.clone();
				self.stack.push(top);
			}

			NONE => self.push(Node::None),
			NEWTRUE => self.push(Node::Bool(true)),
			NEWFALSE => self.push(Node::Bool(false)),

			INT => {
				let line = self.read_line()?;
				let node = match line {
					b"00" => Node::Bool(false),
					b"01" => Node::Bool(true),
					_ => match parse_int(line, "could not convert string to int") {
						Err(Error::IntTooLarge(_)) => {
							return Err(Error::InvalidLiteral("could not convert string to int"))
						}
						result => result?,
					},
				};
				self.push(node);
			}
			BININT => {
				let n = i32::from_le_bytes(self.read_array()?);
				self.push(Node::Int(i64::from(n)));
			}
			BININT1 => {
				let n = self.read_u8()?;
				self.push(Node::Int(i64::from(n)));
			}
			BININT2 => {
				let n = u16::from_le_bytes(self.read_array()?);
				self.push(Node::Int(i64::from(n)));
			}
			LONG => {
				let line = self.read_line()?;
				let line = line.strip_suffix(b"L").unwrap_or(line);
				let node = parse_int(line, "invalid literal for int() with base 10")?;
				self.push(node);
			}
			LONG1 => {
				let len = usize::from(self.read_u8()?);
				let bytes = self.read(len)?;
				let node = long_from_le_bytes(bytes)?;
				self.push(node);
			}
			LONG4 => {
				let len = i32::from_le_bytes(self.read_array()?);
				let len = usize::try_from(len)
					.map_err(|_| Error::Malformed("LONG pickle has negative byte count"))?;
				let bytes = self.read(len)?;
				let node = long_from_le_bytes(bytes)?;
				self.push(node);
			}

			FLOAT => {
				let line = self.read_line()?;
				let n = std::str::from_utf8(line)
					.ok()
					.and_then(|s| s.trim().parse::<f64>().ok())
					.ok_or(Error::InvalidLiteral("could not convert string to float"))?;
				self.push(Node::Float(n));
			}
			BINFLOAT => {
				let n = f64::from_be_bytes(self.read_array()?);
				self.push(Node::Float(n));
			}

			STRING => {
				let line = self.read_line()?;
				let bytes = unquote_string(line)?;
				let node = decode_ascii(bytes)?;
				self.push(node);
			}
			BINSTRING => {
				let len = i32::from_le_bytes(self.read_array()?);
				let len = usize::try_from(len)
					.map_err(|_| Error::Malformed("BINSTRING pickle has negative byte count"))?;
				let node = decode_ascii(self.read(len)?.to_vec())?;
				self.push(node);
			}
			SHORT_BINSTRING => {
				let len = usize::from(self.read_u8()?);
				let node = decode_ascii(self.read(len)?.to_vec())?;
				self.push(node);
			}

			UNICODE => {
				let line = self.read_line()?;
				let s = decode_raw_unicode_escape(line)?;
				self.push(Node::Str(s));
			}
			BINUNICODE => {
				let len = u32::from_le_bytes(self.read_array()?);
				let s = self.read_utf8(len_to_usize(u64::from(len))?)?;
				self.push(Node::Str(s));
			}
			SHORT_BINUNICODE => {
				let len = usize::from(self.read_u8()?);
				let s = self.read_utf8(len)?;
				self.push(Node::Str(s));
			}
			BINUNICODE8 => {
				let len = len_to_usize(u64::from_le_bytes(self.read_array()?))?;
				let s = self.read_utf8(len)?;
				self.push(Node::Str(s));
			}

			BINBYTES => {
				let len = u32::from_le_bytes(self.read_array()?);
				let bytes = self.read(len_to_usize(u64::from(len))?)?;
				self.push(Node::Bytes(bytes.to_vec()));
			}
			SHORT_BINBYTES => {
				let len = usize::from(self.read_u8()?);
				let bytes = self.read(len)?;
				self.push(Node::Bytes(bytes.to_vec()));
			}
			BINBYTES8 => {
				let len = len_to_usize(u64::from_le_bytes(self.read_array()?))?;
				let bytes = self.read(len)?;
				self.push(Node::Bytes(bytes.to_vec()));
			}
			BYTEARRAY8 => {
				let len = len_to_usize(u64::from_le_bytes(self.read_array()?))?;
				let bytes = self.read(len)?;
				self.push(Node::ByteArray(bytes.to_vec()));
			}

			EMPTY_LIST => self.push(Node::List(Vec::new())),
			EMPTY_TUPLE => self.push(Node::Tuple(Vec::new())),
			EMPTY_DICT => self.push(Node::Dict(Vec::new())),
			EMPTY_SET => self.push(Node::Set(Vec::new())),

			LIST => {
				let items = self.pop_mark()?;
				self.push_nested(Node::List, items)?;
			}
			TUPLE => {
				let items = self.pop_mark()?;
				self.push_nested(Node::Tuple, items)?;
			}
			TUPLE1 | TUPLE2 | TUPLE3 => {
				let items = self.pop_n(usize::from(op - TUPLE1 + 1))?;
				self.push_nested(Node::Tuple, items)?;
			}
			FROZENSET => {
				let items = self.pop_mark()?;
				self.push_nested(Node::FrozenSet, items)?;
			}
			DICT => {
				let items = self.pop_mark()?;
				let entry = pairs_entry(items, Node::Dict)?;
				self.stack.push(entry);
			}

			APPEND => {
				let item = self.pop()?;
				self.extend_list(vec![item])?;
			}
			APPENDS => {
				let items = self.pop_mark()?;
				self.extend_list(items)?;
			}
			ADDITEMS => {
				let items = self.pop_mark()?;
				self.extend_set(items)?;
			}
			SETITEM => {
				let items = self.pop_n(2)?;
				self.extend_dict(items)?;
			}
			SETITEMS => {
				let items = self.pop_mark()?;
				self.extend_dict(items)?;
			}

			GLOBAL => {
				let module = self.read_utf8_line()?;
				let name = self.read_utf8_line()?;
				self.push(Node::Global(python3_global(&module, &name)));
			}
			STACK_GLOBAL => {
				let name = self.pop()?;
				let module = self.pop()?;
				match (module.node, name.node) {
					(Node::Str(module), Node::Str(name)) => {
						self.push(Node::Global(python3_global(&module, &name)));
					}
					_ => return Err(Error::Malformed("STACK_GLOBAL requires str")),
				}
			}
			REDUCE => {
				let args = self.pop()?;
				let callable = self.pop()?;
				self.push_object(callable, args, None)?;
			}
			NEWOBJ => {
				let args = self.pop()?;
				let class = self.pop()?;
				self.push_object(class, args, None)?;
			}
			NEWOBJ_EX => {
				let kwargs = self.pop()?;
				let args = self.pop()?;
				let class = self.pop()?;
				self.push_object(class, args, Some(kwargs))?;
			}
			INST => {
				let module = self.read_utf8_line()?;
				let name = self.read_utf8_line()?;
				let args = self.pop_mark()?;
				let depth = args.iter().map(|a| a.depth).max().unwrap_or(0);
				let args = args.into_iter().map(|a| a.node).collect();
				let class = Entry::leaf(Node::Global(python3_global(&module, &name)));
				self.push_object_parts(class, args, depth, Vec::new())?;
			}
			OBJ => {
				let mut items = self.pop_mark()?.into_iter();
				let class = items.next().ok_or(Error::StackUnderflow)?;
				let args: Vec<Entry> = items.collect();
				let depth = args.iter().map(|a| a.depth).max().unwrap_or(0);
				let args = args.into_iter().map(|a| a.node).collect();
				self.push_object_parts(class, args, depth, Vec::new())?;
			}
			BUILD => {
				let state = self.pop()?;
				let target = self.top_mut()?;
				match &mut target.node {
					Node::Object(obj) => obj.state = Some(state.node),
					_ => return Err(Error::Malformed("BUILD target is not an object")),
				}
				target.absorb(state.depth)?;
			}

			PUT => {
				let idx = parse_memo_index(self.read_line()?)?;
				self.memo_put(idx)?;
			}
			BINPUT => {
				let idx = self.read_u8()?;
				self.memo_put(u64::from(idx))?;
			}
			LONG_BINPUT => {
				let idx = u32::from_le_bytes(self.read_array()?);
				self.memo_put(u64::from(idx))?;
			}
			MEMOIZE => {
				let idx = u64::try_from(self.memo.len())
					.unwrap_or(u64::MAX)
					.saturating_sub(self.dups);
				self.memo_put(idx)?;
			}
			GET => {
				let idx = parse_memo_index(self.read_line()?)?;
				self.memo_get(idx)?;
			}
			BINGET => {
				let idx = self.read_u8()?;
				self.memo_get(u64::from(idx))?;
			}
			LONG_BINGET => {
				let idx = u32::from_le_bytes(self.read_array()?);
				self.memo_get(u64::from(idx))?;
			}

			PERSID => {
				self.read_line()?;
				return Err(Error::PersistentId);
			}
			BINPERSID => {
				self.pop()?;
				return Err(Error::PersistentId);
			}
			EXT1 => return Err(Error::Extension(u32::from(self.read_u8()?))),
			EXT2 => {
				let code = u16::from_le_bytes(self.read_array()?);
				return Err(Error::Extension(u32::from(code)));
			}
			EXT4 => {
				let code = u32::from_le_bytes(self.read_array()?);
				return Err(Error::Extension(code));
			}
			NEXT_BUFFER => return Err(Error::OutOfBandBuffer),
			READONLY_BUFFER => {
				// Marks the buffer on top of the stack as read-only, which has
				// no meaning for a decoded value.
				self.top()?;
			}

			op => return Err(Error::InvalidOpcode(op)),
		}
		Ok(())
	}

	fn read(&mut self, n: usize) -> Result<&'a [u8]> {
		let input = self.input;
		let end = self.pos.checked_add(n).ok_or(Error::Truncated)?;
		let bytes = input.get(self.pos..end).ok_or(Error::Truncated)?;
		self.pos = end;
		Ok(bytes)
	}

	fn read_u8(&mut self) -> Result<u8> {
		Ok(self.read(1)?[0])
	}

	fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
		let mut buf = [0; N];
		buf.copy_from_slice(self.read(N)?);
		Ok(buf)
	}

	/// Reads up to the next newline, returning the line without it.
	fn read_line(&mut self) -> Result<&'a [u8]> {
		let input = self.input;
		let rest = &input[self.pos..];
		let len = rest.iter().position(|&b| b == b'\n').ok_or(Error::Truncated)?;
		self.pos += len + 1;
		let line = &rest[..len];
		Ok(line.strip_suffix(b"\r").unwrap_or(line))
	}

	fn read_utf8(&mut self, len: usize) -> Result<String> {
		let bytes = self.read(len)?;
		match std::str::from_utf8(bytes) {
			Ok(s) => Ok(s.to_owned()),
			Err(err) => Err(Error::decode_utf8(bytes, err)),
		}
	}

	fn read_utf8_line(&mut self) -> Result<String> {
		let line = self.read_line()?;
		match std::str::from_utf8(line) {
			Ok(s) => Ok(s.to_owned()),
			Err(err) => Err(Error::decode_utf8(line, err)),
		}
	}

	fn push(&mut self, node: Node) {
		self.stack.push(Entry::leaf(node));
	}

	fn push_nested<F>(&mut self, make: F, items: Vec<Entry>) -> Result<()>
	where
		F: FnOnce(Vec<Node>) -> Node,
	{
		let entry = Entry::nested(Node::None, &items)?;
		let node = make(items.into_iter().map(|e| e.node).collect());
		self.stack.push(Entry { node, ..entry });
		Ok(())
	}

	/// Returns the index of the lowest stack entry the current opcode may
	/// consume.
	fn fence(&self) -> usize {
		self.marks.last().copied().unwrap_or(0)
	}

	fn underflow(&self) -> Error {
		if self.marks.is_empty() {
			Error::StackUnderflow
		} else {
			Error::UnexpectedMark
		}
	}

	fn pop(&mut self) -> Result<Entry> {
		if self.stack.len() <= self.fence() {
			return Err(self.underflow());
		}
		self.stack.pop().ok_or(Error::StackUnderflow)
	}

	fn pop_n(&mut self, n: usize) -> Result<Vec<Entry>> {
		if self.stack.len() < self.fence() + n {
			return Err(self.underflow());
		}
		Ok(self.stack.split_off(self.stack.len() - n))
	}

	fn pop_mark(&mut self) -> Result<Vec<Entry>> {
		let mark = self.marks.pop().ok_or(Error::MarkNotFound)?;
		Ok(self.stack.split_off(mark.min(self.stack.len())))
	}

	fn top(&self) -> Result<&Entry> {
		if self.stack.len() <= self.fence() {
			return Err(self.underflow());
		}
		self.stack.last().ok_or(Error::StackUnderflow)
	}

	/// Returns the entry on top of the stack for mutation, following a memo
	/// reference to the memoized entry if necessary.
	fn top_mut(&mut self) -> Result<&mut Entry> {
		if self.stack.len() <= self.fence() {
			return Err(self.underflow());
		}
		let top = self.stack.last_mut().ok_or(Error::StackUnderflow)?;
		match top.node {
			Node::Ref(idx) => {
				let target = memo_target(&self.memo, idx)?;
				self.memo.get_mut(&target).ok_or(Error::MemoNotFound(target))
			}
			_ => Ok(top),
		}
	}

	fn extend_list(&mut self, items: Vec<Entry>) -> Result<()> {
		let target = self.top_mut()?;
		let depth = items.iter().map(|e| e.depth).max();
		let nodes = items.into_iter().map(|e| e.node);
		match &mut target.node {
			Node::List(list) => list.extend(nodes),
			Node::Object(obj) => obj.list_items.extend(nodes),
			_ => return Err(Error::Malformed("APPEND target is not a list")),
		}
		match depth {
			Some(depth) => target.absorb(depth),
			None => Ok(()),
		}
	}

	fn extend_set(&mut self, items: Vec<Entry>) -> Result<()> {
		let target = self.top_mut()?;
		let depth = items.iter().map(|e| e.depth).max();
		let nodes = items.into_iter().map(|e| e.node);
		match &mut target.node {
			Node::Set(set) => set.extend(nodes),
			Node::Object(obj) => obj.list_items.extend(nodes),
			_ => return Err(Error::Malformed("ADDITEMS target is not a set")),
		}
		match depth {
			Some(depth) => target.absorb(depth),
			None => Ok(()),
		}
	}

	fn extend_dict(&mut self, items: Vec<Entry>) -> Result<()> {
		if items.len() % 2 != 0 {
			return Err(Error::Malformed("odd number of items for SETITEMS"));
		}
		let target = self.top_mut()?;
		let depth = items.iter().map(|e| e.depth).max();
		let pairs = into_pairs(items);
		match &mut target.node {
			Node::Dict(dict) => dict.extend(pairs),
			Node::Object(obj) => obj.dict_items.extend(pairs),
			_ => return Err(Error::Malformed("SETITEM target is not a dict")),
		}
		match depth {
			Some(depth) => target.absorb(depth),
			None => Ok(()),
		}
	}

	fn push_object(&mut self, class: Entry, args: Entry, kwargs: Option<Entry>) -> Result<()> {
		let (args, args_depth) = self.tuple_items(args)?;
		let (kwargs, kwargs_depth) = match kwargs {
			None => (Vec::new(), 0),
			Some(kwargs) => self.dict_items(kwargs)?,
		};
		self.push_object_parts(class, args, args_depth.max(kwargs_depth), kwargs)
	}

	fn push_object_parts(
		&mut self,
		class: Entry,
		args: Vec<Node>,
		args_depth: usize,
		kwargs: Vec<(Node, Node)>,
	) -> Result<()> {
		let depth = 1 + class.depth.max(args_depth);
		check_depth(depth)?;
		let node = Node::Object(Box::new(ObjectNode {
			class: class.node,
			args,
			kwargs,
			state: None,
			list_items: Vec::new(),
			dict_items: Vec::new(),
		}));
		self.stack.push(Entry { node, depth });
		Ok(())
	}

	/// Unpacks an argument tuple for a call, which may have been memoized.
	fn tuple_items(&self, entry: Entry) -> Result<(Vec<Node>, usize)> {
		let entry = self.deref(entry)?;
		match entry.node {
			Node::Tuple(items) => Ok((items, entry.depth)),
			_ => Err(Error::Malformed("call arguments must be a tuple")),
		}
	}

	fn dict_items(&self, entry: Entry) -> Result<(Vec<(Node, Node)>, usize)> {
		let entry = self.deref(entry)?;
		match entry.node {
			Node::Dict(items) => Ok((items, entry.depth)),
			_ => Err(Error::Malformed("NEWOBJ_EX kwargs must be a dict")),
		}
	}

	fn deref(&self, entry: Entry) -> Result<Entry> {
		match entry.node {
			Node::Ref(idx) => {
				let target = memo_target(&self.memo, idx)?;
				self.memo.get(&target).cloned().ok_or(Error::MemoNotFound(target))
			}
			_ => Ok(entry),
		}
	}

	/// Stores the top of the stack in the memo, leaving a reference in its
	/// place.
	fn memo_put(&mut self, idx: u64) -> Result<()> {
		if self.stack.len() <= self.fence() {
			return Err(self.underflow());
		}
		let Some(top) = self.stack.last_mut() else {
			return Err(Error::StackUnderflow);
		};
		if let Node::Ref(existing) = top.node {
			let target = memo_target(&self.memo, existing)?;
			if target != idx {
				self.memo.insert(idx, Entry::leaf(Node::Ref(target)));
			}
			return Ok(());
		}
		let entry = std::mem::replace(top, Entry::leaf(Node::Ref(idx)));
		tracing::trace!(idx, depth = entry.depth, "memoized value");
		self.memo.insert(idx, entry);
		Ok(())
	}

	fn memo_get(&mut self, idx: u64) -> Result<()> {
		if idx >= DUP_MEMO_BASE || !self.memo.contains_key(&idx) {
			return Err(Error::MemoNotFound(idx));
		}
		self.push(Node::Ref(idx));
		Ok(())
	}
}

/// Follows a chain of memo references to the memo index holding a real value.
pub(super) fn memo_target(memo: &Memo, mut idx: u64) -> Result<u64> {
	for _ in 0..=memo.len() {
		match memo.get(&idx) {
			Some(Entry {
				node: Node::Ref(next),
				..
			}) => idx = *next,
			Some(_) => return Ok(idx),
			None => return Err(Error::MemoNotFound(idx)),
		}
	}
	Err(Error::Malformed("memo references form a loop"))
}

fn pairs_entry<F>(items: Vec<Entry>, make: F) -> Result<Entry>
where
	F: FnOnce(Vec<(Node, Node)>) -> Node,
{
	if items.len() % 2 != 0 {
		return Err(Error::Malformed("odd number of items for DICT"));
	}
	let entry = Entry::nested(Node::None, &items)?;
	Ok(Entry {
		node: make(into_pairs(items)),
		..entry
	})
}

fn into_pairs(items: Vec<Entry>) -> Vec<(Node, Node)> {
	let mut pairs = Vec::with_capacity(items.len() / 2);
	let mut iter = items.into_iter();
	while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
		pairs.push((k.node, v.node));
	}
	pairs
}

fn len_to_usize(len: u64) -> Result<usize> {
	usize::try_from(len).map_err(|_| Error::Truncated)
}

/// Parses the argument of PUT or GET, which Python limits to a signed size.
fn parse_memo_index(line: &[u8]) -> Result<u64> {
	let invalid = Error::InvalidLiteral("invalid literal for int() with base 10");
	let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?.trim();
	match text.parse::<u64>() {
		Ok(idx) if idx < DUP_MEMO_BASE => Ok(idx),
		_ if BigInt::parse(text).is_some_and(|n| !n.as_str().starts_with('-')) => {
			Err(Error::MemoIndexOverflow)
		}
		_ => Err(invalid),
	}
}

fn parse_int(line: &[u8], msg: &'static str) -> Result<Node> {
	let text = std::str::from_utf8(line)
		.map_err(|_| Error::InvalidLiteral(msg))?
		.trim();
	let digits = text.trim_start_matches(['+', '-']).len();
	if digits <= MAX_STR_DIGITS {
		if let Ok(n) = text.parse::<i64>() {
			return Ok(Node::Int(n));
		}
	}
	let n = BigInt::parse(text).ok_or(Error::InvalidLiteral(msg))?;
	if digits > MAX_STR_DIGITS {
		return Err(Error::IntTooLarge(Some(digits)));
	}
	Ok(Node::BigInt(n))
}

/// Decodes the two's complement argument of LONG1 or LONG4.
///
/// Python loads integers of any size, but can't print one with more than
/// [`MAX_STR_DIGITS`] digits, so those are rejected here instead of being
/// converted to decimal.
fn long_from_le_bytes(bytes: &[u8]) -> Result<Node> {
	let bytes = trim_sign_extension(bytes);
	if bytes.len() > LONG_BYTES_LIMIT {
		return Err(Error::IntTooLarge(None));
	}
	if bytes.len() <= 8 {
		let fill = if bytes.last().is_some_and(|b| b & 0x80 != 0) {
			0xff
		} else {
			0
		};
		let mut buf = [fill; 8];
		buf[..bytes.len()].copy_from_slice(bytes);
		return Ok(Node::Int(i64::from_le_bytes(buf)));
	}
	let n = BigInt::from_le_bytes(bytes);
	if n.digits() > MAX_STR_DIGITS {
		return Err(Error::IntTooLarge(None));
	}
	Ok(Node::BigInt(n))
}

/// Drops high-order bytes that only repeat the sign of the byte below them.
fn trim_sign_extension(mut bytes: &[u8]) -> &[u8] {
	while let [.., prev, last] = bytes {
		let fill = if prev & 0x80 != 0 { 0xff } else { 0 };
		if *last != fill {
			break;
		}
		bytes = &bytes[..bytes.len() - 1];
	}
	bytes
}

/// Maps names from Python 2 pickles to their Python 3 equivalents, like
/// `pickle.Unpickler` does with `fix_imports=True`.
fn python3_global(module: &str, name: &str) -> Global {
	match (module, name) {
		("__builtin__", "unicode") => Global::new("builtins", "str"),
		("__builtin__", "long") => Global::new("builtins", "int"),
		("__builtin__", "xrange") => Global::new("builtins", "range"),
		("__builtin__" | "exceptions", _) => Global::new("builtins", name),
		("copy_reg", _) => Global::new("copyreg", name),
		("UserDict", "UserDict" | "IterableUserDict") => Global::new("collections", "UserDict"),
		_ => Global::new(module, name),
	}
}

/// Decodes the quoted argument of a STRING opcode, which uses Python's string
/// literal escapes.
fn unquote_string(line: &[u8]) -> Result<Vec<u8>> {
	let body = match line {
		[q @ (b'\'' | b'"'), body @ .., end] if end == q => body,
		_ => return Err(Error::UnquotedString),
	};

	let mut out = Vec::with_capacity(body.len());
	let mut iter = body.iter().copied().peekable();
	while let Some(b) = iter.next() {
		if b != b'\\' {
			out.push(b);
			continue;
		}
		let Some(esc) = iter.next() else {
			return Err(Error::Malformed("Trailing \\ in string"));
		};
		match esc {
			b'\n' => {}
			b'\\' | b'\'' | b'"' => out.push(esc),
			b'a' => out.push(0x07),
			b'b' => out.push(0x08),
			b'f' => out.push(0x0c),
			b'n' => out.push(b'\n'),
			b'r' => out.push(b'\r'),
			b't' => out.push(b'\t'),
			b'v' => out.push(0x0b),
			b'x' => {
				let hi = iter.next().and_then(hex_value);
				let lo = iter.next().and_then(hex_value);
				match (hi, lo) {
					(Some(hi), Some(lo)) => out.push(hi << 4 | lo),
					_ => return Err(Error::Malformed("invalid \\x escape in STRING")),
				}
			}
			b'0'..=b'7' => {
				let mut n = u32::from(esc - b'0');
				for _ in 0..2 {
					match iter.peek() {
						Some(d @ b'0'..=b'7') => {
							n = n * 8 + u32::from(d - b'0');
							iter.next();
						}
						_ => break,
					}
				}
				out.push(u8::try_from(n & 0xff).unwrap_or(0));
			}
			_ => out.extend_from_slice(&[b'\\', esc]),
		}
	}
	Ok(out)
}

fn hex_value(b: u8) -> Option<u8> {
	char::from(b)
		.to_digit(16)
		.and_then(|d| u8::try_from(d).ok())
}

/// Converts a Python 2 `str` to text the way Python 3's unpickler does by
/// default, with the strict ASCII codec.
fn decode_ascii(bytes: Vec<u8>) -> Result<Node> {
	match bytes.iter().position(|b| !b.is_ascii()) {
		None => Ok(Node::Str(String::from_utf8(bytes).unwrap_or_default())),
		Some(position) => Err(Error::Decode {
			codec: "ascii",
			byte: bytes[position],
			position,
			reason: "ordinal not in range(128)",
		}),
	}
}

/// Decodes the argument of a UNICODE opcode with Python's raw-unicode-escape
/// codec, where every byte is a Latin-1 character except for `\uXXXX` and
/// `\UXXXXXXXX` escapes.
fn decode_raw_unicode_escape(line: &[u8]) -> Result<String> {
	let mut out = String::with_capacity(line.len());
	let mut pending_high: Option<u32> = None;
	let mut i = 0;
	while i < line.len() {
		let b = line[i];
		let width = match (b, line.get(i + 1)) {
			(b'\\', Some(b'u')) => 4,
			(b'\\', Some(b'U')) => 8,
			_ => 0,
		};
		let code = if width > 0 {
			let digits = line
				.get(i + 2..i + 2 + width)
				.filter(|d| d.iter().all(u8::is_ascii_hexdigit))
				.ok_or(Error::Decode {
					codec: "rawunicodeescape",
					byte: b'\\',
					position: i,
					reason: if width == 4 {
						"truncated \\uXXXX escape"
					} else {
						"truncated \\UXXXXXXXX escape"
					},
				})?;
			i += 2 + width;
			digits
				.iter()
				.fold(0u32, |acc, d| acc * 16 + char::from(*d).to_digit(16).unwrap_or(0))
		} else {
			i += 1;
			u32::from(b)
		};

		match (pending_high.take(), code) {
			(None, 0xd800..=0xdbff) => pending_high = Some(code),
			(Some(high), 0xdc00..=0xdfff) => {
				let combined = 0x10000 + ((high - 0xd800) << 10) + (code - 0xdc00);
				out.push(char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER));
			}
			(Some(_), _) | (None, 0xdc00..=0xdfff) => {
				return Err(Error::Decode {
					codec: "rawunicodeescape",
					byte: b'\\',
					position: i,
					reason: "unpaired surrogate",
				});
			}
			(None, code) => match char::from_u32(code) {
				Some(c) => out.push(c),
				None => {
					return Err(Error::Decode {
						codec: "rawunicodeescape",
						byte: b'\\',
						position: i,
						reason: "\\Uxxxxxxxx out of range",
					})
				}
			},
		}
	}
	if pending_high.is_some() {
		return Err(Error::Decode {
			codec: "rawunicodeescape",
			byte: b'\\',
			position: line.len(),
			reason: "unpaired surrogate",
		});
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_opcode_escapes() {
		assert_eq!(unquote_string(br"'a\'b\n\x41\101'").unwrap(), b"a'b\nAA");
		assert_eq!(unquote_string(br#""q""#).unwrap(), b"q");
		assert_eq!(unquote_string(b"'abc"), Err(Error::UnquotedString));
		assert_eq!(unquote_string(b"abc"), Err(Error::UnquotedString));
	}

	#[test]
	fn raw_unicode_escape() {
		assert_eq!(decode_raw_unicode_escape(b"caf\xe9").unwrap(), "café");
		assert_eq!(decode_raw_unicode_escape(b"\xe9\\U0001f600").unwrap(), "é😀");
		assert_eq!(decode_raw_unicode_escape(br"\ud83d\ude00").unwrap(), "😀");
		assert_eq!(decode_raw_unicode_escape(br"a\b").unwrap(), "a\\b");
		assert!(decode_raw_unicode_escape(br"\u00").is_err());
	}

	#[test]
	fn python2_names() {
		assert_eq!(
			python3_global("__builtin__", "set"),
			Global::new("builtins", "set")
		);
		assert_eq!(
			python3_global("copy_reg", "_reconstructor"),
			Global::new("copyreg", "_reconstructor")
		);
		assert_eq!(
			python3_global("exceptions", "ValueError"),
			Global::new("builtins", "ValueError")
		);
	}

	#[test]
	fn long_widths() {
		assert!(matches!(long_from_le_bytes(&[]), Ok(Node::Int(0))));
		assert!(matches!(long_from_le_bytes(&[0xff]), Ok(Node::Int(-1))));
		assert!(matches!(long_from_le_bytes(&[0x80, 0x00]), Ok(Node::Int(128))));
		assert!(matches!(
			long_from_le_bytes(&[0, 0, 0, 0, 0, 0, 0, 0, 1]),
			Ok(Node::BigInt(_))
		));
	}

	#[test]
	fn long_sign_extension_is_ignored() {
		let mut padded = vec![0x2a];
		padded.resize(200_000, 0);
		assert!(matches!(long_from_le_bytes(&padded), Ok(Node::Int(42))));

		let mut padded = vec![0xfe];
		padded.resize(200_000, 0xff);
		assert!(matches!(long_from_le_bytes(&padded), Ok(Node::Int(-2))));

		assert!(matches!(
			long_from_le_bytes(&[0xff, 0x00, 0x00]),
			Ok(Node::Int(255))
		));
	}

	#[test]
	fn long_digits_are_limited() {
		// 2^14280 - 1 has 4299 digits, and 2^14288 - 1 has 4302.
		let mut bytes = vec![0xff; 1785];
		bytes.push(0x00);
		assert!(matches!(long_from_le_bytes(&bytes), Ok(Node::BigInt(_))));

		let mut bytes = vec![0xff; 1786];
		bytes.push(0x00);
		assert_eq!(long_from_le_bytes(&bytes).err(), Some(Error::IntTooLarge(None)));

		let bytes = vec![0x11; 200_000];
		assert_eq!(long_from_le_bytes(&bytes).err(), Some(Error::IntTooLarge(None)));

		let limit = "7".repeat(MAX_STR_DIGITS);
		assert!(matches!(parse_int(limit.as_bytes(), ""), Ok(Node::BigInt(_))));
		let over = format!("-{limit}7");
		assert_eq!(
			parse_int(over.as_bytes(), "").err(),
			Some(Error::IntTooLarge(Some(MAX_STR_DIGITS + 1)))
		);
		let zeros = format!("{}1", "0".repeat(MAX_STR_DIGITS));
		assert_eq!(
			parse_int(zeros.as_bytes(), "").err(),
			Some(Error::IntTooLarge(Some(MAX_STR_DIGITS + 1)))
		);
		assert_eq!(
			parse_int(b"12x", "bad").err(),
			Some(Error::InvalidLiteral("bad"))
		);
	}

	#[test]
	fn dup_shares_one_object() {
		let (root, memo) = Machine::new(b"\x80\x04]2a.").run().unwrap();
		let Node::Ref(idx) = root else {
			panic!("expected a shared reference");
		};
		assert!(idx >= DUP_MEMO_BASE);
		assert!(matches!(
			&memo[&idx].node,
			Node::List(items) if matches!(items.as_slice(), [Node::Ref(i)] if *i == idx)
		));
	}

	#[test]
	fn text_memo_indexes_are_signed_sizes() {
		assert_eq!(parse_memo_index(b"12"), Ok(12));
		assert_eq!(
			parse_memo_index(b"9223372036854775808"),
			Err(Error::MemoIndexOverflow)
		);
		assert_eq!(
			parse_memo_index(b"99999999999999999999"),
			Err(Error::MemoIndexOverflow)
		);
		assert!(matches!(parse_memo_index(b"x"), Err(Error::InvalidLiteral(_))));
		assert_eq!(
			Machine::new(b"Np9223372036854775808\n.").run().err(),
			Some(Error::MemoIndexOverflow)
		);
	}

	#[test]
	fn dup_entries_do_not_shift_memoize_indexes() {
		// EMPTY_LIST, DUP, POP, MEMOIZE, then BINGET 0.
		let (root, memo) = Machine::new(b"\x80\x04]20\x94h\x00.").run().unwrap();
		assert!(matches!(root, Node::Ref(0)));
		assert!(matches!(memo.get(&0), Some(Entry { node: Node::Ref(_), .. })));
	}

	#[test]
	fn nesting_beyond_limit_is_rejected() {
		let mut input = vec![EMPTY_LIST; DEPTH_LIMIT + 2];
		input.extend(std::iter::repeat(APPEND).take(DEPTH_LIMIT + 1));
		input.push(STOP);
		assert_eq!(
			Machine::new(&input).run().err(),
			Some(Error::DepthLimitExceeded)
		);
	}

	#[test]
	fn pop_consumes_an_empty_mark() {
		let (root, _) = Machine::new(b"N(0.").run().unwrap();
		assert!(matches!(root, Node::None));
	}
}
