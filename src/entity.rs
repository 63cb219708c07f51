//! The block data model: per-target block arenas, inputs, fields, and broadcasts.
//!
//! Blocks reference each other cyclically (parent/next/inputs), so each target stores its
//! blocks in a flat arena addressed by [`BlockId`]. Loaders fill in the raw string IDs from the
//! project file; [`Engine::resolve_ids`](crate::engine::Engine::resolve_ids) then resolves every
//! reference into an index or handle exactly once. Unresolved IDs simply stay `None`.

use std::rc::Rc;

use crate::runtime::{SharedList, Value, Variable};

/// Index of a block within its owning target's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockId(pub usize);

/// A resolved reference to a named entity, as produced by ID resolution.
#[derive(Clone, Debug)]
pub enum EntityRef {
    /// A block in the same target's arena.
    Block(BlockId),
    Variable(Variable),
    List(SharedList),
    Broadcast(Rc<Broadcast>),
}

/// A named event. Broadcasts whose name matches a backdrop name act as backdrop-change
/// triggers instead of ordinary broadcasts; the two namespaces are disjoint in the hat index.
#[derive(Clone, Debug)]
pub struct Broadcast {
    id: String,
    name: String,
    is_backdrop_broadcast: bool,
}

impl Broadcast {
    pub fn new(id: &str, name: &str, is_backdrop_broadcast: bool) -> Self {
        Self { id: id.to_owned(), name: name.to_owned(), is_backdrop_broadcast }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn is_backdrop_broadcast(&self) -> bool {
        self.is_backdrop_broadcast
    }
}

/// A named input slot on a block: an optional plugged-in value block plus a primary and
/// secondary value entity (e.g. the variable behind a dropped-in variable reporter).
#[derive(Clone, Debug, Default)]
pub struct Input {
    pub name: String,
    /// Raw ID of the block plugged into this input, as read from the project file.
    pub value_block_id: Option<String>,
    /// Resolved form of [`value_block_id`](Input::value_block_id).
    pub value_block: Option<BlockId>,
    pub primary_id: Option<String>,
    pub primary: Option<EntityRef>,
    pub secondary_id: Option<String>,
    pub secondary: Option<EntityRef>,
}

impl Input {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_owned(), ..Default::default() }
    }
}

/// A named field on a block: a literal value plus an optional entity reference and an optional
/// special-value ID assigned by the block catalogue.
#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub value: Value,
    pub value_id: Option<String>,
    pub entity: Option<EntityRef>,
    pub special_id: Option<i32>,
}

impl Field {
    pub fn new(name: &str, value: Value) -> Self {
        Self { name: name.to_owned(), value, value_id: None, entity: None, special_id: None }
    }
}

/// Custom-block metadata attached to `procedures_prototype` blocks.
#[derive(Clone, Debug)]
pub struct Mutation {
    /// The procedure code, e.g. `"jump %s times"`. Bytecode references procedures by this code.
    pub proc_code: String,
}

/// One block of a target's block graph.
#[derive(Clone, Debug)]
pub struct Block {
    pub id: String,
    pub opcode: String,
    pub top_level: bool,
    pub shadow: bool,
    pub parent_id: Option<String>,
    pub parent: Option<BlockId>,
    pub next_id: Option<String>,
    pub next: Option<BlockId>,
    pub inputs: Vec<Input>,
    pub fields: Vec<Field>,
    pub comment_id: Option<String>,
    pub mutation: Option<Mutation>,
}

impl Block {
    pub fn new(id: &str, opcode: &str) -> Self {
        Self {
            id: id.to_owned(),
            opcode: opcode.to_owned(),
            top_level: false,
            shadow: false,
            parent_id: None,
            parent: None,
            next_id: None,
            next: None,
            inputs: Vec::new(),
            fields: Vec::new(),
            comment_id: None,
            mutation: None,
        }
    }

    pub fn find_input(&self, name: &str) -> Option<&Input> {
        self.inputs.iter().find(|x| x.name == name)
    }
    pub fn find_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|x| x.name == name)
    }
}
