//! The stage/sprite model: targets own blocks, variables, lists, costumes, and sounds.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::entity::{Block, BlockId};
use crate::runtime::{List, SharedList, Variable};

/// Shared handle to a target. Targets are owned by the engine and referenced by scripts,
/// threads, and clone lineage.
pub type TargetRef = Rc<RefCell<Target>>;

/// How a sprite's costume follows its direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationStyle {
    AllAround,
    LeftRight,
    DoNotRotate,
}

impl RotationStyle {
    /// Parses the project-file spelling; unknown text falls back to [`RotationStyle::AllAround`].
    pub fn from_str(s: &str) -> Self {
        match s {
            "left-right" => RotationStyle::LeftRight,
            "don't rotate" => RotationStyle::DoNotRotate,
            _ => RotationStyle::AllAround,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStyle::AllAround => "all around",
            RotationStyle::LeftRight => "left-right",
            RotationStyle::DoNotRotate => "don't rotate",
        }
    }
}

/// A costume. Only the metadata the runtime needs; pixel data lives with the renderer.
#[derive(Clone, Debug)]
pub struct Costume {
    pub name: String,
    pub data_format: String,
    /// Reciprocal of the scaling factor for bitmap costumes.
    pub bitmap_resolution: f64,
    pub rotation_center_x: i32,
    pub rotation_center_y: i32,
}

impl Costume {
    pub fn new(name: &str, data_format: &str) -> Self {
        Self {
            name: name.to_owned(),
            data_format: data_format.to_owned(),
            bitmap_resolution: 1.0,
            rotation_center_x: 0,
            rotation_center_y: 0,
        }
    }
}

/// A sound. Metadata only, as with [`Costume`].
#[derive(Clone, Debug)]
pub struct Sound {
    pub name: String,
    pub data_format: String,
    pub rate: u32,
    pub sample_count: u32,
}

impl Sound {
    pub fn new(name: &str, data_format: &str) -> Self {
        Self { name: name.to_owned(), data_format: data_format.to_owned(), rate: 0, sample_count: 0 }
    }
}

/// Sprite-only state.
#[derive(Clone, Debug)]
pub struct SpriteState {
    pub visible: bool,
    pub x: f64,
    pub y: f64,
    pub size: f64,
    pub direction: f64,
    pub draggable: bool,
    pub rotation_style: RotationStyle,
    /// The original sprite this clone was made from; `None` for originals.
    pub clone_root: Option<Weak<RefCell<Target>>>,
    /// The sprite (original or clone) this clone was made from.
    pub clone_parent: Option<Weak<RefCell<Target>>>,
    /// Live clones made from this sprite.
    pub clones: Vec<TargetRef>,
}

impl Default for SpriteState {
    fn default() -> Self {
        Self {
            visible: true,
            x: 0.0,
            y: 0.0,
            size: 100.0,
            direction: 90.0,
            draggable: false,
            rotation_style: RotationStyle::AllAround,
            clone_root: None,
            clone_parent: None,
            clones: Vec::new(),
        }
    }
}

/// Discriminates the stage from sprites and carries the sprite-only payload.
#[derive(Clone, Debug)]
pub enum TargetKind {
    Stage,
    Sprite(SpriteState),
}

/// A sprite or the stage.
#[derive(Debug)]
pub struct Target {
    name: String,
    variables: Vec<Variable>,
    lists: Vec<SharedList>,
    blocks: Vec<Block>,
    costumes: Vec<Costume>,
    current_costume: i32,
    sounds: Vec<Sound>,
    layer_order: i32,
    volume: f64,
    kind: TargetKind,
}

impl Target {
    pub fn new_stage(name: &str) -> Self {
        Self::new(name, TargetKind::Stage)
    }
    pub fn new_sprite(name: &str) -> Self {
        Self::new(name, TargetKind::Sprite(SpriteState::default()))
    }
    fn new(name: &str, kind: TargetKind) -> Self {
        Self {
            name: name.to_owned(),
            variables: Vec::new(),
            lists: Vec::new(),
            blocks: Vec::new(),
            costumes: Vec::new(),
            current_costume: 0,
            sounds: Vec::new(),
            layer_order: 0,
            volume: 100.0,
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn is_stage(&self) -> bool {
        matches!(self.kind, TargetKind::Stage)
    }
    pub fn sprite(&self) -> Option<&SpriteState> {
        match &self.kind {
            TargetKind::Sprite(s) => Some(s),
            TargetKind::Stage => None,
        }
    }
    pub fn sprite_mut(&mut self) -> Option<&mut SpriteState> {
        match &mut self.kind {
            TargetKind::Sprite(s) => Some(s),
            TargetKind::Stage => None,
        }
    }
    pub fn is_clone(&self) -> bool {
        self.sprite().map(|s| s.clone_root.is_some()).unwrap_or(false)
    }

    /// Adds a variable and returns its index.
    pub fn add_variable(&mut self, variable: Variable) -> usize {
        self.variables.push(variable);
        self.variables.len() - 1
    }
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }
    pub fn variable_at(&self, index: usize) -> Option<&Variable> {
        self.variables.get(index)
    }
    pub fn find_variable(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name() == name)
    }
    pub fn find_variable_by_id(&self, id: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.id() == id)
    }

    /// Adds a list and returns its index.
    pub fn add_list(&mut self, list: List) -> usize {
        self.lists.push(Rc::new(RefCell::new(list)));
        self.lists.len() - 1
    }
    pub fn lists(&self) -> &[SharedList] {
        &self.lists
    }
    pub fn list_at(&self, index: usize) -> Option<&SharedList> {
        self.lists.get(index)
    }
    pub fn find_list(&self, name: &str) -> Option<usize> {
        self.lists.iter().position(|l| l.borrow().name() == name)
    }
    pub fn find_list_by_id(&self, id: &str) -> Option<usize> {
        self.lists.iter().position(|l| l.borrow().id() == id)
    }

    /// Adds a block to the arena and returns its id.
    pub fn add_block(&mut self, block: Block) -> BlockId {
        self.blocks.push(block);
        BlockId(self.blocks.len() - 1)
    }
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0]
    }
    pub fn find_block(&self, id: &str) -> Option<BlockId> {
        self.blocks.iter().position(|b| b.id == id).map(BlockId)
    }

    pub fn add_costume(&mut self, costume: Costume) -> usize {
        self.costumes.push(costume);
        self.costumes.len() - 1
    }
    pub fn costumes(&self) -> &[Costume] {
        &self.costumes
    }
    pub fn find_costume(&self, name: &str) -> Option<usize> {
        self.costumes.iter().position(|c| c.name == name)
    }
    pub fn current_costume(&self) -> i32 {
        self.current_costume
    }
    pub fn set_current_costume(&mut self, index: i32) {
        self.current_costume = index;
    }

    pub fn add_sound(&mut self, sound: Sound) -> usize {
        self.sounds.push(sound);
        self.sounds.len() - 1
    }
    pub fn sounds(&self) -> &[Sound] {
        &self.sounds
    }
    pub fn find_sound(&self, name: &str) -> Option<usize> {
        self.sounds.iter().position(|s| s.name == name)
    }

    pub fn layer_order(&self) -> i32 {
        self.layer_order
    }
    pub fn set_layer_order(&mut self, order: i32) {
        self.layer_order = order;
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }
    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume;
    }

    /// The original sprite behind a clone, or `None` for originals (and the stage).
    pub fn clone_root(&self) -> Option<TargetRef> {
        self.sprite().and_then(|s| s.clone_root.as_ref()).and_then(Weak::upgrade)
    }

    /// Creates a clone of `parent` and records its lineage. Returns `None` for the stage.
    ///
    /// The clone copies the sprite state and the current values of variables and lists into
    /// fresh cells; the block catalog is not copied — scripts (and hats) are always looked up
    /// on the clone's root.
    pub fn make_clone(parent: &TargetRef) -> Option<TargetRef> {
        let root = {
            let p = parent.borrow();
            let state = p.sprite()?;
            match state.clone_root.as_ref().and_then(Weak::upgrade) {
                Some(root) => root,
                None => parent.clone(),
            }
        };

        let clone = {
            let p = parent.borrow();
            let state = p.sprite().expect("clone parent is a sprite");
            Target {
                name: p.name.clone(),
                variables: p.variables.iter().map(|v| Variable::new(v.id(), v.name(), v.get())).collect(),
                lists: p.lists.iter().map(|l| Rc::new(RefCell::new(l.borrow().clone()))).collect(),
                blocks: Vec::new(),
                costumes: p.costumes.clone(),
                current_costume: p.current_costume,
                sounds: p.sounds.clone(),
                layer_order: p.layer_order,
                volume: p.volume,
                kind: TargetKind::Sprite(SpriteState {
                    clone_root: Some(Rc::downgrade(&root)),
                    clone_parent: Some(Rc::downgrade(parent)),
                    clones: Vec::new(),
                    ..state.clone()
                }),
            }
        };

        let clone = Rc::new(RefCell::new(clone));
        if let Some(state) = parent.borrow_mut().sprite_mut() {
            state.clones.push(clone.clone());
        }
        Some(clone)
    }

    /// Removes `clone` from its parent's lineage bookkeeping.
    pub fn unlink_clone(clone: &TargetRef) {
        let parent = clone
            .borrow()
            .sprite()
            .and_then(|s| s.clone_parent.as_ref())
            .and_then(Weak::upgrade);
        if let Some(parent) = parent {
            if let Some(state) = parent.borrow_mut().sprite_mut() {
                state.clones.retain(|c| !Rc::ptr_eq(c, clone));
            }
        }
    }
}
