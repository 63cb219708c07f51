//! The engine: target and broadcast registries, hat dispatch, the thread list, clone and
//! layer management, frame-paced stepping, and the event loop.
//!
//! One *step* runs passes over the thread list until the work budget (75% of the frame
//! duration) runs out, no thread makes progress, or a redraw is requested (unless turbo mode
//! is on); the redraw handler then runs exactly once. The event loop repeats steps, sleeping
//! out the remainder of each frame through the injected [`Clock`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, warn};

use crate::bytecode::{CompileError, CompiledScript, FunctionPool, HatSpec, Opcode, Script, ScriptCompiler};
use crate::entity::{BlockId, Broadcast, EntityRef};
use crate::process::{EngineRequest, Process};
use crate::runtime::{Clock, SharedRandom, StdRandom, SteadyClock, Variable};
use crate::target::{Target, TargetRef};

/// Default maximum number of live clones.
pub const DEFAULT_CLONE_LIMIT: i32 = 300;

const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_STAGE_WIDTH: u32 = 480;
const DEFAULT_STAGE_HEIGHT: u32 = 360;

/// Field name carrying the broadcast name on "when I receive" hats.
pub const BROADCAST_OPTION: &str = "BROADCAST_OPTION";
/// Field name carrying the key name on "when key pressed" hats.
pub const KEY_OPTION: &str = "KEY_OPTION";
/// Field name carrying the backdrop name on "when backdrop switches" hats.
pub const BACKDROP: &str = "BACKDROP";

/// A running script thread.
pub type ThreadRef = Rc<RefCell<Process>>;

/// The events that can begin a script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HatType {
    GreenFlag,
    BroadcastReceived,
    BackdropChanged,
    CloneInit,
    KeyPressed,
}

/// Whether re-triggering a hat kills an already running thread (true) or is ignored while one
/// runs (false).
fn hat_restarts_existing(hat: HatType) -> bool {
    match hat {
        HatType::GreenFlag | HatType::BroadcastReceived | HatType::BackdropChanged => true,
        HatType::CloneInit | HatType::KeyPressed => false,
    }
}

/// Cloneable handle that makes the event loop exit after its current step, usable from
/// another thread while the engine itself is borrowed by the loop.
#[derive(Clone)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Per-hat-type mapping from target to its registered scripts, in registration order.
/// Targets are few, so a vector of pairs beats a hash map here.
#[derive(Default)]
struct HatMap(Vec<(TargetRef, Vec<Rc<Script>>)>);

impl HatMap {
    fn add(&mut self, target: &TargetRef, script: &Rc<Script>) {
        match self.0.iter_mut().find(|(t, _)| Rc::ptr_eq(t, target)) {
            Some((_, scripts)) => {
                if !scripts.iter().any(|s| Rc::ptr_eq(s, script)) {
                    scripts.push(script.clone());
                }
            }
            None => self.0.push((target.clone(), vec![script.clone()])),
        }
    }
    fn get(&self, target: &TargetRef) -> &[Rc<Script>] {
        self.0
            .iter()
            .find(|(t, _)| Rc::ptr_eq(t, target))
            .map(|(_, scripts)| scripts.as_slice())
            .unwrap_or(&[])
    }
    fn contains(&self, target: &TargetRef, script: &Rc<Script>) -> bool {
        self.get(target).iter().any(|s| Rc::ptr_eq(s, script))
    }
}

/// The execution engine. Owns targets, clones, broadcasts, compiled scripts, threads, and all
/// scheduling state.
pub struct Engine {
    targets: Vec<TargetRef>,
    /// All targets eligible for execution, clones included, with the stage pinned at index 0.
    /// The array order is the layer order.
    executable_targets: Vec<TargetRef>,
    clones: Vec<TargetRef>,

    broadcasts: Vec<Rc<Broadcast>>,
    /// Broadcast subscriber lists, used by [`Engine::broadcast_running`].
    broadcast_map: Vec<(Rc<Broadcast>, Vec<Rc<Script>>)>,

    scripts: Vec<Rc<Script>>,
    functions: FunctionPool,

    green_flag_hats: HatMap,
    broadcast_hats: HatMap,
    backdrop_change_hats: HatMap,
    clone_init_hats: HatMap,
    key_pressed_hats: HatMap,

    threads: Vec<ThreadRef>,
    threads_to_stop: Vec<ThreadRef>,
    active_thread: Option<ThreadRef>,

    clock: Box<dyn Clock>,
    random: SharedRandom,
    timer_start_ms: u64,

    fps: f64,
    frame_duration_ms: u64,
    turbo_mode: bool,
    redraw_requested: bool,
    redraw_handler: Option<Box<dyn FnMut()>>,
    running: bool,
    stop_event_loop: Arc<AtomicBool>,

    clone_limit: i32,
    sprite_fencing: bool,
    stage_width: u32,
    stage_height: u32,

    key_map: HashMap<String, bool>,
    any_key_pressed: bool,
    mouse_x: f64,
    mouse_y: f64,
    mouse_pressed: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        let mut engine = Self {
            targets: Vec::new(),
            executable_targets: Vec::new(),
            clones: Vec::new(),
            broadcasts: Vec::new(),
            broadcast_map: Vec::new(),
            scripts: Vec::new(),
            functions: FunctionPool::new(),
            green_flag_hats: HatMap::default(),
            broadcast_hats: HatMap::default(),
            backdrop_change_hats: HatMap::default(),
            clone_init_hats: HatMap::default(),
            key_pressed_hats: HatMap::default(),
            threads: Vec::new(),
            threads_to_stop: Vec::new(),
            active_thread: None,
            clock: Box::new(SteadyClock::new()),
            random: Rc::new(RefCell::new(StdRandom::new())),
            timer_start_ms: 0,
            fps: DEFAULT_FPS,
            frame_duration_ms: 0,
            turbo_mode: false,
            redraw_requested: false,
            redraw_handler: None,
            running: false,
            stop_event_loop: Arc::new(AtomicBool::new(false)),
            clone_limit: DEFAULT_CLONE_LIMIT,
            sprite_fencing: true,
            stage_width: DEFAULT_STAGE_WIDTH,
            stage_height: DEFAULT_STAGE_HEIGHT,
            key_map: HashMap::new(),
            any_key_pressed: false,
            mouse_x: 0.0,
            mouse_y: 0.0,
            mouse_pressed: false,
        };
        engine.update_frame_duration();
        engine
    }

    // --- injectable services ---------------------------------------------------------------

    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }
    pub fn set_random(&mut self, random: SharedRandom) {
        self.random = random;
    }

    // --- configuration ---------------------------------------------------------------------

    pub fn fps(&self) -> f64 {
        self.fps
    }
    pub fn set_fps(&mut self, fps: f64) {
        if fps <= 0.0 {
            warn!("ignoring invalid fps {}", fps);
            return;
        }
        self.fps = fps;
        self.update_frame_duration();
    }
    pub fn turbo_mode_enabled(&self) -> bool {
        self.turbo_mode
    }
    pub fn set_turbo_mode_enabled(&mut self, turbo: bool) {
        self.turbo_mode = turbo;
    }
    pub fn clone_limit(&self) -> i32 {
        self.clone_limit
    }
    /// Sets the clone limit; any negative value means unlimited.
    pub fn set_clone_limit(&mut self, limit: i32) {
        self.clone_limit = if limit < 0 { -1 } else { limit };
    }
    pub fn clone_count(&self) -> usize {
        self.clones.len()
    }
    pub fn sprite_fencing_enabled(&self) -> bool {
        self.sprite_fencing
    }
    pub fn set_sprite_fencing_enabled(&mut self, enable: bool) {
        self.sprite_fencing = enable;
    }
    pub fn stage_width(&self) -> u32 {
        self.stage_width
    }
    pub fn set_stage_width(&mut self, width: u32) {
        self.stage_width = width;
    }
    pub fn stage_height(&self) -> u32 {
        self.stage_height
    }
    pub fn set_stage_height(&mut self, height: u32) {
        self.stage_height = height;
    }
    pub fn set_redraw_handler(&mut self, handler: Box<dyn FnMut()>) {
        self.redraw_handler = Some(handler);
    }
    /// Called by primitives (through their request queue) when the stage must be repainted.
    pub fn request_redraw(&mut self) {
        self.redraw_requested = true;
    }

    fn update_frame_duration(&mut self) {
        self.frame_duration_ms = (1000.0 / self.fps) as u64;
    }

    // --- timer -----------------------------------------------------------------------------

    pub fn timer_reset(&mut self) {
        self.timer_start_ms = self.clock.millis();
    }
    pub fn timer_elapsed_ms(&self) -> u64 {
        self.clock.millis().saturating_sub(self.timer_start_ms)
    }

    // --- target registry -------------------------------------------------------------------

    /// Registers the project's targets and rebuilds the executable order from their layer
    /// numbers (the stage, at layer 0, comes first).
    pub fn set_targets(&mut self, targets: Vec<TargetRef>) {
        self.targets = targets;
        self.executable_targets = self.targets.clone();
        self.executable_targets.sort_by_key(|t| t.borrow().layer_order());
    }
    pub fn targets(&self) -> &[TargetRef] {
        &self.targets
    }
    pub fn executable_targets(&self) -> &[TargetRef] {
        &self.executable_targets
    }
    pub fn target_at(&self, index: i32) -> Option<TargetRef> {
        usize::try_from(index).ok().and_then(|i| self.targets.get(i)).cloned()
    }
    /// The index of the target with the given name; the stage matches `"_stage_"`.
    pub fn find_target(&self, name: &str) -> Option<usize> {
        self.targets.iter().position(|t| {
            let t = t.borrow();
            if t.is_stage() {
                name == "_stage_"
            } else {
                t.name() == name
            }
        })
    }
    pub fn stage(&self) -> Option<TargetRef> {
        self.targets.iter().find(|t| t.borrow().is_stage()).cloned()
    }

    // --- broadcast registry ----------------------------------------------------------------

    pub fn set_broadcasts(&mut self, broadcasts: Vec<Rc<Broadcast>>) {
        self.broadcasts = broadcasts;
    }
    pub fn broadcasts(&self) -> &[Rc<Broadcast>] {
        &self.broadcasts
    }
    pub fn broadcast_at(&self, index: i32) -> Option<Rc<Broadcast>> {
        usize::try_from(index).ok().and_then(|i| self.broadcasts.get(i)).cloned()
    }
    pub fn find_broadcast(&self, name: &str) -> Option<usize> {
        self.broadcasts.iter().position(|b| b.name() == name)
    }
    pub fn find_broadcast_by_id(&self, id: &str) -> Option<usize> {
        self.broadcasts.iter().position(|b| b.id() == id)
    }

    /// Fires "when I receive" hats for the broadcast at `index`; out-of-range (including
    /// negative) indices do nothing.
    pub fn broadcast(&mut self, index: i32) {
        if let Some(broadcast) = self.broadcast_at(index) {
            self.broadcast_by_ptr(&broadcast);
        }
    }
    pub fn broadcast_by_ptr(&mut self, broadcast: &Rc<Broadcast>) {
        let name = broadcast.name().to_owned();
        self.start_hats(HatType::BroadcastReceived, &[(BROADCAST_OPTION, &name)], None);
    }
    /// Fires "when backdrop switches" hats for a backdrop broadcast.
    pub fn start_backdrop_scripts(&mut self, broadcast: &Rc<Broadcast>) {
        let name = broadcast.name().to_owned();
        self.start_hats(HatType::BackdropChanged, &[(BACKDROP, &name)], None);
    }

    /// True while any live thread runs a script subscribed to the broadcast at `index`.
    pub fn broadcast_running(&self, index: i32) -> bool {
        match self.broadcast_at(index) {
            Some(broadcast) => self.broadcast_by_ptr_running(&broadcast),
            None => false,
        }
    }
    pub fn broadcast_by_ptr_running(&self, broadcast: &Rc<Broadcast>) -> bool {
        if broadcast.is_backdrop_broadcast() {
            self.threads.iter().any(|thread| {
                let vm = thread.borrow();
                if vm.at_end() {
                    return false;
                }
                let script = vm.script();
                if !self.backdrop_change_hats.contains(script.target(), script) {
                    return false;
                }
                let target = script.target().borrow();
                let block = target.block(script.top_block());
                block
                    .find_field(BACKDROP)
                    .map(|f| f.value.to_string() == broadcast.name())
                    .unwrap_or(false)
            })
        } else {
            let subscribers = self
                .broadcast_map
                .iter()
                .find(|(b, _)| Rc::ptr_eq(b, broadcast))
                .map(|(_, scripts)| scripts.as_slice())
                .unwrap_or(&[]);
            self.threads.iter().any(|thread| {
                let vm = thread.borrow();
                !vm.at_end() && subscribers.iter().any(|s| Rc::ptr_eq(s, vm.script()))
            })
        }
    }

    // --- keyboard and mouse ----------------------------------------------------------------

    /// Whether the named key is held; `"any"` is true while any key is.
    pub fn key_pressed(&self, name: &str) -> bool {
        let key = normalize_key(name);
        if key == "any" {
            return self.any_key_pressed || self.key_map.values().any(|&v| v);
        }
        self.key_map.get(&key).copied().unwrap_or(false)
    }

    /// Records a key state change; on the transition to pressed, fires "when key pressed"
    /// hats for both the key and `"any"`.
    pub fn set_key_state(&mut self, name: &str, pressed: bool) {
        let key = normalize_key(name);
        let was_pressed = self.key_map.insert(key.clone(), pressed).unwrap_or(false);
        if pressed && !was_pressed {
            self.start_hats(HatType::KeyPressed, &[(KEY_OPTION, &key)], None);
            self.start_hats(HatType::KeyPressed, &[(KEY_OPTION, "any")], None);
        }
    }

    pub fn set_any_key_pressed(&mut self, pressed: bool) {
        let was_pressed = mem::replace(&mut self.any_key_pressed, pressed);
        if pressed && !was_pressed {
            self.start_hats(HatType::KeyPressed, &[(KEY_OPTION, "any")], None);
        }
    }

    pub fn mouse_x(&self) -> f64 {
        self.mouse_x
    }
    pub fn set_mouse_x(&mut self, x: f64) {
        self.mouse_x = x;
    }
    pub fn mouse_y(&self) -> f64 {
        self.mouse_y
    }
    pub fn set_mouse_y(&mut self, y: f64) {
        self.mouse_y = y;
    }
    pub fn mouse_pressed(&self) -> bool {
        self.mouse_pressed
    }
    pub fn set_mouse_pressed(&mut self, pressed: bool) {
        self.mouse_pressed = pressed;
    }

    /// Accepted for interface completeness; there is no hat type for clicks yet.
    pub fn click_target(&mut self, _target: &TargetRef) {}

    // --- ID resolution and compilation -----------------------------------------------------

    /// Resolves every raw string ID in the block graphs into indices and handles. Runs once
    /// at load time; unresolved IDs stay absent.
    pub fn resolve_ids(&mut self) {
        // Entity lookup tables spanning all targets.
        let mut variables: Vec<(String, Variable)> = Vec::new();
        let mut lists = Vec::new();
        for target in &self.targets {
            let t = target.borrow();
            for v in t.variables() {
                variables.push((v.id().to_owned(), v.clone()));
            }
            for l in t.lists() {
                lists.push((l.borrow().id().to_owned(), l.clone()));
            }
        }
        let broadcasts = self.broadcasts.clone();

        for target in &self.targets {
            let block_ids: HashMap<String, BlockId> = {
                let t = target.borrow();
                t.blocks().iter().enumerate().map(|(i, b)| (b.id.clone(), BlockId(i))).collect()
            };
            let resolve_entity = |id: &str| -> Option<EntityRef> {
                if id.is_empty() {
                    return None;
                }
                if let Some(&block) = block_ids.get(id) {
                    return Some(EntityRef::Block(block));
                }
                if let Some((_, v)) = variables.iter().find(|(vid, _)| vid == id) {
                    return Some(EntityRef::Variable(v.clone()));
                }
                if let Some((_, l)) = lists.iter().find(|(lid, _)| lid == id) {
                    return Some(EntityRef::List(l.clone()));
                }
                broadcasts.iter().find(|b| b.id() == id).map(|b| EntityRef::Broadcast(b.clone()))
            };

            let mut t = target.borrow_mut();
            for i in 0..t.blocks().len() {
                let block = t.block_mut(BlockId(i));
                block.parent = block.parent_id.as_deref().and_then(|id| block_ids.get(id)).copied();
                block.next = block.next_id.as_deref().and_then(|id| block_ids.get(id)).copied();
                for input in &mut block.inputs {
                    input.value_block =
                        input.value_block_id.as_deref().and_then(|id| block_ids.get(id)).copied();
                    input.primary = input.primary_id.as_deref().and_then(&resolve_entity);
                    input.secondary = input.secondary_id.as_deref().and_then(&resolve_entity);
                }
                for field in &mut block.fields {
                    field.entity = field.value_id.as_deref().and_then(&resolve_entity);
                }
            }
        }
    }

    /// Deduplicated index of a primitive in the shared function table.
    pub fn function_index(&mut self, f: crate::bytecode::BlockFunc) -> u32 {
        self.functions.index(f)
    }

    /// Compiles every top-level, non-shadow block of every target and links procedure
    /// references. Unsupported top-level blocks are logged and skipped.
    pub fn compile(&mut self, compiler: &mut dyn ScriptCompiler) {
        self.resolve_ids();

        let targets = self.targets.clone();
        for target in &targets {
            let top_blocks: Vec<BlockId> = {
                let t = target.borrow();
                t.blocks()
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| b.top_level && !b.shadow)
                    .map(|(i, _)| BlockId(i))
                    .collect()
            };

            let mut compiled: Vec<(BlockId, CompiledScript, Rc<[u32]>)> = Vec::new();
            for block in top_blocks {
                match compiler.compile(&mut self.functions, target, block) {
                    Ok(cs) => {
                        let bytecode: Rc<[u32]> = Rc::from(cs.bytecode.as_slice());
                        compiled.push((block, cs, bytecode));
                    }
                    Err(CompileError::UnsupportedOpcode { opcode }) => {
                        warn!("unsupported top level block: {}", opcode);
                    }
                }
            }

            // Procedure codes resolve against the bytecode of this target's
            // procedures_definition scripts.
            let mut procedure_map: Vec<(String, Rc<[u32]>)> = Vec::new();
            for (block, _, bytecode) in &compiled {
                let t = target.borrow();
                let def = t.block(*block);
                if def.opcode != "procedures_definition" {
                    continue;
                }
                let prototype = def.find_input("custom_block").and_then(|i| i.value_block);
                let code = prototype.and_then(|p| t.block(p).mutation.as_ref()).map(|m| m.proc_code.clone());
                match code {
                    Some(code) => procedure_map.push((code, bytecode.clone())),
                    None => warn!("procedures_definition without a prototype in target {}", t.name()),
                }
            }

            let functions = self.functions.snapshot();
            for (block, cs, bytecode) in compiled {
                let procedures: Vec<Rc<[u32]>> = cs
                    .procedure_codes
                    .iter()
                    .map(|code| match procedure_map.iter().find(|(c, _)| c == code) {
                        Some((_, bytecode)) => bytecode.clone(),
                        None => {
                            warn!("unknown procedure {:?}; calls to it will do nothing", code);
                            Rc::from([Opcode::Halt as u32].as_slice())
                        }
                    })
                    .collect();
                let script = Rc::new(Script::new(
                    target.clone(),
                    block,
                    bytecode,
                    Rc::from(cs.constants.as_slice()),
                    Rc::from(cs.variables.as_slice()),
                    Rc::from(cs.lists.as_slice()),
                    functions.clone(),
                    Rc::from(procedures.as_slice()),
                ));
                self.add_script(script.clone());
                if let Some(hat) = &cs.hat {
                    self.register_hat(target, &script, hat);
                }
            }
        }
    }

    fn register_hat(&mut self, target: &TargetRef, script: &Rc<Script>, hat: &HatSpec) {
        match hat {
            HatSpec::GreenFlag => self.green_flag_hats.add(target, script),
            HatSpec::BackdropChanged => self.backdrop_change_hats.add(target, script),
            HatSpec::CloneInit => self.clone_init_hats.add(target, script),
            HatSpec::KeyPressed => self.key_pressed_hats.add(target, script),
            HatSpec::BroadcastReceived { broadcast_id } => {
                match self.find_broadcast_by_id(broadcast_id).and_then(|i| self.broadcast_at(i as i32)) {
                    Some(broadcast) => self.link_broadcast_script(target, script, &broadcast),
                    None => warn!("broadcast hat references unknown broadcast {:?}", broadcast_id),
                }
            }
        }
    }

    /// Registers a compiled script. Called by [`Engine::compile`]; exposed so hosts with
    /// their own pipeline can feed scripts in directly.
    pub fn add_script(&mut self, script: Rc<Script>) {
        self.scripts.push(script);
    }

    fn script_for(&self, target: &TargetRef, block: BlockId) -> Option<Rc<Script>> {
        let root = hat_target(target);
        self.scripts
            .iter()
            .find(|s| Rc::ptr_eq(s.target(), &root) && s.top_block() == block)
            .cloned()
    }

    // --- hat registration ------------------------------------------------------------------
    // Hosts with their own compilation pipeline register hats directly; Engine::compile does
    // it from the HatSpec the compiler reports.

    pub fn add_green_flag_script(&mut self, target: &TargetRef, block: BlockId) {
        self.add_hat(HatType::GreenFlag, target, block);
    }
    pub fn add_backdrop_change_script(&mut self, target: &TargetRef, block: BlockId) {
        self.add_hat(HatType::BackdropChanged, target, block);
    }
    pub fn add_clone_init_script(&mut self, target: &TargetRef, block: BlockId) {
        self.add_hat(HatType::CloneInit, target, block);
    }
    pub fn add_key_press_script(&mut self, target: &TargetRef, block: BlockId) {
        self.add_hat(HatType::KeyPressed, target, block);
    }
    pub fn add_broadcast_script(&mut self, target: &TargetRef, block: BlockId, broadcast: &Rc<Broadcast>) {
        debug_assert!(!broadcast.is_backdrop_broadcast());
        match self.script_for(target, block) {
            Some(script) => self.link_broadcast_script(target, &script, broadcast),
            None => warn!("broadcast hat registration for an uncompiled block was dropped"),
        }
    }

    fn add_hat(&mut self, hat: HatType, target: &TargetRef, block: BlockId) {
        match self.script_for(target, block) {
            Some(script) => match hat {
                HatType::GreenFlag => self.green_flag_hats.add(target, &script),
                HatType::BroadcastReceived => self.broadcast_hats.add(target, &script),
                HatType::BackdropChanged => self.backdrop_change_hats.add(target, &script),
                HatType::CloneInit => self.clone_init_hats.add(target, &script),
                HatType::KeyPressed => self.key_pressed_hats.add(target, &script),
            },
            None => warn!("hat registration for an uncompiled block was dropped"),
        }
    }

    fn link_broadcast_script(&mut self, target: &TargetRef, script: &Rc<Script>, broadcast: &Rc<Broadcast>) {
        match self.broadcast_map.iter_mut().find(|(b, _)| Rc::ptr_eq(b, broadcast)) {
            Some((_, scripts)) => {
                if !scripts.iter().any(|s| Rc::ptr_eq(s, script)) {
                    scripts.push(script.clone());
                }
            }
            None => self.broadcast_map.push((broadcast.clone(), vec![script.clone()])),
        }
        self.broadcast_hats.add(target, script);
    }

    fn hat_map(&self, hat: HatType) -> &HatMap {
        match hat {
            HatType::GreenFlag => &self.green_flag_hats,
            HatType::BroadcastReceived => &self.broadcast_hats,
            HatType::BackdropChanged => &self.backdrop_change_hats,
            HatType::CloneInit => &self.clone_init_hats,
            HatType::KeyPressed => &self.key_pressed_hats,
        }
    }

    // --- hat dispatch and threads ----------------------------------------------------------

    /// Fires every hat of the given type whose top block matches `match_fields`, iterating
    /// executable targets in reverse order (or just `opt_target`). Returns the threads that
    /// are now running those scripts.
    pub fn start_hats(
        &mut self,
        hat: HatType,
        match_fields: &[(&str, &str)],
        opt_target: Option<&TargetRef>,
    ) -> Vec<ThreadRef> {
        let targets: Vec<TargetRef> = match opt_target {
            Some(t) => vec![t.clone()],
            None => self.executable_targets.clone(),
        };

        let mut new_threads = Vec::new();
        for target in targets.iter().rev() {
            // Clones fire the hats of their root sprite.
            let scripts: Vec<Rc<Script>> = self.hat_map(hat).get(&hat_target(target)).to_vec();
            'scripts: for script in scripts {
                {
                    let script_target = script.target().borrow();
                    let top = script_target.block(script.top_block());
                    for (name, value) in match_fields {
                        let matched = top.find_field(name).map(|f| f.value.to_string() == *value);
                        if matched != Some(true) {
                            continue 'scripts;
                        }
                    }
                }

                if hat_restarts_existing(hat) {
                    let existing = self.threads.iter().position(|thread| {
                        let vm = thread.borrow();
                        Rc::ptr_eq(vm.script(), &script) && Rc::ptr_eq(vm.target(), target)
                    });
                    if let Some(slot) = existing {
                        new_threads.push(self.restart_thread(slot));
                        continue;
                    }
                } else {
                    let running = self.threads.iter().any(|thread| {
                        let vm = thread.borrow();
                        Rc::ptr_eq(vm.script(), &script) && Rc::ptr_eq(vm.target(), target) && !vm.at_end()
                    });
                    if running {
                        continue;
                    }
                }

                new_threads.push(self.push_thread(&script, target));
            }
        }
        new_threads
    }

    /// Starts a new thread for the script compiled from `top_block` on `target`.
    /// A missing block is a caller bug: logged, and `None` is returned.
    pub fn start_script(&mut self, top_block: Option<BlockId>, target: &TargetRef) -> Option<ThreadRef> {
        let block = match top_block {
            Some(b) => b,
            None => {
                error!("tried to start a script with a null block");
                return None;
            }
        };
        match self.script_for(target, block) {
            Some(script) => Some(self.push_thread(&script, target)),
            None => {
                error!("no compiled script for the given block");
                None
            }
        }
    }

    /// Kills a thread; it is reaped during the next step.
    pub fn stop_script(&mut self, thread: &ThreadRef) {
        thread.borrow_mut().kill();
    }

    /// Kills every thread of `target`, except `except` if given.
    pub fn stop_target(&mut self, target: &TargetRef, except: Option<&ThreadRef>) {
        for thread in &self.threads {
            if except.map(|e| Rc::ptr_eq(e, thread)).unwrap_or(false) {
                continue;
            }
            if Rc::ptr_eq(thread.borrow().target(), target) {
                thread.borrow_mut().kill();
            }
        }
    }

    fn push_thread(&mut self, script: &Rc<Script>, target: &TargetRef) -> ThreadRef {
        let thread = Rc::new(RefCell::new(script.start(target.clone(), self.random.clone())));
        self.threads.push(thread.clone());
        thread
    }

    /// Replaces the thread in `slot` with a fresh invocation of the same script, preserving
    /// the thread order.
    fn restart_thread(&mut self, slot: usize) -> ThreadRef {
        let old = self.threads[slot].clone();
        old.borrow_mut().kill();
        let (script, target) = {
            let vm = old.borrow();
            (vm.script().clone(), vm.target().clone())
        };
        let thread = Rc::new(RefCell::new(script.start(target, self.random.clone())));
        self.threads[slot] = thread.clone();
        thread
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
    pub fn threads(&self) -> &[ThreadRef] {
        &self.threads
    }

    // --- clones ----------------------------------------------------------------------------

    /// Registers a freshly made clone and fires its CloneInit hats. Silently rejected once
    /// the clone limit is reached.
    pub fn init_clone(&mut self, clone: TargetRef) {
        if self.clone_limit >= 0 && self.clones.len() >= self.clone_limit as usize {
            return;
        }
        if !clone.borrow().is_clone() {
            return;
        }
        self.clones.push(clone.clone());
        self.executable_targets.push(clone.clone());
        self.update_sprite_layer_order();
        self.start_hats(HatType::CloneInit, &[], Some(&clone));
    }

    /// Removes a clone from the clone set and the executable targets.
    pub fn delete_clone(&mut self, clone: &TargetRef) {
        self.clones.retain(|c| !Rc::ptr_eq(c, clone));
        self.executable_targets.retain(|t| !Rc::ptr_eq(t, clone));
        Target::unlink_clone(clone);
        self.update_sprite_layer_order();
    }

    /// Removes every clone.
    pub fn delete_clones(&mut self) {
        let clones = mem::take(&mut self.clones);
        for clone in &clones {
            self.executable_targets.retain(|t| !Rc::ptr_eq(t, clone));
            Target::unlink_clone(clone);
        }
        self.update_sprite_layer_order();
    }

    // --- layer order -----------------------------------------------------------------------

    pub fn move_sprite_to_front(&mut self, sprite: &TargetRef) {
        if self.executable_targets.len() <= 2 {
            return;
        }
        if let Some(i) = self.executable_index(sprite) {
            let t = self.executable_targets.remove(i);
            self.executable_targets.push(t);
            self.update_sprite_layer_order();
        }
    }

    pub fn move_sprite_to_back(&mut self, sprite: &TargetRef) {
        if self.executable_targets.len() <= 2 {
            return;
        }
        if let Some(i) = self.executable_index(sprite) {
            let t = self.executable_targets.remove(i);
            // The stage is always first.
            self.executable_targets.insert(1, t);
            self.update_sprite_layer_order();
        }
    }

    /// Moves a sprite `layers` layers forward (toward the front); clamps at the ends.
    pub fn move_sprite_forward_layers(&mut self, sprite: &TargetRef, layers: i32) {
        if layers == 0 {
            return;
        }
        let i = match self.executable_index(sprite) {
            Some(i) => i,
            None => return,
        };
        let dest = i as i64 + layers as i64;
        if dest <= 0 {
            self.move_sprite_to_back(sprite);
        } else if dest >= self.executable_targets.len() as i64 {
            self.move_sprite_to_front(sprite);
        } else {
            let t = self.executable_targets.remove(i);
            self.executable_targets.insert(dest as usize, t);
            self.update_sprite_layer_order();
        }
    }

    pub fn move_sprite_backward_layers(&mut self, sprite: &TargetRef, layers: i32) {
        self.move_sprite_forward_layers(sprite, -layers);
    }

    /// Moves `sprite` directly behind `other`.
    pub fn move_sprite_behind_other(&mut self, sprite: &TargetRef, other: &TargetRef) {
        if Rc::ptr_eq(sprite, other) {
            return;
        }
        let (i, other_i) = match (self.executable_index(sprite), self.executable_index(other)) {
            (Some(a), Some(b)) => (a, b),
            _ => return,
        };
        let mut dest = other_i as i64 - 1;
        if dest < i as i64 {
            dest += 1;
        }
        if dest <= 0 {
            self.move_sprite_to_back(sprite);
        } else if dest >= self.executable_targets.len() as i64 {
            self.move_sprite_to_front(sprite);
        } else {
            let t = self.executable_targets.remove(i);
            self.executable_targets.insert(dest as usize, t);
            self.update_sprite_layer_order();
        }
    }

    fn executable_index(&self, target: &TargetRef) -> Option<usize> {
        self.executable_targets.iter().position(|t| Rc::ptr_eq(t, target))
    }

    fn update_sprite_layer_order(&mut self) {
        debug_assert!(self.executable_targets.first().map(|t| t.borrow().is_stage()).unwrap_or(true));
        for (i, target) in self.executable_targets.iter().enumerate().skip(1) {
            target.borrow_mut().set_layer_order(i as i32);
        }
    }

    // --- lifecycle -------------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Deletes clones, resets the timer, and fires the green-flag hats.
    pub fn start(&mut self) {
        self.delete_clones();
        self.timer_reset();
        self.running = true;
        self.start_hats(HatType::GreenFlag, &[], None);
    }

    /// Stops the project. When called from inside a running script, the active thread is
    /// killed and the remaining threads are scheduled for removal — they still finish the
    /// current pass first, matching the reference runtime (a thread stepped then may even
    /// start new threads, "restarting" the project).
    pub fn stop(&mut self) {
        self.delete_clones();
        match self.active_thread.clone() {
            Some(active) => {
                active.borrow_mut().kill();
                self.threads_to_stop = self.threads.clone();
            }
            None => {
                self.threads.clear();
                self.running = false;
            }
        }
    }

    /// Runs the project from the green flag until no threads remain.
    pub fn run(&mut self) {
        self.start();
        self.event_loop(true);
    }

    /// Runs the event loop until [`StopToken::stop`] is called.
    pub fn run_event_loop(&mut self) {
        self.event_loop(false);
    }

    /// A handle that makes the event loop exit after its current step.
    pub fn stop_token(&self) -> StopToken {
        StopToken(self.stop_event_loop.clone())
    }
    pub fn stop_event_loop(&mut self) {
        self.stop_event_loop.store(true, Ordering::Relaxed);
    }

    fn event_loop(&mut self, until_project_stops: bool) {
        self.update_frame_duration();
        self.stop_event_loop.store(false, Ordering::Relaxed);

        loop {
            let tick_start = self.clock.millis();
            self.step();

            if until_project_stops && self.threads.is_empty() {
                break;
            }
            if self.stop_event_loop.load(Ordering::Relaxed) {
                break;
            }

            let elapsed = self.clock.millis().saturating_sub(tick_start);
            if elapsed < self.frame_duration_ms {
                self.clock.sleep(self.frame_duration_ms - elapsed);
            }
        }

        self.finalize();
    }

    fn finalize(&mut self) {
        self.threads.clear();
        self.threads_to_stop.clear();
        self.running = false;
        self.redraw_requested = false;
    }

    // --- stepping --------------------------------------------------------------------------

    /// One step: reap finished threads, run thread passes within the work budget, then call
    /// the redraw handler exactly once.
    pub fn step(&mut self) {
        // Clean up threads that were told to stop during or since the last step.
        self.threads.retain(|t| !t.borrow().at_end());
        for thread in &self.threads {
            thread.borrow_mut().clear_frame_break();
        }
        self.redraw_requested = false;

        self.step_threads();

        if let Some(handler) = &mut self.redraw_handler {
            handler();
        }
    }

    fn step_threads(&mut self) {
        let work_time = self.frame_duration_ms * 3 / 4;
        debug_assert!(work_time > 0);
        let step_start = self.clock.millis();

        let mut num_active = 1; // greater than zero
        while !self.threads.is_empty()
            && num_active > 0
            && self.clock.millis().saturating_sub(step_start) < work_time
            && (self.turbo_mode || !self.redraw_requested)
        {
            num_active = 0;

            // Attempt to run each thread one time. Threads pushed during the pass run on a
            // later pass of the same step, budget permitting.
            let pass_len = self.threads.len();
            for i in 0..pass_len {
                let thread = self.threads[i].clone();
                {
                    let mut vm = thread.borrow_mut();
                    if vm.at_end() || vm.frame_break() {
                        continue;
                    }
                    self.active_thread = Some(thread.clone());
                    vm.run();
                    if !vm.at_end() && !vm.frame_break() {
                        num_active += 1;
                    }
                }
                let requests = thread.borrow_mut().take_requests();
                self.apply_requests(requests);
                self.active_thread = None;
            }

            // Remove threads scheduled for stopping.
            if !self.threads_to_stop.is_empty() {
                let stopping = mem::take(&mut self.threads_to_stop);
                self.threads.retain(|t| !stopping.iter().any(|s| Rc::ptr_eq(s, t)));
            }

            // Reap finished threads.
            self.threads.retain(|t| !t.borrow().at_end());
        }

        if self.threads.is_empty() {
            self.running = false;
        }
        self.active_thread = None;
    }

    fn apply_requests(&mut self, requests: Vec<EngineRequest>) {
        for request in requests {
            match request {
                EngineRequest::Redraw => self.request_redraw(),
                EngineRequest::Broadcast(name) => {
                    if let Some(index) = self.find_broadcast(&name) {
                        self.broadcast(index as i32);
                    }
                }
                EngineRequest::StartScript { top_block, target } => {
                    self.start_script(Some(top_block), &target);
                }
                EngineRequest::InitClone(clone) => self.init_clone(clone),
                EngineRequest::DeleteClone(clone) => self.delete_clone(&clone),
                EngineRequest::StopTarget(target) => {
                    let except = self.active_thread.clone();
                    self.stop_target(&target, except.as_ref());
                }
                EngineRequest::StopAll => self.stop(),
            }
        }
    }
}

/// The target whose hat index applies: a clone defers to its root sprite.
fn hat_target(target: &TargetRef) -> TargetRef {
    match target.borrow().clone_root() {
        Some(root) => root,
        None => target.clone(),
    }
}

/// Canonicalizes a key name: lowercased, with the arrow/space aliases of the project format.
fn normalize_key(name: &str) -> String {
    let lower = name.to_lowercase();
    match lower.as_str() {
        "arrowup" => "up arrow".to_owned(),
        "arrowdown" => "down arrow".to_owned(),
        "arrowleft" => "left arrow".to_owned(),
        "arrowright" => "right arrow".to_owned(),
        " " => "space".to_owned(),
        _ => lower,
    }
}
