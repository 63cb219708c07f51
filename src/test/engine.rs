use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::{
    BlockFunc, CompileError, CompiledScript, FunctionPool, HatSpec, Opcode, Script, ScriptCompiler,
};
use crate::engine::{Engine, HatType, BACKDROP, BROADCAST_OPTION, KEY_OPTION};
use crate::entity::{Block, BlockId, Broadcast, Field, Input, Mutation};
use crate::process::{EngineRequest, Process};
use crate::runtime::{SeededRandom, SharedList, SharedValue, Value};
use crate::target::{Target, TargetRef};

use super::{assert_values_eq, cell, ManualClock};

const fn w(op: Opcode) -> u32 {
    op as u32
}

fn make_engine(tick: u64) -> Engine {
    let mut engine = Engine::new();
    engine.set_clock(Box::new(ManualClock::new(tick)));
    engine.set_random(Rc::new(RefCell::new(SeededRandom::new(7))));
    engine
}

fn hat_block(id: &str, opcode: &str, fields: &[(&str, &str)]) -> Block {
    let mut block = Block::new(id, opcode);
    block.top_level = true;
    for (name, value) in fields {
        block.fields.push(Field::new(name, (*value).into()));
    }
    block
}

fn target_with_hat(name: &str, opcode: &str, fields: &[(&str, &str)]) -> (TargetRef, BlockId) {
    let mut target = Target::new_sprite(name);
    let block = target.add_block(hat_block("hat", opcode, fields));
    (Rc::new(RefCell::new(target)), block)
}

fn stage() -> TargetRef {
    Rc::new(RefCell::new(Target::new_stage("Stage")))
}

/// Registers a hand-assembled script for a target's hat block.
fn attach_script(
    engine: &mut Engine,
    target: &TargetRef,
    block: BlockId,
    bytecode: Vec<u32>,
    constants: Vec<Value>,
    variables: Vec<SharedValue>,
    functions: Vec<BlockFunc>,
) -> Rc<Script> {
    let lists: Vec<SharedList> = Vec::new();
    let procedures: Vec<Rc<[u32]>> = Vec::new();
    let script = Rc::new(Script::new(
        target.clone(),
        block,
        Rc::from(bytecode.as_slice()),
        Rc::from(constants.as_slice()),
        Rc::from(variables.as_slice()),
        Rc::from(lists.as_slice()),
        Rc::from(functions.as_slice()),
        Rc::from(procedures.as_slice()),
    ));
    engine.add_script(script.clone());
    script
}

/// `change v by 1` then finish.
fn counting_bytecode() -> Vec<u32> {
    vec![w(Opcode::Const), 0, w(Opcode::ChangeVar), 0, w(Opcode::Halt)]
}

/// `forever { change v by 1 }`, yielding every iteration: stays alive across steps.
fn forever_bytecode() -> Vec<u32> {
    vec![
        w(Opcode::BreakAtomic),
        w(Opcode::ForeverLoop),
        w(Opcode::Const), 0,
        w(Opcode::ChangeVar), 0,
        w(Opcode::LoopEnd),
        w(Opcode::Halt),
    ]
}

#[test]
fn test_green_flag_restart_policy() {
    let mut engine = make_engine(0);
    let v = cell(0);
    let (sprite, block) = target_with_hat("A", "event_whenflagclicked", &[]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    attach_script(&mut engine, &sprite, block, forever_bytecode(), vec![1.into()], vec![v.clone()], vec![]);
    engine.add_green_flag_script(&sprite, block);

    let first = engine.start_hats(HatType::GreenFlag, &[], None);
    assert_eq!(engine.thread_count(), 1);
    let second = engine.start_hats(HatType::GreenFlag, &[], None);
    assert_eq!(engine.thread_count(), 1);
    assert!(!Rc::ptr_eq(&first[0], &second[0]));
    // The replaced thread was killed in place.
    first[0].borrow_mut().run();
    assert!(first[0].borrow().at_end());
}

#[test]
fn test_clone_init_hat_does_not_restart() {
    let mut engine = make_engine(0);
    let v = cell(0);
    let (sprite, block) = target_with_hat("A", "control_start_as_clone", &[]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    attach_script(&mut engine, &sprite, block, forever_bytecode(), vec![1.into()], vec![v.clone()], vec![]);
    engine.add_clone_init_script(&sprite, block);

    let first = engine.start_hats(HatType::CloneInit, &[], Some(&sprite));
    assert_eq!(first.len(), 1);
    let second = engine.start_hats(HatType::CloneInit, &[], Some(&sprite));
    assert!(second.is_empty());
    assert_eq!(engine.thread_count(), 1);
    assert!(Rc::ptr_eq(&first[0], &engine.threads()[0]));
}

#[test]
fn test_broadcast_dispatch_order_and_running() {
    let mut engine = make_engine(0);
    let broadcast = Rc::new(Broadcast::new("b1", "foo", false));
    engine.set_broadcasts(vec![broadcast.clone()]);

    let va = cell(0);
    let vb = cell(0);
    let (a, block_a) = target_with_hat("A", "event_whenbroadcastreceived", &[(BROADCAST_OPTION, "foo")]);
    let (b, block_b) = target_with_hat("B", "event_whenbroadcastreceived", &[(BROADCAST_OPTION, "foo")]);
    {
        a.borrow_mut().set_layer_order(1);
        b.borrow_mut().set_layer_order(2);
    }
    engine.set_targets(vec![stage(), a.clone(), b.clone()]);
    attach_script(&mut engine, &a, block_a, counting_bytecode(), vec![1.into()], vec![va.clone()], vec![]);
    attach_script(&mut engine, &b, block_b, counting_bytecode(), vec![1.into()], vec![vb.clone()], vec![]);
    engine.add_broadcast_script(&a, block_a, &broadcast);
    engine.add_broadcast_script(&b, block_b, &broadcast);

    engine.broadcast(0);
    assert_eq!(engine.thread_count(), 2);
    // Hats fire in reverse executable-target order: B's thread is pushed first.
    assert!(Rc::ptr_eq(engine.threads()[0].borrow().target(), &b));
    assert!(Rc::ptr_eq(engine.threads()[1].borrow().target(), &a));
    assert!(engine.broadcast_running(0));

    engine.step();
    assert_values_eq(&va.borrow(), &Value::Integer(1), 0.0, "va");
    assert_values_eq(&vb.borrow(), &Value::Integer(1), 0.0, "vb");
    assert!(!engine.broadcast_running(0));
    // Negative and out-of-range indices are rejected quietly.
    assert!(!engine.broadcast_running(-1));
    engine.broadcast(-1);
    engine.broadcast(7);
    assert_eq!(engine.thread_count(), 0);
}

#[test]
fn test_backdrop_broadcast() {
    let mut engine = make_engine(0);
    let backdrop = Rc::new(Broadcast::new("bd1", "sunset", true));
    engine.set_broadcasts(vec![backdrop.clone()]);

    let v = cell(0);
    let (sprite, block) =
        target_with_hat("A", "event_whenbackdropswitchesto", &[(BACKDROP, "sunset")]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    attach_script(&mut engine, &sprite, block, counting_bytecode(), vec![1.into()], vec![v.clone()], vec![]);
    engine.add_backdrop_change_script(&sprite, block);

    engine.start_backdrop_scripts(&backdrop);
    assert_eq!(engine.thread_count(), 1);
    assert!(engine.broadcast_by_ptr_running(&backdrop));

    engine.step();
    assert_values_eq(&v.borrow(), &Value::Integer(1), 0.0, "v");
    assert!(!engine.broadcast_by_ptr_running(&backdrop));
}

#[test]
fn test_clone_limit() {
    let mut engine = make_engine(0);
    engine.set_clone_limit(2);
    let sprite = {
        let (sprite, _) = target_with_hat("A", "event_whenflagclicked", &[]);
        sprite
    };
    engine.set_targets(vec![stage(), sprite.clone()]);

    for _ in 0..3 {
        let clone = Target::make_clone(&sprite).unwrap();
        engine.init_clone(clone);
    }
    assert_eq!(engine.clone_count(), 2);
    assert_eq!(engine.executable_targets().len(), 4);

    let first_clone = sprite.borrow().sprite().unwrap().clones[0].clone();
    engine.delete_clone(&first_clone);
    assert_eq!(engine.clone_count(), 1);
    assert_eq!(engine.executable_targets().len(), 3);

    engine.delete_clones();
    assert_eq!(engine.clone_count(), 0);
    assert_eq!(engine.executable_targets().len(), 2);
    assert!(sprite.borrow().sprite().unwrap().clones.is_empty());
}

#[test]
fn test_clone_init_fires_on_clone_with_root_hats() {
    let mut engine = make_engine(0);
    let v = cell(0);
    let (sprite, block) = target_with_hat("A", "control_start_as_clone", &[]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    attach_script(&mut engine, &sprite, block, counting_bytecode(), vec![1.into()], vec![v.clone()], vec![]);
    engine.add_clone_init_script(&sprite, block);

    let clone = Target::make_clone(&sprite).unwrap();
    assert!(clone.borrow().is_clone());
    engine.init_clone(clone.clone());
    assert_eq!(engine.thread_count(), 1);
    assert!(Rc::ptr_eq(engine.threads()[0].borrow().target(), &clone));

    engine.step();
    assert_values_eq(&v.borrow(), &Value::Integer(1), 0.0, "v");
}

#[test]
fn test_clone_copies_state() {
    let (sprite, _) = target_with_hat("A", "event_whenflagclicked", &[]);
    sprite.borrow_mut().add_variable(crate::runtime::Variable::new("v1", "score", 5.into()));
    sprite.borrow_mut().sprite_mut().unwrap().x = 12.0;

    let clone = Target::make_clone(&sprite).unwrap();
    {
        let c = clone.borrow();
        assert_eq!(c.sprite().unwrap().x, 12.0);
        assert_values_eq(&c.variables()[0].get(), &Value::Integer(5), 0.0, "copied value");
    }
    // The clone's variables are fresh cells, not aliases.
    clone.borrow().variables()[0].set(9.into());
    assert_values_eq(&sprite.borrow().variables()[0].get(), &Value::Integer(5), 0.0, "original value");

    // A clone of a clone still roots at the original.
    let grandclone = Target::make_clone(&clone).unwrap();
    assert!(Rc::ptr_eq(&grandclone.borrow().clone_root().unwrap(), &sprite));
}

#[test]
fn test_layer_operations() {
    let mut engine = make_engine(0);
    let s = stage();
    let sprites: Vec<TargetRef> = (0..3)
        .map(|i| {
            let (t, _) = target_with_hat(&format!("S{}", i), "event_whenflagclicked", &[]);
            t.borrow_mut().set_layer_order(i + 1);
            t
        })
        .collect();
    engine.set_targets(vec![s, sprites[0].clone(), sprites[1].clone(), sprites[2].clone()]);

    let order = |engine: &Engine| -> Vec<String> {
        engine.executable_targets().iter().map(|t| t.borrow().name().to_owned()).collect()
    };

    engine.move_sprite_to_front(&sprites[0]);
    assert_eq!(order(&engine), ["Stage", "S1", "S2", "S0"]);
    engine.move_sprite_to_back(&sprites[2]);
    assert_eq!(order(&engine), ["Stage", "S2", "S1", "S0"]);
    engine.move_sprite_forward_layers(&sprites[2], 1);
    assert_eq!(order(&engine), ["Stage", "S1", "S2", "S0"]);
    engine.move_sprite_backward_layers(&sprites[0], 99);
    assert_eq!(order(&engine), ["Stage", "S0", "S1", "S2"]);
    engine.move_sprite_behind_other(&sprites[2], &sprites[1]);
    assert_eq!(order(&engine), ["Stage", "S0", "S2", "S1"]);

    // layer_order always matches the executable index.
    for (i, target) in engine.executable_targets().iter().enumerate().skip(1) {
        assert_eq!(target.borrow().layer_order(), i as i32);
    }

    // front-back-front ends with the sprite at the very front.
    engine.move_sprite_to_front(&sprites[0]);
    engine.move_sprite_to_back(&sprites[0]);
    engine.move_sprite_to_front(&sprites[0]);
    assert_eq!(order(&engine).last().unwrap(), "S0");
}

#[test]
fn test_key_dispatch() {
    let mut engine = make_engine(0);
    let v = cell(0);
    let (sprite, block) = target_with_hat("A", "event_whenkeypressed", &[(KEY_OPTION, "space")]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    attach_script(&mut engine, &sprite, block, counting_bytecode(), vec![1.into()], vec![v.clone()], vec![]);
    engine.add_key_press_script(&sprite, block);

    engine.set_key_state("space", true);
    assert_eq!(engine.thread_count(), 1);
    assert!(engine.key_pressed("space"));
    assert!(engine.key_pressed("any"));

    // Holding the key is not a new press, and an unfinished thread blocks a restart anyway.
    engine.set_key_state("space", true);
    assert_eq!(engine.thread_count(), 1);

    engine.step();
    assert_values_eq(&v.borrow(), &Value::Integer(1), 0.0, "v");
    assert_eq!(engine.thread_count(), 0);

    engine.set_key_state("space", false);
    assert!(!engine.key_pressed("space"));
    assert!(!engine.key_pressed("any"));
    // " " normalizes to the same key name, and releasing made this a fresh press.
    engine.set_key_state(" ", true);
    assert_eq!(engine.thread_count(), 1);

    // Alias normalization.
    engine.set_key_state("ArrowUp", true);
    assert!(engine.key_pressed("up arrow"));
}

fn prim_redraw_and_yield(vm: &mut Process) -> usize {
    vm.request_redraw();
    vm.set_stop();
    0
}

#[test]
fn test_redraw_preemption_and_turbo() {
    // Three primitives in a row, each requesting a redraw and yielding.
    let bytecode = vec![
        w(Opcode::Const), 0, w(Opcode::ChangeVar), 0,
        w(Opcode::Exec), 0,
        w(Opcode::Const), 0, w(Opcode::ChangeVar), 0,
        w(Opcode::Exec), 0,
        w(Opcode::Const), 0, w(Opcode::ChangeVar), 0,
        w(Opcode::Halt),
    ];

    // Without turbo mode, the redraw request ends the step after one pass.
    let mut engine = make_engine(0);
    let v = cell(0);
    let (sprite, block) = target_with_hat("A", "event_whenflagclicked", &[]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    attach_script(&mut engine, &sprite, block, bytecode.clone(), vec![1.into()], vec![v.clone()], vec![prim_redraw_and_yield]);
    engine.add_green_flag_script(&sprite, block);
    engine.start();
    engine.step();
    assert_values_eq(&v.borrow(), &Value::Integer(1), 0.0, "one slice per step");
    engine.step();
    assert_values_eq(&v.borrow(), &Value::Integer(2), 0.0, "second slice");

    // With turbo mode the whole script runs in one step.
    let mut engine = make_engine(0);
    let v = cell(0);
    let (sprite, block) = target_with_hat("A", "event_whenflagclicked", &[]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    attach_script(&mut engine, &sprite, block, bytecode, vec![1.into()], vec![v.clone()], vec![prim_redraw_and_yield]);
    engine.add_green_flag_script(&sprite, block);
    engine.set_turbo_mode_enabled(true);
    engine.start();
    engine.step();
    assert_values_eq(&v.borrow(), &Value::Integer(3), 0.0, "whole script in one step");
    assert_eq!(engine.thread_count(), 0);
}

fn prim_count_and_yield(vm: &mut Process) -> usize {
    let cell = vm.script().variables()[0].clone();
    let sum = cell.borrow().add(&Value::Integer(1));
    *cell.borrow_mut() = sum;
    vm.set_stop();
    0
}

#[test]
fn test_work_budget_limits_passes() {
    // The clock advances 10 virtual ms per read; the 30 fps work budget is 24 ms, so a step
    // fits two passes. Each pass runs one primitive (which stops the script without ending
    // the thread's step eligibility).
    let mut engine = make_engine(10);
    let v = cell(0);
    let (sprite, block) = target_with_hat("A", "event_whenflagclicked", &[]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    let bytecode = vec![
        w(Opcode::Exec), 0,
        w(Opcode::Exec), 0,
        w(Opcode::Exec), 0,
        w(Opcode::Exec), 0,
        w(Opcode::Exec), 0,
        w(Opcode::Halt),
    ];
    attach_script(&mut engine, &sprite, block, bytecode, vec![], vec![v.clone()], vec![prim_count_and_yield]);
    engine.add_green_flag_script(&sprite, block);
    engine.start();
    engine.step();
    assert_eq!(engine.thread_count(), 1);
    assert!(!engine.threads()[0].borrow().at_end());
    assert_values_eq(&v.borrow(), &Value::Integer(2), 0.0, "two passes fit the budget");
}

#[test]
fn test_redraw_handler_called_once_per_step() {
    let calls = Rc::new(RefCell::new(0));
    let mut engine = make_engine(0);
    let c = calls.clone();
    engine.set_redraw_handler(Box::new(move || *c.borrow_mut() += 1));
    engine.set_targets(vec![stage()]);
    engine.step();
    engine.step();
    assert_eq!(*calls.borrow(), 2);
}

fn prim_stop_all(vm: &mut Process) -> usize {
    vm.request(EngineRequest::StopAll);
    0
}

#[test]
fn test_stop_from_script_lets_others_finish_the_pass() {
    let mut engine = make_engine(0);
    let va = cell(0);
    let vb = cell(0);
    let (a, block_a) = target_with_hat("A", "event_whenflagclicked", &[]);
    let (b, block_b) = target_with_hat("B", "event_whenflagclicked", &[]);
    engine.set_targets(vec![stage(), a.clone(), b.clone()]);
    let stopper = vec![w(Opcode::Exec), 0, w(Opcode::Const), 0, w(Opcode::ChangeVar), 0, w(Opcode::Halt)];
    attach_script(&mut engine, &a, block_a, stopper, vec![1.into()], vec![va.clone()], vec![prim_stop_all]);
    attach_script(&mut engine, &b, block_b, forever_bytecode(), vec![1.into()], vec![vb.clone()], vec![]);
    engine.add_green_flag_script(&a, block_a);
    engine.add_green_flag_script(&b, block_b);

    engine.start();
    assert_eq!(engine.thread_count(), 2);
    engine.step();
    // B ran its slice of the pass, then the stop swept it away despite being unfinished.
    assert_values_eq(&vb.borrow(), &Value::Integer(1), 0.0, "vb");
    assert_values_eq(&va.borrow(), &Value::Integer(1), 0.0, "va");
    assert_eq!(engine.thread_count(), 0);
    assert!(!engine.is_running());
}

#[test]
fn test_stop_from_outside_clears_everything() {
    let mut engine = make_engine(0);
    let v = cell(0);
    let (sprite, block) = target_with_hat("A", "event_whenflagclicked", &[]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    attach_script(&mut engine, &sprite, block, forever_bytecode(), vec![1.into()], vec![v.clone()], vec![]);
    engine.add_green_flag_script(&sprite, block);
    engine.start();
    assert!(engine.is_running());
    engine.stop();
    assert_eq!(engine.thread_count(), 0);
    assert!(!engine.is_running());
}

#[test]
fn test_run_until_project_stops() {
    let mut engine = make_engine(1);
    let v = cell(0);
    let (sprite, block) = target_with_hat("A", "event_whenflagclicked", &[]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    attach_script(
        &mut engine,
        &sprite,
        block,
        vec![
            w(Opcode::BreakAtomic),
            w(Opcode::Const), 0,
            w(Opcode::RepeatLoop),
            w(Opcode::Const), 1,
            w(Opcode::ChangeVar), 0,
            w(Opcode::LoopEnd),
            w(Opcode::Halt),
        ],
        vec![3.into(), 1.into()],
        vec![v.clone()],
        vec![],
    );
    engine.add_green_flag_script(&sprite, block);

    engine.run();
    assert!(!engine.is_running());
    assert_eq!(engine.thread_count(), 0);
    assert_values_eq(&v.borrow(), &Value::Integer(3), 0.0, "v");
}

#[test]
fn test_start_script_null_block() {
    let mut engine = make_engine(0);
    let (sprite, _) = target_with_hat("A", "event_whenflagclicked", &[]);
    engine.set_targets(vec![stage(), sprite.clone()]);
    assert!(engine.start_script(None, &sprite).is_none());
}

#[test]
fn test_timer() {
    let mut engine = make_engine(5);
    engine.timer_reset();
    assert_eq!(engine.timer_elapsed_ms(), 5);
}

struct TestCompiler {
    v: SharedValue,
}

impl ScriptCompiler for TestCompiler {
    fn compile(
        &mut self,
        _functions: &mut FunctionPool,
        target: &TargetRef,
        top_block: BlockId,
    ) -> Result<CompiledScript, CompileError> {
        let opcode = target.borrow().block(top_block).opcode.clone();
        match opcode.as_str() {
            // Every script of a target shares the compiler's constant/variable tables, so a
            // procedure body can run under its caller's tables.
            "event_whenflagclicked" => Ok(CompiledScript {
                bytecode: vec![w(Opcode::InitProcedure), w(Opcode::CallProcedure), 0, w(Opcode::Halt)],
                constants: vec![42.into()],
                variables: vec![self.v.clone()],
                procedure_codes: vec!["do thing".to_owned()],
                hat: Some(HatSpec::GreenFlag),
                ..Default::default()
            }),
            "procedures_definition" => Ok(CompiledScript {
                bytecode: vec![w(Opcode::Const), 0, w(Opcode::SetVar), 0, w(Opcode::Halt)],
                constants: vec![42.into()],
                variables: vec![self.v.clone()],
                ..Default::default()
            }),
            opcode => Err(CompileError::UnsupportedOpcode { opcode: opcode.to_owned() }),
        }
    }
}

#[test]
fn test_compile_links_procedures_and_hats() {
    let mut engine = make_engine(0);
    let v = cell(0);

    let sprite = {
        let mut target = Target::new_sprite("A");

        let mut hat = Block::new("flag", "event_whenflagclicked");
        hat.top_level = true;
        target.add_block(hat);

        let mut definition = Block::new("def", "procedures_definition");
        definition.top_level = true;
        let mut input = Input::new("custom_block");
        input.value_block_id = Some("proto".to_owned());
        definition.inputs.push(input);
        target.add_block(definition);

        let mut prototype = Block::new("proto", "procedures_prototype");
        prototype.shadow = true;
        prototype.mutation = Some(Mutation { proc_code: "do thing".to_owned() });
        target.add_block(prototype);

        let mut unsupported = Block::new("say", "looks_sayforsecs");
        unsupported.top_level = true;
        target.add_block(unsupported);

        Rc::new(RefCell::new(target))
    };
    engine.set_targets(vec![stage(), sprite.clone()]);

    engine.compile(&mut TestCompiler { v: v.clone() });

    // Resolution wired the definition's input to the prototype block.
    {
        let t = sprite.borrow();
        let def = t.find_block("def").unwrap();
        assert_eq!(t.block(def).find_input("custom_block").unwrap().value_block, t.find_block("proto"));
    }

    engine.start();
    assert_eq!(engine.thread_count(), 1);
    engine.step();
    assert_values_eq(&v.borrow(), &Value::Integer(42), 0.0, "v");
    assert_eq!(engine.thread_count(), 0);
}

#[test]
fn test_target_model() {
    use crate::target::{Costume, RotationStyle, Sound};

    let mut target = Target::new_sprite("Cat");
    assert!(!target.is_stage());
    assert_eq!(target.add_costume(Costume::new("idle", "svg")), 0);
    assert_eq!(target.add_costume(Costume::new("walk", "png")), 1);
    assert_eq!(target.find_costume("walk"), Some(1));
    target.set_current_costume(1);
    assert_eq!(target.current_costume(), 1);

    assert_eq!(target.add_sound(Sound::new("meow", "wav")), 0);
    assert_eq!(target.find_sound("meow"), Some(0));
    assert_eq!(target.find_sound("bark"), None);

    target.add_variable(crate::runtime::Variable::new("v1", "score", 0.into()));
    assert_eq!(target.find_variable("score"), Some(0));
    assert_eq!(target.find_variable_by_id("v1"), Some(0));
    target.add_list(crate::runtime::List::new("l1", "items"));
    assert_eq!(target.find_list("items"), Some(0));
    assert_eq!(target.find_list_by_id("l1"), Some(0));

    for style in ["all around", "left-right", "don't rotate"] {
        assert_eq!(RotationStyle::from_str(style).as_str(), style);
    }
    assert_eq!(RotationStyle::from_str("bogus"), RotationStyle::AllAround);
}

#[test]
fn test_set_targets_sorts_by_layer_order() {
    let mut engine = make_engine(0);
    let s = stage();
    let (a, _) = target_with_hat("A", "event_whenflagclicked", &[]);
    let (b, _) = target_with_hat("B", "event_whenflagclicked", &[]);
    a.borrow_mut().set_layer_order(2);
    b.borrow_mut().set_layer_order(1);
    engine.set_targets(vec![a.clone(), s.clone(), b.clone()]);
    let names: Vec<String> =
        engine.executable_targets().iter().map(|t| t.borrow().name().to_owned()).collect();
    assert_eq!(names, ["Stage", "B", "A"]);
    assert_eq!(engine.find_target("_stage_"), Some(1));
    assert!(engine.stage().is_some());
}
