// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! End-to-end interpreter scenarios: dispatch, blocks, non-local
//! return, does-not-understand and collection pressure.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{Outcome, execute, prim};
use crate::bytecode::{op, special};
use crate::cache::lookup_method;
use crate::fixtures::{Literal, MethodBuilder, World};
use crate::object::Oop;
use crate::object::layout::process;

/// Install `Block>>value` and `Block>>value:` over the invocation
/// primitive, the way the bootstrap image defines them.
fn install_block_protocol(world: &mut World) {
    let block_class = world.class_named("Block");

    let mut value = MethodBuilder::new(6, 0);
    value
        .op(op::PUSH_ARGUMENT, 0)
        .primitive(1, prim::BLOCK_INVOKE)
        .op(op::PUSH_CONSTANT, 10)
        .special(special::STACK_RETURN);
    let value = value.finish(world, "value", block_class);
    world.install_method(block_class, "value", value);

    let mut value_one = MethodBuilder::new(6, 0);
    value_one
        .op(op::PUSH_ARGUMENT, 0)
        .op(op::PUSH_ARGUMENT, 1)
        .primitive(2, prim::BLOCK_INVOKE)
        .op(op::PUSH_CONSTANT, 10)
        .special(special::STACK_RETURN);
    let value_one = value_one.finish(world, "value:", block_class);
    world.install_method(block_class, "value:", value_one);
}

/// A top-level method sending `selector` to its receiver and
/// returning the answer.
fn send_to_receiver_method(world: &mut World, selector: &str) -> Oop {
    let mut builder = MethodBuilder::new(8, 0);
    let lit = builder.literal(Literal::Symbol(String::from(selector)));
    builder
        .op(op::PUSH_ARGUMENT, 0)
        .op(op::MARK_ARGUMENTS, 1)
        .op(op::SEND_MESSAGE, lit)
        .special(special::STACK_RETURN);
    let owner = world.class_named("Object");
    builder.finish(world, "driver", owner)
}

#[test]
fn integer_addition_returns_seven() {
    let mut world = World::new();
    let mut builder = MethodBuilder::new(4, 0);
    builder
        .op(op::PUSH_CONSTANT, 3)
        .op(op::PUSH_CONSTANT, 4)
        .op(op::SEND_BINARY, 2)
        .special(special::STACK_RETURN);
    let owner = world.class_named("Object");
    let target = builder.finish(&mut world, "sum", owner);
    let proc_obj = world.new_process(target);
    assert_eq!(world.run_to_result(proc_obj), Oop::small(7));
}

#[test]
fn dispatch_walks_the_class_chain() {
    let mut world = World::new();
    let object_class = world.class_named("Object");
    let class_a = world.new_class("A", object_class);
    let class_b = world.new_class("B", class_a);

    let mut m = MethodBuilder::new(4, 0);
    let lit = m.literal(Literal::Small(42));
    m.op(op::PUSH_LITERAL, lit).special(special::STACK_RETURN);
    let m = m.finish(&mut world, "m", class_a);
    world.install_method(class_a, "m", m);

    let driver = send_to_receiver_method(&mut world, "m");
    let receiver = world.instance_of(class_b, 0);
    let proc_obj = world.new_process_with_receiver(driver, receiver);
    assert_eq!(world.run_to_result(proc_obj), Oop::small(42));
}

#[test]
fn overriding_method_wins() {
    let mut world = World::new();
    let object_class = world.class_named("Object");
    let class_a = world.new_class("A", object_class);
    let class_b = world.new_class("B", class_a);

    let mut inherited = MethodBuilder::new(4, 0);
    inherited
        .op(op::PUSH_CONSTANT, 1)
        .special(special::STACK_RETURN);
    let inherited = inherited.finish(&mut world, "m", class_a);
    world.install_method(class_a, "m", inherited);

    let mut own = MethodBuilder::new(4, 0);
    own.op(op::PUSH_CONSTANT, 2).special(special::STACK_RETURN);
    let own = own.finish(&mut world, "m", class_b);
    world.install_method(class_b, "m", own);

    let driver = send_to_receiver_method(&mut world, "m");
    let receiver = world.instance_of(class_b, 0);
    let proc_obj = world.new_process_with_receiver(driver, receiver);
    assert_eq!(world.run_to_result(proc_obj), Oop::small(2));
}

#[test]
fn super_send_starts_above_the_owner() {
    let mut world = World::new();
    let object_class = world.class_named("Object");
    let class_a = world.new_class("A", object_class);
    let class_b = world.new_class("B", class_a);

    let mut base = MethodBuilder::new(4, 0);
    let lit = base.literal(Literal::Small(11));
    base.op(op::PUSH_LITERAL, lit)
        .special(special::STACK_RETURN);
    let base = base.finish(&mut world, "m", class_a);
    world.install_method(class_a, "m", base);

    // B>>m: ^ super m + 1
    let mut over = MethodBuilder::new(8, 0);
    let sel = over.literal(Literal::Symbol(String::from("m")));
    over.op(op::PUSH_ARGUMENT, 0).op(op::MARK_ARGUMENTS, 1);
    over.special(special::SEND_TO_SUPER).byte(sel);
    over.op(op::PUSH_CONSTANT, 1)
        .primitive(2, prim::SMALL_ADD)
        .special(special::STACK_RETURN);
    let over = over.finish(&mut world, "m", class_b);
    world.install_method(class_b, "m", over);

    let driver = send_to_receiver_method(&mut world, "m");
    let receiver = world.instance_of(class_b, 0);
    let proc_obj = world.new_process_with_receiver(driver, receiver);
    assert_eq!(world.run_to_result(proc_obj), Oop::small(12));
}

#[test]
fn does_not_understand_receives_the_selector() {
    let mut world = World::new();
    let object_class = world.class_named("Object");
    let class_a = world.new_class("A", object_class);

    // A>>doesNotUnderstand: ^ the selector argument
    let mut handler = MethodBuilder::new(4, 0);
    handler
        .op(op::PUSH_ARGUMENT, 1)
        .special(special::STACK_RETURN);
    let handler = handler.finish(&mut world, "doesNotUnderstand:", class_a);
    world.install_method(class_a, "doesNotUnderstand:", handler);

    let driver = send_to_receiver_method(&mut world, "zzz");
    let receiver = world.instance_of(class_a, 0);
    let proc_obj = world.new_process_with_receiver(driver, receiver);
    let result = world.run_to_result(proc_obj);

    let zzz = world.symbol("zzz");
    assert_eq!(result, zzz, "handler must see the original selector");
}

#[test]
fn unhandled_selector_is_a_bad_method_result() {
    let mut world = World::new();
    let driver = send_to_receiver_method(&mut world, "zzz");
    let object_class = world.class_named("Object");
    let receiver = world.instance_of(object_class, 0);
    let proc_obj = world.new_process_with_receiver(driver, receiver);

    let outcome = world.run(proc_obj, 0).unwrap();
    assert_eq!(outcome, Outcome::BadMethod);
    let recorded = world.vm.memory.field(proc_obj, process::RESULT);
    let zzz = world.symbol("zzz");
    assert_eq!(recorded, zzz, "result slot names the unknown selector");
    // The context chain survives for a back-trace.
    let ctx = world.vm.memory.field(proc_obj, process::CONTEXT);
    assert_ne!(ctx, world.vm.nil());
    let trace = super::backtrace(&world.vm, ctx);
    assert!(trace.contains("driver"));
}

#[test]
fn block_returns_through_the_value_send() {
    let mut world = World::new();
    install_block_protocol(&mut world);
    let object_class = world.class_named("Object");
    let class_a = world.new_class("A", object_class);

    // A>>m: ^ [ 5 ] value
    let mut m = MethodBuilder::new(8, 1);
    let value_sel = m.literal(Literal::Symbol(String::from("value")));
    let skip = m.push_block(0);
    m.op(op::PUSH_CONSTANT, 5).special(special::STACK_RETURN);
    m.patch(skip);
    m.op(op::MARK_ARGUMENTS, 1)
        .op(op::SEND_MESSAGE, value_sel)
        .special(special::STACK_RETURN);
    let m = m.finish(&mut world, "m", class_a);
    world.install_method(class_a, "m", m);

    let driver = send_to_receiver_method(&mut world, "m");
    let receiver = world.instance_of(class_a, 0);
    let proc_obj = world.new_process_with_receiver(driver, receiver);
    assert_eq!(world.run_to_result(proc_obj), Oop::small(5));
}

#[test]
fn block_argument_lands_in_shared_temporaries() {
    let mut world = World::new();
    install_block_protocol(&mut world);
    let object_class = world.class_named("Object");
    let class_a = world.new_class("A", object_class);

    // A>>m: ^ [ :x | x ] value: 9
    let mut m = MethodBuilder::new(8, 1);
    let value_sel = m.literal(Literal::Symbol(String::from("value:")));
    let skip = m.push_block(0);
    m.op(op::PUSH_TEMPORARY, 0).special(special::STACK_RETURN);
    m.patch(skip);
    m.op(op::PUSH_CONSTANT, 9)
        .op(op::MARK_ARGUMENTS, 2)
        .op(op::SEND_MESSAGE, value_sel)
        .special(special::STACK_RETURN);
    let m = m.finish(&mut world, "m", class_a);
    world.install_method(class_a, "m", m);

    let driver = send_to_receiver_method(&mut world, "m");
    let receiver = world.instance_of(class_a, 0);
    let proc_obj = world.new_process_with_receiver(driver, receiver);
    assert_eq!(world.run_to_result(proc_obj), Oop::small(9));
}

#[test]
fn non_local_return_unwinds_the_home_method() {
    let mut world = World::new();
    install_block_protocol(&mut world);
    let object_class = world.class_named("Object");
    let class_a = world.new_class("A", object_class);

    // A>>m: [ ^ 42 ] value. ^ 7
    // The block's return short-circuits m itself.
    let mut m = MethodBuilder::new(8, 1);
    let forty_two = m.literal(Literal::Small(42));
    let value_sel = m.literal(Literal::Symbol(String::from("value")));
    let skip = m.push_block(0);
    m.op(op::PUSH_LITERAL, forty_two)
        .special(special::BLOCK_RETURN);
    m.patch(skip);
    m.op(op::MARK_ARGUMENTS, 1)
        .op(op::SEND_MESSAGE, value_sel)
        .special(special::POP_TOP)
        .op(op::PUSH_CONSTANT, 7)
        .special(special::STACK_RETURN);
    let m = m.finish(&mut world, "m", class_a);
    world.install_method(class_a, "m", m);

    let driver = send_to_receiver_method(&mut world, "m");
    let receiver = world.instance_of(class_a, 0);
    let proc_obj = world.new_process_with_receiver(driver, receiver);
    assert_eq!(world.run_to_result(proc_obj), Oop::small(42));
}

#[test]
fn escaped_block_return_fails_as_bad_method() {
    let mut world = World::new();
    install_block_protocol(&mut world);
    let object_class = world.class_named("Object");
    let class_a = world.new_class("A", object_class);

    // A>>mk: ^ [ ^ 42 ]  -- the block outlives its home method.
    let mut mk = MethodBuilder::new(8, 1);
    let forty_two = mk.literal(Literal::Small(42));
    let skip = mk.push_block(0);
    mk.op(op::PUSH_LITERAL, forty_two)
        .special(special::BLOCK_RETURN);
    mk.patch(skip);
    mk.special(special::STACK_RETURN);
    let mk = mk.finish(&mut world, "mk", class_a);
    world.install_method(class_a, "mk", mk);

    // driver: ^ (receiver mk) value
    let mut driver = MethodBuilder::new(8, 0);
    let mk_sel = driver.literal(Literal::Symbol(String::from("mk")));
    let value_sel = driver.literal(Literal::Symbol(String::from("value")));
    driver
        .op(op::PUSH_ARGUMENT, 0)
        .op(op::MARK_ARGUMENTS, 1)
        .op(op::SEND_MESSAGE, mk_sel)
        .op(op::MARK_ARGUMENTS, 1)
        .op(op::SEND_MESSAGE, value_sel)
        .special(special::STACK_RETURN);
    let driver = driver.finish(&mut world, "driver", object_class);

    let receiver = world.instance_of(class_a, 0);
    let proc_obj = world.new_process_with_receiver(driver, receiver);
    assert_eq!(world.run(proc_obj, 0).unwrap(), Outcome::BadMethod);
}

#[test]
fn repeated_send_resolves_through_the_cache() {
    let mut world = World::new();
    let object_class = world.class_named("Object");
    let class_a = world.new_class("A", object_class);

    let mut m = MethodBuilder::new(4, 0);
    m.op(op::PUSH_CONSTANT, 1).special(special::STACK_RETURN);
    let m = m.finish(&mut world, "m", class_a);
    world.install_method(class_a, "m", m);

    // driver: receiver m. ^ receiver m
    let mut driver = MethodBuilder::new(8, 0);
    let sel = driver.literal(Literal::Symbol(String::from("m")));
    driver
        .op(op::PUSH_ARGUMENT, 0)
        .op(op::MARK_ARGUMENTS, 1)
        .op(op::SEND_MESSAGE, sel)
        .special(special::POP_TOP)
        .op(op::PUSH_ARGUMENT, 0)
        .op(op::MARK_ARGUMENTS, 1)
        .op(op::SEND_MESSAGE, sel)
        .special(special::STACK_RETURN);
    let driver = driver.finish(&mut world, "driver", object_class);

    let receiver = world.instance_of(class_a, 0);
    let proc_obj = world.new_process_with_receiver(driver, receiver);

    world.vm.cache.flush();
    world.vm.cache.hits = 0;
    world.vm.cache.misses = 0;
    assert_eq!(world.run_to_result(proc_obj), Oop::small(1));
    assert_eq!(
        (world.vm.cache.hits, world.vm.cache.misses),
        (1, 1),
        "second identical send must hit"
    );
}

#[test]
fn collection_flushes_the_cache() {
    let mut world = World::new();
    let object_class = world.class_named("Object");
    let class_a = world.new_class("A", object_class);

    let mut m = MethodBuilder::new(4, 0);
    m.op(op::PUSH_CONSTANT, 1).special(special::STACK_RETURN);
    let m = m.finish(&mut world, "m", class_a);
    world.install_method(class_a, "m", m);

    let sel = world.symbol("m");
    let nil = world.vm.nil();
    world.vm.cache.hits = 0;
    world.vm.cache.misses = 0;
    world
        .vm
        .cache
        .lookup(&world.vm.memory, nil, sel, class_a)
        .unwrap();
    world
        .vm
        .cache
        .lookup(&world.vm.memory, nil, sel, class_a)
        .unwrap();
    assert_eq!((world.vm.cache.hits, world.vm.cache.misses), (1, 1));

    world.vm.collect();

    // Everything moved and the stale cache was dropped: the same
    // lookup (through the refreshed references) misses again.
    let class_a = world.class_named("A");
    let sel = world.symbol("m");
    let nil = world.vm.nil();
    world
        .vm
        .cache
        .lookup(&world.vm.memory, nil, sel, class_a)
        .unwrap();
    assert_eq!(
        (world.vm.cache.hits, world.vm.cache.misses),
        (1, 2),
        "first send after a collection is a miss"
    );
}

#[test]
fn allocation_pressure_completes_without_growth() {
    let mut world = World::with_heap(6000);
    let object_class = world.class_named("Object");

    // loop: 10000 timesRepeat: [ Array new: 100 ]
    let mut looper = MethodBuilder::new(8, 1);
    let limit = looper.literal(Literal::Small(10_000));
    let array_cls = looper.literal(Literal::Global(String::from("Array")));
    let hundred = looper.literal(Literal::Small(100));
    looper
        .op(op::PUSH_CONSTANT, 0)
        .op(op::ASSIGN_TEMPORARY, 0)
        .special(special::POP_TOP);
    let head = looper.here();
    looper
        .op(op::PUSH_TEMPORARY, 0)
        .op(op::PUSH_LITERAL, limit)
        .op(op::SEND_BINARY, 0);
    let out = looper.branch_forward(special::BRANCH_IF_FALSE);
    looper
        .op(op::PUSH_LITERAL, array_cls)
        .op(op::PUSH_LITERAL, hundred)
        .primitive(2, prim::NEW_OBJECT)
        .special(special::POP_TOP)
        .op(op::PUSH_TEMPORARY, 0)
        .op(op::PUSH_CONSTANT, 1)
        .primitive(2, prim::SMALL_ADD)
        .op(op::ASSIGN_TEMPORARY, 0)
        .special(special::POP_TOP)
        .branch_to(special::BRANCH, head);
    looper.patch(out);
    looper
        .op(op::PUSH_TEMPORARY, 0)
        .special(special::STACK_RETURN);
    let looper = looper.finish(&mut world, "pressure", object_class);
    world.install_method(object_class, "pressure", looper);

    world.vm.collect();
    let baseline = world.vm.memory.object_census();

    // Ten rounds of the same loop; the live set must not creep.
    for _ in 0..10 {
        // Re-derive everything after prior collections.
        let object_class = world.class_named("Object");
        let sel = world.symbol("pressure");
        let nil = world.vm.nil();
        let target = lookup_method(&world.vm.memory, nil, object_class, sel).unwrap();
        let receiver = world.instance_of(object_class, 0);
        let proc_obj = world.new_process_with_receiver(target, receiver);

        world.vm.memory.push_root(proc_obj).unwrap();
        let outcome = execute(&mut world.vm, 0).unwrap();
        assert_eq!(outcome, Outcome::Returned);
        let proc_obj = world.vm.memory.pop_root();
        assert_eq!(
            world.vm.memory.field(proc_obj, process::RESULT),
            Oop::small(10_000)
        );
    }

    assert!(
        world.vm.memory.stats().count > 10,
        "the loop must force collections"
    );
    world.vm.collect();
    let after = world.vm.memory.object_census();
    assert!(
        after <= baseline + 8,
        "live set grew: {baseline} -> {after}"
    );
}
