//! End-to-end scenarios driving the interpreter, the iteration protocol,
//! the reducers, and the task primitives together through the public
//! surface, the way an embedder's compiled programs would.

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use minilang_core::error::raise;
    use minilang_core::{Map, Value};
    use minilang_vm::native_fn::NativeFn;
    use minilang_vm::state::{drive, Context, RootState};
    use minilang_vm::{builtins, call_value, iterate};
    use minilang_vm::{Closure, ClosureInfo, Frame, Inst, Opcode, Params, StateRef, Step};

    fn global(name: &str) -> Value {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        builtins::standard_library()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .unwrap_or_else(|| panic!("no builtin named {name}"))
    }

    /// Drives `f(args)` to completion, draining the scheduler, and hands
    /// back the result.
    fn invoke(ctx: &Context, f: Value, args: Vec<Value>) -> Value {
        let root = RootState::new();
        match call_value(root.clone(), ctx, f, args) {
            Step::TailCall(next, v) => drive(ctx, next, v),
            Step::Parked => {}
        }
        ctx.scheduler.run_until_empty(ctx);
        root.result.borrow_mut().take().expect("call did not complete")
    }

    fn int_list(value: &Value) -> Vec<i64> {
        let Value::List(list) = value else { panic!("expected a list, got {value:?}") };
        list.borrow()
            .iter_values()
            .map(|v| match v {
                Value::Int(i) => i,
                other => panic!("expected an integer, got {other:?}"),
            })
            .collect()
    }

    fn list_of(items: Vec<Value>) -> Value {
        let mut list = minilang_core::List::new();
        for item in items {
            list.push_back(item);
        }
        Value::List(Rc::new(RefCell::new(list)))
    }

    #[test]
    fn all_collects_a_range() {
        let ctx = Context::new();
        let result = invoke(&ctx, global("all"), vec![iterate::range(1, 5)]);
        assert_eq!(int_list(&result), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn sum_of_1_to_100() {
        let ctx = Context::new();
        let result = invoke(&ctx, global("sum"), vec![iterate::range(1, 100)]);
        assert_eq!(result, Value::Int(5050));
    }

    #[test]
    fn zipping_symbols_onto_values_builds_an_ordered_map() {
        let ctx = Context::new();
        let keys = list_of(vec![Value::symbol("a"), Value::symbol("b"), Value::symbol("c")]);
        let target = Rc::new(RefCell::new(Map::new()));
        let target_value = Value::Map(target.clone());
        // fn(k, v): map[k] := v, through the assignable node `map[k]`
        // produces.
        let insert = {
            let target_value = target_value.clone();
            NativeFn::new("insert", move |caller, ctx, args| {
                let key = args[0].clone();
                let value = args[1].clone();
                let root = RootState::new();
                let Step::TailCall(_, node) = call_value(root, ctx, target_value.clone(), vec![key]) else {
                    panic!("map indexing is synchronous");
                };
                minilang_vm::assign_value(&node, value);
                Step::TailCall(caller, Value::Some)
            })
        };
        invoke(&ctx, global("group"), vec![keys, iterate::range(1, 3), insert]);
        assert_eq!(target_value.to_string(), "{a=1, b=2, c=3}");
        assert_eq!(target.borrow().search(&Value::symbol("b")), Some(Value::Int(2)));
    }

    #[test]
    fn count_of_unique_values() {
        let ctx = Context::new();
        let items = list_of([1, 1, 2, 3, 3, 3, 4].into_iter().map(Value::Int).collect());
        let uniqued = invoke(&ctx, global("unique"), vec![items]);
        let result = invoke(&ctx, global("count"), vec![uniqued]);
        assert_eq!(result, Value::Int(4));
    }

    #[test]
    fn fold_with_multiplication_is_a_factorial() {
        let ctx = Context::new();
        let mul = NativeFn::new("*", |caller, _ctx, args| {
            let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) else { panic!("expected integers") };
            Step::TailCall(caller, Value::Int(a * b))
        });
        let result = invoke(&ctx, global("fold"), vec![iterate::range(1, 4), mul]);
        assert_eq!(result, Value::Int(24));
    }

    #[test]
    fn sort_with_greater_than_reverses_an_ascending_list() {
        let ctx = Context::new();
        let list = list_of((1..=10).map(Value::Int).collect());
        let gt = NativeFn::new(">", |caller, _ctx, args| {
            let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) else { panic!("expected integers") };
            Step::TailCall(caller, if a > b { Value::Some } else { Value::Nil })
        });
        let sorted = invoke(&ctx, global("sort"), vec![list, gt]);
        assert_eq!(int_list(&sorted), (1..=10).rev().collect::<Vec<_>>());
    }

    #[test]
    fn task_replays_its_value_to_every_waiter() {
        let ctx = Context::new();
        let task = invoke(&ctx, global("task"), vec![]);

        let first = RootState::new();
        let second = RootState::new();
        for waiter in [&first, &second] {
            match call_value(waiter.clone(), &ctx, task.clone(), vec![]) {
                Step::Parked => {}
                _ => panic!("unset task must park its waiters"),
            }
        }

        let done = invoke(&ctx, global("done"), vec![task.clone(), Value::Int(42)]);
        assert_eq!(done, Value::Int(42));
        assert!(matches!(first.result.borrow().as_ref(), Some(Value::Int(42))));
        assert!(matches!(second.result.borrow().as_ref(), Some(Value::Int(42))));

        // A waiter registered after completion sees the same value
        // immediately.
        let late = RootState::new();
        match call_value(late, &ctx, task, vec![]) {
            Step::TailCall(_, Value::Int(42)) => {}
            _ => panic!("completed task must replay its value"),
        }
    }

    #[test]
    fn tasks_never_exceeds_its_running_bound() {
        let ctx = Context::new();
        let running = Rc::new(RefCell::new(0usize));
        let max_seen = Rc::new(RefCell::new(0usize));
        let started = Rc::new(RefCell::new(0usize));
        let parked: Rc<RefCell<VecDeque<StateRef>>> = Rc::new(RefCell::new(VecDeque::new()));

        let child = {
            let (running, max_seen, started, parked) =
                (running.clone(), max_seen.clone(), started.clone(), parked.clone());
            NativeFn::new("child", move |caller, _ctx, _args| {
                *running.borrow_mut() += 1;
                *started.borrow_mut() += 1;
                let now = *running.borrow();
                let mut max = max_seen.borrow_mut();
                *max = (*max).max(now);
                parked.borrow_mut().push_back(caller);
                Step::Parked
            })
        };

        let main = {
            let child = child.clone();
            NativeFn::new("main", move |caller, ctx, args| {
                let set = args[0].clone();
                for _ in 0..5 {
                    match call_value(RootState::new(), ctx, set.clone(), vec![child.clone()]) {
                        Step::TailCall(next, v) => drive(ctx, next, v),
                        Step::Parked => {}
                    }
                }
                Step::TailCall(caller, Value::Nil)
            })
        };

        let root = RootState::new();
        match call_value(root.clone(), &ctx, global("tasks"), vec![Value::Int(2), main]) {
            Step::TailCall(next, v) => drive(&ctx, next, v),
            Step::Parked => {}
        }

        // Complete the parked children one at a time, the way an external
        // event source would; each completion lets the set start the next
        // pending call.
        loop {
            let next = parked.borrow_mut().pop_front();
            let Some(continuation) = next else { break };
            *running.borrow_mut() -= 1;
            drive(&ctx, continuation, Value::Nil);
            ctx.scheduler.run_until_empty(&ctx);
        }

        assert_eq!(*started.borrow(), 5);
        assert!(*max_seen.borrow() <= 2, "ran {} children at once", *max_seen.borrow());
        assert!(matches!(root.result.borrow().as_ref(), Some(Value::Nil)));
    }

    #[test]
    fn try_catch_returns_the_error_as_data() {
        let ctx = Context::new();
        let ret = Inst::new(Opcode::Return, Params::None, 6);
        let read_caught = Inst::new(Opcode::Local, Params::InstIndex(ret, 0), 5);
        let catch = Inst::new(Opcode::Catch, Params::InstIndex(read_caught, 0), 4);
        let after_raise = Inst::new(Opcode::Return, Params::None, 3);
        let boom = Inst::new(Opcode::Load, Params::InstValue(after_raise, raise("E", "msg")), 2);
        let try_body = Inst::new(Opcode::Try, Params::InstPair(boom, catch), 1);

        let root = RootState::new();
        let frame = Frame::new(root.clone(), "scenario".into(), try_body, Vec::new());
        drive(&ctx, frame, Value::Nil);

        let result = root.result.borrow_mut().take().expect("frame did not return");
        // The caught error arrives as inspectable data, not as a
        // propagating error.
        assert!(!result.is_error());
        let Value::Error(e) = result else { panic!("expected the caught error value") };
        assert_eq!(e.borrow().kind, "E");
        assert_eq!(e.borrow().message, "msg");
    }

    /// `fn() suspend 1; suspend 2; suspend 3 end()`: three resumptions
    /// yield 1, 2, 3; the fourth returns nil.
    #[test]
    fn generator_yields_three_values_then_nil() {
        let ret = Inst::new(Opcode::Return, Params::None, 9);
        let finish = Inst::new(Opcode::Nil, Params::Inst(ret), 8);
        let mut resume_to = finish;
        let mut entry = None;
        for value in [3, 2, 1] {
            let resume = Inst::new(Opcode::Resume, Params::Inst(resume_to), 2 * value as u32);
            let suspend = Inst::new(Opcode::Suspend, Params::Inst(resume), 2 * value as u32 - 1);
            let push = Inst::new(Opcode::Push, Params::Inst(suspend), 2 * value as u32 - 1);
            let load = Inst::new(Opcode::Load, Params::InstValue(push, Value::Int(value)), 2 * value as u32 - 1);
            resume_to = load.clone();
            entry = Some(load);
        }

        let generator = Value::Native(Rc::new(Closure {
            info: Rc::new(ClosureInfo {
                entry: entry.unwrap(),
                frame_size: 0,
                arity: 0,
                upvalue_count: 0,
                source: "generator".into(),
                param_names: None,
            }),
            upvalues: Vec::new(),
        }));

        let ctx = Context::new();
        let mut position = invoke(&ctx, generator, vec![]);
        let mut seen = Vec::new();
        while !matches!(position, Value::Nil) {
            let Step::TailCall(_, value) = minilang_vm::iterate::value_value(RootState::new(), &ctx, position.clone())
            else {
                panic!("suspension value reads synchronously")
            };
            seen.push(value);
            position = invoke(&ctx, position, vec![Value::Nil]);
        }
        assert_eq!(seen, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    /// A self-recursive closure counting down through a hundred thousand
    /// tail calls: only possible if the tail-call transform really drops
    /// the frame instead of growing either stack.
    #[test]
    fn repeated_tail_calls_do_not_grow_the_stack() {
        let is_zero = NativeFn::new("is_zero", |caller, _ctx, args| {
            let Value::Int(i) = args[0] else { panic!("expected an integer") };
            Step::TailCall(caller, if i == 0 { Value::Some } else { Value::Nil })
        });
        let dec = NativeFn::new("dec", |caller, _ctx, args| {
            let Value::Int(i) = args[0] else { panic!("expected an integer") };
            Step::TailCall(caller, Value::Int(i - 1))
        });

        let done_ret = Inst::new(Opcode::Return, Params::None, 3);
        let done = Inst::new(Opcode::Load, Params::InstValue(done_ret, Value::string("done")), 3);

        let tail = Inst::new(Opcode::TailCall, Params::Count(1), 5);
        let self_ref = Inst::new(Opcode::Upvalue, Params::InstIndex(tail, 0), 5);
        let push_dec = Inst::new(Opcode::Push, Params::Inst(self_ref), 4);
        let call_dec = Inst::new(Opcode::ConstCall, Params::InstCountValue(push_dec, 1, dec), 4);
        let push_n2 = Inst::new(Opcode::Push, Params::Inst(call_dec), 4);
        let recurse = Inst::new(Opcode::Local, Params::InstIndex(push_n2, 0), 4);

        let branch = Inst::new(Opcode::If, Params::InstPair(done, recurse), 2);
        let call_zero = Inst::new(Opcode::ConstCall, Params::InstCountValue(branch, 1, is_zero), 2);
        let push_n = Inst::new(Opcode::Push, Params::Inst(call_zero), 1);
        let entry = Inst::new(Opcode::Local, Params::InstIndex(push_n, 0), 1);

        let cell = Rc::new(RefCell::new(Value::Nil));
        let countdown = Value::Native(Rc::new(Closure {
            info: Rc::new(ClosureInfo {
                entry,
                frame_size: 1,
                arity: 1,
                upvalue_count: 1,
                source: "countdown".into(),
                param_names: None,
            }),
            upvalues: vec![cell.clone()],
        }));
        *cell.borrow_mut() = countdown.clone();

        let ctx = Context::new();
        let result = invoke(&ctx, countdown, vec![Value::Int(100_000)]);
        match result {
            Value::Str(s) => assert_eq!(s.as_ref(), "done"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
