//! The standard-library surface that an embedder or compiler expects
//! to find pre-registered: `class`, `list`, `tuple`, `task`, `tasks`,
//! `parallel`, `buffered`, the sequence reducers, and the type-name
//! constants, each exposed as a [`Value`] (almost always a
//! [`NativeFn`](crate::native_fn::NativeFn)) so this crate is directly
//! testable without an external compiler feeding it bytecode.

use std::cell::RefCell;
use std::rc::Rc;

use minilang_core::error::{kinds, raise, MlError};
use minilang_core::value::downcast_native_rc;
use minilang_core::{List, Value};

use crate::class::ClassDef;
use crate::native_fn::NativeFn;
use crate::state::Step;
use crate::task::{Task, TasksSet};

/// `class(name, [parent], field...)`. `parent`, if present, is a class
/// value produced by an earlier `class(...)` call; everything after it
/// (or after `name` if there is no parent) is a field symbol.
fn class_fn() -> Value {
    NativeFn::new("class", |caller, _ctx, mut args| {
        if args.is_empty() {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "class requires a name"));
        }
        let name = match args.remove(0) {
            Value::Symbol(s) | Value::Str(s) => s,
            _ => return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "class name must be a symbol")),
        };
        let parent = match args.first() {
            Some(Value::Native(n)) if n.downcast_ref::<ClassDef>().is_some() => downcast_native_rc::<ClassDef>(n.clone()),
            _ => None,
        };
        if parent.is_some() {
            args.remove(0);
        }
        let mut fields = Vec::with_capacity(args.len());
        for field in args {
            match field {
                Value::Symbol(s) | Value::Str(s) => fields.push(s),
                _ => return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "field name must be a symbol")),
            }
        }
        let def = ClassDef::new(name, parent, fields);
        Step::TailCall(caller, Value::Native(def))
    })
}

/// `list(v1, v2, ...)`: a fresh list populated in argument order.
fn list_fn() -> Value {
    NativeFn::new("list", |caller, _ctx, args| {
        let mut list = List::new();
        for v in args {
            list.push_back(v);
        }
        Step::TailCall(caller, Value::List(Rc::new(RefCell::new(list))))
    })
}

/// `tuple(v1, v2, ...)`: an immutable fixed-size tuple.
fn tuple_fn() -> Value {
    NativeFn::new("tuple", |caller, _ctx, args| Step::TailCall(caller, Value::tuple(args)))
}

/// `task()`: a fresh, unset completion cell. `task(arg_1, ..., fn)`
/// additionally starts `fn(arg_1, ...)` and completes the task with its
/// result.
fn task_fn() -> Value {
    NativeFn::new("task", |caller, ctx, args| {
        if args.is_empty() {
            return Step::TailCall(caller, Value::Native(Task::new()));
        }
        Step::TailCall(caller, crate::task::spawn(ctx, args))
    })
}

fn as_task(v: &Value) -> Option<Rc<Task>> {
    match v {
        Value::Native(n) if n.downcast_ref::<Task>().is_some() => downcast_native_rc::<Task>(n.clone()),
        _ => None,
    }
}

/// `done(t, v)`: completes `t` with `v`, returning `v`, or `TaskError`
/// if `t` is already complete.
fn done_fn() -> Value {
    NativeFn::new("done", |caller, ctx, mut args| {
        if args.len() != 2 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "done requires a task and a value"));
        }
        let value = crate::dispatch::deref_value(&args.pop().unwrap());
        let Some(task) = as_task(&args[0]) else {
            return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "done requires a task"));
        };
        Step::TailCall(caller, task.complete(ctx, value))
    })
}

/// `error(t, kind, msg)`: completes `t` with an error value, returning
/// nil, or `TaskError` if `t` is already complete.
fn task_error_fn() -> Value {
    NativeFn::new("error", |caller, ctx, mut args| {
        if args.len() != 3 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "error requires a task, a kind, and a message"));
        }
        let (Value::Str(message) | Value::Symbol(message)) = args.pop().unwrap() else {
            return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "error message must be a string"));
        };
        let (Value::Str(kind) | Value::Symbol(kind)) = args.pop().unwrap() else {
            return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "error kind must be a string"));
        };
        let Some(task) = as_task(&args[0]) else {
            return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "error requires a task"));
        };
        let completed = task.complete(ctx, raise(kind.as_ref(), message.as_ref()));
        if let Value::Error(e) = &completed {
            if e.borrow().kind == kinds::TASK_ERROR {
                return Step::TailCall(caller, completed);
            }
        }
        Step::TailCall(caller, Value::Nil)
    })
}

/// `then(fn, ok)` / `then(fn, ok, alt)` / `else(fn, alt)` / `on(fn,
/// handler)`: wrap a call to `fn()` in a task whose completion is routed
/// through the matching handler.
fn then_fn() -> Value {
    NativeFn::new("then", |caller, ctx, mut args| {
        match args.len() {
            2 => {
                let ok = args.pop().unwrap();
                let f = args.pop().unwrap();
                crate::task::Composed::start(ctx, caller, f, Some(ok), None, None)
            }
            3 => {
                let alt = args.pop().unwrap();
                let ok = args.pop().unwrap();
                let f = args.pop().unwrap();
                crate::task::Composed::start(ctx, caller, f, Some(ok), Some(alt), None)
            }
            _ => Step::TailCall(caller, raise(kinds::VALUE_ERROR, "then requires a function and one or two handlers")),
        }
    })
}

fn else_fn() -> Value {
    NativeFn::new("else", |caller, ctx, mut args| {
        if args.len() != 2 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "else requires a function and a handler"));
        }
        let alt = args.pop().unwrap();
        let f = args.pop().unwrap();
        crate::task::Composed::start(ctx, caller, f, None, Some(alt), None)
    })
}

fn on_fn() -> Value {
    NativeFn::new("on", |caller, ctx, mut args| {
        if args.len() != 2 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "on requires a function and a handler"));
        }
        let handler = args.pop().unwrap();
        let f = args.pop().unwrap();
        crate::task::Composed::start(ctx, caller, f, None, None, Some(handler))
    })
}

/// `tasks([max_running], [max_pending], main)`: trailing integers before
/// `main` bound concurrency and the pending queue, in that order.
fn tasks_fn() -> Value {
    NativeFn::new("tasks", |caller, ctx, mut args| {
        if args.is_empty() {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "tasks requires a main function"));
        }
        let main = args.pop().unwrap();
        let (max_running, max_pending) = match parse_bounds(args) {
            Ok(bounds) => bounds,
            Err(err) => return Step::TailCall(caller, err.into()),
        };
        TasksSet::create(ctx, caller, max_running, max_pending, main)
    })
}

/// `parallel(seq, [max], [burst], fn)`.
fn parallel_fn() -> Value {
    NativeFn::new("parallel", |caller, ctx, mut args| {
        if args.len() < 2 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "parallel requires a sequence and a function"));
        }
        let f = args.pop().unwrap();
        let seq = args.remove(0);
        let (max_running, burst) = match parse_bounds(args) {
            Ok(bounds) => bounds,
            Err(err) => return Step::TailCall(caller, err.into()),
        };
        crate::task::Parallel::start(ctx, caller, seq, max_running, burst, f)
    })
}

/// `buffered(seq, size, fn)`: returns the lazy pipelined sequence value
/// itself; iterating it (`FOR`/`NEXT`) is what actually runs `fn` ahead.
fn buffered_fn() -> Value {
    NativeFn::new("buffered", |caller, _ctx, mut args| {
        if args.len() != 3 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "buffered requires a sequence, a size, and a function"));
        }
        let f = args.pop().unwrap();
        let size = match buffered_size(&args.pop().unwrap()) {
            Ok(size) => size,
            Err(err) => return Step::TailCall(caller, err.into()),
        };
        let seq = args.pop().unwrap();
        Step::TailCall(caller, crate::task::buffered(seq, size, f))
    })
}

/// Validates a `buffered` ring size at construction time.
fn buffered_size(v: &Value) -> Result<usize, MlError> {
    match crate::dispatch::deref_value(v) {
        Value::Int(i) if (1..=1024).contains(&i) => Ok(i as usize),
        Value::Int(i) => Err(MlError::InvalidConfig(format!("buffered size {i} out of range"))),
        other => Err(MlError::Engine {
            kind: kinds::TYPE_ERROR.into(),
            message: format!("buffered size must be an integer, not {}", other.type_name()),
        }),
    }
}

/// Parses the optional integer bounds preceding a coordinator's main
/// function (`tasks`'s running/pending limits, `parallel`'s max/burst),
/// validated at construction time.
fn parse_bounds(args: Vec<Value>) -> Result<(Option<usize>, Option<usize>), MlError> {
    if args.len() > 2 {
        return Err(MlError::InvalidConfig(format!("expected at most 2 bounds, got {}", args.len())));
    }
    let mut bounds = [None, None];
    for (slot, v) in bounds.iter_mut().zip(args) {
        match crate::dispatch::deref_value(&v) {
            Value::Int(i) if i >= 0 => *slot = Some(i as usize),
            other => {
                return Err(MlError::InvalidConfig(format!(
                    "bound must be a non-negative integer, not {}",
                    other.type_name()
                )));
            }
        }
    }
    let [first, second] = bounds;
    Ok((first, second))
}

fn reducer(name: &'static str, run: fn(&crate::state::Context, crate::state::StateRef, Value) -> Step) -> Value {
    NativeFn::new(name, move |caller, ctx, mut args| {
        if args.is_empty() {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, format!("{name} requires a sequence")));
        }
        let seq = args.remove(0);
        // A per-type override installed in the context's registry wins
        // over the generic reducer (the typed-function side table).
        if let Some(typed) = ctx
            .registry
            .borrow()
            .lookup::<crate::combinators::TypedSeqFn>(seq.type_name(), name)
        {
            return (typed.0)(ctx, caller, seq);
        }
        run(ctx, caller, seq)
    })
}

/// `fold(seq, fn)`: the one reducer that takes a user function alongside
/// the sequence, so it gets its own wrapper rather than sharing
/// [`reducer`]'s single-argument shape.
fn fold_fn() -> Value {
    NativeFn::new("fold", |caller, ctx, mut args| {
        if args.len() != 2 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "fold requires a sequence and a function"));
        }
        let f = args.pop().unwrap();
        let seq = args.pop().unwrap();
        crate::combinators::fold(ctx, caller, seq, f)
    })
}

/// `unique(seq)`, `repeat(seed, fn)`, `group(seq1, ..., fn)`: the
/// remaining sequence adapters named in the external interface.
fn unique_fn() -> Value {
    NativeFn::new("unique", |caller, _ctx, mut args| {
        if args.is_empty() {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "unique requires a sequence"));
        }
        Step::TailCall(caller, crate::iterate::unique(args.remove(0)))
    })
}

fn repeat_fn() -> Value {
    NativeFn::new("repeat", |caller, _ctx, mut args| {
        if args.len() != 2 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "repeat requires a seed and a function"));
        }
        let f = args.pop().unwrap();
        let seed = args.pop().unwrap();
        Step::TailCall(caller, crate::iterate::repeated(seed, f))
    })
}

fn group_fn() -> Value {
    NativeFn::new("group", |caller, ctx, mut args| {
        if args.len() < 2 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "group requires at least one sequence and a function"));
        }
        let f = args.pop().unwrap();
        crate::iterate::Grouped::start(ctx, caller, args, f)
    })
}

/// Calls `lt(a, b)` synchronously and reads back a truthy/falsy verdict.
fn less_than(ctx: &crate::state::Context, lt: &Value, a: &Value, b: &Value) -> Result<bool, Value> {
    let result = crate::state::run_sync(ctx, |root| {
        crate::dispatch::call_value(root, ctx, lt.clone(), vec![a.clone(), b.clone()])
    });
    if result.is_error() {
        Err(result)
    } else {
        Ok(result.is_truthy())
    }
}

/// Bottom-up stable merge sort keyed by `lt`. Returns the first error
/// `lt` raises instead of a sorted vector, so the caller can leave the
/// original collection untouched on failure.
fn merge_sort<T: Clone>(ctx: &crate::state::Context, items: Vec<T>, lt: &Value, key: &dyn Fn(&T) -> Value) -> Result<Vec<T>, Value> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let mid = items.len() / 2;
    let (left, right) = items.split_at(mid);
    let left = merge_sort(ctx, left.to_vec(), lt, key)?;
    let right = merge_sort(ctx, right.to_vec(), lt, key)?;
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let (mut li, mut ri) = (left.into_iter().peekable(), right.into_iter().peekable());
    loop {
        match (li.peek(), ri.peek()) {
            (Some(l), Some(r)) => {
                if less_than(ctx, lt, &key(r), &key(l))? {
                    merged.push(ri.next().unwrap());
                } else {
                    merged.push(li.next().unwrap());
                }
            }
            (Some(_), None) => {
                merged.extend(li);
                break;
            }
            (None, Some(_)) => {
                merged.extend(ri);
                break;
            }
            (None, None) => break,
        }
    }
    Ok(merged)
}

/// `sort(list_or_map, lt)`: reorders in place by `lt`, a two-argument
/// "does the first belong before the second" predicate; for a map, `lt`
/// compares keys and the associated values move along with them.
/// Leaves the collection untouched and returns `lt`'s error if it ever
/// raises one partway through.
fn sort_fn() -> Value {
    NativeFn::new("sort", |caller, ctx, mut args| {
        if args.len() != 2 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "sort requires a collection and a comparator"));
        }
        let lt = args.pop().unwrap();
        let target = args.pop().unwrap();
        match &target {
            Value::List(list) => {
                let items = list.borrow_mut().to_vec();
                match merge_sort(ctx, items, &lt, &|v: &Value| v.clone()) {
                    Ok(sorted) => {
                        list.borrow_mut().replace_all(sorted);
                        Step::TailCall(caller, target)
                    }
                    Err(e) => Step::TailCall(caller, e),
                }
            }
            Value::Map(map) => {
                let entries = map.borrow().to_vec();
                match merge_sort(ctx, entries, &lt, &|(k, _): &(Value, Value)| k.clone()) {
                    Ok(sorted) => {
                        map.borrow_mut().replace_all(sorted);
                        Step::TailCall(caller, target)
                    }
                    Err(e) => Step::TailCall(caller, e),
                }
            }
            other => Step::TailCall(caller, raise(kinds::TYPE_ERROR, format!("{} is not sortable", other.type_name()))),
        }
    })
}

/// The type-name constants an embedder's `Type` comparisons key off: one
/// symbol per [`Value::type_name`] an interpreter-level program can
/// observe (native subtypes report their own `type_name`, e.g.
/// `"class"`, `"task"`, `"iterator"`, and aren't duplicated here).
const TYPE_NAMES: &[&str] = &[
    "nil", "some", "integer", "real", "string", "symbol", "tuple", "names", "list", "map", "stringbuffer",
    "reference", "uninitialized", "error",
];

/// The full standard-library surface, as `(name, value)` pairs an
/// embedder installs into its global namespace.
pub fn standard_library() -> Vec<(&'static str, Value)> {
    let mut entries = vec![
        ("class", class_fn()),
        ("method", method_fn()),
        ("list", list_fn()),
        ("tuple", tuple_fn()),
        ("task", task_fn()),
        ("done", done_fn()),
        ("error", task_error_fn()),
        ("then", then_fn()),
        ("else", else_fn()),
        ("on", on_fn()),
        ("tasks", tasks_fn()),
        ("parallel", parallel_fn()),
        ("buffered", buffered_fn()),
        ("all", reducer("all", crate::combinators::all)),
        ("map", reducer("map", crate::combinators::map_pairs)),
        ("count", reducer("count", crate::combinators::count)),
        ("min", reducer("min", crate::combinators::min)),
        ("max", reducer("max", crate::combinators::max)),
        ("sum", reducer("sum", crate::combinators::sum)),
        ("prod", reducer("prod", crate::combinators::prod)),
        ("fold", fold_fn()),
        ("sort", sort_fn()),
        ("unique", unique_fn()),
        ("repeat", repeat_fn()),
        ("group", group_fn()),
    ];
    for name in TYPE_NAMES {
        entries.push((*name, Value::symbol(*name)));
    }
    entries
}

/// `method(name, f)`: tags `f` with a name for the external method
/// resolver to key on. Overload resolution itself lives with that
/// resolver; this crate only needs the tag to exist so `class`-defined
/// methods have something to register against.
pub fn method_fn() -> Value {
    NativeFn::new("method", |caller, _ctx, mut args| {
        if args.len() != 2 {
            return Step::TailCall(caller, raise(kinds::VALUE_ERROR, "method requires a name and a function"));
        }
        Step::TailCall(caller, args.pop().unwrap())
    })
}
