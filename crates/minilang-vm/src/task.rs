//! Cooperative task coordination: `task`, `tasks`, `parallel`,
//! `buffered`.
//!
//! A [`Task`] is a single-completion cell with FIFO waiters; a
//! [`TasksSet`] is a bounded fan-out scheduler that queues pending calls
//! once `max_running` is hit and, once `max_pending` is also hit, parks
//! the *caller adding the task* rather than the task itself.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use minilang_core::error::{kinds, raise};
use minilang_core::value::{downcast_native_rc, NativeValue};
use minilang_core::Value;

use crate::dispatch::call_value;
use crate::state::{Context, Scheduler, State, StateRef, Step};

/// A value that will eventually be completed exactly once. The first
/// caller to call an unset task becomes its "primary" waiter and is run
/// inline once the task completes; every later caller is queued as a
/// waiter and is *scheduled*, not run inline. The asymmetry matters to
/// resumption order and is pinned down by a test below.
pub struct Task {
    value: RefCell<Option<Value>>,
    primary: RefCell<Option<StateRef>>,
    waiters: RefCell<VecDeque<StateRef>>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<task>")
    }
}

impl Task {
    pub fn new() -> Rc<Self> {
        Rc::new(Task {
            value: RefCell::new(None),
            primary: RefCell::new(None),
            waiters: RefCell::new(VecDeque::new()),
        })
    }

    pub fn call(&self, _ctx: &Context, caller: StateRef) -> Step {
        if let Some(value) = self.value.borrow().clone() {
            return Step::TailCall(caller, value);
        }
        if self.primary.borrow().is_none() {
            *self.primary.borrow_mut() = Some(caller);
        } else {
            self.waiters.borrow_mut().push_back(caller);
        }
        Step::Parked
    }

    /// Completes the task with `value`, running the primary waiter inline
    /// and scheduling every other waiter for later resumption. A second
    /// call raises `TaskError`.
    pub fn complete(&self, ctx: &Context, value: Value) -> Value {
        if self.value.borrow().is_some() {
            return raise(kinds::TASK_ERROR, "task value already set");
        }
        *self.value.borrow_mut() = Some(value.clone());
        tracing::debug!(waiters = self.waiters.borrow().len(), "task completed");
        for waiter in self.waiters.borrow_mut().drain(..) {
            ctx.scheduler.schedule(waiter, value.clone());
        }
        if let Some(primary) = self.primary.borrow_mut().take() {
            crate::state::drive(ctx, primary, value.clone());
        }
        value
    }
}

impl NativeValue for Task {
    fn type_name(&self) -> &'static str {
        "task"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `task(arg_1, ..., arg_n, fn)`: returns a task that `fn(arg_1, ...,
/// arg_n)` completes. The call starts immediately; its result completes
/// the task only if nothing else (`done`/`error`) got there first.
pub fn spawn(ctx: &Context, args: Vec<Value>) -> Value {
    let task = Task::new();
    let (f, positional) = split_fn_and_args(args);
    let runner = Rc::new(TaskRun { task: task.clone() }) as StateRef;
    match call_value(runner, ctx, f, positional) {
        Step::TailCall(next, v) => crate::state::drive(ctx, next, v),
        Step::Parked => {}
    }
    Value::Native(task)
}

struct TaskRun {
    task: Rc<Task>,
}

impl State for TaskRun {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        if self.task.value.borrow().is_none() {
            self.task.complete(ctx, value);
        }
        Step::Parked
    }
}

/// The `then`/`else`/`on` composition: wraps a call to `f()` in a task,
/// routing its completion through at most one of the three handlers
/// before the routed result completes the task.
/// An ordinary value routes through `then`, `Nil` through `alt`, an
/// error through `on` (receiving the error demoted to inspectable data);
/// a missing handler passes the value straight through.
pub struct Composed {
    task: Rc<Task>,
    then: Option<Value>,
    alt: Option<Value>,
    on: Option<Value>,
    routed: RefCell<bool>,
}

impl Composed {
    pub fn start(
        ctx: &Context,
        caller: StateRef,
        f: Value,
        then: Option<Value>,
        alt: Option<Value>,
        on: Option<Value>,
    ) -> Step {
        let task = Task::new();
        let composed = Rc::new(Composed {
            task: task.clone(),
            then,
            alt,
            on,
            routed: RefCell::new(false),
        }) as StateRef;
        match call_value(composed, ctx, f, Vec::new()) {
            Step::TailCall(next, v) => crate::state::drive(ctx, next, v),
            Step::Parked => {}
        }
        Step::TailCall(caller, Value::Native(task))
    }
}

impl State for Composed {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        if !*self.routed.borrow() {
            let route = if value.is_error() {
                self.on.clone()
            } else if matches!(value, Value::Nil) {
                self.alt.clone()
            } else {
                self.then.clone()
            };
            if let Some(f) = route {
                *self.routed.borrow_mut() = true;
                let arg = match &value {
                    Value::Error(e) => {
                        e.borrow_mut().caught = true;
                        value.clone()
                    }
                    other => other.clone(),
                };
                return call_value(self.clone() as StateRef, ctx, f, vec![arg]);
            }
        }
        if self.task.value.borrow().is_none() {
            self.task.complete(ctx, value);
        }
        Step::Parked
    }
}

/// A bounded fan-out of calls sharing a single completion: the `tasks`
/// builtin. `main` is invoked once, immediately, with the tasks
/// set itself as its sole argument; every further call to the set adds a
/// child task. The set completes with `Nil` once `num_running` returns
/// to zero with nothing pending, or with the first error any child call
/// produces (absorbing: later results are discarded once errored).
pub struct TasksSet {
    caller: RefCell<Option<StateRef>>,
    pending: RefCell<VecDeque<(Value, Vec<Value>)>>,
    adding: RefCell<VecDeque<StateRef>>,
    num_running: RefCell<usize>,
    max_running: usize,
    num_pending: RefCell<usize>,
    max_pending: usize,
    errored: RefCell<bool>,
}

impl fmt::Debug for TasksSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<tasks>")
    }
}

impl NativeValue for TasksSet {
    fn type_name(&self) -> &'static str {
        "tasks"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TasksSet {
    /// Builds a tasks set and immediately invokes `main(tasks)`; absent
    /// bounds default to unlimited.
    pub fn create(
        ctx: &Context,
        caller: StateRef,
        max_running: Option<usize>,
        max_pending: Option<usize>,
        main: Value,
    ) -> Step {
        let tasks = Rc::new(TasksSet {
            caller: RefCell::new(Some(caller)),
            pending: RefCell::new(VecDeque::new()),
            adding: RefCell::new(VecDeque::new()),
            num_running: RefCell::new(1),
            max_running: max_running.unwrap_or(usize::MAX),
            num_pending: RefCell::new(0),
            max_pending: max_pending.unwrap_or(usize::MAX),
            errored: RefCell::new(false),
        });
        let self_value = Value::Native(tasks.clone() as Rc<dyn NativeValue>);
        call_value(tasks as StateRef, ctx, main, vec![self_value])
    }

    pub fn call(self: Rc<Self>, ctx: &Context, caller: StateRef, args: Vec<Value>) -> Step {
        if *self.errored.borrow() {
            return Step::Parked;
        }
        if *self.num_running.borrow() >= self.max_running {
            self.pending.borrow_mut().push_back((Value::Nil, args));
            *self.num_pending.borrow_mut() += 1;
            if *self.num_pending.borrow() > self.max_pending {
                tracing::debug!(pending = *self.num_pending.borrow(), "tasks pending queue full, parking adder");
                self.adding.borrow_mut().push_back(caller);
                Step::Parked
            } else {
                Step::TailCall(caller, as_value(&self))
            }
        } else {
            *self.num_running.borrow_mut() += 1;
            let (fn_value, positional) = split_fn_and_args(args);
            let continuation = self.clone() as StateRef;
            match call_value(continuation, ctx, fn_value, positional) {
                Step::TailCall(next, v) => crate::state::drive(ctx, next, v),
                Step::Parked => {}
            }
            Step::TailCall(caller, as_value(&self))
        }
    }
}

fn as_value(tasks: &Rc<TasksSet>) -> Value {
    Value::Native(tasks.clone() as Rc<dyn NativeValue>)
}

impl State for TasksSet {
    /// Called when a running child call completes. An error
    /// short-circuits every parked "adding" caller and the original
    /// caller with that error; otherwise the next pending call (if any)
    /// starts, freeing one "adding" slot; with nothing pending and
    /// `num_running` back to zero, the original caller is resumed with
    /// `Nil`.
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        if value.is_error() {
            tracing::debug!("tasks set entering absorbing error state");
            *self.errored.borrow_mut() = true;
            for adding in self.adding.borrow_mut().drain(..) {
                ctx.scheduler.schedule(adding, value.clone());
            }
            return match self.caller.borrow_mut().take() {
                Some(caller) => Step::TailCall(caller, value),
                None => Step::Parked,
            };
        }
        if let Some((_, args)) = self.pending.borrow_mut().pop_front() {
            *self.num_pending.borrow_mut() -= 1;
            if let Some(adding) = self.adding.borrow_mut().pop_front() {
                ctx.scheduler.schedule(adding, as_value(&self));
            }
            let (fn_value, positional) = split_fn_and_args(args);
            return call_value(self.clone() as StateRef, ctx, fn_value, positional);
        }
        *self.num_running.borrow_mut() -= 1;
        if *self.num_running.borrow() == 0 {
            return match self.caller.borrow_mut().take() {
                Some(caller) => Step::TailCall(caller, Value::Nil),
                None => Step::Parked,
            };
        }
        Step::Parked
    }
}

/// `parallel(seq, max?, burst?, fn)`: walks `seq` and
/// calls `fn(key, value)` for each pair without waiting for it to
/// return. Returns once every call has returned, or the first error any
/// of them produces. `max` pauses pulling further items from `seq` once
/// that many calls are in flight; `burst` (only meaningful alongside
/// `max`) delays resuming until the count drops back to it, so callers
/// can ask for "run up to 8 at a time, but don't top back up until
/// there are only 4 left" pipelines.
pub struct Parallel {
    caller: RefCell<Option<StateRef>>,
    f: Value,
    error: RefCell<Option<Value>>,
    num_running: RefCell<usize>,
    max_running: usize,
    burst: usize,
    iter: RefCell<Option<Value>>,
}

impl fmt::Debug for Parallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<parallel>")
    }
}

impl Parallel {
    pub fn start(ctx: &Context, caller: StateRef, seq: Value, max_running: Option<usize>, burst: Option<usize>, f: Value) -> Step {
        let p = Rc::new(Parallel {
            caller: RefCell::new(Some(caller)),
            f,
            error: RefCell::new(None),
            num_running: RefCell::new(1),
            max_running: max_running.unwrap_or(usize::MAX),
            burst: burst.unwrap_or(usize::MAX),
            iter: RefCell::new(None),
        });
        crate::iterate::iterate_value(Rc::new(ParallelNext(p)) as StateRef, ctx, seq)
    }

    /// Invoked once per completed step — either a `fn(key, value)` call
    /// returning, or the source sequence running dry. A single running
    /// count is shared between
    /// "still pulling from the sequence" and "waiting on in-flight
    /// calls", so the set only finishes once both reach zero.
    fn continue_with(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        if self.error.borrow().is_some() {
            return Step::Parked;
        }
        if value.is_error() {
            *self.error.borrow_mut() = Some(value.clone());
            return match self.caller.borrow_mut().take() {
                Some(c) => Step::TailCall(c, value),
                None => Step::Parked,
            };
        }
        *self.num_running.borrow_mut() -= 1;
        let cursor = self.iter.borrow().clone();
        if let Some(cursor) = cursor {
            if *self.num_running.borrow() > self.burst {
                tracing::trace!(running = *self.num_running.borrow(), "parallel above burst, pausing iteration");
                return Step::Parked;
            }
            *self.num_running.borrow_mut() += 1;
            return crate::iterate::next_value(Rc::new(ParallelNext(self.clone())) as StateRef, ctx, cursor);
        }
        if *self.num_running.borrow() == 0 {
            return match self.caller.borrow_mut().take() {
                Some(c) => Step::TailCall(c, Value::Nil),
                None => Step::Parked,
            };
        }
        Step::Parked
    }
}

impl State for Parallel {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        self.continue_with(ctx, value)
    }
}

struct ParallelNext(Rc<Parallel>);

impl State for ParallelNext {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        let p = self.0.clone();
        if p.error.borrow().is_some() {
            return Step::Parked;
        }
        if value.is_error() || matches!(value, Value::Nil) {
            *p.iter.borrow_mut() = None;
            return p.continue_with(ctx, if value.is_error() { value } else { Value::Nil });
        }
        *p.iter.borrow_mut() = Some(value.clone());
        crate::iterate::key_value(Rc::new(ParallelKey(p)) as StateRef, ctx, value)
    }
}

struct ParallelKey(Rc<Parallel>);

impl State for ParallelKey {
    fn run(self: Rc<Self>, ctx: &Context, key: Value) -> Step {
        let p = self.0.clone();
        let cursor = p.iter.borrow().clone().expect("key requested with no cursor");
        crate::iterate::value_value(Rc::new(ParallelValue(p, key)) as StateRef, ctx, cursor)
    }
}

struct ParallelValue(Rc<Parallel>, Value);

impl State for ParallelValue {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        let p = self.0.clone();
        let key = self.1.clone();
        let f = p.f.clone();
        match call_value(p.clone() as StateRef, ctx, f, vec![key, value]) {
            Step::TailCall(next, v) => crate::state::drive(ctx, next, v),
            Step::Parked => {}
        }
        if p.error.borrow().is_some() || p.iter.borrow().is_none() {
            return Step::Parked;
        }
        if *p.num_running.borrow() > p.max_running {
            return Step::Parked;
        }
        *p.num_running.borrow_mut() += 1;
        let cursor = p.iter.borrow().clone().unwrap();
        crate::iterate::next_value(Rc::new(ParallelNext(p)) as StateRef, ctx, cursor)
    }
}

/// `buffered(seq, size, fn)`: like `parallel`, but a
/// sequence rather than a one-shot call — `fn(key, value)` calls for up
/// to `size` upcoming elements run concurrently, while consumption still
/// sees results in the original order.
pub struct Buffered {
    seq: Value,
    size: usize,
    f: Value,
}

impl fmt::Debug for Buffered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<buffered>")
    }
}

impl NativeValue for Buffered {
    fn type_name(&self) -> &'static str {
        "buffered"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn buffered(seq: Value, size: usize, f: Value) -> Value {
    Value::Native(Rc::new(Buffered { seq, size, f }))
}

impl Buffered {
    /// The sequence being buffered, for typed overrides that bypass the
    /// pipeline (`count` forwards here).
    pub fn inner(&self) -> Value {
        self.seq.clone()
    }
}

/// One in-flight or completed `fn(key, value)` application. `key` is
/// `None` for the terminal entry carrying the upstream nil or error.
struct BufferedEntry {
    key: Option<Value>,
    result: RefCell<Option<Value>>,
}

impl BufferedEntry {
    fn is_ready(&self) -> bool {
        self.result.borrow().is_some()
    }
}

/// The pipeline, which is also the cursor the consumer iterates:
/// `key`/`value` read the most recently delivered position while the
/// ring keeps running ahead. A consumer `next` either delivers the front
/// entry immediately or parks in `consumer` until that entry's call
/// completes.
pub struct BufferedCursor {
    f: Value,
    size: usize,
    /// Upstream cursor not currently being advanced; taken while a pull
    /// is in flight.
    source: RefCell<Option<Value>>,
    fetching: RefCell<bool>,
    entries: RefCell<VecDeque<Rc<BufferedEntry>>>,
    consumer: RefCell<Option<StateRef>>,
    current_key: RefCell<Value>,
    current_value: RefCell<Value>,
}

impl fmt::Debug for BufferedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<buffered-cursor>")
    }
}

impl NativeValue for BufferedCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl BufferedCursor {
    pub fn key(&self) -> Value {
        self.current_key.borrow().clone()
    }

    pub fn value(&self) -> Value {
        self.current_value.borrow().clone()
    }

    fn has_room(&self) -> bool {
        self.entries.borrow().len() < self.size
    }

    /// Advances the upstream cursor when idle and the ring has room,
    /// driving the pull chain inline.
    fn pull(self: &Rc<Self>, ctx: &Context) {
        if *self.fetching.borrow() || !self.has_room() {
            return;
        }
        let Some(source) = self.source.borrow_mut().take() else {
            return;
        };
        *self.fetching.borrow_mut() = true;
        let pull = Rc::new(BufferedPull(self.clone())) as StateRef;
        match crate::iterate::next_value(pull, ctx, source) {
            Step::TailCall(next, v) => crate::state::drive(ctx, next, v),
            Step::Parked => {}
        }
    }

    /// Resumes the parked consumer if the front entry has completed.
    fn wake_if_front_ready(self: &Rc<Self>, ctx: &Context) -> Step {
        if self.consumer.borrow().is_some()
            && self.entries.borrow().front().is_some_and(|e| e.is_ready())
        {
            return self.deliver(ctx);
        }
        Step::Parked
    }

    /// Hands the ready front entry to the parked consumer: the terminal
    /// entry delivers its nil or error directly, anything else becomes
    /// the cursor's current position. Tops the pipeline back up before
    /// resuming the consumer.
    fn deliver(self: &Rc<Self>, ctx: &Context) -> Step {
        let entry = self.entries.borrow_mut().pop_front().expect("deliver without a front entry");
        let caller = self.consumer.borrow_mut().take().expect("deliver without a parked consumer");
        let result = entry.result.borrow().clone().expect("deliver before the entry completed");
        let Some(key) = entry.key.clone() else {
            return Step::TailCall(caller, result);
        };
        *self.current_key.borrow_mut() = key;
        *self.current_value.borrow_mut() = result;
        self.pull(ctx);
        Step::TailCall(caller, Value::Native(self.clone() as Rc<dyn NativeValue>))
    }
}

/// Receives the upstream `iterate`/`next` result: a new position to read
/// key and value from, or the terminal nil/error.
struct BufferedPull(Rc<BufferedCursor>);

impl State for BufferedPull {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        let b = self.0.clone();
        if matches!(value, Value::Nil) || value.is_error() {
            *b.fetching.borrow_mut() = false;
            let entry = Rc::new(BufferedEntry { key: None, result: RefCell::new(Some(value)) });
            b.entries.borrow_mut().push_back(entry);
            return b.wake_if_front_ready(ctx);
        }
        *b.source.borrow_mut() = Some(value.clone());
        crate::iterate::key_value(Rc::new(BufferedReadKey(b)) as StateRef, ctx, value)
    }
}

struct BufferedReadKey(Rc<BufferedCursor>);

impl State for BufferedReadKey {
    fn run(self: Rc<Self>, ctx: &Context, key: Value) -> Step {
        let b = self.0.clone();
        let cursor = b.source.borrow().clone().expect("key read with no upstream cursor");
        crate::iterate::value_value(Rc::new(BufferedReadValue(b, key)) as StateRef, ctx, cursor)
    }
}

struct BufferedReadValue(Rc<BufferedCursor>, Value);

impl State for BufferedReadValue {
    /// The element is fully read: enter it into the ring, fire its
    /// `fn(key, value)` call with the entry as the continuation, and run
    /// ahead while there is room.
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        let b = self.0.clone();
        let key = self.1.clone();
        let entry = Rc::new(BufferedEntry { key: Some(key.clone()), result: RefCell::new(None) });
        b.entries.borrow_mut().push_back(entry.clone());
        *b.fetching.borrow_mut() = false;
        let slot = Rc::new(BufferedSlot { entry, pipeline: Rc::downgrade(&b) }) as StateRef;
        match call_value(slot, ctx, b.f.clone(), vec![key, value]) {
            Step::TailCall(next, v) => crate::state::drive(ctx, next, v),
            Step::Parked => {}
        }
        b.pull(ctx);
        Step::Parked
    }
}

/// The continuation of one `fn(key, value)` call: stores the result and,
/// if the consumer is parked on this entry, resumes it. Holds the
/// pipeline weakly so an abandoned iteration drops cleanly.
struct BufferedSlot {
    entry: Rc<BufferedEntry>,
    pipeline: std::rc::Weak<BufferedCursor>,
}

impl State for BufferedSlot {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        *self.entry.result.borrow_mut() = Some(value);
        match self.pipeline.upgrade() {
            Some(b) => b.wake_if_front_ready(ctx),
            None => Step::Parked,
        }
    }
}

/// Starts the pipeline for `buffered(seq, size, fn)`: parks the caller
/// as the consumer and begins pulling; the first completed front entry
/// delivers the cursor.
pub fn start_buffered(caller: StateRef, ctx: &Context, value: Value) -> Step {
    let Value::Native(n) = &value else {
        return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "not a buffered sequence"));
    };
    let Some(b) = n.downcast_ref::<Buffered>() else {
        return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "not a buffered sequence"));
    };
    let cursor = Rc::new(BufferedCursor {
        f: b.f.clone(),
        size: b.size.max(1),
        source: RefCell::new(None),
        fetching: RefCell::new(true),
        entries: RefCell::new(VecDeque::new()),
        consumer: RefCell::new(Some(caller)),
        current_key: RefCell::new(Value::Nil),
        current_value: RefCell::new(Value::Nil),
    });
    let pull = Rc::new(BufferedPull(cursor)) as StateRef;
    crate::iterate::iterate_value(pull, ctx, b.seq.clone())
}

/// Advances the pipeline one step: parks the caller as the consumer and
/// delivers the front entry as soon as it is ready — immediately if its
/// call already completed, otherwise whenever it does.
pub fn advance_buffered(caller: StateRef, ctx: &Context, value: Value) -> Step {
    let Value::Native(n) = &value else {
        return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "not a buffered cursor"));
    };
    if n.downcast_ref::<BufferedCursor>().is_none() {
        return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "not a buffered cursor"));
    }
    let cursor = downcast_native_rc::<BufferedCursor>(n.clone()).expect("checked above");
    if cursor.entries.borrow().is_empty() && cursor.source.borrow().is_none() && !*cursor.fetching.borrow() {
        return Step::TailCall(caller, Value::Nil);
    }
    *cursor.consumer.borrow_mut() = Some(caller);
    cursor.pull(ctx);
    cursor.wake_if_front_ready(ctx)
}

/// The convention every `tasks`/`parallel` call site shares: the function
/// to invoke is the last argument, everything before it is positional.
fn split_fn_and_args(mut args: Vec<Value>) -> (Value, Vec<Value>) {
    let fn_value = args.pop().unwrap_or(Value::Nil);
    (fn_value, args)
}
