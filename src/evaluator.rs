// Tree-walking evaluator.
//
// One recursive `evaluate` per node, followed by a fixed post-pipeline:
// attached predicates, then grouping, then the sequence collapsing rule
// (empty sequence becomes Undefined, a singleton collapses to its element
// unless the keep-singleton flag is set). Paths iterate their steps over an
// input sequence, switching to tuple-stream mode as soon as any step
// carries bindings. Tail calls trampoline through pending-call thunks in
// `apply`, so recursion depth stays flat for tail-recursive functions.

use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::ast::{BinaryOp, GroupBy, Node, NodeKind, SortTerm, Stage};
use crate::errors::{Error, Result};
use crate::frame::Frame;
use crate::functions;
use crate::value::{
    append, ArrayFlags, Closure, NativeFunction, NativeImpl, PendingCall, Value,
};

/// Range results are capped at this many elements.
const MAX_RANGE_SIZE: f64 = 1e7;

/// Entry/exit instrumentation callback: (node, current input, frame).
pub type TraceHook = Arc<dyn Fn(&Node, &Value, &Frame) + Send + Sync>;

pub struct Evaluator {
    depth: usize,
    max_depth: usize,
    deadline: Option<Instant>,
    timestamp: DateTime<Utc>,
    slot_labels: Arc<Vec<String>>,
    entry_hook: Option<TraceHook>,
    exit_hook: Option<TraceHook>,
}

impl Evaluator {
    /// Limits and the $now/$millis timestamp come from the frame the
    /// evaluation runs under.
    pub fn new(slot_labels: Arc<Vec<String>>, frame: &Frame) -> Evaluator {
        let bounds = frame.bounds();
        Evaluator {
            depth: 0,
            max_depth: bounds.max_depth.unwrap_or(usize::MAX),
            deadline: bounds
                .timeout_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
            timestamp: DateTime::from_timestamp_millis(frame.timestamp_millis())
                .unwrap_or_else(Utc::now),
            slot_labels,
            entry_hook: None,
            exit_hook: None,
        }
    }

    pub fn set_hooks(&mut self, entry: Option<TraceHook>, exit: Option<TraceHook>) {
        self.entry_hook = entry;
        self.exit_hook = exit;
    }

    /// Timestamp captured when this evaluation started; $now and $millis
    /// are stable within one call.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Evaluate one node. The depth/timeout guard runs at every entry; the
    /// exit side restores the depth so sibling evaluations do not count as
    /// nested recursion.
    pub fn evaluate(&mut self, node: &Node, input: &Value, frame: &Frame) -> Result<Value> {
        self.depth += 1;
        if self.depth > self.max_depth {
            self.depth -= 1;
            return Err(Error::StackOverflow);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                self.depth -= 1;
                return Err(Error::Timeout);
            }
        }
        if let Some(hook) = &self.entry_hook {
            hook(node, input, frame);
        }

        let outcome = self.eval_kind(node, input, frame);

        if let Some(hook) = &self.exit_hook {
            hook(node, input, frame);
        }
        self.depth -= 1;
        let mut result = outcome?;

        for pred in &node.predicates {
            result = self.eval_filter(pred, result, frame)?;
        }
        if !matches!(node.kind, NodeKind::Path { .. }) {
            if let Some(group) = &node.group {
                result = self.eval_group(group, result, frame)?;
            }
        }

        Ok(collapse_sequence(result, node.keep_array))
    }

    fn eval_kind(&mut self, node: &Node, input: &Value, frame: &Frame) -> Result<Value> {
        match &node.kind {
            NodeKind::Null => Ok(Value::Null),
            NodeKind::Bool(b) => Ok(Value::Bool(*b)),
            NodeKind::Number(n) => Ok(Value::Number(*n)),
            NodeKind::Str(s) => Ok(Value::string(s.as_str())),
            NodeKind::Regex(re) => Ok(Value::Regex(Arc::clone(re))),

            NodeKind::Variable(name) => {
                if name.is_empty() {
                    // bare `$` is the evaluation context
                    Ok(unwrap_outer(input))
                } else {
                    Ok(frame.lookup(name))
                }
            }
            NodeKind::Name(name) => Ok(lookup_name(input, name)),
            NodeKind::Wildcard => Ok(eval_wildcard(input)),
            NodeKind::Descendant => Ok(eval_descendants(input)),
            NodeKind::Parent(slot) => Ok(frame.lookup(&self.slot_labels[*slot])),

            NodeKind::Block(exprs) => {
                // a block shares one child frame across its expressions
                let env = Frame::new_child(frame);
                let mut result = Value::Undefined;
                for expr in exprs {
                    result = self.evaluate(expr, input, &env)?;
                }
                Ok(result)
            }

            NodeKind::ArrayCtor(items) => {
                let mut result = Value::array(Vec::new());
                for item in items {
                    let value = self.evaluate(item, input, frame)?;
                    if value.is_undefined() {
                        continue;
                    }
                    if matches!(item.kind, NodeKind::ArrayCtor(_)) {
                        // nested literal arrays keep their structure
                        result.push(value);
                    } else {
                        result = append(result, value);
                    }
                }
                let flags = ArrayFlags {
                    cons: node.cons_array,
                    ..ArrayFlags::PLAIN
                };
                Ok(result.with_flags(flags))
            }

            NodeKind::ObjectCtor(pairs) => self.eval_pairs(pairs, node.position, input, frame),

            NodeKind::Negate(expr) => {
                let value = self.evaluate(expr, input, frame)?;
                match value {
                    Value::Undefined => Ok(Value::Undefined),
                    Value::Number(n) => Ok(Value::Number(-n)),
                    other => Err(Error::NegateNonNumber {
                        position: node.position,
                        value: other.to_string(),
                    }),
                }
            }

            NodeKind::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs, node.position, input, frame),

            NodeKind::Bind(name, rhs) => {
                let value = self.evaluate(rhs, input, frame)?;
                frame.bind(name.clone(), value.clone());
                Ok(value)
            }

            NodeKind::Condition {
                condition,
                then_branch,
                else_branch,
            } => {
                let c = self.evaluate(condition, input, frame)?;
                if c.truthy() == Some(true) {
                    self.evaluate(then_branch, input, frame)
                } else {
                    match else_branch {
                        Some(e) => self.evaluate(e, input, frame),
                        None => Ok(Value::Undefined),
                    }
                }
            }

            NodeKind::Lambda {
                params,
                signature,
                body,
                thunk,
            } => {
                if *thunk {
                    // the pending call is unpacked by the apply loop
                    Ok(Value::Thunk(Rc::new(PendingCall {
                        call: Arc::clone(body),
                        frame: frame.clone(),
                        input: input.clone(),
                    })))
                } else {
                    Ok(Value::Lambda(Rc::new(Closure {
                        params: params.clone(),
                        signature: signature.clone(),
                        body: Arc::clone(body),
                        frame: frame.clone(),
                        input: input.clone(),
                    })))
                }
            }

            NodeKind::FunctionCall { procedure, args } => {
                self.eval_function_call(procedure, args, input, frame, None)
            }

            NodeKind::PartialCall { procedure, args } => {
                self.eval_partial_call(procedure, args, input, frame)
            }

            NodeKind::Apply(lhs, rhs) => self.eval_apply(lhs, rhs, input, frame),

            NodeKind::Transform {
                pattern,
                update,
                delete,
            } => Ok(Value::Native(Rc::new(NativeFunction {
                name: "transform".to_string(),
                signature: None,
                imp: NativeImpl::Transformer {
                    pattern: Arc::new((**pattern).clone()),
                    update: Arc::new((**update).clone()),
                    delete: delete.as_ref().map(|d| Arc::new((**d).clone())),
                    frame: frame.clone(),
                },
            }))),

            NodeKind::Path { steps } => self.eval_path(node, steps, input, frame),

            NodeKind::Sort(terms) => {
                let seq = match input {
                    Value::Array(..) => input.clone(),
                    other => Value::singleton_sequence(other.clone()),
                };
                self.eval_sort(terms, &seq, frame, node.position)
            }

            NodeKind::Placeholder => Ok(Value::Undefined),
            NodeKind::ErrorStub => Err(Error::EvaluatedWithErrors),

            // raw operators never survive normalization
            NodeKind::ParentOp
            | NodeKind::PathOp(..)
            | NodeKind::FilterOp(..)
            | NodeKind::GroupOp(..)
            | NodeKind::SortOp(..)
            | NodeKind::FocusOp(..)
            | NodeKind::IndexOp(..) => Err(Error::EvaluatedWithErrors),
        }
    }

    // ── paths ────────────────────────────────────────────────────────────

    fn eval_path(
        &mut self,
        node: &Node,
        steps: &[Node],
        input: &Value,
        frame: &Frame,
    ) -> Result<Value> {
        // a leading variable reference makes the path absolute: the whole
        // input is one context item
        let first_is_var = matches!(steps.first().map(|s| &s.kind), Some(NodeKind::Variable(_)));
        let mut input_seq = match input {
            Value::Array(..) if !first_is_var => input.clone(),
            other => Value::singleton_sequence(other.clone()),
        };

        let mut result = Value::Undefined;
        let mut tuple_mode = false;
        let mut tuples: Option<Value> = None;
        let last = steps.len().saturating_sub(1);

        for (ii, step) in steps.iter().enumerate() {
            if step.tuple {
                tuple_mode = true;
            }
            if ii == 0 && step.cons_array {
                result = self.evaluate(step, &input_seq, frame)?;
            } else if tuple_mode {
                let tb = self.eval_tuple_step(step, &input_seq, tuples.as_ref(), frame)?;
                tuples = Some(tb);
            } else {
                result = self.eval_step(step, &input_seq, frame, ii == last)?;
            }

            if !tuple_mode {
                match &result {
                    Value::Undefined => break,
                    Value::Array(items, _) if items.is_empty() => break,
                    _ => {}
                }
                if step.focus.is_none() {
                    input_seq = result.clone();
                }
            }
        }

        if tuple_mode {
            let tuples = tuples.unwrap_or_else(empty_tuple_stream);
            if node.tuple {
                // ancestry still in flight: hand the tuple stream upward
                result = tuples.clone();
            } else {
                let mut out = Vec::new();
                if let Some(items) = tuples.items() {
                    for t in items {
                        out.push(t.get("@").cloned().unwrap_or(Value::Undefined));
                    }
                }
                result = Value::sequence(out);
            }
            if let Some(group) = &node.group {
                return self.eval_group(group, tuples, frame);
            }
        } else if let Some(group) = &node.group {
            return self.eval_group(group, result, frame);
        }

        if node.keep_singleton_array {
            if let Value::Array(_, flags) = &result {
                // a bare constructed array becomes the single element of
                // the kept sequence
                if flags.cons && !flags.sequence {
                    result = Value::singleton_sequence(result);
                }
            }
            if let Value::Array(items, mut flags) = result {
                flags.keep_singleton = true;
                result = Value::Array(items, flags);
            }
        }

        Ok(result)
    }

    fn eval_step(
        &mut self,
        step: &Node,
        input: &Value,
        frame: &Frame,
        last_step: bool,
    ) -> Result<Value> {
        if let NodeKind::Sort(terms) = &step.kind {
            let mut result = self.eval_sort(terms, input, frame, step.position)?;
            if !step.stages.is_empty() {
                result = self.eval_stages(&step.stages, result, frame)?;
            }
            return Ok(result);
        }

        let items: Vec<Value> = input.items().cloned().unwrap_or_default();
        let mut collected = Vec::new();
        for item in &items {
            let mut res = self.evaluate(step, item, frame)?;
            for stage in &step.stages {
                if let Stage::Filter(f) = stage {
                    res = self.eval_filter(f, res, frame)?;
                }
            }
            if !res.is_undefined() {
                collected.push(res);
            }
        }

        // the sole result of the final step keeps its own array identity
        if last_step && collected.len() == 1 {
            if let Value::Array(_, flags) = &collected[0] {
                if !flags.sequence {
                    return Ok(collected.remove(0));
                }
            }
        }

        let mut out = Vec::new();
        for res in collected {
            match res {
                Value::Array(items, flags) if !flags.cons => out.extend(items.iter().cloned()),
                other => out.push(other),
            }
        }
        Ok(Value::sequence(out))
    }

    fn eval_tuple_step(
        &mut self,
        step: &Node,
        input: &Value,
        tuples: Option<&Value>,
        frame: &Frame,
    ) -> Result<Value> {
        if let NodeKind::Sort(terms) = &step.kind {
            let mut result = match tuples {
                Some(t) => self.eval_sort(terms, t, frame, step.position)?,
                None => {
                    let sorted = self.eval_sort(terms, input, frame, step.position)?;
                    let mut recs = Vec::new();
                    if let Some(items) = sorted.items() {
                        for (i, item) in items.iter().enumerate() {
                            let mut rec = IndexMap::new();
                            rec.insert("@".to_string(), item.clone());
                            if let Some(index) = &step.index {
                                rec.insert(index.clone(), Value::from(i));
                            }
                            recs.push(Value::object(rec));
                        }
                    }
                    tuple_stream(recs)
                }
            };
            if !step.stages.is_empty() {
                result = self.eval_stages(&step.stages, result, frame)?;
            }
            return Ok(result);
        }

        let base: Vec<IndexMap<String, Value>> = match tuples {
            Some(t) => t
                .items()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|t| t.entries().cloned())
                        .collect()
                })
                .unwrap_or_default(),
            None => input
                .items()
                .map(|items| {
                    items
                        .iter()
                        .map(|item| {
                            let mut rec = IndexMap::new();
                            rec.insert("@".to_string(), item.clone());
                            rec
                        })
                        .collect()
                })
                .unwrap_or_default(),
        };

        let mut out = Vec::new();
        for rec in &base {
            let step_env = frame_from_tuple(frame, rec);
            let context = rec.get("@").cloned().unwrap_or(Value::Undefined);
            let res = self.evaluate(step, &context, &step_env)?;
            if res.is_undefined() {
                continue;
            }
            let res_is_tuple = res.is_tuple_stream();
            for (bb, r) in res.arrayify().into_iter().enumerate() {
                let mut tuple = rec.clone();
                if res_is_tuple {
                    // nested tuple stream: merge its bindings wholesale
                    if let Some(m) = r.entries() {
                        for (k, v) in m {
                            tuple.insert(k.clone(), v.clone());
                        }
                    }
                } else {
                    match &step.focus {
                        Some(focus) => {
                            // focus binds the result, the context stays put
                            tuple.insert(focus.clone(), r);
                        }
                        None => {
                            tuple.insert("@".to_string(), r);
                        }
                    }
                    if let Some(index) = &step.index {
                        tuple.insert(index.clone(), Value::from(bb));
                    }
                    if let Some(slot) = step.ancestor {
                        tuple.insert(self.slot_labels[slot].clone(), context.clone());
                    }
                }
                out.push(Value::object(tuple));
            }
        }

        let mut result = tuple_stream(out);
        if !step.stages.is_empty() {
            result = self.eval_stages(&step.stages, result, frame)?;
        }
        Ok(result)
    }

    fn eval_stages(&mut self, stages: &[Stage], mut input: Value, frame: &Frame) -> Result<Value> {
        for stage in stages {
            match stage {
                Stage::Filter(f) => {
                    input = self.eval_filter(f, input, frame)?;
                }
                Stage::Index(name) => {
                    if let Some(items) = input.items_mut() {
                        for (i, tuple) in items.iter_mut().enumerate() {
                            if let Some(m) = tuple.entries_mut() {
                                m.insert(name.clone(), Value::from(i));
                            }
                        }
                    }
                }
            }
        }
        Ok(input)
    }

    // ── filters ──────────────────────────────────────────────────────────

    fn eval_filter(&mut self, predicate: &Node, input: Value, frame: &Frame) -> Result<Value> {
        let tuple_stream_in = input.is_tuple_stream();
        let items: Vec<Value> = match input {
            Value::Array(items, _) => items.as_ref().clone(),
            other => vec![other],
        };

        let mut results = Vec::new();
        if let NodeKind::Number(n) = predicate.kind {
            // literal index shortcut
            let mut index = n.floor() as isize;
            if index < 0 {
                index += items.len() as isize;
            }
            if index >= 0 && (index as usize) < items.len() {
                let item = items[index as usize].clone();
                match item {
                    Value::Undefined => {}
                    Value::Array(..) => return Ok(item),
                    other => results.push(other),
                }
            }
        } else {
            for (index, item) in items.iter().enumerate() {
                let (context, env) = if tuple_stream_in {
                    let rec = item.entries().cloned();
                    let env = match item.entries() {
                        Some(m) => frame_from_tuple(frame, m),
                        None => frame.clone(),
                    };
                    let context = rec
                        .and_then(|m| m.get("@").cloned())
                        .unwrap_or(Value::Undefined);
                    (context, env)
                } else {
                    (item.clone(), frame.clone())
                };
                let res = self.evaluate(predicate, &context, &env)?;
                match number_list(&res) {
                    Some(nums) => {
                        // collect every index match for this item
                        for n in nums {
                            let mut ii = n.floor() as isize;
                            if ii < 0 {
                                ii += items.len() as isize;
                            }
                            if ii == index as isize {
                                results.push(item.clone());
                            }
                        }
                    }
                    None => {
                        if res.truthy() == Some(true) {
                            results.push(item.clone());
                        }
                    }
                }
            }
        }

        Ok(Value::Array(
            Rc::new(results),
            ArrayFlags {
                sequence: true,
                tuple_stream: tuple_stream_in,
                ..ArrayFlags::PLAIN
            },
        ))
    }

    // ── grouping / object construction ───────────────────────────────────

    fn eval_pairs(
        &mut self,
        pairs: &[(Node, Node)],
        position: usize,
        input: &Value,
        frame: &Frame,
    ) -> Result<Value> {
        let group = GroupBy {
            pairs: pairs.to_vec(),
            position,
        };
        self.eval_group(&group, input.clone(), frame)
    }

    fn eval_group(&mut self, group: &GroupBy, input: Value, frame: &Frame) -> Result<Value> {
        let reduce = input.is_tuple_stream();
        let mut items: Vec<Value> = match input {
            Value::Array(items, _) => items.as_ref().clone(),
            Value::Undefined => vec![],
            other => vec![other],
        };
        if items.is_empty() {
            // lets a literal object constructor produce a result even with
            // no context
            items.push(Value::Undefined);
        }

        // group the items by key; track which key expression produced each
        let mut groups: IndexMap<String, (Value, usize)> = IndexMap::new();
        for item in &items {
            let env = if reduce {
                match item.entries() {
                    Some(m) => frame_from_tuple(frame, m),
                    None => frame.clone(),
                }
            } else {
                frame.clone()
            };
            let context = if reduce {
                item.get("@").cloned().unwrap_or(Value::Undefined)
            } else {
                item.clone()
            };
            for (pair_index, (key_expr, _)) in group.pairs.iter().enumerate() {
                let key = self.evaluate(key_expr, &context, &env)?;
                let key = match key {
                    Value::Undefined => continue,
                    Value::String(s) => s.to_string(),
                    other => {
                        return Err(Error::NonStringKey {
                            position: group.position,
                            value: other.to_string(),
                        })
                    }
                };
                match groups.get_mut(&key) {
                    Some((data, expr_index)) => {
                        if *expr_index != pair_index {
                            return Err(Error::DuplicateGroupKey {
                                position: group.position,
                                key,
                            });
                        }
                        let bucket = std::mem::replace(data, Value::Undefined);
                        *data = append(bucket, item.clone());
                    }
                    None => {
                        groups.insert(key, (item.clone(), pair_index));
                    }
                }
            }
        }

        let mut result = IndexMap::new();
        for (key, (data, expr_index)) in groups {
            let (context, env) = if reduce {
                let mut merged = reduce_tuple_stream(&data);
                let context = merged.shift_remove("@").unwrap_or(Value::Undefined);
                (context, frame_from_tuple(frame, &merged))
            } else {
                (data, frame.clone())
            };
            let value = self.evaluate(&group.pairs[expr_index].1, &context, &env)?;
            if !value.is_undefined() {
                result.insert(key, value);
            }
        }
        Ok(Value::object(result))
    }

    // ── sorting ──────────────────────────────────────────────────────────

    fn eval_sort(
        &mut self,
        terms: &[SortTerm],
        input: &Value,
        frame: &Frame,
        position: usize,
    ) -> Result<Value> {
        let tuple_sort = input.is_tuple_stream();
        let items: Vec<Value> = match input.items() {
            Some(items) => items.clone(),
            None => return Ok(input.clone()),
        };

        let sorted = functions::merge_sort(items, &mut |a, b| {
            self.compare_sort_items(terms, a, b, tuple_sort, frame, position)
        })?;

        Ok(Value::Array(
            Rc::new(sorted),
            ArrayFlags {
                sequence: true,
                tuple_stream: tuple_sort,
                ..ArrayFlags::PLAIN
            },
        ))
    }

    /// True when `a` must come after `b`. Terms apply in order; undefined
    /// sorts last; each descending term flips its own comparison only.
    fn compare_sort_items(
        &mut self,
        terms: &[SortTerm],
        a: &Value,
        b: &Value,
        tuple_sort: bool,
        frame: &Frame,
        position: usize,
    ) -> Result<bool> {
        let mut comp = std::cmp::Ordering::Equal;
        for term in terms {
            if comp != std::cmp::Ordering::Equal {
                break;
            }
            let aa = self.eval_sort_term(&term.expr, a, tuple_sort, frame)?;
            let bb = self.eval_sort_term(&term.expr, b, tuple_sort, frame)?;

            comp = match (&aa, &bb) {
                (Value::Undefined, Value::Undefined) => std::cmp::Ordering::Equal,
                (Value::Undefined, _) => std::cmp::Ordering::Greater,
                (_, Value::Undefined) => std::cmp::Ordering::Less,
                (Value::Number(x), Value::Number(y)) => {
                    x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal)
                }
                (Value::String(x), Value::String(y)) => x.cmp(y),
                (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
                    return Err(Error::SortTypeMismatch {
                        position,
                        left: aa.to_string(),
                        right: bb.to_string(),
                    })
                }
                _ => return Err(Error::NonComparableSortTerm { position }),
            };
            if term.descending {
                comp = comp.reverse();
            }
        }
        Ok(comp == std::cmp::Ordering::Greater)
    }

    fn eval_sort_term(
        &mut self,
        expr: &Node,
        item: &Value,
        tuple_sort: bool,
        frame: &Frame,
    ) -> Result<Value> {
        if tuple_sort {
            let env = match item.entries() {
                Some(m) => frame_from_tuple(frame, m),
                None => frame.clone(),
            };
            let context = item.get("@").cloned().unwrap_or(Value::Undefined);
            self.evaluate(expr, &context, &env)
        } else {
            self.evaluate(expr, item, frame)
        }
    }

    // ── binary operators ─────────────────────────────────────────────────

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Node,
        rhs: &Node,
        position: usize,
        input: &Value,
        frame: &Frame,
    ) -> Result<Value> {
        // and/or evaluate the right side lazily
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let l = self.evaluate(lhs, input, frame)?.truthy().unwrap_or(false);
            let result = match op {
                BinaryOp::And => {
                    l && self.evaluate(rhs, input, frame)?.truthy().unwrap_or(false)
                }
                _ => l || self.evaluate(rhs, input, frame)?.truthy().unwrap_or(false),
            };
            return Ok(Value::Bool(result));
        }

        let l = self.evaluate(lhs, input, frame)?;
        let r = self.evaluate(rhs, input, frame)?;
        match op {
            BinaryOp::Add
            | BinaryOp::Subtract
            | BinaryOp::Multiply
            | BinaryOp::Divide
            | BinaryOp::Modulo => numeric_binary(op, &l, &r, position),
            BinaryOp::Equal => Ok(Value::Bool(equals(&l, &r))),
            BinaryOp::NotEqual => Ok(Value::Bool(!equals(&l, &r))),
            BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
                comparison_binary(op, &l, &r, position)
            }
            BinaryOp::Concat => {
                let mut s = functions::stringify(&l);
                s.push_str(&functions::stringify(&r));
                Ok(Value::string(s))
            }
            BinaryOp::In => {
                if l.is_undefined() || r.is_undefined() {
                    return Ok(Value::Bool(false));
                }
                let found = match r.items() {
                    Some(items) => items.iter().any(|v| equals(v, &l)),
                    None => equals(&r, &l),
                };
                Ok(Value::Bool(found))
            }
            BinaryOp::Range => range_binary(&l, &r, position),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    // ── function invocation ──────────────────────────────────────────────

    fn eval_function_call(
        &mut self,
        procedure: &Node,
        args: &[Node],
        input: &Value,
        frame: &Frame,
        prepend: Option<Value>,
    ) -> Result<Value> {
        let proc = self.evaluate(procedure, input, frame)?;

        if proc.is_undefined() {
            if let Some(name) = path_head_name(procedure) {
                if !frame.lookup(name).is_undefined() {
                    return Err(Error::InvokeNonFunctionSuggest {
                        position: procedure.position,
                        name: name.to_string(),
                    });
                }
            }
        }

        let mut eargs = Vec::with_capacity(args.len() + 1);
        if let Some(context_arg) = prepend {
            eargs.push(context_arg);
        }
        for arg in args {
            eargs.push(self.evaluate(arg, input, frame)?);
        }
        self.apply(&proc, &eargs, input, procedure.position)
    }

    fn eval_partial_call(
        &mut self,
        procedure: &Node,
        args: &[Node],
        input: &Value,
        frame: &Frame,
    ) -> Result<Value> {
        let proc = self.evaluate(procedure, input, frame)?;
        if !proc.is_function() {
            if let Some(name) = path_head_name(procedure) {
                if !frame.lookup(name).is_undefined() {
                    return Err(Error::PartialNonFunctionSuggest {
                        position: procedure.position,
                        name: name.to_string(),
                    });
                }
            }
            return Err(Error::PartialNonFunction {
                position: procedure.position,
            });
        }

        let mut bound = Vec::with_capacity(args.len());
        for arg in args {
            if matches!(arg.kind, NodeKind::Placeholder) {
                bound.push(None);
            } else {
                bound.push(Some(self.evaluate(arg, input, frame)?));
            }
        }
        Ok(Value::Native(Rc::new(NativeFunction {
            name: "partial".to_string(),
            signature: None,
            imp: NativeImpl::Partial {
                target: proc,
                bound,
            },
        })))
    }

    fn eval_apply(&mut self, lhs: &Node, rhs: &Node, input: &Value, frame: &Frame) -> Result<Value> {
        let l = self.evaluate(lhs, input, frame)?;

        if let NodeKind::FunctionCall { procedure, args } = &rhs.kind {
            // `x ~> f(a)` invokes f with x as its first argument
            return self.eval_function_call(procedure, args, input, frame, Some(l));
        }

        let f = self.evaluate(rhs, input, frame)?;
        if !f.is_function() {
            return Err(Error::ApplyRhsNotFunction {
                position: rhs.position,
            });
        }
        if l.is_function() {
            // function chaining composes rather than applies
            return Ok(Value::Native(Rc::new(NativeFunction {
                name: "compose".to_string(),
                signature: None,
                imp: NativeImpl::Compose {
                    first: l,
                    second: f,
                },
            })));
        }
        self.apply(&f, &[l], input, rhs.position)
    }

    /// Apply a function value, trampolining any pending tail calls: a
    /// thunk result re-evaluates the wrapped call in its own captured
    /// frame and input, so tail recursion loops here instead of on the
    /// stack.
    pub fn apply(
        &mut self,
        proc: &Value,
        args: &[Value],
        context: &Value,
        position: usize,
    ) -> Result<Value> {
        let mut result = self.apply_inner(proc, args, context, position)?;
        while let Value::Thunk(pending) = result {
            if let NodeKind::FunctionCall {
                procedure,
                args: arg_nodes,
            } = &pending.call.kind
            {
                let next = self.evaluate(procedure, &pending.input, &pending.frame)?;
                let mut eargs = Vec::with_capacity(arg_nodes.len());
                for arg in arg_nodes {
                    eargs.push(self.evaluate(arg, &pending.input, &pending.frame)?);
                }
                result = self.apply_inner(&next, &eargs, context, pending.call.position)?;
            } else {
                result = self.evaluate(&pending.call, &pending.input, &pending.frame)?;
            }
        }
        Ok(result)
    }

    fn apply_inner(
        &mut self,
        proc: &Value,
        args: &[Value],
        context: &Value,
        position: usize,
    ) -> Result<Value> {
        match proc {
            Value::Lambda(closure) => {
                let validated = match &closure.signature {
                    Some(sig) => sig.validate("lambda", args, context)?,
                    None => args.to_vec(),
                };
                let env = Frame::new_child(&closure.frame);
                for (i, param) in closure.params.iter().enumerate() {
                    env.bind(
                        param.clone(),
                        validated.get(i).cloned().unwrap_or(Value::Undefined),
                    );
                }
                self.evaluate(&closure.body, &closure.input, &env)
            }
            Value::Native(nf) => match &nf.imp {
                NativeImpl::Builtin(f) => {
                    let validated = match &nf.signature {
                        Some(sig) => sig.validate(&nf.name, args, context)?,
                        None => args.to_vec(),
                    };
                    f(self, context, &validated)
                }
                NativeImpl::Partial { target, bound } => {
                    let mut queue = args.iter();
                    let mut merged = Vec::with_capacity(bound.len());
                    for slot in bound {
                        match slot {
                            Some(v) => merged.push(v.clone()),
                            None => {
                                merged.push(queue.next().cloned().unwrap_or(Value::Undefined))
                            }
                        }
                    }
                    merged.extend(queue.cloned());
                    self.apply(target, &merged, context, position)
                }
                NativeImpl::Compose { first, second } => {
                    let mid = self.apply(first, args, context, position)?;
                    self.apply(second, &[mid], context, position)
                }
                NativeImpl::Transformer {
                    pattern,
                    update,
                    delete,
                    frame,
                } => self.apply_transformer(pattern, update, delete.as_deref(), frame, args.first()),
            },
            Value::Regex(re) => match args.first() {
                Some(Value::String(s)) => Ok(regex_match_value(re, s)),
                _ => Ok(Value::Undefined),
            },
            _ => Err(Error::InvokeNonFunction { position }),
        }
    }

    // ── transforms ───────────────────────────────────────────────────────

    fn apply_transformer(
        &mut self,
        pattern: &Arc<Node>,
        update: &Arc<Node>,
        delete: Option<&Node>,
        tframe: &Frame,
        arg: Option<&Value>,
    ) -> Result<Value> {
        let arg = match arg {
            Some(v) if !v.is_undefined() => v,
            _ => return Ok(Value::Undefined),
        };
        let cloned = arg.deep_clone();
        let matches = self.evaluate(pattern, &cloned, tframe)?;

        // the matches share Rc pointers with the clone, so edits can be
        // located in the tree by pointer identity
        let mut edits: Vec<(usize, IndexMap<String, Value>, Vec<String>)> = Vec::new();
        for m in matches.arrayify() {
            let target = match &m {
                Value::Object(rc) => Rc::as_ptr(rc) as usize,
                _ => continue,
            };
            let update_val = self.evaluate(update, &m, tframe)?;
            let merge = match &update_val {
                Value::Object(map) => (**map).clone(),
                Value::Undefined => IndexMap::new(),
                other => {
                    return Err(Error::TransformUpdateNotObject {
                        position: update.position,
                        value: other.to_string(),
                    })
                }
            };
            let mut deletions = Vec::new();
            if let Some(delete_expr) = delete {
                let dv = self.evaluate(delete_expr, &m, tframe)?;
                match &dv {
                    Value::Undefined => {}
                    Value::String(s) => deletions.push(s.to_string()),
                    Value::Array(items, _) if items.iter().all(|v| v.is_string()) => {
                        for v in items.iter() {
                            if let Some(s) = v.as_str() {
                                deletions.push(s.to_string());
                            }
                        }
                    }
                    other => {
                        return Err(Error::TransformDeleteNotStrings {
                            position: delete_expr.position,
                            value: other.to_string(),
                        })
                    }
                }
            }
            edits.push((target, merge, deletions));
        }

        if edits.is_empty() {
            return Ok(cloned);
        }
        Ok(rewrite_with_edits(&cloned, &edits))
    }
}

// ── free helpers ─────────────────────────────────────────────────────────────

fn collapse_sequence(result: Value, keep_array: bool) -> Value {
    match result {
        Value::Array(items, mut flags) if flags.sequence && !flags.tuple_stream => {
            if keep_array {
                flags.keep_singleton = true;
            }
            if items.is_empty() {
                Value::Undefined
            } else if items.len() == 1 && !flags.keep_singleton {
                match Rc::try_unwrap(items) {
                    Ok(mut v) => v.pop().unwrap_or(Value::Undefined),
                    Err(rc) => rc[0].clone(),
                }
            } else {
                Value::Array(items, flags)
            }
        }
        other => other,
    }
}

fn unwrap_outer(input: &Value) -> Value {
    if input.flags().outer_wrapper {
        input
            .items()
            .and_then(|items| items.first())
            .cloned()
            .unwrap_or(Value::Undefined)
    } else {
        input.clone()
    }
}

/// A frame carrying all of a tuple's bindings.
pub(crate) fn frame_from_tuple(parent: &Frame, tuple: &IndexMap<String, Value>) -> Frame {
    let env = Frame::new_child(parent);
    for (k, v) in tuple {
        env.bind(k.clone(), v.clone());
    }
    env
}

fn empty_tuple_stream() -> Value {
    tuple_stream(Vec::new())
}

fn tuple_stream(records: Vec<Value>) -> Value {
    Value::Array(
        Rc::new(records),
        ArrayFlags {
            sequence: true,
            tuple_stream: true,
            ..ArrayFlags::PLAIN
        },
    )
}

fn reduce_tuple_stream(data: &Value) -> IndexMap<String, Value> {
    let items = match data.items() {
        Some(items) => items,
        None => return data.entries().cloned().unwrap_or_default(),
    };
    let mut merged: IndexMap<String, Value> = items
        .first()
        .and_then(|t| t.entries())
        .cloned()
        .unwrap_or_default();
    for tuple in items.iter().skip(1) {
        if let Some(m) = tuple.entries() {
            for (k, v) in m {
                let existing = merged.shift_remove(k).unwrap_or(Value::Undefined);
                merged.insert(k.clone(), append(existing, v.clone()));
            }
        }
    }
    merged
}

/// Field lookup: maps over arrays, indexes into objects, undefined
/// elsewhere.
pub(crate) fn lookup_name(input: &Value, key: &str) -> Value {
    match input {
        Value::Array(items, _) => {
            let mut out = Vec::new();
            for item in items.iter() {
                match lookup_name(item, key) {
                    Value::Undefined => {}
                    Value::Array(inner, _) => out.extend(inner.iter().cloned()),
                    other => out.push(other),
                }
            }
            Value::sequence(out)
        }
        Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

fn eval_wildcard(input: &Value) -> Value {
    let input = unwrap_outer(input);
    let mut out = Vec::new();
    match &input {
        Value::Object(map) => {
            for value in map.values() {
                push_flattened(value, &mut out);
            }
        }
        Value::Array(items, _) => {
            for value in items.iter() {
                push_flattened(value, &mut out);
            }
        }
        _ => {}
    }
    Value::sequence(out)
}

fn push_flattened(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items, _) => {
            for v in items.iter() {
                push_flattened(v, out);
            }
        }
        other => out.push(other.clone()),
    }
}

fn eval_descendants(input: &Value) -> Value {
    if input.is_undefined() {
        return Value::Undefined;
    }
    let mut out = Vec::new();
    recurse_descendants(input, &mut out);
    Value::sequence(out)
}

fn recurse_descendants(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Undefined => {}
        Value::Array(items, _) => {
            for v in items.iter() {
                recurse_descendants(v, out);
            }
        }
        Value::Object(map) => {
            out.push(value.clone());
            for v in map.values() {
                recurse_descendants(v, out);
            }
        }
        other => out.push(other.clone()),
    }
}

/// Deep structural equality with numeric widening; NaN never equals.
pub(crate) fn equals(a: &Value, b: &Value) -> bool {
    if a.is_undefined() || b.is_undefined() {
        return false;
    }
    a == b
}

fn numeric_binary(op: BinaryOp, l: &Value, r: &Value, position: usize) -> Result<Value> {
    if !l.is_undefined() && !l.is_number() {
        return Err(Error::LhsNotNumber {
            position,
            op: op.symbol().to_string(),
        });
    }
    if !r.is_undefined() && !r.is_number() {
        return Err(Error::RhsNotNumber {
            position,
            op: op.symbol().to_string(),
        });
    }
    let (x, y) = match (l.as_f64(), r.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Ok(Value::Undefined),
    };
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Subtract => x - y,
        BinaryOp::Multiply => x * y,
        BinaryOp::Divide => x / y,
        BinaryOp::Modulo => x % y,
        _ => unreachable!("not an arithmetic operator"),
    };
    if !result.is_finite() {
        return Err(Error::NumericOverflow {
            value: result.to_string(),
        });
    }
    Ok(Value::Number(result))
}

fn comparison_binary(op: BinaryOp, l: &Value, r: &Value, position: usize) -> Result<Value> {
    let comparable = |v: &Value| v.is_undefined() || v.is_string() || v.is_number();
    if !comparable(l) || !comparable(r) {
        return Err(Error::NotComparable {
            position,
            op: op.symbol().to_string(),
        });
    }
    if l.is_undefined() || r.is_undefined() {
        return Ok(Value::Undefined);
    }
    let ordering = match (l, r) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => {
            return Err(Error::ComparisonTypeMismatch {
                position,
                op: op.symbol().to_string(),
                left: l.to_string(),
                right: r.to_string(),
            })
        }
    };
    let ordering = match ordering {
        Some(o) => o,
        None => return Ok(Value::Bool(false)),
    };
    let result = match op {
        BinaryOp::Less => ordering.is_lt(),
        BinaryOp::LessEqual => ordering.is_le(),
        BinaryOp::Greater => ordering.is_gt(),
        BinaryOp::GreaterEqual => ordering.is_ge(),
        _ => unreachable!("not a comparison operator"),
    };
    Ok(Value::Bool(result))
}

fn range_binary(l: &Value, r: &Value, position: usize) -> Result<Value> {
    if !l.is_undefined() && !l.is_integer() {
        return Err(Error::RangeLhsNotInteger { position });
    }
    if !r.is_undefined() && !r.is_integer() {
        return Err(Error::RangeRhsNotInteger { position });
    }
    let (x, y) = match (l.as_f64(), r.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Ok(Value::Undefined),
    };
    if x > y {
        return Ok(Value::Undefined);
    }
    let size = y - x + 1.0;
    if size > MAX_RANGE_SIZE {
        return Err(Error::RangeTooLarge {
            position,
            size: size as u64,
        });
    }
    let mut items = Vec::with_capacity(size as usize);
    let mut n = x;
    while n <= y {
        items.push(Value::Number(n));
        n += 1.0;
    }
    Ok(Value::sequence(items))
}

/// Numbers produced by a predicate, treated as index selectors: a single
/// number or an array of only numbers.
fn number_list(value: &Value) -> Option<Vec<f64>> {
    match value {
        Value::Number(n) => Some(vec![*n]),
        Value::Array(items, _) => {
            let mut nums = Vec::with_capacity(items.len());
            for v in items.iter() {
                nums.push(v.as_f64()?);
            }
            Some(nums)
        }
        _ => None,
    }
}

fn path_head_name(procedure: &Node) -> Option<&str> {
    match &procedure.kind {
        NodeKind::Path { steps } => match steps.first().map(|s| &s.kind) {
            Some(NodeKind::Name(name)) => Some(name),
            _ => None,
        },
        NodeKind::Name(name) => Some(name),
        _ => None,
    }
}

fn regex_match_value(re: &regex::Regex, s: &str) -> Value {
    match re.captures(s) {
        Some(caps) => match caps.get(0) {
            Some(whole) => {
                let groups: Vec<Value> = caps
                    .iter()
                    .skip(1)
                    .map(|g| match g {
                        Some(g) => Value::string(g.as_str()),
                        None => Value::Undefined,
                    })
                    .collect();
                let mut m = IndexMap::new();
                m.insert("match".to_string(), Value::string(whole.as_str()));
                m.insert("index".to_string(), Value::from(whole.start()));
                m.insert("groups".to_string(), Value::array(groups));
                Value::object(m)
            }
            None => Value::Undefined,
        },
        None => Value::Undefined,
    }
}

fn rewrite_with_edits(
    value: &Value,
    edits: &[(usize, IndexMap<String, Value>, Vec<String>)],
) -> Value {
    match value {
        Value::Object(map) => {
            let ptr = Rc::as_ptr(map) as usize;
            let mut out: IndexMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), rewrite_with_edits(v, edits)))
                .collect();
            if let Some((_, merge, deletions)) = edits.iter().find(|(p, _, _)| *p == ptr) {
                for (k, v) in merge {
                    out.insert(k.clone(), v.clone());
                }
                for key in deletions {
                    out.shift_remove(key);
                }
            }
            Value::Object(Rc::new(out))
        }
        Value::Array(items, flags) => Value::Array(
            Rc::new(items.iter().map(|v| rewrite_with_edits(v, edits)).collect()),
            *flags,
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collapse_empty_sequence_to_undefined() {
        let seq = Value::sequence(vec![]);
        assert!(collapse_sequence(seq, false).is_undefined());
    }

    #[test]
    fn test_collapse_singleton_unless_kept() {
        let seq = Value::sequence(vec![Value::from(7.0)]);
        assert_eq!(collapse_sequence(seq, false), Value::from(7.0));

        let seq = Value::sequence(vec![Value::from(7.0)]);
        let kept = collapse_sequence(seq, true);
        assert_eq!(kept.items().map(Vec::len), Some(1));
    }

    #[test]
    fn test_collapse_leaves_plain_arrays_alone() {
        let arr = Value::array(vec![Value::from(1.0)]);
        assert_eq!(collapse_sequence(arr.clone(), false), arr);
    }

    #[test]
    fn test_lookup_name_maps_over_arrays() {
        let input = Value::from(json!([{"a": 1}, {"b": 2}, {"a": 3}]));
        let result = lookup_name(&input, "a");
        let nums: Vec<f64> = result.items().unwrap().iter().filter_map(Value::as_f64).collect();
        assert_eq!(nums, vec![1.0, 3.0]);
        assert!(lookup_name(&Value::from(5.0), "a").is_undefined());
    }

    #[test]
    fn test_wildcard_flattens_nested_arrays() {
        let input = Value::from(json!({"a": [1, [2, 3]], "b": 4}));
        let result = eval_wildcard(&input);
        let nums: Vec<f64> = result.items().unwrap().iter().filter_map(Value::as_f64).collect();
        assert_eq!(nums, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_descendants_visit_objects_and_leaves() {
        let input = Value::from(json!({"a": {"b": 1}}));
        let result = eval_descendants(&input);
        // the root object, the nested object, and the leaf
        assert_eq!(result.items().map(Vec::len), Some(3));
    }

    #[test]
    fn test_equals_never_matches_undefined() {
        assert!(!equals(&Value::Undefined, &Value::Undefined));
        assert!(equals(&Value::from(1.0), &Value::from(1.0)));
        assert!(!equals(&Value::from(1.0), &Value::from("1")));
    }

    #[test]
    fn test_arithmetic_type_error_beats_undefined() {
        // a non-numeric operand errors even when the other side is missing
        let err = numeric_binary(BinaryOp::Add, &Value::from("x"), &Value::Undefined, 0)
            .unwrap_err();
        assert_eq!(err.code(), "T2001");
        let ok = numeric_binary(BinaryOp::Add, &Value::from(1.0), &Value::Undefined, 0).unwrap();
        assert!(ok.is_undefined());
    }

    #[test]
    fn test_arithmetic_overflow_is_d1001() {
        let err = numeric_binary(BinaryOp::Multiply, &Value::from(1e308), &Value::from(10.0), 0)
            .unwrap_err();
        assert_eq!(err.code(), "D1001");
    }

    #[test]
    fn test_range_descending_is_undefined() {
        assert!(range_binary(&Value::from(4.0), &Value::from(1.0), 0)
            .unwrap()
            .is_undefined());
        let err = range_binary(&Value::from(1.5), &Value::from(3.0), 0).unwrap_err();
        assert_eq!(err.code(), "T2003");
    }

    #[test]
    fn test_number_list_rejects_mixed_arrays() {
        assert_eq!(number_list(&Value::from(2.0)), Some(vec![2.0]));
        let mixed = Value::array(vec![Value::from(1.0), Value::from("x")]);
        assert_eq!(number_list(&mixed), None);
    }

    #[test]
    fn test_reduce_tuple_stream_appends_per_key() {
        let mut a = IndexMap::new();
        a.insert("@".to_string(), Value::from(1.0));
        let mut b = IndexMap::new();
        b.insert("@".to_string(), Value::from(2.0));
        let stream = tuple_stream(vec![Value::object(a), Value::object(b)]);
        let merged = reduce_tuple_stream(&stream);
        let ctx = merged.get("@").unwrap();
        assert_eq!(ctx.items().map(Vec::len), Some(2));
    }
}
