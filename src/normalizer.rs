// Normalizes the raw AST into its evaluation form.
//
// The raw path operators (`.`, infix `[`, `{`, `^`, `@`, `#`) fold into
// Path nodes whose steps carry predicates, stages, grouping, sorting and
// focus/index bindings; `%` references resolve to ancestor slots; lambda
// bodies get tail-call marking so the evaluator can trampoline them.

use std::sync::Arc;

use crate::ast::{GroupBy, Node, NodeKind, SortTerm, Stage};
use crate::errors::{Error, Result};

/// An ancestor slot. `label` is the tuple-binding name recorded by the
/// step that was resolved as the ancestor; `level` counts how many more
/// steps back the `%` still has to travel during resolution.
#[derive(Debug, Clone)]
struct Slot {
    label: String,
    level: usize,
}

pub struct Normalizer {
    slots: Vec<Slot>,
}

/// Slot indices for `%` references not yet bound to a step. Threaded up
/// through containing nodes until a path resolves them.
type Pending = Vec<usize>;

/// Normalize a raw parse tree. Returns the evaluation AST plus the
/// ancestor slot labels, indexed by slot id.
pub fn normalize(node: Node) -> Result<(Node, Vec<String>)> {
    let mut n = Normalizer { slots: Vec::new() };
    let (result, pending) = n.process(node)?;
    if pending.iter().any(|s| n.slots[*s].level > 0) {
        return Err(Error::UnresolvedAncestor {
            position: result.position,
        });
    }
    let labels = n.slots.into_iter().map(|s| s.label).collect();
    Ok((result, labels))
}

impl Normalizer {
    fn process(&mut self, node: Node) -> Result<(Node, Pending)> {
        let keep = node.keep_array;
        let (mut result, pending) = self.process_kind(node)?;
        if keep {
            result.keep_array = true;
        }
        Ok((result, pending))
    }

    fn process_kind(&mut self, node: Node) -> Result<(Node, Pending)> {
        let position = node.position;
        match node.kind {
            NodeKind::PathOp(lhs, rhs) => self.fold_path(*lhs, *rhs, position),
            NodeKind::FilterOp(lhs, rhs) => self.fold_filter(*lhs, *rhs, position),
            NodeKind::GroupOp(lhs, pairs) => self.fold_group(*lhs, pairs, position),
            NodeKind::SortOp(lhs, terms) => self.fold_sort(*lhs, terms, position),
            NodeKind::FocusOp(lhs, name) => {
                let keep = node.keep_array;
                self.fold_focus(*lhs, name, keep)
            }
            NodeKind::IndexOp(lhs, name) => self.fold_index(*lhs, name, position),

            // a bare name starts a single-step path
            NodeKind::Name(_) => {
                let keep = node.keep_array;
                let mut path = Node::new(
                    NodeKind::Path { steps: vec![node] },
                    position,
                );
                if keep {
                    path.keep_singleton_array = true;
                }
                Ok((path, Vec::new()))
            }

            NodeKind::ParentOp => {
                let idx = self.slots.len();
                self.slots.push(Slot {
                    label: format!("!{}", idx),
                    level: 1,
                });
                Ok((Node::new(NodeKind::Parent(idx), position), vec![idx]))
            }

            NodeKind::Negate(expr) => {
                let (inner, pending) = self.process(*expr)?;
                if let NodeKind::Number(n) = inner.kind {
                    // constant-fold negated literals
                    return Ok((Node::new(NodeKind::Number(-n), position), pending));
                }
                Ok((
                    Node::new(NodeKind::Negate(Box::new(inner)), position),
                    pending,
                ))
            }

            NodeKind::Binary(op, lhs, rhs) => {
                let (l, mut pending) = self.process(*lhs)?;
                let (r, rp) = self.process(*rhs)?;
                pending.extend(rp);
                Ok((
                    Node::new(NodeKind::Binary(op, Box::new(l), Box::new(r)), position),
                    pending,
                ))
            }

            NodeKind::Apply(lhs, rhs) => {
                let (l, mut pending) = self.process(*lhs)?;
                let (r, rp) = self.process(*rhs)?;
                pending.extend(rp);
                Ok((
                    Node::new(NodeKind::Apply(Box::new(l), Box::new(r)), position),
                    pending,
                ))
            }

            NodeKind::Bind(name, rhs) => {
                let (r, pending) = self.process(*rhs)?;
                Ok((
                    Node::new(NodeKind::Bind(name, Box::new(r)), position),
                    pending,
                ))
            }

            NodeKind::Condition {
                condition,
                then_branch,
                else_branch,
            } => {
                let (c, mut pending) = self.process(*condition)?;
                let (t, tp) = self.process(*then_branch)?;
                pending.extend(tp);
                let e = match else_branch {
                    Some(e) => {
                        let (e, ep) = self.process(*e)?;
                        pending.extend(ep);
                        Some(Box::new(e))
                    }
                    None => None,
                };
                Ok((
                    Node::new(
                        NodeKind::Condition {
                            condition: Box::new(c),
                            then_branch: Box::new(t),
                            else_branch: e,
                        },
                        position,
                    ),
                    pending,
                ))
            }

            NodeKind::Block(exprs) => {
                let mut out = Vec::with_capacity(exprs.len());
                let mut pending = Vec::new();
                let mut cons = false;
                for expr in exprs {
                    let (part, pp) = self.process(expr)?;
                    pending.extend(pp);
                    if part.cons_array || first_step_is_cons(&part) {
                        cons = true;
                    }
                    out.push(part);
                }
                let mut block = Node::new(NodeKind::Block(out), position);
                block.cons_array = cons;
                Ok((block, pending))
            }

            NodeKind::ArrayCtor(items) => {
                let mut out = Vec::with_capacity(items.len());
                let mut pending = Vec::new();
                for item in items {
                    let (part, pp) = self.process(item)?;
                    pending.extend(pp);
                    out.push(part);
                }
                Ok((Node::new(NodeKind::ArrayCtor(out), position), pending))
            }

            NodeKind::ObjectCtor(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                let mut pending = Vec::new();
                for (k, v) in pairs {
                    let (k, kp) = self.process(k)?;
                    pending.extend(kp);
                    let (v, vp) = self.process(v)?;
                    pending.extend(vp);
                    out.push((k, v));
                }
                Ok((Node::new(NodeKind::ObjectCtor(out), position), pending))
            }

            NodeKind::Lambda {
                params,
                signature,
                body,
                thunk,
            } => {
                let body = Arc::try_unwrap(body).unwrap_or_else(|arc| (*arc).clone());
                let (body, _) = self.process(body)?;
                let body = tail_call_optimize(body);
                Ok((
                    Node::new(
                        NodeKind::Lambda {
                            params,
                            signature,
                            body: Arc::new(body),
                            thunk,
                        },
                        position,
                    ),
                    Vec::new(),
                ))
            }

            NodeKind::FunctionCall { procedure, args } => {
                let (procedure, _) = self.process(*procedure)?;
                let mut pending = Vec::new();
                let mut out = Vec::with_capacity(args.len());
                for arg in args {
                    let (a, ap) = self.process(arg)?;
                    pending.extend(ap);
                    out.push(a);
                }
                Ok((
                    Node::new(
                        NodeKind::FunctionCall {
                            procedure: Box::new(procedure),
                            args: out,
                        },
                        position,
                    ),
                    pending,
                ))
            }

            NodeKind::PartialCall { procedure, args } => {
                let (procedure, _) = self.process(*procedure)?;
                let mut out = Vec::with_capacity(args.len());
                for arg in args {
                    let (a, _) = self.process(arg)?;
                    out.push(a);
                }
                Ok((
                    Node::new(
                        NodeKind::PartialCall {
                            procedure: Box::new(procedure),
                            args: out,
                        },
                        position,
                    ),
                    Vec::new(),
                ))
            }

            NodeKind::Transform {
                pattern,
                update,
                delete,
            } => {
                let (pattern, _) = self.process(*pattern)?;
                let (update, _) = self.process(*update)?;
                let delete = match delete {
                    Some(d) => Some(Box::new(self.process(*d)?.0)),
                    None => None,
                };
                Ok((
                    Node::new(
                        NodeKind::Transform {
                            pattern: Box::new(pattern),
                            update: Box::new(update),
                            delete,
                        },
                        position,
                    ),
                    Vec::new(),
                ))
            }

            // terminals pass through untouched
            NodeKind::Null
            | NodeKind::Bool(_)
            | NodeKind::Number(_)
            | NodeKind::Str(_)
            | NodeKind::Regex(_)
            | NodeKind::Variable(_)
            | NodeKind::Wildcard
            | NodeKind::Descendant
            | NodeKind::Placeholder
            | NodeKind::ErrorStub => Ok((node, Vec::new())),

            // already-normalized kinds never reach here
            NodeKind::Path { .. }
            | NodeKind::Sort(_)
            | NodeKind::Parent(_) => Ok((node, Vec::new())),
        }
    }

    /// Fold a `.` operator into a Path node.
    fn fold_path(&mut self, lhs: Node, rhs: Node, position: usize) -> Result<(Node, Pending)> {
        let (lstep, mut pending) = self.process(lhs)?;
        let mut result = if matches!(lstep.kind, NodeKind::Path { .. }) {
            lstep
        } else {
            Node::new(NodeKind::Path { steps: vec![lstep] }, position)
        };

        let (mut rest, rpending) = self.process(rhs)?;
        if let NodeKind::Path { steps } = &mut result.kind {
            match rest.kind {
                NodeKind::Path { steps: rsteps } => steps.extend(rsteps),
                _ => {
                    // a predicated non-path node joining a path runs its
                    // filters as stages of the step
                    if !rest.predicates.is_empty() {
                        rest.stages
                            .extend(rest.predicates.drain(..).map(Stage::Filter));
                    }
                    steps.push(rest);
                }
            }

            for step in steps.iter_mut() {
                match &step.kind {
                    NodeKind::Number(n) => {
                        return Err(Error::LiteralPathStep {
                            token: n.to_string(),
                            position: step.position,
                        })
                    }
                    NodeKind::Bool(b) => {
                        return Err(Error::LiteralPathStep {
                            token: b.to_string(),
                            position: step.position,
                        })
                    }
                    NodeKind::Null => {
                        return Err(Error::LiteralPathStep {
                            token: "null".to_string(),
                            position: step.position,
                        })
                    }
                    NodeKind::Str(s) => {
                        step.kind = NodeKind::Name(s.clone());
                    }
                    _ => {}
                }
            }

            if steps.iter().any(|s| s.keep_array) {
                result.keep_singleton_array = true;
            }
            if let Some(first) = steps.first_mut() {
                if matches!(first.kind, NodeKind::ArrayCtor(_)) {
                    first.cons_array = true;
                }
            }
            if let Some(last) = steps.last_mut() {
                if matches!(last.kind, NodeKind::ArrayCtor(_)) {
                    last.cons_array = true;
                }
            }
        }

        let leftover = self.resolve_ancestry(&mut result, rpending)?;
        pending.extend(leftover);
        Ok((result, pending))
    }

    /// Fold an infix `[` into a predicate or stage on the relevant step.
    fn fold_filter(&mut self, lhs: Node, rhs: Node, position: usize) -> Result<(Node, Pending)> {
        let (mut result, mut pending) = self.process(lhs)?;
        let (predicate, ppending) = self.process(rhs)?;

        let is_path = matches!(result.kind, NodeKind::Path { .. });
        {
            let step = last_step_mut(&mut result);
            if step.group.is_some() {
                return Err(Error::PredicateAfterGroup { position });
            }
            for slot in &ppending {
                if self.slots[*slot].level == 1 {
                    self.seek_parent(step, *slot)?;
                } else {
                    self.slots[*slot].level -= 1;
                }
            }
            // a tuple-bearing step (focus/index/ancestor bindings) filters
            // over the tuple stream so the bindings are in scope; ordinary
            // steps filter their own results
            if is_path && (step.tuple || !step.stages.is_empty()) {
                step.stages.push(Stage::Filter(predicate));
            } else {
                step.predicates.push(predicate);
            }
        }
        pending.extend(ppending);
        Ok((result, pending))
    }

    fn fold_group(
        &mut self,
        lhs: Node,
        pairs: Vec<(Node, Node)>,
        position: usize,
    ) -> Result<(Node, Pending)> {
        let (mut result, pending) = self.process(lhs)?;
        if result.group.is_some() {
            return Err(Error::MultipleGroupings { position });
        }
        let mut out = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            let (k, _) = self.process(k)?;
            let (v, _) = self.process(v)?;
            out.push((k, v));
        }
        result.group = Some(GroupBy {
            pairs: out,
            position,
        });
        Ok((result, pending))
    }

    fn fold_sort(
        &mut self,
        lhs: Node,
        terms: Vec<SortTerm>,
        position: usize,
    ) -> Result<(Node, Pending)> {
        let (lstep, mut pending) = self.process(lhs)?;
        let mut result = if matches!(lstep.kind, NodeKind::Path { .. }) {
            lstep
        } else {
            Node::new(NodeKind::Path { steps: vec![lstep] }, position)
        };

        let mut term_pending = Vec::new();
        let mut out = Vec::with_capacity(terms.len());
        for term in terms {
            let (expr, tp) = self.process(term.expr)?;
            term_pending.extend(tp);
            out.push(SortTerm {
                expr,
                descending: term.descending,
            });
        }
        if let NodeKind::Path { steps } = &mut result.kind {
            steps.push(Node::new(NodeKind::Sort(out), position));
        }
        let leftover = self.resolve_ancestry(&mut result, term_pending)?;
        pending.extend(leftover);
        Ok((result, pending))
    }

    fn fold_focus(&mut self, lhs: Node, name: String, keep: bool) -> Result<(Node, Pending)> {
        let (mut result, pending) = self.process(lhs)?;
        let step = last_step_mut(&mut result);
        if !step.stages.is_empty() || !step.predicates.is_empty() {
            return Err(Error::BinderAfterPredicate {
                position: step.position,
            });
        }
        if matches!(step.kind, NodeKind::Sort(_)) {
            return Err(Error::BinderAfterSort {
                position: step.position,
            });
        }
        if keep {
            step.keep_array = true;
        }
        step.focus = Some(name);
        step.tuple = true;
        Ok((result, pending))
    }

    fn fold_index(&mut self, lhs: Node, name: String, position: usize) -> Result<(Node, Pending)> {
        let (mut result, pending) = self.process(lhs)?;
        let step = last_step_mut(&mut result);
        if step.stages.is_empty() {
            step.index = Some(name);
        } else {
            step.stages.push(Stage::Index(name));
        }
        step.tuple = true;
        let _ = position;
        Ok((result, pending))
    }

    /// Walk backward from the next-to-last step trying to bind each pending
    /// slot; slots that run off the front of the path propagate upward.
    fn resolve_ancestry(&mut self, path: &mut Node, pending: Pending) -> Result<Pending> {
        let steps = match &mut path.kind {
            NodeKind::Path { steps } => steps,
            _ => return Ok(pending),
        };
        let mut unresolved = Vec::new();
        for slot in pending {
            let mut index = steps.len() as isize - 2;
            while self.slots[slot].level > 0 {
                if index < 0 {
                    unresolved.push(slot);
                    break;
                }
                let mut step_idx = index as usize;
                index -= 1;
                // contiguous steps binding the same focus count once
                while index >= 0
                    && steps[step_idx].focus.is_some()
                    && steps[index as usize].focus.is_some()
                {
                    step_idx = index as usize;
                    index -= 1;
                }
                self.seek_parent(&mut steps[step_idx], slot)?;
            }
        }
        Ok(unresolved)
    }

    /// One backward hop of ancestor resolution across a single step.
    fn seek_parent(&mut self, node: &mut Node, slot: usize) -> Result<()> {
        match &node.kind {
            NodeKind::Name(_) | NodeKind::Wildcard => {
                self.slots[slot].level -= 1;
                if self.slots[slot].level == 0 {
                    match node.ancestor {
                        None => {}
                        Some(existing) => {
                            // two parents landing on one step share a label
                            self.slots[slot].label = self.slots[existing].label.clone();
                        }
                    }
                    node.ancestor = Some(slot);
                    node.tuple = true;
                }
                Ok(())
            }
            NodeKind::Parent(_) => {
                self.slots[slot].level += 1;
                Ok(())
            }
            NodeKind::Block(_) => {
                node.tuple = true;
                if let NodeKind::Block(exprs) = &mut node.kind {
                    if let Some(last) = exprs.last_mut() {
                        return self.seek_parent(last, slot);
                    }
                }
                Ok(())
            }
            NodeKind::Path { .. } => {
                node.tuple = true;
                if let NodeKind::Path { steps } = &mut node.kind {
                    let mut index = steps.len() as isize - 1;
                    while index >= 0 && self.slots[slot].level > 0 {
                        self.seek_parent(&mut steps[index as usize], slot)?;
                        index -= 1;
                    }
                }
                Ok(())
            }
            _ => Err(Error::UnresolvedAncestor {
                position: node.position,
            }),
        }
    }
}

fn last_step_mut(node: &mut Node) -> &mut Node {
    // borrow checker needs the path test split from the fallback
    if matches!(node.kind, NodeKind::Path { .. }) {
        if let NodeKind::Path { steps } = &mut node.kind {
            if let Some(last) = steps.last_mut() {
                return last;
            }
        }
        unreachable!("path with no steps")
    } else {
        node
    }
}

fn first_step_is_cons(node: &Node) -> bool {
    match &node.kind {
        NodeKind::Path { steps } => steps.first().map_or(false, |s| s.cons_array),
        _ => false,
    }
}

fn take(node: &mut Node) -> Node {
    std::mem::replace(node, Node::new(NodeKind::Null, 0))
}

/// Wrap tail-position calls in zero-parameter thunk lambdas so the apply
/// loop can trampoline them. Recurses through condition branches and the
/// final expression of blocks.
fn tail_call_optimize(mut node: Node) -> Node {
    let plain_call =
        matches!(node.kind, NodeKind::FunctionCall { .. }) && node.predicates.is_empty();
    if plain_call {
        let position = node.position;
        return Node::new(
            NodeKind::Lambda {
                params: Vec::new(),
                signature: None,
                body: Arc::new(node),
                thunk: true,
            },
            position,
        );
    }
    match &mut node.kind {
        NodeKind::Condition {
            then_branch,
            else_branch,
            ..
        } => {
            let t = take(then_branch);
            **then_branch = tail_call_optimize(t);
            if let Some(e) = else_branch {
                let ev = take(e);
                **e = tail_call_optimize(ev);
            }
            node
        }
        NodeKind::Block(exprs) => {
            if let Some(last) = exprs.last_mut() {
                let l = take(last);
                *last = tail_call_optimize(l);
            }
            node
        }
        _ => node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn norm(source: &str) -> Node {
        let raw = Parser::parse(source).unwrap();
        normalize(raw).unwrap().0
    }

    fn norm_err(source: &str) -> Error {
        let raw = Parser::parse(source).unwrap();
        normalize(raw).unwrap_err()
    }

    #[test]
    fn test_dot_chain_folds_into_one_path() {
        let node = norm("a.b.c");
        match node.kind {
            NodeKind::Path { steps } => {
                assert_eq!(steps.len(), 3);
                assert!(steps
                    .iter()
                    .all(|s| matches!(s.kind, NodeKind::Name(_))));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_string_step_becomes_name() {
        let node = norm("a.\"b\"");
        match node.kind {
            NodeKind::Path { steps } => {
                assert!(matches!(steps[1].kind, NodeKind::Name(ref n) if n == "b"));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_numeric_step_is_an_error() {
        assert_eq!(norm_err("a.2").code(), "S0213");
        assert_eq!(norm_err("a.true").code(), "S0213");
    }

    #[test]
    fn test_keep_array_propagates_to_path() {
        let node = norm("a[].b");
        assert!(node.keep_singleton_array);
    }

    #[test]
    fn test_predicate_lands_on_last_step() {
        let node = norm("a.b[0]");
        match node.kind {
            NodeKind::Path { steps } => {
                assert_eq!(steps[1].predicates.len(), 1);
                assert!(steps[0].predicates.is_empty());
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_double_grouping_is_an_error() {
        assert_eq!(norm_err("a{'k': v}{'k2': v}").code(), "S0210");
    }

    #[test]
    fn test_predicate_after_group_on_non_path() {
        assert_eq!(norm_err("$x{'k': v}[0]").code(), "S0209");
    }

    #[test]
    fn test_sort_becomes_path_step() {
        let node = norm("Product^(>Price)");
        match node.kind {
            NodeKind::Path { steps } => {
                assert!(matches!(steps.last().unwrap().kind, NodeKind::Sort(_)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_focus_binding_marks_tuple() {
        let node = norm("a@$item.b");
        match node.kind {
            NodeKind::Path { steps } => {
                assert_eq!(steps[0].focus.as_deref(), Some("item"));
                assert!(steps[0].tuple);
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_focus_after_predicate_is_an_error() {
        assert_eq!(norm_err("a[0]@$item").code(), "S0215");
    }

    #[test]
    fn test_index_after_sort_sets_index() {
        let node = norm("a#$i.b");
        match node.kind {
            NodeKind::Path { steps } => {
                assert_eq!(steps[0].index.as_deref(), Some("i"));
                assert!(steps[0].tuple);
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_ancestor_binds_to_enclosing_step() {
        // % inside the predicate refers to the `a` element enclosing `b`;
        // the binding is recorded on the `b` step, whose input is that
        // element
        let node = norm("a.b[%.c = 1]");
        match node.kind {
            NodeKind::Path { steps } => {
                assert!(steps[1].ancestor.is_some());
                assert!(steps[1].tuple);
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_unresolvable_ancestor_is_an_error() {
        assert_eq!(norm_err("%").code(), "S0217");
        assert_eq!(norm_err("%.a").code(), "S0217");
    }

    #[test]
    fn test_tail_call_marking() {
        let node = norm("function($n){ $n <= 1 ? 1 : $fact($n - 1) }");
        match node.kind {
            NodeKind::Lambda { body, .. } => match &body.kind {
                NodeKind::Condition { else_branch, .. } => {
                    let e = else_branch.as_ref().unwrap();
                    assert!(
                        matches!(e.kind, NodeKind::Lambda { thunk: true, .. }),
                        "tail call should be thunked: {:?}",
                        e.kind
                    );
                }
                other => panic!("unexpected body: {:?}", other),
            },
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_negative_literal_folds() {
        let node = norm("-5");
        assert!(matches!(node.kind, NodeKind::Number(n) if n == -5.0));
    }

    #[test]
    fn test_array_ctor_step_flagged_cons() {
        let node = norm("a.[b, c]");
        match node.kind {
            NodeKind::Path { steps } => {
                assert!(steps.last().unwrap().cons_array);
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }
}
