use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::ast::{BinOp, Block, Expr, InterpPart, MacroDef, Node, Path, Reference, Segment, Span, UnOp};
use crate::error::{TemplateError, TemplateResult};
use crate::loader::Loader;
use crate::namespace::Namespace;
use crate::value::{self, compare_values, MacroValue, OpError, Value};
use crate::{parser, RenderOptions, Template};

/// Whether rendering continues past the current node. `#stop` raises `Stop`,
/// which unwinds to the nearest template boundary (`merge`, `#parse`,
/// `#evaluate`) and is absorbed there.
pub(crate) enum Flow {
    Continue,
    Stop,
}

pub(crate) fn render(
    template: &Template,
    context: &Value,
    loader: &dyn Loader,
    out: &mut dyn fmt::Write,
) -> TemplateResult<()> {
    let mut evaluator = Evaluator {
        ns: Namespace::new(context.clone()),
        loader,
        options: &template.options,
        name: template.name().to_string(),
        define_guard: HashSet::new(),
    };
    evaluator.render_block(&template.root, out)?;
    Ok(())
}

struct Evaluator<'a> {
    ns: Namespace,
    loader: &'a dyn Loader,
    options: &'a RenderOptions,
    /// Name of the template currently being walked; swapped around `#parse`.
    name: String,
    /// `Arc` identities of the `#define` bodies currently rendering, to cut
    /// off self-referential definitions.
    define_guard: HashSet<usize>,
}

/// Resolved assignment step: names stay names, index expressions are
/// evaluated up front so navigation is purely structural.
enum Step<'s> {
    Name(&'s str),
    Key(Value),
}

impl<'a> Evaluator<'a> {
    fn render_block(&mut self, block: &Block, out: &mut dyn fmt::Write) -> TemplateResult<Flow> {
        for node in &block.nodes {
            if let Flow::Stop = self.render_node(node, out)? {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn render_node(&mut self, node: &Node, out: &mut dyn fmt::Write) -> TemplateResult<Flow> {
        match node {
            Node::Text(text) => {
                self.write(out, text)?;
                Ok(Flow::Continue)
            }
            Node::Noescape(text) => {
                self.write(out, text)?;
                Ok(Flow::Continue)
            }
            Node::Reference(reference) => {
                self.render_reference(reference, out)?;
                Ok(Flow::Continue)
            }
            Node::If {
                branches,
                else_body,
            } => {
                for (condition, body) in branches {
                    let span = condition_span(condition);
                    if self.eval_expr(condition, span)?.is_truthy() {
                        return self.render_block(body, out);
                    }
                }
                match else_body {
                    Some(body) => self.render_block(body, out),
                    None => Ok(Flow::Continue),
                }
            }
            Node::Foreach {
                var,
                iterable,
                body,
                span,
            } => self.render_foreach(var, iterable, body, *span, out),
            Node::Set {
                target,
                value,
                span,
            } => {
                let value = self.eval_expr(value, *span)?;
                self.assign(target, value, *span)?;
                Ok(Flow::Continue)
            }
            Node::MacroDef(def) => {
                self.ns.define_macro(def.clone());
                Ok(Flow::Continue)
            }
            Node::Define(def) => {
                self.ns
                    .define_local(&def.name, Value::Macro(MacroValue(def.clone())));
                Ok(Flow::Continue)
            }
            Node::MacroCall { name, args, span } => self.call_macro(name, args, *span, out),
            Node::Include { names, span } => {
                for name_expr in names {
                    let name = self.template_name_arg(name_expr, *span, "#include")?;
                    let text = self.loader.load_text(&name)?;
                    self.write(out, &text)?;
                }
                Ok(Flow::Continue)
            }
            Node::Parse { name, span } => {
                let target = self.template_name_arg(name, *span, "#parse")?;
                let template = self.loader.load_template(&target)?;
                let saved = std::mem::replace(&mut self.name, template.name().to_string());
                let outcome = self.render_block(&template.root, out);
                self.name = saved;
                // #stop in the parsed template ends that template only.
                outcome.map(|_| Flow::Continue)
            }
            Node::Evaluate { source, span } => {
                let source = self.eval_expr(source, *span)?;
                let text = match source {
                    Value::Str(s) => s,
                    other => render_to_string(&other),
                };
                let block = parser::parse(&text, "#evaluate")?;
                self.render_block(&block, out).map(|_| Flow::Continue)
            }
            Node::Stop => Ok(Flow::Stop),
        }
    }

    fn render_foreach(
        &mut self,
        var: &str,
        iterable: &Expr,
        body: &Block,
        span: Span,
        out: &mut dyn fmt::Write,
    ) -> TemplateResult<Flow> {
        let value = self.eval_expr(iterable, span)?;
        if let Value::Null = value {
            return Ok(Flow::Continue);
        }
        let Some(items) = value::iterate(&value) else {
            return Err(self.exec_err(
                span,
                format!("value of kind {} is not iterable in #foreach", value.kind()),
            ));
        };
        let len = items.len();
        let parent = match self.ns.get("foreach") {
            Ok(Some(record @ Value::Map(_))) => Some(record),
            _ => None,
        };
        for (i, item) in items.into_iter().enumerate() {
            self.ns.push_frame();
            self.ns.define_local(var, item);
            self.ns
                .define_local("velocityCount", Value::Int(i as i64 + 1));
            self.ns
                .define_local("velocityHasNext", Value::Bool(i + 1 < len));
            let mut record = vec![
                (Value::Str("count".into()), Value::Int(i as i64 + 1)),
                (Value::Str("index".into()), Value::Int(i as i64)),
                (Value::Str("hasNext".into()), Value::Bool(i + 1 < len)),
                (Value::Str("first".into()), Value::Bool(i == 0)),
                (Value::Str("last".into()), Value::Bool(i + 1 == len)),
            ];
            if let Some(parent) = &parent {
                record.push((Value::Str("parent".into()), parent.clone()));
            }
            self.ns.define_local("foreach", Value::Map(record));
            let flow = self.render_block(body, out);
            self.ns.pop_frame();
            match flow? {
                Flow::Stop => return Ok(Flow::Stop),
                Flow::Continue => {}
            }
        }
        Ok(Flow::Continue)
    }

    /// Macro bodies are hygienic: arguments are evaluated in the caller's
    /// scope, then the body renders against the root context and the
    /// render's base frame only.
    fn call_macro(
        &mut self,
        name: &str,
        args: &[Expr],
        span: Span,
        out: &mut dyn fmt::Write,
    ) -> TemplateResult<Flow> {
        let Some(def) = self.ns.get_macro(name) else {
            return Err(self.exec_err(span, format!("no such macro: #{}", name)));
        };
        if def.params.len() != args.len() {
            return Err(self.exec_err(
                span,
                format!(
                    "macro #{} expects {} argument(s), got {}",
                    name,
                    def.params.len(),
                    args.len()
                ),
            ));
        }
        let mut argv = Vec::with_capacity(args.len());
        for arg in args {
            argv.push(self.eval_expr(arg, span)?);
        }
        let saved = self.ns.isolate_locals();
        self.ns.push_frame();
        for (param, value) in def.params.iter().zip(argv) {
            self.ns.define_local(param, value);
        }
        let flow = self.render_block(&def.body, out);
        self.ns.pop_frame();
        self.ns.restore_locals(saved);
        flow
    }

    // ------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------

    fn render_reference(
        &mut self,
        reference: &Reference,
        out: &mut dyn fmt::Write,
    ) -> TemplateResult<()> {
        let resolved = self.eval_path(&reference.path, reference.span)?;
        match resolved {
            Some(Value::Null) | None => {
                if let Some(alternate) = &reference.alternate {
                    let value = self.eval_expr(alternate, reference.span)?;
                    self.write_value(out, &value)
                } else if reference.quiet {
                    Ok(())
                } else if resolved.is_none() && self.options.strict_references {
                    Err(self.exec_err(
                        reference.span,
                        format!("undefined reference {}", reference.raw),
                    ))
                } else {
                    // Lenient mode: an unresolved reference renders as its
                    // own source text.
                    self.write(out, &reference.raw)
                }
            }
            Some(value) => self.write_value(out, &value),
        }
    }

    /// A reference used as a value: missing resolves to `Null` (after the
    /// `${path|alternate}` fallback), raising instead under strict
    /// references unless the reference is quiet.
    fn eval_reference_value(&mut self, reference: &Reference) -> TemplateResult<Value> {
        let resolved = self.eval_path(&reference.path, reference.span)?;
        match resolved {
            Some(Value::Null) | None => {
                if let Some(alternate) = &reference.alternate {
                    return self.eval_expr(alternate, reference.span);
                }
                if resolved.is_none() && !reference.quiet && self.options.strict_references {
                    return Err(self.exec_err(
                        reference.span,
                        format!("undefined reference {}", reference.raw),
                    ));
                }
                Ok(Value::Null)
            }
            Some(value) => Ok(value),
        }
    }

    /// Walks a reference chain. `Ok(None)` is *missing*; everything read
    /// through a missing parent stays missing and its argument expressions
    /// are not evaluated.
    fn eval_path(&mut self, path: &Path, span: Span) -> TemplateResult<Option<Value>> {
        let mut segments = path.segments.iter();
        let mut current = match segments.next() {
            Some(Segment::Name(name)) => {
                let found = self.lift(self.ns.get(name), span)?;
                self.resolve_macro_value(found, span)?
            }
            Some(Segment::Call(name, args)) => {
                let found = self.lift(self.ns.get(name), span)?;
                match found {
                    None => None,
                    Some(Value::Macro(def)) => {
                        let argv = self.eval_args(args, span)?;
                        Some(self.render_define(&def.0, argv, span)?)
                    }
                    Some(Value::Object(obj)) => {
                        let argv = self.eval_args(args, span)?;
                        match obj.call(&argv) {
                            Some(outcome) => Some(self.lift_host(outcome, span)?),
                            None => return Err(self.exec_err(
                                span,
                                format!("'{}' is not callable", name),
                            )),
                        }
                    }
                    Some(other) => {
                        return Err(self.exec_err(
                            span,
                            format!("'{}' of kind {} is not callable", name, other.kind()),
                        ))
                    }
                }
            }
            Some(Segment::Index(_)) | None => {
                return Err(self.exec_err(span, "malformed reference path".to_string()))
            }
        };
        for segment in segments {
            let Some(parent) = current else {
                return Ok(None);
            };
            current = self.eval_segment(parent, segment, span)?;
        }
        Ok(current)
    }

    fn eval_segment(
        &mut self,
        parent: Value,
        segment: &Segment,
        span: Span,
    ) -> TemplateResult<Option<Value>> {
        match segment {
            Segment::Name(name) => {
                let found = self.lift(value::get_property(&parent, name), span)?;
                self.resolve_macro_value(found, span)
            }
            Segment::Index(index) => {
                let key = self.eval_expr(index, span)?;
                self.lift(value::get_index(&parent, &key), span)
            }
            Segment::Call(name, args) => {
                let argv = self.eval_args(args, span)?;
                if let Value::Object(obj) = &parent {
                    if let Some(outcome) = obj.invoke(name, &argv) {
                        return Ok(Some(self.lift_host(outcome, span)?));
                    }
                }
                if let Some(result) = self.lift(value::builtin_method(&parent, name, &argv), span)? {
                    return Ok(Some(result));
                }
                match self.lift(value::get_property(&parent, name), span)? {
                    Some(Value::Macro(def)) => Ok(Some(self.render_define(&def.0, argv, span)?)),
                    Some(Value::Object(obj)) => match obj.call(&argv) {
                        Some(outcome) => Ok(Some(self.lift_host(outcome, span)?)),
                        None => Err(self.exec_err(
                            span,
                            format!("'{}' is not callable", name),
                        )),
                    },
                    Some(other) => Err(self.exec_err(
                        span,
                        format!("'{}' of kind {} is not callable", name, other.kind()),
                    )),
                    None if self.options.strict_references => Err(self.exec_err(
                        span,
                        format!("no method '{}' on kind {}", name, parent.kind()),
                    )),
                    None => Ok(None),
                }
            }
        }
    }

    /// A value read through a path that turns out to be a `#define` body is
    /// rendered on the spot, so `#set($x = $block)` stores the text.
    fn resolve_macro_value(
        &mut self,
        found: Option<Value>,
        span: Span,
    ) -> TemplateResult<Option<Value>> {
        match found {
            Some(Value::Macro(def)) => Ok(Some(self.render_define(&def.0, Vec::new(), span)?)),
            other => Ok(other),
        }
    }

    /// Renders a `#define` body (or a define-with-parameters call) in the
    /// current namespace, guarding against self-referential definitions.
    fn render_define(
        &mut self,
        def: &Arc<MacroDef>,
        argv: Vec<Value>,
        span: Span,
    ) -> TemplateResult<Value> {
        if def.params.len() != argv.len() {
            return Err(self.exec_err(
                span,
                format!(
                    "${} expects {} argument(s), got {}",
                    def.name,
                    def.params.len(),
                    argv.len()
                ),
            ));
        }
        let key = Arc::as_ptr(def) as *const () as usize;
        if !self.define_guard.insert(key) {
            return Err(self.exec_err(
                span,
                format!("recursive reference to #define ${}", def.name),
            ));
        }
        self.ns.push_frame();
        for (param, value) in def.params.iter().zip(argv) {
            self.ns.define_local(param, value);
        }
        let mut rendered = String::new();
        let outcome = self.render_block(&def.body, &mut rendered);
        self.ns.pop_frame();
        self.define_guard.remove(&key);
        outcome?;
        Ok(Value::Str(rendered))
    }

    fn eval_args(&mut self, args: &[Expr], span: Span) -> TemplateResult<Vec<Value>> {
        let mut argv = Vec::with_capacity(args.len());
        for arg in args {
            argv.push(self.eval_expr(arg, span)?);
        }
        Ok(argv)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval_expr(&mut self, expr: &Expr, span: Span) -> TemplateResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Reference(reference) => self.eval_reference_value(reference),
            Expr::Interp(parts) => {
                let mut rendered = String::new();
                for part in parts {
                    match part {
                        InterpPart::Text(text) => rendered.push_str(text),
                        InterpPart::Reference(reference) => {
                            self.render_reference(reference, &mut rendered)?
                        }
                    }
                }
                Ok(Value::Str(rendered))
            }
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(item, span)?);
                }
                Ok(Value::Seq(values))
            }
            Expr::Map(entries) => {
                let mut values = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.eval_expr(key, span)?;
                    let value = self.eval_expr(value, span)?;
                    values.push((key, value));
                }
                Ok(Value::Map(values))
            }
            Expr::Range(start, end) => {
                let start = self.range_bound(start, span)?;
                let end = self.range_bound(end, span)?;
                Ok(Value::Range(value::Range { start, end }))
            }
            Expr::Unary(UnOp::Not, operand) => {
                let value = self.eval_expr(operand, span)?;
                Ok(Value::Bool(!value.is_truthy()))
            }
            Expr::Unary(UnOp::Neg, operand) => {
                let value = self.eval_expr(operand, span)?;
                match value {
                    Value::Int(v) => Ok(Value::Int(-v)),
                    Value::Float(v) => Ok(Value::float(-v.0)),
                    Value::Null if !self.options.strict_math => Ok(Value::Int(0)),
                    other => Err(self.exec_err(
                        span,
                        format!("cannot negate a value of kind {}", other.kind()),
                    )),
                }
            }
            Expr::Binary(BinOp::And, left, right) => {
                let value = self.eval_expr(left, span)?.is_truthy()
                    && self.eval_expr(right, span)?.is_truthy();
                Ok(Value::Bool(value))
            }
            Expr::Binary(BinOp::Or, left, right) => {
                let value = self.eval_expr(left, span)?.is_truthy()
                    || self.eval_expr(right, span)?.is_truthy();
                Ok(Value::Bool(value))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval_expr(left, span)?;
                let right = self.eval_expr(right, span)?;
                self.apply_binary(*op, left, right, span)
            }
        }
    }

    fn range_bound(&mut self, expr: &Expr, span: Span) -> TemplateResult<i64> {
        match self.eval_expr(expr, span)? {
            Value::Int(v) => Ok(v),
            other => Err(self.exec_err(
                span,
                format!("range bound must be an integer, got {}", other.kind()),
            )),
        }
    }

    fn apply_binary(
        &self,
        op: BinOp,
        left: Value,
        right: Value,
        span: Span,
    ) -> TemplateResult<Value> {
        match op {
            BinOp::Eq => Ok(Value::Bool(left == right)),
            BinOp::Ne => Ok(Value::Bool(left != right)),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let Some(ordering) = compare_values(&left, &right) else {
                    if self.options.strict_math {
                        return Err(self.exec_err(
                            span,
                            format!("cannot compare {} with {}", left.kind(), right.kind()),
                        ));
                    }
                    return Ok(Value::Bool(false));
                };
                let holds = match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::Le => ordering.is_le(),
                    BinOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                Ok(Value::Bool(holds))
            }
            BinOp::Add
                if matches!(left, Value::Str(_)) || matches!(right, Value::Str(_)) =>
            {
                let mut joined = render_to_string(&left);
                joined.push_str(&render_to_string(&right));
                Ok(Value::Str(joined))
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                self.arith(op, &left, &right, span)
            }
            BinOp::And | BinOp::Or => unreachable!("short-circuited in eval_expr"),
        }
    }

    fn arith(&self, op: BinOp, left: &Value, right: &Value, span: Span) -> TemplateResult<Value> {
        let l = self.numeric(left, span)?;
        let r = self.numeric(right, span)?;
        match (l, r) {
            (Num::Int(a), Num::Int(b)) => {
                let out = match op {
                    BinOp::Add => a.checked_add(b),
                    BinOp::Sub => a.checked_sub(b),
                    BinOp::Mul => a.checked_mul(b),
                    BinOp::Div | BinOp::Rem => {
                        if b == 0 {
                            return Err(self.exec_err(span, "division by zero".to_string()));
                        }
                        if op == BinOp::Div {
                            a.checked_div(b)
                        } else {
                            a.checked_rem(b)
                        }
                    }
                    _ => None,
                };
                out.map(Value::Int)
                    .ok_or_else(|| self.exec_err(span, "integer overflow".to_string()))
            }
            (l, r) => {
                let (a, b) = (l.as_f64(), r.as_f64());
                let out = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div | BinOp::Rem => {
                        if b == 0.0 {
                            return Err(self.exec_err(span, "division by zero".to_string()));
                        }
                        if op == BinOp::Div {
                            a / b
                        } else {
                            a % b
                        }
                    }
                    _ => 0.0,
                };
                Ok(Value::float(out))
            }
        }
    }

    fn numeric(&self, value: &Value, span: Span) -> TemplateResult<Num> {
        match value {
            Value::Int(v) => Ok(Num::Int(*v)),
            Value::Float(v) => Ok(Num::Float(v.0)),
            Value::Null if !self.options.strict_math => Ok(Num::Int(0)),
            Value::Null => Err(self.exec_err(span, "arithmetic on null".to_string())),
            other => Err(self.exec_err(
                span,
                format!("cannot apply arithmetic to kind {}", other.kind()),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    fn assign(&mut self, target: &Path, value: Value, span: Span) -> TemplateResult<()> {
        let mut steps = Vec::with_capacity(target.segments.len());
        for segment in &target.segments {
            match segment {
                Segment::Name(name) => steps.push(Step::Name(name)),
                Segment::Index(index) => steps.push(Step::Key(self.eval_expr(index, span)?)),
                Segment::Call(..) => {
                    return Err(self.exec_err(span, "illegal assignment target".to_string()))
                }
            }
        }
        let Some(Step::Name(base)) = steps.first() else {
            return Err(self.exec_err(span, "illegal assignment target".to_string()));
        };
        let base = *base;
        if steps.len() == 1 {
            self.ns.set(base, value);
            return Ok(());
        }

        // Owned navigation through the render's own copies; switches to the
        // host protocol at the first object on the path.
        let name = self.name.clone();
        let mut detour: Option<(Value, usize)> = None;
        if let Some(slot) = self.ns.slot_mut(base) {
            let mut cursor = slot;
            let mut value = Some(value);
            for (i, step) in steps[1..].iter().enumerate() {
                if let Value::Object(_) = cursor {
                    detour = Some((cursor.clone(), i));
                    break;
                }
                let last = i == steps.len() - 2;
                if last {
                    let assigned = value.take().unwrap_or(Value::Null);
                    return assign_final(cursor, step, assigned, &name, span);
                }
                cursor = navigate_owned(cursor, step, &name, span)?;
            }
            let Some((object, offset)) = detour else {
                return Ok(());
            };
            let assigned = value.take().unwrap_or(Value::Null);
            return self.protocol_assign(object, &steps[1 + offset..], assigned, span);
        }

        // Base not bound in frames or a map root: a host-object root can
        // still take the write through the protocol.
        match self.lift(self.ns.get(base), span)? {
            Some(start @ Value::Object(_)) => self.protocol_assign(start, &steps[1..], value, span),
            Some(other) => Err(self.exec_err(
                span,
                format!("cannot assign through a value of kind {}", other.kind()),
            )),
            None => Err(self.exec_err(
                span,
                format!("cannot assign to undefined reference ${}", base),
            )),
        }
    }

    /// Remaining navigation and the final write once a host object appears
    /// on the assignment path.
    fn protocol_assign(
        &mut self,
        start: Value,
        steps: &[Step<'_>],
        value: Value,
        span: Span,
    ) -> TemplateResult<()> {
        let mut current = start;
        let (last, middle) = steps.split_last().expect("protocol path is non-empty");
        for step in middle {
            let next = match step {
                Step::Name(name) => self.lift(value::get_property(&current, name), span)?,
                Step::Key(key) => self.lift(value::get_index(&current, key), span)?,
            };
            current = next.ok_or_else(|| {
                self.exec_err(span, "undefined intermediate value in assignment".to_string())
            })?;
        }
        let Value::Object(obj) = &current else {
            return Err(self.exec_err(span, "unsupported assignment target".to_string()));
        };
        let ok = match last {
            Step::Name(name) => obj.set_property(name, value),
            Step::Key(key) => obj.set_index(key, value),
        };
        if ok {
            Ok(())
        } else {
            Err(self.exec_err(span, "unsupported assignment target".to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn template_name_arg(
        &mut self,
        expr: &Expr,
        span: Span,
        directive: &str,
    ) -> TemplateResult<String> {
        match self.eval_expr(expr, span)? {
            Value::Str(name) => Ok(name),
            other => Err(self.exec_err(
                span,
                format!(
                    "{} expects a template name string, got {}",
                    directive,
                    other.kind()
                ),
            )),
        }
    }

    fn write(&self, out: &mut dyn fmt::Write, text: &str) -> TemplateResult<()> {
        out.write_str(text).map_err(|_| TemplateError::Output)
    }

    fn write_value(&self, out: &mut dyn fmt::Write, value: &Value) -> TemplateResult<()> {
        write!(out, "{}", value).map_err(|_| TemplateError::Output)
    }

    fn exec_err(&self, span: Span, message: String) -> TemplateError {
        TemplateError::Execution {
            name: self.name.clone(),
            line: span.line,
            column: span.column,
            message,
        }
    }

    /// Attaches template position context to a value-protocol failure.
    fn lift<T>(&self, result: value::OpResult<T>, span: Span) -> TemplateResult<T> {
        result.map_err(|e| match e {
            OpError::Exec(message) => self.exec_err(span, message),
            OpError::Host(message) => TemplateError::Host {
                name: self.name.clone(),
                line: span.line,
                column: span.column,
                message,
            },
        })
    }

    fn lift_host(&self, outcome: Result<Value, String>, span: Span) -> TemplateResult<Value> {
        outcome.map_err(|message| TemplateError::Host {
            name: self.name.clone(),
            line: span.line,
            column: span.column,
            message,
        })
    }
}

fn exec_at(name: &str, span: Span, message: String) -> TemplateError {
    TemplateError::Execution {
        name: name.to_string(),
        line: span.line,
        column: span.column,
        message,
    }
}

fn step_key(step: &Step<'_>) -> Value {
    match step {
        Step::Name(name) => Value::Str((*name).to_string()),
        Step::Key(key) => key.clone(),
    }
}

/// One step of mutable navigation through the render's owned copies.
fn navigate_owned<'v>(
    cursor: &'v mut Value,
    step: &Step<'_>,
    name: &str,
    span: Span,
) -> TemplateResult<&'v mut Value> {
    match cursor {
        Value::Map(entries) => {
            let key = step_key(step);
            entries
                .iter_mut()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    exec_at(
                        name,
                        span,
                        "undefined intermediate value in assignment".to_string(),
                    )
                })
        }
        Value::Seq(items) => match step {
            Step::Key(Value::Int(i)) => usize::try_from(*i)
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| {
                    exec_at(name, span, "list index out of range in assignment".to_string())
                }),
            _ => Err(exec_at(
                name,
                span,
                "list index must be an integer in assignment".to_string(),
            )),
        },
        other => Err(exec_at(
            name,
            span,
            format!("cannot assign through a value of kind {}", other.kind()),
        )),
    }
}

/// The final write of a long-path `#set`.
fn assign_final(
    cursor: &mut Value,
    step: &Step<'_>,
    value: Value,
    name: &str,
    span: Span,
) -> TemplateResult<()> {
    match cursor {
        Value::Map(entries) => {
            let key = step_key(step);
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some((_, slot)) => *slot = value,
                None => entries.push((key, value)),
            }
            Ok(())
        }
        Value::Seq(items) => match step {
            Step::Key(Value::Int(i)) => {
                let slot = usize::try_from(*i).ok().and_then(|i| items.get_mut(i));
                match slot {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(exec_at(
                        name,
                        span,
                        "list index out of range in assignment".to_string(),
                    )),
                }
            }
            _ => Err(exec_at(
                name,
                span,
                "list index must be an integer in assignment".to_string(),
            )),
        },
        other => Err(exec_at(
            name,
            span,
            format!("cannot assign into a value of kind {}", other.kind()),
        )),
    }
}

enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(&self) -> f64 {
        match self {
            Num::Int(v) => *v as f64,
            Num::Float(v) => *v,
        }
    }
}

/// String form used for `+` concatenation; identical to `Display`, with
/// `Null` rendering empty.
fn render_to_string(value: &Value) -> String {
    value.to_string()
}

/// Position to report when a branch condition fails: the span of the first
/// reference inside it, or a zero span for pure literals (which cannot
/// fail).
fn condition_span(expr: &Expr) -> Span {
    match expr {
        Expr::Reference(r) => r.span,
        Expr::Unary(_, inner) => condition_span(inner),
        Expr::Binary(_, left, _) => condition_span(left),
        Expr::Range(left, _) => condition_span(left),
        _ => Span { line: 0, column: 0 },
    }
}
