//! Atom graph builder: seed template or task skeleton → atom graph.
//!
//! A seed is a small indentation-structured template, one statement per
//! line. Every statement becomes exactly one atom; anything the table below
//! does not recognize becomes an inert OPAQUE atom carrying its source text.
//!
//! | statement                         | atom       |
//! |-----------------------------------|------------|
//! | `for V in C:`                     | ITER_NEXT  |
//! | `map V in C:`                     | MAP_EACH   |
//! | `X = for V in C:` / `X = map ...` | materializing loop |
//! | `if COND:`                        | BRANCH     |
//! | `X = 3.5`                         | CONST      |
//! | `X = A op B`                      | ARITH      |
//! | `read(..)`, `write(..)`, ...      | CALL       |
//! | any other call                    | TRANSFORM  |
//! | `return E` / `emit E`             | EMIT       |
//!
//! A trailing `# n=<int>` comment declares a loop's element count.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;

use crate::catalog::{AtomCatalog, AtomOp};
use crate::error::{Result, SynthesisError};
use crate::field::{FieldArchitecture, StageRole};
use crate::graph::{AtomGraph, AttrValue, EdgeKind, NodeId};

static LOOP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<bind>[A-Za-z_]\w*)\s*=\s*)?(?P<kw>for|map)\s+(?P<var>[A-Za-z_]\w*)\s+in\s+(?P<coll>.+?)\s*:$",
    )
    .unwrap()
});
static BRANCH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^if\s+(?P<cond>.+?)\s*:$").unwrap());
static CONST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<bind>[A-Za-z_]\w*)\s*=\s*(?P<num>-?\d+(?:\.\d+)?)$").unwrap()
});
static ARITH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<bind>[A-Za-z_]\w*)\s*=\s*(?P<lhs>[A-Za-z_]\w*|-?\d+(?:\.\d+)?)\s*(?P<op>[-+*/])\s*(?P<rhs>[A-Za-z_]\w*|-?\d+(?:\.\d+)?)$",
    )
    .unwrap()
});
static CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<bind>[A-Za-z_]\w*)\s*=\s*)?(?P<callee>[A-Za-z_][\w.]*)\((?P<args>.*)\)$")
        .unwrap()
});
static EMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<kw>return|emit)\b\s*(?P<expr>.*)$").unwrap());
static BINDING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<bind>[A-Za-z_]\w*)\s*=[^=]").unwrap());
static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).unwrap());
static IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z_]\w*").unwrap());
static ELEMENT_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bn\s*=\s*(?P<n>\d+)").unwrap());

const IO_CALLS: &[&str] = &[
    "read", "write", "print", "open", "fetch", "send", "recv", "save", "load",
];
const KEYWORDS: &[&str] = &["and", "or", "not", "in", "is", "True", "False", "None"];
const TAB_WIDTH: usize = 4;

/// What the builder knows about the task beyond the seed.
#[derive(Clone, Debug, Default)]
pub struct TaskHint {
    pub description: String,
    /// Element count for loops that carry no `# n=` annotation.
    pub element_count: Option<u64>,
}

impl TaskHint {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            element_count: None,
        }
    }
}

/// One non-blank seed line.
#[derive(Debug)]
struct Line {
    number: usize,
    indent: usize,
    text: String,
    element_count: Option<u64>,
}

impl Line {
    fn is_header(&self) -> bool {
        self.text.ends_with(':')
    }
}

/// An atom before ids exist.
struct Classified {
    op: AtomOp,
    attrs: BTreeMap<String, AttrValue>,
    /// Identifiers read by the statement.
    reads: Vec<String>,
    /// Name bound by the statement, if any.
    binds: Option<String>,
    /// Loop variable introduced for the body.
    loop_var: Option<String>,
}

/// Decompose a seed template, or build the per-stage skeleton when there is
/// no seed.
pub fn decompose(
    seed: Option<&str>,
    task: &TaskHint,
    architecture: &FieldArchitecture,
) -> Result<AtomGraph> {
    if architecture.is_empty() {
        return Err(SynthesisError::InvalidArgument(
            "architecture has no stages".to_string(),
        ));
    }
    let graph = match seed {
        Some(text) => decompose_seed(text, task, architecture.len())?,
        None => skeleton(task, architecture),
    };
    graph
        .validate()
        .and_then(|_| graph.validate_stages(architecture.len()))
        .map_err(|reason| SynthesisError::Decomposition {
            line: 0,
            construct: "<graph>".to_string(),
            reason,
        })?;
    tracing::debug!(
        atoms = graph.node_count(),
        edges = graph.edge_count(),
        seeded = seed.is_some(),
        "decomposed task"
    );
    Ok(graph)
}

fn split_lines(seed: &str) -> Vec<Line> {
    seed.lines()
        .enumerate()
        .filter_map(|(i, raw)| {
            let (code, comment) = match comment_start(raw) {
                Some(pos) => (&raw[..pos], Some(&raw[pos + 1..])),
                None => (raw, None),
            };
            let text = code.trim();
            if text.is_empty() {
                return None;
            }
            let indent = code
                .chars()
                .take_while(|c| c.is_whitespace())
                .map(|c| if c == '\t' { TAB_WIDTH } else { 1 })
                .sum();
            let element_count = comment
                .and_then(|c| ELEMENT_COUNT.captures(c))
                .and_then(|caps| caps["n"].parse().ok());
            Some(Line {
                number: i + 1,
                indent,
                text: text.to_string(),
                element_count,
            })
        })
        .collect()
}

/// Byte offset of the first `#` outside a string literal.
fn comment_start(raw: &str) -> Option<usize> {
    let mut from = 0;
    for literal in STRING_LITERAL.find_iter(raw) {
        if let Some(pos) = raw[from..literal.start()].find('#') {
            return Some(from + pos);
        }
        from = literal.end();
    }
    raw[from..].find('#').map(|pos| from + pos)
}

fn decomposition_error(line: &Line, reason: &str) -> SynthesisError {
    SynthesisError::Decomposition {
        line: line.number,
        construct: line.text.clone(),
        reason: reason.to_string(),
    }
}

/// An open block while walking the seed.
struct Frame {
    indent: usize,
    owner: Option<NodeId>,
    loop_var: Option<String>,
    last: Option<NodeId>,
}

fn decompose_seed(seed: &str, task: &TaskHint, stage_count: usize) -> Result<AtomGraph> {
    let lines = split_lines(seed);
    let Some(first) = lines.first() else {
        return Err(SynthesisError::Decomposition {
            line: 0,
            construct: "<seed>".to_string(),
            reason: "seed is empty".to_string(),
        });
    };
    if first.indent != 0 {
        return Err(decomposition_error(first, "unexpected indentation"));
    }
    if let Some(last) = lines.last().filter(|l| l.is_header()) {
        return Err(decomposition_error(last, "block has no body"));
    }

    let total = lines.len();
    let mut graph = AtomGraph::new();
    let mut defined: HashMap<String, NodeId> = HashMap::new();
    let mut stack = vec![Frame {
        indent: 0,
        owner: None,
        loop_var: None,
        last: None,
    }];
    let mut pending_header: Option<(&Line, NodeId, Option<String>)> = None;

    for (k, line) in lines.iter().enumerate() {
        if let Some((header, owner, loop_var)) = pending_header.take() {
            let parent_indent = stack.last().map_or(0, |f| f.indent);
            if line.indent <= parent_indent {
                return Err(decomposition_error(header, "block has no body"));
            }
            stack.push(Frame {
                indent: line.indent,
                owner: Some(owner),
                loop_var,
                last: None,
            });
        } else {
            let top = stack.last().map_or(0, |f| f.indent);
            if line.indent > top {
                return Err(decomposition_error(line, "unexpected indentation"));
            }
            while stack.last().is_some_and(|f| f.indent > line.indent) {
                stack.pop();
            }
            if stack.last().map(|f| f.indent) != Some(line.indent) {
                return Err(decomposition_error(
                    line,
                    "indentation does not match any open block",
                ));
            }
        }

        let Classified {
            op,
            mut attrs,
            reads,
            binds,
            loop_var,
        } = classify(line);
        if op.is_loop() && !attrs.contains_key("n") {
            if let Some(n) = task.element_count {
                attrs.insert("n".to_string(), AttrValue::Int(n as i64));
            }
        }

        // Arithmetic operands resolve to their defining atom.
        for side in ["lhs", "rhs"] {
            let Some(AttrValue::Text(name)) = attrs.get(side) else {
                continue;
            };
            if is_loop_var(&stack, name) {
                continue;
            }
            if let Some(&def) = defined.get(name) {
                attrs.insert(format!("{side}_ref"), AttrValue::Int(i64::from(def.0)));
            }
        }

        let stage = k * stage_count / total;
        let parallel = AtomCatalog::standard().get(op).parallelizable;
        let id = graph.add_node_with(op, stage, parallel, attrs);

        for name in &reads {
            if is_loop_var(&stack, name) {
                continue;
            }
            if let Some(&def) = defined.get(name) {
                graph.add_edge(def, id, EdgeKind::Data);
            }
        }

        if let Some(frame) = stack.last_mut() {
            if let Some(owner) = frame.owner {
                graph.add_edge(owner, id, EdgeKind::Control);
            }
            if let Some(prev) = frame.last {
                graph.add_edge(prev, id, EdgeKind::Sequencing);
            }
            frame.last = Some(id);
        }
        if let Some(name) = binds {
            defined.insert(name, id);
        }
        if line.is_header() {
            pending_header = Some((line, id, loop_var));
        }
    }

    Ok(graph)
}

fn is_loop_var(stack: &[Frame], name: &str) -> bool {
    stack.iter().any(|f| f.loop_var.as_deref() == Some(name))
}

fn identifiers(text: &str) -> Vec<String> {
    let unquoted = STRING_LITERAL.replace_all(text, " ");
    IDENT
        .find_iter(&unquoted)
        .map(|m| m.as_str())
        .filter(|w| !KEYWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

fn parse_number(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

impl Classified {
    fn new(
        op: AtomOp,
        attrs: BTreeMap<String, AttrValue>,
        reads: Vec<String>,
        binds: Option<&str>,
        loop_var: Option<&str>,
    ) -> Self {
        Self {
            op,
            attrs,
            reads,
            binds: binds.map(str::to_string),
            loop_var: loop_var.map(str::to_string),
        }
    }
}

fn classify(line: &Line) -> Classified {
    let text = line.text.as_str();
    let mut attrs = BTreeMap::new();

    if let Some(caps) = LOOP.captures(text) {
        let op = if &caps["kw"] == "map" {
            AtomOp::MapEach
        } else {
            AtomOp::IterNext
        };
        let bind = caps.name("bind").map(|m| m.as_str());
        attrs.insert("collection".to_string(), AttrValue::from(&caps["coll"]));
        attrs.insert("var".to_string(), AttrValue::from(&caps["var"]));
        if let Some(b) = bind {
            attrs.insert("binds".to_string(), AttrValue::from(b));
            attrs.insert("materialize".to_string(), AttrValue::Bool(true));
        }
        if let Some(n) = line.element_count {
            attrs.insert("n".to_string(), AttrValue::Int(n as i64));
        }
        let reads = identifiers(&caps["coll"]);
        return Classified::new(op, attrs, reads, bind, Some(&caps["var"]));
    }

    if let Some(caps) = BRANCH.captures(text) {
        attrs.insert("condition".to_string(), AttrValue::from(&caps["cond"]));
        let reads = identifiers(&caps["cond"]);
        return Classified::new(AtomOp::Branch, attrs, reads, None, None);
    }

    if let Some(caps) = CONST.captures(text) {
        if let Some(value) = parse_number(&caps["num"]) {
            attrs.insert("binds".to_string(), AttrValue::from(&caps["bind"]));
            attrs.insert("value".to_string(), AttrValue::Float(value));
            return Classified::new(AtomOp::Const, attrs, Vec::new(), Some(&caps["bind"]), None);
        }
    }

    if let Some(caps) = ARITH.captures(text) {
        attrs.insert("binds".to_string(), AttrValue::from(&caps["bind"]));
        attrs.insert("op".to_string(), AttrValue::from(&caps["op"]));
        let mut reads = Vec::new();
        for side in ["lhs", "rhs"] {
            let operand = &caps[side];
            match parse_number(operand) {
                Some(v) => {
                    attrs.insert(format!("{side}_value"), AttrValue::Float(v));
                }
                None => reads.push(operand.to_string()),
            }
            attrs.insert(side.to_string(), AttrValue::from(operand));
        }
        return Classified::new(AtomOp::Arith, attrs, reads, Some(&caps["bind"]), None);
    }

    if let Some(caps) = CALL.captures(text) {
        let callee = &caps["callee"];
        let short = callee.rsplit('.').next().unwrap_or(callee).to_lowercase();
        let op = if IO_CALLS.contains(&short.as_str()) {
            AtomOp::Call
        } else {
            AtomOp::Transform
        };
        let bind = caps.name("bind").map(|m| m.as_str());
        attrs.insert("callee".to_string(), AttrValue::from(callee));
        attrs.insert("args".to_string(), AttrValue::from(&caps["args"]));
        if let Some(b) = bind {
            attrs.insert("binds".to_string(), AttrValue::from(b));
        }
        let reads = identifiers(&caps["args"]);
        return Classified::new(op, attrs, reads, bind, None);
    }

    if let Some(caps) = EMIT.captures(text) {
        attrs.insert("keyword".to_string(), AttrValue::from(&caps["kw"]));
        attrs.insert("expr".to_string(), AttrValue::from(&caps["expr"]));
        let reads = identifiers(&caps["expr"]);
        return Classified::new(AtomOp::Emit, attrs, reads, None, None);
    }

    attrs.insert("source".to_string(), AttrValue::from(text));
    let bind = BINDING.captures(text).map(|c| c["bind"].to_string());
    if let Some(b) = &bind {
        attrs.insert("binds".to_string(), AttrValue::from(b.as_str()));
    }
    let reads = match text.split_once('=') {
        Some((_, rhs)) if bind.is_some() => identifiers(rhs),
        _ => identifiers(text),
    };
    Classified::new(AtomOp::Opaque, attrs, reads, bind.as_deref(), None)
}

/// One representative atom per stage, chained by data edges.
fn skeleton(task: &TaskHint, architecture: &FieldArchitecture) -> AtomGraph {
    let mut graph = AtomGraph::new();
    let mut previous: Option<(NodeId, String)> = None;

    for (index, stage) in architecture.stages.iter().enumerate() {
        let binds = format!("stage{index}");
        let id = match stage.role {
            StageRole::Input => {
                let id = graph.add_node(AtomOp::Call, index);
                if let Some(node) = graph.node_mut(id) {
                    node.set_attr("callee", "read");
                    node.set_attr("args", stage.name.as_str());
                    node.set_attr("binds", binds.as_str());
                }
                id
            }
            StageRole::Processing => {
                let collection = previous
                    .as_ref()
                    .map_or_else(|| "input".to_string(), |(_, name)| name.clone());
                let id = graph.add_node(AtomOp::MapEach, index);
                if let Some(node) = graph.node_mut(id) {
                    node.set_attr("collection", collection);
                    node.set_attr("var", "item");
                    node.set_attr("binds", binds.as_str());
                    node.set_attr("materialize", true);
                    if let Some(n) = task.element_count {
                        node.set_attr("n", n as i64);
                    }
                }
                let body = graph.add_node(AtomOp::Transform, index);
                if let Some(node) = graph.node_mut(body) {
                    node.set_attr("callee", stage.name.as_str());
                    node.set_attr("args", "item");
                }
                graph.add_edge(id, body, EdgeKind::Control);
                id
            }
            StageRole::Output => {
                let expr = previous.as_ref().map_or("", |(_, name)| name.as_str());
                let id = graph.add_node(AtomOp::Emit, index);
                if let Some(node) = graph.node_mut(id) {
                    node.set_attr("keyword", "emit");
                    node.set_attr("expr", expr);
                }
                id
            }
        };
        if let Some((prev, _)) = &previous {
            graph.add_edge(*prev, id, EdgeKind::Data);
        }
        previous = Some((id, binds));
    }
    graph
}
