//! The function manager.
//!
//! Registration happens once per (name, location, block). Decomposition runs
//! after the variable lists are known: each expression tree is interned into a
//! DAG whose node ids are topologically ordered, so evaluation is one linear
//! sweep. Nodes that reference the solution, its gradient, or parameters
//! inherit whatever AD seeding the current pass applied.

use rustc_hash::FxHashMap;

use crate::ad::{cst, Ad, DualNum};
use crate::error::{AssemblyError, ConfigError, ConsistencyError};
use crate::fields::Field2;
use crate::functions::parser::{parse, BinOp, Expr};
use crate::params::ParameterManager;
use crate::workset::Workset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    VolumeIp,
    SideIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Func {
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Func2 {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Const(f64),
    Coord(usize),
    Time,
    /// Solution variable value at the quadrature point.
    Var(usize),
    /// Scalar parameter group (first component).
    ScalarParam(usize),
    /// Discretized parameter field value at the quadrature point.
    FieldParam(usize),
    Neg(usize),
    Binary(BinOp, usize, usize),
    Unary(Func, usize),
    Binary2(Func2, usize, usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey {
    Const(u64),
    Coord(usize),
    Time,
    Var(usize),
    ScalarParam(usize),
    FieldParam(usize),
    Neg(usize),
    Binary(BinOp, usize, usize),
    Unary(Func, usize),
    Binary2(Func2, usize, usize),
}

#[derive(Debug, Default)]
pub struct FunctionManager {
    /// Parsed but not yet decomposed registrations.
    pending: Vec<(String, Location, usize, Expr)>,
    /// Resolved definitions: (name, location, block) -> DAG root.
    defs: FxHashMap<(String, Location, usize), usize>,
    nodes: Vec<Node>,
    intern: FxHashMap<NodeKey, usize>,
}

impl FunctionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` at `location` on `block`. Re-registration replaces the
    /// previous definition.
    pub fn add_function(
        &mut self,
        name: &str,
        source: &str,
        location: Location,
        block: usize,
    ) -> Result<(), ConfigError> {
        let expr = parse(source).map_err(|reason| ConfigError::BadExpression {
            name: name.to_string(),
            reason,
        })?;
        self.pending
            .retain(|(n, l, b, _)| !(n == name && *l == location && *b == block));
        self.pending
            .push((name.to_string(), location, block, expr));
        Ok(())
    }

    pub fn is_registered(&self, name: &str, location: Location, block: usize) -> bool {
        self.defs
            .contains_key(&(name.to_string(), location, block))
            || self
                .pending
                .iter()
                .any(|(n, l, b, _)| n == name && *l == location && *b == block)
    }

    /// Resolves every pending registration against the per-block variable
    /// lists and the parameter registry, interning shared subexpressions.
    pub fn decompose(
        &mut self,
        varlists: &[Vec<String>],
        params: &ParameterManager,
    ) -> Result<(), ConsistencyError> {
        let pending = std::mem::take(&mut self.pending);
        for (name, location, block, expr) in pending {
            let root = self.intern_expr(&expr, &name, varlists[block].as_slice(), params)?;
            self.defs.insert((name, location, block), root);
        }
        Ok(())
    }

    fn push_node(&mut self, key: NodeKey, node: Node) -> usize {
        if let Some(&id) = self.intern.get(&key) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(node);
        self.intern.insert(key, id);
        id
    }

    fn intern_expr(
        &mut self,
        expr: &Expr,
        fn_name: &str,
        varlist: &[String],
        params: &ParameterManager,
    ) -> Result<usize, ConsistencyError> {
        match expr {
            Expr::Number(v) => Ok(self.push_node(NodeKey::Const(v.to_bits()), Node::Const(*v))),
            Expr::Ident(name) => self.intern_ident(name, fn_name, varlist, params),
            Expr::Neg(inner) => {
                let c = self.intern_expr(inner, fn_name, varlist, params)?;
                Ok(self.push_node(NodeKey::Neg(c), Node::Neg(c)))
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.intern_expr(lhs, fn_name, varlist, params)?;
                let r = self.intern_expr(rhs, fn_name, varlist, params)?;
                Ok(self.push_node(NodeKey::Binary(*op, l, r), Node::Binary(*op, l, r)))
            }
            Expr::Call(name, args) => {
                let unary = |f: Func| -> Option<Func> {
                    (args.len() == 1).then_some(f)
                };
                let resolved_unary = match name.as_str() {
                    "sin" => unary(Func::Sin),
                    "cos" => unary(Func::Cos),
                    "tan" => unary(Func::Tan),
                    "exp" => unary(Func::Exp),
                    "log" => unary(Func::Log),
                    "sqrt" => unary(Func::Sqrt),
                    "abs" => unary(Func::Abs),
                    _ => None,
                };
                if let Some(f) = resolved_unary {
                    let c = self.intern_expr(&args[0], fn_name, varlist, params)?;
                    return Ok(self.push_node(NodeKey::Unary(f, c), Node::Unary(f, c)));
                }
                match (name.as_str(), args.len()) {
                    ("min", 2) | ("max", 2) => {
                        let f = if name == "min" { Func2::Min } else { Func2::Max };
                        let l = self.intern_expr(&args[0], fn_name, varlist, params)?;
                        let r = self.intern_expr(&args[1], fn_name, varlist, params)?;
                        Ok(self.push_node(NodeKey::Binary2(f, l, r), Node::Binary2(f, l, r)))
                    }
                    ("pow", 2) => {
                        let l = self.intern_expr(&args[0], fn_name, varlist, params)?;
                        let r = self.intern_expr(&args[1], fn_name, varlist, params)?;
                        Ok(self.push_node(
                            NodeKey::Binary(BinOp::Pow, l, r),
                            Node::Binary(BinOp::Pow, l, r),
                        ))
                    }
                    _ => Err(ConsistencyError::UnknownIdentifier {
                        name: fn_name.to_string(),
                        ident: name.clone(),
                    }),
                }
            }
        }
    }

    fn intern_ident(
        &mut self,
        name: &str,
        fn_name: &str,
        varlist: &[String],
        params: &ParameterManager,
    ) -> Result<usize, ConsistencyError> {
        match name {
            "x" => return Ok(self.push_node(NodeKey::Coord(0), Node::Coord(0))),
            "y" => return Ok(self.push_node(NodeKey::Coord(1), Node::Coord(1))),
            "z" => return Ok(self.push_node(NodeKey::Coord(2), Node::Coord(2))),
            "t" => return Ok(self.push_node(NodeKey::Time, Node::Time)),
            "pi" => {
                let v = std::f64::consts::PI;
                return Ok(self.push_node(NodeKey::Const(v.to_bits()), Node::Const(v)));
            }
            _ => {}
        }
        if let Some(v) = varlist.iter().position(|v| v == name) {
            return Ok(self.push_node(NodeKey::Var(v), Node::Var(v)));
        }
        if let Some(g) = params.scalar_group_index(name) {
            return Ok(self.push_node(NodeKey::ScalarParam(g), Node::ScalarParam(g)));
        }
        if let Some(p) = params.discretized_index(name) {
            return Ok(self.push_node(NodeKey::FieldParam(p), Node::FieldParam(p)));
        }
        Err(ConsistencyError::UnknownIdentifier {
            name: fn_name.to_string(),
            ident: name.to_string(),
        })
    }

    /// Evaluates `name` at the requested location, returning a device-resident
    /// field of AD values sized (elements x quadrature points).
    pub fn evaluate(
        &self,
        name: &str,
        location: Location,
        block: usize,
        wkset: &Workset,
        params: &ParameterManager,
    ) -> Result<Field2<Ad>, AssemblyError> {
        let &root = self
            .defs
            .get(&(name.to_string(), location, block))
            .ok_or_else(|| AssemblyError::MissingCoefficient(name.to_string()))?;

        let ne = wkset.num_elems;
        let nq = match location {
            Location::VolumeIp => wkset.nqp,
            Location::SideIp => wkset.nqp_side,
        };

        // Reachable node set, evaluated in (topological) id order.
        let mut needed = vec![false; root + 1];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if needed[id] {
                continue;
            }
            needed[id] = true;
            match &self.nodes[id] {
                Node::Neg(c) | Node::Unary(_, c) => stack.push(*c),
                Node::Binary(_, l, r) | Node::Binary2(_, l, r) => {
                    stack.push(*l);
                    stack.push(*r);
                }
                _ => {}
            }
        }

        let mut values: Vec<Option<Field2<Ad>>> = (0..=root).map(|_| None).collect();
        for id in 0..=root {
            if !needed[id] {
                continue;
            }
            let field = self.eval_node(id, ne, nq, location, wkset, params, &values);
            values[id] = Some(field);
        }
        Ok(values[root].take().expect("root evaluated"))
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_node(
        &self,
        id: usize,
        ne: usize,
        nq: usize,
        location: Location,
        wkset: &Workset,
        params: &ParameterManager,
        values: &[Option<Field2<Ad>>],
    ) -> Field2<Ad> {
        let mut out = Field2::from_elem(ne, nq, cst(0.0));
        match &self.nodes[id] {
            Node::Const(v) => out.fill(cst(*v)),
            Node::Time => out.fill(cst(wkset.time)),
            Node::Coord(d) => {
                let ip = match location {
                    Location::VolumeIp => &wkset.ip,
                    Location::SideIp => &wkset.ip_side,
                };
                for e in 0..ne {
                    for k in 0..nq {
                        out[(e, k)] = cst(if *d < wkset.dim { ip[(e, k, *d)] } else { 0.0 });
                    }
                }
            }
            Node::Var(v) => {
                let sol = match location {
                    Location::VolumeIp => &wkset.local_soln,
                    Location::SideIp => &wkset.local_soln_side,
                };
                for e in 0..ne {
                    for k in 0..nq {
                        out[(e, k)] = sol[(e, *v, k)].clone();
                    }
                }
            }
            Node::ScalarParam(g) => {
                let v = params.ad_values[*g]
                    .first()
                    .cloned()
                    .unwrap_or_else(|| cst(0.0));
                out.fill(v);
            }
            Node::FieldParam(p) => {
                let field = match location {
                    Location::VolumeIp => &wkset.local_param,
                    Location::SideIp => &wkset.local_param_side,
                };
                for e in 0..ne {
                    for k in 0..nq {
                        out[(e, k)] = field[(e, *p, k)].clone();
                    }
                }
            }
            Node::Neg(c) => {
                let child = values[*c].as_ref().expect("child evaluated");
                for e in 0..ne {
                    for k in 0..nq {
                        out[(e, k)] = -child[(e, k)].clone();
                    }
                }
            }
            Node::Unary(f, c) => {
                let child = values[*c].as_ref().expect("child evaluated");
                for e in 0..ne {
                    for k in 0..nq {
                        let x = child[(e, k)].clone();
                        out[(e, k)] = match f {
                            Func::Sin => x.sin(),
                            Func::Cos => x.cos(),
                            Func::Tan => x.tan(),
                            Func::Exp => x.exp(),
                            Func::Log => x.ln(),
                            Func::Sqrt => x.sqrt(),
                            Func::Abs => {
                                if x.re < 0.0 {
                                    -x
                                } else {
                                    x
                                }
                            }
                        };
                    }
                }
            }
            Node::Binary(op, l, r) => {
                let lhs = values[*l].as_ref().expect("child evaluated");
                let rhs = values[*r].as_ref().expect("child evaluated");
                let const_int_exp = match self.nodes[*r] {
                    Node::Const(v) if v.fract() == 0.0 && v.abs() < 1e9 => Some(v as i32),
                    _ => None,
                };
                for e in 0..ne {
                    for k in 0..nq {
                        let a = lhs[(e, k)].clone();
                        let b = rhs[(e, k)].clone();
                        out[(e, k)] = match op {
                            BinOp::Add => a + b,
                            BinOp::Sub => a - b,
                            BinOp::Mul => a * b,
                            BinOp::Div => a / b,
                            BinOp::Pow => match const_int_exp {
                                Some(p) => a.powi(p),
                                None => (b * a.ln()).exp(),
                            },
                        };
                    }
                }
            }
            Node::Binary2(f, l, r) => {
                let lhs = values[*l].as_ref().expect("child evaluated");
                let rhs = values[*r].as_ref().expect("child evaluated");
                for e in 0..ne {
                    for k in 0..nq {
                        let a = lhs[(e, k)].clone();
                        let b = rhs[(e, k)].clone();
                        let take_lhs = match f {
                            Func2::Min => a.re <= b.re,
                            Func2::Max => a.re >= b.re,
                        };
                        out[(e, k)] = if take_lhs { a } else { b };
                    }
                }
            }
        }
        out
    }
}
