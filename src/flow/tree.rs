// This module defines the input of the back end: the type-checked statement tree of a single
// function. Nodes live in an arena owned by Tree and are addressed by NodeId; every node keeps
// a parent link so that loop control statements can find their enclosing loop without a
// separate scope stack. NodeKind is a closed enum of the constructs the code generator
// understands: blocks, constants, variable reads, memory accesses, assignments, arithmetic,
// comparisons, short-circuit logic, negation, calls, if/else-if/else chains, loops, loop
// control and returns. Variables are declared on the tree with a scalar or pack type; pack
// variables are decomposed into one component variable per leaf so that parameter binding can
// assign them to registers one by one. Function bundles the tree with its parameters, return
// format and body. The small builder methods keep test and front-end code readable.

//! Function trees consumed by the flow linearizer.

use crate::core::value::{Constant, Format, Symbol};

/// Identifier of a node in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Identifier of a variable in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub u32);

/// Resolved type of a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Scalar(Format),
    Pack(Vec<Type>),
}

/// Declared variable.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub ty: Type,
    /// Leaf component variables of a pack, empty for scalars.
    pub components: Vec<VariableId>,
}

impl Variable {
    pub fn format(&self) -> Option<Format> {
        match self.ty {
            Type::Scalar(format) => Some(format),
            Type::Pack(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl ComparisonOperator {
    pub fn negate(self) -> Self {
        match self {
            ComparisonOperator::Equal => ComparisonOperator::NotEqual,
            ComparisonOperator::NotEqual => ComparisonOperator::Equal,
            ComparisonOperator::Less => ComparisonOperator::GreaterOrEqual,
            ComparisonOperator::LessOrEqual => ComparisonOperator::Greater,
            ComparisonOperator::Greater => ComparisonOperator::LessOrEqual,
            ComparisonOperator::GreaterOrEqual => ComparisonOperator::Less,
        }
    }

    pub fn evaluate(self, left: i64, right: i64) -> bool {
        match self {
            ComparisonOperator::Equal => left == right,
            ComparisonOperator::NotEqual => left != right,
            ComparisonOperator::Less => left < right,
            ComparisonOperator::LessOrEqual => left <= right,
            ComparisonOperator::Greater => left > right,
            ComparisonOperator::GreaterOrEqual => left >= right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Block(Vec<NodeId>),
    Constant(Constant),
    Variable(VariableId),
    /// Memory read at `base + index * stride + offset`.
    Access {
        base: NodeId,
        index: Option<(NodeId, u8)>,
        offset: i64,
    },
    /// Assignment to a Variable or Access target.
    Assign {
        target: NodeId,
        value: NodeId,
    },
    Binary {
        operator: BinaryOperator,
        left: NodeId,
        right: NodeId,
    },
    Comparison {
        operator: ComparisonOperator,
        left: NodeId,
        right: NodeId,
    },
    Logical {
        operator: LogicalOperator,
        left: NodeId,
        right: NodeId,
    },
    Negate(NodeId),
    Call {
        function: Symbol,
        arguments: Vec<NodeId>,
    },
    If {
        condition: NodeId,
        body: NodeId,
        successors: Vec<NodeId>,
    },
    ElseIf {
        condition: NodeId,
        body: NodeId,
    },
    Else {
        body: NodeId,
    },
    Loop {
        initialization: Option<NodeId>,
        condition: Option<NodeId>,
        action: Option<NodeId>,
        body: NodeId,
    },
    LoopControl(LoopControl),
    Return(Option<NodeId>),
}

impl NodeKind {
    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Block(children) => children.clone(),
            NodeKind::Constant(_) | NodeKind::Variable(_) | NodeKind::LoopControl(_) => Vec::new(),
            NodeKind::Access { base, index, .. } => {
                std::iter::once(*base).chain(index.map(|(index, _)| index)).collect()
            }
            NodeKind::Assign { target, value } => vec![*target, *value],
            NodeKind::Binary { left, right, .. }
            | NodeKind::Comparison { left, right, .. }
            | NodeKind::Logical { left, right, .. } => vec![*left, *right],
            NodeKind::Negate(value) => vec![*value],
            NodeKind::Call { arguments, .. } => arguments.clone(),
            NodeKind::If {
                condition,
                body,
                successors,
            } => {
                let mut children = vec![*condition, *body];
                children.extend(successors.iter().copied());
                children
            }
            NodeKind::ElseIf { condition, body } => vec![*condition, *body],
            NodeKind::Else { body } => vec![*body],
            NodeKind::Loop {
                initialization,
                condition,
                action,
                body,
            } => initialization
                .iter()
                .chain(condition.iter())
                .chain(action.iter())
                .chain(std::iter::once(body))
                .copied()
                .collect(),
            NodeKind::Return(value) => value.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// Format of the value the node produces, if any.
    pub format: Option<Format>,
    pub parent: Option<NodeId>,
}

/// Arena of nodes and variables of one function.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    nodes: Vec<Node>,
    variables: Vec<Variable>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and links its children to it.
    pub fn add(&mut self, kind: NodeKind, format: Option<Format>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for child in kind.children() {
            if let Some(node) = self.nodes.get_mut(child.0 as usize) {
                node.parent = Some(id);
            }
        }
        self.nodes.push(Node {
            kind,
            format,
            parent: None,
        });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn format(&self, id: NodeId) -> Option<Format> {
        self.node(id).format
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Closest ancestor matching the predicate.
    pub fn find_parent(&self, id: NodeId, predicate: impl Fn(&NodeKind) -> bool) -> Option<NodeId> {
        let mut current = self.parent(id);
        while let Some(node) = current {
            if predicate(self.kind(node)) {
                return Some(node);
            }
            current = self.parent(node);
        }
        None
    }

    /// Whether `node` lies in the subtree of `ancestor`.
    pub fn is_under(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Declares a variable; packs get one component variable per leaf.
    pub fn add_variable(&mut self, name: &str, ty: Type) -> VariableId {
        let components = match &ty {
            Type::Scalar(_) => Vec::new(),
            Type::Pack(members) => members
                .iter()
                .enumerate()
                .flat_map(|(i, member)| {
                    let component = self.add_variable(&format!("{name}.{i}"), member.clone());
                    let leaves = self.leaves(component);
                    leaves.into_iter()
                })
                .collect(),
        };
        let id = VariableId(self.variables.len() as u32);
        self.variables.push(Variable {
            name: name.to_string(),
            ty,
            components,
        });
        id
    }

    pub fn variable(&self, id: VariableId) -> &Variable {
        &self.variables[id.0 as usize]
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    /// Scalar leaves of a variable in declaration order.
    pub fn leaves(&self, id: VariableId) -> Vec<VariableId> {
        let variable = self.variable(id);
        if variable.components.is_empty() {
            vec![id]
        } else {
            variable.components.clone()
        }
    }

    pub fn constant(&mut self, value: i64, format: Format) -> NodeId {
        self.add(NodeKind::Constant(Constant::Integer(value)), Some(format))
    }

    pub fn decimal(&mut self, value: f64) -> NodeId {
        self.add(NodeKind::Constant(Constant::Decimal(value)), Some(Format::Decimal))
    }

    pub fn read(&mut self, variable: VariableId) -> NodeId {
        let format = self.variable(variable).format();
        self.add(NodeKind::Variable(variable), format)
    }

    pub fn assign(&mut self, variable: VariableId, value: NodeId) -> NodeId {
        let target = self.read(variable);
        self.add(NodeKind::Assign { target, value }, None)
    }

    pub fn binary(&mut self, operator: BinaryOperator, left: NodeId, right: NodeId) -> NodeId {
        let format = self.format(left);
        self.add(NodeKind::Binary { operator, left, right }, format)
    }

    pub fn compare(&mut self, operator: ComparisonOperator, left: NodeId, right: NodeId) -> NodeId {
        self.add(NodeKind::Comparison { operator, left, right }, Some(Format::U8))
    }

    pub fn logical(&mut self, operator: LogicalOperator, left: NodeId, right: NodeId) -> NodeId {
        self.add(NodeKind::Logical { operator, left, right }, Some(Format::U8))
    }

    pub fn call(&mut self, function: &str, arguments: Vec<NodeId>, format: Option<Format>) -> NodeId {
        self.add(
            NodeKind::Call {
                function: Symbol::new(function),
                arguments,
            },
            format,
        )
    }

    pub fn block(&mut self, children: Vec<NodeId>) -> NodeId {
        self.add(NodeKind::Block(children), None)
    }

    pub fn return_value(&mut self, value: Option<NodeId>) -> NodeId {
        self.add(NodeKind::Return(value), None)
    }
}

/// A function ready for code generation.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: Symbol,
    pub tree: Tree,
    pub parameters: Vec<VariableId>,
    pub return_format: Option<Format>,
    pub body: NodeId,
}

impl Function {
    pub fn new(
        name: &str,
        tree: Tree,
        parameters: Vec<VariableId>,
        return_format: Option<Format>,
        body: NodeId,
    ) -> Self {
        Self {
            name: Symbol::new(name),
            tree,
            parameters,
            return_format,
            body,
        }
    }

    /// Parameters with packs decomposed into their scalar components.
    pub fn leaf_parameters(&self) -> Vec<VariableId> {
        self.parameters
            .iter()
            .flat_map(|&parameter| self.tree.leaves(parameter))
            .collect()
    }
}
