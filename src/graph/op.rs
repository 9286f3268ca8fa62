//! The operator enumeration and its static classification tables.
//!
//! Every functor carries one `Opcode`. Arity, commutativity, and
//! differentiability are total functions over the enum, checked exhaustively
//! at compile time; there is no runtime type inspection anywhere in dispatch.

/// Argument-count class of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Unary,
    Binary,
    Ternary,
    /// One or more arguments.
    Nary,
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Unary => n == 1,
            Arity::Binary => n == 2,
            Arity::Ternary => n == 3,
            Arity::Nary => n >= 1,
        }
    }
}

/// The operator kind a functor performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    // elementwise unary
    Identity,
    Round,
    Neg,
    Abs,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
    Square,
    Cube,
    Sigmoid,
    Tanh,
    // elementwise binary / n-ary
    Pow,
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    // comparison (0/1 valued, terminate gradient paths)
    Eq,
    Neq,
    Lt,
    Gt,
    // conditional
    Select,
    // random draw
    RandUnif,
    // reductions
    ReduceSum,
    ReduceProd,
    ReduceMax,
    ReduceMin,
    ArgMax,
    // shape transforms
    Extend,
    Permute,
    Reshape,
    Concat,
    Slice,
    Pad,
    Stride,
    Scatter,
    Reverse,
    // contractions
    Matmul,
    Contract,
    Conv,
    // in-place update (evaluator concern; never differentiated)
    Assign,
    AssignAdd,
    AssignSub,
}

impl Opcode {
    pub fn arity(&self) -> Arity {
        use Opcode::*;
        match self {
            Identity | Round | Neg | Abs | Sin | Cos | Tan | Exp | Log | Sqrt | Square | Cube
            | Sigmoid | Tanh | ReduceSum | ReduceProd | ReduceMax | ReduceMin | ArgMax
            | Extend | Permute | Reshape | Slice | Pad | Stride | Scatter | Reverse => {
                Arity::Unary
            }
            Pow | Sub | Div | Min | Max | Eq | Neq | Lt | Gt | RandUnif | Matmul | Contract
            | Conv | Assign | AssignAdd | AssignSub => Arity::Binary,
            Select => Arity::Ternary,
            Add | Mul | Concat => Arity::Nary,
        }
    }

    /// Commutative opcodes get their child signatures sorted for hashing so
    /// argument order does not defeat duplicate detection.
    pub fn is_commutative(&self) -> bool {
        use Opcode::*;
        matches!(self, Add | Mul | Min | Max | Eq | Neq)
    }

    /// Opcodes a gradient may flow through. The rest must terminate gradient
    /// paths before `local_derivative` reaches them.
    pub fn is_differentiable(&self) -> bool {
        use Opcode::*;
        !matches!(
            self,
            Eq | Neq | Lt | Gt | RandUnif | ArgMax | Assign | AssignAdd | AssignSub
        )
    }

    pub fn name(&self) -> &'static str {
        use Opcode::*;
        match self {
            Identity => "IDENTITY",
            Round => "ROUND",
            Neg => "NEG",
            Abs => "ABS",
            Sin => "SIN",
            Cos => "COS",
            Tan => "TAN",
            Exp => "EXP",
            Log => "LOG",
            Sqrt => "SQRT",
            Square => "SQUARE",
            Cube => "CUBE",
            Sigmoid => "SIGMOID",
            Tanh => "TANH",
            Pow => "POW",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Min => "MIN",
            Max => "MAX",
            Eq => "EQ",
            Neq => "NEQ",
            Lt => "LT",
            Gt => "GT",
            Select => "SELECT",
            RandUnif => "RAND_UNIF",
            ReduceSum => "REDUCE_SUM",
            ReduceProd => "REDUCE_PROD",
            ReduceMax => "REDUCE_MAX",
            ReduceMin => "REDUCE_MIN",
            ArgMax => "ARGMAX",
            Extend => "EXTEND",
            Permute => "PERMUTE",
            Reshape => "RESHAPE",
            Concat => "CONCAT",
            Slice => "SLICE",
            Pad => "PAD",
            Stride => "STRIDE",
            Scatter => "SCATTER",
            Reverse => "REVERSE",
            Matmul => "MATMUL",
            Contract => "CONTRACT",
            Conv => "CONV",
            Assign => "ASSIGN",
            AssignAdd => "ASSIGN_ADD",
            AssignSub => "ASSIGN_SUB",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
