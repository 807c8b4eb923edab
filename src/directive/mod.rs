//! Directives: deferred descriptor changes applied around a fork
//!
//! Every directive moves through three steps:
//!
//! - **register**: before any process exists, allocate whatever the
//!   runner must own (named-target pipes, literal-input stores)
//! - **apply in parent**: after the fork, drop what the parent must not hold
//! - **apply in child**: before exec, wire the descriptor into place
//!
//! # Examples
//!
//! ```ignore
//! use shellplumb::{Direction, Directive, LiteralInput, Redirect};
//!
//! let merge_stderr: Directive = Redirect::fd(2, Direction::Write, 1).into();
//! let capture: Directive = Redirect::named(1, Direction::Write, "stdout").into();
//! let input: Directive = LiteralInput::stdin("hello").into();
//! ```

pub mod literal;
pub mod redirect;

pub use literal::LiteralInput;
pub use redirect::{Direction, ReadCallback, Redirect, Target, TargetOptions, WriteCallback};

use std::fmt;

use crate::errors::Result;
use crate::execution::ExecFailure;
use crate::runner::TargetRegistry;

/// Capability contract every directive kind provides
pub trait DirectiveOps {
    /// Allocate runner-owned resources; no process exists yet
    fn register(&self, targets: &mut TargetRegistry) -> Result<()>;

    /// Runs in the parent right after the fork
    fn apply_parent(&self, targets: &mut TargetRegistry) -> Result<()>;

    /// Runs in the child before exec
    fn apply_child(&self, targets: &TargetRegistry) -> std::result::Result<(), ExecFailure>;

    /// Shell-like form for diagnostics
    fn render(&self) -> String;
}

/// A descriptor change attached to a command
#[derive(Debug, Clone)]
pub enum Directive {
    Redirect(Redirect),
    Literal(LiteralInput),
}

impl Directive {
    /// Descriptor number the child sees this directive on
    pub fn source(&self) -> i32 {
        match self {
            Directive::Redirect(redirect) => redirect.source(),
            Directive::Literal(literal) => literal.source(),
        }
    }

    /// Copy that stays bound to what this directive registered.
    ///
    /// `clone` gives a literal input its own identity; a command handing
    /// its registered directives to a subprocess needs this instead.
    pub(crate) fn shared(&self) -> Directive {
        match self {
            Directive::Redirect(redirect) => Directive::Redirect(redirect.clone()),
            Directive::Literal(literal) => Directive::Literal(literal.shared()),
        }
    }
}

impl DirectiveOps for Directive {
    fn register(&self, targets: &mut TargetRegistry) -> Result<()> {
        match self {
            Directive::Redirect(redirect) => redirect.register(targets),
            Directive::Literal(literal) => literal.register(targets),
        }
    }

    fn apply_parent(&self, targets: &mut TargetRegistry) -> Result<()> {
        match self {
            Directive::Redirect(redirect) => redirect.apply_parent(targets),
            Directive::Literal(literal) => literal.apply_parent(targets),
        }
    }

    fn apply_child(&self, targets: &TargetRegistry) -> std::result::Result<(), ExecFailure> {
        match self {
            Directive::Redirect(redirect) => redirect.apply_child(targets),
            Directive::Literal(literal) => literal.apply_child(targets),
        }
    }

    fn render(&self) -> String {
        match self {
            Directive::Redirect(redirect) => redirect.render(),
            Directive::Literal(literal) => literal.render(),
        }
    }
}

impl From<Redirect> for Directive {
    fn from(redirect: Redirect) -> Self {
        Directive::Redirect(redirect)
    }
}

impl From<LiteralInput> for Directive {
    fn from(literal: LiteralInput) -> Self {
        Directive::Literal(literal)
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
