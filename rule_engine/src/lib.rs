//! # Rule Engine
//!
//! Compiles rule text into immutable modules and evaluates them against
//! facts held in per-session working memory.
//!
//! ```text
//! SourceTree ──RuleCompiler::compile──► CompiledModule ──new_session──► Session
//!                                                                       insert / fire_all_rules / objects
//! ```
//!
//! Rule files look like:
//!
//! ```text
//! package com.example.rules;
//!
//! rule "Half price" no-loop
//! when
//!     $o : Order( originalPrice > 5 )
//! then
//!     modify($o) { price = $o.originalPrice * 0.5 };
//! end
//! ```

mod ast;
pub mod compiler;
pub mod diagnostics;
pub mod error;
mod eval;
pub mod fact;
mod lexer;
pub mod listener;
pub mod module;
mod parser;
pub mod session;
pub mod source_tree;
pub mod value;

pub use compiler::{CompiledBuild, CompiledRule, RuleCompiler, DEFAULT_PACKAGE};
pub use diagnostics::{Diagnostic, Severity};
pub use error::{CompilationError, SessionError};
pub use fact::{Fact, FactHandle};
pub use listener::{MatchFired, ObjectDeleted, ObjectInserted, ObjectUpdated, WorkingMemoryListener};
pub use module::CompiledModule;
pub use session::{CancellationFlag, Session, SessionConfig};
pub use source_tree::{encode_path_segment, SourceTree};
pub use value::{Value, DATE_FORMAT};
