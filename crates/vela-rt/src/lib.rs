//! # vela-rt — The Vela Runtime Core
//!
//! The execution core of the Vela scripting language: the tagged value
//! model, a paged heap with a concurrent mark-and-evacuate garbage
//! collector, a register-based bytecode interpreter with generators
//! and exception unwinding, a thread/context runtime and a module
//! manager. The compiler front end is an external collaborator wired
//! in through the [`module::ModuleCompiler`] trait.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                          Instance                            |
//! |  prototypes · constants · module registry · thread registry  |
//! |                                                              |
//! |  +----------------+   +-----------------------------------+  |
//! |  |     Heap       |   |            Collector              |  |
//! |  | page table     |<->| engage -> mark -> evacuate ->     |  |
//! |  | large objects  |   |   update -> finish                |  |
//! |  +----------------+   +-----------------------------------+  |
//! +--------------------------------------------------------------+
//!         ^                        ^
//!         |                        | roots, safepoints
//! +-------+-------+        +-------+-------+
//! |  Context (T1) |  ...   |  Context (Tn) |   one per OS thread
//! |  interp loop  |        |  interp loop  |
//! +---------------+        +---------------+
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use vela_rt::{Instance, InstanceFlags};
//!
//! fn main() -> Result<(), vela_rt::Error> {
//!     let (_instance, ctx) = Instance::init(InstanceFlags::NONE)?;
//!
//!     let hello = vela_rt::object::string::new_string(&ctx, "hello")
//!         .expect("allocation");
//!     assert_eq!(ctx.type_of(hello), vela_rt::object::TypeTag::String);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`value`]: tagged value cells and numeric extraction
//! - [`heap`]: pages, the large-object side table, byte accounting
//! - [`object`]: the object model, one module per entity
//! - [`gc`]: the collection cycle and its statistics
//! - [`runtime`]: instance, contexts, local roots, safepoints, threads
//! - [`interp`]: the bytecode dispatch loop and operator semantics
//! - [`module`]: loading, the global table, builtin registration
//! - [`config`]: heap caps and GC policy knobs
//! - [`error`]: the embedder error enum and the exception channel

pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod interp;
pub mod module;
pub mod object;
pub mod runtime;
pub mod value;

pub use config::{Config, InstanceFlags};
pub use error::{Error, ExcKind, Raised};
pub use gc::GcStats;
pub use interp::{apply_function, call_function, call_generator};
pub use runtime::{Context, Instance, Local, ULocal, VelaThread};
pub use value::{Handle, Numeric, Value};

/// Runtime version from the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_singletons() {
        let (instance, ctx) = Instance::init(InstanceFlags::NONE).unwrap();
        let void = ctx.void_val();
        let t = ctx.true_val();
        let f = ctx.false_val();

        assert!(void.is_heap());
        assert_ne!(t, f);
        assert_eq!(ctx.type_of(void), object::TypeTag::Void);
        assert_eq!(ctx.type_of(t), object::TypeTag::Boolean);
        assert_eq!(instance.flags(), InstanceFlags::NONE);
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
