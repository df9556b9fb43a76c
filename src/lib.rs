//! # Twinterp
//!
//! A cross-process object proxy and invocation runtime: a master process
//! spawns subordinate twinterpreter processes, and objects, classes, and
//! functions defined in one process can be invoked, inspected, and
//! mutated from the other as if they were local.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   proxy ops    ┌──────────────┐   directives   ┌──────────────┐
//! │  user code   │───────────────▶│ kernel client│───────────────▶│ kernel server│
//! │ (TwinHandle) │◀───────────────│ + dispatcher │◀───────────────│  + handler   │
//! └──────────────┘    results     └──────────────┘  framed replies└──────────────┘
//!      process A                        process A        ipyc          process B
//! ```
//!
//! Each master/twin pair communicates over two private duplex channels
//! with strict length-prefix framing. The codec substitutes live twin
//! objects with compact cross-process references during serialization
//! and resolves them back on receipt, preserving object identity across
//! the group. Reference counts pin remotely held instances against local
//! collection until the last proxy drops.

pub mod bootstrap;
pub mod codec;
pub mod error;
pub mod fixtures;
pub mod group_state;
pub mod ipyc;
pub mod kernel;
pub mod logging;
pub mod master;
pub mod protocol;
pub mod proxy;
pub mod state;
pub mod tracker;
pub mod value;

pub use error::{RemoteError, TwinError};
pub use kernel::KernelFlavour;
pub use master::{TwinDef, TwinMaster};
pub use proxy::{ClassBuilder, ClassSpec, FunctionBuilder, FunctionSpec, TwinHandle, TwinObject};
pub use value::{CallArgs, Value};

/// The current version of the twinterp runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
