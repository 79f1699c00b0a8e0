pub mod applet;
pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod fs;
pub mod hook;
pub mod importer;
pub mod manager;
pub mod registry;
pub mod resolver;
pub mod singleflight;
pub mod transpile;
pub mod value;

pub const TRACE_TARGET_SCRIPT: &str = "scriptbox::script";

pub use applet::{Applet, AppletBuilder, AppletOptions, ForkHandle};
pub use cache::ScriptCache;
pub use config::Config;
pub use context::ContextStore;
pub use engine::{CompiledUnit, Engine};
pub use error::{BoxError, Error, Result};
pub use fs::{DirFs, FileStat, SourceFs};
pub use hook::{Hook, Signal};
pub use importer::{FsImporter, Require};
pub use manager::{AppOptions, AppletManager, ManagerConfig};
pub use registry::{Registry, RegistryTable};
pub use resolver::{ModuleDefinition, ModuleGetter, ModuleMap, ModuleResolver};
pub use transpile::{ScriptStep, TranspileStep, Transpiler, TranspilerChain};
pub use value::Value;
