//! Boundary to the embedded script compiler and virtual machine.
//!
//! The runtime never looks inside a compiled unit. It hands the engine source
//! bytes plus the names that will be bound before each run, and gets back a
//! [`CompiledUnit`] that can be forked into independent execution states.

use std::{fmt, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{error::BoxError, resolver::ModuleGetter, value::Value};

#[async_trait::async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Compile `source`, pre-declaring every name in `declared` as an unbound
    /// placeholder. `imports` resolves module names referenced by the source.
    async fn compile(
        &self,
        source: &[u8],
        declared: &[String],
        file_name: &str,
        imports: &dyn ModuleGetter,
    ) -> Result<Box<dyn CompiledUnit>, BoxError>;
}

#[async_trait::async_trait]
pub trait CompiledUnit: Send + Sync + 'static {
    /// Bind a declared global. Fails for names that were not declared at
    /// compile time or for values the engine cannot represent.
    fn set(&mut self, name: &str, value: Value) -> Result<(), BoxError>;

    fn get(&self, name: &str) -> Option<Value>;

    /// Execute the unit. Implementations should poll `cancel` at their own
    /// suspension points; the runtime also races the future against it.
    async fn run(&mut self, cancel: &CancellationToken) -> Result<(), BoxError>;

    /// Copy with independent execution state.
    fn fork(&self) -> Box<dyn CompiledUnit>;
}

impl fmt::Debug for dyn CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<T: Engine + ?Sized> Engine for Arc<T> {
    async fn compile(
        &self,
        source: &[u8],
        declared: &[String],
        file_name: &str,
        imports: &dyn ModuleGetter,
    ) -> Result<Box<dyn CompiledUnit>, BoxError> {
        (**self).compile(source, declared, file_name, imports).await
    }
}
