//! Functions and globals a server exposes through its root object.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::exception::RemoteError;
use crate::value::{Kwargs, Value};

/// A function callable through the root object's `call` method.
pub type ExportedFn = Arc<dyn Fn(Vec<Value>, Kwargs) -> Result<Value, RemoteError> + Send + Sync>;

/// Named functions plus a mutable global namespace.
#[derive(Default)]
pub struct ExportRegistry {
    functions: HashMap<String, ExportedFn>,
    globals: RwLock<BTreeMap<String, Value>>,
}

impl fmt::Debug for ExportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportRegistry")
            .field("functions", &self.function_names())
            .finish()
    }
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ExportRegistry::register`].
    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Kwargs) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    /// Builder form of [`ExportRegistry::set_global`].
    pub fn global(self, name: impl Into<String>, value: Value) -> Self {
        self.set_global(name, value);
        self
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>, Kwargs) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered function names, sorted.
    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Runs function `name`. A missing function is a `NameError`.
    pub fn call(&self, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RemoteError> {
        let f = self
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::name_error(name))?;
        f(args, kwargs)
    }

    pub fn get_global(&self, name: &str) -> Result<Value, RemoteError> {
        self.globals
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::name_error(name))
    }

    pub fn set_global(&self, name: impl Into<String>, value: Value) {
        let previous = self
            .globals
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.into(), value);
        drop(previous);
    }
}

/// Export registries by definitions-module name. The client picks one in
/// its INIT.
#[derive(Debug, Default)]
pub struct Definitions {
    modules: HashMap<String, Arc<ExportRegistry>>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, name: impl Into<String>, registry: ExportRegistry) -> Self {
        self.insert(name, registry);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, registry: ExportRegistry) {
        self.modules.insert(name.into(), Arc::new(registry));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ExportRegistry>> {
        self.modules.get(name).cloned()
    }

    pub fn module_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
