//! Named building blocks that pipeline configs refer to by string.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use pulse_core::{ConfigError, Packet};

use crate::operators::{
    BufferOp, DebounceOp, DistinctOp, FilterOp, MapOp, Operator, OperatorSpec, SkipOp, TakeOp,
    ThrottleOp,
};

pub type Predicate = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;
pub type Mapper = Arc<dyn Fn(Packet) -> anyhow::Result<Packet> + Send + Sync>;
pub type OperatorFactory =
    Arc<dyn Fn(&OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> + Send + Sync>;

/// Operator factories plus the predicates and mappers `filter` and `map`
/// stages can name in their params.
///
/// `StageRegistry::default()` knows the built-in operators.
#[derive(Clone)]
pub struct StageRegistry {
    operators: HashMap<String, OperatorFactory>,
    predicates: HashMap<String, Predicate>,
    mappers: HashMap<String, Mapper>,
}

impl StageRegistry {
    /// A registry with no operators at all.
    pub fn empty() -> Self {
        Self {
            operators: HashMap::new(),
            predicates: HashMap::new(),
            mappers: HashMap::new(),
        }
    }

    /// Register (or replace) the operator called `name`.
    pub fn register_operator<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> + Send + Sync + 'static,
    {
        self.operators.insert(name.to_ascii_lowercase(), Arc::new(factory));
        self
    }

    pub fn register_predicate<F>(&mut self, name: &str, predicate: F) -> &mut Self
    where
        F: Fn(&Packet) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.to_string(), Arc::new(predicate));
        self
    }

    pub fn register_mapper<F>(&mut self, name: &str, mapper: F) -> &mut Self
    where
        F: Fn(Packet) -> anyhow::Result<Packet> + Send + Sync + 'static,
    {
        self.mappers.insert(name.to_string(), Arc::new(mapper));
        self
    }

    pub fn operator(&self, name: &str) -> Option<&OperatorFactory> {
        self.operators.get(name)
    }

    pub fn predicate(&self, name: &str) -> Option<Predicate> {
        self.predicates.get(name).cloned()
    }

    pub fn mapper(&self, name: &str) -> Option<Mapper> {
        self.mappers.get(name).cloned()
    }

    pub fn operator_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register_operator("filter", FilterOp::from_spec)
            .register_operator("map", MapOp::from_spec)
            .register_operator("buffer", BufferOp::from_spec)
            .register_operator("debounce", DebounceOp::from_spec)
            .register_operator("throttle", ThrottleOp::from_spec)
            .register_operator("distinct", DistinctOp::from_spec)
            .register_operator("take", TakeOp::from_spec)
            .register_operator("skip", SkipOp::from_spec);
        registry
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut predicates: Vec<&String> = self.predicates.keys().collect();
        predicates.sort();
        let mut mappers: Vec<&String> = self.mappers.keys().collect();
        mappers.sort();
        f.debug_struct("StageRegistry")
            .field("operators", &self.operator_names())
            .field("predicates", &predicates)
            .field("mappers", &mappers)
            .finish()
    }
}
