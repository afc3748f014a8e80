//! The transform contract and the registry workers build transforms from
//!
//! A transform is a synchronous, per-worker object. The worker bridge hands
//! it an [`Inputs`] pull sequence and drains the iterator it returns; every
//! produced value must follow the consumption of exactly one input.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use vimap_ipc::WorkerFailure;

use crate::bridge::{panic_message, Inputs};
use crate::error::TransformError;

/// What a transform produces: one result per consumed input
pub type OutputIter<'a> = Box<dyn Iterator<Item = Result<JsonValue, TransformError>> + 'a>;

/// A user transform, one instance per worker
pub trait Transform: Send {
    fn run<'a>(&'a mut self, inputs: Inputs<'a>) -> OutputIter<'a>;
}

/// Worker descriptor: which transform to build and with what arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub transform: String,
    #[serde(default)]
    pub init_args: Vec<JsonValue>,
    #[serde(default)]
    pub init_kwargs: Map<String, JsonValue>,
}

impl WorkerSpec {
    pub fn new(transform: impl Into<String>) -> Self {
        Self {
            transform: transform.into(),
            init_args: Vec::new(),
            init_kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<JsonValue>) -> Self {
        self.init_args = args;
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.init_kwargs.insert(name.into(), value);
        self
    }

    pub fn init_args(&self) -> InitArgs {
        InitArgs {
            args: self.init_args.clone(),
            kwargs: self.init_kwargs.clone(),
        }
    }
}

/// Initialization arguments passed to a transform factory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitArgs {
    pub args: Vec<JsonValue>,
    pub kwargs: Map<String, JsonValue>,
}

impl InitArgs {
    /// Positional argument `index`, decoded. `Ok(None)` if absent.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, TransformError> {
        self.args
            .get(index)
            .map(|value| T::deserialize(value))
            .transpose()
            .map_err(|e| TransformError::new(format!("init arg {}: {}", index, e)))
    }

    /// Every positional argument decoded as `T`
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, TransformError> {
        self.args
            .iter()
            .enumerate()
            .map(|(index, value)| {
                T::deserialize(value)
                    .map_err(|e| TransformError::new(format!("init arg {}: {}", index, e)))
            })
            .collect()
    }

    /// Keyword argument `name`, decoded. `Ok(None)` if absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TransformError> {
        self.kwargs
            .get(name)
            .map(|value| T::deserialize(value))
            .transpose()
            .map_err(|e| TransformError::new(format!("init kwarg '{}': {}", name, e)))
    }

    pub fn require_kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, TransformError> {
        self.kwarg(name)?
            .ok_or_else(|| TransformError::new(format!("missing init kwarg '{}'", name)))
    }
}

type TransformFactory =
    Arc<dyn Fn(&InitArgs) -> Result<Box<dyn Transform>, TransformError> + Send + Sync>;

/// Named transform factories
#[derive(Clone, Default)]
pub struct TransformRegistry {
    factories: BTreeMap<String, TransformFactory>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: Transform + 'static,
        F: Fn(&InitArgs) -> Result<T, TransformError> + Send + Sync + 'static,
    {
        self.factories.insert(
            name.into(),
            Arc::new(move |args| factory(args).map(|t| Box::new(t) as Box<dyn Transform>)),
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the transform a worker descriptor names
    ///
    /// Factory errors and panics become `InitializationFailed`.
    pub fn build(&self, spec: &WorkerSpec) -> Result<Box<dyn Transform>, WorkerFailure> {
        let factory = self
            .factories
            .get(&spec.transform)
            .ok_or_else(|| WorkerFailure::UnknownTransform {
                name: spec.transform.clone(),
            })?;

        let args = spec.init_args();
        match panic::catch_unwind(AssertUnwindSafe(|| factory(&args))) {
            Ok(Ok(transform)) => Ok(transform),
            Ok(Err(e)) => Err(WorkerFailure::InitializationFailed {
                error: e.to_string(),
            }),
            Err(payload) => Err(WorkerFailure::InitializationFailed {
                error: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("transforms", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct FnTransform<F, I, O, E> {
    f: F,
    _types: PhantomData<fn(I) -> Result<O, E>>,
}

impl<F, I, O, E> Transform for FnTransform<F, I, O, E>
where
    F: FnMut(I) -> Result<O, E> + Send,
    I: DeserializeOwned,
    O: Serialize,
    E: Into<TransformError>,
{
    fn run<'a>(&'a mut self, inputs: Inputs<'a>) -> OutputIter<'a> {
        let f = &mut self.f;
        Box::new(inputs.map(move |value| -> Result<JsonValue, TransformError> {
            let input: I = serde_json::from_value(value)?;
            let output = f(input).map_err(Into::into)?;
            Ok(serde_json::to_value(output)?)
        }))
    }
}

/// A 1:1 transform from a fallible closure over typed values
pub fn try_from_fn<I, O, E, F>(f: F) -> impl Transform
where
    F: FnMut(I) -> Result<O, E> + Send,
    I: DeserializeOwned,
    O: Serialize,
    E: Into<TransformError>,
{
    FnTransform {
        f,
        _types: PhantomData,
    }
}

/// A 1:1 transform from an infallible closure over typed values
pub fn from_fn<I, O, F>(mut f: F) -> impl Transform
where
    F: FnMut(I) -> O + Send,
    I: DeserializeOwned,
    O: Serialize,
{
    try_from_fn(move |input: I| Ok::<O, TransformError>(f(input)))
}
