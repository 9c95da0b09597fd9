//! Method tables: the callable surface a worker exposes.
//!
//! Methods are registered explicitly with a name, an optional doc string and
//! a handler taking [`Arguments`]. The builtins `help` and `stop` are entries
//! of the same table, so every request goes through one lookup.
//!
//! ```
//! use serde_json::json;
//! use zerobot::service::MethodTable;
//!
//! let table = MethodTable::builder("calc")
//!     .method("ping", Some("Returns n + 42."), |args| {
//!         let n: i64 = args.get(0, "n")?;
//!         Ok(json!(n + 42))
//!     })
//!     .build()?;
//! assert!(table.contains("ping"));
//! # Ok::<(), zerobot::ZerobotError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Result, ZerobotError};

/// Name of the builtin introspection method.
pub const HELP: &str = "help";

/// Name of the builtin shutdown method.
pub const STOP: &str = "stop";

/// Returned by `help(name)` for a method registered without a doc string.
pub const NO_DOCUMENTATION: &str = "No documentation available";

/// Method names starting with this marker are never callable remotely.
pub const PROTECTED_PREFIX: char = '_';

/// Handler of an exposed method.
pub type Handler = Arc<dyn Fn(Arguments) -> anyhow::Result<Value> + Send + Sync>;

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl Arguments {
    /// Wraps decoded request arguments.
    #[must_use]
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Raw positional arguments.
    #[must_use]
    pub fn positionals(&self) -> &[Value] {
        &self.args
    }

    /// Raw keyword arguments.
    #[must_use]
    pub fn keywords(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    /// Positional argument `index`, deserialized into `T`.
    ///
    /// # Errors
    ///
    /// Fails if the argument is missing or does not fit `T`.
    pub fn positional<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(index)
            .with_context(|| format!("missing positional argument {index}"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("positional argument {index} has the wrong type"))
    }

    /// Keyword argument `name`, deserialized into `T`, if present.
    ///
    /// # Errors
    ///
    /// Fails if the argument is present but does not fit `T`.
    pub fn keyword<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        self.kwargs
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .with_context(|| format!("keyword argument {name} has the wrong type"))
            })
            .transpose()
    }

    /// Argument passed either at position `index` or as keyword `name`.
    ///
    /// # Errors
    ///
    /// Fails if the argument is missing or does not fit `T`.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> anyhow::Result<T> {
        self.get_opt(index, name)?
            .with_context(|| format!("missing argument {name} (position {index})"))
    }

    /// Like [`Arguments::get`], returning `None` when the argument is absent.
    ///
    /// # Errors
    ///
    /// Fails if the argument is present but does not fit `T`.
    pub fn get_opt<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> anyhow::Result<Option<T>> {
        if index < self.args.len() {
            return self.positional(index).map(Some);
        }
        self.keyword(name)
    }
}

enum MethodKind {
    Help,
    Stop,
    Exposed(Handler),
}

struct Method {
    doc: Option<String>,
    kind: MethodKind,
}

/// What a worker must do for one request.
pub enum Dispatch {
    /// Answer immediately with this outcome.
    Reply(Result<Value>),
    /// Answer with `null`, then fire the stop signal.
    Stop,
    /// Run the handler off the reactor.
    Invoke(Handler, Arguments),
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reply(outcome) => f.debug_tuple("Reply").field(outcome).finish(),
            Self::Stop => f.write_str("Stop"),
            Self::Invoke(_, args) => f.debug_tuple("Invoke").field(args).finish(),
        }
    }
}

/// Immutable name → method map. Cheap to clone.
#[derive(Clone)]
pub struct MethodTable {
    inner: Arc<TableInner>,
}

struct TableInner {
    service: String,
    methods: BTreeMap<String, Method>,
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("service", &self.inner.service)
            .field("methods", &self.names())
            .finish()
    }
}

impl MethodTable {
    /// Starts a table for a service called `service` (used in help texts).
    #[must_use]
    pub fn builder(service: impl Into<String>) -> MethodTableBuilder {
        MethodTableBuilder {
            service: service.into(),
            methods: BTreeMap::new(),
            error: None,
        }
    }

    /// Service name given to the builder.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Sorted names of every callable method, builtins included.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner.methods.keys().cloned().collect()
    }

    /// Returns `true` if `name` is callable.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.methods.contains_key(name)
    }

    /// Response text of `help(name)`.
    #[must_use]
    pub fn describe(&self, name: &str) -> String {
        match self.inner.methods.get(name) {
            Some(method) => method
                .doc
                .clone()
                .unwrap_or_else(|| NO_DOCUMENTATION.to_string()),
            None => format!("{} has no method {name}", self.inner.service),
        }
    }

    /// Decides how to serve a call to `fct`.
    ///
    /// Protected names are rejected before any lookup.
    #[must_use]
    pub fn dispatch(&self, fct: &str, args: Arguments) -> Dispatch {
        if fct.starts_with(PROTECTED_PREFIX) {
            return Dispatch::Reply(Err(ZerobotError::ProtectedMethod(fct.to_string())));
        }
        let Some(method) = self.inner.methods.get(fct) else {
            return Dispatch::Reply(Err(ZerobotError::UnknownMethod(fct.to_string())));
        };
        match &method.kind {
            MethodKind::Help => Dispatch::Reply(self.help(&args)),
            MethodKind::Stop => Dispatch::Stop,
            MethodKind::Exposed(handler) => Dispatch::Invoke(Arc::clone(handler), args),
        }
    }

    fn help(&self, args: &Arguments) -> Result<Value> {
        let method: Option<String> = args
            .get_opt(0, "method")
            .map_err(|err| ZerobotError::Protocol(format!("{err:#}")))?;
        Ok(match method {
            Some(name) => Value::String(self.describe(&name)),
            None => Value::from(self.names()),
        })
    }
}

/// Builder returned by [`MethodTable::builder`].
pub struct MethodTableBuilder {
    service: String,
    methods: BTreeMap<String, Method>,
    error: Option<ZerobotError>,
}

impl fmt::Debug for MethodTableBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTableBuilder")
            .field("service", &self.service)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MethodTableBuilder {
    /// Registers a method. Reserved, protected, empty or duplicate names make
    /// [`MethodTableBuilder::build`] fail.
    #[must_use]
    pub fn method<F>(mut self, name: impl Into<String>, doc: Option<&str>, handler: F) -> Self
    where
        F: Fn(Arguments) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.error.is_some() {
            return self;
        }
        let problem = if name.is_empty() {
            Some("method name is empty")
        } else if name == HELP || name == STOP {
            Some("method name is reserved")
        } else if name.starts_with(PROTECTED_PREFIX) {
            Some("protected method names cannot be exposed")
        } else if self.methods.contains_key(&name) {
            Some("method registered twice")
        } else {
            None
        };
        if let Some(problem) = problem {
            self.error = Some(ZerobotError::InvalidConfig(format!("{name:?}: {problem}")));
            return self;
        }
        self.methods.insert(
            name,
            Method {
                doc: doc.map(str::to_string),
                kind: MethodKind::Exposed(Arc::new(handler)),
            },
        );
        self
    }

    /// Finishes the table, adding the `help` and `stop` builtins.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidConfig`] for the first rejected
    /// registration.
    pub fn build(mut self) -> Result<MethodTable> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.methods.insert(
            HELP.to_string(),
            Method {
                doc: Some("Lists the exposed methods, or documents one of them.".to_string()),
                kind: MethodKind::Help,
            },
        );
        self.methods.insert(
            STOP.to_string(),
            Method {
                doc: Some("Stops the service.".to_string()),
                kind: MethodKind::Stop,
            },
        );
        Ok(MethodTable {
            inner: Arc::new(TableInner {
                service: self.service,
                methods: self.methods,
            }),
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;

    fn table() -> MethodTable {
        let Ok(table) = MethodTable::builder("calc")
            .method("ping", Some("Adds 42."), |args| {
                let n: i64 = args.get(0, "n")?;
                Ok(json!(n + 42))
            })
            .method("quiet", None, |_| Ok(Value::Null))
            .build()
        else {
            panic!("valid table");
        };
        table
    }

    fn positional(values: Vec<Value>) -> Arguments {
        Arguments::new(values, Map::new())
    }

    #[test]
    fn help_lists_sorted_names() {
        let Dispatch::Reply(Ok(names)) = table().dispatch(HELP, Arguments::default()) else {
            panic!("help replies inline");
        };
        assert_eq!(names, json!(["help", "ping", "quiet", "stop"]));
    }

    #[test]
    fn help_documents_one_method() {
        let table = table();
        let Dispatch::Reply(Ok(doc)) = table.dispatch(HELP, positional(vec![json!("ping")])) else {
            panic!("help replies inline");
        };
        assert_eq!(doc, json!("Adds 42."));
        assert_eq!(table.describe("quiet"), NO_DOCUMENTATION);
        assert_eq!(table.describe("nope"), "calc has no method nope");
    }

    #[test]
    fn protected_names_never_reach_lookup() {
        let Dispatch::Reply(Err(err)) = table().dispatch("_secret", Arguments::default()) else {
            panic!("protected call must be rejected");
        };
        assert!(matches!(err, ZerobotError::ProtectedMethod(_)));
    }

    #[test]
    fn unknown_and_stop_dispatch() {
        let table = table();
        assert!(matches!(
            table.dispatch("missing", Arguments::default()),
            Dispatch::Reply(Err(ZerobotError::UnknownMethod(_)))
        ));
        assert!(matches!(table.dispatch(STOP, Arguments::default()), Dispatch::Stop));
    }

    #[test]
    fn exposed_handler_is_invoked_with_arguments() {
        let Dispatch::Invoke(handler, args) = table().dispatch("ping", positional(vec![json!(42)]))
        else {
            panic!("ping is exposed");
        };
        let Ok(value) = handler(args) else {
            panic!("handler succeeds");
        };
        assert_eq!(value, json!(84));
    }

    #[test]
    fn reserved_and_protected_registrations_fail() {
        for name in ["help", "stop", "_hidden", ""] {
            let result = MethodTable::builder("svc")
                .method(name, None, |_| Ok(Value::Null))
                .build();
            assert!(
                matches!(result, Err(ZerobotError::InvalidConfig(_))),
                "{name:?} should be rejected"
            );
        }
        let duplicate = MethodTable::builder("svc")
            .method("a", None, |_| Ok(Value::Null))
            .method("a", None, |_| Ok(Value::Null))
            .build();
        assert!(duplicate.is_err());
    }

    #[test]
    fn arguments_accept_positional_or_keyword() {
        let mut kwargs = Map::new();
        kwargs.insert("c".to_string(), json!(3));
        let args = Arguments::new(vec![json!(1), json!("two")], kwargs);

        let Ok(a) = args.get::<i64>(0, "a") else {
            panic!("positional a");
        };
        let Ok(c) = args.get::<i64>(2, "c") else {
            panic!("keyword c");
        };
        assert_eq!((a, c), (1, 3));
        assert!(args.positional::<i64>(1).is_err());
        assert!(args.get::<i64>(5, "missing").is_err());
        let Ok(None) = args.get_opt::<i64>(5, "missing") else {
            panic!("absent optional argument");
        };
    }
}
