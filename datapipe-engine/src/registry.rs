use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use datapipe_core::{AppKind, AppSpec, ArgValue, EnqueueError};

/// A native app body: materialized positional + named arguments in,
/// result value out. Errors are plain strings; they end up in the
/// record's `err` column, not in a Rust panic path.
pub type NativeResult = Result<ArgValue, String>;
pub type NativeFn = dyn Fn(&[ArgValue], &BTreeMap<String, ArgValue>) -> NativeResult + Send + Sync;

pub struct RegisteredApp {
    pub spec: AppSpec,
    handler: Option<Arc<NativeFn>>,
}

impl RegisteredApp {
    pub fn handler(&self) -> Option<Arc<NativeFn>> {
        self.handler.clone()
    }
}

/// Name -> declared app. Re-registering a name replaces the previous
/// declaration (the edited-source path of a new session).
#[derive(Default)]
pub struct AppRegistry {
    apps: HashMap<String, RegisteredApp>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shell app (argv template; no in-process handler).
    pub fn register(&mut self, spec: AppSpec) -> Result<(), EnqueueError> {
        if spec.kind == AppKind::Shell {
            spec.argv_template().map_err(|e| {
                EnqueueError::InvalidApp(format!("app '{}': bad argv template: {e}", spec.name))
            })?;
        } else if spec.kind == AppKind::Native {
            return Err(EnqueueError::InvalidApp(format!(
                "native app '{}' needs a handler; use register_native",
                spec.name
            )));
        }
        self.apps.insert(
            spec.name.clone(),
            RegisteredApp {
                spec,
                handler: None,
            },
        );
        Ok(())
    }

    /// Register a native app together with its callable.
    pub fn register_native<F>(&mut self, spec: AppSpec, handler: F) -> Result<(), EnqueueError>
    where
        F: Fn(&[ArgValue], &BTreeMap<String, ArgValue>) -> NativeResult + Send + Sync + 'static,
    {
        if spec.kind != AppKind::Native {
            return Err(EnqueueError::InvalidApp(format!(
                "app '{}' is not native",
                spec.name
            )));
        }
        self.apps.insert(
            spec.name.clone(),
            RegisteredApp {
                spec,
                handler: Some(Arc::new(handler)),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredApp> {
        self.apps.get(name)
    }

    pub fn specs(&self) -> impl Iterator<Item = &AppSpec> {
        self.apps.values().map(|app| &app.spec)
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

/// Register a native app capturing the callable's source text via
/// `stringify!`. Token-level capture: whitespace is normalized. Pass an
/// explicit `AppSpec::native(name, source)` when byte-verbatim source
/// semantics matter.
#[macro_export]
macro_rules! register_native {
    ($registry:expr, $name:expr, $func:expr) => {{
        let spec = $crate::AppSpec::native($name, stringify!($func));
        $registry.register_native(spec, $func)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_replace() {
        let mut registry = AppRegistry::new();
        registry
            .register_native(AppSpec::native("double", "v1"), |args, _| {
                Ok(ArgValue::Int(args[0].as_int().unwrap_or(0) * 2))
            })
            .unwrap();
        assert_eq!(registry.get("double").unwrap().spec.code_blob, "v1");

        registry
            .register_native(AppSpec::native("double", "v2"), |args, _| {
                Ok(ArgValue::Int(args[0].as_int().unwrap_or(0) * 2))
            })
            .unwrap();
        assert_eq!(registry.get("double").unwrap().spec.code_blob, "v2");
    }

    #[test]
    fn shell_app_has_no_handler() {
        let mut registry = AppRegistry::new();
        registry
            .register(AppSpec::shell("echo", vec!["echo", "{msg}"]))
            .unwrap();
        let app = registry.get("echo").unwrap();
        assert!(app.handler().is_none());
    }

    #[test]
    fn macro_captures_source_text() {
        let mut registry = AppRegistry::new();
        crate::register_native!(registry, "sum", |args, _kw| {
            Ok(ArgValue::Int(args.iter().filter_map(|a| a.as_int()).sum::<i64>()))
        })
        .unwrap();
        let spec = &registry.get("sum").unwrap().spec;
        assert!(spec.code_blob.contains("filter_map"));
    }

    #[test]
    fn kind_mismatches_are_rejected() {
        let mut registry = AppRegistry::new();
        assert!(registry.register(AppSpec::native("f", "src")).is_err());
        assert!(registry
            .register_native(AppSpec::shell("s", vec!["true"]), |_, _| Ok(ArgValue::Null))
            .is_err());
    }
}
