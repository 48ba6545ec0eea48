//! Host-only bindings and the code generation boundary
//!
//! A context has two namespaces: the script-visible global object, and the
//! table below, which only the host can reach. Bindings are moved from the
//! former into the latter when scripts must not see them (the dialect
//! compiler, the original `eval`).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use rquickjs::context::EvalOptions;
use rquickjs::{Ctx, Function, Persistent, Undefined, Value};
use tracing::{debug, warn};

use crate::handle::Saved;

/// Host-only binding holding the code generation switch
pub const CODEGEN_SWITCH: &str = "codegen";

/// Evaluates to a function `(allow) => void` closed over the original
/// `eval`, the function constructors and `Object.defineProperty`, so later
/// changes to globals cannot reach it. Only the host keeps a reference to it.
const CODEGEN_SWITCH_SOURCE: &str = r#"
(function () {
  var g = globalThis;
  var defineProperty = Object.defineProperty;
  var originalEval = g.eval;
  var originalFunction = g.Function;
  var prototypes = [
    Function.prototype,
    Object.getPrototypeOf(function* () {}),
    Object.getPrototypeOf(async function () {}),
    Object.getPrototypeOf(async function* () {})
  ];
  var constructors = prototypes.map(function (p) { return p.constructor; });
  var blocked = function Function() {
    throw new EvalError("Code generation from strings disallowed for this context");
  };
  blocked.prototype = Function.prototype;
  var define = function (target, key, value) {
    defineProperty(target, key, {
      __proto__: null, value: value, writable: true, enumerable: false, configurable: true
    });
  };
  return function (allow) {
    for (var i = 0; i < prototypes.length; i++) {
      define(prototypes[i], "constructor", allow ? constructors[i] : blocked);
    }
    define(g, "Function", allow ? originalFunction : blocked);
    if (allow) {
      define(g, "eval", originalEval);
    } else {
      delete g.eval;
    }
  };
})()
"#;

/// Bindings reachable only from the host
#[derive(Default)]
pub struct HiddenNamespace {
    bindings: Mutex<HashMap<String, Saved<Value<'static>>>>,
}

impl HiddenNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<String, Saved<Value<'static>>>> {
        self.bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert<'js>(&self, ctx: &Ctx<'js>, name: &str, value: Value<'js>) {
        let saved = Saved::new(Persistent::save(ctx, value));
        let previous = self.bindings().insert(name.to_string(), saved);
        drop(previous);
    }

    /// Look up a binding in the current context
    pub fn get<'js>(&self, ctx: &Ctx<'js>, name: &str) -> Option<Value<'js>> {
        let saved = self.bindings().get(name).cloned()?;
        saved.into_inner().restore(ctx).ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings().contains_key(name)
    }

    /// Move a global binding out of the script-visible namespace
    ///
    /// Returns `false` if the global does not exist.
    pub fn hide_global<'js>(&self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<bool> {
        let globals = ctx.globals();
        if !globals.contains_key(name)? {
            return Ok(false);
        }

        let value: Value = globals.get(name)?;
        self.insert(ctx, name, value);
        globals.remove(name)?;

        // Non-configurable bindings (top-level `var`) survive delete
        if globals.contains_key(name)? {
            warn!(target: "scripting", "Global '{}' is not deletable, shadowing it", name);
            globals.set(name, Undefined)?;
        }

        debug!(target: "scripting", "Moved '{}' to the host-only namespace", name);
        Ok(true)
    }

    /// Take every binding out of the table
    ///
    /// The returned handles must be dropped while the context lock is held.
    pub fn clear(&self) -> Vec<Saved<Value<'static>>> {
        self.bindings().drain().map(|(_, value)| value).collect()
    }
}

/// Install the code generation switch and apply the initial policy
pub fn install_codegen_switch(
    ctx: &Ctx<'_>,
    hidden: &HiddenNamespace,
    allow: bool,
) -> rquickjs::Result<()> {
    let mut options = EvalOptions::default();
    options.strict = false;
    let switch: Function = ctx.eval_with_options(CODEGEN_SWITCH_SOURCE, options)?;
    switch.call::<_, ()>((allow,))?;
    hidden.insert(ctx, CODEGEN_SWITCH, switch.into_value());
    Ok(())
}

/// Toggle code generation from strings
///
/// Returns `false` if the switch was never installed.
pub fn set_codegen_allowed(
    ctx: &Ctx<'_>,
    hidden: &HiddenNamespace,
    allow: bool,
) -> rquickjs::Result<bool> {
    let Some(switch) = hidden.get(ctx, CODEGEN_SWITCH) else {
        return Ok(false);
    };
    match switch.into_function() {
        Some(switch) => {
            switch.call::<_, ()>((allow,))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn with_context<R: Send>(f: impl FnOnce(Ctx<'_>, &HiddenNamespace) -> R + Send) -> R {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let hidden = HiddenNamespace::new();
        context.with(|ctx| {
            let result = f(ctx, &hidden);
            drop(hidden.clear());
            result
        })
    }

    #[test]
    fn test_hide_global_moves_binding() {
        with_context(|ctx, hidden| {
            ctx.eval::<(), _>("globalThis.Secret = { answer: 42 };").unwrap();

            assert!(hidden.hide_global(&ctx, "Secret").unwrap());
            let visible: bool = ctx.eval("typeof Secret !== 'undefined'").unwrap();
            assert!(!visible);

            let secret = hidden.get(&ctx, "Secret").unwrap();
            let answer: i32 = secret.as_object().unwrap().get("answer").unwrap();
            assert_eq!(answer, 42);
        });
    }

    #[test]
    fn test_hide_missing_global() {
        with_context(|ctx, hidden| {
            assert!(!hidden.hide_global(&ctx, "Nope").unwrap());
            assert!(!hidden.contains("Nope"));
        });
    }

    #[test]
    fn test_codegen_switch_blocks_and_restores() {
        with_context(|ctx, hidden| {
            install_codegen_switch(&ctx, hidden, false).unwrap();

            let eval_type: String = ctx.eval("typeof eval").unwrap();
            assert_eq!(eval_type, "undefined");
            assert!(ctx.eval::<i32, _>("new Function('return 1')()").is_err());
            let _ = ctx.catch();
            assert!(ctx
                .eval::<i32, _>("(function(){}).constructor('return 1')()")
                .is_err());
            let _ = ctx.catch();
            assert!(ctx
                .eval::<(), _>("(function*(){}).constructor('yield 1')")
                .is_err());
            let _ = ctx.catch();

            // instanceof keeps working with the blocked constructor
            let is_function: bool = ctx.eval("(function(){}) instanceof Function").unwrap();
            assert!(is_function);

            assert!(set_codegen_allowed(&ctx, hidden, true).unwrap());
            let value: i32 = ctx.eval("eval('1 + 2')").unwrap();
            assert_eq!(value, 3);
            let value: i32 = ctx.eval("new Function('return 4')()").unwrap();
            assert_eq!(value, 4);
        });
    }

    #[test]
    fn test_codegen_switch_ignores_patched_globals() {
        with_context(|ctx, hidden| {
            install_codegen_switch(&ctx, hidden, false).unwrap();
            ctx.eval::<(), _>(
                "Object.defineProperty = function () { throw new Error('patched'); };
                 Object.prototype.get = function () { return 1; };",
            )
            .unwrap();

            assert!(set_codegen_allowed(&ctx, hidden, true).unwrap());
            let value: i32 = ctx.eval("eval('2 * 3')").unwrap();
            assert_eq!(value, 6);
        });
    }
}
