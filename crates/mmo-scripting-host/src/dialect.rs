//! Dialect compiler access
//!
//! The compiler is ordinary script source loaded at context creation; once
//! loaded, its global is moved into the host-only namespace so scripts can
//! neither call nor patch it.

use rquickjs::function::This;
use rquickjs::{Ctx, Object, Value};
use tracing::{debug, warn};

use crate::namespace::HiddenNamespace;

/// Move the compiler's global out of the script-visible namespace
///
/// Returns `false` if the bootstrap did not define the global.
pub fn hide_compiler(ctx: &Ctx<'_>, hidden: &HiddenNamespace, global: &str) -> bool {
    match hidden.hide_global(ctx, global) {
        Ok(true) => true,
        Ok(false) => {
            warn!(target: "scripting", "Dialect bootstrap did not define '{}'", global);
            false
        }
        Err(e) => {
            warn!(target: "scripting", "Failed to hide dialect compiler '{}': {}", global, e);
            false
        }
    }
}

fn compiler<'js>(ctx: &Ctx<'js>, hidden: &HiddenNamespace, global: &str) -> Option<Object<'js>> {
    hidden.get(ctx, global)?.into_object()
}

/// Transpile `source` with `{bare: true}`
///
/// `None` when the compiler, its `compile` entry point or a string result is
/// unavailable. A compiler exception is left pending on the context.
pub fn compile(
    ctx: &Ctx<'_>,
    hidden: &HiddenNamespace,
    global: &str,
    source: &str,
) -> rquickjs::Result<Option<String>> {
    let Some(compiler) = compiler(ctx, hidden, global) else {
        debug!(target: "scripting", "No dialect compiler loaded, passing source through");
        return Ok(None);
    };
    let Some(compile) = compiler.get::<_, Value>("compile")?.into_function() else {
        return Ok(None);
    };

    // Disable the top-level function wrapper so declarations stay global
    let options = Object::new(ctx.clone())?;
    options.set("bare", true)?;

    let result: Value = compile.call((This(compiler), source, options))?;
    match result.as_string() {
        Some(compiled) => Ok(Some(compiled.to_string()?)),
        None => Ok(None),
    }
}

/// `VERSION` advertised by the compiler, if any
///
/// Only an own property counts; nothing is looked up on the prototype chain.
pub fn version(ctx: &Ctx<'_>, hidden: &HiddenNamespace, global: &str) -> Option<String> {
    let compiler = compiler(ctx, hidden, global)?;
    let own = compiler
        .keys::<String>()
        .filter_map(Result::ok)
        .any(|key| key == "VERSION");
    if !own {
        return None;
    }
    compiler.get::<_, Option<String>>("VERSION").ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    const TOY_COMPILER: &str = r#"
globalThis.Toy = {
  VERSION: "0.0.1",
  compile: function (source, options) {
    var body = source.replace(/^say (.*)$/gm, "Script.print($1);");
    return options && options.bare ? body : "(function () {\n" + body + "\n}).call(this);";
  }
};
"#;

    fn with_compiler<R: Send>(f: impl FnOnce(Ctx<'_>, &HiddenNamespace) -> R + Send) -> R {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let hidden = HiddenNamespace::new();
        context.with(|ctx| {
            ctx.eval::<(), _>(TOY_COMPILER).unwrap();
            let result = f(ctx, &hidden);
            drop(hidden.clear());
            result
        })
    }

    #[test]
    fn test_compile_uses_bare_option() {
        with_compiler(|ctx, hidden| {
            assert!(hide_compiler(&ctx, hidden, "Toy"));
            let compiled = compile(&ctx, hidden, "Toy", "say 'hi'").unwrap();
            assert_eq!(compiled.as_deref(), Some("Script.print('hi');"));
        });
    }

    #[test]
    fn test_compiler_is_hidden_from_scripts() {
        with_compiler(|ctx, hidden| {
            hide_compiler(&ctx, hidden, "Toy");
            let kind: String = ctx.eval("typeof Toy").unwrap();
            assert_eq!(kind, "undefined");
            assert_eq!(version(&ctx, hidden, "Toy").as_deref(), Some("0.0.1"));
        });
    }

    #[test]
    fn test_missing_compiler_passes_through() {
        with_compiler(|ctx, hidden| {
            assert!(!hide_compiler(&ctx, hidden, "Missing"));
            assert_eq!(compile(&ctx, hidden, "Missing", "say 1").unwrap(), None);
            assert_eq!(version(&ctx, hidden, "Missing"), None);
        });
    }

    #[test]
    fn test_inherited_version_is_ignored() {
        with_compiler(|ctx, hidden| {
            ctx.eval::<(), _>(
                "globalThis.Bare = { compile: function (s) { return s; } };
                 Object.prototype.VERSION = 'inherited';",
            )
            .unwrap();
            assert!(hide_compiler(&ctx, hidden, "Bare"));
            assert_eq!(version(&ctx, hidden, "Bare"), None);
        });
    }
}
