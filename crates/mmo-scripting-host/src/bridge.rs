//! The `Script` namespace exposed to scripts
//!
//! Every builtin closes over an [`Arc<Capability>`] naming the state of the
//! context it was installed into, so two contexts never share timers, print
//! sinks or hidden bindings.

use std::sync::{Arc, Mutex};

use rquickjs::function::{Func, Opt, Rest};
use rquickjs::{Coerced, Ctx, FromJs, Function, Object, Persistent, Value};
use tracing::debug;

use crate::config::DialectConfig;
use crate::handle::Saved;
use crate::namespace::HiddenNamespace;
use crate::timer::{TimerId, TimerTable};

/// Name of the namespace object installed on the global object
pub const NAMESPACE: &str = "Script";

/// Engine line reported by `info()`
pub const ENGINE_NAME: &str = "QuickJS JavaScript Engine";

/// Destination of `Script.print`
pub type PrintSink = Arc<dyn Fn(&str) + Send + Sync>;

pub fn stdout_sink() -> PrintSink {
    Arc::new(|text: &str| println!("{text}"))
}

/// A timer's callback and the arguments it is called with
///
/// Handles are saved, cloned and dropped only while the context lock is held.
#[derive(Clone)]
pub struct TimerCallback {
    function: Saved<Function<'static>>,
    args: Vec<Saved<Value<'static>>>,
}

impl TimerCallback {
    fn save<'js>(ctx: &Ctx<'js>, function: Function<'js>, args: Vec<Value<'js>>) -> Self {
        Self {
            function: Saved::new(Persistent::save(ctx, function)),
            args: args
                .into_iter()
                .map(|arg| Saved::new(Persistent::save(ctx, arg)))
                .collect(),
        }
    }

    /// Call the callback with the global object as `this`
    pub fn call(self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let function = self.function.into_inner().restore(ctx)?;
        let args = self
            .args
            .into_iter()
            .map(|arg| arg.into_inner().restore(ctx))
            .collect::<rquickjs::Result<Vec<_>>>()?;
        function.call::<_, ()>((rquickjs::function::This(ctx.globals()), Rest(args)))
    }
}

/// State one context's builtins are allowed to touch
pub struct Capability {
    pub timers: Arc<TimerTable<TimerCallback>>,
    pub hidden: Arc<HiddenNamespace>,
    print: PrintSink,
    dialect: DialectConfig,
    dialect_version: Mutex<Option<String>>,
    libraries: Mutex<Vec<String>>,
}

impl Capability {
    pub fn new(
        timers: Arc<TimerTable<TimerCallback>>,
        hidden: Arc<HiddenNamespace>,
        print: PrintSink,
        dialect: DialectConfig,
    ) -> Self {
        Self {
            timers,
            hidden,
            print,
            dialect,
            dialect_version: Mutex::new(None),
            libraries: Mutex::new(Vec::new()),
        }
    }

    pub fn print(&self, text: &str) {
        debug!(target: "script", "{}", text);
        (self.print)(text);
    }

    /// Record a utility library that finished loading
    pub fn add_library(&self, name: &str) {
        if let Ok(mut libraries) = self.libraries.lock() {
            libraries.push(name.to_string());
        }
    }

    /// Record the dialect compiler's version, read once when it was hidden
    pub fn set_dialect_version(&self, version: Option<String>) {
        if let Ok(mut current) = self.dialect_version.lock() {
            *current = version;
        }
    }

    /// Engine, dialect and library description
    ///
    /// Built from state recorded at load time; never calls into the engine.
    pub fn describe(&self) -> String {
        let mut info = format!("{ENGINE_NAME}\n");

        let version = self
            .dialect_version
            .lock()
            .ok()
            .and_then(|version| version.clone());
        if let Some(version) = version {
            info.push_str(&format!("{} {}\n", self.dialect.display_name, version));
        }

        if let Ok(libraries) = self.libraries.lock() {
            let lines: Vec<String> = libraries
                .iter()
                .map(|name| format!("Library: {name}"))
                .collect();
            info.push_str(&lines.join("\n"));
        }

        info.trim_end().to_string()
    }

    fn schedule(&self, args: Vec<Value<'_>>, recurring: bool) -> Option<u32> {
        let mut args = args.into_iter();
        let function = args.next()?.into_function()?;
        let ctx = function.ctx().clone();
        let delay = delay_millis(&ctx, args.next()?);

        let callback = TimerCallback::save(&ctx, function, args.collect());
        let id = self.timers.schedule(delay, recurring, callback);
        debug!(
            target: "scripting",
            "Registered {} #{} ({}ms)",
            if recurring { "interval" } else { "timeout" },
            id.raw(),
            delay
        );
        Some(id.raw())
    }

    fn clear(&self, id: Option<Value<'_>>) {
        let Some(id) = id.and_then(timer_id) else {
            return;
        };
        // Released here, after the table lock, with the context lock held
        let removed = self.timers.cancel(id);
        if removed.is_some() {
            debug!(target: "scripting", "Cleared timer #{}", id.raw());
        }
    }
}

/// Delay in whole milliseconds, as the engine's integer conversion would give it
fn delay_millis<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> i64 {
    let millis = Coerced::<f64>::from_js(ctx, value)
        .map(|millis| millis.0)
        .unwrap_or(0.0);
    if millis.is_finite() {
        millis.trunc() as i64
    } else {
        0
    }
}

fn timer_id(value: Value<'_>) -> Option<TimerId> {
    let ctx = value.ctx().clone();
    let Coerced(raw) = Coerced::<f64>::from_js(&ctx, value).ok()?;
    if raw.is_finite() && raw >= 0.0 && raw <= f64::from(u32::MAX) {
        Some(TimerId::new(raw.trunc() as u32))
    } else {
        None
    }
}

/// Install the `Script` namespace into the current context
pub fn install(ctx: &Ctx<'_>, capability: Arc<Capability>) -> rquickjs::Result<()> {
    let script = Object::new(ctx.clone())?;

    script.set(
        "print",
        Func::from({
            let capability = Arc::clone(&capability);
            move |text: Opt<Coerced<String>>| {
                let text = text.0.map(|Coerced(text)| text);
                capability.print(text.as_deref().unwrap_or("undefined"));
            }
        }),
    )?;

    script.set(
        "info",
        Func::from({
            let capability = Arc::clone(&capability);
            move || -> String { capability.describe() }
        }),
    )?;

    script.set(
        "setTimeout",
        Func::from({
            let capability = Arc::clone(&capability);
            move |args: Rest<Value<'_>>| capability.schedule(args.0, false)
        }),
    )?;

    script.set(
        "setInterval",
        Func::from({
            let capability = Arc::clone(&capability);
            move |args: Rest<Value<'_>>| capability.schedule(args.0, true)
        }),
    )?;

    script.set(
        "clearTimeout",
        Func::from({
            let capability = Arc::clone(&capability);
            move |id: Opt<Value<'_>>| capability.clear(id.0)
        }),
    )?;

    script.set(
        "clearInterval",
        Func::from({
            let capability = Arc::clone(&capability);
            move |id: Opt<Value<'_>>| capability.clear(id.0)
        }),
    )?;

    ctx.globals().set(NAMESPACE, script)?;
    debug!(target: "scripting", "Installed '{}' namespace", NAMESPACE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use std::time::Instant;

    struct Fixture {
        capability: Arc<Capability>,
        printed: Arc<Mutex<Vec<String>>>,
    }

    fn with_bridge<R: Send>(f: impl FnOnce(Ctx<'_>, &Fixture) -> R + Send) -> R {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();

        let printed = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&printed);
        let fixture = Fixture {
            capability: Arc::new(Capability::new(
                Arc::new(TimerTable::new()),
                Arc::new(HiddenNamespace::new()),
                Arc::new(move |text: &str| sink_lines.lock().unwrap().push(text.to_string())),
                DialectConfig::default(),
            )),
            printed,
        };

        context.with(|ctx| {
            install(&ctx, Arc::clone(&fixture.capability)).unwrap();
            let result = f(ctx, &fixture);
            drop(fixture.capability.timers.clear());
            drop(fixture.capability.hidden.clear());
            result
        })
    }

    #[test]
    fn test_print_goes_to_sink() {
        with_bridge(|ctx, fixture| {
            ctx.eval::<(), _>("Script.print('hi'); Script.print(42); Script.print();")
                .unwrap();
            assert_eq!(
                *fixture.printed.lock().unwrap(),
                vec!["hi".to_string(), "42".to_string(), "undefined".to_string()]
            );
        });
    }

    #[test]
    fn test_set_timeout_requires_function_and_delay() {
        with_bridge(|ctx, fixture| {
            let kind: String = ctx.eval("typeof Script.setTimeout('nope', 10)").unwrap();
            assert_eq!(kind, "undefined");
            let kind: String = ctx.eval("typeof Script.setTimeout(function () {})").unwrap();
            assert_eq!(kind, "undefined");
            assert_eq!(fixture.capability.timers.active_count(), 0);

            let id: u32 = ctx.eval("Script.setTimeout(function () {}, 10)").unwrap();
            assert_eq!(id, 1);
            assert_eq!(fixture.capability.timers.active_count(), 1);
        });
    }

    #[test]
    fn test_clear_removes_only_named_timer() {
        with_bridge(|ctx, fixture| {
            ctx.eval::<(), _>(
                "var f = function () {};
                 var a = Script.setInterval(f, 10);
                 var b = Script.setInterval(f, 10);
                 Script.clearInterval(a);",
            )
            .unwrap();
            let b: u32 = ctx.eval("b").unwrap();
            assert_eq!(fixture.capability.timers.active_count(), 1);
            assert!(fixture.capability.timers.phase(TimerId::new(b)).is_some());

            // Unknown and malformed ids are ignored
            ctx.eval::<(), _>("Script.clearTimeout(999); Script.clearTimeout('x'); Script.clearTimeout();")
                .unwrap();
            assert_eq!(fixture.capability.timers.active_count(), 1);
        });
    }

    #[test]
    fn test_callback_receives_extra_arguments() {
        with_bridge(|ctx, fixture| {
            ctx.eval::<(), _>("Script.setTimeout(function (a, b) { Script.print(a + b); }, 0, 2, 3);")
                .unwrap();

            let timers = &fixture.capability.timers;
            for id in timers.take_due(Instant::now()) {
                let callback = timers.begin_fire(id, TimerCallback::clone).unwrap();
                callback.call(&ctx).unwrap();
                timers.finish_fire(id, Instant::now());
            }
            assert_eq!(*fixture.printed.lock().unwrap(), vec!["5".to_string()]);
        });
    }

    #[test]
    fn test_info_lists_engine_and_libraries() {
        with_bridge(|ctx, fixture| {
            fixture.capability.add_library("sugar-1.2.5.min.js");
            let info: String = ctx.eval("Script.info()").unwrap();
            assert!(info.starts_with(ENGINE_NAME));
            assert!(info.ends_with("Library: sugar-1.2.5.min.js"));
        });
    }

    #[test]
    fn test_info_uses_recorded_dialect_version() {
        with_bridge(|ctx, fixture| {
            fixture.capability.set_dialect_version(Some("1.2.3".to_string()));
            ctx.eval::<(), _>(
                "Object.defineProperty(Object.prototype, 'VERSION', {
                    get: function () { for (;;) {} }
                 });",
            )
            .unwrap();

            let info: String = ctx.eval("Script.info()").unwrap();
            assert_eq!(info, format!("{ENGINE_NAME}\nCoffeeScript 1.2.3"));
        });
    }
}
