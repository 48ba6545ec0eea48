use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rquickjs::context::EvalOptions;
use rquickjs::{Coerced, Context, Ctx, Exception, FromJs, Runtime, Value};
use tracing::{debug, error, info, warn};

use crate::bridge::{self, Capability, PrintSink, TimerCallback};
use crate::config::{DialectConfig, SandboxConfig};
use crate::dialect;
use crate::error::{ExecutionOutcome, ScriptError};
use crate::json::{self, JsonFailure};
use crate::namespace::{self, HiddenNamespace};
use crate::timer::{TimerHost, TimerScheduler, TimerTable};
use crate::value::ScriptValue;
use crate::watchdog::{self, ActiveRun, BoundedRun};

/// Receives errors raised by work no caller is waiting on (timer callbacks,
/// bootstrap files)
pub type ErrorHook = Arc<dyn Fn(&ScriptError) + Send + Sync>;

/// Engine state shared between the host-facing handle and the tick thread
struct Sandbox {
    context: Context,
    active: Arc<ActiveRun>,
    capability: Arc<Capability>,
    error_hook: RwLock<Option<ErrorHook>>,
    bound_override: Option<Duration>,
    allow_eval: AtomicBool,
    resource_dir: PathBuf,
    dialect: DialectConfig,
}

impl Sandbox {
    fn hidden(&self) -> &HiddenNamespace {
        &self.capability.hidden
    }

    fn bound(&self) -> Option<Duration> {
        watchdog::effective_bound(self.bound_override)
    }

    /// Run one unit of script work under the context lock and the watchdog
    ///
    /// The bound starts once the lock is held.
    fn run<T, F>(&self, work: F) -> Result<T, ScriptError>
    where
        T: Send,
        F: FnOnce(&Ctx<'_>) -> Result<T, ScriptError> + Send,
    {
        watchdog::run_bounded(self.bound(), |run: &BoundedRun| {
            self.context.with(|ctx| {
                let token = run.token();
                let _running = self.active.install(token.clone());
                run.enter();
                match work(&ctx) {
                    Err(_) if token.is_cancelled() => Err(ScriptError::Timeout),
                    result => result,
                }
            })
        })
    }

    /// Hand an error to the hook, or log it when there is none
    fn report(&self, error: &ScriptError) {
        let hook = self
            .error_hook
            .read()
            .ok()
            .and_then(|hook| hook.as_ref().map(Arc::clone));
        match hook {
            Some(hook) => {
                debug!(target: "scripting", "{}", error);
                hook(error);
            }
            None => error!(target: "scripting", "{}", error),
        }
    }

    fn read_resource(&self, file_name: &str) -> Result<(PathBuf, String), ScriptError> {
        let path = self.resource_dir.join(file_name);
        match fs::read_to_string(&path) {
            Ok(source) => Ok((path, source)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ScriptError::missing_file(path)),
            Err(e) => Err(ScriptError::Io {
                path,
                message: e.to_string(),
            }),
        }
    }

    fn execute(&self, source: &str, label: &str) -> Result<ScriptValue, ScriptError> {
        self.run(|ctx| {
            let value = evaluate(ctx, source, label)?;
            Ok(ScriptValue::from_js(&value))
        })
    }

    fn load(&self, file_name: &str) -> Result<ScriptValue, ScriptError> {
        let started = Instant::now();
        let result = self
            .read_resource(file_name)
            .and_then(|(path, source)| self.execute(&source, &path.display().to_string()));
        debug!(
            target: "scripting",
            "Running time for {}: {:.3}sec",
            self.resource_dir.join(file_name).display(),
            started.elapsed().as_secs_f64()
        );
        result
    }

    /// Release every engine handle owned outside the engine
    fn release(&self) {
        self.context.with(|_ctx| {
            drop(self.capability.timers.clear());
            drop(self.hidden().clear());
        });
    }
}

impl TimerHost for Sandbox {
    fn tick(&self, now: Instant) {
        let timers = &self.capability.timers;

        for id in timers.take_due(now) {
            let label = format!("timer #{}", id.raw());
            let fired = self.run(|ctx| {
                let Some(callback) = timers.begin_fire(id, TimerCallback::clone) else {
                    return Ok(());
                };
                callback
                    .call(ctx)
                    .map_err(|e| engine_error(ctx, e, &label))
            });
            if let Err(e) = fired {
                self.report(&e);
            }
            timers.finish_fire(id, now);
        }

        if timers.has_disposed() {
            self.context.with(|_ctx| drop(timers.sweep()));
        }
    }
}

/// Compile and run `source` in sloppy mode, as a classic script
fn evaluate<'js>(ctx: &Ctx<'js>, source: &str, label: &str) -> Result<Value<'js>, ScriptError> {
    let mut options = EvalOptions::default();
    options.strict = false;
    ctx.eval_with_options(source, options)
        .map_err(|e| engine_error(ctx, e, label))
}

/// Convert an engine error, taking the pending exception if there is one
fn engine_error(ctx: &Ctx<'_>, error: rquickjs::Error, label: &str) -> ScriptError {
    if !matches!(error, rquickjs::Error::Exception) {
        return ScriptError::runtime(format!("{label}: {error}"));
    }

    let caught = ctx.catch();
    let name = caught
        .as_object()
        .and_then(|obj| obj.get::<_, Option<String>>("name").ok().flatten());
    let text = exception_text(ctx, caught);

    // The engine reports parse failures as SyntaxError before running anything
    if name.as_deref() == Some("SyntaxError") {
        ScriptError::compile(format!("{label}: {text}"))
    } else {
        ScriptError::runtime(format!("{label}: {text}"))
    }
}

fn exception_text<'js>(ctx: &Ctx<'js>, caught: Value<'js>) -> String {
    let exception = caught
        .as_object()
        .and_then(|obj| Some((obj.get::<_, Option<String>>("name").ok()?, obj.clone())))
        .and_then(|(name, obj)| Some((name, Exception::from_object(obj)?)));
    if let Some((name, exception)) = exception {
        let name = name.unwrap_or_else(|| "Error".to_string());
        let mut text = match exception.message() {
            Some(message) if !message.is_empty() => format!("{name}: {message}"),
            _ => name,
        };
        if let Some(stack) = exception.stack().filter(|stack| !stack.trim().is_empty()) {
            text.push('\n');
            text.push_str(stack.trim_end());
        }
        return text;
    }

    match Coerced::<String>::from_js(ctx, caught) {
        Ok(Coerced(text)) => text,
        Err(e) => format!("(unprintable exception: {e})"),
    }
}

/// Builder for a [`ScriptContext`] with a custom print sink or error hook
pub struct ScriptContextBuilder {
    config: SandboxConfig,
    print: PrintSink,
    error_hook: Option<ErrorHook>,
}

impl Default for ScriptContextBuilder {
    fn default() -> Self {
        Self {
            config: SandboxConfig::default(),
            print: bridge::stdout_sink(),
            error_hook: None,
        }
    }
}

impl ScriptContextBuilder {
    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn resource_dir(mut self, resource_dir: impl Into<PathBuf>) -> Self {
        self.config.resource_dir = Some(resource_dir.into());
        self
    }

    /// Where `Script.print` writes (stdout by default)
    ///
    /// The sink runs with the context lock held and must not call back into
    /// the context.
    pub fn print_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.print = Arc::new(sink);
        self
    }

    pub fn error_hook(mut self, hook: impl Fn(&ScriptError) + Send + Sync + 'static) -> Self {
        self.error_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<ScriptContext, ScriptError> {
        let config = self.config;
        let resource_dir = config.resource_dir();

        let runtime = Runtime::new()
            .map_err(|e| ScriptError::integration(format!("Failed to create runtime: {e}")))?;
        if let Some(limit) = config.memory_limit_bytes {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = config.max_stack_bytes {
            runtime.set_max_stack_size(limit);
        }

        let active = Arc::new(ActiveRun::new());
        let interrupt = Arc::clone(&active);
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.should_interrupt())));

        let context = Context::full(&runtime)
            .map_err(|e| ScriptError::integration(format!("Failed to create context: {e}")))?;

        let hidden = Arc::new(HiddenNamespace::new());
        let capability = Arc::new(Capability::new(
            Arc::new(TimerTable::new()),
            Arc::clone(&hidden),
            self.print,
            config.dialect.clone(),
        ));

        context.with(|ctx| -> Result<(), ScriptError> {
            namespace::install_codegen_switch(&ctx, &hidden, config.allow_eval)
                .map_err(|e| engine_error(&ctx, e, "codegen"))?;
            bridge::install(&ctx, Arc::clone(&capability))
                .map_err(|e| engine_error(&ctx, e, bridge::NAMESPACE))?;
            Ok(())
        })?;

        let shared = Arc::new(Sandbox {
            context,
            active,
            capability,
            error_hook: RwLock::new(self.error_hook),
            bound_override: config.max_execution_time(),
            allow_eval: AtomicBool::new(config.allow_eval),
            resource_dir,
            dialect: config.dialect.clone(),
        });

        match shared.load(&config.dialect.bootstrap) {
            Ok(_) => {
                let global = &config.dialect.global;
                let version = shared.context.with(|ctx| {
                    dialect::hide_compiler(&ctx, shared.hidden(), global)
                        .then(|| dialect::version(&ctx, shared.hidden(), global))
                });
                if let Some(version) = version {
                    info!(target: "scripting", "Loaded dialect compiler '{}'", global);
                    shared.capability.set_dialect_version(version);
                }
            }
            Err(e) => shared.report(&e),
        }

        for library in &config.libraries {
            match shared.load(library) {
                Ok(_) => {
                    info!(target: "scripting", "Loaded library '{}'", library);
                    shared.capability.add_library(library);
                }
                Err(e) => shared.report(&e),
            }
        }

        let scheduler = TimerScheduler::start(Arc::clone(&shared), config.tick_interval())
            .map_err(|e| ScriptError::integration(format!("Failed to start timer thread: {e}")))?;

        debug!(
            target: "scripting",
            "Created script context (resources: {})",
            shared.resource_dir.display()
        );

        Ok(ScriptContext { shared, scheduler })
    }
}

/// An isolated script runtime with its own timers, builtins and hidden bindings
///
/// Every method takes `&self`; the context can be shared across threads and
/// serialises entry into the engine internally. Script work runs under the
/// execution bound (see [`ScriptContext::set_max_execution_time`]).
pub struct ScriptContext {
    shared: Arc<Sandbox>,
    scheduler: TimerScheduler,
}

impl ScriptContext {
    /// Create a context reading its bootstrap files from `resource_dir`
    pub fn create(resource_dir: impl Into<PathBuf>) -> Result<Self, ScriptError> {
        Self::builder().resource_dir(resource_dir).build()
    }

    pub fn with_config(config: SandboxConfig) -> Result<Self, ScriptError> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ScriptContextBuilder {
        ScriptContextBuilder::default()
    }

    /// Set the process-wide execution bound in milliseconds. `0` disables it.
    ///
    /// Contexts configured with their own bound ignore this.
    pub fn set_max_execution_time(millis: u64) {
        watchdog::set_max_execution_time(millis);
    }

    /// Compile and run `source`; `label` names it in diagnostics
    pub fn execute(&self, source: &str, label: &str) -> ExecutionOutcome {
        let result = self.shared.execute(source, label);
        if let Err(e) = &result {
            debug!(target: "scripting", "{} failed ({}): {}", label, e.kind(), e);
        }
        result.into()
    }

    /// Run `source` and hand `(value, error text)` to `callback`
    pub fn execute_with(
        &self,
        source: &str,
        label: &str,
        callback: impl FnOnce(&ScriptValue, &str),
    ) {
        let outcome = self.execute(source, label);
        if let Some(e) = outcome.error() {
            error!(target: "scripting", "{}", e);
        }
        callback(&outcome.value(), &outcome.error_text());
    }

    /// Run a file from the resource directory
    pub fn load(&self, file_name: &str) -> ExecutionOutcome {
        self.shared.load(file_name).into()
    }

    pub fn load_with(&self, file_name: &str, callback: impl FnOnce(&ScriptValue, &str)) {
        let outcome = self.load(file_name);
        if let Some(e) = outcome.error() {
            error!(target: "scripting", "{}", e);
        }
        callback(&outcome.value(), &outcome.error_text());
    }

    /// Transpile dialect source to JavaScript
    ///
    /// Returns the input unchanged when no compiler is loaded or compilation
    /// fails.
    pub fn compile_dialect(&self, source: &str) -> String {
        match self.try_compile_dialect(source) {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!(target: "scripting", "Dialect compilation failed: {}", e);
                source.to_string()
            }
        }
    }

    /// Like [`ScriptContext::compile_dialect`], but reports compiler exceptions
    pub fn try_compile_dialect(&self, source: &str) -> Result<String, ScriptError> {
        let shared = &self.shared;
        let compiled = shared.run(|ctx| {
            dialect::compile(ctx, shared.hidden(), &shared.dialect.global, source)
                .map_err(|e| engine_error(ctx, e, &shared.dialect.display_name))
        })?;
        Ok(compiled.unwrap_or_else(|| source.to_string()))
    }

    /// Parse JSON text with the engine's parser
    pub fn parse_json(&self, text: &str) -> ExecutionOutcome {
        self.shared
            .run(|ctx| match json::parse(ctx, text) {
                Ok(value) => Ok(ScriptValue::from_js(&value)),
                Err(JsonFailure::MissingParser) => Err(json::missing_parser_error()),
                Err(JsonFailure::Threw(e)) => {
                    let message = engine_error(ctx, e, "JSON").to_string();
                    Err(ScriptError::compile(message))
                }
            })
            .into()
    }

    /// Engine, dialect and library description
    pub fn info(&self) -> String {
        self.shared.capability.describe()
    }

    /// Abort the script currently running in this context, if any
    ///
    /// Takes effect at the engine's next safepoint. The aborted work reports
    /// a timeout.
    pub fn terminate(&self) {
        if self.shared.active.terminate() {
            info!(target: "scripting", "Termination requested");
        }
    }

    pub fn allow_eval(&self) -> bool {
        self.shared.allow_eval.load(Ordering::SeqCst)
    }

    /// Allow code generation from strings (`eval`, `Function`)
    ///
    /// One-way: references to `eval` or `Function` saved by scripts while it
    /// was allowed cannot be taken back, so forbidding it again is refused
    /// with an `IntegrationError`. Setting the current state is a no-op.
    pub fn set_allow_eval(&self, allow: bool) -> Result<(), ScriptError> {
        let shared = &self.shared;
        if allow == self.allow_eval() {
            return Ok(());
        }
        if !allow {
            return Err(ScriptError::integration(
                "Code generation cannot be disabled once allowed",
            ));
        }

        let switched = shared.run(|ctx| {
            namespace::set_codegen_allowed(ctx, shared.hidden(), true)
                .map_err(|e| engine_error(ctx, e, "codegen"))
        })?;
        if !switched {
            return Err(ScriptError::integration("Code generation switch is missing"));
        }
        shared.allow_eval.store(true, Ordering::SeqCst);
        debug!(target: "scripting", "Code generation from strings allowed");
        Ok(())
    }

    pub fn set_error_hook(&self, hook: impl Fn(&ScriptError) + Send + Sync + 'static) {
        if let Ok(mut current) = self.shared.error_hook.write() {
            *current = Some(Arc::new(hook));
        }
    }

    /// Number of timers waiting to fire (or fired and not yet swept)
    pub fn pending_timers(&self) -> usize {
        self.shared.capability.timers.active_count()
    }

    pub fn resource_dir(&self) -> &Path {
        &self.shared.resource_dir
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        // No tick may run once handles start being released
        self.scheduler.stop();
        self.shared.release();
        debug!(target: "scripting", "Script context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Counts error-level `scripting` events on the current thread
    #[derive(Clone, Default)]
    struct ErrorEvents(Arc<std::sync::Mutex<usize>>);

    impl<S: Subscriber> Layer<S> for ErrorEvents {
        fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
            let metadata = event.metadata();
            if *metadata.level() == Level::ERROR && metadata.target() == "scripting" {
                *self.0.lock().unwrap() += 1;
            }
        }
    }

    fn count_error_events(f: impl FnOnce()) -> usize {
        let events = ErrorEvents::default();
        let subscriber = tracing_subscriber::registry().with(events.clone());
        tracing::subscriber::with_default(subscriber, f);
        let count = *events.0.lock().unwrap();
        count
    }

    fn sandbox_config() -> SandboxConfig {
        let mut config = SandboxConfig::with_resource_dir("/nonexistent/mmo-scripts");
        config.libraries.clear();
        config.max_execution_time_ms = Some(200);
        config
    }

    #[test]
    fn test_execute_returns_value() {
        let context = ScriptContext::with_config(sandbox_config()).unwrap();
        let outcome = context.execute("1 + 2", "sum");
        assert!(outcome.is_ok());
        assert_eq!(outcome.value().as_f64(), Some(3.0));
        assert_eq!(outcome.error_text(), "");
    }

    #[test]
    fn test_syntax_error_is_compile_error() {
        let context = ScriptContext::with_config(sandbox_config()).unwrap();
        let outcome = context.execute("var x = ;", "broken");
        assert_eq!(outcome.kind(), Some(ErrorKind::CompileError));
        assert!(outcome.error_text().starts_with("broken: SyntaxError"));
    }

    #[test]
    fn test_thrown_error_is_runtime_error() {
        let context = ScriptContext::with_config(sandbox_config()).unwrap();
        let outcome = context.execute("throw new TypeError('bad');", "thrower");
        assert_eq!(outcome.kind(), Some(ErrorKind::RuntimeError));
        assert!(outcome.error_text().contains("TypeError: bad"));

        let outcome = context.execute("throw 'plain';", "thrower");
        assert_eq!(outcome.error_text(), "thrower: plain");
    }

    #[test]
    fn test_sloppy_mode_globals() {
        let context = ScriptContext::with_config(sandbox_config()).unwrap();
        assert!(context.execute("implicitGlobal = 5;", "sloppy").is_ok());
        assert_eq!(
            context.execute("implicitGlobal", "read").value().as_f64(),
            Some(5.0)
        );
    }

    #[test]
    fn test_missing_bootstrap_reports_io_error() {
        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        let context = ScriptContext::builder()
            .config(sandbox_config())
            .error_hook(move |e| seen.lock().unwrap().push(e.clone()))
            .build()
            .unwrap();

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), ErrorKind::IOError);
        assert!(errors[0].to_string().ends_with("coffee-script.js No such file."));

        // Dialect degrades to identity
        assert_eq!(context.compile_dialect("x = 1"), "x = 1");
    }

    #[test]
    fn test_info_without_dialect() {
        let context = ScriptContext::with_config(sandbox_config()).unwrap();
        assert_eq!(context.info(), bridge::ENGINE_NAME);
    }

    #[test]
    fn test_load_missing_file() {
        let context = ScriptContext::with_config(sandbox_config()).unwrap();
        let outcome = context.load("nope.js");
        assert_eq!(outcome.kind(), Some(ErrorKind::IOError));
        assert!(outcome.error_text().starts_with("Error: "));
        assert!(outcome.error_text().ends_with("nope.js No such file."));
    }

    #[test]
    fn test_terminate_without_running_script() {
        let context = ScriptContext::with_config(sandbox_config()).unwrap();
        context.terminate();
        assert!(context.execute("1", "after").is_ok());
    }

    #[test]
    fn test_context_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ScriptContext>();
        assert_send_sync::<HiddenNamespace>();
        assert_send_sync::<TimerTable<TimerCallback>>();
        assert_send_sync::<Capability>();
    }

    #[test]
    fn test_hooked_errors_are_not_logged_at_error_level() {
        // The missing bootstrap is the only reported error
        let hooked = count_error_events(|| {
            let _context = ScriptContext::builder()
                .config(sandbox_config())
                .error_hook(|_| {})
                .build()
                .unwrap();
        });
        assert_eq!(hooked, 0);

        let unhooked = count_error_events(|| {
            let _context = ScriptContext::with_config(sandbox_config()).unwrap();
        });
        assert_eq!(unhooked, 1);
    }

    #[test]
    fn test_allow_eval_is_one_way() {
        let context = ScriptContext::with_config(sandbox_config()).unwrap();

        // Forbidding while forbidden is a no-op
        assert!(context.set_allow_eval(false).is_ok());

        context.set_allow_eval(true).unwrap();
        assert!(context.execute("var saved = eval;", "save").is_ok());

        let refused = context.set_allow_eval(false).unwrap_err();
        assert_eq!(refused.kind(), ErrorKind::IntegrationError);
        assert!(context.allow_eval());
        assert_eq!(
            context.execute("saved('6 * 7')", "saved").value().as_f64(),
            Some(42.0)
        );
    }
}
