//! Shared test languages
//!
//! `TestLanguage` records every lifecycle callback into an [`EventLog`] and
//! interprets a tiny command language:
//!
//! - `sleep:<ms>` sleeps through `Env::sleep`
//! - `park` parks until cancelled
//! - `block:<ms>` sleeps without looking at cancellation
//! - `init:<language>` initializes another language
//! - `eval:<language>:<code>` evaluates code of another language
//! - `export:<name>=<text>` / `import:<name>` use the polyglot bindings
//! - `fail` returns a guest error
//! - anything else evaluates to itself as a string

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use polyglot_engine::{
    ContextPolicy, Env, GuestCode, GuestResult, Language, LanguageDescriptor, LanguageRegistration,
    LanguageRegistry, LanguageState, Source, ThreadKey, Value,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ordered record of `"<phase>:<language>"` events
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, phase: &str, language: &str) {
        self.0.lock().push(format!("{phase}:{language}"));
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Languages that went through `phase`, in order
    pub fn phase(&self, phase: &str) -> Vec<String> {
        let prefix = format!("{phase}:");
        self.0
            .lock()
            .iter()
            .filter_map(|event| event.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn count(&self, phase: &str, language: &str) -> usize {
        let event = format!("{phase}:{language}");
        self.0.lock().iter().filter(|e| **e == event).count()
    }

    pub fn position(&self, phase: &str, language: &str) -> Option<usize> {
        let event = format!("{phase}:{language}");
        self.0.lock().iter().position(|e| *e == event)
    }
}

pub type Hook = Arc<dyn Fn(&Env) -> GuestResult<()> + Send + Sync>;

#[derive(Clone)]
pub struct TestLanguage {
    descriptor: LanguageDescriptor,
    log: EventLog,
    multi_threaded: bool,
    on_create: Option<Hook>,
    on_initialize: Option<Hook>,
    on_finalize: Option<Hook>,
    on_dispose: Option<Hook>,
}

impl TestLanguage {
    pub fn new(id: &str, log: &EventLog) -> Self {
        Self {
            descriptor: LanguageDescriptor::new(id),
            log: log.clone(),
            multi_threaded: false,
            on_create: None,
            on_initialize: None,
            on_finalize: None,
            on_dispose: None,
        }
    }

    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.descriptor = self.descriptor.dependencies(dependencies.iter().copied());
        self
    }

    pub fn internal(mut self) -> Self {
        self.descriptor = self.descriptor.internal(true);
        self
    }

    pub fn policy(mut self, policy: ContextPolicy) -> Self {
        self.descriptor = self.descriptor.context_policy(policy);
        self
    }

    pub fn multi_threaded(mut self) -> Self {
        self.multi_threaded = true;
        self
    }

    pub fn on_create(
        mut self,
        hook: impl Fn(&Env) -> GuestResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_create = Some(Arc::new(hook));
        self
    }

    pub fn on_initialize(
        mut self,
        hook: impl Fn(&Env) -> GuestResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_initialize = Some(Arc::new(hook));
        self
    }

    pub fn on_finalize(
        mut self,
        hook: impl Fn(&Env) -> GuestResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_finalize = Some(Arc::new(hook));
        self
    }

    pub fn on_dispose(
        mut self,
        hook: impl Fn(&Env) -> GuestResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_dispose = Some(Arc::new(hook));
        self
    }

    pub fn register(self) -> LanguageRegistration {
        let descriptor = self.descriptor.clone();
        LanguageRegistration::new(descriptor, move || Arc::new(self.clone()))
    }

    fn id(&self) -> &str {
        self.descriptor.id()
    }

    fn run(hook: &Option<Hook>, env: &Env) -> GuestResult<()> {
        match hook {
            Some(hook) => hook(env),
            None => Ok(()),
        }
    }
}

impl Language for TestLanguage {
    fn create_context(&self, env: &Env) -> GuestResult<LanguageState> {
        self.log.push("create", self.id());
        Self::run(&self.on_create, env)?;
        Ok(Arc::new(()))
    }

    fn initialize_context(&self, env: &Env, _state: &LanguageState) -> GuestResult<()> {
        self.log.push("initialize", self.id());
        Self::run(&self.on_initialize, env)
    }

    fn initialize_thread(
        &self,
        _env: &Env,
        _state: &LanguageState,
        _thread: ThreadKey,
    ) -> GuestResult<()> {
        self.log.push("initialize_thread", self.id());
        Ok(())
    }

    fn initialize_multi_threading(&self, _env: &Env, _state: &LanguageState) -> GuestResult<()> {
        self.log.push("multi_threading", self.id());
        Ok(())
    }

    fn is_thread_access_allowed(&self, _thread: ThreadKey, single_threaded: bool) -> bool {
        single_threaded || self.multi_threaded
    }

    fn finalize_context(&self, env: &Env, _state: &LanguageState) -> GuestResult<()> {
        self.log.push("finalize", self.id());
        Self::run(&self.on_finalize, env)
    }

    fn dispose_thread(
        &self,
        _env: &Env,
        _state: &LanguageState,
        _thread: ThreadKey,
    ) -> GuestResult<()> {
        self.log.push("dispose_thread", self.id());
        Ok(())
    }

    fn dispose_context(&self, env: &Env, _state: &LanguageState) -> GuestResult<()> {
        self.log.push("dispose", self.id());
        Self::run(&self.on_dispose, env)
    }

    fn parse(&self, _env: &Env, source: &Source) -> GuestResult<GuestCode> {
        let code = source.code().to_string();
        Ok(GuestCode::new(move |env, _args| interpret(env, &code)))
    }
}

fn interpret(env: &Env, code: &str) -> GuestResult<Value> {
    if let Some(ms) = code.strip_prefix("sleep:") {
        env.sleep(Duration::from_millis(ms.parse()?))?;
        return Ok(Value::Null);
    }
    if let Some(ms) = code.strip_prefix("block:") {
        std::thread::sleep(Duration::from_millis(ms.parse()?));
        return Ok(Value::Null);
    }
    if let Some(language) = code.strip_prefix("init:") {
        return Ok(Value::Bool(env.initialize(language)?));
    }
    if code == "park" {
        loop {
            env.park_timeout(Duration::from_millis(10))?;
        }
    }
    if let Some(rest) = code.strip_prefix("eval:") {
        let (language, inner) = rest.split_once(':').unwrap_or((rest, ""));
        return Ok(env.eval(language, inner)?);
    }
    if let Some(rest) = code.strip_prefix("export:") {
        let (name, value) = rest.split_once('=').unwrap_or((rest, ""));
        env.export_symbol(name, value)?;
        return Ok(Value::Null);
    }
    if let Some(name) = code.strip_prefix("import:") {
        return Ok(env.import_symbol(name)?.unwrap_or_default());
    }
    if code == "fail" {
        anyhow::bail!("guest failure");
    }
    Ok(Value::from(code))
}

pub fn registry(languages: impl IntoIterator<Item = TestLanguage>) -> LanguageRegistry {
    languages
        .into_iter()
        .fold(LanguageRegistry::builder(), |builder, language| {
            builder.register(language.register())
        })
        .build()
        .expect("test registry is valid")
}

/// Three public languages that allow multi-threaded access
pub fn abc(log: &EventLog) -> LanguageRegistry {
    registry(["a", "b", "c"].map(|id| TestLanguage::new(id, log).multi_threaded()))
}
