//! Module resolution restricted to registered sources

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::{Ctx, Error, Module, Result};

pub(crate) type ModuleSources = Arc<BTreeMap<String, String>>;

/// First import name that failed to resolve during one evaluation.
#[derive(Clone, Default)]
pub(crate) struct MissingModule(Arc<Mutex<Option<String>>>);

impl MissingModule {
    fn record(&self, name: &str) {
        self.0.lock().get_or_insert_with(|| name.to_string());
    }

    pub(crate) fn take(&self) -> Option<String> {
        self.0.lock().take()
    }
}

fn normalize(name: &str) -> &str {
    name.strip_prefix("./").unwrap_or(name)
}

pub(crate) struct RegisteredResolver {
    pub(crate) sources: ModuleSources,
    pub(crate) missing: MissingModule,
}

impl Resolver for RegisteredResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> Result<String> {
        let key = normalize(name);
        if self.sources.contains_key(key) {
            return Ok(key.to_string());
        }
        tracing::debug!(target: "kestrel::sandbox", module = name, "Import of unregistered module");
        self.missing.record(name);
        Err(Error::new_resolving(base, name))
    }
}

pub(crate) struct RegisteredLoader {
    pub(crate) sources: ModuleSources,
}

impl Loader for RegisteredLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> Result<Module<'js>> {
        match self.sources.get(name) {
            Some(source) => Module::declare(ctx.clone(), name, source.as_str()),
            None => Err(Error::new_loading(name)),
        }
    }
}
