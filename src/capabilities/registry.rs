use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use anyhow::{anyhow, Result};

use tracing::{debug, info, warn};

use super::clock::ClockProvider;
use super::database::DatabaseProvider;
use super::files::FilesProvider;
use super::formula::FormulaProvider;
use super::mail::MailProvider;
use super::parser::ArgsProvider;
use super::pdf::PdfProvider;
use super::shell::ShellProvider;
use super::spreadsheet::SpreadsheetProvider;
use super::{CapabilityHandle, CapabilityName, CapabilityProvider, CapabilitySet, Strictness};
use crate::config::Config;

/// Outcome of one `load_all` pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSummary {
    pub loaded: Vec<CapabilityName>,
    /// Preferred implementation failed (fallbacks included)
    pub failed: Vec<CapabilityName>,
    pub fallbacks: Vec<CapabilityName>,
    /// Critical capabilities left without any handle
    pub missing_critical: Vec<CapabilityName>,
    pub warnings: Vec<String>,
    pub total: usize,
    pub is_valid: bool,
}

/// Name → handle map produced by the loader. Every requested name is
/// present: `Some` for a live or fallback handle, `None` when absent.
#[derive(Default)]
pub struct CapabilityRegistry {
    handles: BTreeMap<CapabilityName, Option<CapabilityHandle>>,
    errors: BTreeMap<CapabilityName, String>,
}

impl CapabilityRegistry {
    pub fn get(&self, name: CapabilityName) -> Option<&CapabilityHandle> {
        self.handles.get(&name).and_then(Option::as_ref)
    }

    pub fn is_loaded(&self, name: CapabilityName) -> bool {
        self.get(name).is_some()
    }

    /// Why the preferred implementation of `name` failed, if it did.
    pub fn error(&self, name: CapabilityName) -> Option<&str> {
        self.errors.get(&name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = CapabilityName> + '_ {
        self.handles.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Typed view handed to the context builder.
    pub fn capability_set(&self) -> CapabilitySet {
        let mut set = CapabilitySet::default();
        for handle in self.handles.values().flatten() {
            set.insert(handle.clone());
        }
        set
    }
}

/// Holds the providers and turns them into a registry.
pub struct CapabilityLoader {
    providers: Vec<Box<dyn CapabilityProvider>>,
}

impl CapabilityLoader {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Every built-in capability, configured from `config`.
    pub fn standard(config: &Config) -> Self {
        let mut loader = Self::new();
        loader.register(Box::new(DatabaseProvider::new(config.database.clone())));
        loader.register(Box::new(ClockProvider::new(config.clock.clone())));
        loader.register(Box::new(ArgsProvider));
        loader.register(Box::new(FilesProvider::new(config.files.clone())));
        loader.register(Box::new(SpreadsheetProvider::new(
            config.spreadsheet.clone(),
        )));
        loader.register(Box::new(FormulaProvider));
        loader.register(Box::new(PdfProvider::new(config.pdf.clone())));
        loader.register(Box::new(MailProvider::new(config.mail.clone())));
        loader.register(Box::new(ShellProvider::new(
            config.shell.clone(),
            config.browser.clone(),
        )));
        loader
    }

    /// Registers a provider, replacing any previous one with the same name.
    pub fn register(&mut self, provider: Box<dyn CapabilityProvider>) {
        self.providers.retain(|p| p.name() != provider.name());
        self.providers.push(provider);
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Acquires every registered capability. Never fails: errors end up in
    /// the summary and the registry. A provider that panics or hands back
    /// the wrong kind of handle counts as failed.
    pub fn load_all(&self, strictness: Strictness) -> (CapabilityRegistry, LoadSummary) {
        debug!("Loading {} capabilities", self.len());
        let mut registry = CapabilityRegistry::default();
        let mut loaded = Vec::new();
        let mut failed = Vec::new();
        let mut fallbacks = Vec::new();
        let mut warnings = Vec::new();

        for provider in &self.providers {
            let name = provider.name();
            match acquire(provider.as_ref()) {
                Ok(handle) => {
                    debug!("Loaded capability {name}");
                    loaded.push(name);
                    registry.handles.insert(name, Some(handle));
                }
                Err(e) => {
                    failed.push(name);
                    registry.errors.insert(name, e.to_string());
                    match provider.fallback() {
                        Some(handle) => {
                            let msg = format!("{name}: {e}; using fallback");
                            warn!("{msg}");
                            warnings.push(msg);
                            fallbacks.push(name);
                            registry.handles.insert(name, Some(handle));
                        }
                        None => {
                            let msg = format!("{name}: {e}");
                            warn!("Capability unavailable: {msg}");
                            warnings.push(msg);
                            registry.handles.insert(name, None);
                        }
                    }
                }
            }
        }

        let missing_critical: Vec<CapabilityName> = strictness
            .critical()
            .iter()
            .copied()
            .filter(|name| !registry.is_loaded(*name))
            .collect();

        let summary = LoadSummary {
            total: registry.len(),
            is_valid: missing_critical.is_empty(),
            loaded,
            failed,
            fallbacks,
            missing_critical,
            warnings,
        };
        info!(
            "Capabilities: {}/{} loaded, {} fallback(s), valid: {}",
            summary.loaded.len(),
            summary.total,
            summary.fallbacks.len(),
            summary.is_valid
        );
        (registry, summary)
    }
}

fn acquire(provider: &dyn CapabilityProvider) -> Result<CapabilityHandle> {
    let name = provider.name();
    let handle = panic::catch_unwind(AssertUnwindSafe(|| provider.acquire()))
        .map_err(|payload| {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            anyhow!("provider panicked: {reason}")
        })??;
    if handle.name() != name {
        return Err(anyhow!("provider returned a {} handle", handle.name()));
    }
    Ok(handle)
}

impl Default for CapabilityLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::clock::ClockStub;
    use crate::capabilities::files::BaselineFs;
    use crate::capabilities::formula::FormulaEngine;
    use anyhow::anyhow;
    use std::sync::Arc;

    struct Failing(CapabilityName, bool);

    impl CapabilityProvider for Failing {
        fn name(&self) -> CapabilityName {
            self.0
        }

        fn acquire(&self) -> anyhow::Result<CapabilityHandle> {
            Err(anyhow!("unavailable in test"))
        }

        fn fallback(&self) -> Option<CapabilityHandle> {
            if !self.1 {
                return None;
            }
            match self.0 {
                CapabilityName::Clock => Some(CapabilityHandle::Clock(Arc::new(ClockStub))),
                CapabilityName::Files => Some(CapabilityHandle::Files(Arc::new(BaselineFs))),
                _ => None,
            }
        }
    }

    struct Working(CapabilityName);

    impl CapabilityProvider for Working {
        fn name(&self) -> CapabilityName {
            self.0
        }

        fn acquire(&self) -> anyhow::Result<CapabilityHandle> {
            Ok(match self.0 {
                CapabilityName::Clock => CapabilityHandle::Clock(Arc::new(ClockStub)),
                CapabilityName::Files => CapabilityHandle::Files(Arc::new(BaselineFs)),
                _ => CapabilityHandle::Formula(Arc::new(FormulaEngine::new())),
            })
        }
    }

    #[test]
    fn test_fallback_counts_as_failed_but_present() {
        let mut loader = CapabilityLoader::new();
        loader.register(Box::new(Failing(CapabilityName::Clock, true)));
        loader.register(Box::new(Working(CapabilityName::Files)));

        let (registry, summary) = loader.load_all(Strictness::LocalServer);
        assert!(summary.is_valid);
        assert_eq!(summary.failed, vec![CapabilityName::Clock]);
        assert_eq!(summary.fallbacks, vec![CapabilityName::Clock]);
        assert_eq!(summary.loaded, vec![CapabilityName::Files]);
        assert!(registry.is_loaded(CapabilityName::Clock));
        assert_eq!(registry.error(CapabilityName::Clock), Some("unavailable in test"));
        assert_eq!(summary.warnings.len(), 1);
    }

    #[test]
    fn test_missing_critical_invalidates() {
        let mut loader = CapabilityLoader::new();
        loader.register(Box::new(Failing(CapabilityName::Database, false)));
        loader.register(Box::new(Working(CapabilityName::Clock)));
        loader.register(Box::new(Working(CapabilityName::Files)));

        let (registry, summary) = loader.load_all(Strictness::Full);
        assert!(!summary.is_valid);
        assert_eq!(summary.missing_critical, vec![CapabilityName::Database]);
        // Absent handles are still listed
        assert_eq!(registry.len(), 3);
        assert!(registry.get(CapabilityName::Database).is_none());

        // The same registry is fine without a database requirement
        let (_, relaxed) = loader.load_all(Strictness::LocalServer);
        assert!(relaxed.is_valid);
    }

    #[test]
    fn test_non_critical_failure_keeps_valid() {
        let mut loader = CapabilityLoader::new();
        loader.register(Box::new(Working(CapabilityName::Clock)));
        loader.register(Box::new(Working(CapabilityName::Files)));
        loader.register(Box::new(Failing(CapabilityName::Pdf, false)));

        let (registry, summary) = loader.load_all(Strictness::LocalServer);
        assert!(summary.is_valid);
        assert_eq!(summary.total, 3);
        assert!(!registry.capability_set().contains(CapabilityName::Pdf));
        assert!(registry.capability_set().contains(CapabilityName::Clock));
    }

    struct Panicking;

    impl CapabilityProvider for Panicking {
        fn name(&self) -> CapabilityName {
            CapabilityName::Pdf
        }

        fn acquire(&self) -> anyhow::Result<CapabilityHandle> {
            panic!("pdf backend exploded")
        }
    }

    #[test]
    fn test_panicking_provider_is_contained() {
        let mut loader = CapabilityLoader::new();
        loader.register(Box::new(Panicking));
        loader.register(Box::new(Working(CapabilityName::Clock)));

        let (registry, summary) = loader.load_all(Strictness::LocalServer);
        assert_eq!(summary.failed, vec![CapabilityName::Pdf]);
        assert_eq!(summary.loaded, vec![CapabilityName::Clock]);
        let error = registry.error(CapabilityName::Pdf).unwrap();
        assert!(error.contains("pdf backend exploded"), "{error}");
    }

    #[test]
    fn test_mismatched_handle_is_rejected() {
        let mut loader = CapabilityLoader::new();
        // Working hands out a formula engine for anything it does not know
        loader.register(Box::new(Working(CapabilityName::Mail)));
        let (registry, summary) = loader.load_all(Strictness::LocalServer);
        assert_eq!(summary.failed, vec![CapabilityName::Mail]);
        assert!(!registry.is_loaded(CapabilityName::Mail));
        assert!(registry.error(CapabilityName::Mail).unwrap().contains("xlsx_calc"));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut loader = CapabilityLoader::new();
        loader.register(Box::new(Failing(CapabilityName::Clock, false)));
        loader.register(Box::new(Working(CapabilityName::Clock)));
        assert_eq!(loader.len(), 1);
        let (registry, _) = loader.load_all(Strictness::LocalServer);
        assert!(registry.is_loaded(CapabilityName::Clock));
    }

    #[test]
    fn test_standard_loader_registers_everything() {
        let loader = CapabilityLoader::standard(&Config::default());
        assert_eq!(loader.len(), CapabilityName::ALL.len());
        let (registry, summary) = loader.load_all(Strictness::LocalServer);
        assert_eq!(summary.total, CapabilityName::ALL.len());
        // Pure capabilities never depend on the host
        assert!(registry.is_loaded(CapabilityName::Args));
        assert!(registry.is_loaded(CapabilityName::Formula));
        assert!(registry.is_loaded(CapabilityName::Clock));
    }
}
