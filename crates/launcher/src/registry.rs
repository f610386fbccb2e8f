//! Component registry
//!
//! One entry per component kind, built lazily from a [`ComponentCatalog`] on first use and
//! cleared on shutdown so a later bring-up starts clean.

use crate::component::{ComponentCatalog, ComponentSpec};
use crate::supervisor::ProcessSupervisor;
use localgrid_common::{ComponentKind, ComponentState, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runtime record of one component
pub struct ComponentEntry {
    pub spec: ComponentSpec,
    pub state: ComponentState,
    pub supervisor: Option<ProcessSupervisor>,
}

impl ComponentEntry {
    fn new(spec: ComponentSpec) -> Self {
        Self {
            spec,
            state: ComponentState::NotStarted,
            supervisor: None,
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.spec.kind
    }
}

/// Ordered, deduplicated component entries
pub struct ComponentRegistry {
    catalog: Arc<dyn ComponentCatalog>,
    entries: Option<Vec<ComponentEntry>>,
    builds: u32,
}

impl ComponentRegistry {
    pub fn new(catalog: Arc<dyn ComponentCatalog>) -> Self {
        Self {
            catalog,
            entries: None,
            builds: 0,
        }
    }

    /// Entries in bring-up order, building them on first use
    pub fn entries_mut(&mut self) -> Result<&mut Vec<ComponentEntry>> {
        if self.entries.is_none() {
            let specs = self.catalog.build()?;
            self.builds += 1;

            let mut seen = HashSet::new();
            let mut entries = Vec::with_capacity(specs.len());
            for spec in specs {
                if !seen.insert(spec.kind) {
                    warn!("Ignoring duplicate {} component", spec.kind);
                    continue;
                }
                entries.push(ComponentEntry::new(spec));
            }
            debug!("Registry built with {} components", entries.len());
            self.entries = Some(entries);
        }

        Ok(self.entries.get_or_insert_with(Vec::new))
    }

    pub fn is_built(&self) -> bool {
        self.entries.is_some()
    }

    /// How many times the catalog has been asked for specs
    pub fn build_count(&self) -> u32 {
        self.builds
    }

    pub fn state(&self, kind: ComponentKind) -> Option<ComponentState> {
        self.entries
            .as_ref()?
            .iter()
            .find(|e| e.kind() == kind)
            .map(|e| e.state)
    }

    pub fn states(&self) -> Vec<(ComponentKind, ComponentState)> {
        self.entries
            .iter()
            .flatten()
            .map(|e| (e.kind(), e.state))
            .collect()
    }

    /// Remove every entry, in insertion order
    pub fn take(&mut self) -> Vec<ComponentEntry> {
        self.entries.take().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandLine;
    use crate::config::ProbeConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Counting {
        calls: AtomicU32,
    }

    fn spec(kind: ComponentKind) -> ComponentSpec {
        ComponentSpec {
            kind,
            host: "127.0.0.1".into(),
            port: 4444,
            artifacts: vec![],
            probe: ProbeConfig {
                interval_ms: 10,
                max_attempts: 1,
            },
            continuous_restart: false,
            restart_cycle: Duration::from_secs(60),
            force_restart_path: None,
            extra_ports: vec![],
            session_timeout_ms: None,
            required_os: None,
            command: Arc::new(|| Ok(CommandLine::new("true"))),
        }
    }

    impl ComponentCatalog for Counting {
        fn build(&self) -> Result<Vec<ComponentSpec>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                spec(ComponentKind::Hub),
                spec(ComponentKind::Node),
                spec(ComponentKind::Hub),
            ])
        }
    }

    #[test]
    fn test_builds_once_and_dedups_by_kind() {
        let catalog = Arc::new(Counting {
            calls: AtomicU32::new(0),
        });
        let mut registry = ComponentRegistry::new(catalog.clone());
        assert!(!registry.is_built());

        assert_eq!(registry.entries_mut().unwrap().len(), 2);
        registry.entries_mut().unwrap()[0].state = ComponentState::Running;
        assert_eq!(registry.entries_mut().unwrap().len(), 2);
        assert_eq!(registry.build_count(), 1);
        assert_eq!(registry.state(ComponentKind::Hub), Some(ComponentState::Running));

        let taken = registry.take();
        assert_eq!(taken.len(), 2);
        assert!(registry.states().is_empty());

        registry.entries_mut().unwrap();
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 2);
    }
}
