//! Registry of the available scanner plugins.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    error::Kind,
    plugin::{internal_name, Plugin},
    store::{Id, Store},
    Result,
};

/// Scanner plugins indexed by internal name.
///
/// The registry is filled once at start up and shared read only afterwards.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<Plugin>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin. Names are compared by their internal form.
    pub fn register(&mut self, plugin: Plugin) -> Result<()> {
        let key = plugin.internal_name().to_owned();
        if self.plugins.contains_key(&key) {
            return Err(Kind::DuplicateName { name: key }.into());
        }
        debug!("registered scanner `{}`", key);
        let _ = self.plugins.insert(key, Arc::new(plugin));
        Ok(())
    }

    /// Gets the plugin with the given name.
    pub fn lookup(&self, name: &str) -> Result<Arc<Plugin>> {
        self.plugins
            .get(&internal_name(name))
            .cloned()
            .ok_or_else(|| {
                Kind::PluginNotFound {
                    name: name.to_owned(),
                }
                .into()
            })
    }

    /// Whether a plugin with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(&internal_name(name))
    }

    /// Every registered plugin, ordered by internal name.
    pub fn all(&self) -> &BTreeMap<String, Arc<Plugin>> {
        &self.plugins
    }

    /// Plugins selected for the given project.
    pub fn selected_for(&self, store: &Store, project: Id) -> BTreeMap<String, Arc<Plugin>> {
        store
            .selections_for(project)
            .into_iter()
            .filter_map(|selection| {
                let key = internal_name(&selection.name);
                self.plugins.get(&key).map(|p| (key, Arc::clone(p)))
            })
            .collect()
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugin is registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::PluginRegistry;
    use crate::{
        error::{kind_of, Kind},
        observer::Observer,
        plugin::{Plugin, TaskContext},
        store::Store,
        Result,
    };

    fn noop(_: &TaskContext<'_>, _: &Observer) -> Result<()> {
        Ok(())
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register(Plugin::builder("Android Manifest", noop).build())
            .unwrap();
        registry.register(Plugin::builder("YARA", noop).build()).unwrap();
        registry
    }

    #[test]
    fn it_rejects_duplicated_names() {
        let mut registry = registry();

        let error = registry
            .register(Plugin::builder("android manifest", noop).build())
            .unwrap_err();
        match kind_of(&error) {
            Some(Kind::DuplicateName { name }) => assert_eq!(name, "android-manifest"),
            k => panic!("unexpected kind: {:?}", k),
        }
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn it_looks_up_plugins() {
        let registry = registry();

        assert_eq!(
            registry.lookup("Android Manifest").unwrap().internal_name(),
            "android-manifest"
        );
        assert!(registry.contains("yara"));
        let error = registry.lookup("semgrep").unwrap_err();
        match kind_of(&error) {
            Some(Kind::PluginNotFound { .. }) => {}
            k => panic!("unexpected kind: {:?}", k),
        }

        let names: Vec<_> = registry.all().keys().cloned().collect();
        assert_eq!(names, vec!["android-manifest", "yara"]);
    }

    #[test]
    fn it_filters_selected_plugins() {
        let registry = registry();
        let store = Store::new();
        let project = store.create_project("demo");
        let _ = store.get_or_create_selection(project.id, "yara").unwrap();
        let _ = store.get_or_create_selection(project.id, "removed").unwrap();

        let selected = registry.selected_for(&store, project.id);
        assert_eq!(selected.len(), 1);
        assert!(selected.contains_key("yara"));
    }
}
