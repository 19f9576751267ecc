//! Result queries.

use std::str::FromStr;

use serde_json::Value;

use crate::{
    error::Kind,
    plugin::{Extension, Scope},
    registry::PluginRegistry,
    store::{Id, Store},
    Result,
};

/// Renders one extension of one scanner's results in a scan.
///
/// An unknown scanner, or one never selected in the scan's project, is a not found error.
/// An extension the scanner does not declare is a `Kind::ExtensionNotSupported` error.
pub fn extension_context(
    registry: &PluginRegistry,
    store: &Store,
    scan: Id,
    scanner: &str,
    extension: &str,
) -> Result<Value> {
    let scan = store.scan(scan)?;
    let plugin = registry.lookup(scanner).map_err(|_| Kind::NotFound {
        entity: "scanner",
        id: scanner.to_owned(),
    })?;
    let selection = store
        .find_selection(scan.project, plugin.internal_name())
        .ok_or_else(|| Kind::NotFound {
            entity: "scanner",
            id: scanner.to_owned(),
        })?;

    let extension = Extension::from_str(extension).map_err(|_| Kind::ExtensionNotSupported {
        scanner: plugin.internal_name().to_owned(),
        extension: extension.to_owned(),
    })?;
    plugin.context(
        extension,
        &Scope {
            scan: scan.id,
            scanner: selection.id,
        },
        store,
    )
}

/// Renders every declared extension of every scanner selected for a scan.
pub fn scan_summary(registry: &PluginRegistry, store: &Store, scan: Id) -> Result<Value> {
    let scan = store.scan(scan)?;
    let mut summary = serde_json::Map::new();
    for (name, plugin) in registry.selected_for(store, scan.project) {
        let selection = match store.find_selection(scan.project, &name) {
            Some(selection) => selection,
            None => continue,
        };
        let scope = Scope {
            scan: scan.id,
            scanner: selection.id,
        };
        let mut views = serde_json::Map::new();
        for &extension in plugin.extensions() {
            let _ = views.insert(
                extension.to_string(),
                plugin.context(extension, &scope, store)?,
            );
        }
        let _ = summary.insert(name, Value::Object(views));
    }
    Ok(Value::Object(summary))
}

#[cfg(test)]
mod tests {
    use super::{extension_context, scan_summary};
    use crate::{
        aggregate,
        error::{kind_of, status_code, Kind},
        observer::Observer,
        plugin::{Extension, Plugin, TaskContext},
        registry::PluginRegistry,
        store::tests::store_with_scan,
        Result,
    };

    fn noop(_: &TaskContext<'_>, _: &Observer) -> Result<()> {
        Ok(())
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register(
                Plugin::builder("YARA", noop)
                    .extension(Extension::Findings, aggregate::findings)
                    .build(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn it_renders_declared_extensions() {
        let (store, scan) = store_with_scan();
        let _ = store.get_or_create_selection(scan.project, "yara").unwrap();

        let view = extension_context(&registry(), &store, scan.id, "YARA", "findings").unwrap();
        assert_eq!(view["stats"]["count"], 0);
        assert_eq!(view["stats"]["rel_count"], 1);

        let summary = scan_summary(&registry(), &store, scan.id).unwrap();
        assert_eq!(summary["yara"]["findings"]["stats"]["count"], 0);
    }

    #[test]
    fn it_rejects_undeclared_extensions() {
        let (store, scan) = store_with_scan();
        let _ = store.get_or_create_selection(scan.project, "yara").unwrap();

        for extension in &["hosts", "unknown"] {
            let error =
                extension_context(&registry(), &store, scan.id, "yara", extension).unwrap_err();
            match kind_of(&error) {
                Some(Kind::ExtensionNotSupported { .. }) => {}
                k => panic!("unexpected kind: {:?}", k),
            }
            assert_eq!(status_code(&error), 501);
        }
    }

    #[test]
    fn it_rejects_unknown_scanners() {
        let (store, scan) = store_with_scan();

        let error =
            extension_context(&registry(), &store, scan.id, "semgrep", "findings").unwrap_err();
        assert_eq!(status_code(&error), 404);

        let error =
            extension_context(&registry(), &store, scan.id, "yara", "findings").unwrap_err();
        assert_eq!(status_code(&error), 404);
    }
}
