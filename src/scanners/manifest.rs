//! Android manifest analysis.
//!
//! Reads the decoded `AndroidManifest.xml` of the scan target and records the application
//! details, the requested permissions, the declared components and the insecure settings
//! found in it.

use std::{fs, path::Path};

use failure::ResultExt;
use xml::{
    attribute::OwnedAttribute,
    reader::{EventReader, ParserConfig, XmlEvent},
};

use crate::{
    error::Kind,
    observer::{Observer, Progress},
    plugin::TaskContext,
    severity::Severity,
    store::{
        AppPermission, Component, ComponentCategory, Details, Finding, FindingTemplate, Id,
        PermissionFinding, Snippet,
    },
    utils::get_line,
    Result,
};

/// Permissions granted only after explicit user consent.
const DANGEROUS_PERMISSIONS: &[&str] = &[
    "android.permission.ACCESS_BACKGROUND_LOCATION",
    "android.permission.ACCESS_COARSE_LOCATION",
    "android.permission.ACCESS_FINE_LOCATION",
    "android.permission.ACTIVITY_RECOGNITION",
    "android.permission.ANSWER_PHONE_CALLS",
    "android.permission.BODY_SENSORS",
    "android.permission.CALL_PHONE",
    "android.permission.CAMERA",
    "android.permission.GET_ACCOUNTS",
    "android.permission.PROCESS_OUTGOING_CALLS",
    "android.permission.READ_CALENDAR",
    "android.permission.READ_CALL_LOG",
    "android.permission.READ_CONTACTS",
    "android.permission.READ_EXTERNAL_STORAGE",
    "android.permission.READ_PHONE_NUMBERS",
    "android.permission.READ_PHONE_STATE",
    "android.permission.READ_SMS",
    "android.permission.RECEIVE_MMS",
    "android.permission.RECEIVE_SMS",
    "android.permission.RECEIVE_WAP_PUSH",
    "android.permission.RECORD_AUDIO",
    "android.permission.SEND_SMS",
    "android.permission.USE_SIP",
    "android.permission.WRITE_CALENDAR",
    "android.permission.WRITE_CALL_LOG",
    "android.permission.WRITE_CONTACTS",
    "android.permission.WRITE_EXTERNAL_STORAGE",
];

fn parser_config() -> ParserConfig {
    ParserConfig::new()
        .trim_whitespace(true)
        .ignore_comments(true)
        .coalesce_characters(true)
}

/// Permission requested through `<uses-permission>`.
#[derive(Debug, Clone, PartialEq)]
pub struct UsesPermission {
    pub name: String,
    pub protection_level: Option<String>,
}

/// Component declared in the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestComponent {
    pub category: ComponentCategory,
    pub name: String,
    pub exported: Option<bool>,
    pub permission: Option<String>,
    pub actions: Vec<String>,
    pub categories: Vec<String>,
}

impl ManifestComponent {
    /// Whether the component can be reached by other applications.
    ///
    /// Without an explicit `exported` attribute, components with intent filters are
    /// exported, and so are providers of applications supporting API levels below 17.
    pub fn is_exported(&self, min_sdk: u32) -> bool {
        match self.exported {
            Some(exported) => exported,
            None => match self.category {
                ComponentCategory::Provider => min_sdk < 17,
                _ => !self.actions.is_empty(),
            },
        }
    }

    pub fn is_main(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a == "android.intent.action.MAIN")
    }

    pub fn is_launcher(&self) -> bool {
        self.categories
            .iter()
            .any(|c| c == "android.intent.category.LAUNCHER")
    }
}

/// Parsed manifest.
#[derive(Debug, Default)]
pub struct Manifest {
    code: String,
    package: String,
    label: String,
    version_name: String,
    version_code: Option<u32>,
    min_sdk: Option<u32>,
    target_sdk: Option<u32>,
    debuggable: bool,
    allows_backup: bool,
    large_heap: bool,
    permissions: Vec<UsesPermission>,
    components: Vec<ManifestComponent>,
}

impl Manifest {
    /// Loads the manifest of the given folder.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join("AndroidManifest.xml");
        let code = fs::read_to_string(&path)
            .with_context(|_| format!("could not read `{}`", path.display()))?;
        Self::parse(code)
    }

    /// Parses the text of a manifest.
    pub fn parse<S: Into<String>>(code: S) -> Result<Self> {
        let mut manifest = Manifest {
            code: code.into(),
            ..Self::default()
        };
        let code = manifest.code.clone();
        let parser = EventReader::new_with_config(code.as_bytes(), parser_config());
        let mut current: Option<(String, usize)> = None;

        for e in parser {
            match e {
                Ok(XmlEvent::StartElement {
                    name, attributes, ..
                }) => match name.local_name.as_str() {
                    "manifest" => manifest.parse_manifest_attributes(attributes),
                    "uses-sdk" => manifest.parse_sdk_attributes(attributes),
                    "application" => manifest.parse_application_attributes(attributes),
                    "uses-permission" | "uses-permission-sdk-23" => {
                        if let Some(name) = attribute(&attributes, "name") {
                            manifest.permissions.push(UsesPermission {
                                name,
                                protection_level: attribute(&attributes, "protectionLevel"),
                            });
                        }
                    }
                    tag @ "activity"
                    | tag @ "activity-alias"
                    | tag @ "service"
                    | tag @ "receiver"
                    | tag @ "provider" => {
                        let category = match tag {
                            "service" => ComponentCategory::Service,
                            "receiver" => ComponentCategory::Receiver,
                            "provider" => ComponentCategory::Provider,
                            _ => ComponentCategory::Activity,
                        };
                        manifest.components.push(ManifestComponent {
                            category,
                            name: attribute(&attributes, "name").unwrap_or_default(),
                            exported: attribute(&attributes, "exported")
                                .and_then(|v| v.parse().ok()),
                            permission: attribute(&attributes, "permission"),
                            actions: Vec::new(),
                            categories: Vec::new(),
                        });
                        current = Some((tag.to_owned(), manifest.components.len() - 1));
                    }
                    "action" | "category" => {
                        if let (Some((_, index)), Some(value)) =
                            (current.as_ref(), attribute(&attributes, "name"))
                        {
                            let component = &mut manifest.components[*index];
                            if name.local_name == "action" {
                                component.actions.push(value);
                            } else {
                                component.categories.push(value);
                            }
                        }
                    }
                    _ => {}
                },
                Ok(XmlEvent::EndElement { name }) => {
                    let closes = current
                        .as_ref()
                        .map_or(false, |(tag, _)| *tag == name.local_name);
                    if closes {
                        current = None;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(Kind::Parse {
                        message: format!("invalid `AndroidManifest.xml`: {}", e),
                    }
                    .into())
                }
            }
        }

        Ok(manifest)
    }

    fn parse_manifest_attributes(&mut self, attributes: Vec<OwnedAttribute>) {
        for attr in attributes {
            match attr.name.local_name.as_str() {
                "package" => self.package = attr.value,
                "versionCode" => match attr.value.parse() {
                    Ok(n) => self.version_code = Some(n),
                    Err(e) => warn!("invalid `versionCode` in the manifest: {}", e),
                },
                "versionName" => self.version_name = attr.value,
                _ => {}
            }
        }
    }

    fn parse_sdk_attributes(&mut self, attributes: Vec<OwnedAttribute>) {
        for attr in attributes {
            let slot = match attr.name.local_name.as_str() {
                "minSdkVersion" => &mut self.min_sdk,
                "targetSdkVersion" => &mut self.target_sdk,
                _ => continue,
            };
            match attr.value.parse() {
                Ok(v) => *slot = Some(v),
                Err(e) => warn!(
                    "invalid `{}` in the manifest: {}",
                    attr.name.local_name, e
                ),
            }
        }
    }

    fn parse_application_attributes(&mut self, attributes: Vec<OwnedAttribute>) {
        for attr in attributes {
            let flag = match attr.name.local_name.as_str() {
                "label" => {
                    self.label = attr.value;
                    continue;
                }
                "debuggable" => &mut self.debuggable,
                "allowBackup" => &mut self.allows_backup,
                "largeHeap" => &mut self.large_heap,
                _ => continue,
            };
            match attr.value.parse() {
                Ok(b) => *flag = b,
                Err(e) => warn!(
                    "invalid `{}` in the manifest: {}",
                    attr.name.local_name, e
                ),
            }
        }
    }

    /// Gets the code of the manifest.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Version name, or the version code if the name is missing.
    pub fn version(&self) -> String {
        if self.version_name.is_empty() {
            self.version_code.map(|c| c.to_string()).unwrap_or_default()
        } else {
            self.version_name.clone()
        }
    }

    pub fn min_sdk(&self) -> Option<u32> {
        self.min_sdk
    }

    pub fn target_sdk(&self) -> Option<u32> {
        self.target_sdk
    }

    pub fn is_debuggable(&self) -> bool {
        self.debuggable
    }

    pub fn allows_backup(&self) -> bool {
        self.allows_backup
    }

    pub fn has_large_heap(&self) -> bool {
        self.large_heap
    }

    pub fn permissions(&self) -> &[UsesPermission] {
        &self.permissions
    }

    pub fn components(&self) -> &[ManifestComponent] {
        &self.components
    }
}

fn attribute(attributes: &[OwnedAttribute], name: &str) -> Option<String> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.clone())
}

/// Catalog entry of a requested permission.
pub fn catalog_entry(permission: &UsesPermission) -> AppPermission {
    let mut entry = AppPermission::unknown(permission.name.as_str());
    entry.dangerous = DANGEROUS_PERMISSIONS.contains(&permission.name.as_str());
    entry.protection_level = match permission.protection_level {
        Some(ref level) => capitalize(level),
        None if entry.dangerous => String::from("Dangerous"),
        None => String::from("Normal"),
    };
    entry
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Records the results of a manifest analysis.
struct Recorder<'a, 'c> {
    ctx: &'a TaskContext<'c>,
    manifest: &'a Manifest,
    path: &'a Path,
}

impl<'a, 'c> Recorder<'a, 'c> {
    fn snippet(&self, needle: &str) -> Option<Id> {
        get_line(self.manifest.code(), needle).map(|line| {
            self.ctx
                .store
                .create_snippet(Snippet::for_file(
                    self.path.to_path_buf(),
                    (line + 1).to_string(),
                ))
                .id
        })
    }

    fn finding(&self, template: FindingTemplate, needle: &str) -> Result<()> {
        let severity = template.default_severity;
        let template = self.ctx.store.get_or_create_template(template)?;
        let mut finding = Finding::new(
            self.ctx.scan.id,
            self.ctx.scanner.id,
            Some(template.id),
            severity,
        );
        finding.snippet = self.snippet(needle);
        let _ = self.ctx.store.add_finding(finding)?;
        Ok(())
    }

    fn details(&self) -> Result<()> {
        let _ = self.ctx.store.set_details(Details {
            scan: self.ctx.scan.id,
            file: self.ctx.file.id,
            app_package: self.manifest.package().to_owned(),
            app_name: self.manifest.label().to_owned(),
            app_version: self.manifest.version(),
            min_sdk: self.manifest.min_sdk(),
            target_sdk: self.manifest.target_sdk(),
        })?;
        Ok(())
    }

    fn permissions(&self) -> Result<usize> {
        for requested in self.manifest.permissions() {
            let permission = self
                .ctx
                .store
                .get_or_create_permission(catalog_entry(requested))?;
            let _ = self.ctx.store.add_permission_finding(PermissionFinding {
                id: 0,
                scan: self.ctx.scan.id,
                scanner: self.ctx.scanner.id,
                permission: permission.id,
                snippet: self.snippet(&requested.name),
                severity: if permission.dangerous {
                    Severity::Medium
                } else {
                    Severity::None
                },
            })?;
        }
        Ok(self.manifest.permissions().len())
    }

    fn components(&self) -> Result<usize> {
        let min_sdk = self.manifest.min_sdk().unwrap_or(1);
        for declared in self.manifest.components() {
            let is_exported = declared.is_exported(min_sdk);
            let is_protected = declared.permission.is_some();
            let _ = self.ctx.store.add_component(Component {
                id: 0,
                scan: self.ctx.scan.id,
                scanner: self.ctx.scanner.id,
                name: declared.name.clone(),
                category: declared.category,
                is_exported,
                is_protected,
                is_launcher: declared.is_launcher(),
                is_main: declared.is_main(),
                intent_filters: declared.actions.clone(),
            })?;

            if is_exported && !is_protected && !declared.is_launcher() {
                self.finding(
                    FindingTemplate::new(
                        format!("Exported {}", declared.category),
                        Severity::Low,
                    )
                    .with_description(
                        "The component can be started by any application installed on the \
                         device, without requiring a permission.",
                    )
                    .with_mitigation(
                        "Set `android:exported=\"false\"` or protect the component with a \
                         permission.",
                    ),
                    &declared.name,
                )?;
            }
        }
        Ok(self.manifest.components().len())
    }

    fn settings(&self) -> Result<()> {
        if self.manifest.is_debuggable() {
            self.finding(
                FindingTemplate::new("Debuggable application", Severity::Critical)
                    .with_description(
                        "The application is debuggable, so anyone with access to the device \
                         can attach a debugger to it.",
                    )
                    .with_mitigation("Remove `android:debuggable` from release builds."),
                "android:debuggable",
            )?;
        }
        if self.manifest.allows_backup() {
            self.finding(
                FindingTemplate::new("Application data backup allowed", Severity::Medium)
                    .with_description(
                        "Application data can be extracted with `adb backup` without root \
                         access.",
                    )
                    .with_mitigation("Set `android:allowBackup=\"false\"`."),
                "android:allowBackup",
            )?;
        }
        if self.manifest.has_large_heap() {
            self.finding(
                FindingTemplate::new("Large heap requested", Severity::Info).with_description(
                    "The application requests a large heap, which may hide memory leaks.",
                ),
                "android:largeHeap",
            )?;
        }
        Ok(())
    }
}

/// Runs the manifest analysis.
pub fn run(ctx: &TaskContext<'_>, observer: &Observer) -> Result<()> {
    let contents = ctx.tree.contents();
    let path = contents.join("AndroidManifest.xml");
    if !path.is_file() {
        let _ = observer.fail("the scan target has no `AndroidManifest.xml`");
        return Ok(());
    }

    let _ = observer.update_with("parsing the manifest", Progress::at(10, 100));
    let manifest = Manifest::load(&contents)?;
    let recorder = Recorder {
        ctx,
        manifest: &manifest,
        path: &path,
    };

    recorder.details()?;
    let _ = observer.update_with("recording permissions", Progress::at(30, 100));
    let permissions = recorder.permissions()?;
    let _ = observer.update_with("recording components", Progress::at(60, 100));
    let components = recorder.components()?;
    let _ = observer.update_with("checking application settings", Progress::at(90, 100));
    recorder.settings()?;

    info!(
        "manifest of `{}`: {} permissions, {} components",
        manifest.package(),
        permissions,
        components
    );
    let _ = observer.success(format!(
        "{} permissions and {} components found",
        permissions, components
    ));
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{catalog_entry, Manifest, UsesPermission};
    use crate::store::ComponentCategory;

    pub const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android"
    package="com.demo.app" android:versionCode="7" android:versionName="1.2.0">
    <uses-sdk android:minSdkVersion="16" android:targetSdkVersion="30"/>
    <uses-permission android:name="android.permission.INTERNET"/>
    <uses-permission android:name="android.permission.CAMERA"/>
    <application android:label="Demo" android:debuggable="true" android:allowBackup="true">
        <activity android:name=".MainActivity">
            <intent-filter>
                <action android:name="android.intent.action.MAIN"/>
                <category android:name="android.intent.category.LAUNCHER"/>
            </intent-filter>
        </activity>
        <service android:name=".SyncService" android:exported="true"/>
        <receiver android:name=".BootReceiver" android:permission="com.demo.BOOT"/>
        <provider android:name=".DataProvider" android:authorities="com.demo.data"/>
    </application>
</manifest>
"#;

    #[test]
    fn it_parses_manifest() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.package(), "com.demo.app");
        assert_eq!(manifest.label(), "Demo");
        assert_eq!(manifest.version(), "1.2.0");
        assert_eq!(manifest.min_sdk(), Some(16));
        assert_eq!(manifest.target_sdk(), Some(30));
        assert!(manifest.is_debuggable());
        assert!(manifest.allows_backup());
        assert!(!manifest.has_large_heap());
        assert_eq!(manifest.permissions().len(), 2);
    }

    #[test]
    fn it_parses_components() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let components = manifest.components();
        assert_eq!(components.len(), 4);

        let main = &components[0];
        assert_eq!(main.category, ComponentCategory::Activity);
        assert!(main.is_main());
        assert!(main.is_launcher());
        assert!(main.is_exported(16));

        assert!(components[1].is_exported(16));
        assert!(!components[2].is_exported(16));
        assert!(components[2].permission.is_some());

        let provider = &components[3];
        assert_eq!(provider.category, ComponentCategory::Provider);
        assert!(provider.is_exported(16));
        assert!(!provider.is_exported(17));
    }

    #[test]
    fn it_rejects_malformed_manifests() {
        assert!(Manifest::parse("<manifest><application></manifest>").is_err());
    }

    #[test]
    fn it_builds_catalog_entries() {
        let camera = catalog_entry(&UsesPermission {
            name: String::from("android.permission.CAMERA"),
            protection_level: None,
        });
        assert!(camera.dangerous);
        assert_eq!(camera.protection_level, "Dangerous");
        assert_eq!(camera.name, "CAMERA");

        let custom = catalog_entry(&UsesPermission {
            name: String::from("com.demo.BOOT"),
            protection_level: Some(String::from("signature")),
        });
        assert!(!custom.dangerous);
        assert_eq!(custom.protection_level, "Signature");
    }
}
