// Plugin dependency declarations and SemVer range matching
//
// Manifest wire form: "<scheme>:<name><op><version>" where scheme is one of
// pkg-m | pkg-s | pkg-p (package registries), plugin (plugin-to-plugin link)
// or file (path relative to the plugin directory, no version part).

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// Package registry family, one per plugin language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageRegistry {
    PkgM,
    PkgS,
    PkgP,
}

impl PackageRegistry {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageRegistry::PkgM => "pkg-m",
            PackageRegistry::PkgS => "pkg-s",
            PackageRegistry::PkgP => "pkg-p",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pkg-m" => Some(PackageRegistry::PkgM),
            "pkg-s" => Some(PackageRegistry::PkgS),
            "pkg-p" => Some(PackageRegistry::PkgP),
            _ => None,
        }
    }
}

impl std::fmt::Display for PackageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Version constraint attached to a dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "version", rename_all = "snake_case")]
pub enum VersionSpec {
    /// Exact version (`@x.y.z`)
    Exact(Version),
    /// Compatible within the leftmost non-zero component (`^x.y.z`)
    Caret(Version),
    /// Patch-level changes only (`~x.y.z`)
    Tilde(Version),
    /// Minimum version (`>=x.y.z`)
    AtLeast(Version),
    /// No constraint (file references)
    Any,
}

impl VersionSpec {
    pub fn matches(&self, candidate: &Version) -> bool {
        match self {
            VersionSpec::Exact(v) => candidate == v,
            VersionSpec::Caret(v) => {
                if candidate < v {
                    return false;
                }
                if v.major > 0 {
                    candidate.major == v.major
                } else if v.minor > 0 {
                    candidate.major == 0 && candidate.minor == v.minor
                } else {
                    candidate == v
                }
            }
            VersionSpec::Tilde(v) => {
                candidate >= v && candidate.major == v.major && candidate.minor == v.minor
            }
            VersionSpec::AtLeast(v) => candidate >= v,
            VersionSpec::Any => true,
        }
    }

    /// Parse the `<op><version>` tail of a manifest dependency string
    pub fn parse(tail: &str) -> Result<Self> {
        let (op, raw) = if let Some(rest) = tail.strip_prefix(">=") {
            (">=", rest)
        } else if let Some(rest) = tail.strip_prefix('^') {
            ("^", rest)
        } else if let Some(rest) = tail.strip_prefix('~') {
            ("~", rest)
        } else if let Some(rest) = tail.strip_prefix('@') {
            ("@", rest)
        } else {
            return Err(DomainError::validation(
                "Dependency.Version",
                format!("missing version operator in {tail:?}"),
            ));
        };

        let version = Version::parse(raw).map_err(|e| {
            DomainError::validation("Dependency.Version", format!("invalid version {raw:?}: {e}"))
        })?;

        Ok(match op {
            "@" => VersionSpec::Exact(version),
            "^" => VersionSpec::Caret(version),
            "~" => VersionSpec::Tilde(version),
            _ => VersionSpec::AtLeast(version),
        })
    }
}

impl std::fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionSpec::Exact(v) => write!(f, "@{v}"),
            VersionSpec::Caret(v) => write!(f, "^{v}"),
            VersionSpec::Tilde(v) => write!(f, "~{v}"),
            VersionSpec::AtLeast(v) => write!(f, ">={v}"),
            VersionSpec::Any => write!(f, "*"),
        }
    }
}

/// What a dependency points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyKind {
    /// Registry package
    Package { registry: PackageRegistry },
    /// Another registered plugin
    PluginRef,
    /// File inside the plugin's own directory
    FileRef,
}

impl DependencyKind {
    /// Stable discriminant used for (name, type) identity
    pub fn discriminant(&self) -> &'static str {
        match self {
            DependencyKind::Package { .. } => "package",
            DependencyKind::PluginRef => "plugin",
            DependencyKind::FileRef => "file",
        }
    }
}

/// A single declared dependency of a plugin
///
/// Identity (and uniqueness within a plugin) is `(name, kind discriminant)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDependency {
    pub name: String,
    pub kind: DependencyKind,
    pub version: VersionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl PluginDependency {
    pub fn package(registry: PackageRegistry, name: impl Into<String>, version: VersionSpec) -> Self {
        Self {
            name: name.into(),
            kind: DependencyKind::Package { registry },
            version,
            source: None,
        }
    }

    pub fn plugin_ref(name: impl Into<String>, version: VersionSpec) -> Self {
        Self {
            name: name.into(),
            kind: DependencyKind::PluginRef,
            version,
            source: None,
        }
    }

    pub fn file_ref(path: impl Into<String>) -> Self {
        Self {
            name: path.into(),
            kind: DependencyKind::FileRef,
            version: VersionSpec::Any,
            source: None,
        }
    }

    /// Parse the manifest wire form
    pub fn parse(spec: &str) -> Result<Self> {
        let (scheme, rest) = spec.split_once(':').ok_or_else(|| {
            DomainError::validation(
                "Dependency.Spec",
                format!("missing scheme in dependency {spec:?}"),
            )
        })?;

        if scheme == "file" {
            if rest.is_empty() {
                return Err(DomainError::validation(
                    "Dependency.Spec",
                    "empty file reference",
                ));
            }
            return Ok(Self::file_ref(rest));
        }

        let op_at = rest
            .find(['@', '^', '~'])
            .or_else(|| rest.find(">="))
            .ok_or_else(|| {
                DomainError::validation(
                    "Dependency.Spec",
                    format!("missing version in dependency {spec:?}"),
                )
            })?;
        let (name, tail) = rest.split_at(op_at);
        if name.is_empty() {
            return Err(DomainError::validation(
                "Dependency.Spec",
                format!("missing name in dependency {spec:?}"),
            ));
        }
        let version = VersionSpec::parse(tail)?;

        match scheme {
            "plugin" => Ok(Self::plugin_ref(name, version)),
            _ => {
                let registry = PackageRegistry::parse(scheme).ok_or_else(|| {
                    DomainError::validation(
                        "Dependency.Spec",
                        format!("unknown dependency scheme {scheme:?}"),
                    )
                })?;
                Ok(Self::package(registry, name, version))
            }
        }
    }

    /// `(name, type)` identity used for duplicate detection
    pub fn identity(&self) -> (&str, &'static str) {
        (self.name.as_str(), self.kind.discriminant())
    }
}

impl PartialEq for PluginDependency {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for PluginDependency {}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn parses_all_operator_forms() {
        let exact = PluginDependency::parse("pkg-s:lib@1.2.3").unwrap();
        assert_eq!(exact.version, VersionSpec::Exact(v("1.2.3")));
        assert_eq!(
            exact.kind,
            DependencyKind::Package {
                registry: PackageRegistry::PkgS
            }
        );

        let caret = PluginDependency::parse("pkg-p:toolkit^1.2.0").unwrap();
        assert_eq!(caret.version, VersionSpec::Caret(v("1.2.0")));

        let tilde = PluginDependency::parse("pkg-m:core~2.1.0").unwrap();
        assert_eq!(tilde.version, VersionSpec::Tilde(v("2.1.0")));

        let min = PluginDependency::parse("pkg-s:base>=0.9.0").unwrap();
        assert_eq!(min.version, VersionSpec::AtLeast(v("0.9.0")));
    }

    #[test]
    fn parses_plugin_and_file_schemes() {
        let link = PluginDependency::parse("plugin:formatter^1.0.0").unwrap();
        assert_eq!(link.kind, DependencyKind::PluginRef);
        assert_eq!(link.name, "formatter");

        let file = PluginDependency::parse("file:lib/helpers.py").unwrap();
        assert_eq!(file.kind, DependencyKind::FileRef);
        assert_eq!(file.name, "lib/helpers.py");
        assert_eq!(file.version, VersionSpec::Any);
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(PluginDependency::parse("no-scheme").is_err());
        assert!(PluginDependency::parse("pkg-s:lib").is_err());
        assert!(PluginDependency::parse("pkg-s:@1.0.0").is_err());
        assert!(PluginDependency::parse("pkg-q:lib@1.0.0").is_err());
        assert!(PluginDependency::parse("pkg-s:lib@not.a.version").is_err());
    }

    #[test]
    fn caret_matching_follows_leftmost_nonzero_rule() {
        let spec = VersionSpec::Caret(v("1.2.0"));
        assert!(spec.matches(&v("1.2.0")));
        assert!(spec.matches(&v("1.2.7")));
        assert!(spec.matches(&v("1.9.0")));
        assert!(!spec.matches(&v("2.0.0")));
        assert!(!spec.matches(&v("1.1.9")));

        let zero_minor = VersionSpec::Caret(v("0.3.1"));
        assert!(zero_minor.matches(&v("0.3.5")));
        assert!(!zero_minor.matches(&v("0.4.0")));

        let zero_zero = VersionSpec::Caret(v("0.0.3"));
        assert!(zero_zero.matches(&v("0.0.3")));
        assert!(!zero_zero.matches(&v("0.0.4")));
    }

    #[test]
    fn tilde_matching_pins_minor() {
        let spec = VersionSpec::Tilde(v("1.4.2"));
        assert!(spec.matches(&v("1.4.2")));
        assert!(spec.matches(&v("1.4.9")));
        assert!(!spec.matches(&v("1.5.0")));
        assert!(!spec.matches(&v("1.4.1")));
    }

    #[test]
    fn identity_ignores_version_and_source() {
        let a = PluginDependency::parse("pkg-s:lib@1.0.0").unwrap();
        let b = PluginDependency::parse("pkg-s:lib^2.0.0").unwrap();
        assert_eq!(a, b);

        let c = PluginDependency::parse("plugin:lib@1.0.0").unwrap();
        assert_ne!(a, c);
    }
}
