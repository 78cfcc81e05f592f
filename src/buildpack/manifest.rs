// Copyright 2024-2026 Stagehand Contributors
// SPDX-License-Identifier: Apache-2.0

//! Buildpack manifest parsing and dependency version resolution.
//!
//! Every packaged buildpack carries a `manifest.yml` listing the dependency
//! versions it knows about. Scenarios use it to template fixtures with "the
//! latest 2.1.x SDK" or "the release before the latest one" without
//! hard-coding versions that go stale.

use std::io::Read;
use std::path::Path;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// One dependency entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDependency {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub cf_stacks: Vec<String>,
}

/// Default version constraint for a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultVersion {
    pub name: String,
    pub version: String,
}

/// Parsed `manifest.yml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackManifest {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub default_versions: Vec<DefaultVersion>,
    #[serde(default)]
    pub dependencies: Vec<ManifestDependency>,
}

impl BuildpackManifest {
    /// Parse manifest from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| HarnessError::Manifest(format!("invalid manifest YAML: {}", e)))
    }

    /// Load `manifest.yml` from an unpackaged buildpack directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("manifest.yml");
        let content = std::fs::read_to_string(&path).map_err(|e| {
            HarnessError::Manifest(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Load `manifest.yml` out of a packaged buildpack archive.
    pub fn from_archive(archive: &Path) -> Result<Self> {
        let file = std::fs::File::open(archive)?;
        let mut zip = zip::ZipArchive::new(file)?;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let name = entry.name().trim_start_matches("./").to_string();
            if name == "manifest.yml" {
                let mut content = String::new();
                entry.read_to_string(&mut content)?;
                return Self::from_yaml(&content);
            }
        }
        Err(HarnessError::Manifest(format!(
            "failed to find manifest.yml in buildpack {}",
            archive.display()
        )))
    }

    /// Every listed version of `name`, in manifest order, without duplicates.
    pub fn all_dependency_versions(&self, name: &str) -> Vec<String> {
        let mut versions: Vec<String> = Vec::new();
        for dep in self.dependencies.iter().filter(|d| d.name == name) {
            if !versions.contains(&dep.version) {
                versions.push(dep.version.clone());
            }
        }
        versions
    }

    /// Highest listed version of `name` satisfying `constraint`.
    pub fn latest_matching(&self, name: &str, constraint: &str) -> Result<String> {
        find_matching_version(constraint, &self.all_dependency_versions(name)).ok_or_else(|| {
            HarnessError::NoMatchingVersion {
                dependency: name.to_string(),
                constraint: constraint.to_string(),
            }
        })
    }

    /// Distinct hosts the dependency URIs point at, in manifest order.
    pub fn dependency_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for uri in self.dependencies.iter().filter_map(|d| d.uri.as_deref()) {
            let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
            let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
            let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
            let host = match host.rsplit_once(':') {
                Some((h, port)) if port.bytes().all(|b| b.is_ascii_digit()) => h,
                _ => host,
            };
            if !host.is_empty() && !hosts.iter().any(|h| h == host) {
                hosts.push(host.to_string());
            }
        }
        hosts
    }

    /// Version of `name` the buildpack installs when the app asks for nothing.
    pub fn default_version(&self, name: &str) -> Result<String> {
        let entry = self
            .default_versions
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| {
                HarnessError::Manifest(format!("no default version for {}", name))
            })?;
        self.latest_matching(name, &entry.version)
    }
}

/// Pad a loose version ("7.2", "1.0.0.4", "2.0.0-preview7") into semver.
pub fn parse_loose_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    let (core, pre) = match raw.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (raw, None),
    };
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }
    let mut padded: Vec<&str> = parts.iter().take(3).copied().collect();
    while padded.len() < 3 {
        padded.push("0");
    }
    let mut text = padded.join(".");
    if let Some(pre) = pre {
        text.push('-');
        text.push_str(pre);
    }
    if parts.len() > 3 {
        text.push('+');
        text.push_str(&parts[3..].join("."));
    }
    Version::parse(&text).ok()
}

/// Rewrite one comparator into the syntax [`VersionReq`] understands.
///
/// Bare full versions are exact matches; bare partial versions are wildcards.
fn normalize_comparator(token: &str) -> String {
    let op_len = token
        .find(|c: char| !matches!(c, '=' | '<' | '>' | '~' | '^'))
        .unwrap_or(token.len());
    let (op, version) = token.split_at(op_len);
    if !op.is_empty() {
        return format!("{}{}", op, version);
    }
    let components = version.split('.').count();
    let wildcard = version
        .split('.')
        .any(|p| p == "x" || p == "X" || p == "*");
    if wildcard {
        version.to_string()
    } else if components < 3 {
        format!("{}.*", version)
    } else {
        format!("={}", version)
    }
}

/// Translate a constraint ("2.1.x", "< 2.1.5", ">=1.0, <2.0", "1.x || 2.x").
fn parse_constraint(constraint: &str) -> Option<Vec<VersionReq>> {
    let mut alternatives = Vec::new();
    for alternative in constraint.split("||") {
        let mut comparators: Vec<String> = Vec::new();
        let mut pending_op = String::new();
        for token in alternative
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            if token.chars().all(|c| matches!(c, '=' | '<' | '>' | '~' | '^')) {
                pending_op.push_str(token);
                continue;
            }
            let joined = format!("{}{}", pending_op, token);
            pending_op.clear();
            comparators.push(normalize_comparator(&joined));
        }
        if comparators.is_empty() {
            return None;
        }
        alternatives.push(VersionReq::parse(&comparators.join(", ")).ok()?);
    }
    Some(alternatives)
}

/// Highest version in `versions` matching `constraint`.
///
/// Pre-release versions are only considered when the constraint names one.
pub fn find_matching_version(constraint: &str, versions: &[String]) -> Option<String> {
    let requirements = parse_constraint(constraint)?;
    versions
        .iter()
        .filter_map(|raw| parse_loose_version(raw).map(|v| (v, raw)))
        .filter(|(v, _)| requirements.iter().any(|req| req.matches(v)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, raw)| raw.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
language: dotnet-core
default_versions:
- name: dotnet-sdk
  version: 3.1.x
dependencies:
- name: dotnet-sdk
  version: 2.1.806
  cf_stacks: [cflinuxfs3]
- name: dotnet-sdk
  version: 2.1.807
  cf_stacks: [cflinuxfs3]
- name: dotnet-sdk
  version: 3.1.401
  cf_stacks: [cflinuxfs3]
- name: dotnet-sdk
  version: 3.1.402
  cf_stacks: [cflinuxfs3]
- name: dotnet-runtime
  version: 2.1.21
  sha256: 062d906c87839d03b243e2821e10653c89b4c92878bfe2bf995dec231e117bfc
"#;

    fn versions(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_latest_in_version_line() {
        let manifest = BuildpackManifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.latest_matching("dotnet-sdk", "2.1.x").unwrap(), "2.1.807");
        assert_eq!(manifest.latest_matching("dotnet-sdk", "3.1.x").unwrap(), "3.1.402");
    }

    #[test]
    fn test_latest_before() {
        let manifest = BuildpackManifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.latest_matching("dotnet-sdk", "<3.1.402").unwrap(), "3.1.401");
        assert_eq!(manifest.latest_matching("dotnet-sdk", "< 2.1.807").unwrap(), "2.1.806");
    }

    #[test]
    fn test_default_version_resolves_constraint() {
        let manifest = BuildpackManifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.default_version("dotnet-sdk").unwrap(), "3.1.402");
        assert!(manifest.default_version("node").is_err());
    }

    #[test]
    fn test_no_match_is_error() {
        let manifest = BuildpackManifest::from_yaml(MANIFEST).unwrap();
        assert!(matches!(
            manifest.latest_matching("dotnet-sdk", "9000.0.0"),
            Err(HarnessError::NoMatchingVersion { .. })
        ));
    }

    #[test]
    fn test_bare_version_is_exact() {
        let list = versions(&["4.1.1", "4.1.2"]);
        assert_eq!(find_matching_version("4.1.1", &list).as_deref(), Some("4.1.1"));
    }

    #[test]
    fn test_partial_version_is_wildcard() {
        let list = versions(&["10.15.3", "10.16.0", "12.1.0"]);
        assert_eq!(find_matching_version("10", &list).as_deref(), Some("10.16.0"));
    }

    #[test]
    fn test_loose_versions() {
        assert_eq!(parse_loose_version("7.2"), Version::parse("7.2.0").ok());
        assert!(parse_loose_version("2.0.0-preview7").is_some());
        assert!(parse_loose_version("1.0.0.4").is_some());
        assert!(parse_loose_version("latest").is_none());
    }

    #[test]
    fn test_or_constraint() {
        let list = versions(&["1.9.0", "2.5.0", "3.0.0"]);
        assert_eq!(find_matching_version("1.x || 2.x", &list).as_deref(), Some("2.5.0"));
    }

    #[test]
    fn test_space_separated_range() {
        let list = versions(&["1.0.0", "1.5.0", "2.0.0"]);
        assert_eq!(find_matching_version(">= 1.0 < 2.0", &list).as_deref(), Some("1.5.0"));
    }

    #[test]
    fn test_duplicate_versions_listed_once() {
        let yaml = "dependencies:\n- {name: node, version: 10.1.0, cf_stacks: [cflinuxfs2]}\n- {name: node, version: 10.1.0, cf_stacks: [cflinuxfs3]}\n";
        let manifest = BuildpackManifest::from_yaml(yaml).unwrap();
        assert_eq!(manifest.all_dependency_versions("node"), vec!["10.1.0".to_string()]);
    }
}
