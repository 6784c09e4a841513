use genapply_core::{ApplyConfig, FileRecord};
use indexmap::IndexSet;
use regex::Regex;
use std::collections::BTreeSet;

/// Finds the external packages a set of source files depends on.
#[derive(Debug, Clone)]
pub struct PackageInferer {
    patterns: Vec<Regex>,
    builtins: BTreeSet<String>,
}

impl PackageInferer {
    pub fn new<I, S>(builtins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: vec![
                // import x from "m"; import { a } from "m"; import "m"
                Regex::new(r#"\bimport\s+(?:type\s+)?(?:[\w*{}\s,$]+?\s+from\s+)?["']([^"'\n]*)["']"#)
                    .expect("valid regex"),
                // export * from "m"; export { a } from "m"
                Regex::new(
                    r#"\bexport\s+(?:type\s+)?(?:\*(?:\s+as\s+\w+)?|\{[^}]*\})\s+from\s+["']([^"'\n]*)["']"#,
                )
                .expect("valid regex"),
                // require("m"); import("m")
                Regex::new(r#"\b(?:require|import)\s*\(\s*["']([^"'\n]*)["']\s*\)"#)
                    .expect("valid regex"),
            ],
            builtins: builtins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(cfg: &ApplyConfig) -> Self {
        Self::new(cfg.runtime_builtins.iter().cloned())
    }

    /// Deduplicated package names in order of first reference.
    pub fn infer(&self, files: &[FileRecord]) -> Vec<String> {
        let mut packages = IndexSet::new();
        for file in files {
            let mut specifiers: Vec<(usize, &str)> = self
                .patterns
                .iter()
                .flat_map(|pattern| {
                    pattern.captures_iter(&file.content).filter_map(|caps| {
                        let specifier = caps.get(1)?;
                        Some((specifier.start(), specifier.as_str()))
                    })
                })
                .collect();
            specifiers.sort_by_key(|(offset, _)| *offset);
            specifiers.dedup();
            for (_, specifier) in specifiers {
                if let Some(name) = self.package_name(specifier) {
                    packages.insert(name.to_string());
                }
            }
        }
        packages.into_iter().collect()
    }

    fn package_name<'a>(&self, specifier: &'a str) -> Option<&'a str> {
        let specifier = specifier.trim();
        if specifier.is_empty()
            || specifier.starts_with('.')
            || specifier.starts_with('/')
            || specifier.starts_with("@/")
            || specifier.starts_with("node:")
            || specifier.contains("://")
            || self.builtins.contains(specifier)
        {
            return None;
        }
        let name = if specifier.starts_with('@') {
            match specifier.match_indices('/').nth(1) {
                Some((end, _)) => &specifier[..end],
                None => specifier,
            }
        } else {
            specifier.split('/').next().unwrap_or(specifier)
        };
        if self.builtins.contains(name) {
            return None;
        }
        Some(name)
    }
}

impl Default for PackageInferer {
    fn default() -> Self {
        Self::from_config(&ApplyConfig::default())
    }
}
