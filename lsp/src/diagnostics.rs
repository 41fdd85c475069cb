//! Per-file diagnostics published by the bound language server.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::types::{Diagnostic, DiagnosticsSnapshot};

#[derive(Default)]
pub(crate) struct DiagnosticsStore {
    data: HashMap<PathBuf, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    /// Replace the diagnostics for `path`. An empty list clears the file.
    pub fn update(&mut self, path: PathBuf, items: Vec<Diagnostic>) {
        if items.is_empty() {
            self.data.remove(&path);
        } else {
            self.data.insert(path, items);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(PathBuf, Vec<Diagnostic>)> = self
            .data
            .iter()
            .map(|(path, items)| (path.clone(), items.clone()))
            .collect();

        // Files with errors first, then alphabetically.
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }

    pub fn errors_for_files(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        paths
            .iter()
            .filter_map(|path| {
                let errors: Vec<Diagnostic> = self
                    .data
                    .get(path)?
                    .iter()
                    .filter(|d| d.severity().is_error())
                    .cloned()
                    .collect();
                (!errors.is_empty()).then(|| (path.clone(), errors))
            })
            .collect()
    }
}
