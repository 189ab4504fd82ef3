// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Fragment discovery and evaluation.
//!
//! A __fragment__ is one unit of overlay configuration that contributes a set
//! of named entries to the aggregate result. Fragments live side by side in a
//! single __overlay directory__.
//!
//! # Fragment Kinds
//!
//! Oxilay recognizes two kinds of fragments at the top-level of an overlay
//! directory:
//!
//! 1. __Directory fragments__: any immediate subdirectory that contains an
//!    entry file, i.e., "default.toml". The fragment is named after the
//!    subdirectory. A subdirectory lacking the entry file is simply not a
//!    fragment.
//! 2. __File fragments__: any immediate file with the configuration file
//!    extension, i.e., "toml". The fragment is named after the file stem. The
//!    overlay directory's own entry file, and any file matching a reserved
//!    pattern, is not a fragment.
//!
//! Directory fragments are always listed before file fragments. Each group is
//! ordered by name.
//!
//! # Fragment Evaluation
//!
//! Fragments are evaluated against a shared [`FragmentContext`] through a
//! [`FragmentEvaluator`]. The default evaluator is [`TomlEvaluator`], which
//! parses the fragment's source text as TOML, and then expands context
//! bindings inside every string value. A TOML document evaluates to a mapping.
//! A single bare TOML value standing alone evaluates to a non-mapping value.
//!
//! # Binding Expansion
//!
//! String values reference context bindings with `$name` or `${name}`. Keys,
//! numbers, booleans, and dates are never expanded, so a binding can only ever
//! change the contents of the string it appears in. Write `$$` for a literal
//! `$`, e.g., `"$$arch"` evaluates to `"$arch"` rather than the bound CPU
//! architecture.

use crate::context::FragmentContext;

use glob::Pattern;
use serde::Deserialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{read_dir, read_to_string},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Layout rules for fragment discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentLayout {
    entry: String,
    extension: String,
    reserved: Vec<Pattern>,
}

impl FragmentLayout {
    /// Construct new fragment layout.
    pub fn new(entry: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            extension: extension.into(),
            reserved: Vec::new(),
        }
    }

    /// Reserve file names matching glob pattern.
    pub fn with_reserved(mut self, pattern: Pattern) -> Self {
        self.reserved.push(pattern);
        self
    }

    /// Name of entry file.
    pub fn entry(&self) -> &str {
        self.entry.as_str()
    }

    /// Configuration file extension, without the leading dot.
    pub fn extension(&self) -> &str {
        self.extension.as_str()
    }

    /// Discover fragments at the top-level of overlay directory.
    ///
    /// # Errors
    ///
    /// - Return [`DiscoverError`] if the overlay directory cannot be listed.
    #[instrument(skip(self, dir), level = "debug")]
    pub fn discover(&self, dir: impl AsRef<Path>) -> Result<Vec<Fragment>, DiscoverError> {
        let dir = dir.as_ref();
        let to_error = |source| DiscoverError {
            source,
            dir: dir.to_path_buf(),
        };

        let mut paths = Vec::new();
        for entry in read_dir(dir).map_err(to_error)? {
            paths.push(entry.map_err(to_error)?.path());
        }
        paths.sort();

        let mut directories = Vec::new();
        let mut files = Vec::new();
        for path in paths {
            let Some(file_name) = path.file_name().map(|name| name.to_string_lossy().into_owned())
            else {
                continue;
            };

            if path.is_dir() {
                // INVARIANT: Directory without entry file is not a fragment.
                if !path.join(&self.entry).is_file() {
                    debug!("skip {:?}: no {} entry file", path.display(), self.entry);
                    continue;
                }

                debug!("found directory fragment {file_name:?}");
                directories.push(Fragment::new(file_name, FragmentKind::Directory, path));
            } else if path.is_file() {
                if !self.is_candidate_file(&file_name) {
                    continue;
                }

                let Some(name) = path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
                else {
                    continue;
                };

                debug!("found file fragment {name:?}");
                files.push(Fragment::new(name, FragmentKind::File, path));
            }
        }

        directories.extend(files);
        Ok(directories)
    }

    fn is_candidate_file(&self, file_name: &str) -> bool {
        if file_name == self.entry {
            return false;
        }

        let has_extension = file_name
            .rsplit_once('.')
            .is_some_and(|(stem, ext)| !stem.is_empty() && ext == self.extension);
        if !has_extension {
            return false;
        }

        if let Some(pattern) = self.reserved.iter().find(|p| p.matches(file_name)) {
            debug!("skip {file_name:?}: reserved by {:?}", pattern.as_str());
            return false;
        }

        true
    }
}

impl Default for FragmentLayout {
    fn default() -> Self {
        Self::new("default.toml", "toml")
    }
}

/// Overlay directory cannot be listed.
#[derive(Debug, thiserror::Error)]
#[error("failed to list overlay directory {:?}", dir.display())]
pub struct DiscoverError {
    #[source]
    source: std::io::Error,
    dir: PathBuf,
}

/// Discoverable unit of overlay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    name: String,
    kind: FragmentKind,
    path: PathBuf,
}

impl Fragment {
    /// Construct new fragment.
    ///
    /// For directory fragments `path` names the directory itself, not its
    /// entry file.
    pub fn new(name: impl Into<String>, kind: FragmentKind, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            path: path.into(),
        }
    }

    /// Name of fragment.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Kind of fragment.
    pub fn kind(&self) -> FragmentKind {
        self.kind
    }

    /// Path to fragment.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Path to file containing fragment source text.
    pub fn source_path(&self, layout: &FragmentLayout) -> PathBuf {
        match self.kind {
            FragmentKind::Directory => self.path.join(layout.entry()),
            FragmentKind::File => self.path.clone(),
        }
    }
}

impl Display for Fragment {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{:<9}  {:<24}  {}", self.kind, self.name, self.path().display())
    }
}

/// Kind of fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentKind {
    /// Subdirectory with entry file.
    Directory,

    /// Single configuration file.
    File,
}

impl Display for FragmentKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Directory => fmt.pad("directory"),
            Self::File => fmt.pad("file"),
        }
    }
}

/// Result of evaluating a fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Named entries contributed by the fragment.
    Mapping(toml::Table),

    /// Anything that is not a mapping.
    Value(toml::Value),
}

/// Evaluate fragments against shared context.
///
/// Implementations must treat the context as read-only input, and must not
/// depend on the evaluation of any other fragment.
pub trait FragmentEvaluator: Send + Sync {
    /// Evaluate fragment against shared context.
    fn evaluate(
        &self,
        fragment: &Fragment,
        layout: &FragmentLayout,
        context: &FragmentContext,
    ) -> Result<Evaluation>;
}

impl<F> FragmentEvaluator for F
where
    F: Fn(&Fragment, &FragmentContext) -> Result<Evaluation> + Send + Sync,
{
    fn evaluate(
        &self,
        fragment: &Fragment,
        _layout: &FragmentLayout,
        context: &FragmentContext,
    ) -> Result<Evaluation> {
        self(fragment, context)
    }
}

/// Evaluate TOML fragment sources.
///
/// Parses the source text first, then expands bindings of the shared context
/// inside string values only. References use the `$name` or `${name}` syntax,
/// and `$$` escapes a literal `$`. References to unknown bindings are left
/// as-is, unless strict mode is set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TomlEvaluator {
    strict: bool,
}

impl TomlEvaluator {
    /// Construct new TOML evaluator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat references to unknown bindings as errors.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

impl FragmentEvaluator for TomlEvaluator {
    fn evaluate(
        &self,
        fragment: &Fragment,
        layout: &FragmentLayout,
        context: &FragmentContext,
    ) -> Result<Evaluation> {
        let path = fragment.source_path(layout);
        let source = read_to_string(&path).map_err(|err| FragmentError::Read {
            source: err,
            path: path.clone(),
        })?;

        let mut evaluation = parse_source(source.as_str()).map_err(|err| FragmentError::Parse {
            source: err,
            path: path.clone(),
        })?;

        let expanded = match &mut evaluation {
            Evaluation::Mapping(table) => table
                .iter_mut()
                .try_for_each(|(_, value)| self.expand_value(value, context)),
            Evaluation::Value(value) => self.expand_value(value, context),
        };
        expanded.map_err(|err| FragmentError::Expand { source: err, path })?;

        Ok(evaluation)
    }
}

type LookupError = shellexpand::LookupError<MissingBinding>;

impl TomlEvaluator {
    fn expand_value(
        &self,
        value: &mut toml::Value,
        context: &FragmentContext,
    ) -> std::result::Result<(), LookupError> {
        match value {
            toml::Value::String(text) => *text = self.expand_str(text, context)?,
            toml::Value::Array(items) => {
                for item in items.iter_mut() {
                    self.expand_value(item, context)?;
                }
            }
            toml::Value::Table(table) => {
                for (_, item) in table.iter_mut() {
                    self.expand_value(item, context)?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn expand_str(
        &self,
        text: &str,
        context: &FragmentContext,
    ) -> std::result::Result<String, LookupError> {
        // INVARIANT: `$$` never starts a reference, it is a literal `$`.
        let mut pieces = Vec::new();
        for piece in text.split("$$") {
            let piece = shellexpand::env_with_context(piece, |name| match context.lookup(name) {
                Some(value) => Ok(Some(value)),
                None if self.strict => Err(MissingBinding),
                None => Ok(None),
            })?;
            pieces.push(piece.into_owned());
        }

        Ok(pieces.join("$"))
    }
}

/// Parse fragment source text.
///
/// A TOML document yields a mapping. Otherwise the text is tried as a single
/// bare TOML value with nothing else beside it. The document error is reported
/// if both fail.
pub fn parse_source(source: &str) -> Result<Evaluation, toml::de::Error> {
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct BareValue {
        value: toml::Value,
    }

    let document_error = match toml::from_str::<toml::Table>(source) {
        Ok(table) => return Ok(Evaluation::Mapping(table)),
        Err(err) => err,
    };

    match toml::from_str::<BareValue>(&format!("value = {}", source.trim())) {
        Ok(bare) => Ok(Evaluation::Value(bare.value)),
        Err(_) => Err(document_error),
    }
}

/// Context does not bind referenced name.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("name is not bound in fragment context")]
pub struct MissingBinding;

/// Fragment evaluation error types.
#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
    /// Fragment source cannot be read.
    #[error("failed to read fragment source at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Fragment source references unbound name in strict mode.
    #[error("failed to expand bindings in fragment source at {:?}", path.display())]
    Expand {
        #[source]
        source: LookupError,
        path: PathBuf,
    },

    /// Fragment source is not valid TOML.
    #[error("failed to parse fragment source at {:?}", path.display())]
    Parse {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },

    /// Directory fragment did not evaluate to a mapping.
    #[error("directory fragment {name:?} must evaluate to a mapping, got {found}")]
    NotAMapping { name: String, found: &'static str },

    /// Custom evaluator failed.
    #[error(transparent)]
    Custom(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Friendly result alias :3
pub type Result<T, E = FragmentError> = std::result::Result<T, E>;
