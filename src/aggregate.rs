// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Overlay fragment aggregation.
//!
//! The __aggregator__ discovers every fragment of an overlay directory,
//! evaluates each one against a shared context, and merges their mappings
//! into one __aggregate result__.
//!
//! # No Silent Overrides
//!
//! Every key of the aggregate result comes from exactly one fragment. If two
//! or more fragments define the same key, aggregation fails with
//! [`DuplicateKeys`] listing every offending key along with the fragments
//! that define it. Nothing is merged in that case, so callers never see a
//! partial result.
//!
//! # Merge Order
//!
//! Fragment mappings are merged in discovery order: directory fragments
//! first, then file fragments, each group ordered by name. Since keys are
//! unique across fragments, merge order only affects key iteration order of
//! the aggregate result, never its contents.

use crate::{
    context::FragmentContext,
    fragment::{
        DiscoverError, Evaluation, Fragment, FragmentError, FragmentEvaluator, FragmentKind,
        FragmentLayout, TomlEvaluator,
    },
};

use futures::future::try_join_all;
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
    sync::Arc,
};
use tracing::{debug, info, instrument};

/// Overlay fragment aggregator.
#[derive(Debug, Clone)]
pub struct Aggregator<E = TomlEvaluator>
where
    E: FragmentEvaluator,
{
    layout: FragmentLayout,
    evaluator: Arc<E>,
}

impl Aggregator {
    /// Construct new aggregator using the default TOML evaluator.
    pub fn new(layout: FragmentLayout) -> Self {
        Self::with_evaluator(layout, TomlEvaluator::new())
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(FragmentLayout::default())
    }
}

impl<E> Aggregator<E>
where
    E: FragmentEvaluator,
{
    /// Construct new aggregator with custom fragment evaluator.
    pub fn with_evaluator(layout: FragmentLayout, evaluator: E) -> Self {
        Self {
            layout,
            evaluator: Arc::new(evaluator),
        }
    }

    /// Fragment layout used for discovery.
    pub fn layout(&self) -> &FragmentLayout {
        &self.layout
    }

    /// Discover fragments of overlay directory.
    ///
    /// # Errors
    ///
    /// - Return [`AggregateError::Discover`] if overlay directory cannot be
    ///   listed.
    pub fn discover(&self, dir: impl AsRef<Path>) -> Result<Vec<Fragment>> {
        Ok(self.layout.discover(dir)?)
    }

    /// Evaluate every fragment of overlay directory.
    ///
    /// File fragments that do not evaluate to a mapping are dropped.
    ///
    /// # Errors
    ///
    /// - Return [`AggregateError::Discover`] if overlay directory cannot be
    ///   listed.
    /// - Return [`AggregateError::Fragment`] if any fragment fails to
    ///   evaluate, or if a directory fragment does not evaluate to a mapping.
    #[instrument(skip(self, dir, context), level = "debug")]
    pub fn evaluate(
        &self,
        dir: impl AsRef<Path>,
        context: &FragmentContext,
    ) -> Result<Vec<(Fragment, toml::Table)>> {
        let fragments = self.discover(dir)?;
        let mut evaluated = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let evaluation = self.evaluator.evaluate(&fragment, &self.layout, context)?;
            evaluated.push((fragment, evaluation));
        }

        Ok(keep_mappings(evaluated)?)
    }

    /// Aggregate every fragment of overlay directory into one mapping.
    ///
    /// # Errors
    ///
    /// - Return [`AggregateError::Discover`] if overlay directory cannot be
    ///   listed.
    /// - Return [`AggregateError::Fragment`] if any fragment fails to
    ///   evaluate.
    /// - Return [`AggregateError::DuplicateKeys`] if two or more fragments
    ///   define the same key.
    #[instrument(skip(self, dir, context), level = "debug")]
    pub fn aggregate(
        &self,
        dir: impl AsRef<Path>,
        context: &FragmentContext,
    ) -> Result<toml::Table> {
        let dir = dir.as_ref();
        let evaluated = self.evaluate(dir, context)?;
        let result = merge(evaluated)?;
        info!("aggregated {} keys from {:?}", result.len(), dir.display());

        Ok(result)
    }

    /// Build key ownership index of overlay directory.
    ///
    /// # Errors
    ///
    /// - Return [`AggregateError::Discover`] if overlay directory cannot be
    ///   listed.
    /// - Return [`AggregateError::Fragment`] if any fragment fails to
    ///   evaluate.
    pub fn owners(
        &self,
        dir: impl AsRef<Path>,
        context: &FragmentContext,
    ) -> Result<OwnershipIndex> {
        let evaluated = self.evaluate(dir, context)?;
        Ok(OwnershipIndex::from_fragments(&evaluated))
    }
}

impl<E> Aggregator<E>
where
    E: FragmentEvaluator + 'static,
{
    /// Aggregate every fragment of overlay directory concurrently.
    ///
    /// Each fragment is evaluated on its own blocking task. Evaluations are
    /// collected back into discovery order before validation, so the result
    /// or failure is the same as [`Aggregator::aggregate`] would give.
    ///
    /// # Errors
    ///
    /// - Return [`AggregateError::Discover`] if overlay directory cannot be
    ///   listed.
    /// - Return [`AggregateError::Fragment`] if any fragment fails to
    ///   evaluate.
    /// - Return [`AggregateError::DuplicateKeys`] if two or more fragments
    ///   define the same key.
    /// - Return [`AggregateError::Join`] if an evaluation task panics.
    #[instrument(skip(self, dir, context), level = "debug")]
    pub async fn aggregate_concurrent(
        &self,
        dir: impl AsRef<Path>,
        context: Arc<FragmentContext>,
    ) -> Result<toml::Table> {
        let dir = dir.as_ref();
        let fragments = self.discover(dir)?;

        let tasks = fragments.into_iter().map(|fragment| {
            let evaluator = Arc::clone(&self.evaluator);
            let layout = self.layout.clone();
            let context = Arc::clone(&context);
            tokio::task::spawn_blocking(move || {
                let evaluation = evaluator.evaluate(&fragment, &layout, &context);
                evaluation.map(|evaluation| (fragment, evaluation))
            })
        });

        let mut evaluated = Vec::new();
        for evaluation in try_join_all(tasks).await? {
            evaluated.push(evaluation?);
        }

        let result = merge(keep_mappings(evaluated)?)?;
        info!("aggregated {} keys from {:?}", result.len(), dir.display());

        Ok(result)
    }
}

/// Drop non-mapping file fragments, reject non-mapping directory fragments.
fn keep_mappings(
    evaluated: Vec<(Fragment, Evaluation)>,
) -> Result<Vec<(Fragment, toml::Table)>, FragmentError> {
    let mut mappings = Vec::with_capacity(evaluated.len());
    for (fragment, evaluation) in evaluated {
        match (evaluation, fragment.kind()) {
            (Evaluation::Mapping(table), _) => mappings.push((fragment, table)),
            (Evaluation::Value(value), FragmentKind::File) => {
                debug!(
                    "skip file fragment {:?}: evaluated to {}",
                    fragment.name(),
                    value.type_str()
                );
            }
            (Evaluation::Value(value), FragmentKind::Directory) => {
                return Err(FragmentError::NotAMapping {
                    name: fragment.name().into(),
                    found: value.type_str(),
                });
            }
        }
    }

    Ok(mappings)
}

/// Merge fragment mappings into one mapping.
///
/// Validates that keys are unique across fragments before merging anything.
///
/// # Errors
///
/// - Return [`DuplicateKeys`] if two or more fragments define the same key.
pub fn merge(
    evaluated: Vec<(Fragment, toml::Table)>,
) -> std::result::Result<toml::Table, DuplicateKeys> {
    if let Some(duplicates) = OwnershipIndex::from_fragments(&evaluated).duplicates() {
        return Err(duplicates);
    }

    let mut result = toml::Table::new();
    for (fragment, table) in evaluated {
        debug!("merge {} keys from {:?}", table.len(), fragment.name());
        result.extend(table);
    }

    Ok(result)
}

/// Index of which fragments define which key.
///
/// Owners of each key are kept in discovery order. Keys are kept sorted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OwnershipIndex {
    owners: BTreeMap<String, Vec<String>>,
}

impl OwnershipIndex {
    /// Construct new empty ownership index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build ownership index from evaluated fragments.
    pub fn from_fragments(evaluated: &[(Fragment, toml::Table)]) -> Self {
        let mut index = Self::new();
        for (fragment, table) in evaluated {
            for key in table.keys() {
                index.insert(key, fragment.name());
            }
        }

        index
    }

    /// Record fragment as owner of key.
    pub fn insert(&mut self, key: impl Into<String>, owner: impl Into<String>) {
        self.owners.entry(key.into()).or_default().push(owner.into());
    }

    /// List owners of key.
    pub fn owners(&self, key: &str) -> Option<&[String]> {
        self.owners.get(key).map(Vec::as_slice)
    }

    /// Iterate through keys and their owners in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.owners
            .iter()
            .map(|(key, owners)| (key.as_str(), owners.as_slice()))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Check if index has no keys.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Collect every key owned by more than one fragment.
    pub fn duplicates(&self) -> Option<DuplicateKeys> {
        let duplicates = self
            .owners
            .iter()
            .filter(|(_, owners)| owners.len() > 1)
            .map(|(key, owners)| DuplicateKey {
                key: key.clone(),
                owners: owners.clone(),
            })
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            return None;
        }

        Some(DuplicateKeys { duplicates })
    }
}

/// Key defined by more than one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateKey {
    /// Offending key.
    pub key: String,

    /// Names of every fragment defining the key, in discovery order.
    pub owners: Vec<String>,
}

impl Display for DuplicateKey {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{:?} defined by [{}]", self.key, self.owners.join(", "))
    }
}

/// Keys defined by more than one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateKeys {
    duplicates: Vec<DuplicateKey>,
}

impl DuplicateKeys {
    /// Offending keys in key order.
    pub fn keys(&self) -> impl Iterator<Item = &DuplicateKey> {
        self.duplicates.iter()
    }
}

impl Display for DuplicateKeys {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let listing = self
            .duplicates
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        write!(fmt, "duplicate keys across fragments: {listing}")
    }
}

impl std::error::Error for DuplicateKeys {}

/// Aggregation error types.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// Overlay directory cannot be listed.
    #[error(transparent)]
    Discover(#[from] DiscoverError),

    /// Fragment evaluation fails.
    #[error(transparent)]
    Fragment(#[from] FragmentError),

    /// Two or more fragments define the same key.
    #[error(transparent)]
    DuplicateKeys(#[from] DuplicateKeys),

    /// Concurrent evaluation task fails to complete.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Friendly result alias :3
pub type Result<T, E = AggregateError> = std::result::Result<T, E>;
