// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Overlay fragment aggregation.
//!
//! Oxilay merges a directory of overlay __fragments__ into one mapping that
//! can be handed to an external system configuration engine as a set of
//! named extension points, e.g., extra packages or package overrides.
//!
//! Each fragment is either a subdirectory holding an entry file, or a single
//! configuration file. Fragments are evaluated against one shared read-only
//! [`FragmentContext`], and their mappings are merged together. No key may
//! be defined by more than one fragment. Aggregation fails instead of
//! silently picking a winner.
//!
//! # See Also
//!
//! 1. [`fragment`] for discovery and evaluation rules.
//! 2. [`aggregate`] for merge rules.
//! 3. [`config`] for the settings file layout.

pub mod aggregate;
pub mod config;
pub mod context;
pub mod fragment;
pub mod path;

pub use aggregate::{AggregateError, Aggregator, DuplicateKey, DuplicateKeys, OwnershipIndex};
pub use config::Settings;
pub use context::{FragmentContext, System};
pub use fragment::{
    Evaluation, Fragment, FragmentError, FragmentEvaluator, FragmentKind, FragmentLayout,
    TomlEvaluator,
};
