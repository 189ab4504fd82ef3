// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for the settings file that Oxilay uses to simplify
//! the process of serialization and deserialization. File I/O is left to the
//! caller to figure out.

use crate::{
    context::{FragmentContext, System},
    fragment::{FragmentLayout, TomlEvaluator},
};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Settings layout.
///
/// The settings file is composed of two basic parts: fragment settings and
/// context settings. Fragment settings determine how fragments are found and
/// evaluated in an overlay directory. Context settings determine the shared
/// bindings handed to every fragment during evaluation.
///
/// Every field is optional.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Fragment discovery and evaluation settings.
    pub fragments: FragmentSettings,

    /// Shared fragment context settings.
    pub context: ContextSettings,
}

impl Settings {
    /// Build fragment layout from fragment settings.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Pattern`] if a reserved pattern is not a valid
    ///   glob pattern.
    pub fn layout(&self) -> Result<FragmentLayout> {
        let mut layout = FragmentLayout::new(&self.fragments.entry, &self.fragments.extension);
        for reserved in &self.fragments.reserved {
            layout = layout.with_reserved(Pattern::new(reserved)?);
        }

        Ok(layout)
    }

    /// Build TOML evaluator from fragment settings.
    pub fn evaluator(&self) -> TomlEvaluator {
        TomlEvaluator::new().strict(self.fragments.strict_bindings)
    }

    /// Build shared fragment context from context settings.
    ///
    /// Uses the system of the running host if none was set.
    pub fn context(&self) -> FragmentContext {
        let system = self.context.system.clone().unwrap_or_else(System::host);
        let mut context = FragmentContext::new(system);
        if let Some(hostname) = &self.context.hostname {
            context = context.with_hostname(hostname);
        }

        for (name, location) in &self.context.inputs {
            context = context.with_input(name, location);
        }

        for (name, value) in &self.context.bindings {
            context = context.with_binding(name, value);
        }

        context
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on input locations.
        for location in settings.context.inputs.values_mut() {
            *location = shellexpand::full(location.as_str())
                .map_err(ConfigError::ShellExpansion)?
                .into_owned();
        }

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Fragment discovery and evaluation settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FragmentSettings {
    /// Name of entry file marking a directory fragment.
    pub entry: String,

    /// Extension of configuration files treated as file fragments.
    pub extension: String,

    /// Glob patterns of file names that are never file fragments.
    pub reserved: Vec<String>,

    /// Treat references to unknown bindings as evaluation errors.
    pub strict_bindings: bool,
}

impl Default for FragmentSettings {
    fn default() -> Self {
        let layout = FragmentLayout::default();
        Self {
            entry: layout.entry().into(),
            extension: layout.extension().into(),
            reserved: Vec::new(),
            strict_bindings: false,
        }
    }
}

/// Shared fragment context settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Target system, defaults to the running host's system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<System>,

    /// Host name to expose to fragments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Locations of external source inputs.
    pub inputs: BTreeMap<String, String>,

    /// Free-form bindings.
    pub bindings: BTreeMap<String, String>,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Reserved file name is not a valid glob pattern.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("BLAH", "/home/blah/blah")])]
    fn deserialize_settings() -> anyhow::Result<()> {
        let result: Settings = r#"
            [fragments]
            entry = "mod.toml"
            extension = "toml"
            reserved = ["flake.toml", "README*"]
            strict_bindings = true

            [context]
            system = "aarch64-darwin"
            hostname = "workbook"

            [context.inputs]
            nixpkgs = "$BLAH/nixpkgs"

            [context.bindings]
            user = "blah"
        "#
        .parse()?;

        let expect = Settings {
            fragments: FragmentSettings {
                entry: "mod.toml".into(),
                extension: "toml".into(),
                reserved: vec!["flake.toml".into(), "README*".into()],
                strict_bindings: true,
            },
            context: ContextSettings {
                system: Some(System::new("aarch64", "darwin")),
                hostname: Some("workbook".into()),
                inputs: BTreeMap::from([("nixpkgs".into(), "/home/blah/blah/nixpkgs".into())]),
                bindings: BTreeMap::from([("user".into(), "blah".into())]),
            },
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn deserialize_empty_settings() -> anyhow::Result<()> {
        let result: Settings = "".parse()?;
        assert_eq!(result, Settings::default());
        assert_eq!(result.fragments.entry, "default.toml");
        assert_eq!(result.fragments.extension, "toml");

        Ok(())
    }

    #[test]
    fn deserialize_malformed_system() {
        let result = "[context]\nsystem = \"linux\"\n".parse::<Settings>();
        assert!(matches!(result, Err(ConfigError::Deserialize(_))));
    }

    #[test]
    fn serialize_settings() -> anyhow::Result<()> {
        let settings = Settings {
            fragments: FragmentSettings {
                reserved: vec!["flake.toml".into(), "README*".into()],
                ..Default::default()
            },
            context: ContextSettings {
                system: Some(System::new("x86_64", "linux")),
                hostname: None,
                inputs: BTreeMap::from([("nixpkgs".into(), "/src/nixpkgs".into())]),
                bindings: BTreeMap::from([("user".into(), "blah".into())]),
            },
        };
        let result = settings.to_string();

        assert!(result.contains("entry = \"default.toml\""));
        assert!(result.contains("system = \"x86_64-linux\""));
        assert!(!result.contains("hostname"));
        assert_eq!(result.parse::<Settings>()?, settings);

        Ok(())
    }

    #[test]
    fn build_layout_and_context() -> anyhow::Result<()> {
        let settings: Settings = indoc! {r#"
            [fragments]
            reserved = ["flake.*"]

            [context]
            system = "x86_64-linux"

            [context.bindings]
            user = "blah"
        "#}
        .parse()?;

        let layout = settings.layout()?;
        assert_eq!(
            layout,
            FragmentLayout::default().with_reserved(Pattern::new("flake.*")?)
        );

        let context = settings.context();
        assert_eq!(context.lookup("system"), Some("x86_64-linux"));
        assert_eq!(context.lookup("user"), Some("blah"));
        assert_eq!(context.hostname(), None);

        Ok(())
    }

    #[test]
    fn reject_malformed_reserved_pattern() -> anyhow::Result<()> {
        let settings: Settings = "[fragments]\nreserved = [\"[\"]\n".parse()?;
        assert!(matches!(settings.layout(), Err(ConfigError::Pattern(_))));

        Ok(())
    }
}
