// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Shared fragment context.
//!
//! Every fragment is evaluated against the same __fragment context__. The
//! context is a read-only set of bindings that fragments may reference, e.g.,
//! the target system, the host name, and paths to external source inputs.
//!
//! # Binding Names
//!
//! | Name            | Value                                        |
//! |-----------------|----------------------------------------------|
//! | `system`        | Full system identifier, e.g. `aarch64-darwin` |
//! | `arch`          | Architecture part of `system`                |
//! | `kernel`        | Kernel part of `system`                      |
//! | `is_darwin`     | `true` if kernel is darwin, else `false`     |
//! | `is_linux`      | `true` if kernel is linux, else `false`      |
//! | `hostname`      | Host name, if one was given                  |
//! | `inputs.<name>` | Location of external source input `<name>`   |
//! | anything else   | Free-form binding of the same name           |
//!
//! Built-in names always take precedence over free-form bindings.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Target platform identifier.
///
/// Uses the `<arch>-<kernel>` form, e.g., `x86_64-linux`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct System {
    identifier: String,
    split: usize,
}

impl System {
    /// Construct new system from architecture and kernel names.
    pub fn new(arch: impl AsRef<str>, kernel: impl AsRef<str>) -> Self {
        let arch = arch.as_ref();
        Self {
            identifier: format!("{arch}-{}", kernel.as_ref()),
            split: arch.len(),
        }
    }

    /// Determine system of the running host.
    ///
    /// The "macos" kernel name reported by the standard library is reported
    /// as "darwin" instead.
    pub fn host() -> Self {
        let kernel = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };

        Self::new(std::env::consts::ARCH, kernel)
    }

    /// Architecture part of system identifier.
    pub fn arch(&self) -> &str {
        &self.identifier[..self.split]
    }

    /// Kernel part of system identifier.
    pub fn kernel(&self) -> &str {
        &self.identifier[self.split + 1..]
    }

    /// Check if system targets darwin.
    pub fn is_darwin(&self) -> bool {
        self.kernel() == "darwin"
    }

    /// Check if system targets linux.
    pub fn is_linux(&self) -> bool {
        self.kernel() == "linux"
    }

    /// Treat system as string slice.
    pub fn as_str(&self) -> &str {
        self.identifier.as_str()
    }
}

impl Default for System {
    fn default() -> Self {
        Self::host()
    }
}

impl FromStr for System {
    type Err = SystemError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let (arch, kernel) = data
            .split_once('-')
            .ok_or_else(|| SystemError::Malformed(data.into()))?;

        // INVARIANT: Both parts are non-empty, and free of whitespace.
        let is_valid = |part: &str| !part.is_empty() && !part.contains(char::is_whitespace);
        if !is_valid(arch) || !is_valid(kernel) {
            return Err(SystemError::Malformed(data.into()));
        }

        Ok(Self::new(arch, kernel))
    }
}

impl TryFrom<String> for System {
    type Error = SystemError;

    fn try_from(data: String) -> Result<Self, Self::Error> {
        data.parse()
    }
}

impl From<System> for String {
    fn from(system: System) -> Self {
        system.identifier
    }
}

impl Display for System {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// System identifier error types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SystemError {
    /// System identifier is not of the form `<arch>-<kernel>`.
    #[error("malformed system identifier {0:?}, expected <arch>-<kernel>")]
    Malformed(String),
}

/// Read-only bindings shared by all fragments of an aggregation pass.
///
/// Built once by the caller, then handed to the aggregator by shared
/// reference. There is no way to mutate a context through a shared
/// reference, so fragments cannot influence each other through it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FragmentContext {
    system: System,
    hostname: Option<String>,
    inputs: BTreeMap<String, String>,
    bindings: BTreeMap<String, String>,
}

impl FragmentContext {
    /// Construct new fragment context targeting a system.
    pub fn new(system: System) -> Self {
        Self {
            system,
            ..Default::default()
        }
    }

    /// Set host name.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Add external source input.
    ///
    /// Replaces any input of the same name.
    pub fn with_input(mut self, name: impl Into<String>, location: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), location.into());
        self
    }

    /// Add free-form binding.
    ///
    /// Replaces any binding of the same name. Bindings that share a name with
    /// a built-in binding are shadowed by it.
    pub fn with_binding(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    /// Target system.
    pub fn system(&self) -> &System {
        &self.system
    }

    /// Host name, if any.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Location of external source input.
    pub fn input(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).map(String::as_str)
    }

    /// Resolve binding by name.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        let truth = |flag: bool| if flag { "true" } else { "false" };
        match name {
            "system" => Some(self.system.as_str()),
            "arch" => Some(self.system.arch()),
            "kernel" => Some(self.system.kernel()),
            "is_darwin" => Some(truth(self.system.is_darwin())),
            "is_linux" => Some(truth(self.system.is_linux())),
            "hostname" => self.hostname(),
            _ => match name.strip_prefix("inputs.") {
                Some(input) => self.input(input),
                None => self.bindings.get(name).map(String::as_str),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("x86_64-linux", "x86_64", "linux"; "linux host")]
    #[test_case("aarch64-darwin", "aarch64", "darwin"; "darwin host")]
    #[test_case("armv7l-unknown-linux", "armv7l", "unknown-linux"; "kernel keeps extra hyphens")]
    #[test]
    fn parse_system(input: &str, arch: &str, kernel: &str) {
        use pretty_assertions::assert_eq;
        let system: System = input.parse().unwrap();
        assert_eq!(system.arch(), arch);
        assert_eq!(system.kernel(), kernel);
        assert_eq!(system.to_string(), input);
    }

    #[test_case(""; "empty")]
    #[test_case("x86_64"; "no kernel")]
    #[test_case("-linux"; "no arch")]
    #[test_case("x86_64-"; "empty kernel")]
    #[test_case("x86 64-linux"; "whitespace")]
    #[test]
    fn parse_malformed_system(input: &str) {
        use pretty_assertions::assert_eq;
        let result = input.parse::<System>();
        assert_eq!(result, Err(SystemError::Malformed(input.into())));
    }

    #[test]
    fn host_system_uses_darwin_kernel_name() {
        let system = System::host();
        assert_ne!(system.kernel(), "macos");
        assert_eq!(system.arch(), std::env::consts::ARCH);
    }

    #[test]
    fn lookup_bindings() {
        let context = FragmentContext::new(System::new("aarch64", "darwin"))
            .with_hostname("workbook")
            .with_input("nixpkgs", "/src/nixpkgs")
            .with_binding("user", "blah")
            .with_binding("system", "shadowed");

        assert_eq!(context.lookup("system"), Some("aarch64-darwin"));
        assert_eq!(context.lookup("arch"), Some("aarch64"));
        assert_eq!(context.lookup("kernel"), Some("darwin"));
        assert_eq!(context.lookup("is_darwin"), Some("true"));
        assert_eq!(context.lookup("is_linux"), Some("false"));
        assert_eq!(context.lookup("hostname"), Some("workbook"));
        assert_eq!(context.lookup("inputs.nixpkgs"), Some("/src/nixpkgs"));
        assert_eq!(context.lookup("inputs.home-manager"), None);
        assert_eq!(context.lookup("user"), Some("blah"));
        assert_eq!(context.lookup("nope"), None);
    }

    #[test]
    fn missing_hostname_is_unbound() {
        let context = FragmentContext::new(System::new("x86_64", "linux"));
        assert_eq!(context.lookup("hostname"), None);
    }
}
