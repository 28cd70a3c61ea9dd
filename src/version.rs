//! Version information.

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cache format generation this build reads and writes.
pub const CACHE_FORMAT: &str = "v1";

/// Version string for `--version` output: `{version} (cache {format})`.
pub fn version_string() -> String {
    format!("{PKG_VERSION} (cache {CACHE_FORMAT})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_contains_pkg_version() {
        let version = version_string();
        assert!(
            version.starts_with(PKG_VERSION),
            "version should start with pkg version"
        );
        assert!(version.contains(CACHE_FORMAT));
    }
}
