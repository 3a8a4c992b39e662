//! Cluster-safe name generation

use rand::Rng;

#[cfg(test)]
use mockall::automock;

use tidepool_common::Error;

/// Maximum length of a generated name, leaving room for resource suffixes
/// such as `-config` under the 63 character DNS label limit.
pub const MAX_NAME_LEN: usize = 48;

const SUFFIX_LEN: usize = 8;

/// Produces unique cluster-safe names from human-readable ones
#[cfg_attr(test, automock)]
pub trait NameGenerator: Send + Sync {
    /// Generate a unique DNS-label-safe name derived from `name`
    fn generate(&self, name: &str) -> Result<String, Error>;
}

/// Appends a random hex suffix to a sanitized name
#[derive(Clone, Debug, Default)]
pub struct RandomNameGenerator;

impl NameGenerator for RandomNameGenerator {
    fn generate(&self, name: &str) -> Result<String, Error> {
        let base = sanitize(name);
        if base.is_empty() {
            return Err(Error::validation_for(
                name,
                "name must contain at least one alphanumeric character",
            ));
        }

        let suffix: String = {
            let mut rng = rand::thread_rng();
            (0..SUFFIX_LEN)
                .map(|_| {
                    let n: u8 = rng.gen_range(0..16);
                    char::from_digit(u32::from(n), 16).unwrap_or('0')
                })
                .collect()
        };

        Ok(format!("{}-{}", base, suffix))
    }
}

/// Lowercase, replace anything outside `[a-z0-9-]` with `-`, collapse runs,
/// trim dashes and truncate so the suffixed name fits [`MAX_NAME_LEN`].
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
    }

    out.truncate(MAX_NAME_LEN - SUFFIX_LEN - 1);
    out.trim_end_matches('-').to_string()
}

/// Maximum length of a Kubernetes label value
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// Fold a human-readable name into a valid label value
///
/// Case is kept. Anything outside `[A-Za-z0-9_.-]` becomes `-`, runs of `-`
/// collapse, and the result is trimmed to start and end alphanumeric within
/// [`MAX_LABEL_VALUE_LEN`]. May return an empty string, which is a valid value.
pub fn label_value(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '.' { c } else { '-' };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }

    out.truncate(MAX_LABEL_VALUE_LEN);
    out.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}
