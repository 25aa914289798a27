//! Student identities derived from LMS directory names
//!
//! The LMS names every per-student folder `<surname> <given names><delim><opaque id>`,
//! for example `Doe Jane Ann_4711_assignsubmission_file_`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Delimiter inserted by the LMS between the display name and the submission id
pub const DEFAULT_NAME_DELIMITER: &str = "_";

/// Length of the hex hash appended to colliding file names
const DISAMBIGUATION_HASH_LEN: usize = 8;

/// Identity of one student, the primary key of a grading unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudentIdentity {
    pub surname: String,
    pub given_names: String,
    /// File stem used for the student's archive, unique within a batch
    pub normalized_file_name: String,
}

impl StudentIdentity {
    /// Name of the student's archive inside the session directory
    pub fn archive_file_name(&self) -> String {
        format!("{}.zip", self.normalized_file_name)
    }
}

impl fmt::Display for StudentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.given_names.is_empty() {
            write!(f, "{}", self.surname)
        } else {
            write!(f, "{} {}", self.surname, self.given_names)
        }
    }
}

/// Parser for the LMS per-student directory naming convention
#[derive(Debug, Clone)]
pub struct ArchiveNameParser {
    delimiter: String,
}

impl Default for ArchiveNameParser {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_DELIMITER)
    }
}

impl ArchiveNameParser {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }

    /// Split a raw directory name into display name and opaque id.
    /// A name without the delimiter has an empty id.
    fn split<'a>(&self, raw_directory_name: &'a str) -> (&'a str, &'a str) {
        raw_directory_name
            .split_once(self.delimiter.as_str())
            .unwrap_or((raw_directory_name, ""))
    }

    /// Parse a raw directory name. Any string is accepted.
    pub fn parse(&self, raw_directory_name: &str) -> StudentIdentity {
        let (display_name, _) = self.split(raw_directory_name);
        let (surname, rest) = display_name.split_once(' ').unwrap_or((display_name, ""));
        let given_names = rest.split_whitespace().collect::<Vec<_>>().join(" ");

        let normalized_file_name = format!("{}_{}", surname, given_names.replace(' ', "_"));

        StudentIdentity {
            surname: surname.to_string(),
            given_names,
            normalized_file_name,
        }
    }

    /// The opaque submission id following the delimiter
    pub fn opaque_id<'a>(&self, raw_directory_name: &'a str) -> &'a str {
        self.split(raw_directory_name).1
    }
}

/// Tracks normalized file names within a batch and disambiguates collisions.
///
/// When two different raw directory names normalize to the same file name, the
/// later one gets `_<hash>` appended, where `<hash>` is the first eight hex
/// digits of the SHA-256 of its opaque id (or of the raw name when the id is
/// empty). Should that still collide, a numeric suffix `_2`, `_3`, ... follows.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    parser: ArchiveNameParser,
    /// normalized file name -> raw directory name that claimed it
    claimed: HashMap<String, String>,
}

impl IdentityRegistry {
    pub fn new(parser: ArchiveNameParser) -> Self {
        Self {
            parser,
            claimed: HashMap::new(),
        }
    }

    /// Parse `raw_directory_name` and claim a unique file name for it
    pub fn register(&mut self, raw_directory_name: &str) -> StudentIdentity {
        let mut identity = self.parser.parse(raw_directory_name);

        if let Some(owner) = self.claimed.get(&identity.normalized_file_name) {
            let seed = match self.parser.opaque_id(raw_directory_name) {
                "" => raw_directory_name,
                id => id,
            };
            let hash = hex::encode(Sha256::digest(seed.as_bytes()));
            let base = format!(
                "{}_{}",
                identity.normalized_file_name,
                &hash[..DISAMBIGUATION_HASH_LEN]
            );

            let mut candidate = base.clone();
            let mut counter = 2;
            while self.claimed.contains_key(&candidate) {
                candidate = format!("{}_{}", base, counter);
                counter += 1;
            }

            warn!(
                "Duplicate identity {:?}: {:?} already claimed by {:?}, using {:?}",
                identity.normalized_file_name, raw_directory_name, owner, candidate
            );
            identity.normalized_file_name = candidate;
        }

        self.claimed.insert(
            identity.normalized_file_name.clone(),
            raw_directory_name.to_string(),
        );
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_surname_and_given_name() {
        let parser = ArchiveNameParser::default();
        let id = parser.parse("Last First_123456_assignsubmission_file_");

        assert_eq!(id.surname, "Last");
        assert_eq!(id.given_names, "First");
        assert_eq!(id.normalized_file_name, "Last_First");
    }

    #[test]
    fn test_parse_multiple_given_names() {
        let parser = ArchiveNameParser::default();
        let id = parser.parse("Doe Jane  Ann_42_assignsubmission_file_");

        assert_eq!(id.surname, "Doe");
        assert_eq!(id.given_names, "Jane Ann");
        assert_eq!(id.normalized_file_name, "Doe_Jane_Ann");
    }

    #[test]
    fn test_parse_without_given_names() {
        let parser = ArchiveNameParser::default();
        let id = parser.parse("Madonna_99");

        assert_eq!(id.surname, "Madonna");
        assert_eq!(id.given_names, "");
        assert_eq!(id.normalized_file_name, "Madonna_");
    }

    #[test]
    fn test_parse_without_delimiter() {
        let parser = ArchiveNameParser::new("--");
        let id = parser.parse("Smith John");

        assert_eq!(id.surname, "Smith");
        assert_eq!(id.given_names, "John");
        assert_eq!(parser.opaque_id("Smith John"), "");
        assert_eq!(parser.opaque_id("Smith John--abc"), "abc");
    }

    #[test]
    fn test_parse_round_trip_many_names() {
        let parser = ArchiveNameParser::default();
        for (last, first) in [("A", "B"), ("Müller", "Jörg"), ("O'Neil", "Sam")] {
            for suffix in ["", "1", "x_y_z"] {
                let raw = format!("{} {}_{}", last, first, suffix);
                let id = parser.parse(&raw);
                assert_eq!(id.surname, last);
                assert_eq!(id.given_names, first);
            }
        }
    }

    #[test]
    fn test_registry_keeps_unique_names() {
        let mut registry = IdentityRegistry::default();
        let a = registry.register("Doe Jane_1_file_");
        let b = registry.register("Roe Rick_2_file_");

        assert_eq!(a.normalized_file_name, "Doe_Jane");
        assert_eq!(b.normalized_file_name, "Roe_Rick");
    }

    #[test]
    fn test_registry_disambiguates_collisions_deterministically() {
        let mut registry = IdentityRegistry::default();
        let first = registry.register("Doe Jane_1_file_");
        let second = registry.register("Doe Jane_2_file_");

        assert_eq!(first.normalized_file_name, "Doe_Jane");
        assert_ne!(second.normalized_file_name, first.normalized_file_name);
        assert!(second.normalized_file_name.starts_with("Doe_Jane_"));
        assert_eq!(second.surname, "Doe");

        let mut again = IdentityRegistry::default();
        again.register("Doe Jane_1_file_");
        assert_eq!(
            again.register("Doe Jane_2_file_").normalized_file_name,
            second.normalized_file_name
        );
    }

    #[test]
    fn test_registry_same_raw_name_twice_gets_counter() {
        let mut registry = IdentityRegistry::default();
        let a = registry.register("Doe Jane_7");
        let b = registry.register("Doe Jane_7");
        let c = registry.register("Doe Jane_7");

        assert_eq!(a.normalized_file_name, "Doe_Jane");
        assert_ne!(b.normalized_file_name, c.normalized_file_name);
        assert!(c.normalized_file_name.ends_with("_2"));
    }
}
