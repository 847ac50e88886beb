use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Addresses one session log: `<projects_dir>/<dir_name>/<file_name>`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub dir_name: String,
    pub file_name: String,
}

impl SessionIdentity {
    pub fn new(dir_name: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            dir_name: dir_name.into(),
            file_name: file_name.into(),
        }
    }

    /// Both parts must be a single, plain path component.
    pub fn is_well_formed(&self) -> bool {
        is_plain_component(&self.dir_name) && is_plain_component(&self.file_name)
    }

    /// File name without the `.jsonl` extension; Claude uses it as the session id.
    pub fn session_id(&self) -> &str {
        self.file_name
            .strip_suffix(".jsonl")
            .unwrap_or(&self.file_name)
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dir_name, self.file_name)
    }
}

fn is_plain_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Length plus SHA-256 of the log text a caller has read.
///
/// A mutation that carries a fingerprint only proceeds while the live log still starts with
/// exactly those bytes. Appends made after the read are allowed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogFingerprint {
    pub len: u64,
    pub sha256: String,
}

impl LogFingerprint {
    pub fn of(log: impl AsRef<[u8]>) -> Self {
        let log = log.as_ref();
        Self {
            len: log.len() as u64,
            sha256: sha256_hex(log),
        }
    }

    pub fn is_prefix_of(&self, current: impl AsRef<[u8]>) -> bool {
        let Ok(len) = usize::try_from(self.len) else {
            return false;
        };
        match current.as_ref().get(..len) {
            Some(prefix) => sha256_hex(prefix) == self.sha256,
            None => false,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_like_identities() {
        assert!(SessionIdentity::new("-tmp-project", "abc.jsonl").is_well_formed());
        assert!(!SessionIdentity::new("..", "abc.jsonl").is_well_formed());
        assert!(!SessionIdentity::new("p", "a/b.jsonl").is_well_formed());
        assert!(!SessionIdentity::new("", "abc.jsonl").is_well_formed());
    }

    #[test]
    fn fingerprint_accepts_appends_but_not_rewrites() {
        let fp = LogFingerprint::of("a\nb\n");
        assert!(fp.is_prefix_of("a\nb\n"));
        assert!(fp.is_prefix_of("a\nb\nc\n"));
        assert!(!fp.is_prefix_of("a\n"));
        assert!(!fp.is_prefix_of("a\nB\n"));
    }

    #[test]
    fn fingerprint_covers_undecodable_bytes() {
        let raw: &[u8] = b"a\n\xe2\x82";
        let fp = LogFingerprint::of(raw);
        assert_eq!(fp.len, 4);
        assert!(fp.is_prefix_of(b"a\n\xe2\x82\xacb\n"));
        assert!(!fp.is_prefix_of(String::from_utf8_lossy(raw).as_bytes()));
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn session_id_strips_extension() {
        let id = SessionIdentity::new("p", "1234.jsonl");
        assert_eq!(id.session_id(), "1234");
        assert_eq!(id.to_string(), "p/1234.jsonl");
    }

    #[test]
    fn identity_serializes_camel_case() {
        let id = SessionIdentity::new("p", "f.jsonl");
        let json = serde_json::to_value(&id).expect("json");
        assert_eq!(json, serde_json::json!({ "dirName": "p", "fileName": "f.jsonl" }));
    }
}
