use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::discovery::CompilerInfo;

/// One compile request bound to a resolved compiler
#[derive(Debug, Clone)]
pub struct CompilationJob {
    pub compiler: Arc<CompilerInfo>,
    pub source: String,

    /// User flags, passed after the compiler's configured options
    pub options: Vec<String>,

    /// Hex SHA-256 over the compiler id, options and source
    pub cache_key: String,

    /// Latest instant the job may still start
    pub deadline: Option<Instant>,
}

impl CompilationJob {
    pub fn new(compiler: Arc<CompilerInfo>, source: impl Into<String>, options: Vec<String>) -> Self {
        let source = source.into();
        let cache_key = cache_key(&compiler.id, &options, &source);
        Self {
            compiler,
            source,
            options,
            cache_key,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Stable key for identical inputs. Fields are NUL-separated so `["-O", "2"]` and `["-O2"]` differ.
pub fn cache_key(compiler_id: &str, options: &[String], source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(compiler_id.as_bytes());
    hasher.update([0]);
    for option in options {
        hasher.update(option.as_bytes());
        hasher.update([0]);
    }
    hasher.update([0]);
    hasher.update(source.as_bytes());

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_lowercase_hex() {
        let key = cache_key("gcc-12", &[], "int main(){}");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hex::decode(&key).unwrap().len(), 32);
    }

    #[test]
    fn option_boundaries_matter() {
        let split = cache_key("gcc-12", &["-O".to_owned(), "2".to_owned()], "x");
        let joined = cache_key("gcc-12", &["-O2".to_owned()], "x");
        assert_ne!(split, joined);
    }

    #[test]
    fn compiler_id_is_part_of_key() {
        assert_ne!(cache_key("gcc-12", &[], "x"), cache_key("gcc-13", &[], "x"));
    }
}
