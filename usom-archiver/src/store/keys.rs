/// Key layout of one archive namespace.
///
/// Everything lives under a single prefix so that `clear_all` can find it with one pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Set of every known record id.
    pub fn ids(&self) -> String {
        format!("{}ids", self.prefix)
    }

    /// Hash holding one record's fields.
    pub fn record(&self, id: u64) -> String {
        format!("{}record:{id}", self.prefix)
    }

    /// JSON document describing the last completed ingestion.
    pub fn meta(&self) -> String {
        format!("{}meta", self.prefix)
    }

    /// JSON resume checkpoint of an in-progress ingestion.
    pub fn checkpoint(&self) -> String {
        format!("{}temp:data", self.prefix)
    }

    /// KEYS pattern matching the whole namespace. Glob characters in the prefix match
    /// literally.
    pub fn pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.prefix.len() + 1);
        for c in self.prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let keys = StoreKeys::new("usom:");
        assert_eq!(keys.ids(), "usom:ids");
        assert_eq!(keys.record(42), "usom:record:42");
        assert_eq!(keys.meta(), "usom:meta");
        assert_eq!(keys.checkpoint(), "usom:temp:data");
        assert_eq!(keys.pattern(), "usom:*");
    }

    #[test]
    fn test_pattern_escapes_glob_characters() {
        assert_eq!(StoreKeys::new("usom?").pattern(), r"usom\?*");
        assert_eq!(StoreKeys::new("a*[b]\\").pattern(), r"a\*\[b\]\\*");
    }
}
