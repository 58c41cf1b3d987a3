//! Text records of the session files.
//!
//! Every file is made of `key=value` fields separated by commas, one record
//! per line. Parsing is schema driven and fails closed: unknown, missing or
//! duplicated fields are rejected.

pub mod catalogue;
pub mod descriptor;
pub mod profile;

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z_]*$").expect("valid key pattern"))
}

/// Parse hex strings with or without `0x` prefix to u64 values
pub fn parse_hex(s: &str) -> Result<u64, String> {
    let cleaned = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(cleaned, 16).map_err(|e| format!("'{}' is not a valid hex number: {}", s, e))
}

/// One ordered `key=value` record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, builder style.
    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    /// Appends a field only if the value is present.
    pub fn with_opt<T: fmt::Display>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(key, _)| key.as_str())
    }

    pub fn raw(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_str())
    }

    /// Returns a required field parsed as `T`.
    pub fn get<T>(&self, key: &str) -> Result<T, String>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self
            .raw(key)
            .ok_or_else(|| format!("missing field '{}'", key))?;
        raw.parse::<T>()
            .map_err(|e| format!("field '{}' has invalid value '{}': {}", key, raw, e))
    }

    /// Returns an optional field parsed as `T`.
    pub fn get_opt<T>(&self, key: &str) -> Result<Option<T>, String>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.raw(key) {
            Some(_) => self.get(key).map(Some),
            None => Ok(None),
        }
    }

    /// Returns an optional hex field.
    pub fn get_hex_opt(&self, key: &str) -> Result<Option<u64>, String> {
        self.raw(key)
            .map(|raw| parse_hex(raw).map_err(|e| format!("field '{}': {}", key, e)))
            .transpose()
    }

    fn rename(&mut self, from: &str, to: &str) {
        for (key, _) in self.fields.iter_mut() {
            if *key == from {
                *key = to.to_string();
            }
        }
    }
}

impl FromStr for Record {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err("empty record".to_string());
        }
        let mut record = Record::new();
        for field in line.split(',') {
            let field = field.trim();
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| format!("field '{}' is not of the form key=value", field))?;
            let (key, value) = (key.trim(), value.trim());
            if !key_pattern().is_match(key) {
                return Err(format!("invalid field name '{}'", key));
            }
            if value.is_empty() {
                return Err(format!("field '{}' has no value", key));
            }
            if record.raw(key).is_some() {
                return Err(format!("duplicate field '{}'", key));
            }
            record.fields.push((key.to_string(), value.to_string()));
        }
        Ok(record)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (key, value)) in self.fields.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// Field layout accepted for one kind of record.
#[derive(Clone, Copy, Debug)]
pub struct Schema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
    /// Alternative spellings, rewritten to their canonical name before validation.
    pub aliases: &'static [(&'static str, &'static str)],
}

impl Schema {
    /// Parses `line` and checks it against the schema.
    pub fn parse(&self, line: &str) -> Result<Record, String> {
        let mut record: Record = line.parse()?;
        for (alias, canonical) in self.aliases {
            if record.raw(alias).is_some() {
                if record.raw(canonical).is_some() {
                    return Err(format!(
                        "fields '{}' and '{}' are the same field",
                        alias, canonical
                    ));
                }
                record.rename(alias, canonical);
            }
        }
        let known = |key: &str| {
            self.required
                .iter()
                .chain(self.optional.iter())
                .any(|field| *field == key)
        };
        if let Some(unknown) = record.keys().find(|key| !known(*key)) {
            return Err(format!("unexpected field '{}'", unknown));
        }
        if let Some(missing) = self.required.iter().find(|key| record.raw(key).is_none()) {
            return Err(format!("missing field '{}'", missing));
        }
        Ok(record)
    }
}

/// Returns the only non-empty line of a single-record file.
pub fn single_line(content: &str) -> Result<&str, String> {
    let mut lines = content.lines().map(str::trim).filter(|line| !line.is_empty());
    let first = lines.next().ok_or_else(|| "file is empty".to_string())?;
    if lines.next().is_some() {
        return Err("file holds more than one record".to_string());
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: Schema = Schema {
        required: &["fi_index"],
        optional: &["thread"],
        aliases: &[("fi_thread", "thread")],
    };

    #[test]
    fn parse_and_print() {
        let record: Record = "thread=3, fi_index=17".parse().unwrap();
        assert_eq!(record.get::<u32>("thread").unwrap(), 3);
        assert_eq!(record.get::<u64>("fi_index").unwrap(), 17);
        assert_eq!(record.to_string(), "thread=3, fi_index=17");
    }

    #[test]
    fn whitespace_is_tolerated() {
        let record = SCHEMA.parse("  fi_index = 5 \n").unwrap();
        assert_eq!(record.get::<u64>("fi_index").unwrap(), 5);
    }

    #[test]
    fn schema_rejects_unknown_and_missing() {
        assert!(SCHEMA
            .parse("fi_index=1, rank=2")
            .unwrap_err()
            .contains("unexpected field 'rank'"));
        assert!(SCHEMA
            .parse("thread=1")
            .unwrap_err()
            .contains("missing field 'fi_index'"));
    }

    #[test]
    fn alias_is_canonicalized() {
        let record = SCHEMA.parse("fi_thread=2, fi_index=9").unwrap();
        assert_eq!(record.get::<u32>("thread").unwrap(), 2);
        assert!(SCHEMA.parse("fi_thread=2, thread=2, fi_index=9").is_err());
    }

    #[test]
    fn malformed_fields() {
        assert!("fi_index".parse::<Record>().is_err());
        assert!("fi_index=".parse::<Record>().is_err());
        assert!("fi_index=1, fi_index=2".parse::<Record>().is_err());
        assert!("FI-INDEX=1".parse::<Record>().is_err());
        assert!("".parse::<Record>().is_err());
    }

    #[test]
    fn invalid_values() {
        let record = SCHEMA.parse("fi_index=-4").unwrap();
        assert!(record.get::<u64>("fi_index").is_err());
    }

    #[test]
    fn hex_values() {
        assert_eq!(parse_hex("0x401a2f").unwrap(), 0x401a2f);
        assert_eq!(parse_hex("401A2F").unwrap(), 0x401a2f);
        assert!(parse_hex("0xzz").is_err());
    }

    #[test]
    fn single_record_files() {
        assert_eq!(single_line("\nfi_index=3\n\n").unwrap(), "fi_index=3");
        assert!(single_line("fi_index=3\nfi_index=4\n").is_err());
        assert!(single_line("  \n").is_err());
    }
}
