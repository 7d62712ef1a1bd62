// 🔑 Comparison Keys - Normalized columns that tolerate spelling variation
//
// Derived on working copies of both sides of a merge (reference and
// supplemental) and never persisted. Example: `F4FN` = first four letters
// of the first name, so "CHRISTOPHER" and "CHRIS" share a key.

use crate::error::{LinkageError, Result};
use crate::table::{parse_year, Cell, Table};
use rphonetic::{Encoder, Soundex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// KEY SPEC
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyTransform {
    /// First n letters, uppercased
    Prefix(usize),

    /// Uppercased, every non-alphanumeric removed ("DE LA CRUZ" -> "DELACRUZ")
    Strip,

    /// American Soundex code
    Soundex,

    /// Canonical given name from the nickname dictionary
    Nickname,

    /// Year of a date or bare year
    Year,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Name of the derived column
    pub name: String,

    /// Column the key is computed from
    pub column: String,

    pub transform: KeyTransform,
}

impl KeySpec {
    pub fn new(name: &str, column: &str, transform: KeyTransform) -> Self {
        KeySpec {
            name: name.to_string(),
            column: column.to_string(),
            transform,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.column.trim().is_empty() {
            return Err(LinkageError::config("key: name and column are required"));
        }
        if self.transform == KeyTransform::Prefix(0) {
            return Err(LinkageError::config(format!(
                "key '{}': prefix length must be at least 1",
                self.name
            )));
        }
        Ok(())
    }

    /// Compute the key for one value
    pub fn apply(&self, value: &str, nicknames: &NicknameDictionary) -> Cell {
        let key = match &self.transform {
            KeyTransform::Prefix(n) => letters(value).chars().take(*n).collect::<String>(),
            KeyTransform::Strip => strip(value),
            KeyTransform::Soundex => soundex(value).unwrap_or_default(),
            KeyTransform::Nickname => nicknames.canonical(value),
            KeyTransform::Year => parse_year(value).map(|y| y.to_string()).unwrap_or_default(),
        };
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }
}

/// Add one derived column per key spec to `table`
pub fn derive_keys(table: &mut Table, keys: &[KeySpec], nicknames: &NicknameDictionary) -> Result<()> {
    for spec in keys {
        let col = table.require_column(&spec.column)?;
        let values: Vec<Cell> = (0..table.len())
            .map(|r| table.get(r, col).and_then(|v| spec.apply(v, nicknames)))
            .collect();
        table.add_column(&spec.name, values)?;
    }
    Ok(())
}

// ============================================================================
// NICKNAME DICTIONARY
// ============================================================================

/// Maps nickname forms ("BILL", "WILL") to a canonical given name ("WILLIAM")
#[derive(Debug, Clone, Default)]
pub struct NicknameDictionary {
    canonical: HashMap<String, String>,
}

impl NicknameDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a table with `name` and `nickname` columns
    pub fn from_table(table: &Table) -> Result<Self> {
        let name_col = table.require_column("name")?;
        let nick_col = table.require_column("nickname")?;

        let mut dictionary = NicknameDictionary::new();
        for row in 0..table.len() {
            if let (Some(name), Some(nick)) = (table.get(row, name_col), table.get(row, nick_col)) {
                dictionary.insert(name, nick);
            }
        }
        Ok(dictionary)
    }

    pub fn insert(&mut self, name: &str, nickname: &str) {
        self.canonical
            .entry(strip(nickname))
            .or_insert_with(|| strip(name));
    }

    /// Canonical form of `value`; unknown names map to themselves
    pub fn canonical(&self, value: &str) -> String {
        let key = strip(value);
        self.canonical.get(&key).cloned().unwrap_or(key)
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

fn letters(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphabetic())
        .flat_map(char::to_uppercase)
        .collect()
}

pub fn strip(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

/// American Soundex: first letter plus three digits; `None` without letters
pub fn soundex(value: &str) -> Option<String> {
    let code = Soundex::default().encode(value);
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_nicknames() -> NicknameDictionary {
        let mut dict = NicknameDictionary::new();
        dict.insert("WILLIAM", "BILL");
        dict.insert("William", "will");
        dict
    }

    #[test]
    fn test_soundex_reference_codes() {
        assert_eq!(soundex("Robert").as_deref(), Some("R163"));
        assert_eq!(soundex("Rupert").as_deref(), Some("R163"));
        assert_eq!(soundex("Ashcraft").as_deref(), Some("A261"));
        assert_eq!(soundex("Tymczak").as_deref(), Some("T522"));
        assert_eq!(soundex("Pfister").as_deref(), Some("P236"));
        assert_eq!(soundex("Lee").as_deref(), Some("L000"));
        assert_eq!(soundex("1234"), None);

        let dict = NicknameDictionary::new();
        let spec = KeySpec::new("last_name_SDX", "last_name", KeyTransform::Soundex);
        assert_eq!(spec.apply("Smith", &dict), spec.apply("Smyth", &dict));
        assert_eq!(spec.apply("Smith", &dict).as_deref(), Some("S530"));
        assert_eq!(spec.apply("--", &dict), None);
    }

    #[test]
    fn test_prefix_and_strip() {
        let dict = NicknameDictionary::new();
        let f4 = KeySpec::new("F4FN", "first_name", KeyTransform::Prefix(4));
        assert_eq!(f4.apply("O'Brien", &dict).as_deref(), Some("OBRI"));
        assert_eq!(f4.apply("Al", &dict).as_deref(), Some("AL"));
        assert_eq!(f4.apply("--", &dict), None);

        let ns = KeySpec::new("last_name_NS", "last_name", KeyTransform::Strip);
        assert_eq!(ns.apply("De La Cruz", &dict).as_deref(), Some("DELACRUZ"));
    }

    #[test]
    fn test_nickname_key() {
        let dict = create_test_nicknames();
        let spec = KeySpec::new("canonical_first", "first_name", KeyTransform::Nickname);
        assert_eq!(spec.apply("Bill", &dict).as_deref(), Some("WILLIAM"));
        assert_eq!(spec.apply("WILL", &dict).as_deref(), Some("WILLIAM"));
        assert_eq!(spec.apply("JAMES", &dict).as_deref(), Some("JAMES"));
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_year_key() {
        let dict = NicknameDictionary::new();
        let spec = KeySpec::new("appointed_year", "appointed_date", KeyTransform::Year);
        assert_eq!(spec.apply("1980-01-01", &dict).as_deref(), Some("1980"));
        assert_eq!(spec.apply("unknown", &dict), None);
    }

    #[test]
    fn test_derive_keys_adds_columns() {
        let mut table = Table::from_literals(
            "roster",
            &["first_name", "appointed_date"],
            &[&["Christopher", "1980-01-01"], &["", "1990-02-02"]],
        )
        .unwrap();
        let keys = vec![
            KeySpec::new("F4FN", "first_name", KeyTransform::Prefix(4)),
            KeySpec::new("appointed_year", "appointed_date", KeyTransform::Year),
        ];
        derive_keys(&mut table, &keys, &NicknameDictionary::new()).unwrap();

        assert_eq!(table.value(0, "F4FN"), Some("CHRI"));
        assert_eq!(table.value(1, "F4FN"), None);
        assert_eq!(table.value(1, "appointed_year"), Some("1990"));
    }

    #[test]
    fn test_dictionary_from_table() {
        let table = Table::from_literals(
            "nicknames",
            &["name", "nickname"],
            &[&["ROBERT", "BOB"], &["ROBERT", "BOBBY"], &["", "X"]],
        )
        .unwrap();
        let dict = NicknameDictionary::from_table(&table).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.canonical("bobby"), "ROBERT");
    }

    #[test]
    fn test_invalid_key_spec() {
        assert!(KeySpec::new("F0", "first_name", KeyTransform::Prefix(0)).validate().is_err());
        assert!(KeySpec::new("", "first_name", KeyTransform::Strip).validate().is_err());
    }
}
