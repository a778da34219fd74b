use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    Variable,
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolRef {
    pub name: String,
    pub kind: SymbolKind,
}

impl SymbolRef {
    pub fn variable(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: SymbolKind::Variable }
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: SymbolKind::Function }
    }
}

/// Read-only name lookup supplied by the container reader.
pub trait SymbolTable {
    fn resolve(&self, index: u32) -> Option<&SymbolRef>;

    fn string(&self, index: u32) -> Option<&str>;

    fn find(&self, name: &str, kind: SymbolKind) -> Option<u32>;

    fn find_string(&self, value: &str) -> Option<u32>;

    /// Object index for an object name used as an instance.
    fn find_object(&self, name: &str) -> Option<u32>;
}

/// In-memory symbol and string tables, typically deserialized from the
/// container reader's JSON dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbols {
    #[serde(default)]
    pub symbols: Vec<SymbolRef>,
    #[serde(default)]
    pub strings: Vec<String>,
    /// Object names, indexed by object id.
    #[serde(default)]
    pub objects: Vec<String>,
}

impl Symbols {
    pub fn new(symbols: Vec<SymbolRef>, strings: Vec<String>) -> Self {
        Self { symbols, strings, objects: Vec::new() }
    }

    pub fn with_objects(mut self, objects: Vec<String>) -> Self {
        self.objects = objects;
        self
    }
}

impl SymbolTable for Symbols {
    fn resolve(&self, index: u32) -> Option<&SymbolRef> {
        self.symbols.get(index as usize)
    }

    fn string(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    fn find(&self, name: &str, kind: SymbolKind) -> Option<u32> {
        self.symbols.iter().position(|s| s.kind == kind && s.name == name).map(|i| i as u32)
    }

    fn find_string(&self, value: &str) -> Option<u32> {
        self.strings.iter().position(|s| s == value).map(|i| i as u32)
    }

    fn find_object(&self, name: &str) -> Option<u32> {
        self.objects.iter().position(|o| o == name).map(|i| i as u32)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn lookups_respect_symbol_kind() {
        let s = Symbols::new(
            vec![SymbolRef::variable("x"), SymbolRef::function("x"), SymbolRef::variable("y")],
            vec!["hello".into()],
        );
        assert_eq!(s.find("x", SymbolKind::Function), Some(1));
        assert_eq!(s.find("y", SymbolKind::Variable), Some(2));
        assert_eq!(s.find("y", SymbolKind::Function), None);
        assert_eq!(s.string(0), Some("hello"));
        assert_eq!(s.find_string("hello"), Some(0));
        assert_eq!(s.resolve(9), None);
    }

    #[test]
    fn deserializes_from_json_dump() {
        let s: Symbols = serde_json::from_str(
            r#"{"symbols":[{"name":"show_message","kind":"Function"}],"strings":["hi"]}"#,
        )
        .unwrap();
        assert_eq!(s.resolve(0), Some(&SymbolRef::function("show_message")));
        assert_eq!(s.strings, vec!["hi".to_string()]);
        assert!(s.objects.is_empty());

        let s: Symbols = serde_json::from_str(r#"{"objects":["obj_wall","obj_player"]}"#).unwrap();
        assert_eq!(s.find_object("obj_player"), Some(1));
        assert_eq!(s.find_object("obj_door"), None);
    }
}
