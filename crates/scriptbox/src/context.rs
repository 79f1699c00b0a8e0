use dashmap::DashMap;

use crate::value::Value;

pub const PROFILE: &str = "profile";
pub const DEFAULT_PROFILE: &str = "test";

/// Per-sandbox key/value store shared by every call path of one sandbox.
#[derive(Debug, Default)]
pub struct ContextStore {
    values: DashMap<String, Value>,
}

impl ContextStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Store a value under a name qualified by a type tag, so that providers
    /// can keep e.g. a `db` connection and a `db` config side by side.
    pub fn set_typed(&self, name: &str, type_name: &str, value: impl Into<Value>) {
        self.values.insert(typed_key(name, type_name), value.into());
    }

    #[must_use]
    pub fn get_typed(&self, name: &str, type_name: &str) -> Option<Value> {
        self.get(&typed_key(name, type_name))
    }

    /// Snapshot of every entry, sorted by key.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Value)> {
        let mut out: Vec<_> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Replace every `{name}` in `template` with the stored value. Names with
    /// no printable value render as `!name`.
    #[must_use]
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|c| open + c) else {
                break;
            };
            out.push_str(&rest[..open]);
            let name = &rest[open + 1..close];
            match self.get(name).and_then(|v| v.to_template_string()) {
                Some(v) => out.push_str(&v),
                None => {
                    out.push('!');
                    out.push_str(name);
                }
            }
            rest = &rest[close + 1..];
        }
        out.push_str(rest);
        out
    }
}

fn typed_key(name: &str, type_name: &str) -> String {
    format!("<{type_name}>{name}")
}
