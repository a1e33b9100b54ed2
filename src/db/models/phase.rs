use serde::{Deserialize, Serialize};

/// One named, colored role in the repeating annotation template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub shortcut: Option<char>,
    /// Position inside the template. Contiguous from 0 once normalized.
    #[serde(default)]
    pub order: Option<usize>,
}

impl Phase {
    pub fn new(id: &str, name: &str, color: &str, shortcut: char, order: usize) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            color: color.to_string(),
            shortcut: Some(shortcut),
            order: Some(order),
        }
    }

    pub fn matches_shortcut(&self, key: char) -> bool {
        self.shortcut
            .map(|shortcut| shortcut.eq_ignore_ascii_case(&key))
            .unwrap_or(false)
    }
}
