use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path};

/// One reaction kind a visitor can vote for. The category name doubles as
/// the document id of its counter record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Fire,
    Goat,
    Mid,
    Ass,
    Trash,
}

impl Category {
    /// Default display order.
    pub const ALL: [Category; 5] = [
        Category::Fire,
        Category::Goat,
        Category::Mid,
        Category::Ass,
        Category::Trash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Fire => "fire",
            Category::Goat => "goat",
            Category::Mid => "mid",
            Category::Ass => "ass",
            Category::Trash => "trash",
        }
    }

    pub fn glyph(&self) -> &'static str {
        match self {
            Category::Fire => "🔥",
            Category::Goat => "🐐",
            Category::Mid => "😐",
            Category::Ass => "🍑",
            Category::Trash => "🗑️",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::Fire => "Fire",
            Category::Goat => "Goat",
            Category::Mid => "Mid",
            Category::Ass => "Ass",
            Category::Trash => "Trash",
        }
    }

    /// Maps a counter document id back to its category. Unknown ids (from
    /// other writers sharing the collection) are ignored by the widget.
    pub fn from_id(id: &str) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.as_str() == id)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which categories the embedding application displays, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetConfig {
    pub categories: Vec<Category>,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            categories: Category::ALL.to_vec(),
        }
    }
}

impl WidgetConfig {
    /// Reads the configuration from a JSON file; a missing or malformed
    /// file falls back to the default category set.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read widget config from {}", path.display()))?;
            Ok(serde_json::from_str(&contents).unwrap_or_default())
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_lists_all_categories_in_order() {
        let config = WidgetConfig::default();
        assert_eq!(
            config.categories,
            vec![
                Category::Fire,
                Category::Goat,
                Category::Mid,
                Category::Ass,
                Category::Trash,
            ]
        );
    }

    #[test]
    fn category_ids_round_trip() {
        for category in Category::ALL {
            assert_eq!(Category::from_id(category.as_str()), Some(category));
        }
        assert_eq!(Category::from_id("legendary"), None);
    }

    #[test]
    fn categories_serialize_as_lowercase_ids() {
        assert_eq!(serde_json::to_string(&Category::Fire).unwrap(), "\"fire\"");
        let parsed: Category = serde_json::from_str("\"trash\"").unwrap();
        assert_eq!(parsed, Category::Trash);
    }

    #[test]
    fn missing_config_file_falls_back_to_default() {
        let config = WidgetConfig::load(Path::new("/nonexistent/ratebox.json")).unwrap();
        assert_eq!(config.categories.len(), 5);
    }
}
