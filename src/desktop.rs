//! Desktop environment choices offered on the desktop step.

use std::path::{Path, PathBuf};

use serde_json::Value;

/// One selectable desktop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Desktop {
    pub name: String,
    pub description: String,
    pub image_path: PathBuf,
    /// Passed to the scripts as `OSI_DESKTOP`
    pub keyword: String,
}

/// Parse the `desktop` config entries.
///
/// Entries need `name`, `keyword` and `image_path`; entries lacking one, or
/// whose image does not exist according to `image_exists`, are skipped.
pub fn parse_desktops(entries: &[Value], image_exists: impl Fn(&Path) -> bool) -> Vec<Desktop> {
    entries
        .iter()
        .filter_map(|entry| {
            let field = |key: &str| entry.get(key).and_then(Value::as_str);
            let (Some(name), Some(keyword), Some(image_path)) =
                (field("name"), field("keyword"), field("image_path"))
            else {
                log::warn!("Desktop choice not correctly configured: {}", entry);
                return None;
            };

            let image_path = PathBuf::from(image_path);
            if !image_exists(&image_path) {
                log::warn!("Could not find desktop image {:?}", image_path);
                return None;
            }

            Some(Desktop {
                name: name.to_string(),
                description: field("description").unwrap_or_default().to_string(),
                image_path,
                keyword: keyword.to_string(),
            })
        })
        .collect()
}
