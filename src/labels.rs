//! Class-name mapping stored next to the checkpoint.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{ClassifierError, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum LabelFile {
    Indexed(HashMap<String, String>),
    List(Vec<String>),
}

/// Reads the class names, ordered by class index.
///
/// The usual form is an object keyed by stringified indices
/// (`{"0": "edible", "1": "poisonous"}`); a plain array is accepted too.
pub fn load_labels(classes_path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = classes_path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| ClassifierError::io(path, e))?;
    let parsed: LabelFile = serde_json::from_str(&contents).map_err(|e| ClassifierError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;

    let invalid = |reason: String| ClassifierError::InvalidLabels {
        path: path.to_path_buf(),
        reason,
    };

    let labels = match parsed {
        LabelFile::List(names) => names,
        LabelFile::Indexed(mapping) => {
            let mut ordered = BTreeMap::new();
            for (key, name) in mapping {
                let index: usize = key
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("key '{key}' is not a class index")))?;
                if ordered.insert(index, name).is_some() {
                    return Err(invalid(format!("class index {index} appears twice")));
                }
            }
            ordered.into_values().collect()
        }
    };

    if labels.is_empty() {
        return Err(invalid("no classes listed".to_string()));
    }
    Ok(labels)
}
