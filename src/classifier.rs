//! File categorization for completed downloads.
//!
//! The engine only depends on the [`Categorize`] capability; the rule-based
//! [`FileClassifier`] is the default implementation, and tests plug in
//! [`NoopCategorizer`] to leave finished files where they landed.
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// Sorting capability invoked when a task completes. Failures are non-fatal:
/// the downloaded file simply stays in the save directory.
pub trait Categorize: Send + Sync {
    /// Category name for a file, derived from its name.
    fn classify(&self, file_name: &str) -> String;

    /// Move `file_path` into `<base_dir>/<category>/`. Returns whether the
    /// file was actually moved.
    fn move_to_category(&self, file_path: &Path, base_dir: &Path) -> bool;
}

/// Category used when no rule matches.
const FALLBACK_CATEGORY: &str = "other";

/// Extension-based classifier with runtime-updatable rules.
pub struct FileClassifier {
    /// category name -> extensions, each including the leading dot.
    rules: RwLock<HashMap<String, Vec<String>>>,
}

fn default_rules() -> HashMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 6] = [
        ("video", &[".mp4", ".avi", ".mkv", ".mov"]),
        ("audio", &[".mp3", ".flac", ".wav", ".aac"]),
        ("documents", &[".pdf", ".doc", ".docx", ".xls", ".xlsx"]),
        ("archives", &[".zip", ".rar", ".7z", ".tar.gz"]),
        ("programs", &[".exe", ".msi"]),
        ("images", &[".jpg", ".png", ".gif", ".bmp", ".webp"]),
    ];
    table
        .into_iter()
        .map(|(category, exts)| {
            (
                category.to_string(),
                exts.iter().map(|e| e.to_string()).collect(),
            )
        })
        .collect()
}

/// Lower-cased extension including the dot, with `.tar.gz` kept compound.
fn extract_extension(file_name: &str) -> String {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".tar.gz") {
        return ".tar.gz".to_string();
    }
    Path::new(&lower)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

impl FileClassifier {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(default_rules()),
        }
    }

    pub fn with_rules(rules: HashMap<String, Vec<String>>) -> Self {
        if rules.is_empty() {
            return Self::new();
        }
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Replace the rule set; affects all future classifications.
    pub fn update_rules(&self, rules: HashMap<String, Vec<String>>) {
        if !rules.is_empty() {
            *self.rules.write().unwrap() = rules;
        }
    }
}

impl Default for FileClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Categorize for FileClassifier {
    fn classify(&self, file_name: &str) -> String {
        let ext = extract_extension(file_name);
        if ext.is_empty() {
            return FALLBACK_CATEGORY.to_string();
        }

        let rules = self.rules.read().unwrap();
        for (category, extensions) in rules.iter() {
            if extensions.iter().any(|rule| rule.to_lowercase() == ext) {
                return category.clone();
            }
        }
        FALLBACK_CATEGORY.to_string()
    }

    fn move_to_category(&self, file_path: &Path, base_dir: &Path) -> bool {
        if !file_path.exists() {
            return false;
        }
        let Some(file_name) = file_path.file_name() else {
            return false;
        };

        let category = self.classify(&file_name.to_string_lossy());
        let dest_dir = base_dir.join(category);
        if std::fs::create_dir_all(&dest_dir).is_err() {
            return false;
        }
        std::fs::rename(file_path, dest_dir.join(file_name)).is_ok()
    }
}

/// Categorizer that classifies nothing and moves nothing. Keeps test
/// artifacts in place.
pub struct NoopCategorizer;

impl Categorize for NoopCategorizer {
    fn classify(&self, _file_name: &str) -> String {
        String::new()
    }

    fn move_to_category(&self, _file_path: &Path, _base_dir: &Path) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn known_extensions_classify() {
        let classifier = FileClassifier::new();
        assert_eq!(classifier.classify("movie.MP4"), "video");
        assert_eq!(classifier.classify("song.flac"), "audio");
        assert_eq!(classifier.classify("report.pdf"), "documents");
        assert_eq!(classifier.classify("bundle.tar.gz"), "archives");
        assert_eq!(classifier.classify("setup.exe"), "programs");
        assert_eq!(classifier.classify("photo.webp"), "images");
    }

    #[test]
    fn unknown_or_missing_extension_is_other() {
        let classifier = FileClassifier::new();
        assert_eq!(classifier.classify("mystery.xyz"), "other");
        assert_eq!(classifier.classify("README"), "other");
    }

    #[test]
    fn custom_rules_replace_defaults() {
        let classifier = FileClassifier::new();
        classifier.update_rules(HashMap::from([(
            "books".to_string(),
            vec![".epub".to_string()],
        )]));
        assert_eq!(classifier.classify("novel.epub"), "books");
        // Old rules are gone.
        assert_eq!(classifier.classify("movie.mp4"), "other");
    }

    #[test]
    fn move_creates_category_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("photo.png");
        std::fs::write(&file, b"png bytes").unwrap();

        let classifier = FileClassifier::new();
        assert!(classifier.move_to_category(&file, dir.path()));
        assert!(!file.exists());
        assert!(dir.path().join("images").join("photo.png").exists());
    }

    #[test]
    fn move_of_missing_file_fails_quietly() {
        let dir = tempdir().unwrap();
        let classifier = FileClassifier::new();
        assert!(!classifier.move_to_category(&dir.path().join("ghost.png"), dir.path()));
    }
}
