use std::collections::HashSet;
use std::path::{Path, PathBuf};

const FALLBACK_NAME: &str = "downloaded_video";

/// Make `name` safe to use as a file or directory name.
///
/// Path separators and reserved characters become `-`, double quotes become `'`, control
/// characters are dropped and runs of whitespace collapse to one space. Trailing dots and
/// spaces are removed, so `.` and `..` never name the parent or current directory.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .filter_map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '<' | '>' | '|' => Some('-'),
            '"' => Some('\''),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// File names for one job's outputs inside `<root>/<title>/`.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    dir: PathBuf,
    title: String,
    used: HashSet<String>,
}

impl OutputLayout {
    pub fn new(root: &Path, title: &str) -> Self {
        let title = sanitize_filename(title);
        Self {
            dir: root.join(&title),
            title,
            used: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `T.mp4`
    pub fn container(&mut self) -> PathBuf {
        let stem = self.title.clone();
        self.unique(&stem, "mp4")
    }

    /// `T.<lang>.vtt`, falling back to `sub` when the rendition has no label.
    pub fn subtitle(&mut self, label: Option<&str>) -> PathBuf {
        let stem = format!("{}.{}", self.title, part(label, "sub"));
        self.unique(&stem, "vtt")
    }

    /// `T.audio.<lang-or-name>.m4a`
    pub fn extra_audio(&mut self, label: Option<&str>) -> PathBuf {
        let stem = format!("{}.audio.{}", self.title, part(label, "audio"));
        self.unique(&stem, "m4a")
    }

    fn unique(&mut self, stem: &str, ext: &str) -> PathBuf {
        let mut name = format!("{stem}.{ext}");
        let mut n = 2;
        while !self.used.insert(name.clone()) {
            name = format!("{stem}.{n}.{ext}");
            n += 1;
        }
        self.dir.join(name)
    }
}

fn part(label: Option<&str>, fallback: &str) -> String {
    match label.map(str::trim).filter(|l| !l.is_empty()) {
        Some(label) => sanitize_filename(label),
        None => fallback.to_string(),
    }
}
