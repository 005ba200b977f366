//! Module search protocol: name canonicalisation and candidate paths.

use std::path::{Path, PathBuf};

use crate::config::LoaderConfig;

const LIBRARY_EXTENSIONS: [&str; 8] = [".dll", ".exe", ".sys", ".drv", ".ax", ".acm", ".qts", ".xa"];

/* api set 重定向到对应的模拟库 */
const API_SET_ALIASES: [(&str, &str); 3] = [
    ("api-ms-win-crt-", "msvcrt.dll"),
    ("api-ms-win-core-", "kernel32.dll"),
    ("ext-ms-win-", "kernel32.dll"),
];

#[inline]
fn is_file_library(file: &str) -> bool {
    let lower = file.to_ascii_lowercase();
    LIBRARY_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// File-name part of a guest or host path (either separator).
pub fn file_name(path: &str) -> &str {
    path.rsplit(|c| c == '\\' || c == '/').next().unwrap_or(path)
}

/// Registry key for a module reference: lower-case file name with a
/// library extension, api-set names folded onto their implementation.
pub fn canonical_name(name: &str) -> String {
    let mut file = file_name(name).to_ascii_lowercase();
    for (prefix, target) in API_SET_ALIASES.iter() {
        if file.starts_with(prefix) {
            return (*target).to_owned();
        }
    }
    if !is_file_library(&file) {
        file.push_str(".dll");
    }
    file
}

/// Host paths to try for `name`, most specific first.
pub fn candidates(name: &str, referencing: Option<&Path>, config: &LoaderConfig) -> Vec<PathBuf> {
    let file = {
        let f = file_name(name);
        if is_file_library(f) {
            f.to_owned()
        } else {
            format!("{}.dll", f)
        }
    };
    let mut dirs: Vec<PathBuf> = Vec::new();
    let explicit = &name[..name.len() - file_name(name).len()];
    if !explicit.is_empty() {
        dirs.push(PathBuf::from(explicit.replace('\\', "/")));
    }
    if let Some(dir) = referencing.and_then(Path::parent) {
        dirs.push(dir.to_path_buf());
        // legacy plugin hosts keep codec helpers next to the plugin
        dirs.push(dir.join("codecs"));
    }
    dirs.extend(config.search_paths.iter().cloned());
    if dirs.is_empty() {
        dirs.push(PathBuf::from("."));
    }

    let mut out: Vec<PathBuf> = Vec::new();
    for dir in dirs {
        let path = dir.join(&file);
        if !out.contains(&path) {
            out.push(path);
        }
    }
    out
}
