//! Model-path auto-discovery, used when `--model` is omitted (spec.md §6
//! CLI surface implies a model must be resolved before `load_model` runs).
//! Grounded on the teacher's `cli/discovery.rs`, generalized from a single
//! hardcoded model family to any `.gguf` file under a handful of
//! conventional weight directories, largest/newest first.

use std::cmp::Ordering;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    size_bytes: u64,
    mtime: SystemTime,
}

fn is_gguf(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()).map(|s| s.eq_ignore_ascii_case("gguf")).unwrap_or(false)
}

fn candidate_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(home) = std::env::var("HOME") {
        roots.push(Path::new(&home).join(".cache").join("ember").join("weights"));
        roots.push(Path::new(&home).join(".ember").join("weights"));
    }

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    roots
}

fn collect_local_gguf_candidates(root: &Path, max_depth: usize, out: &mut Vec<Candidate>) {
    if max_depth < 1 {
        return;
    }
    let Ok(rd) = fs::read_dir(root) else { return };
    for entry in rd.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_file() {
            if is_gguf(&path) {
                tracing::trace!(path=%path.display(), "discovery: found a gguf file");
                out.push(Candidate {
                    path,
                    size_bytes: meta.len(),
                    mtime: meta.modified().unwrap_or(UNIX_EPOCH),
                });
            }
        } else if meta.is_dir() {
            collect_local_gguf_candidates(&path, max_depth - 1, out);
        }
    }
}

/// Best-effort scrape of an Ollama model store: manifests name layers by
/// digest, and the actual gguf blob lives at
/// `~/.ollama/models/blobs/sha256-<hex>`. Opt-in via `EMBER_SALVAGE_OLLAMA`
/// since it means trusting an external tool's directory layout.
fn collect_ollama_candidates(home: &Path, out: &mut Vec<Candidate>) {
    tracing::trace!(?home, "discovery: collecting ollama candidates");
    let library_root = home.join(".ollama").join("models").join("manifests").join("registry.ollama.ai").join("library");
    let Ok(models) = fs::read_dir(&library_root) else {
        return;
    };
    for model_entry in models.flatten() {
        let Ok(tags) = fs::read_dir(model_entry.path()) else { continue };
        for tag_entry in tags.flatten() {
            let manifest_path = tag_entry.path();
            let Ok(meta) = fs::metadata(&manifest_path) else { continue };
            if !meta.is_file() {
                continue;
            }
            let Ok(file) = fs::File::open(&manifest_path) else { continue };
            let reader = BufReader::new(file);
            let Ok(json) = serde_json::from_reader::<_, serde_json::Value>(reader) else { continue };
            let layers = json.get("layers").and_then(|v| v.as_array()).cloned().unwrap_or_default();
            for layer in layers {
                let media_type = layer.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");
                if media_type != "application/vnd.ollama.image.model" {
                    continue;
                }
                let size = layer.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
                if size == 0 {
                    continue;
                }
                let Some(digest) = layer.get("digest").and_then(|v| v.as_str()) else { continue };
                let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
                let blob_path = home.join(".ollama").join("models").join("blobs").join(format!("sha256-{hex}"));
                let (mtime, size_bytes) = match fs::metadata(&blob_path) {
                    Ok(bm) => (bm.modified().unwrap_or(UNIX_EPOCH), bm.len()),
                    Err(_) => (meta.modified().unwrap_or(UNIX_EPOCH), size),
                };
                out.push(Candidate { path: blob_path, size_bytes, mtime });
            }
        }
    }
}

/// Pick the largest (then newest) `.gguf` under the conventional weight
/// directories. Returns `None` when nothing is found, in which case the
/// caller must surface a clear "pass --model" error.
pub fn choose_best_model_path() -> Option<PathBuf> {
    let mut candidates: Vec<Candidate> = Vec::new();

    if std::env::var("EMBER_SALVAGE_OLLAMA").is_ok() {
        if let Ok(home) = std::env::var("HOME") {
            collect_ollama_candidates(Path::new(&home), &mut candidates);
        }
    }

    for root in candidate_roots() {
        collect_local_gguf_candidates(&root, 4, &mut candidates);
    }

    if candidates.is_empty() {
        return None;
    }

    candidates.sort_by(|a, b| match b.size_bytes.cmp(&a.size_bytes) {
        Ordering::Equal => b.mtime.cmp(&a.mtime),
        other => other,
    });

    candidates.into_iter().next().map(|c| c.path)
}
