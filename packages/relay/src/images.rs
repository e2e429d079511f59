use std::path::PathBuf;

use base64::Engine as _;
use serde_json::Value;
use tempfile::TempDir;

use claude_relay_error::RelayError;

/// Images decoded from a request, parked on disk for the CLI.
///
/// The directory (and everything in it) is removed when this is dropped,
/// which covers child close, errors, and cancellation alike.
#[derive(Debug)]
pub struct ExtractedImages {
    pub dir: TempDir,
    pub paths: Vec<PathBuf>,
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// Decode every base64 image block in `blocks` to a temp file.
///
/// Returns `None` when there are no image blocks, so text-only requests never
/// touch the filesystem.
pub fn extract_images(blocks: &[Value]) -> Result<Option<ExtractedImages>, RelayError> {
    let sources: Vec<(&str, &str)> = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("image"))
        .filter_map(|block| {
            let source = block.get("source")?;
            if source.get("type").and_then(Value::as_str) != Some("base64") {
                return None;
            }
            let media_type = source.get("media_type").and_then(Value::as_str)?;
            let data = source.get("data").and_then(Value::as_str)?;
            Some((media_type, data))
        })
        .collect();

    if sources.is_empty() {
        return Ok(None);
    }

    let dir = TempDir::new()?;
    let mut paths = Vec::with_capacity(sources.len());
    for (i, (media_type, data)) in sources.into_iter().enumerate() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|err| RelayError::invalid_request(format!("invalid base64 image data: {err}")))?;
        let path = dir
            .path()
            .join(format!("image-{i}.{}", extension_for(media_type)));
        std::fs::write(&path, bytes)?;
        paths.push(path);
    }

    Ok(Some(ExtractedImages { dir, paths }))
}

/// Append extracted image paths to the prompt so the CLI can read them.
pub fn append_image_paths(prompt: &str, images: &ExtractedImages) -> String {
    let mut out = prompt.to_string();
    for path in &images.paths {
        out.push_str(&format!("\n[Attached image: {}]", path.display()));
    }
    out
}
