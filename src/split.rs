//! Splits a dumped JSON array into paginated part files plus an index of
//! `$ref` entries, for consumers that cannot swallow the bulk file whole.

use std::path::Path;

use log::debug;
use serde_json::{json, Value};
use tokio::fs;

use crate::error::DumpError;

/// Rewrite the array in `input` as `<stem>part-NNNNN.json` pages of
/// `page_size` elements under `out_dir`, with a `<stem>index.json` listing
/// them. The output directory is recreated from scratch; an empty input
/// array produces no directory at all. Returns the number of pages written.
pub async fn split_array(
    input: &Path,
    out_dir: &Path,
    stem: &str,
    page_size: usize,
) -> Result<usize, DumpError> {
    let page_size = page_size.max(1);
    let raw = fs::read_to_string(input).await?;
    let values: Vec<Value> = serde_json::from_str(&raw)?;

    if fs::metadata(out_dir).await.is_ok() {
        fs::remove_dir_all(out_dir).await?;
    }
    if values.is_empty() {
        debug!("nothing to split in {}", input.display());
        return Ok(0);
    }
    fs::create_dir_all(out_dir).await?;

    let mut index = Vec::new();
    for (page, chunk) in values.chunks(page_size).enumerate() {
        let chunk_name = format!("{stem}part-{page:05}.json");
        fs::write(out_dir.join(&chunk_name), serde_json::to_vec(chunk)?).await?;
        index.push(json!({ "$ref": format!("./{chunk_name}") }));
    }
    fs::write(
        out_dir.join(format!("{stem}index.json")),
        serde_json::to_vec(&index)?,
    )
    .await?;

    debug!(
        "split {} into {} pages under {}",
        input.display(),
        index.len(),
        out_dir.display()
    );
    Ok(index.len())
}
