//! Format autodetection (`spec.md` §4.3): examine extension, then file
//! signature bytes, then companion config files. Detection is advisory
//! only — the descriptor's own `format` field always wins; this is used
//! by tooling (e.g. `router register --source <path>`) to suggest one.

use std::path::Path;

use crate::model::descriptor::ModelFormat;

/// Magic byte prefixes for formats with a recognizable header.
const GGUF_MAGIC: &[u8] = b"GGUF";
const ONNX_MAGIC: &[u8] = &[0x08]; // ONNX protobuf files commonly start with a small varint field tag.

/// Best-effort guess from a path alone (no filesystem access). Returns
/// `None` if nothing matches, leaving the caller to fall back to a
/// default or ask the user.
pub fn detect_by_extension(path: &Path) -> Option<ModelFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "gguf" => Some(ModelFormat::Gguf),
        "onnx" => Some(ModelFormat::Onnx),
        "safetensors" => Some(ModelFormat::SafeTensors),
        "pt" | "pth" => Some(ModelFormat::PyTorch),
        "bin" => Some(ModelFormat::Binary),
        "bitnet" => Some(ModelFormat::BitNet),
        _ => None,
    }
}

/// Inspects up to the first 16 bytes for a known signature. Intended to
/// disambiguate extensionless files or confirm an extension-based guess.
pub fn detect_by_signature(bytes: &[u8]) -> Option<ModelFormat> {
    if bytes.starts_with(GGUF_MAGIC) {
        return Some(ModelFormat::Gguf);
    }
    if bytes.len() >= ONNX_MAGIC.len() && bytes.starts_with(ONNX_MAGIC) {
        return Some(ModelFormat::Onnx);
    }
    None
}

/// Presence of a companion file (e.g. `config.json` next to a
/// `pytorch_model.bin`) is the last, weakest signal — it only narrows
/// between formats that already passed extension/signature checks.
pub fn has_companion_config(model_path: &Path) -> bool {
    model_path
        .parent()
        .map(|dir| dir.join("config.json").exists())
        .unwrap_or(false)
}

/// Runs the full advisory pipeline: extension, then signature, then
/// companion file as a disambiguating hint folded into the caller's
/// final decision (this function itself only returns the first two
/// stages' best guess, since companion-file presence doesn't name a
/// format by itself).
pub fn detect(path: &Path, header: &[u8]) -> Option<ModelFormat> {
    detect_by_extension(path).or_else(|| detect_by_signature(header))
}
