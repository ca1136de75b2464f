//! Naming conventions shared by the pipeline and the HTTP layer: filename
//! sanitizing, sidecar names, served URLs and the extension → MIME table.

/// Longest asset name kept after sanitizing. Leaves room for the `.json`
/// suffix of attribute files within common filesystem limits.
pub const MAX_NAME_LEN: usize = 200;

/// Extension of caption sidecars.
pub const SIDECAR_EXTENSION: &str = "json";

const OCTET_STREAM: &str = "application/octet-stream";

/// Turn a client-supplied filename into a storage-safe asset name.
///
/// Non-ASCII characters are dropped, path separators and whitespace runs
/// collapse into `_`, anything outside `[A-Za-z0-9_.-]` is removed and
/// leading/trailing dots and underscores are stripped. The result may be
/// empty, which callers treat as "no file".
pub fn sanitize_filename(raw: &str) -> String {
    let ascii: String = raw
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");

    let filtered: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();

    cap_length(filtered.trim_matches(|c| c == '.' || c == '_'))
}

/// Shorten `name` to [`MAX_NAME_LEN`] by cutting the base, keeping the extension.
fn cap_length(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    match extension(name) {
        Some(ext) if ext.len() + 2 <= MAX_NAME_LEN => {
            let base = &base_name(name)[..MAX_NAME_LEN - ext.len() - 1];
            format!("{}.{}", base.trim_end_matches(['.', '_']), ext)
        }
        _ => name[..MAX_NAME_LEN].trim_end_matches(['.', '_']).to_string(),
    }
}

/// `cat.png` → `cat`, `archive.tar.gz` → `archive.tar`, `README` → `README`.
pub fn base_name(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((base, _)) if !base.is_empty() => base,
        _ => name,
    }
}

fn extension(name: &str) -> Option<&str> {
    match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

/// Name of the caption sidecar stored next to `name`.
pub fn sidecar_name(name: &str) -> String {
    format!("{}.{}", base_name(name), SIDECAR_EXTENSION)
}

/// Route an asset is served from.
pub fn asset_url(name: &str) -> String {
    format!("/images/{}", name)
}

/// Content type derived purely from the extension, case-insensitively.
pub fn content_type_for(name: &str) -> &'static str {
    let Some(ext) = extension(name) else {
        return OCTET_STREAM;
    };
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => OCTET_STREAM,
    }
}

/// MIME type announced to the vision model; unknown extensions are sent as JPEG.
pub fn image_mime_for(name: &str) -> &'static str {
    match content_type_for(name) {
        OCTET_STREAM => "image/jpeg",
        known => known,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_paths_and_unsafe_characters() {
        assert_eq!(sanitize_filename("cat.png"), "cat.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("My Holiday Photo.JPG"), "My_Holiday_Photo.JPG");
        assert_eq!(sanitize_filename("C:\\Users\\bob\\pic.gif"), "C_Users_bob_pic.gif");
        assert_eq!(sanitize_filename("naïve café.png"), "nave_caf.png");
        assert_eq!(sanitize_filename("we<ird>|na*me?.webp"), "weirdname.webp");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
    }

    #[test]
    fn sanitize_can_yield_empty_names() {
        assert_eq!(sanitize_filename(""), "");
        assert_eq!(sanitize_filename("../.."), "");
        assert_eq!(sanitize_filename("日本語"), "");
    }

    #[test]
    fn long_names_keep_their_extension() {
        let long = format!("{}.png", "a".repeat(300));
        let name = sanitize_filename(&long);
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(name.ends_with(".png"));
        assert_eq!(content_type_for(&name), "image/png");
        assert_eq!(sidecar_name(&name), format!("{}.json", "a".repeat(MAX_NAME_LEN - 4)));
    }

    #[test]
    fn long_names_without_extension_are_cut() {
        let name = sanitize_filename(&"b".repeat(500));
        assert_eq!(name, "b".repeat(MAX_NAME_LEN));
    }

    #[test]
    fn sidecar_replaces_last_extension() {
        assert_eq!(sidecar_name("cat.png"), "cat.json");
        assert_eq!(sidecar_name("archive.tar.gz"), "archive.tar.json");
        assert_eq!(sidecar_name("README"), "README.json");
        assert_eq!(sidecar_name("notes.json"), "notes.json");
    }

    #[test]
    fn content_type_table() {
        assert_eq!(content_type_for("photo.JPG"), "image/jpeg");
        assert_eq!(content_type_for("photo.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("cat.png"), "image/png");
        assert_eq!(content_type_for("anim.gif"), "image/gif");
        assert_eq!(content_type_for("art.webp"), "image/webp");
        assert_eq!(content_type_for("scan.BMP"), "image/bmp");
        assert_eq!(content_type_for("data.xyz"), "application/octet-stream");
        assert_eq!(content_type_for("noextension"), "application/octet-stream");
    }

    #[test]
    fn model_mime_defaults_to_jpeg() {
        assert_eq!(image_mime_for("cat.png"), "image/png");
        assert_eq!(image_mime_for("blob.xyz"), "image/jpeg");
    }
}
