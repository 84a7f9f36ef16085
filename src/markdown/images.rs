use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;

/// `![alt](http(s)://...)`, as used for cover detection.
pub static MD_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[([^\]]*?)\]\((https?://[^)]+)\)").unwrap());

/// Same shape as [`MD_IMAGE_RE`], scheme matched case-insensitively.
pub static MD_IMAGE_ANY_CASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)!\[([^\]]*?)\]\((https?://[^)]+)\)").unwrap());

/// A whole `<img ...>` tag whose `src` is an absolute http(s) URL.
pub static HTML_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']?(https?://[^"'>\s]+)["']?[^>]*>"#).unwrap()
});

static ALT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\balt\s*=\s*["']?([^"'>]+)["']?"#).unwrap());

static QUERY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\?.*$").unwrap());
static UNSAFE_CHAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());

/// Extensions kept from the URL; anything else is replaced after download.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Default extension when neither URL nor content type names an image type.
pub const FALLBACK_EXTENSION: &str = "jpg";

pub const MAX_FILENAME_LEN: usize = 100;

/// Room kept for an extension that is only known after download (".webp").
const DEFERRED_EXTENSION_RESERVE: usize = 5;

/// Alt text of an `<img>` tag, or "Image".
pub fn html_alt(tag: &str) -> String {
    ALT_RE
        .captures(tag)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| "Image".to_string())
}

/// Lower-cased accepted extension of a file name, if it has one.
pub fn accepted_extension(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Extension for a response content type.
pub fn extension_for_content_type(content_type: &str) -> &'static str {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("image/png") {
        "png"
    } else if ct.contains("image/jpeg") {
        "jpg"
    } else if ct.contains("image/gif") {
        "gif"
    } else if ct.contains("image/webp") {
        "webp"
    } else {
        FALLBACK_EXTENSION
    }
}

/// Safe local file name for a remote image URL, `{prefix}{stem}[.ext]`.
///
/// The query string is dropped and the basename percent-decoded. Every character
/// of the stem outside `[A-Za-z0-9_-]` becomes `_`. The extension is kept only if
/// it is a known image type; otherwise it is left off and decided from the
/// response. The whole name fits in [`MAX_FILENAME_LEN`], with room reserved for
/// a deferred extension.
pub fn local_filename(prefix: &str, url: &str) -> String {
    let path = QUERY_RE.replace(url, "");
    let basename = path.rsplit('/').next().unwrap_or_default();
    let decoded = percent_decode_str(basename).decode_utf8_lossy();

    let (stem, ext) = match decoded.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (decoded.as_ref(), None),
    };
    let ext = ext
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| IMAGE_EXTENSIONS.contains(&e.as_str()));

    let safe_stem = UNSAFE_CHAR_RE.replace_all(stem, "_");

    let suffix_len = match &ext {
        Some(e) => e.len() + 1,
        None => DEFERRED_EXTENSION_RESERVE,
    };
    let budget = MAX_FILENAME_LEN.saturating_sub(prefix.len() + suffix_len);
    let safe_stem: String = safe_stem.chars().take(budget).collect();

    match ext {
        Some(e) => format!("{prefix}{safe_stem}.{e}"),
        None => format!("{prefix}{safe_stem}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_is_stripped_and_extension_normalized() {
        let name = local_filename("42_", "https://x/y/pic.PNG?a=1");
        assert_eq!(name, "42_pic.png");
        assert!(name.len() <= MAX_FILENAME_LEN);
    }

    #[test]
    fn percent_decoding_then_replacement() {
        let name = local_filename("1_", "https://h/a%20b%2Bc.jpg");
        assert_eq!(name, "1_a_b_c.jpg");
    }

    #[test]
    fn non_ascii_chars_become_underscores() {
        let name = local_filename("1_", "https://h/%E5%9B%BE.gif");
        assert_eq!(name, "1__.gif");
    }

    #[test]
    fn unknown_extension_is_dropped() {
        assert_eq!(local_filename("7_", "https://h/file.svg"), "7_file");
        assert_eq!(local_filename("7_", "https://h/archive.tar.gz"), "7_archive_tar");
    }

    #[test]
    fn no_extension() {
        let name = local_filename("9_", "https://user-images.example.com/assets/abc-123");
        assert_eq!(name, "9_abc-123");
    }

    #[test]
    fn long_names_are_capped() {
        let url = format!("https://h/{}.jpeg", "a".repeat(300));
        let name = local_filename("123_", &url);
        assert_eq!(name.len(), MAX_FILENAME_LEN);
        assert!(name.ends_with(".jpeg"));

        let url = format!("https://h/{}", "b".repeat(300));
        let name = local_filename("123_", &url);
        assert_eq!(name.len() + DEFERRED_EXTENSION_RESERVE, MAX_FILENAME_LEN);
    }

    #[test]
    fn dotfile_keeps_its_name() {
        assert_eq!(local_filename("", "https://h/.png"), "_png");
    }

    #[test]
    fn accepted_extensions() {
        assert_eq!(accepted_extension("a.JPG").as_deref(), Some("jpg"));
        assert_eq!(accepted_extension("a.webp").as_deref(), Some("webp"));
        assert_eq!(accepted_extension("a.bmp"), None);
        assert_eq!(accepted_extension("noext"), None);
    }

    #[test]
    fn content_type_mapping() {
        assert_eq!(extension_for_content_type("image/png"), "png");
        assert_eq!(extension_for_content_type("Image/JPEG; charset=binary"), "jpg");
        assert_eq!(extension_for_content_type("image/gif"), "gif");
        assert_eq!(extension_for_content_type("image/webp"), "webp");
        assert_eq!(extension_for_content_type("application/octet-stream"), "jpg");
        assert_eq!(extension_for_content_type(""), "jpg");
    }

    #[test]
    fn html_image_matches_whole_tag() {
        let text = r#"a <img alt="pic" src="https://h/i.png" width="20"/> b"#;
        let caps = HTML_IMAGE_RE.captures(text).unwrap();
        assert_eq!(&caps[1], "https://h/i.png");
        assert!(caps[0].ends_with("/>"));
        assert_eq!(html_alt(&caps[0]), "pic");
    }

    #[test]
    fn html_image_without_alt() {
        let text = "<IMG SRC=http://h/i.gif>";
        let caps = HTML_IMAGE_RE.captures(text).unwrap();
        assert_eq!(&caps[1], "http://h/i.gif");
        assert_eq!(html_alt(&caps[0]), "Image");
    }

    #[test]
    fn relative_html_image_is_ignored() {
        assert!(HTML_IMAGE_RE.captures(r#"<img src="local.png">"#).is_none());
    }

    #[test]
    fn markdown_scheme_case() {
        assert!(!MD_IMAGE_RE.is_match("![a](HTTP://h/x.png)"));
        assert!(MD_IMAGE_ANY_CASE_RE.is_match("![a](HTTP://h/x.png)"));
    }
}
