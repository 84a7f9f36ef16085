use super::code::CodeMap;
use super::images::MD_IMAGE_RE;

/// Pull the first image outside code out of the body.
///
/// Returns the image URL and the body with that image's markup removed. Images
/// inside code are skipped and left where they are. With no eligible image the
/// body comes back unchanged.
pub fn extract_cover(body: &str) -> (Option<String>, String) {
    let code = CodeMap::new(body);

    for caps in MD_IMAGE_RE.captures_iter(body) {
        let Some(m) = caps.get(0) else { continue };
        if code.contains(m.start()) {
            continue;
        }
        let url = caps[2].to_string();
        let mut rest = String::with_capacity(body.len() - m.len());
        rest.push_str(&body[..m.start()]);
        rest.push_str(&body[m.end()..]);
        return (Some(url), rest);
    }

    (None, body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_image_becomes_cover() {
        let body = "intro ![a](https://h/1.png) mid ![b](https://h/2.png)";
        let (cover, rest) = extract_cover(body);
        assert_eq!(cover.as_deref(), Some("https://h/1.png"));
        assert_eq!(rest, "intro  mid ![b](https://h/2.png)");
    }

    #[test]
    fn no_image_leaves_body() {
        let body = "just words\nand more";
        let (cover, rest) = extract_cover(body);
        assert!(cover.is_none());
        assert_eq!(rest, body);
    }

    #[test]
    fn image_in_fence_is_skipped() {
        let body = "```\n![x](http://h/code.png)\n```\n\ntext ![y](http://h/real.png)";
        let (cover, rest) = extract_cover(body);
        assert_eq!(cover.as_deref(), Some("http://h/real.png"));
        assert!(rest.contains("![x](http://h/code.png)"));
        assert!(!rest.contains("real.png"));
    }

    #[test]
    fn only_code_images_means_no_cover() {
        let body = "`![x](http://h/a.png)` and\n```\n![y](http://h/b.png)\n```";
        let (cover, rest) = extract_cover(body);
        assert!(cover.is_none());
        assert_eq!(rest, body);
    }

    #[test]
    fn relative_images_are_not_covers() {
        let body = "![local](pic.png)";
        let (cover, _) = extract_cover(body);
        assert!(cover.is_none());
    }

    #[test]
    fn alt_text_may_be_empty() {
        let (cover, rest) = extract_cover("![](http://h/a.jpg)\nbody");
        assert_eq!(cover.as_deref(), Some("http://h/a.jpg"));
        assert_eq!(rest, "\nbody");
    }
}
