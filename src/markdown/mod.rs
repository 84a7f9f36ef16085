pub mod code;
pub mod cover;
pub mod images;
pub mod sanitize;
pub mod tags;

/// Body after the text-only stages, before any image is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub cover_url: Option<String>,
    pub tags: Vec<String>,
    pub body: String,
}

/// Three text passes: cover → tags → sanitize. Each pass sees the body the
/// previous one produced.
pub fn prepare(body: &str) -> Prepared {
    let (cover_url, body) = cover::extract_cover(body);
    let (tags, body) = tags::extract_tags(&body);
    let body = sanitize::sanitize(&body);
    Prepared {
        cover_url,
        tags,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_then_tags() {
        let p = prepare("text ![c](http://h/a.png)\nbody $tag1$");
        assert_eq!(p.cover_url.as_deref(), Some("http://h/a.png"));
        assert_eq!(p.tags, vec!["tag1"]);
        // The tag line is dropped whole; "text " loses its trailing space.
        assert_eq!(p.body, "text");
    }

    #[test]
    fn code_images_survive_every_stage() {
        let body = "```\n![x](http://h/x.png)\n<div>raw</div>\n```\n\nreal ![y](http://h/y.png)\n\n$a$";
        let p = prepare(body);
        assert_eq!(p.cover_url.as_deref(), Some("http://h/y.png"));
        assert_eq!(p.tags, vec!["a"]);
        assert_eq!(p.body, "```\n![x](http://h/x.png)\n<div>raw</div>\n```\n\nreal");
    }

    #[test]
    fn tag_line_in_open_fence() {
        let body = "intro\n```\ncode $x$";
        let p = prepare(body);
        assert!(p.cover_url.is_none());
        assert!(p.tags.is_empty());
        assert_eq!(p.body, body);
    }

    #[test]
    fn sanitize_runs_last() {
        let p = prepare("<center>hello</center>\n\n$t$");
        assert_eq!(p.body, "hello");
        assert_eq!(p.tags, vec!["t"]);
    }

    #[test]
    fn empty_body() {
        let p = prepare("");
        assert_eq!(
            p,
            Prepared {
                cover_url: None,
                tags: vec![],
                body: String::new(),
            }
        );
    }
}
