//! RSS 2.0 feed of a tenant's published posts.

use chrono::{DateTime, Utc};

use crate::models::{content::Post, tenant::Tenant};

pub const FEED_CONTENT_TYPE: &str = "application/rss+xml; charset=utf-8";

/// Characters of post content carried in an item description.
const EXCERPT_CHARS: usize = 300;

const DEFAULT_DESCRIPTION: &str = "A blog hosted on blog-tenancy";

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn excerpt(post: &Post) -> String {
    if let Some(meta) = post.meta_description.as_deref().filter(|m| !m.is_empty()) {
        return meta.to_string();
    }
    let mut chars = post.content.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Render the channel for `blog`. `site_url` is the tenant origin without a
/// trailing slash, e.g. `https://demo.example.com`.
pub fn render_feed(blog: &Tenant, posts: &[Post], site_url: &str, built_at: DateTime<Utc>) -> String {
    let site_url = site_url.trim_end_matches('/');
    let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><rss version="2.0"><channel>"#);
    xml.push_str(&format!("<title>{}</title>", xml_escape(&blog.name)));
    xml.push_str(&format!("<link>{}</link>", xml_escape(site_url)));
    xml.push_str(&format!(
        "<description>{}</description>",
        xml_escape(blog.description.as_deref().unwrap_or(DEFAULT_DESCRIPTION))
    ));
    xml.push_str("<language>en</language>");
    xml.push_str(&format!("<lastBuildDate>{}</lastBuildDate>", built_at.to_rfc2822()));

    for post in posts {
        let link = xml_escape(&format!("{site_url}/posts/{}", post.slug));
        xml.push_str("<item>");
        xml.push_str(&format!("<title>{}</title>", xml_escape(&post.title)));
        xml.push_str(&format!("<link>{link}</link>"));
        xml.push_str(&format!(r#"<guid isPermaLink="true">{link}</guid>"#));
        xml.push_str(&format!("<pubDate>{}</pubDate>", post.created_at.to_rfc2822()));
        xml.push_str(&format!("<description>{}</description>", xml_escape(&excerpt(post))));
        xml.push_str("</item>");
    }

    xml.push_str("</channel></rss>");
    xml
}
