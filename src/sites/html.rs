//! HTML 解析辅助：按候选选择器取文本/属性，收集链接。

use scraper::{ElementRef, Html, Selector};
use url::Url;

pub fn parse(html: &str) -> Html {
    Html::parse_document(html)
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// 合并连续空白。
pub fn clean_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn element_text(el: &ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<String>())
}

/// 依次尝试每个选择器，返回第一个非空文本。
pub fn first_text(doc: &Html, selectors: &[&str]) -> Option<String> {
    for css in selectors {
        let Some(sel) = selector(css) else { continue };
        if let Some(text) = doc
            .select(&sel)
            .map(|el| element_text(&el))
            .find(|t| !t.is_empty())
        {
            return Some(text);
        }
    }
    None
}

pub fn first_attr(doc: &Html, selectors: &[&str], attr: &str) -> Option<String> {
    for css in selectors {
        let Some(sel) = selector(css) else { continue };
        if let Some(v) = doc
            .select(&sel)
            .filter_map(|el| el.value().attr(attr))
            .map(str::trim)
            .find(|v| !v.is_empty())
        {
            return Some(v.to_string());
        }
    }
    None
}

/// `<meta property=..>` 或 `<meta name=..>` 的 content。
pub fn meta_content(doc: &Html, key: &str) -> Option<String> {
    let a = format!("meta[property='{key}']");
    let b = format!("meta[name='{key}']");
    first_attr(doc, &[a.as_str(), b.as_str()], "content")
}

/// `(href, 文本)` 列表，保持文档顺序。
pub fn links(doc: &Html, css: &str) -> Vec<(String, String)> {
    let Some(sel) = selector(css) else {
        return Vec::new();
    };
    doc.select(&sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?.trim();
            if href.is_empty() || href.starts_with("javascript:") || href == "#" {
                return None;
            }
            Some((href.to_string(), element_text(&el)))
        })
        .collect()
}

pub fn count(doc: &Html, css: &str) -> usize {
    selector(css).map(|sel| doc.select(&sel).count()).unwrap_or(0)
}

/// 相对链接补全为绝对地址。
pub fn absolutize(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(href.trim()).ok().map(String::from)
}

pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
        <meta property="og:image" content="https://img.test/c.jpg">
        </head><body>
        <h1>  凡人  修仙传 </h1>
        <ul><li><a href="/play/1_1_9.html">第一集</a></li>
        <li><a href="javascript:void(0)">x</a></li>
        <li><a href="play/1_2_9.html"> 第二集 </a></li></ul>
        </body></html>"#;

    #[test]
    fn extracts_text_attrs_and_links() {
        let doc = parse(PAGE);
        assert_eq!(first_text(&doc, &[".missing", "h1"]).as_deref(), Some("凡人 修仙传"));
        assert_eq!(meta_content(&doc, "og:image").as_deref(), Some("https://img.test/c.jpg"));
        let l = links(&doc, "a");
        assert_eq!(l.len(), 2);
        assert_eq!(l[1].1, "第二集");
        assert_eq!(
            absolutize("https://m.ting13.cc/youshengxiaoshuo/1/", &l[1].0).as_deref(),
            Some("https://m.ting13.cc/youshengxiaoshuo/1/play/1_2_9.html")
        );
    }
}
