use std::fmt;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::fetch::PageLink;

const PAGE_NUMBER_MARKERS: [&str; 4] = ["pagination", "page-numbers", "pager", "page-list"];
const NEXT_MARKERS: [&str; 4] = ["下一页", "下一篇", "next", "next-page"];
const LOAD_MORE_MARKERS: [&str; 5] = ["load-more", "loadmore", "view-more", "加载更多", "查看更多"];
const INFINITE_SCROLL_MARKERS: [&str; 3] = ["infinite-scroll", "lazy-load", "intersection-observer"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationType {
    PageNumber,
    NextButton,
    LoadMore,
    InfiniteScroll,
    None,
}

impl PaginationType {
    pub fn as_str(self) -> &'static str {
        match self {
            PaginationType::PageNumber => "page_number",
            PaginationType::NextButton => "next_button",
            PaginationType::LoadMore => "load_more",
            PaginationType::InfiniteScroll => "infinite_scroll",
            PaginationType::None => "none",
        }
    }
}

impl fmt::Display for PaginationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guess how a page paginates.
///
/// Checked in order: numbered pager markup, a "next" link, a load-more
/// control, infinite scroll hooks.
pub fn detect_pagination(html: &str, links: &[PageLink]) -> PaginationType {
    let lower = html.to_lowercase();

    if PAGE_NUMBER_MARKERS.iter().any(|m| lower.contains(m)) {
        return PaginationType::PageNumber;
    }

    let is_next = |text: &str, class: &str| {
        let (text, class) = (text.to_lowercase(), class.to_lowercase());
        NEXT_MARKERS.iter().any(|m| text.contains(m) || class.contains(m))
    };
    if links.iter().any(|l| is_next(&l.text, &l.class))
        || anchors(html).iter().any(|l| is_next(&l.text, &l.class))
    {
        return PaginationType::NextButton;
    }

    if LOAD_MORE_MARKERS.iter().any(|m| lower.contains(m)) {
        return PaginationType::LoadMore;
    }

    if INFINITE_SCROLL_MARKERS.iter().any(|m| lower.contains(m)) {
        return PaginationType::InfiniteScroll;
    }

    PaginationType::None
}

fn anchors(html: &str) -> Vec<PageLink> {
    let Ok(selector) = Selector::parse("a") else {
        return Vec::new();
    };
    Html::parse_document(html)
        .select(&selector)
        .map(|a| PageLink {
            href: a.value().attr("href").unwrap_or_default().to_string(),
            text: a.text().collect::<String>().trim().to_string(),
            class: a.value().attr("class").unwrap_or_default().to_string(),
        })
        .collect()
}
