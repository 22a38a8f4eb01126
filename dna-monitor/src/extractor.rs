use ego_tree::NodeId;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use url::Url;

use crate::types::{
    ExtractionConfig, ExtractionError, Measurements, MonitorError, ProfileStatus, Result,
    TitlePattern, TitleProfile,
};

const SUPERLATIVES: &[&str] = &[
    "best", "worst", "most", "least", "greatest", "biggest", "smallest", "fastest", "slowest",
    "top", "ultimate",
];

const QUESTION_OPENERS: &[&str] = &["how to", "how do", "why ", "what ", "when ", "where "];

const AUTHORITY_MARKERS: &[&str] = &["scientists", "new study", "research", "discovery"];

const VIDEO_HOSTS: &[&str] = &["youtube.com", "youtube-nocookie.com", "youtu.be", "vimeo.com", "dailymotion.com"];

const IMAGE_FORMATS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "avif", "svg"];

/// Outcome of measuring one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageAnalysis {
    pub status: ProfileStatus,
    pub measurements: Measurements,
}

/// Visible text length and element nesting below one element.
#[derive(Debug, Clone, Copy, Default)]
struct SubtreeStats {
    text_len: usize,
    depth: usize,
}

/// Per-element stats for every element outside an excluded subtree, built in
/// one iterative pass so page nesting never turns into stack depth.
struct DomStats {
    elements: HashMap<NodeId, SubtreeStats>,
    hidden: HashSet<NodeId>,
}

struct Selectors {
    body: Selector,
    img: Selector,
    video: Selector,
    iframe: Selector,
    ld_json: Selector,
    itemscope: Selector,
    headings: Selector,
    anchors: Selector,
    webp_source: Selector,
    page_title: Selector,
    meta_description: Selector,
    meta_viewport: Selector,
    meta_author: Selector,
    meta_section: Selector,
    meta_tag: Selector,
    meta_keywords: Selector,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| MonitorError::InvalidSelector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

impl Selectors {
    fn new() -> Result<Self> {
        Ok(Self {
            body: selector("body")?,
            img: selector("img")?,
            video: selector("video")?,
            iframe: selector("iframe[src]")?,
            ld_json: selector(r#"script[type="application/ld+json"]"#)?,
            itemscope: selector("[itemscope]")?,
            headings: selector("h1, h2, h3, h4, h5, h6")?,
            anchors: selector("a[href]")?,
            webp_source: selector(r#"source[type="image/webp"]"#)?,
            page_title: selector("title")?,
            meta_description: selector(r#"meta[name="description"]"#)?,
            meta_viewport: selector(r#"meta[name="viewport"]"#)?,
            meta_author: selector(r#"meta[name="author"], meta[property="article:author"]"#)?,
            meta_section: selector(r#"meta[property="article:section"]"#)?,
            meta_tag: selector(r#"meta[property="article:tag"]"#)?,
            meta_keywords: selector(r#"meta[name="keywords"]"#)?,
        })
    }
}

/// Computes the structural profile ("DNA") of an article page.
pub struct DnaExtractor {
    config: ExtractionConfig,
    selectors: Selectors,
    candidates: Vec<Selector>,
    excluded: HashSet<String>,
}

impl DnaExtractor {
    pub fn new(config: ExtractionConfig) -> Result<Self> {
        let candidates = config
            .content_candidates
            .iter()
            .map(|css| selector(css))
            .collect::<Result<Vec<_>>>()?;
        let excluded = config
            .excluded_tags
            .iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();

        Ok(Self {
            config,
            selectors: Selectors::new()?,
            candidates,
            excluded,
        })
    }

    /// `title` is the item's feed title; the page's own `<title>` is used
    /// when the feed gave none.
    ///
    /// Documents past the configured node count or nesting depth are refused
    /// as unsupported content.
    pub fn analyze(
        &self,
        page_url: &str,
        title: &str,
        html: &str,
    ) -> std::result::Result<PageAnalysis, ExtractionError> {
        let document = Html::parse_document(html);
        let s = &self.selectors;
        let stats = self.dom_stats(&document)?;

        let body = document
            .select(&s.body)
            .next()
            .unwrap_or_else(|| document.root_element());
        let word_count = visible_words(body, &stats);

        let region = self.content_region(&document, &stats);
        let region_images: Vec<ElementRef> = region
            .map(|r| r.select(&s.img).filter(|img| self.is_content_image(img)).collect())
            .unwrap_or_default();
        let image_count = region.map(|_| region_images.len() as u32);

        let (has_structured_data, schema_types) = self.structured_data(&document);

        let heading_sequence = document
            .select(&s.headings)
            .filter_map(|h| h.value().name().get(1..).and_then(|l| l.parse::<u8>().ok()))
            .collect();

        let title = if title.trim().is_empty() {
            document
                .select(&s.page_title)
                .next()
                .map(|t| t.text().collect::<String>())
                .unwrap_or_default()
        } else {
            title.to_string()
        };

        let (internal_links, external_links) = self.link_counts(&document, page_url);

        let image_format = region_images
            .first()
            .and_then(|img| image_src(img))
            .and_then(image_extension);
        let uses_webp = image_format.as_deref() == Some("webp")
            || document.select(&s.webp_source).next().is_some()
            || document.select(&s.img).any(|img| {
                ["src", "srcset", "data-src"]
                    .iter()
                    .filter_map(|a| img.value().attr(a))
                    .any(|v| v.to_ascii_lowercase().contains(".webp"))
            });

        let video_count = (document.select(&s.video).count()
            + document
                .select(&s.iframe)
                .filter(|f| {
                    f.value()
                        .attr("src")
                        .is_some_and(|src| VIDEO_HOSTS.iter().any(|h| src.contains(h)))
                })
                .count()) as u32;

        let mobile_optimized = meta_content(&document, &s.meta_viewport)
            .is_some_and(|c| c.replace(' ', "").contains("width=device-width"));

        let measurements = Measurements {
            word_count,
            image_count,
            has_structured_data,
            schema_types,
            heading_sequence,
            title: analyze_title(&title),
            meta_description_length: meta_content(&document, &s.meta_description)
                .map(|c| c.trim().chars().count()),
            internal_links,
            external_links,
            video_count,
            mobile_optimized,
            image_format,
            uses_webp,
            author: meta_content(&document, &s.meta_author).filter(|a| !a.trim().is_empty()),
            category: meta_content(&document, &s.meta_section).filter(|c| !c.trim().is_empty()),
            tags: self.tags(&document),
        };

        let status = if region.is_none() || word_count == 0 {
            debug!(
                "Partial profile for {}: region found: {}, words: {}",
                page_url,
                region.is_some(),
                word_count
            );
            ProfileStatus::Partial
        } else {
            ProfileStatus::Complete
        };

        Ok(PageAnalysis {
            status,
            measurements,
        })
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.excluded.contains(name)
    }

    fn dom_stats(&self, document: &Html) -> std::result::Result<DomStats, ExtractionError> {
        let mut stats = DomStats {
            elements: HashMap::new(),
            hidden: HashSet::new(),
        };
        let mut levels: HashMap<NodeId, usize> = HashMap::new();
        // Visible elements in document order with their visible parent.
        let mut order: Vec<(NodeId, Option<NodeId>)> = Vec::new();

        for (visited, node) in document.tree.root().descendants().enumerate() {
            if visited >= self.config.max_nodes {
                return Err(ExtractionError::UnsupportedContent(format!(
                    "document has more than {} nodes",
                    self.config.max_nodes
                )));
            }
            let Some(parent) = node.parent() else {
                continue;
            };
            if stats.hidden.contains(&parent.id()) {
                stats.hidden.insert(node.id());
                continue;
            }

            match node.value() {
                Node::Element(element) => {
                    let level = levels.get(&parent.id()).copied().unwrap_or(0) + 1;
                    if level > self.config.max_nesting_depth {
                        return Err(ExtractionError::UnsupportedContent(format!(
                            "document nests deeper than {} elements",
                            self.config.max_nesting_depth
                        )));
                    }
                    if self.is_excluded(element.name()) {
                        stats.hidden.insert(node.id());
                        continue;
                    }
                    levels.insert(node.id(), level);
                    stats.elements.insert(node.id(), SubtreeStats::default());
                    let visible_parent = stats.elements.contains_key(&parent.id()).then(|| parent.id());
                    order.push((node.id(), visible_parent));
                }
                Node::Text(text) => {
                    if let Some(parent_stats) = stats.elements.get_mut(&parent.id()) {
                        parent_stats.text_len += text.chars().filter(|c| !c.is_whitespace()).count();
                    }
                }
                _ => {}
            }
        }

        // Reverse document order visits every element after all of its
        // descendants.
        for (id, parent) in order.into_iter().rev() {
            let Some(parent) = parent else {
                continue;
            };
            let child = stats.elements.get(&id).copied().unwrap_or_default();
            if let Some(parent_stats) = stats.elements.get_mut(&parent) {
                parent_stats.text_len += child.text_len;
                parent_stats.depth = parent_stats.depth.max(child.depth + 1);
            }
        }

        Ok(stats)
    }

    /// The candidate with the best text-to-markup-depth density, provided it
    /// carries at least the configured amount of text. Ties go to the
    /// earlier candidate.
    fn content_region<'a>(&self, document: &'a Html, stats: &DomStats) -> Option<ElementRef<'a>> {
        let mut best: Option<(f64, ElementRef<'a>)> = None;
        for candidate in &self.candidates {
            for element in document.select(candidate) {
                let Some(subtree) = stats.elements.get(&element.id()) else {
                    continue;
                };
                if subtree.text_len < self.config.min_region_text_len {
                    continue;
                }
                let score =
                    subtree.text_len as f64 / (1.0 + self.config.depth_weight * subtree.depth as f64);
                if best.as_ref().map_or(true, |(top, _)| score > *top) {
                    best = Some((score, element));
                }
            }
        }
        best.map(|(_, element)| element)
    }

    fn is_content_image(&self, img: &ElementRef) -> bool {
        let Some(src) = image_src(img) else {
            return false;
        };
        let lower = src.to_ascii_lowercase();
        if lower.contains("logo") || lower.contains("icon") {
            return false;
        }
        let dimension = |name: &str| {
            img.value()
                .attr(name)
                .and_then(|v| v.trim().trim_end_matches("px").parse::<u32>().ok())
        };
        if dimension("width").is_some_and(|w| w < self.config.min_image_width) {
            return false;
        }
        if dimension("height").is_some_and(|h| h < self.config.min_image_height) {
            return false;
        }
        true
    }

    fn structured_data(&self, document: &Html) -> (bool, Vec<String>) {
        let mut present = false;
        let mut types = Vec::new();

        for script in document.select(&self.selectors.ld_json) {
            present = true;
            let raw: String = script.text().collect();
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => collect_schema_types(&value, &mut types),
                Err(e) => debug!("Unreadable ld+json block: {}", e),
            }
        }

        for item in document.select(&self.selectors.itemscope) {
            present = true;
            if let Some(itemtype) = item.value().attr("itemtype") {
                for url in itemtype.split_whitespace() {
                    if let Some(name) = url.trim_end_matches('/').rsplit('/').next() {
                        types.push(name.to_string());
                    }
                }
            }
        }

        let mut unique = HashSet::new();
        types.retain(|t| !t.is_empty() && unique.insert(t.clone()));
        (present, types)
    }

    fn link_counts(&self, document: &Html, page_url: &str) -> (u32, u32) {
        let Ok(base) = Url::parse(page_url) else {
            return (0, 0);
        };
        let page_host = base.host_str().map(strip_www).unwrap_or_default().to_string();

        let mut internal = 0;
        let mut external = 0;
        for anchor in document.select(&self.selectors.anchors) {
            let Some(href) = anchor.value().attr("href").map(str::trim) else {
                continue;
            };
            if href.is_empty() || href.starts_with('#') {
                continue;
            }
            let Ok(target) = base.join(href) else {
                continue;
            };
            if !matches!(target.scheme(), "http" | "https") {
                continue;
            }
            match target.host_str() {
                Some(host) if strip_www(host) == page_host => internal += 1,
                Some(_) => external += 1,
                None => {}
            }
        }
        (internal, external)
    }

    fn tags(&self, document: &Html) -> Vec<String> {
        let mut tags: Vec<String> = document
            .select(&self.selectors.meta_tag)
            .filter_map(|m| m.value().attr("content"))
            .map(|t| t.trim().to_string())
            .collect();

        if tags.is_empty() {
            if let Some(keywords) = meta_content(document, &self.selectors.meta_keywords) {
                tags = keywords.split(',').map(|k| k.trim().to_string()).collect();
            }
        }

        let mut unique = HashSet::new();
        tags.retain(|t| !t.is_empty() && unique.insert(t.to_lowercase()));
        tags.truncate(self.config.max_tags);
        tags
    }
}

fn visible_words(root: ElementRef, stats: &DomStats) -> u32 {
    let mut words = 0;
    for node in root.descendants() {
        if let Some(text) = node.value().as_text() {
            let hidden = node.parent().is_some_and(|p| stats.hidden.contains(&p.id()));
            if !hidden {
                words += text.split_whitespace().count();
            }
        }
    }
    words as u32
}

fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .find_map(|m| m.value().attr("content"))
        .map(|c| c.to_string())
}

fn image_src<'a>(img: &ElementRef<'a>) -> Option<&'a str> {
    img.value()
        .attr("src")
        .or_else(|| img.value().attr("data-src"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn image_extension(src: &str) -> Option<String> {
    let path = src.split(['?', '#']).next().unwrap_or(src);
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    IMAGE_FORMATS.contains(&ext.as_str()).then_some(ext)
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

// Top-level `@type` values, including every member of an `@graph`.
fn collect_schema_types(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_schema_types(item, out);
            }
        }
        Value::Object(map) => {
            match map.get("@type") {
                Some(Value::String(t)) => out.push(t.clone()),
                Some(Value::Array(ts)) => {
                    out.extend(ts.iter().filter_map(|t| t.as_str().map(str::to_string)))
                }
                _ => {}
            }
            if let Some(graph) = map.get("@graph") {
                collect_schema_types(graph, out);
            }
        }
        _ => {}
    }
}

pub fn analyze_title(title: &str) -> TitleProfile {
    let title = title.trim();
    let lower = title.to_lowercase();

    let has_number = title.chars().any(|c| c.is_ascii_digit());
    let has_question = title.contains('?');
    let has_superlative = lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| SUPERLATIVES.contains(&word));

    let pattern = if title.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        TitlePattern::NumberFirst
    } else if has_question
        || QUESTION_OPENERS
            .iter()
            .any(|q| lower.starts_with(q) || lower.contains(&format!(" {}", q)))
    {
        TitlePattern::Question
    } else if AUTHORITY_MARKERS.iter().any(|m| lower.contains(m)) {
        TitlePattern::Authority
    } else if has_superlative {
        TitlePattern::Superlative
    } else {
        TitlePattern::Generic
    };

    TitleProfile {
        length: title.chars().count(),
        has_number,
        has_question,
        has_superlative,
        pattern,
    }
}
