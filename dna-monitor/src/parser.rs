use chrono::{DateTime, Utc};
use quick_xml::escape::{resolve_predefined_entity, unescape_with};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::types::{CandidateItem, FetchError};

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub item_id: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Result of a tolerant parse: every well-formed entry that appeared before
/// any syntax error, in document order.
#[derive(Debug, Default)]
pub struct ParsedFeed {
    pub entries: Vec<ParsedEntry>,
    pub malformed: usize,
    pub syntax_error: Option<String>,
    pub recognized: bool,
}

impl ParsedFeed {
    /// Only a document that produced nothing usable is an error.
    pub fn into_candidates(self, source_id: &str) -> Result<Vec<CandidateItem>, FetchError> {
        if self.entries.is_empty() {
            if let Some(error) = self.syntax_error {
                return Err(FetchError::Parse(error));
            }
            if !self.recognized {
                return Err(FetchError::Parse("document is not an RSS or Atom feed".to_string()));
            }
        }

        Ok(self
            .entries
            .into_iter()
            .map(|entry| CandidateItem {
                source_id: source_id.to_string(),
                item_id: entry.item_id,
                title: entry.title,
                link: entry.link,
                published_at: entry.published_at,
            })
            .collect())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Id,
    Title,
    Link,
    Published,
    Updated,
}

#[derive(Clone, Copy, PartialEq)]
enum EntryKind {
    /// RSS 2.0 / RSS 1.0 `<item>`
    Item,
    /// Atom `<entry>`
    Entry,
}

struct EntryDraft {
    kind: EntryKind,
    /// Fields whose first element has ended with content; later repeats are
    /// ignored.
    done: Vec<Field>,
    id: Option<String>,
    title: String,
    link_text: Option<String>,
    alternate_link: Option<String>,
    other_link: Option<String>,
    published: Option<String>,
    updated: Option<String>,
}

impl EntryDraft {
    fn new(kind: EntryKind) -> Self {
        Self {
            kind,
            done: Vec::new(),
            id: None,
            title: String::new(),
            link_text: None,
            alternate_link: None,
            other_link: None,
            published: None,
            updated: None,
        }
    }

    fn has_content(&self, field: Field) -> bool {
        let slot = match field {
            Field::Title => return !self.title.trim().is_empty(),
            Field::Id => &self.id,
            Field::Link => &self.link_text,
            Field::Published => &self.published,
            Field::Updated => &self.updated,
        };
        slot.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    fn finish(self) -> Option<ParsedEntry> {
        let link = self
            .alternate_link
            .or(self.link_text)
            .or(self.other_link)
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())?;
        let title = collapse_whitespace(&self.title);

        let item_id = self
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| fallback_item_id(&link, &title));

        let published_at = self
            .published
            .as_deref()
            .and_then(parse_date)
            .or_else(|| self.updated.as_deref().and_then(parse_date));

        Some(ParsedEntry {
            item_id,
            title,
            link,
            published_at,
        })
    }
}

/// Stable identifier for entries that carry no GUID or Atom id.
pub fn fallback_item_id(link: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(link.as_bytes());
    hasher.update(b"\n");
    hasher.update(title.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// Feeds routinely carry HTML entities that are undefined in XML.
fn resolve_entity(entity: &str) -> Option<&'static str> {
    resolve_predefined_entity(entity).or(match entity {
        "nbsp" => Some("\u{a0}"),
        "ndash" => Some("\u{2013}"),
        "mdash" => Some("\u{2014}"),
        "lsquo" => Some("\u{2018}"),
        "rsquo" => Some("\u{2019}"),
        "ldquo" => Some("\u{201c}"),
        "rdquo" => Some("\u{201d}"),
        "hellip" => Some("\u{2026}"),
        "copy" => Some("\u{a9}"),
        "reg" => Some("\u{ae}"),
        "trade" => Some("\u{2122}"),
        _ => None,
    })
}

fn decode_text(raw: &[u8]) -> String {
    let raw = String::from_utf8_lossy(raw);
    match unescape_with(&raw, resolve_entity) {
        Ok(text) => text.into_owned(),
        Err(_) => raw.into_owned(),
    }
}

fn attribute(element: &BytesStart, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .map(|a| decode_text(&a.value))
}

fn field_for(element: &BytesStart, kind: EntryKind) -> Option<Field> {
    let name = element.name();
    let field = match name.local_name().as_ref() {
        b"guid" | b"id" => Field::Id,
        b"title" => Field::Title,
        b"link" => Field::Link,
        b"pubDate" | b"published" | b"issued" | b"date" => Field::Published,
        b"updated" | b"modified" => Field::Updated,
        _ => return None,
    };
    // itunes:title, media:title and atom:link repeat core item fields with
    // different content. Dates stay open to prefixes for dc:date.
    if kind == EntryKind::Item
        && name.prefix().is_some()
        && matches!(field, Field::Id | Field::Title | Field::Link)
    {
        return None;
    }
    Some(field)
}

/// Streaming RSS 2.0 / RSS 1.0 / Atom parser.
pub struct FeedParser;

impl FeedParser {
    pub fn parse(content: &str) -> ParsedFeed {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);

        let mut feed = ParsedFeed::default();
        let mut depth = 0usize;
        let mut entry: Option<(usize, EntryDraft)> = None;
        let mut field: Option<Field> = None;

        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        "Feed XML error at byte {}: {} ({} entries kept)",
                        reader.buffer_position(),
                        e,
                        feed.entries.len()
                    );
                    feed.syntax_error = Some(e.to_string());
                    break;
                }
            };

            match event {
                Event::Start(start) => {
                    depth += 1;
                    let name = start.local_name();
                    let name = name.as_ref();

                    if depth == 1 && matches!(name, b"rss" | b"feed" | b"RDF") {
                        feed.recognized = true;
                    }

                    if let Some((entry_depth, draft)) = entry.as_mut() {
                        if depth == *entry_depth + 1 {
                            let candidate = field_for(&start, draft.kind);
                            if candidate == Some(Field::Link) {
                                take_atom_link(&start, draft);
                            }
                            field = candidate.filter(|f| !draft.done.contains(f));
                        }
                    } else if name == b"item" {
                        entry = Some((depth, EntryDraft::new(EntryKind::Item)));
                    } else if name == b"entry" {
                        entry = Some((depth, EntryDraft::new(EntryKind::Entry)));
                    }
                }
                Event::Empty(empty) => {
                    if let Some((entry_depth, draft)) = &mut entry {
                        if depth == *entry_depth && field_for(&empty, draft.kind) == Some(Field::Link) {
                            take_atom_link(&empty, draft);
                        }
                    }
                }
                Event::Text(text) => {
                    if let (Some(f), Some((_, draft))) = (field, &mut entry) {
                        append(draft, f, &decode_text(&text));
                    }
                }
                Event::CData(cdata) => {
                    if let (Some(f), Some((_, draft))) = (field, &mut entry) {
                        append(draft, f, &String::from_utf8_lossy(&cdata));
                    }
                }
                Event::End(_) => {
                    if let Some((entry_depth, _)) = &entry {
                        if depth == *entry_depth {
                            if let Some((_, draft)) = entry.take() {
                                match draft.finish() {
                                    Some(parsed) => feed.entries.push(parsed),
                                    None => {
                                        debug!("Dropping feed entry without a link");
                                        feed.malformed += 1;
                                    }
                                }
                            }
                        } else if depth == *entry_depth + 1 {
                            if let (Some(f), Some((_, draft))) = (field.take(), entry.as_mut()) {
                                if draft.has_content(f) {
                                    draft.done.push(f);
                                }
                            }
                        }
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        feed
    }
}

fn take_atom_link(element: &BytesStart, draft: &mut EntryDraft) {
    let Some(href) = attribute(element, b"href") else {
        return;
    };
    match attribute(element, b"rel").as_deref() {
        None | Some("alternate") => {
            if draft.alternate_link.is_none() {
                draft.alternate_link = Some(href);
            }
        }
        Some(_) => {
            if draft.other_link.is_none() {
                draft.other_link = Some(href);
            }
        }
    }
}

fn append(draft: &mut EntryDraft, field: Field, text: &str) {
    let slot = match field {
        Field::Title => {
            draft.title.push_str(text);
            return;
        }
        Field::Id => &mut draft.id,
        Field::Link => &mut draft.link_text,
        Field::Published => &mut draft.published,
        Field::Updated => &mut draft.updated,
    };
    slot.get_or_insert_with(String::new).push_str(text);
}
