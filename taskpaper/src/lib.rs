//! Outline text (TaskPaper) domain library.
//! The core types stay pure; parsing, tree editing, rendering and the
//! filesystem seams live in their own modules and share the same item model.

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    use crate::markup;

    /* ------------------------------- IDs ------------------------------- */

    /// Handle to a node stored in a [`crate::document::Document`].
    ///
    /// The generation is bumped whenever a slot is freed, so handles to
    /// deleted items stop resolving instead of aliasing a newer item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct NodeId {
        pub(crate) index: u32,
        pub(crate) generation: u32,
    }

    impl fmt::Display for NodeId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "#{}v{}", self.index, self.generation)
        }
    }

    /* ------------------------------ Kinds ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ItemKind {
        Root,
        Task,
        Project,
        Note,
    }

    impl ItemKind {
        /// Display label, e.g. `Task`.
        pub fn type_name(self) -> &'static str {
            match self {
                ItemKind::Root => "Root",
                ItemKind::Task => "Task",
                ItemKind::Project => "Project",
                ItemKind::Note => "Note",
            }
        }

        /// Lowercase form used for CSS classes and serialized output.
        pub fn as_str(self) -> &'static str {
            match self {
                ItemKind::Root => "root",
                ItemKind::Task => "task",
                ItemKind::Project => "project",
                ItemKind::Note => "note",
            }
        }
    }

    impl fmt::Display for ItemKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /* ----------------------------- Metadata ----------------------------- */

    /// Half-open byte range into an item's content. Both ends sit on char
    /// boundaries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct SourceRange {
        pub start: usize,
        pub end: usize,
    }

    impl SourceRange {
        pub fn new(start: usize, end: usize) -> Self {
            Self { start, end }
        }

        pub fn slice<'a>(&self, content: &'a str) -> &'a str {
            content.get(self.start..self.end).unwrap_or("")
        }

        pub fn len(&self) -> usize {
            self.end.saturating_sub(self.start)
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn overlaps(&self, other: &SourceRange) -> bool {
            self.start < other.end && other.start < self.end
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Tag {
        pub name: String,
        /// `None` when the tag has no parenthesised value. An empty `()` also
        /// yields `None`.
        pub value: Option<String>,
        pub range: SourceRange,
    }

    impl Tag {
        /// Text form of a tag: `@name` or `@name(value)`.
        pub fn render(name: &str, value: Option<&str>) -> String {
            match value {
                Some(v) if !v.is_empty() => format!("@{name}({v})"),
                _ => format!("@{name}"),
            }
        }

        pub fn matches(&self, name: &str) -> bool {
            self.name.eq_ignore_ascii_case(name)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Link {
        /// Text as written in the content.
        pub text: String,
        /// Fully qualified target (`mailto:` / `http://` added where missing).
        pub url: String,
        pub range: SourceRange,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Metadata<'a> {
        Tag(&'a Tag),
        Link(&'a Link),
    }

    impl Metadata<'_> {
        pub fn range(&self) -> SourceRange {
            match self {
                Metadata::Tag(t) => t.range,
                Metadata::Link(l) => l.range,
            }
        }
    }

    /// Tags and links ordered by start offset; on ties tags come first.
    pub fn merge_metadata<'a>(tags: &'a [Tag], links: &'a [Link]) -> Vec<Metadata<'a>> {
        let mut out: Vec<Metadata<'a>> = tags
            .iter()
            .map(Metadata::Tag)
            .chain(links.iter().map(Metadata::Link))
            .collect();
        out.sort_by_key(|m| m.range().start);
        out
    }

    /* ----------------------------- Settings ----------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum LineBreak {
        #[default]
        Unix,
        Mac,
        Windows,
    }

    impl LineBreak {
        pub fn as_str(self) -> &'static str {
            match self {
                LineBreak::Unix => "\n",
                LineBreak::Mac => "\r",
                LineBreak::Windows => "\r\n",
            }
        }
    }

    /// Document-wide knobs shared by the parser and the serializers.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        /// Spaces counted as one indentation level. Zero means only tabs indent.
        pub tab_size: usize,
        pub line_break: LineBreak,
        /// Rewrite `# Heading` lines into `Heading:` projects on ingest.
        pub convert_atx_headings: bool,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self { tab_size: 4, line_break: LineBreak::Unix, convert_atx_headings: false }
        }
    }

    /* ------------------------------ Errors ------------------------------ */

    #[derive(Debug, Error, Clone, PartialEq, Eq)]
    pub enum DomainError {
        #[error("child index {index} out of range for {len} children")]
        OutOfRange { index: isize, len: usize },
        #[error("unknown node {0}")]
        UnknownNode(NodeId),
        #[error("moving {0} would make it its own ancestor")]
        CycleDetected(NodeId),
        #[error("the root item cannot be re-parented")]
        RootNotMovable,
    }

    /* ------------------------------- Item ------------------------------- */

    /// One line of an outline: its text plus everything derived from it.
    ///
    /// `kind`, `tags` and `links` are recomputed whenever the content changes,
    /// so they never drift from the text.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Item {
        content: String,
        kind: ItemKind,
        tags: Vec<Tag>,
        links: Vec<Link>,
        extra_indent: usize,
    }

    impl Item {
        pub fn root() -> Self {
            Self {
                content: String::new(),
                kind: ItemKind::Root,
                tags: Vec::new(),
                links: Vec::new(),
                extra_indent: 0,
            }
        }

        pub fn new(content: &str, settings: &Settings) -> Self {
            let mut item = Self {
                content: String::new(),
                kind: ItemKind::Note,
                tags: Vec::new(),
                links: Vec::new(),
                extra_indent: 0,
            };
            item.ingest(content, settings);
            item
        }

        /// Normalise raw text into this item: strip line terminators, turn
        /// leading indentation into `extra_indent` and reclassify.
        pub(crate) fn ingest(&mut self, raw: &str, settings: &Settings) {
            let cleaned: String = raw.chars().filter(|c| *c != '\r' && *c != '\n').collect();
            let indent = markup::measure_indentation(&cleaned, settings.tab_size);
            self.extra_indent += indent.levels;
            let mut text = cleaned[indent.consumed..].to_string();
            if settings.convert_atx_headings {
                if let Some(converted) = markup::convert_atx_heading(&text) {
                    text = converted;
                }
            }
            self.content = text;
            self.reclassify();
        }

        pub(crate) fn reclassify(&mut self) {
            self.kind = markup::classify(&self.content);
            self.tags = markup::extract_tags(&self.content);
            self.links = markup::extract_links(&self.content);
        }

        /// Replace the text of this item. The root item has no content and
        /// ignores the call.
        pub fn set_content(&mut self, raw: &str, settings: &Settings) {
            if self.kind == ItemKind::Root {
                return;
            }
            self.ingest(raw, settings);
        }

        pub fn content(&self) -> &str {
            &self.content
        }

        pub fn kind(&self) -> ItemKind {
            self.kind
        }

        pub fn tags(&self) -> &[Tag] {
            &self.tags
        }

        pub fn links(&self) -> &[Link] {
            &self.links
        }

        pub fn metadata(&self) -> Vec<Metadata<'_>> {
            merge_metadata(&self.tags, &self.links)
        }

        pub fn extra_indent(&self) -> usize {
            self.extra_indent
        }

        pub fn set_extra_indent(&mut self, levels: usize) {
            self.extra_indent = levels;
        }

        /// Byte range of the title inside the content.
        pub fn title_span(&self) -> SourceRange {
            let content = self.content.as_str();
            match self.kind {
                ItemKind::Root => SourceRange::new(0, 0),
                ItemKind::Project => SourceRange::new(0, markup::project_colon(content).unwrap_or(content.len())),
                ItemKind::Task => {
                    let body = content.get(2..).unwrap_or("");
                    SourceRange::new(2.min(content.len()), 2 + markup::trailing_tag_block_start(body).unwrap_or(body.len()))
                }
                ItemKind::Note => SourceRange::new(0, content.len()),
            }
        }

        /// Content without the type marker, the project colon and any trailing tags.
        pub fn title(&self) -> &str {
            self.title_span().slice(&self.content)
        }

        /// Stable slug usable as an HTML id. Falls back to the content hash
        /// when the title slugifies to nothing.
        pub fn id_attr(&self) -> String {
            let span = self.title_span();
            let mut cut: Vec<SourceRange> = self.metadata().iter().map(|m| m.range()).collect();
            cut.sort();
            let mut bare = String::new();
            let mut pos = span.start;
            for r in cut {
                if r.end <= pos || r.start >= span.end {
                    continue;
                }
                if r.start > pos {
                    bare.push_str(&self.content[pos..r.start]);
                }
                pos = pos.max(r.end.min(span.end));
            }
            if pos < span.end {
                bare.push_str(&self.content[pos..span.end]);
            }
            let slug = markup::slugify(&bare);
            if slug.is_empty() { self.content_hash() } else { slug }
        }

        pub fn content_hash(&self) -> String {
            blake3::hash(self.content.as_bytes()).to_hex().to_string()
        }

        /* ------------------------------ Tags ------------------------------ */

        pub fn find_tag(&self, name: &str) -> Option<&Tag> {
            self.tags.iter().find(|t| t.matches(name))
        }

        pub fn has_tag(&self, name: &str) -> bool {
            self.find_tag(name).is_some()
        }

        /// Value of the first matching tag. Absent tags and value-less tags
        /// both read as the empty string; use [`Item::has_tag`] to tell them apart.
        pub fn tag_value(&self, name: &str) -> &str {
            self.find_tag(name).and_then(|t| t.value.as_deref()).unwrap_or("")
        }

        pub fn is_done(&self) -> bool {
            self.has_tag("done")
        }

        /// Set a tag. An existing tag with the same name is rewritten in place
        /// unless `force_new` is set, in which case a new tag is appended after
        /// a single space.
        pub fn set_tag(&mut self, name: &str, value: Option<&str>, force_new: bool) {
            if self.kind == ItemKind::Root {
                return;
            }
            let rendered = Tag::render(name, value);
            match self.find_tag(name).map(|t| t.range) {
                Some(r) if !force_new => self.content.replace_range(r.start..r.end, &rendered),
                _ => {
                    self.content.push(' ');
                    self.content.push_str(&rendered);
                }
            }
            self.reclassify();
        }

        pub fn add_tag(&mut self, name: &str, value: Option<&str>) {
            self.set_tag(name, value, true);
        }

        /// Remove every tag called `name` (case-insensitive). Returns whether
        /// anything was removed.
        pub fn remove_tag(&mut self, name: &str) -> bool {
            let ranges: Vec<SourceRange> = self.tags.iter().filter(|t| t.matches(name)).map(|t| t.range).collect();
            self.strip_ranges(ranges)
        }

        pub fn remove_all_tags(&mut self) -> bool {
            let ranges: Vec<SourceRange> = self.tags.iter().map(|t| t.range).collect();
            self.strip_ranges(ranges)
        }

        fn strip_ranges(&mut self, mut ranges: Vec<SourceRange>) -> bool {
            if ranges.is_empty() {
                return false;
            }
            ranges.sort_by(|a, b| b.start.cmp(&a.start));
            for r in ranges {
                let (mut start, mut end) = (r.start, r.end);
                let before = self.content[..start].chars().next_back();
                let after = self.content[end..].chars().next();
                let ws_before = before.is_some_and(char::is_whitespace);
                let ws_after = after.is_some_and(char::is_whitespace);
                if ws_before && (ws_after || after.is_none()) {
                    start -= before.map_or(0, char::len_utf8);
                } else if start == 0 && ws_after {
                    end += after.map_or(0, char::len_utf8);
                }
                self.content.replace_range(start..end, "");
            }
            self.reclassify();
            true
        }

        /* ------------------------------ Kind ------------------------------ */

        /// Rewrite the content so that it classifies as `kind`.
        pub fn change_to(&mut self, kind: ItemKind) {
            if kind == self.kind || kind == ItemKind::Root || self.kind == ItemKind::Root {
                return;
            }
            match self.kind {
                ItemKind::Task => self.content.replace_range(..2.min(self.content.len()), ""),
                ItemKind::Project => {
                    if let Some(colon) = markup::project_colon(&self.content) {
                        self.content.remove(colon);
                    }
                }
                _ => {}
            }
            match kind {
                ItemKind::Task => self.content.insert_str(0, "- "),
                ItemKind::Project => {
                    let at = match markup::trailing_tag_block_start(&self.content) {
                        Some(block) => self.content[..block].trim_end().len(),
                        None => self.content.trim_end().len(),
                    };
                    self.content.insert(at, ':');
                }
                _ => {}
            }
            self.reclassify();
        }

        pub fn set_done(&mut self, done: bool) {
            if done {
                if !self.is_done() {
                    self.set_tag("done", None, false);
                }
            } else {
                self.remove_tag("done");
            }
        }

        pub fn toggle_done(&mut self) {
            let done = self.is_done();
            self.set_done(!done);
        }
    }

    impl fmt::Display for Item {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.content)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn item(text: &str) -> Item {
            Item::new(text, &Settings::default())
        }

        #[test]
        fn titles_strip_markers_and_trailing_tags() {
            assert_eq!(item("- Buy milk @today").title(), "Buy milk");
            assert_eq!(item("Groceries: @home").title(), "Groceries");
            assert_eq!(item("Just a note @x").title(), "Just a note @x");
            assert_eq!(item("- @flag a @b middle").title(), "@flag a @b middle");
        }

        #[test]
        fn id_attr_slugifies_title_or_hashes() {
            assert_eq!(item("Home & Garden:").id_attr(), "home-and-garden");
            assert_eq!(item("- Call @bob about it").id_attr(), "call-about-it");
            let symbols = item("!!!:");
            assert_eq!(symbols.id_attr(), symbols.content_hash());
        }

        #[test]
        fn ingest_moves_indentation_into_extra_indent() {
            let it = item("\t\t- nested");
            assert_eq!(it.content(), "- nested");
            assert_eq!(it.extra_indent(), 2);
            assert_eq!(it.kind(), ItemKind::Task);
        }

        #[test]
        fn set_tag_replaces_or_appends() {
            let mut it = item("- Pay rent @due(monday)");
            it.set_tag("due", Some("friday"), false);
            assert_eq!(it.content(), "- Pay rent @due(friday)");
            it.set_tag("due", Some("sunday"), true);
            assert_eq!(it.content(), "- Pay rent @due(friday) @due(sunday)");
            assert_eq!(it.tag_value("due"), "friday");
        }

        #[test]
        fn add_then_remove_tag_restores_content() {
            for text in ["- middle task here", "Project:", "note", "- a @x b"] {
                let mut it = item(text);
                it.add_tag("flag", Some("red"));
                assert!(it.has_tag("flag"));
                it.remove_tag("flag");
                assert_eq!(it.content(), text);
            }
        }

        #[test]
        fn metadata_is_deterministic_and_disjoint() {
            let lines = [
                "- call bob@example.com @due(mon) see https://x.org/a @done",
                "Errands: @home @when(sat)",
                "note with www.example.com and @flag",
            ];
            for text in lines {
                let first = item(text);
                let second = item(text);
                assert_eq!(first.kind(), second.kind());
                assert_eq!(first.tags(), second.tags());
                assert_eq!(first.links(), second.links());

                let spans: Vec<SourceRange> = first.metadata().iter().map(Metadata::range).collect();
                assert!(!spans.is_empty(), "{text}");
                for (i, a) in spans.iter().enumerate() {
                    assert!(!a.is_empty());
                    assert_eq!(a.len(), a.slice(first.content()).len());
                    for b in &spans[i + 1..] {
                        assert!(!a.overlaps(b), "{text}: {a:?} {b:?}");
                    }
                }
            }
            assert!(SourceRange::new(3, 3).is_empty());
            assert!(!SourceRange::new(0, 2).overlaps(&SourceRange::new(2, 4)));
        }

        #[test]
        fn overlapping_tag_and_link_are_both_kept() {
            let it = item("- x @due(example.com)");
            let meta = it.metadata();
            assert_eq!(meta.len(), 2);
            assert!(matches!(meta[0], Metadata::Tag(t) if t.name == "due"));
            assert!(matches!(meta[1], Metadata::Link(l) if l.text == "example.com"));
            assert!(meta[0].range().overlaps(&meta[1].range()));
        }

        #[test]
        fn appended_tags_always_get_a_separating_space() {
            let mut trailing = item("- task ");
            trailing.set_tag("done", None, false);
            assert_eq!(trailing.content(), "- task  @done");
            trailing.remove_tag("done");
            assert_eq!(trailing.content(), "- task ");

            let mut empty = item("");
            empty.add_tag("flag", None);
            assert_eq!(empty.content(), " @flag");
            assert!(empty.has_tag("flag"));
            empty.remove_tag("flag");
            assert_eq!(empty.content(), "");
        }

        #[test]
        fn remove_tag_handles_each_position() {
            let mut start = item("@one rest of it");
            start.remove_tag("one");
            assert_eq!(start.content(), "rest of it");

            let mut middle = item("- a @one b");
            middle.remove_tag("ONE");
            assert_eq!(middle.content(), "- a b");

            let mut end = item("- a @one @one(2)");
            assert!(end.remove_tag("one"));
            assert_eq!(end.content(), "- a");
            assert!(!end.remove_tag("one"));
        }

        #[test]
        fn change_to_rewrites_markers() {
            let mut it = item("- Write report @due(fri)");
            it.change_to(ItemKind::Project);
            assert_eq!(it.content(), "Write report: @due(fri)");
            assert_eq!(it.kind(), ItemKind::Project);

            it.change_to(ItemKind::Note);
            assert_eq!(it.content(), "Write report @due(fri)");
            assert_eq!(it.kind(), ItemKind::Note);

            it.change_to(ItemKind::Task);
            assert_eq!(it.content(), "- Write report @due(fri)");
        }

        #[test]
        fn done_toggles() {
            let mut it = item("- chore");
            it.toggle_done();
            assert_eq!(it.content(), "- chore @done");
            assert!(it.is_done());
            it.toggle_done();
            assert_eq!(it.content(), "- chore");
        }

        #[test]
        fn root_ignores_edits() {
            let mut root = Item::root();
            root.set_content("- hi", &Settings::default());
            root.set_tag("x", None, false);
            assert_eq!(root.content(), "");
            assert_eq!(root.kind(), ItemKind::Root);
        }
    }
}

pub mod markup {
    //! Line-level scanners: indentation, classification, tags, links and the
    //! small text rewrites (ATX headings, slugs) built on top of them.

    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while1},
        character::complete::char,
        combinator::opt,
        error::{VerboseError, VerboseErrorKind},
        multi::fold_many0,
        sequence::preceded,
    };
    use once_cell::sync::Lazy;
    use regex::Regex;

    use crate::core::{ItemKind, Link, SourceRange, Tag};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ---------------------------- Indentation ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Indentation {
        /// Bytes of leading indentation.
        pub consumed: usize,
        pub levels: usize,
    }

    fn indent_unit<'a>(i: &'a str, spaces: &str) -> PResult<'a, &'a str> {
        if spaces.is_empty() {
            return tag("\t")(i);
        }
        alt((tag("\t"), tag(spaces)))(i)
    }

    /// Count leading tabs and groups of exactly `tab_size` spaces.
    pub fn measure_indentation(line: &str, tab_size: usize) -> Indentation {
        let spaces = " ".repeat(tab_size);
        let parsed: PResult<'_, usize> = fold_many0(|i| indent_unit(i, &spaces), || 0usize, |n, _| n + 1)(line);
        match parsed {
            Ok((rest, levels)) => Indentation { consumed: line.len() - rest.len(), levels },
            Err(_) => Indentation::default(),
        }
    }

    /* --------------------------- Classification --------------------------- */

    pub fn classify(content: &str) -> ItemKind {
        if content.starts_with("- ") || content.starts_with("* ") {
            ItemKind::Task
        } else if project_colon(content).is_some() {
            ItemKind::Project
        } else {
            ItemKind::Note
        }
    }

    /// Byte offset of the colon that makes `content` a project, if it is one.
    ///
    /// The head runs to the first colon after the first non-blank character
    /// (which must not be `-`); only `@tokens` may follow it.
    pub fn project_colon(content: &str) -> Option<usize> {
        let lead = content.len() - content.trim_start().len();
        let first = content[lead..].chars().next()?;
        if first == '-' {
            return None;
        }
        let from = lead + first.len_utf8();
        let colon = from + content[from..].find(':')?;
        content[colon + 1..]
            .split_whitespace()
            .all(|tok| tok.starts_with('@') && tok.len() > 1)
            .then_some(colon)
    }

    /* -------------------------------- Tags -------------------------------- */

    fn is_word_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_'
    }

    fn is_tag_name_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
    }

    /// Text up to the first `)` not preceded by a backslash; consumes the paren.
    fn tag_value(i: &str) -> PResult<'_, &str> {
        let mut prev = None;
        for (idx, c) in i.char_indices() {
            if c == ')' && prev != Some('\\') {
                return Ok((&i[idx + 1..], &i[..idx]));
            }
            prev = Some(c);
        }
        Err(nom::Err::Error(VerboseError { errors: vec![(i, VerboseErrorKind::Context("unclosed tag value"))] }))
    }

    fn tag_token(i: &str) -> PResult<'_, (&str, Option<&str>)> {
        let (i, _) = char('@')(i)?;
        let (i, name) = take_while1(is_tag_name_char)(i)?;
        let (i, value) = opt(preceded(char('('), tag_value))(i)?;
        Ok((i, (name, value)))
    }

    pub fn extract_tags(content: &str) -> Vec<Tag> {
        let mut tags = Vec::new();
        let mut prev: Option<char> = None;
        let mut pos = 0;
        while let Some(c) = content[pos..].chars().next() {
            if c == '@' && !prev.is_some_and(is_word_char) {
                if let Ok((rest, (name, value))) = tag_token(&content[pos..]) {
                    let end = content.len() - rest.len();
                    tags.push(Tag {
                        name: name.to_string(),
                        value: value.filter(|v| !v.is_empty()).map(str::to_string),
                        range: SourceRange::new(pos, end),
                    });
                    prev = content[..end].chars().next_back();
                    pos = end;
                    continue;
                }
            }
            prev = Some(c);
            pos += c.len_utf8();
        }
        tags
    }

    /* -------------------------------- Links -------------------------------- */

    static LINK_REGEX: Lazy<Regex> = Lazy::new(|| {
        Regex::new(concat!(
            r"(?i)(?P<uri>[a-z0-9\-_+.]+:(?://)?[a-z0-9\-_.+]+(?::[a-z0-9\-_.+]+)*@?(?:[a-z0-9\-]+\.)+[a-z]{2,}(?::[0-9]+)?(?:[/?]\S*)?)",
            r"|(?P<email>[a-z0-9\-_+.]+@\S+\.\S+)",
            r"|(?P<domain>\b(?:[a-z0-9\-]+\.)+[a-z]{2,}(?::[0-9]+)?(?:[/?]\S*)?)",
        ))
        .unwrap()
    });

    pub fn extract_links(content: &str) -> Vec<Link> {
        let mut links = Vec::new();
        let mut pos = 0;
        while pos <= content.len() {
            let Some(caps) = LINK_REGEX.captures_at(content, pos) else { break };
            let Some(whole) = caps.get(0) else { break };
            let (text, url) = if let Some(m) = caps.name("uri") {
                (m.as_str(), m.as_str().to_string())
            } else if let Some(m) = caps.name("email") {
                (m.as_str(), format!("mailto:{}", m.as_str()))
            } else if content[..whole.start()].ends_with('@') {
                // `@example.com` is a tag-ish token, not a bare domain
                let skip = content[whole.start()..].chars().next().map_or(1, char::len_utf8);
                pos = whole.start() + skip;
                continue;
            } else {
                (whole.as_str(), format!("http://{}", whole.as_str()))
            };
            links.push(Link { text: text.to_string(), url, range: SourceRange::new(whole.start(), whole.end()) });
            pos = whole.end().max(whole.start() + 1);
        }
        links
    }

    /* ------------------------- Trailing tag block ------------------------- */

    fn is_block_name_char(c: char) -> bool {
        !(c == '.' || c == '(' || c == ')' || c == '\\' || c.is_whitespace())
    }

    /// Whether `s` consists solely of one or more `\s*@name[(value)]` groups.
    fn is_tag_block(s: &str) -> bool {
        let Some(rest) = s.trim_start().strip_prefix('@') else {
            return false;
        };
        let name_len = rest.find(|c: char| !is_block_name_char(c)).unwrap_or(rest.len());
        if name_len == 0 {
            return false;
        }
        let after = &rest[name_len..];
        if after.is_empty() || is_tag_block(after) {
            return true;
        }
        let Some(value) = after.strip_prefix('(') else {
            return false;
        };
        // a value may run past a `)` when that is the only way to reach the end
        let mut prev = None;
        for (idx, c) in value.char_indices() {
            if c == ')' && idx > 0 && prev != Some('\\') {
                let tail = &value[idx + 1..];
                if tail.is_empty() || is_tag_block(tail) {
                    return true;
                }
            }
            prev = Some(c);
        }
        false
    }

    /// Leftmost byte offset where the run of trailing tags (with its leading
    /// whitespace) starts.
    pub fn trailing_tag_block_start(content: &str) -> Option<usize> {
        content
            .char_indices()
            .filter(|(_, c)| *c == '@' || c.is_whitespace())
            .map(|(idx, _)| idx)
            .find(|idx| is_tag_block(&content[*idx..]))
    }

    /* ------------------------------ Rewrites ------------------------------ */

    static ATX_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\s*?)#+\s*([^:]+?)$").unwrap());

    /// `# Heading` becomes `Heading:`; anything else is left alone.
    pub fn convert_atx_heading(content: &str) -> Option<String> {
        let caps = ATX_HEADING.captures(content)?;
        Some(format!("{}{}:", &caps[1], &caps[2]))
    }

    static SEPARATOR_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_]{2,}").unwrap());

    /// Lowercase, `&` spelled out, separators turned into `-`, runs of two or
    /// more `-`/`_` collapsed and one separator trimmed from each end.
    pub fn slugify(text: &str) -> String {
        let lowered = text.trim().to_lowercase().replace("&amp;", " and ").replace('&', " and ");
        let dashed: String = lowered
            .chars()
            .filter_map(|c| match c {
                c if c.is_whitespace() || matches!(c, '.' | '/' | '\\') => Some('-'),
                c if c.is_alphanumeric() || c == '_' || c == '-' => Some(c),
                _ => None,
            })
            .collect();
        let collapsed = SEPARATOR_RUN.replace_all(&dashed, "-");
        let is_sep = |c: char| c == '-' || c == '_';
        let slug = collapsed.strip_prefix(is_sep).unwrap_or(&*collapsed);
        slug.strip_suffix(is_sep).unwrap_or(slug).to_string()
    }

}

pub mod document {
    use std::collections::BTreeSet;
    use std::ops::{Bound, RangeBounds};

    use tracing::trace;

    use crate::core::{DomainError, Item, ItemKind, NodeId, Settings};

    /* ------------------------------- Arena ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Node {
        item: Item,
        parent: Option<NodeId>,
        children: Vec<NodeId>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Slot {
        generation: u32,
        node: Option<Node>,
    }

    fn node_in(slots: &[Slot], id: NodeId) -> Option<&Node> {
        slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    fn node_in_mut(slots: &mut [Slot], id: NodeId) -> Option<&mut Node> {
        slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
    }

    /// What to attach with [`Document::insert_child`]: an existing node, or
    /// raw text that becomes a new item.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum NewChild {
        Node(NodeId),
        Text(String),
    }

    impl From<NodeId> for NewChild {
        fn from(id: NodeId) -> Self {
            NewChild::Node(id)
        }
    }

    impl From<&str> for NewChild {
        fn from(text: &str) -> Self {
            NewChild::Text(text.to_string())
        }
    }

    impl From<String> for NewChild {
        fn from(text: String) -> Self {
            NewChild::Text(text)
        }
    }

    /// Selects a child either by position or by handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ChildRef {
        Index(usize),
        Node(NodeId),
    }

    impl From<usize> for ChildRef {
        fn from(index: usize) -> Self {
            ChildRef::Index(index)
        }
    }

    impl From<NodeId> for ChildRef {
        fn from(id: NodeId) -> Self {
            ChildRef::Node(id)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum TraversalOrder {
        #[default]
        PreOrder,
        PostOrder,
    }

    /* ------------------------------ Document ------------------------------ */

    /// An outline: a root item plus every item reachable from it, stored in
    /// an arena addressed by [`NodeId`].
    ///
    /// Items removed from the tree stay allocated (and their handles stay
    /// valid) until [`Document::delete`] or [`Document::purge_detached`].
    #[derive(Debug, Clone)]
    pub struct Document {
        settings: Settings,
        slots: Vec<Slot>,
        free: Vec<u32>,
        root: NodeId,
    }

    impl Default for Document {
        fn default() -> Self {
            Self::new(Settings::default())
        }
    }

    fn resolve_index(index: isize, len: usize) -> Result<usize, DomainError> {
        if index >= 0 {
            return Ok((index as usize).min(len));
        }
        let at = len as isize + 1 + index;
        if at < 0 {
            return Err(DomainError::OutOfRange { index, len });
        }
        Ok(at as usize)
    }

    /// First run of ASCII digits, saturating at `i64::MAX`; 0 when there is none.
    fn leading_integer(value: &str) -> i64 {
        value
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .filter_map(|c| c.to_digit(10))
            .fold(0i64, |acc, d| acc.saturating_mul(10).saturating_add(i64::from(d)))
    }

    impl Document {
        pub fn new(settings: Settings) -> Self {
            let mut doc = Self { settings, slots: Vec::new(), free: Vec::new(), root: NodeId { index: 0, generation: 0 } };
            doc.root = doc.alloc(Item::root());
            doc
        }

        pub fn settings(&self) -> &Settings {
            &self.settings
        }

        pub fn root(&self) -> NodeId {
            self.root
        }

        fn alloc(&mut self, item: Item) -> NodeId {
            let node = Node { item, parent: None, children: Vec::new() };
            if let Some(index) = self.free.pop() {
                if let Some(slot) = self.slots.get_mut(index as usize) {
                    slot.node = Some(node);
                    return NodeId { index, generation: slot.generation };
                }
            }
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, node: Some(node) });
            NodeId { index, generation: 0 }
        }

        fn node(&self, id: NodeId) -> Option<&Node> {
            node_in(&self.slots, id)
        }

        fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
            node_in_mut(&mut self.slots, id)
        }

        fn require(&self, id: NodeId) -> Result<&Node, DomainError> {
            self.node(id).ok_or(DomainError::UnknownNode(id))
        }

        /* ----------------------------- Access ----------------------------- */

        pub fn contains(&self, id: NodeId) -> bool {
            self.node(id).is_some()
        }

        pub fn item(&self, id: NodeId) -> Option<&Item> {
            self.node(id).map(|n| &n.item)
        }

        /// Mutable access for content edits (tags, kind changes). Structure is
        /// only changed through the `Document` methods.
        pub fn item_mut(&mut self, id: NodeId) -> Option<&mut Item> {
            self.node_mut(id).map(|n| &mut n.item)
        }

        pub fn parent(&self, id: NodeId) -> Option<NodeId> {
            self.node(id).and_then(|n| n.parent)
        }

        pub fn children(&self, id: NodeId) -> &[NodeId] {
            self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
        }

        pub fn kind(&self, id: NodeId) -> Option<ItemKind> {
            self.item(id).map(Item::kind)
        }

        /// Every item in the tree (root excluded) in document order.
        pub fn items(&self) -> Vec<NodeId> {
            self.children_flat(self.root, None, TraversalOrder::PreOrder)
        }

        /// Allocate a detached item.
        pub fn create_item(&mut self, text: &str) -> NodeId {
            let item = Item::new(text, &self.settings);
            self.alloc(item)
        }

        pub fn set_content(&mut self, id: NodeId, text: &str) -> Result<(), DomainError> {
            let Self { settings, slots, .. } = self;
            let node = node_in_mut(slots, id).ok_or(DomainError::UnknownNode(id))?;
            node.item.set_content(text, settings);
            Ok(())
        }

        /* --------------------------- Structure --------------------------- */

        fn is_ancestor_or_self(&self, ancestor: NodeId, mut id: NodeId) -> bool {
            loop {
                if id == ancestor {
                    return true;
                }
                match self.parent(id) {
                    Some(p) => id = p,
                    None => return false,
                }
            }
        }

        fn detach(&mut self, id: NodeId) {
            let Some(parent) = self.node_mut(id).and_then(|n| n.parent.take()) else {
                return;
            };
            if let Some(p) = self.node_mut(parent) {
                p.children.retain(|c| *c != id);
            }
        }

        fn attach(&mut self, parent: NodeId, id: NodeId, at: usize) {
            if let Some(p) = self.node_mut(parent) {
                let at = at.min(p.children.len());
                p.children.insert(at, id);
            }
            if let Some(n) = self.node_mut(id) {
                n.parent = Some(parent);
            }
        }

        /// Insert `child` under `parent` at `index`.
        ///
        /// Non-negative indices clamp to the end; negative ones count from the
        /// end, `-1` appending. An already attached node is moved, keeping its
        /// subtree. Nothing changes when an error is returned.
        pub fn insert_child(&mut self, parent: NodeId, child: impl Into<NewChild>, index: isize) -> Result<NodeId, DomainError> {
            let len = self.require(parent)?.children.len();
            let child = match child.into() {
                NewChild::Text(text) => {
                    let at = resolve_index(index, len)?;
                    let id = self.create_item(&text);
                    self.attach(parent, id, at);
                    return Ok(id);
                }
                NewChild::Node(id) => id,
            };
            if child == self.root {
                return Err(DomainError::RootNotMovable);
            }
            self.require(child)?;
            if self.is_ancestor_or_self(child, parent) {
                return Err(DomainError::CycleDetected(child));
            }
            let len = if self.parent(child) == Some(parent) { len - 1 } else { len };
            let at = resolve_index(index, len)?;
            self.detach(child);
            self.attach(parent, child, at);
            Ok(child)
        }

        pub fn add_child(&mut self, parent: NodeId, child: impl Into<NewChild>) -> Result<NodeId, DomainError> {
            self.insert_child(parent, child, -1)
        }

        pub fn add_children<I, C>(&mut self, parent: NodeId, children: I) -> Result<Vec<NodeId>, DomainError>
        where
            I: IntoIterator<Item = C>,
            C: Into<NewChild>,
        {
            children.into_iter().map(|c| self.add_child(parent, c)).collect()
        }

        pub fn move_to(&mut self, id: NodeId, new_parent: NodeId, index: isize) -> Result<NodeId, DomainError> {
            self.insert_child(new_parent, id, index)
        }

        /// Detach one child. The returned handle stays valid and can be
        /// attached elsewhere.
        pub fn remove_child(&mut self, parent: NodeId, child: impl Into<ChildRef>) -> Option<NodeId> {
            let node = self.node(parent)?;
            let pos = match child.into() {
                ChildRef::Index(i) => (i < node.children.len()).then_some(i)?,
                ChildRef::Node(id) => node.children.iter().position(|c| *c == id)?,
            };
            let id = self.node_mut(parent)?.children.remove(pos);
            if let Some(n) = self.node_mut(id) {
                n.parent = None;
            }
            Some(id)
        }

        /// Detach the children in `range`, last first. The handles come back in
        /// their original order.
        pub fn remove_children(&mut self, parent: NodeId, range: impl RangeBounds<usize>) -> Vec<NodeId> {
            let len = self.children(parent).len();
            let start = match range.start_bound() {
                Bound::Included(&s) => s,
                Bound::Excluded(&s) => s.saturating_add(1),
                Bound::Unbounded => 0,
            };
            let end = match range.end_bound() {
                Bound::Included(&e) => e.saturating_add(1),
                Bound::Excluded(&e) => e,
                Bound::Unbounded => len,
            }
            .min(len);
            if start >= end {
                return Vec::new();
            }
            let mut removed: Vec<NodeId> = (start..end).rev().filter_map(|i| self.remove_child(parent, i)).collect();
            removed.reverse();
            removed
        }

        pub fn remove_all_children(&mut self, parent: NodeId) -> Vec<NodeId> {
            self.remove_children(parent, ..)
        }

        /// Free `id` and its whole subtree. Returns how many items were freed.
        pub fn delete(&mut self, id: NodeId) -> Result<usize, DomainError> {
            if id == self.root {
                return Err(DomainError::RootNotMovable);
            }
            self.require(id)?;
            self.detach(id);
            let mut stack = vec![id];
            let mut freed = 0;
            while let Some(next) = stack.pop() {
                let Some(slot) = self.slots.get_mut(next.index as usize) else { continue };
                if slot.generation != next.generation {
                    continue;
                }
                if let Some(node) = slot.node.take() {
                    stack.extend(node.children);
                    slot.generation = slot.generation.wrapping_add(1);
                    self.free.push(next.index);
                    freed += 1;
                }
            }
            Ok(freed)
        }

        /// Free every item not reachable from the root.
        pub fn purge_detached(&mut self) -> usize {
            let orphans: Vec<NodeId> = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let node = slot.node.as_ref()?;
                    node.parent.is_none().then_some(NodeId { index: index as u32, generation: slot.generation })
                })
                .filter(|id| *id != self.root)
                .collect();
            orphans.into_iter().filter_map(|id| self.delete(id).ok()).sum()
        }

        /* ---------------------------- Derived ---------------------------- */

        /// Parent hops to the root; the root is -1 and a detached item is 0.
        pub fn level(&self, id: NodeId) -> Option<isize> {
            self.node(id)?;
            if id == self.root {
                return Some(-1);
            }
            let mut level = 0;
            let mut cur = self.parent(id);
            while let Some(p) = cur {
                if p == self.root {
                    break;
                }
                level += 1;
                cur = self.parent(p);
            }
            Some(level)
        }

        /// Visual depth: the tree level plus every `extra_indent` on the way up.
        pub fn effective_level(&self, id: NodeId) -> Option<isize> {
            let mut total: isize = 0;
            let mut cur = id;
            loop {
                let node = self.node(cur)?;
                if cur == self.root {
                    return Some(total - 1);
                }
                let extra = node.item.extra_indent() as isize;
                match node.parent {
                    Some(p) => {
                        total += 1 + extra;
                        cur = p;
                    }
                    None => return Some(total + extra),
                }
            }
        }

        /// Nearest project strictly above `id`.
        pub fn project(&self, id: NodeId) -> Option<NodeId> {
            let mut cur = self.parent(id);
            while let Some(p) = cur {
                if self.kind(p) == Some(ItemKind::Project) {
                    return Some(p);
                }
                cur = self.parent(p);
            }
            None
        }

        fn sibling(&self, id: NodeId, offset: isize) -> Option<NodeId> {
            let siblings = self.children(self.parent(id)?);
            let pos = siblings.iter().position(|c| *c == id)? as isize + offset;
            usize::try_from(pos).ok().and_then(|p| siblings.get(p).copied())
        }

        pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
            self.sibling(id, -1)
        }

        pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
            self.sibling(id, 1)
        }

        /* ---------------------------- Queries ---------------------------- */

        fn collect_flat(&self, id: NodeId, only: Option<ItemKind>, order: TraversalOrder, out: &mut Vec<NodeId>) {
            for &child in self.children(id) {
                let keep = only.is_none_or(|k| self.kind(child) == Some(k));
                if keep && order == TraversalOrder::PreOrder {
                    out.push(child);
                }
                self.collect_flat(child, only, order, out);
                if keep && order == TraversalOrder::PostOrder {
                    out.push(child);
                }
            }
        }

        /// Descendants of `id` (never `id` itself), depth first, left to right.
        pub fn children_flat(&self, id: NodeId, only: Option<ItemKind>, order: TraversalOrder) -> Vec<NodeId> {
            let mut out = Vec::new();
            self.collect_flat(id, only, order, &mut out);
            out
        }

        pub fn items_of_kind(&self, kind: ItemKind) -> Vec<NodeId> {
            self.children_flat(self.root, Some(kind), TraversalOrder::PreOrder)
        }

        /// Items carrying `name`; with `value`, only those whose tag value is
        /// exactly `value`.
        pub fn items_with_tag(&self, name: &str, value: Option<&str>) -> Vec<NodeId> {
            self.items()
                .into_iter()
                .filter(|id| {
                    self.item(*id).is_some_and(|item| {
                        item.tags().iter().any(|t| {
                            t.matches(name) && value.is_none_or(|v| t.value.as_deref().unwrap_or("") == v)
                        })
                    })
                })
                .collect()
        }

        /// Distinct tags used anywhere in the document, sorted.
        pub fn all_tags(&self, with_values: bool, prefixed: bool) -> Vec<String> {
            let mut seen = BTreeSet::new();
            for id in self.items() {
                let Some(item) = self.item(id) else { continue };
                for t in item.tags() {
                    let mut text = if prefixed { format!("@{}", t.name) } else { t.name.clone() };
                    if let (true, Some(v)) = (with_values, t.value.as_deref()) {
                        text.push('(');
                        text.push_str(v);
                        text.push(')');
                    }
                    seen.insert(text);
                }
            }
            seen.into_iter().collect()
        }

        /// Sum the leading integers of `name` values over the leaves under
        /// `id`, writing subtotals onto branch items that carry the tag (or
        /// onto every branch with `always_update`). Sums saturate at `i64::MAX`.
        pub fn total_tag_values(&mut self, id: NodeId, name: &str, always_update: bool) -> i64 {
            let children = self.children(id).to_vec();
            if children.is_empty() {
                return self.item(id).map_or(0, |item| leading_integer(item.tag_value(name)));
            }
            let total = children
                .into_iter()
                .map(|c| self.total_tag_values(c, name, always_update))
                .fold(0i64, i64::saturating_add);
            if id != self.root {
                if let Some(item) = self.item_mut(id) {
                    if always_update || item.has_tag(name) {
                        item.set_tag(name, Some(&total.to_string()), false);
                    }
                }
            }
            trace!(node = %id, tag = name, total, "tag subtotal");
            total
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn contents(doc: &Document, ids: &[NodeId]) -> Vec<String> {
            ids.iter().map(|id| doc.item(*id).expect("live item").content().to_string()).collect()
        }

        /// A -> [B -> [C], D]
        fn small_tree() -> (Document, [NodeId; 4]) {
            let mut doc = Document::default();
            let root = doc.root();
            let a = doc.add_child(root, "A:").expect("a");
            let b = doc.add_child(a, "- B").expect("b");
            let c = doc.add_child(b, "C note").expect("c");
            let d = doc.add_child(a, "- D").expect("d");
            (doc, [a, b, c, d])
        }

        #[test]
        fn insert_child_index_rules() {
            let mut doc = Document::default();
            let root = doc.root();
            doc.add_children(root, ["a", "b", "c"]).expect("children");
            doc.insert_child(root, "first", 0).expect("at start");
            doc.insert_child(root, "before last", -2).expect("negative");
            doc.insert_child(root, "clamped", 99).expect("clamped");
            assert_eq!(contents(&doc, doc.children(root)), vec!["first", "a", "b", "before last", "c", "clamped"]);

            let err = doc.insert_child(root, "nope", -8).expect_err("below start");
            assert_eq!(err, DomainError::OutOfRange { index: -8, len: 6 });
            assert_eq!(doc.children(root).len(), 6);
        }

        #[test]
        fn reparenting_moves_the_subtree() {
            let (mut doc, [a, b, c, d]) = small_tree();
            doc.move_to(b, d, -1).expect("move");
            assert_eq!(doc.children(a), &[d]);
            assert_eq!(doc.parent(b), Some(d));
            assert_eq!(doc.children(b), &[c]);
            assert_eq!(doc.level(c), Some(3));
        }

        #[test]
        fn reordering_within_the_same_parent() {
            let (mut doc, [a, b, _, d]) = small_tree();
            doc.insert_child(a, b, -1).expect("to end");
            assert_eq!(doc.children(a), &[d, b]);
        }

        #[test]
        fn cycles_and_root_moves_are_rejected() {
            let (mut doc, [a, _, c, _]) = small_tree();
            assert_eq!(doc.move_to(a, c, 0), Err(DomainError::CycleDetected(a)));
            assert_eq!(doc.move_to(a, a, 0), Err(DomainError::CycleDetected(a)));
            let root = doc.root();
            assert_eq!(doc.move_to(root, a, 0), Err(DomainError::RootNotMovable));
            assert_eq!(doc.parent(a), Some(root));
        }

        #[test]
        fn remove_children_returns_original_order() {
            let mut doc = Document::default();
            let root = doc.root();
            let ids = doc.add_children(root, ["a", "b", "c", "d"]).expect("children");
            assert_eq!(doc.remove_children(root, 1..3), vec![ids[1], ids[2]]);
            assert_eq!(doc.children(root), &[ids[0], ids[3]]);
            let (from, to) = (2, 1);
            assert!(doc.remove_children(root, from..to).is_empty());
            assert_eq!(doc.remove_child(root, ids[3]), Some(ids[3]));
            assert_eq!(doc.remove_child(root, 5usize), None);
            assert_eq!(doc.remove_all_children(root), vec![ids[0]]);
            assert!(doc.item(ids[1]).is_some());
            assert_eq!(doc.parent(ids[1]), None);
        }

        #[test]
        fn deleted_handles_go_stale() {
            let (mut doc, [a, b, c, _]) = small_tree();
            let root = doc.root();
            assert_eq!(doc.remove_child(a, b), Some(b));
            assert_eq!(doc.purge_detached(), 2);
            assert!(!doc.contains(b));
            assert!(!doc.contains(c));
            let fresh = doc.add_child(root, "fresh").expect("fresh");
            assert!(!doc.contains(b) && !doc.contains(c));
            assert!(doc.contains(fresh));
            assert_eq!(doc.set_content(b, "x"), Err(DomainError::UnknownNode(b)));
        }

        #[test]
        fn flattening_order() {
            let (doc, [a, b, c, d]) = small_tree();
            assert_eq!(doc.children_flat(a, None, TraversalOrder::PreOrder), vec![b, c, d]);
            assert_eq!(doc.children_flat(a, None, TraversalOrder::PostOrder), vec![c, b, d]);
            assert_eq!(doc.children_flat(a, Some(ItemKind::Task), TraversalOrder::PreOrder), vec![b, d]);
            assert_eq!(doc.items_of_kind(ItemKind::Note), vec![c]);
        }

        #[test]
        fn levels_siblings_and_projects() {
            let (mut doc, [a, b, c, d]) = small_tree();
            assert_eq!(doc.level(doc.root()), Some(-1));
            assert_eq!(doc.level(a), Some(0));
            assert_eq!(doc.level(c), Some(2));
            assert_eq!(doc.next_sibling(b), Some(d));
            assert_eq!(doc.previous_sibling(b), None);
            assert_eq!(doc.next_sibling(a), None);
            assert_eq!(doc.project(c), Some(a));
            assert_eq!(doc.project(a), None);

            doc.item_mut(c).expect("c").set_extra_indent(2);
            assert_eq!(doc.effective_level(c), Some(4));
            let loose = doc.create_item("\t\tloose");
            assert_eq!(doc.level(loose), Some(0));
            assert_eq!(doc.effective_level(loose), Some(2));
        }

        #[test]
        fn totals_roll_up_into_tagged_branches() {
            let mut doc = Document::default();
            let root = doc.root();
            let budget = doc.add_child(root, "Budget: @cost").expect("budget");
            doc.add_children(budget, ["- rent @cost(3)", "- food @cost(5 EUR)", "- free"]).expect("leaves");
            let plain = doc.add_child(root, "Other:").expect("other");
            doc.add_child(plain, "- misc @cost(2)").expect("misc");

            assert_eq!(doc.total_tag_values(root, "cost", false), 10);
            assert_eq!(doc.item(budget).expect("budget").content(), "Budget: @cost(8)");
            assert_eq!(doc.item(plain).expect("other").content(), "Other:");

            doc.total_tag_values(root, "cost", true);
            assert_eq!(doc.item(plain).expect("other").content(), "Other: @cost(2)");
            assert_eq!(doc.kind(plain), Some(ItemKind::Project));
        }

        #[test]
        fn totals_saturate_instead_of_overflowing() {
            let mut doc = Document::default();
            let root = doc.root();
            let p = doc.add_child(root, "P: @n").expect("p");
            doc.add_children(p, ["- a @n(9223372036854775807)", "- b @n(1)", "- c @n(123456789012345678901234)"])
                .expect("leaves");
            assert_eq!(doc.total_tag_values(root, "n", false), i64::MAX);
            assert_eq!(doc.item(p).expect("p").tag_value("n"), i64::MAX.to_string());
        }

        #[test]
        fn leading_integer_reads_first_digit_run() {
            assert_eq!(leading_integer("about 12 or 13"), 12);
            assert_eq!(leading_integer("none"), 0);
            assert_eq!(leading_integer("99999999999999999999999"), i64::MAX);
        }

        #[test]
        fn tag_queries() {
            let mut doc = Document::default();
            let root = doc.root();
            let ids = doc
                .add_children(root, ["- a @p(high) @x", "- b @P(low)", "- c @done"])
                .expect("children");
            assert_eq!(doc.items_with_tag("p", None), vec![ids[0], ids[1]]);
            assert_eq!(doc.items_with_tag("p", Some("low")), vec![ids[1]]);
            assert_eq!(doc.all_tags(false, true), vec!["@P", "@done", "@p", "@x"]);
            assert_eq!(doc.all_tags(true, false), vec!["P(low)", "done", "p(high)", "x"]);
        }
    }
}

pub mod storage {
    use super::document::Document;
    use anyhow::Result;
    use std::path::Path;

    /// Loads an outline from disk.
    pub trait DocumentParser {
        fn parse_file(&self, abs_path: &Path) -> Result<Document>;
    }

    /// Persists an outline.
    pub trait DocumentWriter {
        fn write_file(&self, doc: &Document, abs_path: &Path) -> Result<()>;
    }
}

pub mod parser {
    use anyhow::{Context, Result};
    use std::{fs, path::Path};
    use tracing::{debug, trace, warn};

    use crate::core::{NodeId, Settings};
    use crate::document::Document;
    use crate::markup;
    use crate::storage::DocumentParser;

    /* ------------------------------ Builder ------------------------------ */

    /// Streams indented lines into a [`Document`].
    ///
    /// Each line attaches relative to the previous one: deeper lines become
    /// its children, equal lines its siblings and shallower lines climb back
    /// up the tree. Jumps of more than one level are remembered as
    /// `extra_indent` so the text can be written back unchanged.
    pub struct TreeBuilder<'d> {
        doc: &'d mut Document,
        current: NodeId,
        current_level: isize,
    }

    impl<'d> TreeBuilder<'d> {
        pub fn new(doc: &'d mut Document) -> Self {
            let current = doc.root();
            Self { doc, current, current_level: -1 }
        }

        pub fn push_line(&mut self, line: &str) -> NodeId {
            let indent = markup::measure_indentation(line, self.doc.settings().tab_size);
            self.push(indent.levels, &line[indent.consumed..])
        }

        /// Attach `text` as a line indented `level` levels deep.
        pub fn push(&mut self, level: usize, text: &str) -> NodeId {
            let level = level as isize;
            let delta = level - self.current_level;
            let root = self.doc.root();
            let parent = match delta {
                d if d > 0 => self.current,
                d if d < 0 => self.ancestor_below(level),
                _ => self.doc.parent(self.current).unwrap_or(root),
            };

            let id = self.doc.create_item(text);
            if delta > 1 {
                if let Some(item) = self.doc.item_mut(id) {
                    item.set_extra_indent((delta - 1) as usize);
                }
            }
            match self.doc.add_child(parent, id) {
                Ok(_) => trace!(node = %id, level, delta, "line attached"),
                Err(err) => warn!(%err, node = %id, %parent, "line left detached"),
            }

            self.current = id;
            self.current_level = level;
            id
        }

        /// Climb from the current item while the ancestor sits at `level` or deeper.
        fn ancestor_below(&self, level: isize) -> NodeId {
            let mut ancestor = self.current;
            let mut tree_level = self.doc.level(ancestor).unwrap_or(-1);
            while tree_level >= level {
                match self.doc.parent(ancestor) {
                    Some(p) => {
                        ancestor = p;
                        tree_level -= 1;
                    }
                    None => break,
                }
            }
            ancestor
        }
    }

    /* ------------------------------ Entry ------------------------------ */

    /// Split on `\r\n`, `\n` or `\r`. A trailing terminator does not open
    /// another line.
    pub fn split_lines(input: &str) -> Vec<&str> {
        let bytes = input.as_bytes();
        let mut lines = Vec::new();
        let (mut start, mut i) = (0, 0);
        while i < bytes.len() {
            match bytes[i] {
                b'\n' => {
                    lines.push(&input[start..i]);
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    lines.push(&input[start..i]);
                    i += if bytes.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
                    start = i;
                }
                _ => i += 1,
            }
        }
        if start < input.len() {
            lines.push(&input[start..]);
        }
        lines
    }

    /// Parse outline text. Every input yields a document.
    pub fn parse_document_from_str(settings: &Settings, input: &str) -> Document {
        let mut doc = Document::new(settings.clone());
        let lines = split_lines(input);
        let mut builder = TreeBuilder::new(&mut doc);
        for line in &lines {
            builder.push_line(line);
        }
        debug!(lines = lines.len(), "parsed outline");
        doc
    }

    /// Reads `.taskpaper` files with the given settings.
    #[derive(Debug, Clone, Default)]
    pub struct TextDocumentParser {
        pub settings: Settings,
    }

    impl TextDocumentParser {
        pub fn new(settings: Settings) -> Self {
            Self { settings }
        }
    }

    impl DocumentParser for TextDocumentParser {
        fn parse_file(&self, abs_path: &Path) -> Result<Document> {
            let text = fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            debug!(path = %abs_path.display(), bytes = text.len(), "loading outline");
            Ok(parse_document_from_str(&self.settings, &text))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::ItemKind;
        use crate::format::format_document;

        fn parse(input: &str) -> Document {
            parse_document_from_str(&Settings::default(), input)
        }

        #[test]
        fn indentation_jumps_are_kept() {
            let input = "A:\n\t- b\n\t\t\tc\n\t\td\n";
            let doc = parse(input);
            let levels: Vec<isize> = doc.items().iter().map(|id| doc.effective_level(*id).expect("level")).collect();
            assert_eq!(levels, vec![0, 1, 3, 2]);

            let items = doc.items();
            assert_eq!(doc.parent(items[3]), Some(items[1]));
            assert_eq!(doc.item(items[2]).expect("c").extra_indent(), 1);
            assert_eq!(format_document(&doc), input);
        }

        #[test]
        fn round_trips_a_typical_outline() {
            let input = "Inbox:\n\t- call mom @today\n\t\tnotes about the call\nWork: @focus\n\t- ship it @due(2024-05-01)\n\t- review https://example.com/pr/1\n";
            let doc = parse(input);
            assert_eq!(format_document(&doc), input);
            assert_eq!(doc.items_of_kind(ItemKind::Project).len(), 2);
            assert_eq!(doc.items_of_kind(ItemKind::Task).len(), 3);
        }

        #[test]
        fn space_indentation_becomes_tabs() {
            let doc = parse("A:\n    - b\n        c\n");
            assert_eq!(format_document(&doc), "A:\n\t- b\n\t\tc\n");
        }

        #[test]
        fn line_terminators() {
            assert_eq!(split_lines("a\r\nb\rc\nd"), vec!["a", "b", "c", "d"]);
            assert_eq!(split_lines("a\n"), vec!["a"]);
            assert_eq!(split_lines("\n\n"), vec!["", ""]);
            assert!(split_lines("").is_empty());

            let doc = parse("- a\r\n- b\r\n");
            assert_eq!(format_document(&doc), "- a\n- b\n");
        }

        #[test]
        fn empty_input_and_blank_lines() {
            assert!(parse("").items().is_empty());

            let doc = parse("A:\n\n- b\n");
            let items = doc.items();
            assert_eq!(items.len(), 3);
            assert_eq!(doc.kind(items[1]), Some(ItemKind::Note));
            assert_eq!(doc.item(items[1]).expect("blank").content(), "");
        }

        #[test]
        fn over_indented_first_line() {
            let doc = parse("\t\tdeep\n");
            let first = doc.items()[0];
            assert_eq!(doc.parent(first), Some(doc.root()));
            assert_eq!(doc.item(first).expect("deep").extra_indent(), 2);
            assert_eq!(format_document(&doc), "\t\tdeep\n");
        }

        #[test]
        fn atx_headings_convert_when_enabled() {
            let settings = Settings { convert_atx_headings: true, ..Settings::default() };
            let doc = parse_document_from_str(&settings, "# Plans\n\t- one\n");
            let first = doc.items()[0];
            assert_eq!(doc.kind(first), Some(ItemKind::Project));
            assert_eq!(format_document(&doc), "Plans:\n\t- one\n");
        }

        #[test]
        fn parses_files_from_disk() {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("todo.taskpaper");
            fs::write(&path, "Home:\n\t- sweep @done\n").expect("write");

            let doc = TextDocumentParser::default().parse_file(&path).expect("parse");
            assert_eq!(doc.items_with_tag("done", None).len(), 1);

            let missing = TextDocumentParser::default().parse_file(&dir.path().join("nope.taskpaper"));
            assert!(missing.is_err());
        }
    }
}

pub mod transform {
    //! Pluggable rewrites applied to each run of an item's text while it is
    //! rendered.

    use indexmap::IndexMap;
    use once_cell::sync::Lazy;
    use regex::{Captures, Regex};
    use std::fmt;

    use crate::core::Item;

    /// Which part of an item a piece of text came from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum RunKind {
        Text,
        TagName,
        TagValue,
        Link,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum OutputKind {
        Text,
        Html,
        Json,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RunContext<'a> {
        pub run: RunKind,
        pub output: OutputKind,
        /// Set for [`RunKind::TagValue`] runs.
        pub tag_name: Option<&'a str>,
    }

    impl<'a> RunContext<'a> {
        pub fn new(run: RunKind, output: OutputKind) -> Self {
            Self { run, output, tag_name: None }
        }

        pub fn with_tag_name(mut self, name: &'a str) -> Self {
            self.tag_name = Some(name);
            self
        }
    }

    pub trait Transform {
        fn name(&self) -> &str;
        fn transform(&self, item: &Item, text: &str, ctx: &RunContext<'_>) -> String;
    }

    /// Ordered list of transforms; each one sees the previous one's output.
    pub struct TransformChain {
        transforms: Vec<Box<dyn Transform>>,
        disabled: bool,
    }

    impl fmt::Debug for TransformChain {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("TransformChain")
                .field("transforms", &self.names())
                .field("disabled", &self.disabled)
                .finish()
        }
    }

    impl Default for TransformChain {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TransformChain {
        pub fn new() -> Self {
            Self { transforms: Vec::new(), disabled: false }
        }

        /// Entity encoding, markdown spans, emoticons and tag icons, in that order.
        pub fn html_defaults() -> Self {
            let mut chain = Self::new();
            chain.push(Box::new(EntityEncoding));
            chain.push(Box::new(MarkdownSpans));
            chain.push(Box::new(Emoticons));
            chain.push(Box::new(TagIcons::default()));
            chain
        }

        /// Append a transform. Returns `false` (and drops it) when one with
        /// the same name is already registered.
        pub fn push(&mut self, transform: Box<dyn Transform>) -> bool {
            if self.transforms.iter().any(|t| t.name() == transform.name()) {
                return false;
            }
            self.transforms.push(transform);
            true
        }

        pub fn remove(&mut self, name: &str) -> Option<Box<dyn Transform>> {
            let pos = self.transforms.iter().position(|t| t.name() == name)?;
            Some(self.transforms.remove(pos))
        }

        pub fn names(&self) -> Vec<&str> {
            self.transforms.iter().map(|t| t.name()).collect()
        }

        pub fn set_enabled(&mut self, enabled: bool) {
            self.disabled = !enabled;
        }

        pub fn is_enabled(&self) -> bool {
            !self.disabled
        }

        pub fn apply(&self, item: &Item, text: &str, ctx: &RunContext<'_>) -> String {
            if self.disabled {
                return text.to_string();
            }
            self.transforms
                .iter()
                .fold(text.to_string(), |acc, t| t.transform(item, &acc, ctx))
        }
    }

    pub fn escape_html(text: &str) -> String {
        text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
    }

    /* ------------------------------ Built-ins ------------------------------ */

    /// Escapes `&`, `<` and `>` in plain text runs of HTML output.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct EntityEncoding;

    impl Transform for EntityEncoding {
        fn name(&self) -> &str {
            "entity-encoding"
        }

        fn transform(&self, _item: &Item, text: &str, ctx: &RunContext<'_>) -> String {
            if ctx.output == OutputKind::Html && ctx.run == RunKind::Text {
                escape_html(text)
            } else {
                text.to_string()
            }
        }
    }

    static EMPHASIS: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(\*{1,2})([^*]+?)\*{1,2}|(_{1,2})([^_]+?)_{1,2}").unwrap());
    static CODE_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());

    /// `*em*`, `**strong**` (or underscores) and `` `code` `` in HTML text runs.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MarkdownSpans;

    impl Transform for MarkdownSpans {
        fn name(&self) -> &str {
            "markdown"
        }

        fn transform(&self, _item: &Item, text: &str, ctx: &RunContext<'_>) -> String {
            if ctx.output != OutputKind::Html || ctx.run != RunKind::Text {
                return text.to_string();
            }
            let mut out = text.to_string();
            while EMPHASIS.is_match(&out) {
                out = EMPHASIS
                    .replace_all(&out, |caps: &Captures<'_>| {
                        let (marks, inner) = match caps.get(1) {
                            Some(m) => (m.as_str(), caps.get(2).map_or("", |g| g.as_str())),
                            None => (
                                caps.get(3).map_or("", |g| g.as_str()),
                                caps.get(4).map_or("", |g| g.as_str()),
                            ),
                        };
                        let tag = if marks.len() == 1 { "em" } else { "strong" };
                        format!("<{tag}>{inner}</{tag}>")
                    })
                    .into_owned();
            }
            CODE_SPAN
                .replace_all(&out, |caps: &Captures<'_>| {
                    let code = caps[1].replace('<', "&lt;").replace('>', "&gt;");
                    format!("<code>{code}</code>")
                })
                .into_owned()
        }
    }

    static EMOTICONS: Lazy<Vec<(Regex, &'static str, &'static str)>> = Lazy::new(|| {
        vec![
            (Regex::new(r":-?\)").unwrap(), "😃", "smile"),
            (Regex::new(r":-?\(").unwrap(), "🙁", "sadface"),
            (Regex::new(r";-?\)").unwrap(), "😉", "wink"),
            (Regex::new(r":-?/").unwrap(), "😕", "confused"),
        ]
    });

    /// Replaces text smileys with emoji spans in HTML text runs.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Emoticons;

    impl Transform for Emoticons {
        fn name(&self) -> &str {
            "emoticons"
        }

        fn transform(&self, _item: &Item, text: &str, ctx: &RunContext<'_>) -> String {
            if ctx.output != OutputKind::Html || ctx.run != RunKind::Text {
                return text.to_string();
            }
            EMOTICONS.iter().fold(text.to_string(), |acc, (pattern, emoji, class)| {
                pattern
                    .replace_all(&acc, format!("<span class='emoticon {class}' title='{class}'>{emoji}</span>").as_str())
                    .into_owned()
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct TagIcon {
        pub replacement: Option<String>,
        /// Icons for particular values, keyed by lowercase value.
        pub values: IndexMap<String, String>,
    }

    /// Swaps well-known tag names (and some of their values) for icons.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TagIcons {
        pub icons: IndexMap<String, TagIcon>,
    }

    impl Default for TagIcons {
        fn default() -> Self {
            let mut icons = IndexMap::new();
            icons.insert("flag".to_string(), TagIcon { replacement: Some("🚩".into()), values: IndexMap::new() });
            let mut priority = IndexMap::new();
            priority.insert("high".to_string(), "‼️".to_string());
            priority.insert("1".to_string(), "‼️".to_string());
            icons.insert("priority".to_string(), TagIcon { replacement: Some("💥".into()), values: priority });
            icons.insert("done".to_string(), TagIcon { replacement: Some("✅".into()), values: IndexMap::new() });
            Self { icons }
        }
    }

    impl Transform for TagIcons {
        fn name(&self) -> &str {
            "tag-icons"
        }

        fn transform(&self, _item: &Item, text: &str, ctx: &RunContext<'_>) -> String {
            if ctx.output != OutputKind::Html {
                return text.to_string();
            }
            let icon = match ctx.run {
                RunKind::TagName => self
                    .icons
                    .get(&text.to_lowercase())
                    .and_then(|icon| icon.replacement.clone()),
                RunKind::TagValue => ctx
                    .tag_name
                    .and_then(|name| self.icons.get(&name.to_lowercase()))
                    .and_then(|icon| icon.values.get(&text.to_lowercase()).cloned()),
                _ => None,
            };
            icon.unwrap_or_else(|| text.to_string())
        }
    }

}

pub mod projection {
    use serde::Serialize;

    use crate::core::{ItemKind, Link, NodeId, SourceRange, Tag};
    use crate::document::Document;
    use crate::transform::{OutputKind, RunContext, RunKind, TransformChain};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "type", rename_all = "lowercase")]
    pub enum SpanView {
        Tag { name: String, value: Option<String>, begin: usize, end: usize },
        Link { text: String, url: String, begin: usize, end: usize },
    }

    impl SpanView {
        pub fn begin(&self) -> usize {
            match self {
                SpanView::Tag { begin, .. } | SpanView::Link { begin, .. } => *begin,
            }
        }
    }

    /// Byte range in `content` as char offsets.
    fn char_span(content: &str, range: &SourceRange) -> (usize, usize) {
        let begin = content.get(..range.start).unwrap_or(content).chars().count();
        (begin, begin + range.slice(content).chars().count())
    }

    fn tag_view(content: &str, t: &Tag) -> SpanView {
        let (begin, end) = char_span(content, &t.range);
        SpanView::Tag { name: t.name.clone(), value: t.value.clone(), begin, end }
    }

    fn link_view(content: &str, l: &Link) -> SpanView {
        let (begin, end) = char_span(content, &l.range);
        SpanView::Link { text: l.text.clone(), url: l.url.clone(), begin, end }
    }

    /// Render-ready snapshot of one item and its subtree.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ItemView {
        #[serde(rename = "type")]
        pub kind: ItemKind,
        pub type_name: &'static str,
        pub content: String,
        pub title: String,
        pub id_attr: String,
        pub content_hash: String,
        pub level: isize,
        pub effective_level: isize,
        pub extra_indent: usize,
        pub done: bool,
        pub tags: Vec<SpanView>,
        pub links: Vec<SpanView>,
        pub children: Vec<ItemView>,
    }

    impl ItemView {
        /// Tags and links ordered by `begin`, tags first on ties.
        pub fn metadata(&self) -> Vec<&SpanView> {
            let mut spans: Vec<&SpanView> = self.tags.iter().chain(self.links.iter()).collect();
            spans.sort_by_key(|s| s.begin());
            spans
        }
    }

    /// Views of the root's children, recursively.
    pub fn project(doc: &Document, transforms: &TransformChain, output: OutputKind) -> Vec<ItemView> {
        doc.children(doc.root())
            .iter()
            .filter_map(|id| project_item(doc, *id, transforms, output))
            .collect()
    }

    pub fn project_item(doc: &Document, id: NodeId, transforms: &TransformChain, output: OutputKind) -> Option<ItemView> {
        let item = doc.item(id)?;
        let ctx = RunContext::new(RunKind::Text, output);
        Some(ItemView {
            kind: item.kind(),
            type_name: item.kind().type_name(),
            content: transforms.apply(item, item.content(), &ctx),
            title: item.title().to_string(),
            id_attr: item.id_attr(),
            content_hash: item.content_hash(),
            level: doc.level(id)?,
            effective_level: doc.effective_level(id)?,
            extra_indent: item.extra_indent(),
            done: item.is_done(),
            tags: item.tags().iter().map(|t| tag_view(item.content(), t)).collect(),
            links: item.links().iter().map(|l| link_view(item.content(), l)).collect(),
            children: doc
                .children(id)
                .iter()
                .filter_map(|c| project_item(doc, *c, transforms, output))
                .collect(),
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::Settings;
        use crate::parser::parse_document_from_str;

        #[test]
        fn views_mirror_the_tree() {
            let doc = parse_document_from_str(&Settings::default(), "Trip:\n\t- book example.com @due(may) @done\n");
            let views = project(&doc, &TransformChain::new(), OutputKind::Json);
            assert_eq!(views.len(), 1);
            let trip = &views[0];
            assert_eq!(trip.kind, ItemKind::Project);
            assert_eq!(trip.title, "Trip");
            assert_eq!(trip.id_attr, "trip");

            let task = &trip.children[0];
            assert_eq!(task.level, 1);
            assert!(task.done);
            let begins: Vec<usize> = task.metadata().iter().map(|s| s.begin()).collect();
            assert_eq!(begins, vec![7, 19, 29]);
            assert!(matches!(task.metadata()[0], SpanView::Link { .. }));
        }

        #[test]
        fn offsets_count_chars_not_bytes() {
            let doc = parse_document_from_str(&Settings::default(), "- café @due(mon)\n");
            let views = project(&doc, &TransformChain::new(), OutputKind::Json);
            assert_eq!(views[0].tags[0], SpanView::Tag { name: "due".into(), value: Some("mon".into()), begin: 7, end: 16 });
        }
    }
}

pub mod format {
    use anyhow::{Context, Result};
    use std::fmt::Write;
    use std::{fs, path::Path};

    use crate::core::{Item, ItemKind, Metadata, NodeId};
    use crate::document::Document;
    use crate::projection::project;
    use crate::storage::DocumentWriter;
    use crate::transform::{OutputKind, RunContext, RunKind, TransformChain, escape_html};

    /// Pre-order walk below `id`, handing each item its effective level.
    fn walk(doc: &Document, id: NodeId, eff: isize, f: &mut dyn FnMut(&Item, isize)) {
        for &child in doc.children(id) {
            let Some(item) = doc.item(child) else { continue };
            let child_eff = eff + 1 + item.extra_indent() as isize;
            f(item, child_eff);
            walk(doc, child, child_eff, f);
        }
    }

    fn indent(out: &mut String, eff: isize) {
        for _ in 0..eff.max(0) {
            out.push('\t');
        }
    }

    /* ------------------------------- Text ------------------------------- */

    /// Canonical text: tab indentation and the configured line break after
    /// every item.
    pub fn format_document(doc: &Document) -> String {
        to_text(doc, &TransformChain::new())
    }

    pub fn to_text(doc: &Document, transforms: &TransformChain) -> String {
        let lb = doc.settings().line_break.as_str();
        let ctx = RunContext::new(RunKind::Text, OutputKind::Text);
        let mut out = String::new();
        walk(doc, doc.root(), -1, &mut |item: &Item, eff: isize| {
            indent(&mut out, eff);
            out.push_str(&transforms.apply(item, item.content(), &ctx));
            out.push_str(lb);
        });
        out
    }

    /// Outline of item types, optionally with titles.
    pub fn to_structure(doc: &Document, include_titles: bool) -> String {
        let lb = doc.settings().line_break.as_str();
        let mut out = String::new();
        walk(doc, doc.root(), -1, &mut |item: &Item, eff: isize| {
            indent(&mut out, eff);
            let _ = write!(out, "[{}]", item.kind().type_name());
            if include_titles {
                out.push(' ');
                out.push_str(item.title());
            }
            out.push_str(lb);
        });
        out
    }

    pub fn to_tags(doc: &Document, include_values: bool) -> String {
        let lb = doc.settings().line_break.as_str();
        let mut out = String::new();
        walk(doc, doc.root(), -1, &mut |item: &Item, eff: isize| {
            indent(&mut out, eff);
            let _ = write!(out, "[{}] ", item.kind().type_name());
            if item.tags().is_empty() {
                out.push_str("(none)");
            }
            for (i, t) in item.tags().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let value = if include_values { t.value.as_deref() } else { None };
                out.push_str(&crate::core::Tag::render(&t.name, value));
            }
            out.push_str(lb);
        });
        out
    }

    /// One link per line. With `add_missing_protocols` bare domains and
    /// addresses come out as full `http://` / `mailto:` URLs.
    pub fn to_links(doc: &Document, add_missing_protocols: bool) -> String {
        let lb = doc.settings().line_break.as_str();
        let mut out = String::new();
        walk(doc, doc.root(), -1, &mut |item: &Item, _| {
            for link in item.links() {
                out.push_str(if add_missing_protocols { &link.url } else { &link.text });
                out.push_str(lb);
            }
        });
        out
    }

    pub fn to_json(doc: &Document, transforms: &TransformChain) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&project(doc, transforms, OutputKind::Json))
    }

    /* ------------------------------- HTML ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct HtmlOptions {
        /// Render only items of this kind; others keep their place as empty
        /// `extra-indent` list items.
        pub only: Option<ItemKind>,
        pub sidebar: bool,
        /// Sidebar heading; left as a template placeholder when unset.
        pub document_title: Option<String>,
    }

    pub fn escape_attr(text: &str) -> String {
        escape_html(text).replace('\'', "&#39;").replace('"', "&quot;")
    }

    pub fn to_html(doc: &Document, transforms: &TransformChain, opts: &HtmlOptions) -> String {
        let mut body = String::new();
        for &child in doc.children(doc.root()) {
            render_html_item(doc, child, transforms, opts, &mut body);
        }
        if opts.sidebar {
            let title = opts
                .document_title
                .as_deref()
                .map_or_else(|| "{{ tp-document-title }}".to_string(), escape_html);
            format!(
                "<ul class='taskpaper-root sidebar'><li class='extra-indent' data-type='project'><a href='#top' title='Home'>{title}</a><ul class='extra-indent'>{body}</ul></li></ul>"
            )
        } else {
            format!("<ul class='taskpaper-root'>{body}</ul>")
        }
    }

    /// Project navigation list.
    pub fn to_sidebar(doc: &Document, transforms: &TransformChain, document_title: Option<&str>) -> String {
        let opts = HtmlOptions {
            only: Some(ItemKind::Project),
            sidebar: true,
            document_title: document_title.map(str::to_string),
        };
        to_html(doc, transforms, &opts)
    }

    fn render_html_item(doc: &Document, id: NodeId, transforms: &TransformChain, opts: &HtmlOptions, out: &mut String) {
        let Some(item) = doc.item(id) else { return };
        let lb = doc.settings().line_break.as_str();
        let children = doc.children(id);
        let kind = item.kind();
        let class = kind.as_str();

        for _ in 0..item.extra_indent() {
            out.push_str("<li class='extra-indent'><ul class='extra-indent'>");
        }

        let data_attrs: String = item
            .tags()
            .iter()
            .map(|t| format!(" data-{}='{}'", escape_attr(&t.name), escape_attr(t.value.as_deref().unwrap_or(""))))
            .collect();
        let shown = opts.only.is_none_or(|k| k == kind);

        if shown && !opts.sidebar {
            let proj_id = if kind == ItemKind::Project { format!("id='{}' ", escape_attr(&item.id_attr())) } else { String::new() };
            let empty = if item.content().is_empty() && children.is_empty() { " empty" } else { "" };
            let leaf = if children.is_empty() { " leaf" } else { "" };
            let depth = doc.effective_level(id).unwrap_or(0) + 1;
            let _ = write!(out, "<li {proj_id}class='{class}' data-type='{class}'{data_attrs} depth='{depth}'{empty}{leaf}>");
            render_runs(item, transforms, out);
        } else if shown && kind == ItemKind::Project {
            let title = escape_attr(item.title());
            let _ = write!(
                out,
                "<li class='{class}' data-type='{class}'{data_attrs}><a href='#{}' title='{title}'>{title}</a>",
                escape_attr(&item.id_attr())
            );
        } else {
            out.push_str("<li class='extra-indent'>");
        }

        if !children.is_empty() {
            let _ = write!(out, "{lb}<ul>{lb}");
            for &child in children {
                render_html_item(doc, child, transforms, opts, out);
            }
            let _ = write!(out, "{lb}</ul>{lb}");
        }
        let _ = write!(out, "</li>{lb}");

        for _ in 0..item.extra_indent() {
            out.push_str("</ul></li>");
        }
    }

    fn content_span(item: &Item, transforms: &TransformChain, text: &str, out: &mut String) {
        let ctx = RunContext::new(RunKind::Text, OutputKind::Html);
        let _ = write!(out, "<span class='content' content>{}</span>", transforms.apply(item, text, &ctx));
    }

    /// Split the content into prefix, text, tag and link spans.
    fn render_runs(item: &Item, transforms: &TransformChain, out: &mut String) {
        let content = item.content();
        let mut pos = 0;

        if item.kind() == ItemKind::Task {
            let marker = content.get(..1).unwrap_or("");
            let gap = content.get(1..2).unwrap_or("");
            let _ = write!(out, "<span class='task-prefix'><span class='task-marker'>{marker}</span>{gap}</span>");
            pos = 2.min(content.len());
        }

        let meta = item.metadata();
        if meta.is_empty() {
            content_span(item, transforms, &content[pos..], out);
            return;
        }

        for m in &meta {
            let range = m.range();
            // overlapping tag/link pairs: the earlier span wins
            if range.start < pos {
                continue;
            }
            if pos < range.start {
                content_span(item, transforms, &content[pos..range.start], out);
            }
            match m {
                Metadata::Tag(t) => {
                    let tag = escape_attr(&t.name);
                    let name_ctx = RunContext::new(RunKind::TagName, OutputKind::Html);
                    let name = transforms.apply(item, &t.name, &name_ctx);
                    let title = t.value.as_deref().map(|v| format!(" title='{}'", escape_attr(v))).unwrap_or_default();
                    let _ = write!(out, "<span class='tag' tag='data-{tag}' tagname='data-{tag}'{title} content>@{name}</span>");
                    if let Some(value) = t.value.as_deref() {
                        let value_ctx = RunContext::new(RunKind::TagValue, OutputKind::Html).with_tag_name(&t.name);
                        let shown = transforms.apply(item, &escape_html(value), &value_ctx);
                        let _ = write!(
                            out,
                            "<span class='tag' tag='data-{tag}' content>(</span><span class='tag' tag='data-{tag}' tagvalue='{}' content>{shown}</span><span class='tag' tag='data-{tag}' content>)</span>",
                            escape_attr(value)
                        );
                    }
                }
                Metadata::Link(l) => {
                    let link_ctx = RunContext::new(RunKind::Link, OutputKind::Html);
                    let text = transforms.apply(item, &escape_html(&l.text), &link_ctx);
                    let _ = write!(
                        out,
                        "<span class='link' link='{}' content><a href='{}' target='_blank'>{text}</a></span>",
                        escape_attr(&l.text),
                        escape_attr(&l.url)
                    );
                }
            }
            pos = range.end;
        }

        if pos < content.len() {
            content_span(item, transforms, &content[pos..], out);
        }
    }

    /* ------------------------------ Writer ------------------------------ */

    /// Writes documents back as outline text.
    #[derive(Debug, Default)]
    pub struct TextWriter {
        pub transforms: TransformChain,
    }

    impl DocumentWriter for TextWriter {
        fn write_file(&self, doc: &Document, abs_path: &Path) -> Result<()> {
            fs::write(abs_path, to_text(doc, &self.transforms)).with_context(|| format!("writing {:?}", abs_path))
        }
    }

}

pub use crate::core::{DomainError, Item, ItemKind, LineBreak, NodeId, Settings};
pub use document::{Document, TraversalOrder};
pub use format::format_document;
pub use parser::{TextDocumentParser, parse_document_from_str};
