//! Content-language detection for international listings.
//!
//! Declared languages win: `<html lang>` first, then a
//! `<meta http-equiv="content-language">` or `<meta name="language">` tag.
//! Undeclared pages fall back to the dominant script for non-Latin text and
//! to stop-word frequency for Latin-script languages.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use stop_words::LANGUAGE;

/// Share of letters a script needs before it decides the language.
const SCRIPT_SHARE: f64 = 0.3;
/// Stop-word hits needed before a Latin-script guess is trusted.
const MIN_STOP_WORD_HITS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageSource {
    HtmlLang,
    MetaTag,
    Script,
    StopWords,
}

impl LanguageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LanguageSource::HtmlLang => "html_lang",
            LanguageSource::MetaTag => "meta",
            LanguageSource::Script => "script",
            LanguageSource::StopWords => "stop_words",
        }
    }
}

impl fmt::Display for LanguageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedLanguage {
    /// ISO 639-1 code, lower case.
    pub code: String,
    pub source: LanguageSource,
}

static STOP_WORDS: LazyLock<Vec<(&'static str, HashSet<String>)>> = LazyLock::new(|| {
    [
        ("en", LANGUAGE::English),
        ("de", LANGUAGE::German),
        ("fr", LANGUAGE::French),
        ("es", LANGUAGE::Spanish),
        ("it", LANGUAGE::Italian),
        ("pt", LANGUAGE::Portuguese),
        ("nl", LANGUAGE::Dutch),
    ]
    .into_iter()
    .map(|(code, lang)| (code, stop_words::get(lang).into_iter().collect()))
    .collect()
});

static HTML_LANG: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("html[lang]").expect("html[lang] selector is valid"));
static META_TAGS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("meta[content]").expect("meta selector is valid"));
static BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("body selector is valid"));

/// `"en-US"` -> `"en"`, `"pt_BR"` -> `"pt"`. `None` for blank or wildcard tags.
fn primary_subtag(tag: &str) -> Option<String> {
    let primary = tag
        .split([',', ';'])
        .next()?
        .trim()
        .split(['-', '_'])
        .next()?
        .trim()
        .to_ascii_lowercase();
    let valid = (2..=3).contains(&primary.len()) && primary.chars().all(|c| c.is_ascii_alphabetic());
    valid.then_some(primary)
}

fn declared_meta(document: &Html) -> Option<String> {
    document.select(&META_TAGS).find_map(|el| {
        let meta = el.value();
        let is_language = meta
            .attr("http-equiv")
            .is_some_and(|v| v.eq_ignore_ascii_case("content-language"))
            || meta
                .attr("name")
                .is_some_and(|v| v.eq_ignore_ascii_case("language"));
        if is_language {
            meta.attr("content").and_then(primary_subtag)
        } else {
            None
        }
    })
}

/// Language from the dominant non-Latin script, if any.
pub fn detect_script(text: &str) -> Option<&'static str> {
    let (mut letters, mut kana, mut hangul, mut han, mut cyrillic, mut arabic) =
        (0usize, 0usize, 0usize, 0usize, 0usize, 0usize);
    for c in text.chars().filter(|c| c.is_alphabetic()) {
        letters += 1;
        match c as u32 {
            0x3040..=0x30FF | 0x31F0..=0x31FF => kana += 1,
            0xAC00..=0xD7AF | 0x1100..=0x11FF | 0x3130..=0x318F => hangul += 1,
            0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF => han += 1,
            0x0400..=0x04FF | 0x0500..=0x052F => cyrillic += 1,
            0x0600..=0x06FF | 0x0750..=0x077F => arabic += 1,
            _ => {}
        }
    }
    if letters == 0 {
        return None;
    }
    let share = |n: usize| n as f64 / letters as f64;

    // Japanese mixes kana into Han text; any real share of kana means Japanese.
    if kana > 0 && share(kana + han) >= SCRIPT_SHARE && share(kana) >= 0.05 {
        Some("ja")
    } else if share(hangul) >= SCRIPT_SHARE {
        Some("ko")
    } else if share(han) >= SCRIPT_SHARE {
        Some("zh")
    } else if share(cyrillic) >= SCRIPT_SHARE {
        Some("ru")
    } else if share(arabic) >= SCRIPT_SHARE {
        Some("ar")
    } else {
        None
    }
}

/// Latin-script language with the most stop-word hits.
pub fn detect_stop_words(text: &str) -> Option<&'static str> {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphabetic() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    if words.is_empty() {
        return None;
    }

    STOP_WORDS
        .iter()
        .map(|(code, list)| (*code, words.iter().filter(|w| list.contains(*w)).count()))
        .filter(|(_, hits)| *hits >= MIN_STOP_WORD_HITS)
        .max_by_key(|(_, hits)| *hits)
        .map(|(code, _)| code)
}

/// Detect the language of an HTML page.
pub fn detect_language(html: &str) -> Option<DetectedLanguage> {
    let document = Html::parse_document(html);

    if let Some(code) = document
        .select(&HTML_LANG)
        .next()
        .and_then(|el| el.value().attr("lang"))
        .and_then(primary_subtag)
    {
        return Some(DetectedLanguage {
            code,
            source: LanguageSource::HtmlLang,
        });
    }

    if let Some(code) = declared_meta(&document) {
        return Some(DetectedLanguage {
            code,
            source: LanguageSource::MetaTag,
        });
    }

    let text: String = match document.select(&BODY).next() {
        Some(body) => body.text().collect::<Vec<_>>().join(" "),
        None => document.root_element().text().collect::<Vec<_>>().join(" "),
    };

    if let Some(code) = detect_script(&text) {
        return Some(DetectedLanguage {
            code: code.to_string(),
            source: LanguageSource::Script,
        });
    }
    detect_stop_words(&text).map(|code| DetectedLanguage {
        code: code.to_string(),
        source: LanguageSource::StopWords,
    })
}
