//! CSS-selector field extraction shared by every engine.

use std::collections::BTreeMap;

use harvest_core::classify::RawFailure;
use harvest_core::error::ScrapeError;
use harvest_core::models::{FieldValue, Fields, PageResult};
use scraper::{Html, Selector};
use url::Url;

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_selector(field: &str, css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|e| {
        ScrapeError::validation(format!("Invalid selector '{css}' for field '{field}': {e}"))
    })
}

/// Extract every field of `selectors` from `html`.
///
/// A selector matching one element yields `Text`, several yield a `List` in
/// document order. A selector matching nothing fails the whole extraction
/// with PARSE_ERROR.
pub fn extract_fields(html: &str, selectors: &BTreeMap<String, String>) -> Result<Fields, ScrapeError> {
    let document = Html::parse_document(html);
    let mut fields = Fields::new();

    for (field, css) in selectors {
        let selector = parse_selector(field, css)?;
        let matches: Vec<String> = document
            .select(&selector)
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .collect();

        match FieldValue::from_matches(matches) {
            Some(value) => {
                fields.insert(field.clone(), value);
            }
            None => {
                let e: ScrapeError = RawFailure::SelectorMissing(css.clone()).into();
                return Err(ScrapeError {
                    message: format!("Selector '{css}' for field '{field}' matched no elements"),
                    ..e
                });
            }
        }
    }

    Ok(fields)
}

/// Absolute URL of the first element matching `selector` that has an `href`.
pub fn next_page_url(html: &str, selector: &str, base: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let base = Url::parse(base).ok()?;
    let document = Html::parse_document(html);
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .find_map(|href| base.join(href.trim()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(String::from)
}

/// `base` with query parameter `param` set to `page`.
pub fn page_url(base: &str, param: &str, page: u32) -> Result<String, ScrapeError> {
    let mut url = Url::parse(base)
        .map_err(|e| ScrapeError::validation(format!("Invalid URL '{base}': {e}")))?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, &page.to_string());
    Ok(url.into())
}

/// Current value of page counter `param` in `url`; 1 when absent.
pub fn page_number(url: &str, param: &str) -> u32 {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == param)
                .and_then(|(_, v)| v.parse().ok())
        })
        .unwrap_or(1)
}

/// Concatenate the values of every page, field by field, in page order.
pub fn merge_page_fields(pages: &[PageResult]) -> Fields {
    let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for page in pages {
        for (name, value) in &page.fields {
            merged
                .entry(name.clone())
                .or_default()
                .extend(value.values().into_iter().map(String::from));
        }
    }
    merged
        .into_iter()
        .filter_map(|(name, values)| FieldValue::from_matches(values).map(|v| (name, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use harvest_core::error::ErrorKind;

    use super::*;

    fn selectors(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    const LISTING: &str = r#"
        <html><body>
          <div class="tech-title">  Widget
             Mark II </div>
          <div class="tech-description">A gadget</div>
          <ul><li class="tag">energy</li><li class="tag">storage</li></ul>
          <a class="next" href="/technologies?page=2">Next</a>
        </body></html>"#;

    #[test]
    fn test_single_and_multiple_matches() {
        let fields = extract_fields(
            LISTING,
            &selectors(&[("title", ".tech-title"), ("tags", ".tag")]),
        )
        .unwrap();
        assert_eq!(fields["title"], FieldValue::Text("Widget Mark II".into()));
        assert_eq!(
            fields["tags"],
            FieldValue::List(vec!["energy".into(), "storage".into()])
        );
    }

    #[test]
    fn test_missing_selector_is_parse_error() {
        let err = extract_fields(LISTING, &selectors(&[("title", ".nope")])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
        assert!(err.message.contains(".nope"));
    }

    #[test]
    fn test_invalid_selector_is_validation_error() {
        let err = extract_fields(LISTING, &selectors(&[("title", "div[")])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[test]
    fn test_next_page_resolves_relative_href() {
        let next = next_page_url(LISTING, "a.next", "https://tech.mit.edu/technologies");
        assert_eq!(
            next.as_deref(),
            Some("https://tech.mit.edu/technologies?page=2")
        );
        assert!(next_page_url(LISTING, "a.prev", "https://tech.mit.edu/").is_none());
    }

    #[test]
    fn test_page_url_replaces_existing_param() {
        let url = page_url("https://www.nrel.gov/tech?page=1&sort=new", "page", 3).unwrap();
        assert_eq!(url, "https://www.nrel.gov/tech?sort=new&page=3");
    }

    #[test]
    fn test_page_number_defaults_to_first() {
        assert_eq!(page_number("https://www.nrel.gov/tech?page=4", "page"), 4);
        assert_eq!(page_number("https://www.nrel.gov/tech", "page"), 1);
        assert_eq!(page_number("https://www.nrel.gov/tech?page=x", "page"), 1);
    }

    #[test]
    fn test_merge_concatenates_in_page_order() {
        let page = |title: &str| PageResult {
            url: String::new(),
            status: 200,
            fields: Fields::from([("title".to_string(), FieldValue::Text(title.into()))]),
            bytes: 0,
        };
        let merged = merge_page_fields(&[page("a"), page("b")]);
        assert_eq!(merged["title"], FieldValue::List(vec!["a".into(), "b".into()]));
    }
}
