//! Failed-test extraction from HTML test reports.
//!
//! The Android Gradle plugin writes an HTML summary whose failure rows link
//! to `<class>.html#<method>`. [`HtmlReportParser`] walks the markup with a
//! lenient XML reader, collects those links from rows flagged with the
//! `failures` CSS class, and returns them as a [`FailureSet`].
//!
//! Reports written by some plugin versions are truncated before the closing
//! `</html>`; the tag is appended before parsing so such reports still yield
//! their failures.

use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use droidci_types::{FailedTestId, FailureSet};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

/// Method names that mean "no test identified".
pub const SENTINEL_METHODS: &[&str] = &["null", "No tests found."];

const ROOT_CLOSE: &str = "</html>";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("failed to read report {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed report {}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: quick_xml::Error,
    },
}

/// Extracts failed test identifiers from a report artifact.
pub trait ReportParser {
    fn parse_failures(&self, report_path: &Path) -> Result<FailureSet, ReportError>;
}

/// Parser for the HTML reports produced by `connectedAndroidTest`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlReportParser;

impl ReportParser for HtmlReportParser {
    fn parse_failures(&self, report_path: &Path) -> Result<FailureSet, ReportError> {
        let content = match fs::read_to_string(report_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ReportError::Missing(report_path.to_path_buf()));
            }
            Err(source) => {
                return Err(ReportError::Io {
                    path: report_path.to_path_buf(),
                    source,
                });
            }
        };

        parse_html_failures(&content).map_err(|source| ReportError::Malformed {
            path: report_path.to_path_buf(),
            source,
        })
    }
}

/// Append `</html>` when the document does not end with it.
pub fn repair_unclosed_root(content: &str) -> Cow<'_, str> {
    let tail = content.trim_end();
    let closed = tail.len() >= ROOT_CLOSE.len()
        && tail[tail.len() - ROOT_CLOSE.len()..].eq_ignore_ascii_case(ROOT_CLOSE);
    if closed {
        Cow::Borrowed(content)
    } else {
        let mut repaired = String::with_capacity(content.len() + ROOT_CLOSE.len() + 1);
        repaired.push_str(content);
        repaired.push('\n');
        repaired.push_str(ROOT_CLOSE);
        Cow::Owned(repaired)
    }
}

/// Parse report markup into the set of failed tests.
pub fn parse_html_failures(content: &str) -> quick_xml::Result<FailureSet> {
    let repaired = repair_unclosed_root(content);
    let mut reader = Reader::from_str(&repaired);
    reader.trim_text(true);
    reader.check_end_names(false);

    let mut failures = FailureSet::new();
    let mut row = RowState::default();

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => {
                let name = e.name();
                let tag = name.as_ref();
                if tag.eq_ignore_ascii_case(b"tr") {
                    row.flush_into(&mut failures);
                    row.open = true;
                    row.failed = has_failure_class(&e);
                } else if row.open && tag.eq_ignore_ascii_case(b"td") {
                    row.failed |= has_failure_class(&e);
                } else if row.open && tag.eq_ignore_ascii_case(b"a") {
                    if let Some(href) = attr_value(&e, b"href") {
                        row.links.push(href);
                    }
                }
            }
            Event::End(e) => {
                let name = e.name();
                let tag = name.as_ref();
                if tag.eq_ignore_ascii_case(b"tr")
                    || tag.eq_ignore_ascii_case(b"table")
                    || tag.eq_ignore_ascii_case(b"tbody")
                {
                    row.flush_into(&mut failures);
                }
            }
            Event::Eof => {
                row.flush_into(&mut failures);
                break;
            }
            _ => {}
        }
    }

    Ok(failures)
}

/// Turn a failure link into an id. Returns `None` for class links and
/// sentinel methods.
pub fn test_id_from_href(href: &str) -> Option<FailedTestId> {
    let file = href.rsplit(['/', '\\']).next().unwrap_or(href);
    let (class, method) = file.split_once(".html#")?;
    let class = class.trim();
    let method = method.replace("%20", " ");
    let method = method.trim();
    if class.is_empty() || method.is_empty() || SENTINEL_METHODS.contains(&method) {
        return None;
    }
    Some(FailedTestId::new(class, method))
}

#[derive(Default)]
struct RowState {
    open: bool,
    failed: bool,
    links: Vec<String>,
}

impl RowState {
    fn flush_into(&mut self, failures: &mut FailureSet) {
        if self.open && self.failed {
            failures.extend(self.links.iter().filter_map(|href| test_id_from_href(href)));
        }
        *self = RowState::default();
    }
}

fn has_failure_class(e: &BytesStart<'_>) -> bool {
    attr_value(e, b"class")
        .map(|class| class.split_whitespace().any(|c| c == "failures"))
        .unwrap_or(false)
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    let mut attrs = e.attributes();
    attrs.with_checks(false);
    attrs
        .flatten()
        .find(|a| a.key.as_ref().eq_ignore_ascii_case(key))
        .map(|a| match a.unescape_value() {
            Ok(v) => v.into_owned(),
            Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
        })
}
