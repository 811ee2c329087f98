//! Raw runner output to [`TestRecord`]s.
//!
//! The raw output is JUnit-style XML. It is scanned with regular expressions
//! rather than a strict XML parser: truncated or malformed input (a runner
//! killed mid-write, an unclosed element) simply yields fewer matches instead
//! of an error. A test case that is still open when the next one starts is
//! dropped rather than merged into its neighbour.
//!
//! Per test case:
//! - id: `suite::name`, with `suite::#N` when the name is missing; duplicate
//!   ids get a `#N` suffix so every id is unique.
//! - duration: fractional seconds rounded to whole milliseconds; missing or
//!   invalid values become 0.
//! - status: a failure marker wins over a skip marker; a skip marker alone
//!   means skipped; otherwise passed.
//! - messages: entity-decoded, with CDATA wrappers stripped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::capability::{CatalogEntry, GatePlan, GatedTest};
use crate::error::{HarnessError, HarnessResult};
use crate::record::{Outcome, TestFailure, TestRecord};

fn scan_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<testsuite\b(?P<suite>[^>]*?)/?>|<testcase\b(?P<case>[^>]*?)(?P<empty>/)?>"#,
        )
        .expect("scan pattern is valid")
    })
}

/// First case close tag or case open tag.
fn case_boundary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"</testcase\s*>|<testcase\b").expect("boundary pattern is valid")
    })
}

/// Body of a non-empty test case starting at `rest`, or `None` when another
/// case opens (or the input ends) before this one closes.
fn case_body(rest: &str) -> Option<&str> {
    let boundary = case_boundary_re().find(rest)?;
    boundary
        .as_str()
        .starts_with("</")
        .then(|| &rest[..boundary.start()])
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("attribute pattern is valid")
    })
}

fn failure_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<(?:failure|error)\b([^>]*?)(?:/>|>(.*?)</(?:failure|error)\s*>)"#)
            .expect("failure pattern is valid")
    })
}

fn skipped_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<skipped\b([^>]*?)(?:/>|>(.*?)</skipped\s*>)"#)
            .expect("skipped pattern is valid")
    })
}

fn entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"&(lt|gt|amp|quot|apos|#39|#x27|#10|#13|#9);").expect("entity pattern is valid")
    })
}

fn cdata_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").expect("cdata pattern is valid"))
}

/// Decode the fixed set of XML entities in a single pass.
///
/// Single-pass decoding keeps `&amp;lt;` as the literal text `&lt;`.
pub fn decode_entities(raw: &str) -> String {
    entity_re()
        .replace_all(raw, |caps: &Captures<'_>| {
            match &caps[1] {
                "lt" => "<",
                "gt" => ">",
                "amp" => "&",
                "quot" => "\"",
                "apos" | "#39" | "#x27" => "'",
                "#10" => "\n",
                "#13" => "\r",
                "#9" => "\t",
                _ => "",
            }
            .to_string()
        })
        .into_owned()
}

/// Human-readable text of element content: CDATA sections are unwrapped
/// verbatim, everything else is entity-decoded.
pub fn decode_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    for caps in cdata_re().captures_iter(raw) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        out.push_str(&decode_entities(&raw[last..whole.start]));
        out.push_str(caps.get(1).map(|m| m.as_str()).unwrap_or_default());
        last = whole.end;
    }
    out.push_str(&decode_entities(&raw[last..]));
    out.trim().to_string()
}

fn parse_attrs(raw: &str) -> HashMap<String, String> {
    attr_re()
        .captures_iter(raw)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            (caps[1].to_string(), decode_entities(value))
        })
        .collect()
}

/// Fractional seconds to whole milliseconds; 0 for anything unusable.
pub fn parse_duration_ms(raw: Option<&str>) -> u64 {
    raw.map(str::trim)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| (secs * 1000.0).round() as u64)
        .unwrap_or(0)
}

fn outcome_from_body(body: &str) -> Outcome {
    if let Some(caps) = failure_re().captures(body) {
        let attrs = parse_attrs(caps.get(1).map(|m| m.as_str()).unwrap_or_default());
        let trace = caps.get(2).map(|m| decode_text(m.as_str())).unwrap_or_default();
        let message = attrs
            .get("message")
            .filter(|m| !m.trim().is_empty())
            .map(|m| m.trim().to_string())
            .unwrap_or_else(|| trace.lines().next().unwrap_or_default().to_string());
        return Outcome::Failed(TestFailure { message, trace });
    }
    if let Some(caps) = skipped_re().captures(body) {
        let attrs = parse_attrs(caps.get(1).map(|m| m.as_str()).unwrap_or_default());
        let reason = attrs
            .get("message")
            .filter(|m| !m.trim().is_empty())
            .map(|m| m.trim().to_string())
            .or_else(|| caps.get(2).map(|m| decode_text(m.as_str())))
            .unwrap_or_default();
        return Outcome::Skipped { reason };
    }
    Outcome::Passed
}

/// Extract records from raw runner output held in memory.
///
/// Never fails: anything that does not match is ignored.
pub fn parse_str(raw: &str) -> Vec<TestRecord> {
    let mut records = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut suite_name = String::new();
    let mut suite_file: Option<String> = None;
    let mut index = 0usize;

    for caps in scan_re().captures_iter(raw) {
        if let Some(suite) = caps.name("suite") {
            let attrs = parse_attrs(suite.as_str());
            suite_name = attrs.get("name").cloned().unwrap_or_default();
            suite_file = attrs.get("file").cloned();
            continue;
        }
        let Some(case) = caps.name("case") else {
            continue;
        };
        let body = if caps.name("empty").is_some() {
            ""
        } else {
            let open_end = caps.get(0).map(|m| m.end()).unwrap_or(raw.len());
            match case_body(&raw[open_end..]) {
                Some(body) => body,
                None => {
                    debug!(attrs = %case.as_str().trim(), "dropping unclosed test case");
                    continue;
                }
            }
        };
        index += 1;
        let attrs = parse_attrs(case.as_str());
        let suite = attrs
            .get("classname")
            .filter(|c| !c.is_empty())
            .cloned()
            .unwrap_or_else(|| suite_name.clone());
        let name = attrs.get("name").filter(|n| !n.is_empty()).cloned();

        let leaf = name.clone().unwrap_or_else(|| format!("#{index}"));
        let base_id = if suite.is_empty() {
            leaf
        } else {
            format!("{suite}::{leaf}")
        };
        let mut id = base_id.clone();
        let mut n = 2;
        while !seen.insert(id.clone()) {
            id = format!("{base_id}#{n}");
            n += 1;
        }

        let title = name.unwrap_or_else(|| format!("test #{index}"));
        let file = attrs.get("file").cloned().or_else(|| suite_file.clone());
        let duration_ms = parse_duration_ms(attrs.get("time").map(String::as_str));

        records.push(TestRecord::new(
            id,
            title,
            file,
            duration_ms,
            outcome_from_body(body),
        ));
    }

    debug!(count = records.len(), "extracted test records");
    records
}

/// Extract records from a raw output file.
///
/// Fails only when the file is missing or holds no test markup at all; the
/// caller degrades that to an empty bundle.
pub fn parse_file(path: &Path) -> HarnessResult<Vec<TestRecord>> {
    let raw = std::fs::read_to_string(path).map_err(|e| HarnessError::Extraction {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    if !raw.contains("<testsuite") && !raw.contains("<testcase") {
        return Err(HarnessError::Extraction {
            path: path.display().to_string(),
            reason: "no test suite markup found".to_string(),
        });
    }
    Ok(parse_str(&raw))
}

/// Attach catalog requirements to records and force every gated test to
/// skipped.
///
/// A gated test the runner reported anyway is rewritten as skipped with the
/// gate's reason; one it never reported is synthesised.
pub fn annotate_records(
    records: Vec<TestRecord>,
    catalog: &[CatalogEntry],
    plan: &GatePlan,
) -> Vec<TestRecord> {
    let by_id: BTreeMap<&str, &CatalogEntry> =
        catalog.iter().map(|e| (e.id.as_str(), e)).collect();
    let gated_by_id: BTreeMap<&str, &GatedTest> =
        plan.gated.iter().map(|g| (g.id.as_str(), g)).collect();
    let reported: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();

    let mut out: Vec<TestRecord> = records
        .into_iter()
        .map(|record| {
            if let Some(gated) = gated_by_id.get(record.id.as_str()) {
                warn!(
                    test = %gated.id,
                    reported = ?record.status,
                    "gated test was reported by the runner; recording it as skipped"
                );
                return TestRecord::new(
                    record.id,
                    record.title,
                    record.file,
                    0,
                    Outcome::Skipped {
                        reason: gated.skip_reason(),
                    },
                )
                .with_requirement(gated.requires.clone());
            }
            match by_id.get(record.id.as_str()) {
                Some(entry) => record.with_requirement(entry.requires.clone()),
                None => record,
            }
        })
        .collect();

    for gated in &plan.gated {
        if reported.contains(&gated.id) {
            continue;
        }
        let title = gated
            .id
            .rsplit("::")
            .next()
            .unwrap_or(gated.id.as_str())
            .to_string();
        out.push(
            TestRecord::new(
                gated.id.clone(),
                title,
                None,
                0,
                Outcome::Skipped {
                    reason: gated.skip_reason(),
                },
            )
            .with_requirement(gated.requires.clone()),
        );
    }
    out
}
