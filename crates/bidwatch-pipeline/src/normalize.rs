//! Deterministic text-to-structure conversion. Every function here is pure
//! and total: unparsable input degrades to `None` or an empty field, it
//! never fails the record.

use std::sync::LazyLock;

use bidwatch_core::{NormalizedRecord, RawFragment, RecordStatus};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*(亿|万|千|百|元)").unwrap()
});

static DATETIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})\s+(\d{1,2}):(\d{2})(?::(\d{2}))?").unwrap()
});

static DATE_SEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})").unwrap());

static DATE_CN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})年(\d{1,2})月(\d{1,2})日").unwrap());

static DATE_COMPACT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})(\d{2})(\d{2})").unwrap());

static MOBILE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"1[3-9]\d{9}").unwrap());

static LANDLINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0\d{2,3}-?\d{7,8}").unwrap());

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()
});

static PROJECT_NO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"项目编号[：:]\s*([A-Za-z0-9\-_]+)").unwrap());

static CONTACT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"联\s*系\s*人[：:]\s*([^\s，,。；;：:]{1,8})").unwrap());

static HSPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\u{3000}]+").unwrap());

/// Parse a free-form amount string into the canonical unit (万元).
///
/// Thousands separators are stripped first; the first numeric literal with a
/// recognizable unit token wins. No unit token means the string is not an
/// amount.
pub fn parse_amount(text: &str) -> Option<f64> {
    let stripped = text.replace([',', '，'], "");
    let caps = AMOUNT_RE.captures(&stripped)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let scale = match caps.get(2)?.as_str() {
        "亿" => 10_000.0,
        "万" => 1.0,
        "千" => 0.1,
        "百" => 0.01,
        "元" => 0.000_1,
        _ => return None,
    };
    Some(value * scale)
}

fn build_date(y: i64, m: i64, d: i64) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32)
}

fn captured_int(caps: &regex::Captures<'_>, idx: usize) -> Option<i64> {
    caps.get(idx)?.as_str().parse().ok()
}

/// Parse a free-form date string. Patterns are tried in a fixed order and
/// the first one that yields a real calendar date wins.
pub fn parse_date(text: &str) -> Option<NaiveDateTime> {
    if let Some(caps) = DATETIME_RE.captures(text) {
        let date = build_date(
            captured_int(&caps, 1)?,
            captured_int(&caps, 2)?,
            captured_int(&caps, 3)?,
        );
        if let Some(date) = date {
            let hour = captured_int(&caps, 4)? as u32;
            let min = captured_int(&caps, 5)? as u32;
            let sec = caps
                .get(6)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            if let Some(dt) = date.and_hms_opt(hour, min, sec) {
                return Some(dt);
            }
        }
    }
    for re in [&*DATE_SEP_RE, &*DATE_CN_RE, &*DATE_COMPACT_RE] {
        if let Some(caps) = re.captures(text) {
            let date = build_date(
                captured_int(&caps, 1)?,
                captured_int(&caps, 2)?,
                captured_int(&caps, 3)?,
            );
            if let Some(dt) = date.and_then(|d| d.and_hms_opt(0, 0, 0)) {
                return Some(dt);
            }
        }
    }
    None
}

const MUNICIPALITIES: &[&str] = &["北京", "上海", "天津", "重庆"];

const AUTONOMOUS_REGIONS: &[(&str, &str)] = &[
    ("内蒙古", "内蒙古自治区"),
    ("广西", "广西壮族自治区"),
    ("西藏", "西藏自治区"),
    ("宁夏", "宁夏回族自治区"),
    ("新疆", "新疆维吾尔自治区"),
];

const PROVINCES: &[&str] = &[
    "河北", "山西", "辽宁", "吉林", "黑龙江", "江苏", "浙江", "安徽", "福建", "江西", "山东",
    "河南", "湖北", "湖南", "广东", "海南", "四川", "贵州", "云南", "陕西", "甘肃", "青海",
    "台湾",
];

/// Canonical suffixed form of an abbreviated province name. Unknown names
/// pass through unchanged.
pub fn canonical_province(name: &str) -> String {
    let name = name.trim();
    if MUNICIPALITIES.contains(&name) {
        return format!("{name}市");
    }
    if let Some((_, full)) = AUTONOMOUS_REGIONS.iter().find(|(abbr, _)| *abbr == name) {
        return (*full).to_string();
    }
    if PROVINCES.contains(&name) {
        return format!("{name}省");
    }
    name.to_string()
}

/// Split a scraped region string into (province, city), both canonicalized.
pub fn normalize_region(text: &str) -> (Option<String>, Option<String>) {
    let mut parts = text.split_whitespace();
    let province = parts.next().map(canonical_province);
    let city = parts.next().map(|c| {
        if c.ends_with('市') || c.ends_with('区') || c.ends_with('县') || c.ends_with('州') {
            c.to_string()
        } else {
            format!("{c}市")
        }
    });
    (province, city)
}

/// Best-effort phone extraction, mobile pattern first.
pub fn extract_phone(text: &str) -> Option<String> {
    MOBILE_RE
        .find(text)
        .or_else(|| LANDLINE_RE.find(text))
        .map(|m| m.as_str().to_string())
}

pub fn extract_email(text: &str) -> Option<String> {
    EMAIL_RE.find(text).map(|m| m.as_str().to_string())
}

/// Collapse horizontal whitespace runs to one space, blank-line runs to one
/// blank line, normalize line endings, and trim both ends.
pub fn clean_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0usize;
    for line in unified.lines() {
        let line = HSPACE_RE.replace_all(line.trim(), " ").into_owned();
        if line.is_empty() {
            blank_run += 1;
            if blank_run == 1 {
                lines.push(line);
            }
        } else {
            blank_run = 0;
            lines.push(line);
        }
    }
    while lines.first().map_or(false, |l| l.is_empty()) {
        lines.remove(0);
    }
    while lines.last().map_or(false, |l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Convert one raw fragment into the canonical record. Total: every
/// unparsable field degrades instead of dropping the record.
pub fn normalize_fragment(fragment: &RawFragment) -> NormalizedRecord {
    let content = clean_text(&fragment.body);

    // Listings often omit the budget column; fall back to the budget line
    // inside the announcement body.
    let budget = fragment
        .amount_text
        .as_deref()
        .and_then(parse_amount)
        .or_else(|| {
            content
                .find("预算金额")
                .and_then(|idx| parse_amount(&content[idx..]))
        });

    let (province, city) = fragment
        .region_text
        .as_deref()
        .map(normalize_region)
        .unwrap_or((None, None));

    NormalizedRecord {
        id: Uuid::new_v4(),
        title: clean_text(&fragment.title),
        project_number: PROJECT_NO_RE
            .captures(&content)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string()),
        platform: fragment.platform.clone(),
        url: fragment.url.clone(),
        category: None,
        budget,
        province,
        city,
        published_at: fragment.date_text.as_deref().and_then(parse_date),
        deadline_at: fragment.deadline_text.as_deref().and_then(parse_date),
        contact_name: CONTACT_NAME_RE
            .captures(&content)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string()),
        contact_phone: extract_phone(&content),
        contact_email: extract_email(&content),
        content_hash: content_hash(&content),
        content,
        status: RecordStatus::Published,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn amount_scaling_lands_in_wan_yuan() {
        assert_eq!(parse_amount("100万元"), Some(100.0));
        assert_eq!(parse_amount("预算金额：1.2亿元"), Some(12_000.0));
        assert_eq!(parse_amount("5千元"), Some(0.5));
        assert_eq!(parse_amount("3百元"), Some(0.03));
        assert_eq!(parse_amount("50000元"), Some(5.0));
    }

    #[test]
    fn amount_strips_thousands_separators() {
        assert_eq!(parse_amount("1,250万元"), Some(1250.0));
        assert_eq!(parse_amount("1，250，000元"), Some(125.0));
    }

    #[test]
    fn unresolvable_amount_is_none() {
        assert_eq!(parse_amount("面议"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("100"), None);
    }

    #[test]
    fn date_patterns_tried_in_order() {
        let dt = parse_date("2026-03-01 14:30:05").unwrap();
        assert_eq!(dt.to_string(), "2026-03-01 14:30:05");

        let d = parse_date("发布于 2026/3/1").unwrap();
        assert_eq!(d.date().to_string(), "2026-03-01");

        // ccgp listing dates come dotted.
        let dt = parse_date("2026.03.01 09:00:00").unwrap();
        assert_eq!(dt.to_string(), "2026-03-01 09:00:00");

        let d = parse_date("2026年3月1日").unwrap();
        assert_eq!(d.date().to_string(), "2026-03-01");

        let d = parse_date("20260301").unwrap();
        assert_eq!(d.date().to_string(), "2026-03-01");

        assert!(parse_date("三月初一").is_none());
    }

    #[test]
    fn impossible_calendar_dates_are_rejected() {
        assert!(parse_date("2026-13-40").is_none());
    }

    #[test]
    fn region_lookup_suffixes() {
        assert_eq!(canonical_province("北京"), "北京市");
        assert_eq!(canonical_province("浙江"), "浙江省");
        assert_eq!(canonical_province("广西"), "广西壮族自治区");
        assert_eq!(canonical_province("卡通国"), "卡通国");

        let (province, city) = normalize_region("浙江 杭州");
        assert_eq!(province.as_deref(), Some("浙江省"));
        assert_eq!(city.as_deref(), Some("杭州市"));

        let (province, city) = normalize_region("广东");
        assert_eq!(province.as_deref(), Some("广东省"));
        assert!(city.is_none());
    }

    #[test]
    fn mobile_wins_over_landline() {
        let text = "联系电话：010-88887777，手机13912345678";
        assert_eq!(extract_phone(text).as_deref(), Some("13912345678"));
        assert_eq!(
            extract_phone("电话：0571-12345678").as_deref(),
            Some("0571-12345678")
        );
        assert!(extract_phone("无").is_none());
    }

    #[test]
    fn email_extraction() {
        assert_eq!(
            extract_email("邮箱: zhaobiao@example.gov.cn。").as_deref(),
            Some("zhaobiao@example.gov.cn")
        );
        assert!(extract_email("没有邮箱").is_none());
    }

    #[test]
    fn clean_text_collapses_whitespace_and_blank_lines() {
        let raw = "  第一行\t\t内容  \r\n\r\n\r\n  第二行\r\n";
        assert_eq!(clean_text(raw), "第一行 内容\n\n第二行");
    }

    fn fragment(body: &str) -> RawFragment {
        RawFragment {
            title: "某机房建设项目".into(),
            amount_text: None,
            date_text: Some("2026-03-01".into()),
            deadline_text: None,
            region_text: Some("湖北 武汉".into()),
            body: body.into(),
            url: "http://example.cn/1".into(),
            platform: "ccgp".into(),
            spider: "ccgp".into(),
            scraped_at: Utc::now(),
        }
    }

    #[test]
    fn normalize_fragment_never_fails() {
        let record = normalize_fragment(&fragment(""));
        assert!(record.budget.is_none());
        assert!(record.contact_phone.is_none());
        assert_eq!(record.content, "");
        assert_eq!(record.province.as_deref(), Some("湖北省"));

        let record = normalize_fragment(&fragment(
            "项目编号：ZB-2026-001\n预算金额：100万元\n联系人：王工，电话13912345678",
        ));
        assert_eq!(record.project_number.as_deref(), Some("ZB-2026-001"));
        assert_eq!(record.contact_name.as_deref(), Some("王工"));
        assert_eq!(record.budget, Some(100.0));
        assert_eq!(record.contact_phone.as_deref(), Some("13912345678"));
        assert_eq!(record.published_at.unwrap().date().to_string(), "2026-03-01");
    }

    #[test]
    fn hash_tracks_cleaned_content() {
        let a = normalize_fragment(&fragment("正文  内容"));
        let b = normalize_fragment(&fragment("正文 内容"));
        assert_eq!(a.content_hash, b.content_hash);
        let c = normalize_fragment(&fragment("别的内容"));
        assert_ne!(a.content_hash, c.content_hash);
    }
}
