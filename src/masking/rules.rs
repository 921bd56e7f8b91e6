//! Detection rules and masking transforms
//!
//! Every transform is deterministic under the session's random key, so the
//! same original always masks to the same value within one session while two
//! sessions disagree. Invertibility comes solely from the session map, never
//! from the transform itself.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Named masking strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskKind {
    Hostname,
    IpAddress,
    Phone,
    ChineseName,
    Email,
}

impl MaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            MaskKind::Hostname => "hostname",
            MaskKind::IpAddress => "ip_address",
            MaskKind::Phone => "phone",
            MaskKind::ChineseName => "chinese_name",
            MaskKind::Email => "email",
        }
    }
}

/// Dotted hostnames: label(.label)+ ending in an alphabetic TLD-ish label
static HOSTNAME_DOTTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,24}\b").unwrap()
});

/// Bare hostnames with a numeric suffix, e.g. web-prod-01
static HOSTNAME_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z][A-Za-z0-9]*(?:-[A-Za-z0-9]+)*-\d{1,4}\b").unwrap());

/// IPv4 addresses
static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b")
        .unwrap()
});

/// Mobile phone numbers, optionally prefixed with +86
static PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:\+86[- ]?)?\b1[3-9]\d{9}\b").unwrap());

/// Email addresses. `*` is allowed in the local part so an already-masked
/// address is re-detected as one token and skipped, instead of its tail
/// being matched as a fresh address.
static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9._%+*-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,24}\b").unwrap());

/// Common Chinese surnames, double surnames first so the longest match wins
static SURNAMES: &[&str] = &[
    "欧阳", "司马", "上官", "诸葛", "东方", "皇甫", "尉迟", "公孙", "令狐", "慕容",
    "王", "李", "张", "刘", "陈", "杨", "黄", "赵", "吴", "周",
    "徐", "孙", "马", "朱", "胡", "郭", "何", "林", "高", "罗",
    "郑", "梁", "谢", "宋", "唐", "许", "韩", "冯", "邓", "曹",
    "彭", "曾", "肖", "田", "董", "袁", "潘", "于", "蒋", "蔡",
    "余", "杜", "叶", "程", "苏", "魏", "吕", "丁", "任", "沈",
    "姚", "卢", "姜", "崔", "钟", "谭", "陆", "汪", "范", "金",
    "石", "廖", "贾", "夏", "韦", "付", "方", "白", "邹", "孟",
    "熊", "秦", "邱", "江", "尹", "薛", "闫", "段", "雷", "侯",
    "龙", "史", "陶", "黎", "贺", "顾", "毛", "郝", "龚", "邵",
];

/// A detected sensitive token inside a piece of text
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub start: usize,
    pub end: usize,
    pub kind: MaskKind,
}

impl Detection {
    fn overlaps(&self, other: &Detection) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Detect all sensitive tokens in `text`.
///
/// The dictionary-based name detector runs first (longest surname first,
/// non-overlapping), then the regex rules in order: hostname, IP, phone,
/// email. Earlier detections win overlaps, except that hostname candidates
/// inside an email are skipped — the email rule owns the whole address and
/// keeps its domain intact.
pub fn detect(text: &str) -> Vec<Detection> {
    let mut detections: Vec<Detection> = Vec::new();

    detect_names(text, &mut detections);

    // Email spans guard the hostname and IP rules against eating the
    // domain (or a dotted local part) out of an address.
    let email_spans: Vec<(usize, usize)> = EMAIL.find_iter(text).map(|m| (m.start(), m.end())).collect();
    let in_email =
        |d: &Detection| email_spans.iter().any(|(start, end)| d.start < *end && *start < d.end);

    for (regex, kind) in [
        (&*HOSTNAME_DOTTED, MaskKind::Hostname),
        (&*HOSTNAME_BARE, MaskKind::Hostname),
        (&*IPV4, MaskKind::IpAddress),
        (&*PHONE, MaskKind::Phone),
        (&*EMAIL, MaskKind::Email),
    ] {
        for m in regex.find_iter(text) {
            let candidate = Detection {
                start: m.start(),
                end: m.end(),
                kind,
            };
            if kind != MaskKind::Email && in_email(&candidate) {
                continue;
            }
            if detections.iter().any(|d| d.overlaps(&candidate)) {
                continue;
            }
            detections.push(candidate);
        }
    }

    detections.sort_by_key(|d| d.start);
    detections
}

/// Dictionary scan: a surname followed by one or two CJK characters
fn detect_names(text: &str, detections: &mut Vec<Detection>) {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut i = 0;

    while i < chars.len() {
        let mut matched = None;

        for surname in SURNAMES {
            let surname_chars: Vec<char> = surname.chars().collect();
            if i + surname_chars.len() > chars.len() {
                continue;
            }
            if (0..surname_chars.len()).any(|k| chars[i + k].1 != surname_chars[k]) {
                continue;
            }

            // Given name: one or two following CJK characters.
            let mut given = 0;
            while given < 2 {
                let idx = i + surname_chars.len() + given;
                if idx < chars.len() && is_cjk(chars[idx].1) {
                    given += 1;
                } else {
                    break;
                }
            }
            if given == 0 {
                continue;
            }

            let end_index = i + surname_chars.len() + given;
            let start = chars[i].0;
            let end = if end_index < chars.len() {
                chars[end_index].0
            } else {
                text.len()
            };
            matched = Some((end_index, Detection { start, end, kind: MaskKind::ChineseName }));
            break;
        }

        match matched {
            Some((next_index, detection)) => {
                detections.push(detection);
                i = next_index;
            }
            None => i += 1,
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}')
}

/// Keyed hash of `input`, rendered as `hex_chars` hex characters.
/// `salt` disambiguates re-derivations after a (practically impossible)
/// collision.
pub fn keyed_hash(key: &[u8], input: &str, salt: u32, hex_chars: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(salt.to_be_bytes());
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..hex_chars].to_string()
}

/// Produce the masked form of `original` for the given rule.
pub fn transform(kind: MaskKind, original: &str, key: &[u8], salt: u32) -> String {
    match kind {
        MaskKind::Hostname => mask_hostname(original, key, salt),
        MaskKind::IpAddress => mask_ip(original, key, salt),
        MaskKind::Phone => mask_phone(original, key, salt),
        MaskKind::ChineseName => mask_chinese_name(original, key, salt),
        MaskKind::Email => mask_email(original, key, salt),
    }
}

/// `host-{8-hex-hash}` with `--{suffix}` when the original ends in digits
fn mask_hostname(original: &str, key: &[u8], salt: u32) -> String {
    static TRAILING_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)$").unwrap());

    let hash = keyed_hash(key, original, salt, 8);
    match TRAILING_DIGITS.captures(original).and_then(|c| c.get(1)) {
        Some(suffix) => format!("host-{}--{}", hash, suffix.as_str()),
        None => format!("host-{}", hash),
    }
}

/// Synthetic `10.0.{4-hex-hash}.{last octet}` address; the preserved last
/// octet keeps relative identity within a subnet inferable without the real
/// network
fn mask_ip(original: &str, key: &[u8], salt: u32) -> String {
    let last_octet = original.rsplit('.').next().unwrap_or("0");
    let mut hash = keyed_hash(key, original, salt, 4);
    // An all-letter label would re-detect as a dotted hostname on a second
    // masking pass; pin the first character to a digit to keep the synthetic
    // address inert.
    if !hash.bytes().any(|b| b.is_ascii_digit()) {
        hash.replace_range(0..1, "0");
    }
    format!("10.0.{}.{}", hash, last_octet)
}

/// First 3 and last 4 digits kept, middle masked, short ciphertext fragment
/// appended for uniqueness
fn mask_phone(original: &str, key: &[u8], salt: u32) -> String {
    let digits: String = original.chars().filter(|c| c.is_ascii_digit()).collect();
    let fragment = keyed_hash(key, original, salt, 4);

    if digits.len() < 8 {
        return format!("***#{}", fragment);
    }

    format!(
        "{}****{}#{}",
        &digits[..3],
        &digits[digits.len() - 4..],
        fragment
    )
}

/// Surname kept, every remaining character replaced with `x`.
///
/// The template alone cannot distinguish two names sharing a surname and
/// length; a salted re-derivation appends a short keyed fragment to keep
/// pseudonyms unique within the session.
fn mask_chinese_name(original: &str, key: &[u8], salt: u32) -> String {
    let mut chars = original.chars();
    let surname = match chars.next() {
        Some(c) => c,
        None => return String::new(),
    };

    // Double surnames keep both characters.
    let double: String = original.chars().take(2).collect();
    let (kept, remaining) = if SURNAMES.contains(&double.as_str()) {
        (double, original.chars().skip(2).count())
    } else {
        (surname.to_string(), original.chars().skip(1).count())
    };

    let base = format!("{}{}", kept, "x".repeat(remaining));
    if salt == 0 {
        base
    } else {
        format!("{}{}", base, keyed_hash(key, original, salt, 2))
    }
}

/// Local part masked keeping first/last 2 characters, domain unchanged.
/// Salted re-derivations disambiguate via plus-addressing in the local part.
fn mask_email(original: &str, key: &[u8], salt: u32) -> String {
    let (local, domain) = match original.split_once('@') {
        Some(parts) => parts,
        None => return original.to_string(),
    };

    let chars: Vec<char> = local.chars().collect();
    let masked_local = if chars.len() > 4 {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{}***{}", head, tail)
    } else {
        // Short local parts keep the first character only.
        format!("{}***", chars.first().map(|c| c.to_string()).unwrap_or_default())
    };

    if salt == 0 {
        format!("{}@{}", masked_local, domain)
    } else {
        format!("{}+{}@{}", masked_local, keyed_hash(key, original, salt, 2), domain)
    }
}
